// muxtun_common is the main muxtun library implementing the tunnel protocol.
// Copyright (C) 2026  The muxtun authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The server side: accepts tunnels, authenticates them and mirrors each
//! link as a fresh connection to the configured backend.

use crate::auth::Authenticator;
use crate::client::is_transient;
use crate::config::TunnelConfig;
use crate::hub::Hub;
use crate::link::Link;
use crate::message::{Ctrl, CtrlCode};
use crate::pool;
use crate::report::{self, Counter, Status};
use crate::tunnel::{self, Tunnel};
use crate::TunnelError;

use std::fmt;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, warn};

/// Keep-alive period for accepted tunnel sockets.
const ACCEPT_KEEPALIVE: Duration = Duration::from_secs(60);

/// Connect timeout for dialing the backend per link.
const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// A hub whose links each mirror one backend connection.
pub struct ServerHub {
    hub: Hub,
    backend: String,
    config: Arc<TunnelConfig>,
}

impl ServerHub {
    fn new(tunnel: Arc<Tunnel>, backend: String, config: Arc<TunnelConfig>) -> Arc<Self> {
        Arc::new(Self {
            hub: Hub::new(tunnel),
            backend,
            config,
        })
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Runs the hub loop with the server control filter.
    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        self.hub.run(move |cmd| me.on_ctrl(cmd));
    }

    /// Server-specific control handling: link creation and heartbeat echo.
    fn on_ctrl(self: &Arc<Self>, cmd: Ctrl) -> bool {
        match cmd.code() {
            Some(CtrlCode::LinkCreate) => {
                let id = cmd.link_id;
                match self.hub.create_link(id) {
                    Some(link) => {
                        let me = Arc::clone(self);
                        thread::spawn(move || {
                            report::count(Counter::Thread, true);
                            me.handle_server_link(link);
                            report::count(Counter::Thread, false);
                        });
                    }
                    None => {
                        self.hub.send_cmd(id, CtrlCode::LinkClose);
                    }
                }
                true
            }
            Some(CtrlCode::Heartbeat) => {
                self.hub.send_cmd(0, CtrlCode::Heartbeat);
                true
            }
            _ => false,
        }
    }

    /// Dials the backend for a freshly created link and pumps it. A failed
    /// dial tells the peer to drop the link.
    fn handle_server_link(&self, link: Arc<Link>) {
        match tunnel::dial(&self.backend, BACKEND_DIAL_TIMEOUT) {
            Ok(conn) => {
                self.hub
                    .run_link(&link, conn, self.config.link_read_timeout());
            }
            Err(e) => {
                error!("link({}) connect to backend failed: {}", link.id, e);
                link.close_all();
                self.hub.send_cmd(link.id, CtrlCode::LinkClose);
            }
        }

        self.hub.delete_link(link.id);
    }
}

/// The tunnel server: accept loop, handshake and hub registry.
pub struct Server {
    listener: TcpListener,
    backend: String,
    config: Arc<TunnelConfig>,
    hubs: Mutex<Vec<Arc<ServerHub>>>,
}

impl Server {
    pub fn new(listen: &str, backend: String, config: Arc<TunnelConfig>) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(listen)?,
            backend,
            config,
            hubs: Mutex::new(Vec::new()),
        })
    }

    /// The address the tunnel listener is bound to.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves tunnel connections forever. Transient accept failures are
    /// logged and skipped; hard failures end the loop.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        loop {
            let (conn, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    warn!("server: accept failed temporary: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            warn!("server: new connection from {}", peer);
            let _ = tunnel::set_keepalive(&conn, ACCEPT_KEEPALIVE);

            let server = Arc::clone(self);
            thread::spawn(move || {
                report::count(Counter::Thread, true);
                server.handle_conn(conn);
                report::count(Counter::Thread, false);
            });
        }
    }

    fn handle_conn(self: &Arc<Self>, conn: TcpStream) {
        let tunnel = match Tunnel::new(conn, &self.config) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                error!("server: tunnel setup failed: {}", e);
                return;
            }
        };

        let auth = match self.handshake(&tunnel) {
            Ok(auth) => auth,
            Err(e) => {
                // No response on failure; just drop the connection.
                error!("{} handshake failed: {}", tunnel, e);
                tunnel.close();
                return;
            }
        };

        tunnel.set_id(auth.token.to_id());
        let hub = ServerHub::new(
            tunnel,
            self.backend.clone(),
            Arc::clone(&self.config),
        );
        warn!("server: {}, handshake succeed", hub.hub.tunnel());

        self.hubs.lock().unwrap().push(Arc::clone(&hub));
        hub.start();
        self.hubs
            .lock()
            .unwrap()
            .retain(|registered| !Arc::ptr_eq(registered, &hub));
    }

    /// Server side of the handshake: consume HelloA unchecked, issue the
    /// sealed random token, verify the complemented reply, install keys.
    fn handshake(&self, tunnel: &Arc<Tunnel>) -> Result<Authenticator, TunnelError> {
        let (_, hello_a) = tunnel.read_packet()?;
        pool::recycle(hello_a);

        let mut auth = Authenticator::new(&self.config.secret);
        auth.gen_random_token();

        let mut hello_b = pool::take();
        hello_b.extend_from_slice(&auth.gen_cipher_block(None));
        tunnel.write_packet(0, hello_b, true)?;

        let (_, hello_c) = tunnel.read_packet()?;
        let verdict = auth.verify_cipher_block(&hello_c);
        pool::recycle(hello_c);
        verdict?;

        tunnel.set_keys(&auth.token, &self.config, false)?;
        Ok(auth)
    }
}

impl Status for Server {
    fn status(&self, w: &mut dyn fmt::Write) {
        let hubs = self.hubs.lock().unwrap();
        for hub in hubs.iter() {
            hub.hub.status(w);
        }
    }
}
