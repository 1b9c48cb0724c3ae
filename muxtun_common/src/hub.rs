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

//! The multiplexer owning a tunnel and its link table.
//!
//! One hub runs one read loop per tunnel and fans packets out to links.
//! Role-specific control handling (heartbeat replies, link creation) is a
//! filter closure handed to [`Hub::run`]; everything the filter declines
//! falls through to the shared close-command dispatch.

use crate::link::Link;
use crate::message::{Ctrl, CtrlCode, CTRL_SIZE};
use crate::pool;
use crate::report::{self, Counter};
use crate::tunnel::{self, Tunnel};

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::io::Write as _;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

/// Keep-alive period for the user-facing sockets of links.
const LINK_KEEPALIVE: Duration = Duration::from_secs(30);

pub struct Hub {
    tunnel: Arc<Tunnel>,
    links: RwLock<HashMap<u16, Arc<Link>>>,
    closed: Mutex<bool>,
}

impl Hub {
    pub fn new(tunnel: Arc<Tunnel>) -> Self {
        report::count(Counter::Hub, true);
        Self {
            tunnel,
            links: RwLock::new(HashMap::new()),
            closed: Mutex::new(false),
        }
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    /// Sends a control command on link id 0. Returns whether the write
    /// succeeded; a failing tunnel is already tearing down.
    pub fn send_cmd(&self, link_id: u16, code: CtrlCode) -> bool {
        let mut buf = pool::take();
        buf.extend_from_slice(&Ctrl::new(code, link_id).to_bytes());

        debug!(
            "tun({:5}) link({}) send cmd:{:?}",
            self.tunnel.id(),
            link_id,
            code
        );
        self.send(0, buf, false)
    }

    /// Frames `data` onto the tunnel for `link_id`.
    pub fn send(&self, link_id: u16, data: Vec<u8>, force_flush: bool) -> bool {
        if let Err(e) = self.tunnel.write_packet(link_id, data, force_flush) {
            warn!("link({}) write to {} failed: {}", link_id, self.tunnel, e);
            return false;
        }
        true
    }

    /// The hub read loop. Dispatches packets until the tunnel fails, then
    /// resets every link. `filter` sees each control command first and
    /// returns `true` to consume it.
    pub fn run(&self, filter: impl Fn(Ctrl) -> bool) {
        warn!("{} start", self.tunnel);

        loop {
            let (link_id, data) = match self.tunnel.read_packet() {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("{} read failed: {}", self.tunnel, e);
                    break;
                }
            };

            if link_id == 0 {
                // Trailing control-body bytes are tolerated, missing ones
                // are not.
                let ctrl = Ctrl::from_bytes(data.get(..CTRL_SIZE).unwrap_or(&data));
                pool::recycle(data);

                match ctrl {
                    Ok(cmd) => {
                        debug!("tun({:5}) link({}) recv cmd:{}", self.tunnel.id(), cmd.link_id, cmd.code);
                        self.on_ctrl(cmd, &filter);
                    }
                    Err(e) => {
                        error!("tun({:5}) ctrl parse failed: {}, break dispatch", self.tunnel.id(), e);
                        break;
                    }
                }
            } else {
                debug!("tun({:5}) link({}) recv {} bytes data", self.tunnel.id(), link_id, data.len());
                self.on_data(link_id, data);
            }
        }

        // Tunnel disconnect resets every multiplexed stream.
        warn!("{} reset all links", self.tunnel);
        self.close_all_links();
        self.close();
    }

    fn on_ctrl(&self, cmd: Ctrl, filter: &impl Fn(Ctrl) -> bool) {
        if filter(cmd) {
            return;
        }

        let id = cmd.link_id;
        let link = match self.get_link(id) {
            Some(link) => link,
            None => {
                // The local link may have gone away before the peer noticed.
                info!("link({}) recv cmd:{}, no link", id, cmd.code);
                return;
            }
        };

        match cmd.code() {
            Some(CtrlCode::LinkClose) => link.close_all(),
            Some(CtrlCode::LinkCloseWriteErr) => link.close_read(),
            Some(CtrlCode::LinkCloseReadErr) => link.close_write(),
            _ => error!("link({}) recv unknown cmd:{:?}", id, cmd),
        }
    }

    fn on_data(&self, id: u16, data: Vec<u8>) {
        match self.get_link(id) {
            // A buffer for a closed link is legal; drop the payload.
            None => {
                pool::recycle(data);
                info!("link({}) no link", id);
            }
            Some(link) => {
                let _ = link.push(data);
            }
        }
    }

    /// Closes the hub and its tunnel. Idempotent.
    pub fn close(&self) {
        let mut closed = self.closed.lock().unwrap();
        if !*closed {
            *closed = true;
            self.tunnel.close();
            report::count(Counter::Hub, false);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    fn close_all_links(&self) {
        let mut links = self.links.write().unwrap();
        for link in links.values() {
            link.close_all();
        }
        links.clear();
    }

    pub fn link_count(&self) -> usize {
        self.links.read().unwrap().len()
    }

    pub fn get_link(&self, id: u16) -> Option<Arc<Link>> {
        self.links.read().unwrap().get(&id).cloned()
    }

    /// Registers a fresh link. `None` if the id is already taken.
    pub fn create_link(&self, id: u16) -> Option<Arc<Link>> {
        info!("link({}) new link", id);
        let mut links = self.links.write().unwrap();
        if links.contains_key(&id) {
            error!("link({}) repeated", id);
            return None;
        }

        let link = Link::new(id);
        links.insert(id, Arc::clone(&link));
        Some(link)
    }

    pub fn delete_link(&self, id: u16) {
        info!("link({}) delete", id);
        self.links.write().unwrap().remove(&id);
    }

    pub fn status(&self, w: &mut dyn fmt::Write) {
        let _ = write!(w, "\n<status> {}, links({})", self.tunnel, self.link_count());
    }

    /// Pumps one link: uplink (user socket to tunnel) on a scoped thread,
    /// downlink (queue to user socket) inline, until both halves finish.
    pub fn run_link(&self, link: &Arc<Link>, conn: TcpStream, read_timeout: Duration) {
        let _ = tunnel::set_keepalive(&conn, LINK_KEEPALIVE);
        let _ = conn.set_read_timeout(Some(read_timeout));

        let down_conn = match conn.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                error!("link({}) clone failed: {}", link.id, e);
                link.close_all();
                return;
            }
        };
        link.set_conn(match conn.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                error!("link({}) clone failed: {}", link.id, e);
                link.close_all();
                return;
            }
        });

        if let Ok(peer) = conn.peer_addr() {
            info!("link({}) start: {}", link.id, peer);
        }

        thread::scope(|s| {
            s.spawn(|| {
                report::count(Counter::Thread, true);
                self.uplink(link, &conn);
                report::count(Counter::Thread, false);
            });

            self.downlink(link, down_conn);
        });

        link.close_all();
        info!("link({}) close", link.id);
    }

    /// Reads the user socket and frames the bytes onto the tunnel. The
    /// failing half picks the close command the peer receives.
    fn uplink(&self, link: &Arc<Link>, conn: &TcpStream) {
        loop {
            match link.read_conn(conn) {
                Ok(data) => {
                    if !self.send(link.id, data, false) {
                        break;
                    }
                }
                Err(crate::LinkError::ReadClosed) => {
                    self.send_cmd(link.id, CtrlCode::LinkCloseReadErr);
                    break;
                }
                Err(_) => {
                    self.send_cmd(link.id, CtrlCode::LinkClose);
                    break;
                }
            }
        }
    }

    /// Drains the outbound queue into the user socket. Queued buffers that
    /// arrived before the write half closed are still delivered; only then
    /// does the write half finish with a FIN.
    fn downlink(&self, link: &Arc<Link>, conn: TcpStream) {
        let rx = match link.take_receiver() {
            Some(rx) => rx,
            None => return,
        };

        let mut writer = &conn;
        let mut write_failed = false;
        while let Ok(data) = rx.recv() {
            if write_failed {
                pool::recycle(data);
                continue;
            }

            let result = writer.write_all(&data);
            pool::recycle(data);

            if result.is_err() {
                write_failed = true;
                self.send_cmd(link.id, CtrlCode::LinkCloseWriteErr);
                link.close_write();
            }
        }

        link.close_write();
        let _ = conn.shutdown(std::net::Shutdown::Write);
        for data in rx.try_iter() {
            pool::recycle(data);
        }
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.close();
    }
}
