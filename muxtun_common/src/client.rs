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

//! The client side: a pool of tunnels and the scheduler spreading user
//! connections over them.
//!
//! Each healthy tunnel sits in a binary min-heap keyed by its live-link
//! count; a new user connection goes to the top. The heap stores back
//! pointers (each hub knows its slot) so removal and reprioritization stay
//! O(log n).

use crate::auth::Authenticator;
use crate::config::TunnelConfig;
use crate::hub::Hub;
use crate::link;
use crate::message::{CtrlCode, HelloA};
use crate::pool;
use crate::report::{self, Counter, Status};
use crate::tunnel::{self, Tunnel};
use crate::TunnelError;

use std::fmt::{self, Write as _};
use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use rand::Rng;

/// Base interval between client heartbeats; each hub adds up to a second of
/// jitter so heartbeats of parallel tunnels spread out.
const HEARTBEAT_SPAN: Duration = Duration::from_secs(5);

/// Backoff after a failed tunnel dial or handshake.
const REDIAL_DELAY: Duration = Duration::from_secs(10);

/// Grace period before accepting user connections so the dialers can
/// populate the heap.
const WARMUP_DELAY: Duration = Duration::from_secs(2);

/// Connect timeout for dialing the tunnel server.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// A hub plus its scheduling state: the live-link count acting as heap
/// priority and the back pointer into the heap.
pub struct ClientHub {
    hub: Hub,
    priority: AtomicI32,
    heap_index: AtomicUsize,
}

impl ClientHub {
    fn new(tunnel: Arc<Tunnel>) -> Arc<Self> {
        let hub = Arc::new(Self {
            hub: Hub::new(tunnel),
            priority: AtomicI32::new(0),
            heap_index: AtomicUsize::new(0),
        });
        hub.spawn_heartbeat();
        hub
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Runs the hub loop. Heartbeat echoes from the server are consumed by
    /// the filter; everything else takes the shared dispatch.
    pub fn start(&self) {
        self.hub
            .run(|cmd| cmd.code() == Some(CtrlCode::Heartbeat));
    }

    /// Pings the server every five-ish seconds so the idle timeout on both
    /// sides keeps getting refreshed. Stops once a send fails.
    fn spawn_heartbeat(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        let span = HEARTBEAT_SPAN + Duration::from_millis(rand::thread_rng().gen_range(0..1000));

        thread::spawn(move || {
            report::count(Counter::Thread, true);
            loop {
                thread::sleep(span);
                if !hub.hub.send_cmd(0, CtrlCode::Heartbeat) {
                    break;
                }
            }
            report::count(Counter::Thread, false);
        });
    }

    fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn status(&self, w: &mut dyn fmt::Write) {
        self.hub.status(w);
        let _ = write!(
            w,
            " priority:{} index:{}",
            self.priority(),
            self.heap_index.load(Ordering::Relaxed)
        );
    }
}

/// Binary min-heap of client hubs by priority. Only ever touched under the
/// client lock; `swap` is the single place heap indices change.
struct HubQueue(Vec<Arc<ClientHub>>);

impl HubQueue {
    fn new() -> Self {
        Self(Vec::new())
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.0[i].priority() < self.0[j].priority()
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.0.swap(i, j);
        self.0[i].heap_index.store(i, Ordering::Relaxed);
        self.0[j].heap_index.store(j, Ordering::Relaxed);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            if left >= self.len() {
                break;
            }

            let mut child = left;
            let right = left + 1;
            if right < self.len() && self.less(right, left) {
                child = right;
            }

            if !self.less(child, i) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
    }

    /// Restores heap order around a node whose priority changed.
    fn fix(&mut self, i: usize) {
        self.sift_down(i);
        self.sift_up(i);
    }

    fn push(&mut self, hub: Arc<ClientHub>) {
        let i = self.len();
        hub.heap_index.store(i, Ordering::Relaxed);
        self.0.push(hub);
        self.sift_up(i);
    }

    fn remove(&mut self, i: usize) {
        let last = self.len() - 1;
        if i != last {
            self.swap(i, last);
        }
        self.0.pop();
        if i < self.len() {
            self.fix(i);
        }
    }

    /// The least-loaded hub, its priority already bumped for the link about
    /// to run on it.
    fn fetch(&mut self) -> Option<Arc<ClientHub>> {
        if self.0.is_empty() {
            return None;
        }

        let hub = Arc::clone(&self.0[0]);
        hub.priority.fetch_add(1, Ordering::Relaxed);
        self.fix(0);
        Some(hub)
    }
}

/// The tunnel client: accepts user connections and spreads them over a
/// small pool of authenticated tunnels.
pub struct Client {
    listen: String,
    backend: String,
    tunnels: usize,
    config: Arc<TunnelConfig>,
    queue: Mutex<HubQueue>,
}

impl Client {
    /// `tunnels` outside 1..=3 is coerced to 1.
    pub fn new(listen: String, backend: String, config: Arc<TunnelConfig>, tunnels: usize) -> Self {
        let tunnels = if (1..=3).contains(&tunnels) { tunnels } else { 1 };

        Self {
            listen,
            backend,
            tunnels,
            config,
            queue: Mutex::new(HubQueue::new()),
        }
    }

    /// Dials the server and runs the client side of the handshake: HelloA,
    /// then exchange of the sealed token, then session keys.
    fn create_hub(&self) -> Result<Arc<ClientHub>, TunnelError> {
        let conn = tunnel::dial(&self.backend, DIAL_TIMEOUT)?;
        tunnel::set_keepalive(&conn, tunnel::TUNNEL_KEEPALIVE)?;

        let tunnel = Tunnel::new(conn, &self.config)?;
        match self.handshake(&tunnel) {
            Ok(auth) => {
                tunnel.set_id(auth.token.to_id());
                let hub = ClientHub::new(tunnel);
                warn!("client: {}, handshake succeed", hub.hub.tunnel());
                Ok(hub)
            }
            Err(e) => {
                tunnel.close();
                Err(e)
            }
        }
    }

    fn handshake(&self, tunnel: &Arc<Tunnel>) -> Result<Authenticator, TunnelError> {
        let mut hello_a = pool::take();
        hello_a.extend_from_slice(&HelloA::new(&self.config.secret).to_bytes());
        tunnel.write_packet(0, hello_a, true)?;

        let (_, hello_b) = tunnel.read_packet()?;
        let mut auth = Authenticator::new(&self.config.secret);
        let exchanged = auth.exchange_cipher_block(&hello_b);
        pool::recycle(hello_b);
        let block = exchanged?;

        let mut hello_c = pool::take();
        hello_c.extend_from_slice(&block);
        tunnel.write_packet(0, hello_c, true)?;

        tunnel.set_keys(&auth.token, &self.config, true)?;
        Ok(auth)
    }

    fn add_hub(&self, hub: Arc<ClientHub>) {
        self.queue.lock().unwrap().push(hub);
    }

    fn remove_hub(&self, hub: &Arc<ClientHub>) {
        let mut queue = self.queue.lock().unwrap();
        let i = hub.heap_index.load(Ordering::Relaxed);
        if i < queue.len() && Arc::ptr_eq(&queue.0[i], hub) {
            queue.remove(i);
        }
    }

    fn fetch_hub(&self) -> Option<Arc<ClientHub>> {
        self.queue.lock().unwrap().fetch()
    }

    /// A link finished; the hub gets attractive again.
    fn down_hub(&self, hub: &Arc<ClientHub>) {
        let mut queue = self.queue.lock().unwrap();
        hub.priority.fetch_sub(1, Ordering::Relaxed);
        let i = hub.heap_index.load(Ordering::Relaxed);
        if i < queue.len() && Arc::ptr_eq(&queue.0[i], hub) {
            queue.fix(i);
        }
    }

    /// Pumps one user connection through the chosen hub.
    fn handle_link_conn(&self, chub: Arc<ClientHub>, conn: TcpStream) {
        let id = link::next_link_id();

        let hub = &chub.hub;
        match hub.create_link(id) {
            Some(link) => {
                hub.send_cmd(id, CtrlCode::LinkCreate);
                hub.run_link(&link, conn, self.config.link_read_timeout());
                hub.delete_link(id);
            }
            None => drop(conn),
        }

        self.down_hub(&chub);
    }

    /// Spawns the dialer threads and serves the user listener. Blocks for
    /// the lifetime of the client.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        for index in 0..self.tunnels {
            let client = Arc::clone(self);
            thread::spawn(move || {
                report::count(Counter::Thread, true);
                client.dialer(index);
                report::count(Counter::Thread, false);
            });
        }

        // Give the dialers a head start so the heap has candidates.
        thread::sleep(WARMUP_DELAY);
        self.listen()
    }

    /// One dialer: keeps a tunnel slot filled forever, backing off after
    /// failures.
    fn dialer(self: &Arc<Self>, index: usize) {
        loop {
            let hub = match self.create_hub() {
                Ok(hub) => hub,
                Err(e) => {
                    warn!("client: {} tunnel, connect failed: {}", index, e);
                    thread::sleep(REDIAL_DELAY);
                    continue;
                }
            };

            self.add_hub(Arc::clone(&hub));
            hub.start();
            self.remove_hub(&hub);
            warn!(
                "client: {} tunnel {:5}, disconnected",
                index,
                hub.hub.tunnel().id()
            );
        }
    }

    fn listen(self: &Arc<Self>) -> io::Result<()> {
        let listener = TcpListener::bind(&self.listen)?;

        loop {
            let (conn, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    warn!("accept failed temporary: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            info!("new connection from {}", peer);

            let chub = match self.fetch_hub() {
                Some(chub) => chub,
                None => {
                    error!("no active hub");
                    drop(conn);
                    continue;
                }
            };

            let client = Arc::clone(self);
            thread::spawn(move || {
                report::count(Counter::Thread, true);
                client.handle_link_conn(chub, conn);
                report::count(Counter::Thread, false);
            });
        }
    }
}

impl Status for Client {
    fn status(&self, w: &mut dyn fmt::Write) {
        let queue = self.queue.lock().unwrap();
        for hub in &queue.0 {
            hub.status(w);
        }
    }
}

pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::TcpListener;

    fn test_chub() -> Arc<ClientHub> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();

        let config = TunnelConfig::new("s".into(), "DUMMY".into(), true, 60);
        ClientHub::new(Tunnel::new(b, &config).unwrap())
    }

    fn close_all(queue: &HubQueue) {
        for hub in &queue.0 {
            hub.hub.close();
        }
    }

    #[test]
    fn fetch_picks_least_loaded() {
        let mut queue = HubQueue::new();
        for _ in 0..3 {
            queue.push(test_chub());
        }

        // Nine arrivals over three idle hubs: the load spreads evenly and
        // never diverges by more than one.
        for _ in 0..9 {
            let hub = queue.fetch().unwrap();
            let min = queue.0.iter().map(|h| h.priority()).min().unwrap();
            assert!(hub.priority() - min <= 1);
        }
        for hub in &queue.0 {
            assert_eq!(hub.priority(), 3);
        }

        close_all(&queue);
    }

    #[test]
    fn fix_restores_order_after_unload() {
        let mut queue = HubQueue::new();
        for _ in 0..2 {
            queue.push(test_chub());
        }

        let busy = queue.fetch().unwrap();
        let _ = queue.fetch().unwrap();
        let _ = queue.fetch().unwrap();
        // busy: 1 or 2, total load 3 over 2 hubs.

        busy.priority.fetch_sub(busy.priority(), Ordering::Relaxed);
        queue.fix(busy.heap_index.load(Ordering::Relaxed));
        assert!(Arc::ptr_eq(&queue.0[0], &busy));

        close_all(&queue);
    }

    #[test]
    fn remove_keeps_back_pointers_valid() {
        let mut queue = HubQueue::new();
        for _ in 0..4 {
            queue.push(test_chub());
        }
        let victim = Arc::clone(&queue.0[1]);
        victim.hub.close();

        queue.remove(1);
        assert_eq!(queue.len(), 3);
        for (i, hub) in queue.0.iter().enumerate() {
            assert_eq!(hub.heap_index.load(Ordering::Relaxed), i);
            assert!(!Arc::ptr_eq(hub, &victim));
        }

        close_all(&queue);
    }

    #[test]
    fn empty_queue_yields_no_hub() {
        let mut queue = HubQueue::new();
        assert!(queue.fetch().is_none());
    }

    #[test]
    fn tunnel_count_is_coerced() {
        let config = Arc::new(TunnelConfig::new("s".into(), "DUMMY".into(), true, 60));
        for (requested, effective) in [(0, 1), (1, 1), (3, 3), (4, 1)] {
            let client = Client::new(
                "127.0.0.1:0".into(),
                "127.0.0.1:1".into(),
                Arc::clone(&config),
                requested,
            );
            assert_eq!(client.tunnels, effective);
        }
    }
}
