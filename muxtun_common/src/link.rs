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

//! One logical TCP stream carried inside a tunnel.
//!
//! A link owns a user-facing socket and a bounded queue of buffers waiting
//! to be written to it. The read and write halves close independently; the
//! half that failed decides which close command the hub sends to the peer.

use crate::message::PACKET_SIZE;
use crate::pool;
use crate::report::{self, Counter};
use crate::LinkError;

use std::io::Read;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, Once};

use log::debug;

/// Capacity of the outbound queue in buffers. A full queue blocks the hub
/// reader, propagating backpressure to every link on the tunnel.
const WRITE_QUEUE_CAP: usize = 30;

static NEXT_LINK_ID: AtomicU16 = AtomicU16::new(1);

/// Allocates the next link id. Process-wide, never 0; wraps past 0.
pub fn next_link_id() -> u16 {
    loop {
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

struct LinkState {
    conn: Option<TcpStream>,
    tx: Option<SyncSender<Vec<u8>>>,
    read_closed: bool,
    write_closed: bool,
}

/// A multiplexed stream. Owned by exactly one hub for its lifetime.
pub struct Link {
    pub id: u16,
    state: Mutex<LinkState>,
    rx: Mutex<Option<Receiver<Vec<u8>>>>,
    done: Once,
}

impl Link {
    pub fn new(id: u16) -> Arc<Self> {
        let (tx, rx) = sync_channel(WRITE_QUEUE_CAP);

        report::count(Counter::Link, true);
        report::count(Counter::Channel, true);

        Arc::new(Self {
            id,
            state: Mutex::new(LinkState {
                conn: None,
                tx: Some(tx),
                read_closed: false,
                write_closed: false,
            }),
            rx: Mutex::new(Some(rx)),
            done: Once::new(),
        })
    }

    /// Attaches the user-facing socket. Must happen exactly once, before the
    /// pumps start.
    pub fn set_conn(&self, conn: TcpStream) {
        let mut state = self.state.lock().unwrap();
        assert!(state.conn.is_none(), "link({}) conn set twice", self.id);
        state.conn = Some(conn);
    }

    /// Consumes the outbound queue receiver for the downlink pump.
    pub(crate) fn take_receiver(&self) -> Option<Receiver<Vec<u8>>> {
        self.rx.lock().unwrap().take()
    }

    /// Queues `data` for the downlink pump. Blocks while the queue holds
    /// [`WRITE_QUEUE_CAP`] buffers. Fails once the write half is closed.
    pub fn push(&self, data: Vec<u8>) -> Result<(), LinkError> {
        let tx = {
            let state = self.state.lock().unwrap();
            if state.write_closed {
                drop(state);
                pool::recycle(data);
                return Err(LinkError::WriteClosed);
            }
            state.tx.clone()
        };

        match tx {
            Some(tx) => tx.send(data).map_err(|e| {
                pool::recycle(e.0);
                LinkError::WriteClosed
            }),
            None => {
                pool::recycle(data);
                Err(LinkError::WriteClosed)
            }
        }
    }

    /// Reads up to a packet worth of bytes from the user socket into a pool
    /// buffer. EOF closes the read half; any other failure closes the link.
    pub fn read_conn(&self, conn: &TcpStream) -> Result<Vec<u8>, LinkError> {
        {
            let state = self.state.lock().unwrap();
            match (state.read_closed, state.write_closed) {
                (true, true) => return Err(LinkError::Closed),
                (true, false) => return Err(LinkError::ReadClosed),
                _ => {}
            }
        }

        let mut buf = pool::take();
        buf.resize(PACKET_SIZE, 0);

        let mut reader = conn;
        match reader.read(&mut buf) {
            Ok(0) => {
                self.close_read();
                pool::recycle(buf);
                Err(LinkError::ReadClosed)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(_) => {
                self.close_all();
                pool::recycle(buf);
                Err(LinkError::Closed)
            }
        }
    }

    /// Stops reading from the user socket.
    pub fn close_read(&self) {
        let mut state = self.state.lock().unwrap();
        if state.read_closed {
            return;
        }
        state.read_closed = true;

        if let Some(conn) = &state.conn {
            let _ = conn.shutdown(Shutdown::Read);
        }
    }

    /// Stops accepting data for the user socket and closes the outbound
    /// queue. A running downlink pump drains what is already queued and
    /// shuts the write half down afterwards; without a pump both happen
    /// here.
    pub fn close_write(&self) {
        let mut state = self.state.lock().unwrap();
        if state.write_closed {
            return;
        }
        state.write_closed = true;

        state.tx = None;
        report::count(Counter::Channel, false);
        drop(state);

        // A pump that never started leaves the receiver here; drain it and
        // finish the write half in its stead.
        if let Some(rx) = self.rx.lock().unwrap().take() {
            for data in rx.try_iter() {
                pool::recycle(data);
            }
            let state = self.state.lock().unwrap();
            if let Some(conn) = &state.conn {
                let _ = conn.shutdown(Shutdown::Write);
            }
        }
    }

    /// Closes both halves and resets the user socket. Late queued data is
    /// discarded by the pump, not delivered.
    pub fn close_all(&self) {
        self.done.call_once(|| {
            debug!("link({}) close", self.id);
            report::count(Counter::Link, false);
        });
        self.close_read();
        self.close_write();

        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.conn.take() {
            let _ = conn.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::net::TcpListener;

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    fn pool_bytes(bytes: &[u8]) -> Vec<u8> {
        let mut buf = pool::take();
        buf.extend_from_slice(bytes);
        buf
    }

    #[test]
    fn ids_are_nonzero_and_distinct() {
        let a = next_link_id();
        let b = next_link_id();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn push_then_close_write_rejects() {
        let link = Link::new(1);

        link.push(pool_bytes(b"queued")).unwrap();

        let rx = link.take_receiver().unwrap();
        assert_eq!(rx.recv().unwrap(), b"queued");
        drop(rx);

        link.close_write();
        assert_eq!(
            link.push(pool_bytes(b"late")),
            Err(LinkError::WriteClosed)
        );
    }

    #[test]
    fn close_write_drains_untaken_queue() {
        let link = Link::new(2);

        link.push(pool_bytes(b"a")).unwrap();
        link.push(pool_bytes(b"b")).unwrap();
        link.close_write();

        // The queue was drained and consumed by the close.
        assert!(link.take_receiver().is_none());
    }

    #[test]
    fn read_conn_reports_eof_as_read_closed() {
        let (mut a, b) = stream_pair();
        let link = Link::new(3);
        link.set_conn(b.try_clone().unwrap());

        a.write_all(b"last words").unwrap();
        drop(a);

        assert_eq!(link.read_conn(&b).unwrap(), b"last words");
        assert_eq!(link.read_conn(&b), Err(LinkError::ReadClosed));
        // Both halves down afterwards: writes are refused as well.
        link.close_write();
        assert_eq!(link.read_conn(&b), Err(LinkError::Closed));
    }

    #[test]
    fn close_all_is_idempotent() {
        let (_a, b) = stream_pair();
        let link = Link::new(4);
        link.set_conn(b);

        link.close_all();
        link.close_all();
        assert_eq!(link.push(pool_bytes(b"x")), Err(LinkError::WriteClosed));
    }
}
