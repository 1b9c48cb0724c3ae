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

//! Process-wide recycling pool of packet buffers.
//!
//! Every tunnel body and link read goes through a buffer of exactly
//! [`crate::message::PACKET_SIZE`] bytes capacity. Returning buffers of any
//! other capacity is allowed but they are dropped instead of recycled.

use crate::message::PACKET_SIZE;
use crate::report::{self, Counter};

use std::sync::Mutex;

static FREE: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// Takes an empty buffer of `PACKET_SIZE` capacity from the pool,
/// allocating a fresh one if the pool is empty.
pub fn take() -> Vec<u8> {
    report::count(Counter::Buffer, true);
    FREE.lock()
        .unwrap()
        .pop()
        .unwrap_or_else(|| Vec::with_capacity(PACKET_SIZE))
}

/// Returns a buffer to the pool. Only buffers whose capacity equals
/// `PACKET_SIZE` are recycled; foreign slices are dropped.
pub fn recycle(mut buf: Vec<u8>) {
    report::count(Counter::Buffer, false);
    if buf.capacity() == PACKET_SIZE {
        buf.clear();
        FREE.lock().unwrap().push(buf);
    }
}

/// Number of buffers currently handed out and not yet recycled.
pub fn in_flight() -> i64 {
    report::level(Counter::Buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_recycle() {
        let mut a = take();
        assert_eq!(a.capacity(), PACKET_SIZE);
        assert!(a.is_empty());

        a.extend_from_slice(b"payload");
        recycle(a);

        // Recycled buffers come back cleared, at full capacity.
        let b = take();
        assert!(b.is_empty());
        assert_eq!(b.capacity(), PACKET_SIZE);
        recycle(b);
    }

    #[test]
    fn foreign_capacity_is_dropped() {
        recycle(vec![0u8; 16]);
        report::count(Counter::Buffer, true); // rebalance the gauge

        // A foreign buffer never comes back out of the pool.
        let buf = take();
        assert_eq!(buf.capacity(), PACKET_SIZE);
        recycle(buf);
    }
}
