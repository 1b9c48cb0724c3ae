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

use std::time::Duration;

/// Raw default of the tunnel read timeout in seconds. Out of the accepted
/// range on purpose: [`TunnelConfig::new`] coerces it to 60.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 180;

/// Accepted tunnel read timeout range in seconds. Values outside this range
/// resolve to 60.
pub const MIN_READ_TIMEOUT_SECS: u64 = 20;
pub const MAX_READ_TIMEOUT_SECS: u64 = 120;

/// A `TunnelConfig` carries the settings shared by every tunnel of a process:
/// the shared secret, the cipher to run on the wire, whether packet checksums
/// are verified and how long an idle tunnel read may block before the
/// connection is considered dead.
///
/// Built once from the command line and handed around read-only.
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// The shared secret both ends authenticate with.
    pub secret: String,
    /// Catalog name of the stream cipher, e.g. `AES-128-CTR`.
    pub cipher: String,
    /// Verify header and body CRCs of received packets.
    pub verify_crc: bool,
    /// Idle limit for tunnel reads. Heartbeats must arrive within this
    /// window or the tunnel is torn down.
    pub read_timeout: Duration,
}

impl TunnelConfig {
    /// Creates a config, resolving `read_timeout_secs` through
    /// [`effective_read_timeout`].
    pub fn new(secret: String, cipher: String, verify_crc: bool, read_timeout_secs: u64) -> Self {
        Self {
            secret,
            cipher,
            verify_crc,
            read_timeout: effective_read_timeout(read_timeout_secs),
        }
    }

    /// The read deadline applied to the user-facing socket of a link.
    pub fn link_read_timeout(&self) -> Duration {
        Duration::from_secs(300)
    }
}

/// Resolves a configured read timeout: values outside
/// [[`MIN_READ_TIMEOUT_SECS`], [`MAX_READ_TIMEOUT_SECS`]] become 60 seconds.
/// The raw default of 180 deliberately falls through to 60.
pub fn effective_read_timeout(secs: u64) -> Duration {
    if (MIN_READ_TIMEOUT_SECS..=MAX_READ_TIMEOUT_SECS).contains(&secs) {
        Duration::from_secs(secs)
    } else {
        Duration::from_secs(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_timeout_coercion() {
        assert_eq!(effective_read_timeout(20), Duration::from_secs(20));
        assert_eq!(effective_read_timeout(120), Duration::from_secs(120));
        assert_eq!(effective_read_timeout(19), Duration::from_secs(60));
        assert_eq!(effective_read_timeout(121), Duration::from_secs(60));
        assert_eq!(
            effective_read_timeout(DEFAULT_READ_TIMEOUT_SECS),
            Duration::from_secs(60)
        );
    }
}
