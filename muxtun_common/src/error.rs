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

use std::io;

use thiserror::Error;

/// A `CipherError` indicates a failure resolving a cipher from the catalog.
/// Both variants are fatal at startup.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The requested cipher name is not in the catalog.
    #[error("cipher \"{0}\" is not supported")]
    Unsupported(String),
    /// The derived key does not match the cipher's key size.
    #[error("key size error: need {0} bytes")]
    KeySize(usize),
}

/// A `TunnelError` indicates an error condition on a tunnel connection.
/// Framing and handshake errors are unconditionally fatal: the tunnel is
/// closed and every link multiplexed over it is reset.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A received packet id does not equal the expected read counter.
    #[error("unexpected packet id")]
    BadPacketId,
    /// The header or body checksum does not match.
    #[error("packet checksum mismatch")]
    BadCrc,
    /// The advertised body length exceeds the maximum packet size.
    #[error("packet too large: {0} bytes")]
    TooLarge(usize),

    /// A handshake message has the wrong length.
    #[error("handshake message has bad length")]
    BadLength,
    /// A handshake message carries an invalid authentication tag.
    #[error("handshake message has bad mac")]
    BadMac,
    /// The returned token is not the complement of the issued one.
    #[error("exchanged token is not complementary")]
    NotComplementary,

    /// The tunnel has already failed or been closed; the first error is
    /// latched and all later writes report this.
    #[error("tunnel is closed")]
    Closed,

    /// A `std::io::Error` I/O error occured.
    /// Read timeouts surface here when the peer goes silent.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A wire (de)serialization error occured.
    #[error("wire (de)serialization error: {0}")]
    Wire(#[from] Box<bincode::ErrorKind>),

    /// A cipher could not be constructed for the session keys.
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// A `LinkError` reports which half of a link failed. The variant selects
/// the close command propagated to the peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum LinkError {
    /// Both halves of the link are down.
    #[error("link closed")]
    Closed,
    /// The local read half is down (EOF or read failure on the user socket).
    #[error("link read half closed")]
    ReadClosed,
    /// The local write half is down (write failure on the user socket).
    #[error("link write half closed")]
    WriteClosed,
}
