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

//! Fixed-layout wire messages. All multi-byte integers are big-endian;
//! serialization goes through [`wire`] so every struct keeps its exact
//! on-the-wire size.

use crate::system;
use crate::TunnelError;

use bincode::Options;
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum body size of a tunnel packet in bytes.
pub const PACKET_SIZE: usize = 8192;

/// Size of a serialized [`Header`] in bytes.
pub const HEADER_SIZE: usize = 10;

/// Size of a serialized [`Ctrl`] in bytes.
pub const CTRL_SIZE: usize = 3;

/// Size of a serialized [`HelloA`] in bytes.
pub const HELLO_A_SIZE: usize = 74;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16 checksum used for packet headers, bodies and the secret tag
/// of [`HelloA`].
pub fn checksum(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Serializer options pinning the wire layout: fixed-width integers,
/// big-endian byte order.
pub fn wire() -> impl Options {
    bincode::options().with_big_endian().with_fixint_encoding()
}

/// A tunnel packet header. A packet is a header followed by `len` body
/// bytes. `link_id` 0 marks a control packet carrying a [`Ctrl`] body.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Strictly sequential per direction; any gap is fatal.
    pub packet_id: u16,
    /// CRC over the four other fields, see [`Header::checksum`].
    pub header_crc: u16,
    /// CRC over the body bytes.
    pub data_crc: u16,
    /// Destination link, 0 for control packets.
    pub link_id: u16,
    /// Body length, at most [`PACKET_SIZE`].
    pub len: u16,
}

impl Header {
    /// Builds a header for `body` and seals it with its own CRC.
    pub fn seal(packet_id: u16, link_id: u16, body: &[u8]) -> Self {
        let mut header = Self {
            packet_id,
            header_crc: 0,
            data_crc: checksum(body),
            link_id,
            len: body.len() as u16,
        };
        header.header_crc = header.checksum();
        header
    }

    /// CRC over `packet_id ‖ data_crc ‖ link_id ‖ len` (big-endian),
    /// excluding `header_crc` itself.
    pub fn checksum(&self) -> u16 {
        let mut buf = [0u8; 8];
        for (i, v) in [self.packet_id, self.data_crc, self.link_id, self.len]
            .into_iter()
            .enumerate()
        {
            buf[2 * i..2 * i + 2].copy_from_slice(&v.to_be_bytes());
        }
        checksum(&buf)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let encoded = wire().serialize(self).expect("header serialization");
        buf.copy_from_slice(&encoded);
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self, TunnelError> {
        Ok(wire().deserialize(buf)?)
    }
}

/// Control command codes carried on link id 0.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CtrlCode {
    /// Reserved; data frames use a nonzero link id instead.
    LinkData = 0,
    /// Peer opened a link with the carried id.
    LinkCreate = 1,
    /// Close both halves of the link.
    LinkClose = 2,
    /// Peer's write half failed; close our read half.
    LinkCloseWriteErr = 3,
    /// Peer's read half failed; close our write half.
    LinkCloseReadErr = 4,
    /// Liveness probe. Clients send, servers echo.
    Heartbeat = 5,
}

impl CtrlCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::LinkData),
            1 => Some(Self::LinkCreate),
            2 => Some(Self::LinkClose),
            3 => Some(Self::LinkCloseWriteErr),
            4 => Some(Self::LinkCloseReadErr),
            5 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Body of a control packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Ctrl {
    pub code: u8,
    pub link_id: u16,
}

impl Ctrl {
    pub fn new(code: CtrlCode, link_id: u16) -> Self {
        Self {
            code: code as u8,
            link_id,
        }
    }

    /// The decoded command, if the code is known.
    pub fn code(&self) -> Option<CtrlCode> {
        CtrlCode::from_u8(self.code)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        wire().serialize(self).expect("ctrl serialization")
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, TunnelError> {
        Ok(wire().deserialize(buf)?)
    }
}

/// Opening message of the dialog, client to server. The server consumes the
/// frame without inspecting it; the fields exist so future versions can bind
/// the handshake to them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HelloA {
    /// Sender clock, milliseconds since the Unix epoch.
    pub now: u64,
    /// CRC-16 tag of the shared secret.
    pub secret_crc16: u16,
    /// SHA-256 of 32 random bytes.
    pub salt: [u8; 32],
    /// `SHA-256(secret "," decimal(now) "," hex(salt))`.
    pub hash: [u8; 32],
}

impl HelloA {
    pub fn new(secret: &str) -> Self {
        let now = system::now_ms();
        let salt = system::sha256(&system::random_bytes(32));

        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(b",");
        hasher.update(now.to_string().as_bytes());
        hasher.update(b",");
        hasher.update(hex::encode(salt).as_bytes());

        Self {
            now,
            secret_crc16: checksum(secret.as_bytes()),
            salt,
            hash: hasher.finalize().into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        wire().serialize(self).expect("hello serialization")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_known_answers() {
        // CRC-16/MODBUS check value.
        assert_eq!(checksum(b"123456789"), 0x4b37);
        assert_eq!(checksum(b""), 0xffff);
    }

    #[test]
    fn header_layout_is_ten_big_endian_bytes() {
        let header = Header {
            packet_id: 0x0102,
            header_crc: 0x0304,
            data_crc: 0x0506,
            link_id: 0x0708,
            len: 0x090a,
        };

        let bytes = header.to_bytes();
        assert_eq!(
            bytes,
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a]
        );
        assert_eq!(Header::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn sealed_header_verifies() {
        let body = b"some body bytes";
        let header = Header::seal(7, 42, body);

        assert_eq!(header.packet_id, 7);
        assert_eq!(header.link_id, 42);
        assert_eq!(header.len, body.len() as u16);
        assert_eq!(header.data_crc, checksum(body));
        assert_eq!(header.header_crc, header.checksum());
    }

    #[test]
    fn header_checksum_covers_every_field() {
        let header = Header::seal(7, 42, b"x");
        let crc = header.checksum();

        for mutate in [
            |h: &mut Header| h.packet_id ^= 1,
            |h: &mut Header| h.data_crc ^= 1,
            |h: &mut Header| h.link_id ^= 1,
            |h: &mut Header| h.len ^= 1,
        ] {
            let mut tampered = header;
            mutate(&mut tampered);
            assert_ne!(tampered.checksum(), crc);
        }
    }

    #[test]
    fn ctrl_round_trip() {
        let ctrl = Ctrl::new(CtrlCode::LinkCreate, 0x1234);
        let bytes = ctrl.to_bytes();

        assert_eq!(bytes, vec![0x01, 0x12, 0x34]);
        assert_eq!(Ctrl::from_bytes(&bytes).unwrap(), ctrl);
        assert_eq!(ctrl.code(), Some(CtrlCode::LinkCreate));
        assert_eq!(Ctrl { code: 9, link_id: 0 }.code(), None);
    }

    #[test]
    fn hello_a_is_74_bytes() {
        let hello = HelloA::new("secret");
        assert_eq!(hello.to_bytes().len(), HELLO_A_SIZE);
        assert_eq!(hello.secret_crc16, checksum(b"secret"));
    }
}
