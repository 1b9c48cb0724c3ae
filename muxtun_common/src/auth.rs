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

//! Mutual authentication.
//!
//! The server issues a random [`AuthToken`] sealed in a [`cipher block`]
//! (AES-128-ECB over the token, HMAC-MD5 over the ciphertext, both keyed
//! from SHA-256 of the shared secret, encrypt-then-MAC). The client proves
//! knowledge of the secret by returning the complemented token in the same
//! envelope. The token then seeds the per-direction session keys.
//!
//! [`cipher block`]: Authenticator::gen_cipher_block

use crate::system;
use crate::TunnelError;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Serialized token size in bytes (one AES block).
pub const TOKEN_SIZE: usize = 16;
/// HMAC-MD5 tag size in bytes.
pub const MAC_SIZE: usize = 16;
/// Cipher block size: sealed token plus tag.
pub const BLOCK_SIZE: usize = TOKEN_SIZE + MAC_SIZE;

type HmacMd5 = Hmac<Md5>;

/// The random value exchanged during the handshake. Both fields are
/// independent 64-bit secure random numbers; `timestamp` keeps its
/// historical name but carries no clock reading.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AuthToken {
    pub challenge: u64,
    pub timestamp: u64,
}

impl AuthToken {
    /// A fresh token with two secure random fields.
    pub fn random() -> Self {
        Self {
            challenge: system::random_u64(),
            timestamp: system::random_u64(),
        }
    }

    /// 16-byte big-endian serialization.
    pub fn to_bytes(&self) -> [u8; TOKEN_SIZE] {
        let mut buf = [0u8; TOKEN_SIZE];
        buf[..8].copy_from_slice(&self.challenge.to_be_bytes());
        buf[8..].copy_from_slice(&self.timestamp.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; TOKEN_SIZE]) -> Self {
        Self {
            challenge: u64::from_be_bytes(buf[..8].try_into().expect("slice length")),
            timestamp: u64::from_be_bytes(buf[8..].try_into().expect("slice length")),
        }
    }

    /// The token with both fields bitwise inverted.
    pub fn complement(&self) -> Self {
        Self {
            challenge: !self.challenge,
            timestamp: !self.timestamp,
        }
    }

    /// Whether `other` is the bitwise complement of this token.
    pub fn is_complementary(&self, other: &Self) -> bool {
        self.challenge == !other.challenge && self.timestamp == !other.timestamp
    }

    /// Short tunnel tag for log lines: the MD5 digest bytes of the token
    /// summed mod 2^16. Not security relevant.
    pub fn to_id(&self) -> u16 {
        Md5::digest(self.to_bytes())
            .iter()
            .fold(0u16, |acc, b| acc.wrapping_add(*b as u16))
    }

    /// Key for the client-to-server direction: `SHA-256(token ‖ SHA-256(secret))`.
    pub fn to_client_enc_key(&self, secret: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.to_bytes());
        hasher.update(system::sha256(secret));
        hasher.finalize().into()
    }

    /// Key for the server-to-client direction: `SHA-256(SHA-256(secret) ‖ token)`.
    pub fn to_server_enc_key(&self, secret: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(system::sha256(secret));
        hasher.update(self.to_bytes());
        hasher.finalize().into()
    }
}

/// Per-direction 32-byte session secrets, `(encrypt, decrypt)` from the
/// caller's point of view. The server's pair is the client's swapped.
pub fn session_keys(token: &AuthToken, secret: &str, from_client: bool) -> ([u8; 32], [u8; 32]) {
    let client_key = token.to_client_enc_key(secret.as_bytes());
    let server_key = token.to_server_enc_key(secret.as_bytes());

    if from_client {
        (client_key, server_key)
    } else {
        (server_key, client_key)
    }
}

/// One side of the token exchange. Holds the AES and MAC keys split out of
/// SHA-256 of the shared secret, plus the token seen so far.
pub struct Authenticator {
    cipher: Aes128,
    mac_key: [u8; MAC_SIZE],
    pub token: AuthToken,
}

impl Authenticator {
    pub fn new(secret: &str) -> Self {
        let digest = system::sha256(secret.as_bytes());

        let cipher = Aes128::new_from_slice(&digest[..TOKEN_SIZE])
            .expect("AES-128 takes a 16 byte key");
        let mut mac_key = [0u8; MAC_SIZE];
        mac_key.copy_from_slice(&digest[TOKEN_SIZE..]);

        Self {
            cipher,
            mac_key,
            token: AuthToken::default(),
        }
    }

    /// Installs a fresh random token. Server side, once per tunnel.
    pub fn gen_random_token(&mut self) {
        self.token = AuthToken::random();
    }

    /// Seals a token (the stored one if `None`) into the encrypt-then-MAC
    /// envelope: AES-128-ECB ciphertext followed by its HMAC-MD5 tag.
    pub fn gen_cipher_block(&self, token: Option<&AuthToken>) -> [u8; BLOCK_SIZE] {
        let token = token.unwrap_or(&self.token);

        let mut block = GenericArray::from(token.to_bytes());
        self.cipher.encrypt_block(&mut block);

        let mut out = [0u8; BLOCK_SIZE];
        out[..TOKEN_SIZE].copy_from_slice(&block);
        out[TOKEN_SIZE..].copy_from_slice(&self.mac_tag(&block));
        out
    }

    fn mac_tag(&self, ciphertext: &[u8]) -> [u8; MAC_SIZE] {
        let mut mac =
            <HmacMd5 as Mac>::new_from_slice(&self.mac_key).expect("HMAC can take key of any size");
        mac.update(ciphertext);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time check of the tag trailing the sealed token.
    pub fn check_mac(&self, block: &[u8]) -> bool {
        let expected = self.mac_tag(&block[..TOKEN_SIZE]);
        expected[..].ct_eq(&block[TOKEN_SIZE..]).into()
    }

    fn decrypt_token(&self, block: &[u8]) -> AuthToken {
        let mut buf = [0u8; TOKEN_SIZE];
        buf.copy_from_slice(&block[..TOKEN_SIZE]);

        let mut ga = GenericArray::from(buf);
        self.cipher.decrypt_block(&mut ga);
        AuthToken::from_bytes(&ga.into())
    }

    /// Client side: verifies the server's block, adopts the recovered token
    /// and answers with the sealed complement.
    pub fn exchange_cipher_block(&mut self, block: &[u8]) -> Result<[u8; BLOCK_SIZE], TunnelError> {
        if block.len() != BLOCK_SIZE {
            return Err(TunnelError::BadLength);
        }
        if !self.check_mac(block) {
            return Err(TunnelError::BadMac);
        }

        self.token = self.decrypt_token(block);
        let reply = self.token.complement();
        Ok(self.gen_cipher_block(Some(&reply)))
    }

    /// Server side: verifies the client's block and that it carries the
    /// complement of the issued token.
    pub fn verify_cipher_block(&self, block: &[u8]) -> Result<(), TunnelError> {
        if block.len() != BLOCK_SIZE {
            return Err(TunnelError::BadLength);
        }
        if !self.check_mac(block) {
            return Err(TunnelError::BadMac);
        }

        if self.token.is_complementary(&self.decrypt_token(block)) {
            Ok(())
        } else {
            Err(TunnelError::NotComplementary)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bytes_round_trip() {
        let token = AuthToken {
            challenge: 0x0102030405060708,
            timestamp: 0x090a0b0c0d0e0f10,
        };

        let bytes = token.to_bytes();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[8], 0x09);
        assert_eq!(AuthToken::from_bytes(&bytes), token);
    }

    #[test]
    fn complement_is_involutive() {
        let token = AuthToken::random();
        assert_eq!(token.complement().complement(), token);
        assert!(token.is_complementary(&token.complement()));
        assert!(!token.is_complementary(&token));
    }

    #[test]
    fn exchange_and_verify() {
        for secret in ["123456789", "987654321", "abcdefg"] {
            let mut server = Authenticator::new(secret);
            let mut client = Authenticator::new(secret);

            server.gen_random_token();
            let hello_b = server.gen_cipher_block(None);
            assert!(server.check_mac(&hello_b));

            let hello_c = client.exchange_cipher_block(&hello_b).unwrap();
            assert_eq!(client.token, server.token);

            server.verify_cipher_block(&hello_c).unwrap();
        }
    }

    #[test]
    fn wrong_secret_fails_mac() {
        let mut server = Authenticator::new("a");
        let mut client = Authenticator::new("b");

        server.gen_random_token();
        let hello_b = server.gen_cipher_block(None);

        assert!(matches!(
            client.exchange_cipher_block(&hello_b),
            Err(TunnelError::BadMac)
        ));
    }

    #[test]
    fn tampered_block_fails_mac() {
        let mut auth = Authenticator::new("secret");
        auth.gen_random_token();

        let mut block = auth.gen_cipher_block(None);
        block[3] ^= 0x40;
        assert!(!auth.check_mac(&block));
    }

    #[test]
    fn non_complement_is_rejected() {
        let mut server = Authenticator::new("secret");
        server.gen_random_token();

        // A sealed copy of the token itself instead of its complement.
        let echo = server.gen_cipher_block(None);
        assert!(matches!(
            server.verify_cipher_block(&echo),
            Err(TunnelError::NotComplementary)
        ));

        assert!(matches!(
            server.verify_cipher_block(&[0u8; 7]),
            Err(TunnelError::BadLength)
        ));
    }

    #[test]
    fn direction_keys_mirror() {
        let token = AuthToken {
            challenge: 100,
            timestamp: 200,
        };

        let (client_enc, client_dec) = session_keys(&token, "s", true);
        let (server_enc, server_dec) = session_keys(&token, "s", false);

        assert_eq!(client_enc, server_dec);
        assert_eq!(client_dec, server_enc);
        assert_ne!(client_enc, client_dec);
    }

    #[test]
    fn to_id_is_stable() {
        let token = AuthToken {
            challenge: 100,
            timestamp: 200,
        };
        assert_eq!(token.to_id(), token.to_id());
        assert_eq!(token.to_id(), AuthToken::from_bytes(&token.to_bytes()).to_id());
    }
}
