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

//! The stream cipher catalog.
//!
//! Every cipher yields a pair of XOR keystream generators over the tunnel
//! byte stream. Keys are stretched from a password with the chained SHA-256
//! [`kdf`]; the DUMMY entry swaps nibbles and exists for tests only.

use crate::CipherError;

use aes::cipher::{BlockCipher, BlockEncryptMut, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::{ChaCha20, XChaCha20};
use rc4::consts::{U128, U256};
use rc4::Rc4;
use sha2::{Digest, Sha256};

/// An incremental XOR keystream over the tunnel byte stream.
pub trait Keystream: Send {
    /// Applies the keystream to `buf` in place.
    fn apply(&mut self, buf: &mut [u8]);
}

/// A cipher from the catalog, bound to a derived key. Generates a pair of
/// keystreams for encryption and decryption.
pub trait TunnelCipher: Send + Sync {
    fn iv_size(&self) -> usize;
    fn encrypter(&self, iv: &[u8]) -> Box<dyn Keystream>;
    fn decrypter(&self, iv: &[u8]) -> Box<dyn Keystream>;
}

struct Xor<C>(C);

impl<C: StreamCipher + Send> Keystream for Xor<C> {
    fn apply(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}

/// AES in CTR mode; the same keystream serves both directions.
struct AesCtr {
    key: Vec<u8>,
}

impl TunnelCipher for AesCtr {
    fn iv_size(&self) -> usize {
        16
    }

    fn encrypter(&self, iv: &[u8]) -> Box<dyn Keystream> {
        match self.key.len() {
            16 => Box::new(Xor(
                ctr::Ctr128BE::<Aes128>::new_from_slices(&self.key, iv)
                    .expect("catalog fixes key and iv sizes"),
            )),
            24 => Box::new(Xor(
                ctr::Ctr128BE::<Aes192>::new_from_slices(&self.key, iv)
                    .expect("catalog fixes key and iv sizes"),
            )),
            _ => Box::new(Xor(
                ctr::Ctr128BE::<Aes256>::new_from_slices(&self.key, iv)
                    .expect("catalog fixes key and iv sizes"),
            )),
        }
    }

    fn decrypter(&self, iv: &[u8]) -> Box<dyn Keystream> {
        self.encrypter(iv)
    }
}

struct CfbEnc<C: BlockEncryptMut + BlockCipher>(BufEncryptor<C>);

impl<C: BlockEncryptMut + BlockCipher + Send> Keystream for CfbEnc<C> {
    fn apply(&mut self, buf: &mut [u8]) {
        self.0.encrypt(buf);
    }
}

struct CfbDec<C: BlockEncryptMut + BlockCipher>(BufDecryptor<C>);

impl<C: BlockEncryptMut + BlockCipher + Send> Keystream for CfbDec<C> {
    fn apply(&mut self, buf: &mut [u8]) {
        self.0.decrypt(buf);
    }
}

/// AES in CFB mode; encrypt and decrypt keystreams differ.
struct AesCfb {
    key: Vec<u8>,
}

impl TunnelCipher for AesCfb {
    fn iv_size(&self) -> usize {
        16
    }

    fn encrypter(&self, iv: &[u8]) -> Box<dyn Keystream> {
        match self.key.len() {
            16 => Box::new(CfbEnc(
                BufEncryptor::<Aes128>::new_from_slices(&self.key, iv)
                    .expect("catalog fixes key and iv sizes"),
            )),
            24 => Box::new(CfbEnc(
                BufEncryptor::<Aes192>::new_from_slices(&self.key, iv)
                    .expect("catalog fixes key and iv sizes"),
            )),
            _ => Box::new(CfbEnc(
                BufEncryptor::<Aes256>::new_from_slices(&self.key, iv)
                    .expect("catalog fixes key and iv sizes"),
            )),
        }
    }

    fn decrypter(&self, iv: &[u8]) -> Box<dyn Keystream> {
        match self.key.len() {
            16 => Box::new(CfbDec(
                BufDecryptor::<Aes128>::new_from_slices(&self.key, iv)
                    .expect("catalog fixes key and iv sizes"),
            )),
            24 => Box::new(CfbDec(
                BufDecryptor::<Aes192>::new_from_slices(&self.key, iv)
                    .expect("catalog fixes key and iv sizes"),
            )),
            _ => Box::new(CfbDec(
                BufDecryptor::<Aes256>::new_from_slices(&self.key, iv)
                    .expect("catalog fixes key and iv sizes"),
            )),
        }
    }
}

/// IETF variant of ChaCha20 (96-bit nonce).
struct Chacha20Ietf {
    key: Vec<u8>,
}

impl TunnelCipher for Chacha20Ietf {
    fn iv_size(&self) -> usize {
        12
    }

    fn encrypter(&self, iv: &[u8]) -> Box<dyn Keystream> {
        Box::new(Xor(
            ChaCha20::new_from_slices(&self.key, iv).expect("catalog fixes key and iv sizes")
        ))
    }

    fn decrypter(&self, iv: &[u8]) -> Box<dyn Keystream> {
        self.encrypter(iv)
    }
}

/// XChaCha20 (192-bit nonce).
struct Chacha20X {
    key: Vec<u8>,
}

impl TunnelCipher for Chacha20X {
    fn iv_size(&self) -> usize {
        24
    }

    fn encrypter(&self, iv: &[u8]) -> Box<dyn Keystream> {
        Box::new(Xor(
            XChaCha20::new_from_slices(&self.key, iv).expect("catalog fixes key and iv sizes")
        ))
    }

    fn decrypter(&self, iv: &[u8]) -> Box<dyn Keystream> {
        self.encrypter(iv)
    }
}

/// RC4 with a 128 or 256 byte key. Kept for interoperability; RC4 is broken
/// and should not be picked for new deployments.
struct Rc4Cipher {
    key: Vec<u8>,
}

impl TunnelCipher for Rc4Cipher {
    fn iv_size(&self) -> usize {
        0
    }

    fn encrypter(&self, _iv: &[u8]) -> Box<dyn Keystream> {
        match self.key.len() {
            128 => Box::new(Xor(
                Rc4::<U128>::new_from_slice(&self.key).expect("catalog fixes key sizes")
            )),
            _ => Box::new(Xor(
                Rc4::<U256>::new_from_slice(&self.key).expect("catalog fixes key sizes")
            )),
        }
    }

    fn decrypter(&self, iv: &[u8]) -> Box<dyn Keystream> {
        self.encrypter(iv)
    }
}

/// Swaps the nibbles of every byte. Symmetric, keyless in effect, and only
/// meant for tests and demos.
struct Dummy;

struct DummyStream;

impl Keystream for DummyStream {
    fn apply(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = (*b << 4) | (*b >> 4);
        }
    }
}

impl TunnelCipher for Dummy {
    fn iv_size(&self) -> usize {
        0
    }

    fn encrypter(&self, _iv: &[u8]) -> Box<dyn Keystream> {
        Box::new(DummyStream)
    }

    fn decrypter(&self, iv: &[u8]) -> Box<dyn Keystream> {
        self.encrypter(iv)
    }
}

type Constructor = fn(Vec<u8>) -> Result<Box<dyn TunnelCipher>, CipherError>;

fn new_aes_ctr(key: Vec<u8>) -> Result<Box<dyn TunnelCipher>, CipherError> {
    Ok(Box::new(AesCtr { key }))
}

fn new_aes_cfb(key: Vec<u8>) -> Result<Box<dyn TunnelCipher>, CipherError> {
    Ok(Box::new(AesCfb { key }))
}

fn new_chacha20_ietf(key: Vec<u8>) -> Result<Box<dyn TunnelCipher>, CipherError> {
    if key.len() != 32 {
        return Err(CipherError::KeySize(32));
    }
    Ok(Box::new(Chacha20Ietf { key }))
}

fn new_chacha20_x(key: Vec<u8>) -> Result<Box<dyn TunnelCipher>, CipherError> {
    if key.len() != 32 {
        return Err(CipherError::KeySize(32));
    }
    Ok(Box::new(Chacha20X { key }))
}

fn new_rc4(key: Vec<u8>) -> Result<Box<dyn TunnelCipher>, CipherError> {
    if key.len() != 128 && key.len() != 256 {
        return Err(CipherError::KeySize(key.len()));
    }
    Ok(Box::new(Rc4Cipher { key }))
}

fn new_dummy(_key: Vec<u8>) -> Result<Box<dyn TunnelCipher>, CipherError> {
    Ok(Box::new(Dummy))
}

/// Catalog of supported ciphers: uppercase name, key size in bytes,
/// constructor.
const CATALOG: &[(&str, usize, Constructor)] = &[
    ("AES-128-CTR", 16, new_aes_ctr),
    ("AES-192-CTR", 24, new_aes_ctr),
    ("AES-256-CTR", 32, new_aes_ctr),
    ("AES-128-CFB", 16, new_aes_cfb),
    ("AES-192-CFB", 24, new_aes_cfb),
    ("AES-256-CFB", 32, new_aes_cfb),
    ("CHACHA20IETF", 32, new_chacha20_ietf),
    ("CHACHA20X", 32, new_chacha20_x),
    ("RC4-128", 128, new_rc4),
    ("RC4-256", 256, new_rc4),
    // only for demo
    ("DUMMY", 8, new_dummy),
];

/// Space-separated sorted list of available cipher names.
pub fn list_ciphers() -> String {
    let mut names: Vec<&str> = CATALOG.iter().map(|(name, _, _)| *name).collect();
    names.sort_unstable();
    names.join(" ")
}

/// Resolves `name` (case-insensitive) from the catalog and derives its key
/// from `password`. Returns the cipher and the derived key.
pub fn pick_cipher(
    name: &str,
    password: &[u8],
) -> Result<(Box<dyn TunnelCipher>, Vec<u8>), CipherError> {
    let name = name.to_uppercase();
    let (_, key_size, construct) = CATALOG
        .iter()
        .find(|(n, _, _)| *n == name)
        .ok_or_else(|| CipherError::Unsupported(name.clone()))?;

    let key = kdf(password, *key_size);
    if key.len() != *key_size {
        return Err(CipherError::KeySize(*key_size));
    }

    let cipher = construct(key.clone())?;
    Ok((cipher, key))
}

/// Stretches a password to `key_len` bytes with a chained SHA-256:
/// `b0 = H(pw)`, `bi = H(b(i-1) ‖ pw)`, output the concatenation truncated.
/// Prefix-consistent: shorter outputs are prefixes of longer ones.
pub fn kdf(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(key_len + 32);
    let mut prev = Vec::new();

    while out.len() < key_len {
        let mut hasher = Sha256::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        out.extend_from_slice(&prev);
    }

    out.truncate(key_len);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: &[&str] = &[
        "AES-128-CTR",
        "AES-192-CTR",
        "AES-256-CTR",
        "AES-128-CFB",
        "AES-192-CFB",
        "AES-256-CFB",
        "CHACHA20IETF",
        "CHACHA20X",
        "RC4-128",
        "RC4-256",
        "DUMMY",
    ];

    #[test]
    fn kdf_is_prefix_consistent() {
        let long = kdf(b"password", 256);
        for len in [0, 1, 16, 24, 32, 33, 64, 128, 255] {
            assert_eq!(kdf(b"password", len), long[..len]);
        }
        assert_ne!(kdf(b"password", 32), kdf(b"passworD", 32));
    }

    #[test]
    fn every_cipher_round_trips() {
        for name in NAMES {
            let (cipher, key) = pick_cipher(name, b"a shared password").unwrap();
            let iv = kdf(b"an iv seed", cipher.iv_size());

            let mut enc = cipher.encrypter(&iv);
            let mut dec = cipher.decrypter(&iv);

            let plain: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
            let mut buf = plain.clone();

            // Apply in uneven chunks to exercise keystream continuation.
            for chunk in buf.chunks_mut(733) {
                enc.apply(chunk);
            }
            if *name != "DUMMY" {
                assert_ne!(buf, plain, "{} left the buffer unchanged", name);
            }
            for chunk in buf.chunks_mut(733) {
                dec.apply(chunk);
            }
            assert_eq!(buf, plain, "{} did not round-trip", name);
        }
    }

    #[test]
    fn dummy_swaps_nibbles() {
        let (cipher, _) = pick_cipher("dummy", b"12345678").unwrap();
        assert_eq!(cipher.iv_size(), 0);

        let mut buf = [0x12u8, 0xab, 0xf0];
        cipher.encrypter(&[]).apply(&mut buf);
        assert_eq!(buf, [0x21, 0xba, 0x0f]);
        cipher.decrypter(&[]).apply(&mut buf);
        assert_eq!(buf, [0x12, 0xab, 0xf0]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(pick_cipher("aes-128-ctr", b"pw").is_ok());
        assert!(pick_cipher("ChaCha20Ietf", b"pw").is_ok());
    }

    #[test]
    fn unknown_cipher_is_rejected() {
        match pick_cipher("AES-512-GCM", b"pw") {
            Err(CipherError::Unsupported(name)) => assert_eq!(name, "AES-512-GCM"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn derived_keys_match_catalog_sizes() {
        for (name, size) in [("AES-192-CTR", 24), ("RC4-256", 256), ("DUMMY", 8)] {
            let (_, key) = pick_cipher(name, b"pw").unwrap();
            assert_eq!(key.len(), size);
        }
    }

    #[test]
    fn list_is_sorted_and_complete() {
        let list = list_ciphers();
        for name in NAMES {
            assert!(list.contains(name));
        }
        let names: Vec<&str> = list.split(' ').collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }
}
