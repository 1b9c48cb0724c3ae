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

//! The framed tunnel connection.
//!
//! One TCP connection carrying length-prefixed, CRC'd, sequentially numbered
//! packets, optionally passed through per-direction XOR keystreams once the
//! handshake installed session keys. Writes from any thread are serialized
//! by the writer mutex; reads belong to a single consumer (the hub loop).

use crate::cipher::{self, Keystream};
use crate::config::TunnelConfig;
use crate::message::{self, Header, HEADER_SIZE, PACKET_SIZE};
use crate::report::{self, Counter};
use crate::{auth::AuthToken, pool, system, TunnelError};

use std::fmt;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::Rng;
use socket2::{SockRef, TcpKeepalive};

/// Bodies larger than this flush the write buffer immediately.
const FLUSH_LIMIT: usize = PACKET_SIZE * 7 / 10;

/// The auto flusher pushes buffered bytes out after this much write silence.
const FLUSH_AGE: Duration = Duration::from_millis(40);

/// Keep-alive period for tunnel sockets.
pub const TUNNEL_KEEPALIVE: Duration = Duration::from_secs(180);

/// Enables TCP keep-alive probes on a socket.
pub fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(period))
}

/// Dials `addr`, trying every resolved address until one connects within
/// `timeout`.
pub fn dial(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    use std::net::ToSocketAddrs;

    let mut last_err = None;
    for resolved in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&resolved, timeout) {
            Ok(conn) => return Ok(conn),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved")
    }))
}

struct TunnelReader {
    reader: BufReader<TcpStream>,
    dec: Option<Box<dyn Keystream>>,
    packet_id: u16,
}

struct TunnelWriter {
    writer: BufWriter<TcpStream>,
    enc: Option<Box<dyn Keystream>>,
    packet_id: u16,
    last_flush: Instant,
    /// First write failure, latched; later writes fail with it immediately.
    err: Option<io::ErrorKind>,
}

impl TunnelWriter {
    fn flush(&mut self) -> io::Result<()> {
        self.last_flush = Instant::now();
        self.writer.flush()
    }
}

/// One authenticated, encrypted, packet-framed TCP session.
pub struct Tunnel {
    stream: TcpStream,
    reader: Mutex<TunnelReader>,
    writer: Mutex<TunnelWriter>,
    running: AtomicBool,
    id: AtomicU16,
    verify_crc: bool,
    local: SocketAddr,
    peer: SocketAddr,
}

impl Tunnel {
    /// Wraps a connected socket. The idle read timeout from `config` applies
    /// from the first (handshake) packet on; ciphers are installed later via
    /// [`Tunnel::set_keys`]. Spawns the auto-flush task.
    pub fn new(stream: TcpStream, config: &TunnelConfig) -> io::Result<Arc<Self>> {
        stream.set_read_timeout(Some(config.read_timeout))?;

        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;

        let tunnel = Arc::new(Self {
            reader: Mutex::new(TunnelReader {
                reader: BufReader::with_capacity(2 * PACKET_SIZE, stream.try_clone()?),
                dec: None,
                packet_id: 0,
            }),
            writer: Mutex::new(TunnelWriter {
                writer: BufWriter::with_capacity(2 * PACKET_SIZE, stream.try_clone()?),
                enc: None,
                packet_id: 0,
                last_flush: Instant::now(),
                err: None,
            }),
            stream,
            running: AtomicBool::new(true),
            id: AtomicU16::new(0),
            verify_crc: config.verify_crc,
            local,
            peer,
        });

        tunnel.spawn_flusher();
        Ok(tunnel)
    }

    /// Short numeric tag from the session token, for log lines.
    pub fn id(&self) -> u16 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: u16) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Shuts the connection down. Idempotent; pending and future reads and
    /// writes fail.
    pub fn close(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            warn!("{} closed", self);
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    /// Installs the per-direction keystreams derived from the exchanged
    /// token. Called exactly once, after the handshake and before any
    /// payload traffic.
    pub fn set_keys(
        &self,
        token: &AuthToken,
        config: &TunnelConfig,
        from_client: bool,
    ) -> Result<(), TunnelError> {
        let (enc_secret, dec_secret) = crate::auth::session_keys(token, &config.secret, from_client);

        let (enc_cipher, enc_key) = cipher::pick_cipher(&config.cipher, &enc_secret)?;
        let enc_iv = cipher::kdf(
            &system::sha256(&system::reverse(&enc_key)),
            enc_cipher.iv_size(),
        );
        self.writer.lock().unwrap().enc = Some(enc_cipher.encrypter(&enc_iv));

        let (dec_cipher, dec_key) = cipher::pick_cipher(&config.cipher, &dec_secret)?;
        let dec_iv = cipher::kdf(
            &system::sha256(&system::reverse(&dec_key)),
            dec_cipher.iv_size(),
        );
        self.reader.lock().unwrap().dec = Some(dec_cipher.decrypter(&dec_iv));

        Ok(())
    }

    /// Frames `body` for `link_id` and writes it. Safe to call from any
    /// thread. The buffer is recycled in every outcome. Any I/O failure is
    /// latched and closes the tunnel.
    pub fn write_packet(
        &self,
        link_id: u16,
        mut body: Vec<u8>,
        force_flush: bool,
    ) -> Result<(), TunnelError> {
        let result = self.write_packet_inner(link_id, &mut body, force_flush);
        pool::recycle(body);
        result
    }

    fn write_packet_inner(
        &self,
        link_id: u16,
        body: &mut [u8],
        force_flush: bool,
    ) -> Result<(), TunnelError> {
        let mut w = self.writer.lock().unwrap();

        if let Some(kind) = w.err {
            return Err(io::Error::from(kind).into());
        }

        let header = Header::seal(w.packet_id, link_id, body);
        let mut head = header.to_bytes();
        if let Some(enc) = &mut w.enc {
            enc.apply(&mut head);
            enc.apply(body);
        }

        let framed = match w.writer.write_all(&head) {
            Ok(()) => w.writer.write_all(body),
            Err(e) => Err(e),
        };
        if let Err(e) = framed {
            w.err = Some(e.kind());
            self.close();
            return Err(e.into());
        }
        w.packet_id = w.packet_id.wrapping_add(1);

        if force_flush || body.len() > FLUSH_LIMIT {
            if let Err(e) = w.flush() {
                w.err = Some(e.kind());
                self.close();
                return Err(e.into());
            }
        }

        debug!("{} write packet {}", self, header.packet_id);
        Ok(())
    }

    /// Reads the next packet, enforcing the sequential packet id and, when
    /// enabled, header and body CRCs. Single consumer only. The body buffer
    /// comes from the pool.
    pub fn read_packet(&self) -> Result<(u16, Vec<u8>), TunnelError> {
        let mut r = self.reader.lock().unwrap();

        let mut head = [0u8; HEADER_SIZE];
        r.reader.read_exact(&mut head)?;
        if let Some(dec) = &mut r.dec {
            dec.apply(&mut head);
        }

        let header = Header::from_bytes(&head)?;
        debug!("{} read header: {:?}", self, header);

        if header.packet_id != r.packet_id {
            return Err(TunnelError::BadPacketId);
        }
        r.packet_id = r.packet_id.wrapping_add(1);

        if self.verify_crc && header.header_crc != header.checksum() {
            return Err(TunnelError::BadCrc);
        }

        let len = header.len as usize;
        if len > PACKET_SIZE {
            return Err(TunnelError::TooLarge(len));
        }

        let mut body = pool::take();
        body.resize(len, 0);

        if let Err(e) = r.reader.read_exact(&mut body) {
            pool::recycle(body);
            return Err(e.into());
        }
        if let Some(dec) = &mut r.dec {
            dec.apply(&mut body);
        }

        if self.verify_crc && message::checksum(&body) != header.data_crc {
            pool::recycle(body);
            return Err(TunnelError::BadCrc);
        }

        Ok((header.link_id, body))
    }

    /// Background task flushing buffered writes after [`FLUSH_AGE`] of
    /// silence. Ticks every 100-140 ms (per-tunnel jitter) and stops when
    /// the tunnel closes.
    fn spawn_flusher(self: &Arc<Self>) {
        let tunnel = Arc::clone(self);
        let interval = Duration::from_millis(100 + rand::thread_rng().gen_range(0..40));

        thread::spawn(move || {
            report::count(Counter::Thread, true);

            loop {
                thread::sleep(interval);
                if !tunnel.is_running() {
                    break;
                }

                let mut w = tunnel.writer.lock().unwrap();
                if w.err.is_none() && w.last_flush.elapsed() > FLUSH_AGE {
                    let _ = w.flush();
                }
            }

            report::count(Counter::Thread, false);
        });
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel({:5}, L{}, R{})", self.id(), self.local, self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;

    use std::net::TcpListener;

    fn test_config(cipher: &str) -> TunnelConfig {
        TunnelConfig::new("test secret".to_string(), cipher.to_string(), true, 60)
    }

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    fn body(bytes: &[u8]) -> Vec<u8> {
        let mut buf = pool::take();
        buf.extend_from_slice(bytes);
        buf
    }

    #[test]
    fn packets_round_trip_in_order() {
        let config = test_config("DUMMY");
        let (a, b) = stream_pair();
        let tx = Tunnel::new(a, &config).unwrap();
        let rx = Tunnel::new(b, &config).unwrap();

        for i in 0..5u16 {
            let payload = format!("packet {}", i);
            tx.write_packet(i + 1, body(payload.as_bytes()), true).unwrap();

            let (link_id, data) = rx.read_packet().unwrap();
            assert_eq!(link_id, i + 1);
            assert_eq!(data, payload.as_bytes());
            pool::recycle(data);
        }

        tx.close();
        rx.close();
    }

    #[test]
    fn encrypted_packets_round_trip() {
        for cipher in ["DUMMY", "AES-128-CTR", "AES-256-CFB", "CHACHA20IETF"] {
            let config = test_config(cipher);
            let (a, b) = stream_pair();
            let client = Tunnel::new(a, &config).unwrap();
            let server = Tunnel::new(b, &config).unwrap();

            let mut auth = Authenticator::new(&config.secret);
            auth.gen_random_token();
            let token = auth.token;

            client.set_keys(&token, &config, true).unwrap();
            server.set_keys(&token, &config, false).unwrap();

            let payload: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
            client.write_packet(9, body(&payload), true).unwrap();
            server.write_packet(4, body(b"reply"), true).unwrap();

            let (link_id, data) = server.read_packet().unwrap();
            assert_eq!((link_id, data.as_slice()), (9, payload.as_slice()), "{}", cipher);
            pool::recycle(data);

            let (link_id, data) = client.read_packet().unwrap();
            assert_eq!((link_id, data.as_slice()), (4, b"reply".as_slice()), "{}", cipher);
            pool::recycle(data);

            client.close();
            server.close();
        }
    }

    #[test]
    fn corrupted_body_is_fatal() {
        let config = test_config("DUMMY");
        let (mut a, b) = stream_pair();
        let rx = Tunnel::new(b, &config).unwrap();

        let payload = b"tamper target";
        let header = Header::seal(0, 3, payload);
        let mut wire_bytes = header.to_bytes().to_vec();
        wire_bytes.extend_from_slice(payload);
        wire_bytes[HEADER_SIZE + 2] ^= 0x01;

        a.write_all(&wire_bytes).unwrap();
        a.flush().unwrap();

        assert!(matches!(rx.read_packet(), Err(TunnelError::BadCrc)));
        rx.close();
    }

    #[test]
    fn stale_packet_id_is_fatal() {
        let config = test_config("DUMMY");
        let (mut a, b) = stream_pair();
        let rx = Tunnel::new(b, &config).unwrap();

        // packet_id 7 while the reader expects 0.
        let header = Header::seal(7, 3, b"x");
        let mut wire_bytes = header.to_bytes().to_vec();
        wire_bytes.push(b'x');
        a.write_all(&wire_bytes).unwrap();

        assert!(matches!(rx.read_packet(), Err(TunnelError::BadPacketId)));
        rx.close();
    }

    #[test]
    fn oversized_length_is_fatal() {
        let config = test_config("DUMMY");
        let (mut a, b) = stream_pair();
        let rx = Tunnel::new(b, &config).unwrap();

        let mut header = Header::seal(0, 3, b"");
        header.len = (PACKET_SIZE + 1) as u16;
        header.header_crc = header.checksum();
        a.write_all(&header.to_bytes()).unwrap();

        assert!(matches!(rx.read_packet(), Err(TunnelError::TooLarge(_))));
        rx.close();
    }

    #[test]
    fn write_error_is_latched() {
        let config = test_config("DUMMY");
        let (a, b) = stream_pair();
        let tx = Tunnel::new(a, &config).unwrap();
        drop(b);

        // Large flushed writes eventually hit the dead peer; the first error
        // is latched and the tunnel stops running.
        let mut latched = false;
        for _ in 0..64 {
            let payload = vec![0u8; PACKET_SIZE];
            let mut buf = pool::take();
            buf.extend_from_slice(&payload);
            if tx.write_packet(1, buf, true).is_err() {
                latched = true;
                break;
            }
        }

        assert!(latched);
        assert!(!tx.is_running());
        assert!(tx.write_packet(1, pool::take(), true).is_err());
    }
}
