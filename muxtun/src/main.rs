// muxtun is the tunnel client: it accepts local TCP connections and carries
// them through a pool of encrypted tunnels.
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

mod error;
use error::*;

use muxtun_common::cipher;
use muxtun_common::client::Client;
use muxtun_common::config::{TunnelConfig, DEFAULT_READ_TIMEOUT_SECS};
use muxtun_common::logging;
use muxtun_common::report;

use std::process;
use std::sync::Arc;

use clap::Parser;
use log::warn;
use sha2::{Digest, Sha256};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
/// Accept local TCP connections and spread them over encrypted tunnels
/// to a muxtund server.
struct Args {
    /// Address to accept user connections on.
    #[arg(short, long, default_value = "127.0.0.1:3333")]
    listen: String,
    /// Tunnel server address to dial.
    #[arg(short, long)]
    backend: String,
    /// Shared tunnel secret.
    #[arg(short, long)]
    secret: String,
    /// Stream cipher to run on the wire.
    #[arg(short, long, default_value = "DUMMY")]
    cipher: String,
    /// Number of parallel tunnels (1-3; anything else becomes 1).
    #[arg(short, long, default_value_t = 1)]
    tunnels: usize,
    /// Verify packet checksums.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    crc: bool,
    /// Log verbosity: 1=warn, 2=info, 3=debug, 4=trace.
    #[arg(long, default_value_t = 1)]
    log: u8,
}

fn main() {
    match logic() {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn logic() -> Result<()> {
    let args = Args::parse();

    if args.secret.is_empty() {
        return Err(Error::EmptySecret);
    }
    if cipher::pick_cipher(&args.cipher, &[1]).is_err() {
        return Err(Error::UnknownCipher {
            name: args.cipher,
            available: cipher::list_ciphers(),
        });
    }

    let tag = logging::init(args.log)?;
    warn!("APP START {}", tag);

    let digest = Sha256::digest(args.secret.as_bytes());
    warn!(
        "cipher: {}, secret-hash-hex: {:02x}{:02x}{:02x}",
        args.cipher, digest[0], digest[1], digest[2]
    );

    let config = Arc::new(TunnelConfig::new(
        args.secret,
        args.cipher,
        args.crc,
        DEFAULT_READ_TIMEOUT_SECS,
    ));

    let client = Arc::new(Client::new(
        args.listen,
        args.backend,
        config,
        args.tunnels,
    ));
    report::spawn_reporter(Arc::clone(&client));

    let result = client.start();
    warn!("APP END {}", tag);
    Ok(result?)
}
