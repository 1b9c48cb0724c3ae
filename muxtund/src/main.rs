// muxtund is the tunnel server: it authenticates tunnels and mirrors each
// carried stream as a fresh connection to the configured backend.
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
use muxtun_common::config::{TunnelConfig, DEFAULT_READ_TIMEOUT_SECS};
use muxtun_common::logging;
use muxtun_common::report;
use muxtun_common::server::Server;

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::warn;
use sha2::{Digest, Sha256};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
/// Accept encrypted tunnels and mirror each carried stream to the backend.
struct Args {
    /// Address to accept tunnel connections on.
    #[arg(short, long, default_value = "127.0.0.1:3333")]
    listen: String,
    /// Backend address each link connects to.
    #[arg(short, long)]
    backend: String,
    /// Shared tunnel secret.
    #[arg(short, long)]
    secret: String,
    /// Stream cipher to run on the wire.
    #[arg(short, long, default_value = "DUMMY")]
    cipher: String,
    /// Verify packet checksums.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    crc: bool,
    /// Log verbosity: 1=warn, 2=info, 3=debug, 4=trace.
    #[arg(long, default_value_t = 1)]
    log: u8,
}

fn main() {
    match serve() {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn serve() -> Result<()> {
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

    ctrlc::set_handler(move || {
        thread::sleep(Duration::from_secs(1));
        warn!("APP END {}", tag);
        process::exit(0);
    })?;

    let config = Arc::new(TunnelConfig::new(
        args.secret,
        args.cipher,
        args.crc,
        DEFAULT_READ_TIMEOUT_SECS,
    ));

    let server = Arc::new(Server::new(&args.listen, args.backend, config)?);
    report::spawn_reporter(Arc::clone(&server));

    let result = server.start();
    warn!("APP END {}", tag);
    Ok(result?)
}
