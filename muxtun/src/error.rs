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

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tunnel secret must not be empty")]
    EmptySecret,
    #[error("no cipher \"{name}\", available: {available}")]
    UnknownCipher { name: String, available: String },

    #[error("unable to set up logging: {0}")]
    LogSetup(#[from] muxtun_common::logging::LogSetupError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
