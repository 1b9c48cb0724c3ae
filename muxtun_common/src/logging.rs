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

//! Logger bootstrap shared by both binaries.
//!
//! Two sinks: stderr at the verbosity selected on the command line, and a
//! dated warn-file (`gtwarnYYYY-MM-DD.log`, append) in the working
//! directory that only ever receives warnings and errors.

use crate::system;

use std::fs::OpenOptions;
use std::io;

use log::{LevelFilter, SetLoggerError};
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode, WriteLogger};
use thiserror::Error;

/// A `LogSetupError` indicates that the logger could not be installed.
#[derive(Debug, Error)]
pub enum LogSetupError {
    /// The warn file could not be opened.
    #[error("error opening log file: {0}")]
    Io(#[from] io::Error),
    /// A logger was already installed.
    #[error("logger already set: {0}")]
    SetLogger(#[from] SetLoggerError),
}

/// Maps the numeric command line verbosity (1=warn .. 4=debug) to a filter.
pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 | 1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Installs the combined stderr + warn-file logger and returns the run tag
/// (low 16 bits of the start time in epoch milliseconds) used in the
/// `APP START` / `APP END` log lines.
pub fn init(level: u8) -> Result<u16, LogSetupError> {
    let filename = format!("gtwarn{}.log", chrono::Local::now().format("%Y-%m-%d"));
    let warnfile = OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)?;

    CombinedLogger::init(vec![
        TermLogger::new(
            level_filter(level),
            Config::default(),
            TerminalMode::Stderr,
            ColorChoice::Never,
        ),
        WriteLogger::new(LevelFilter::Warn, Config::default(), warnfile),
    ])?;

    Ok(system::now_ms() as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_mapping() {
        assert_eq!(level_filter(0), LevelFilter::Warn);
        assert_eq!(level_filter(1), LevelFilter::Warn);
        assert_eq!(level_filter(2), LevelFilter::Info);
        assert_eq!(level_filter(3), LevelFilter::Debug);
        assert_eq!(level_filter(4), LevelFilter::Trace);
        assert_eq!(level_filter(9), LevelFilter::Trace);
    }
}
