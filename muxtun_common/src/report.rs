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

//! Lifecycle counters and the periodic status report.

use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::warn;

const REPORT_INTERVAL: Duration = Duration::from_secs(120);

/// Tracked object kinds. Each kind keeps separate create/destroy tallies so
/// leaks show up as a growing difference.
#[derive(Clone, Copy, Debug)]
pub enum Counter {
    Hub,
    Link,
    Channel,
    Thread,
    Buffer,
}

const NAMES: [&str; 5] = ["Hub", "Link", "Chan", "Thr", "Buf"];

struct Tally {
    inc: AtomicU64,
    dec: AtomicU64,
}

impl Tally {
    const fn new() -> Self {
        Self {
            inc: AtomicU64::new(0),
            dec: AtomicU64::new(0),
        }
    }
}

static TALLIES: [Tally; 5] = [
    Tally::new(),
    Tally::new(),
    Tally::new(),
    Tally::new(),
    Tally::new(),
];

/// Bumps the create (`up == true`) or destroy tally of a counter.
pub fn count(counter: Counter, up: bool) {
    let tally = &TALLIES[counter as usize];
    if up {
        tally.inc.fetch_add(1, Ordering::Relaxed);
    } else {
        tally.dec.fetch_add(1, Ordering::Relaxed);
    }
}

/// Net number of live objects of a kind.
pub fn level(counter: Counter) -> i64 {
    let tally = &TALLIES[counter as usize];
    tally.inc.load(Ordering::Relaxed) as i64 - tally.dec.load(Ordering::Relaxed) as i64
}

/// One-line summary of all tallies.
pub fn summary() -> String {
    let mut s = String::new();
    for (i, name) in NAMES.iter().enumerate() {
        let inc = TALLIES[i].inc.load(Ordering::Relaxed);
        let dec = TALLIES[i].dec.load(Ordering::Relaxed);
        let _ = write!(s, " {}_Inc:{} {}_Dec:{}", name, inc, name, dec);
    }
    s
}

/// Anything that can describe its live tunnels and links.
pub trait Status {
    /// Appends a human-readable status dump to `w`.
    fn status(&self, w: &mut dyn fmt::Write);
}

/// Spawns the reporter thread: dumps the app status and the counter summary
/// every two minutes for as long as the process lives.
pub fn spawn_reporter<A>(app: Arc<A>)
where
    A: Status + Send + Sync + 'static,
{
    thread::spawn(move || loop {
        thread::sleep(REPORT_INTERVAL);

        let mut dump = String::new();
        app.status(&mut dump);
        warn!("status: {}", dump);
        warn!("{}", summary());
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tallies_track_levels() {
        let before = level(Counter::Hub);
        count(Counter::Hub, true);
        count(Counter::Hub, true);
        count(Counter::Hub, false);
        assert_eq!(level(Counter::Hub), before + 1);
        count(Counter::Hub, false);
        assert_eq!(level(Counter::Hub), before);
    }

    #[test]
    fn summary_names_every_counter() {
        let s = summary();
        for name in NAMES {
            assert!(s.contains(&format!("{}_Inc", name)));
            assert!(s.contains(&format!("{}_Dec", name)));
        }
    }
}
