//! Lightweight counters for the gateway's own packet/link activity.
//!
//! Adapted from the teacher's `Stats`/`Stat` pair (`src/stats.rs`):
//! same "enum of recordable events plus a flat counter struct" shape,
//! retargeted from VCDU/APID bookkeeping to D-Star frame and reflector
//! link bookkeeping.

use std::collections::HashMap;

pub enum Stat {
    HeaderReceived,
    AmbeFrameReceived,
    CrcFailure,
    SlowDataMalformed,
    /// A reflector link for the named module entered LINKED.
    LinkEstablished(u8),
    /// A reflector link for the named module failed or timed out.
    LinkFailed(u8),
    AprsLineQueued,
    AprsLineDropped,
}

#[derive(Default)]
pub struct Stats {
    headers: u64,
    ambe_frames: u64,
    crc_failures: u64,
    slow_data_malformed: u64,
    links_established: HashMap<u8, u64>,
    links_failed: HashMap<u8, u64>,
    aprs_queued: u64,
    aprs_dropped: u64,
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }

    pub fn record(&mut self, stat: Stat) {
        match stat {
            Stat::HeaderReceived => self.headers += 1,
            Stat::AmbeFrameReceived => self.ambe_frames += 1,
            Stat::CrcFailure => self.crc_failures += 1,
            Stat::SlowDataMalformed => self.slow_data_malformed += 1,
            Stat::LinkEstablished(module) => {
                *self.links_established.entry(module).or_insert(0) += 1;
            }
            Stat::LinkFailed(module) => {
                *self.links_failed.entry(module).or_insert(0) += 1;
            }
            Stat::AprsLineQueued => self.aprs_queued += 1,
            Stat::AprsLineDropped => self.aprs_dropped += 1,
        }
    }

    pub fn headers(&self) -> u64 {
        self.headers
    }

    pub fn crc_failures(&self) -> u64 {
        self.crc_failures
    }

    pub fn aprs_dropped(&self) -> u64 {
        self.aprs_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_kind() {
        let mut s = Stats::new();
        s.record(Stat::HeaderReceived);
        s.record(Stat::HeaderReceived);
        s.record(Stat::CrcFailure);
        assert_eq!(s.headers(), 2);
        assert_eq!(s.crc_failures(), 1);
    }

    #[test]
    fn per_module_link_counters() {
        let mut s = Stats::new();
        s.record(Stat::LinkEstablished(b'B'));
        s.record(Stat::LinkEstablished(b'B'));
        s.record(Stat::LinkFailed(b'A'));
        assert_eq!(*s.links_established.get(&b'B').unwrap(), 2);
        assert_eq!(*s.links_failed.get(&b'A').unwrap(), 1);
    }
}
