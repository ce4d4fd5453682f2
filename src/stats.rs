use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use crate::proto::wire::{BwSample, BwStats};

/// Microsecond time source used to time streaming transfers.
pub trait Clock {
    fn now_micros(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct MonotonicClock {
    t0: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { t0: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        self.t0.elapsed().as_micros() as u64
    }
}

/// Clock advanced by hand. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<u64>>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, usecs: u64) {
        self.0.set(self.0.get() + usecs);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.0.get()
    }
}

/// Rolling extrema of streaming throughput.
#[derive(Debug, Clone, Default)]
pub struct Bandwidth {
    stats: BwStats,
    samples: u64,
}

impl Bandwidth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> BwStats {
        self.stats
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold in one completed transfer. Empty transfers carry no rate and are
    /// ignored; a zero duration is counted as one microsecond.
    pub fn record(&mut self, bytes: u64, usecs: u64) {
        if bytes == 0 {
            return;
        }
        let s = BwSample {
            bytes: bytes.min(u32::MAX as u64) as u32,
            usecs: usecs.clamp(1, u32::MAX as u64) as u32,
        };
        if self.samples == 0 {
            self.stats.min_bw = s;
            self.stats.max_bw = s;
        } else {
            if slower(s, self.stats.min_bw) {
                self.stats.min_bw = s;
            }
            if slower(self.stats.max_bw, s) {
                self.stats.max_bw = s;
            }
        }
        self.samples += 1;
    }
}

// a.bytes / a.usecs < b.bytes / b.usecs, without division
fn slower(a: BwSample, b: BwSample) -> bool {
    (a.bytes as u64) * (b.usecs as u64) < (b.bytes as u64) * (a.usecs as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_min_and_max_rate() {
        let mut bw = Bandwidth::new();
        bw.record(1000, 100); // 10 B/us
        bw.record(1000, 1000); // 1 B/us
        bw.record(5000, 100); // 50 B/us
        bw.record(2000, 1000);
        let s = bw.stats();
        assert_eq!(s.min_bw, BwSample { bytes: 1000, usecs: 1000 });
        assert_eq!(s.max_bw, BwSample { bytes: 5000, usecs: 100 });
        assert_eq!(bw.samples(), 4);
    }

    #[test]
    fn empty_transfers_ignored_and_reset_clears() {
        let mut bw = Bandwidth::new();
        bw.record(0, 50);
        assert_eq!(bw.samples(), 0);
        bw.record(64, 0);
        assert_eq!(bw.stats().max_bw.usecs, 1);
        bw.reset();
        assert_eq!(bw.stats(), BwStats::default());
    }
}
