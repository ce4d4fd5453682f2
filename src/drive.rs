use tracing::debug;

use crate::flux::FluxEvent;
use crate::proto::command::{AckCode, BusType};
use crate::proto::wire::DelayParams;

/// Pins that may be driven with SET_PIN.
pub const SETTABLE_PINS: [u8; 3] = [2, 4, 6];

/// Drive actuation and flux timing hardware, as seen by the engine.
///
/// Physical failures come back as the [`AckCode`] to report; the engine
/// never retries.
pub trait Drive {
    fn select(&mut self, bus: BusType, unit: u8, delays: &DelayParams);
    fn deselect(&mut self);
    fn motor(&mut self, bus: BusType, unit: u8, on: bool, delays: &DelayParams);
    /// Step the selected drive from `from` to `to`. A seek to cylinder 0
    /// steps until the track-0 sensor asserts.
    fn seek(&mut self, from: u8, to: u8, delays: &DelayParams) -> Result<(), AckCode>;
    fn set_side(&mut self, side: u8);
    fn set_pin(&mut self, pin: u8, high: bool);
    fn write_protected(&self) -> bool;

    fn start_capture(&mut self) -> Result<(), AckCode>;
    /// Next captured event, or `None` when nothing more is ready yet.
    fn poll_capture(&mut self) -> Option<FluxEvent>;
    fn stop_capture(&mut self);

    fn start_playback(&mut self) -> Result<(), AckCode>;
    fn play(&mut self, ticks: u32);
    /// True once an index pulse has passed since playback started.
    fn index_seen(&mut self) -> bool;
    fn stop_playback(&mut self);

    fn erase(&mut self, ticks: u32) -> Result<(), AckCode>;

    /// Release every line to its power-on level.
    fn reset(&mut self);
}

/// A drive and disk simulated in memory.
///
/// The disk holds one revolution of flux intervals that repeats forever,
/// with an index pulse after the last interval of each revolution.
#[derive(Debug, Clone)]
pub struct SimDrive {
    revolution: Vec<u32>,
    has_index: bool,
    trk0_ok: bool,
    write_protect: bool,
    burst: usize,

    pub selected: Option<(BusType, u8)>,
    pub motors: [bool; 3],
    pub head: u8,
    pub side: u8,
    pub pins: Vec<(u8, bool)>,

    capturing: bool,
    pos: usize,
    emitted: usize,

    playing: bool,
    played_ticks: u64,
    pub written: Vec<u32>,
    pub erased: Vec<u32>,
}

impl SimDrive {
    pub fn new(revolution: Vec<u32>) -> Self {
        Self {
            revolution,
            has_index: true,
            trk0_ok: true,
            write_protect: false,
            burst: 64,
            selected: None,
            motors: [false; 3],
            head: 0,
            side: 0,
            pins: Vec::new(),
            capturing: false,
            pos: 0,
            emitted: 0,
            playing: false,
            played_ticks: 0,
            written: Vec::new(),
            erased: Vec::new(),
        }
    }

    /// A 300 rpm revolution of 2/3/4 us cells at `sample_freq`.
    pub fn synthetic(sample_freq: u32) -> Self {
        let us = (sample_freq / 1_000_000).max(1);
        let rev_ticks = sample_freq as u64 / 5;
        let mut revolution = Vec::new();
        let mut total = 0u64;
        let mut i = 0u32;
        while total < rev_ticks {
            let t = us * (2 + (i.wrapping_mul(7) >> 1) % 3);
            revolution.push(t);
            total += t as u64;
            i += 1;
        }
        Self::new(revolution)
    }

    /// Events handed out per `poll_capture` run before it reports `None`.
    pub fn with_burst(mut self, burst: usize) -> Self {
        self.burst = burst.max(1);
        self
    }

    pub fn with_write_protect(mut self, wp: bool) -> Self {
        self.write_protect = wp;
        self
    }

    pub fn without_index(mut self) -> Self {
        self.has_index = false;
        self
    }

    pub fn without_trk0(mut self) -> Self {
        self.trk0_ok = false;
        self
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    fn revolution_ticks(&self) -> u64 {
        self.revolution.iter().map(|&t| t as u64).sum()
    }
}

impl Drive for SimDrive {
    fn select(&mut self, bus: BusType, unit: u8, _delays: &DelayParams) {
        self.selected = Some((bus, unit));
    }

    fn deselect(&mut self) {
        self.selected = None;
    }

    fn motor(&mut self, _bus: BusType, unit: u8, on: bool, _delays: &DelayParams) {
        if let Some(m) = self.motors.get_mut(unit as usize) {
            *m = on;
        }
    }

    fn seek(&mut self, from: u8, to: u8, _delays: &DelayParams) -> Result<(), AckCode> {
        if to == 0 && !self.trk0_ok {
            debug!(from, "sim: track 0 never asserted");
            return Err(AckCode::NoTrk0);
        }
        self.head = to;
        Ok(())
    }

    fn set_side(&mut self, side: u8) {
        self.side = side;
    }

    fn set_pin(&mut self, pin: u8, high: bool) {
        self.pins.push((pin, high));
    }

    fn write_protected(&self) -> bool {
        self.write_protect
    }

    fn start_capture(&mut self) -> Result<(), AckCode> {
        if !self.has_index {
            return Err(AckCode::NoIndex);
        }
        self.capturing = true;
        self.pos = 0;
        self.emitted = 0;
        Ok(())
    }

    fn poll_capture(&mut self) -> Option<FluxEvent> {
        if !self.capturing {
            return None;
        }
        if self.emitted >= self.burst {
            self.emitted = 0;
            return None;
        }
        self.emitted += 1;
        let ev = match self.revolution.get(self.pos) {
            Some(&t) => FluxEvent::Edge(t),
            None => FluxEvent::Index(0),
        };
        self.pos = (self.pos + 1) % (self.revolution.len() + 1);
        Some(ev)
    }

    fn stop_capture(&mut self) {
        self.capturing = false;
    }

    fn start_playback(&mut self) -> Result<(), AckCode> {
        if self.write_protect {
            return Err(AckCode::Wrprot);
        }
        self.playing = true;
        self.played_ticks = 0;
        self.written.clear();
        Ok(())
    }

    fn play(&mut self, ticks: u32) {
        if self.playing {
            self.written.push(ticks);
            self.played_ticks += ticks as u64;
        }
    }

    fn index_seen(&mut self) -> bool {
        self.has_index && self.played_ticks >= self.revolution_ticks()
    }

    fn stop_playback(&mut self) {
        self.playing = false;
    }

    fn erase(&mut self, ticks: u32) -> Result<(), AckCode> {
        if self.write_protect {
            return Err(AckCode::Wrprot);
        }
        self.erased.push(ticks);
        Ok(())
    }

    fn reset(&mut self) {
        self.selected = None;
        self.motors = [false; 3];
        self.side = 0;
        self.pins.clear();
        self.capturing = false;
        self.playing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_cycles_with_index_after_each_revolution() {
        let mut d = SimDrive::new(vec![10, 20]);
        d.start_capture().unwrap();
        let got: Vec<_> = (0..6).map(|_| d.poll_capture().unwrap()).collect();
        assert_eq!(
            got,
            [
                FluxEvent::Edge(10),
                FluxEvent::Edge(20),
                FluxEvent::Index(0),
                FluxEvent::Edge(10),
                FluxEvent::Edge(20),
                FluxEvent::Index(0),
            ]
        );
    }

    #[test]
    fn burst_limits_events_per_run() {
        let mut d = SimDrive::new(vec![5; 10]).with_burst(3);
        d.start_capture().unwrap();
        assert_eq!(std::iter::from_fn(|| d.poll_capture()).count(), 3);
        assert_eq!(std::iter::from_fn(|| d.poll_capture()).count(), 3);
        d.stop_capture();
        assert_eq!(d.poll_capture(), None);
    }

    #[test]
    fn missing_index_and_trk0() {
        let mut d = SimDrive::new(vec![5]).without_index().without_trk0();
        assert_eq!(d.start_capture(), Err(AckCode::NoIndex));
        let delays = DelayParams::default();
        assert_eq!(d.seek(3, 0, &delays), Err(AckCode::NoTrk0));
        assert_eq!(d.seek(0, 3, &delays), Ok(()));
        assert_eq!(d.head, 3);
    }

    #[test]
    fn playback_reports_index_after_one_revolution() {
        let mut d = SimDrive::new(vec![100, 100]);
        d.start_playback().unwrap();
        d.play(150);
        assert!(!d.index_seen());
        d.play(50);
        assert!(d.index_seen());
        assert_eq!(d.written, [150, 50]);
    }

    #[test]
    fn synthetic_track_spans_a_revolution() {
        let d = SimDrive::synthetic(72_000_000);
        assert!(d.revolution_ticks() >= 72_000_000 / 5);
        assert!(d.revolution.iter().all(|&t| (144..=288).contains(&t)));
    }
}
