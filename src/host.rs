//! Host side of the protocol: drives a device over any byte port.

use std::io::{self, Read, Write};
use std::time::Duration;

use bytes::Buf;
use thiserror::Error;
use tracing::debug;

use crate::flux::{FluxDecoder, FluxError, FluxEvent, FluxToken};
use crate::proto::command::*;
use crate::proto::framer::CommandPacket;
use crate::proto::wire::{BwStats, DelayParams, DeviceInfo, WireError};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("{cmd} failed: {ack}")]
    Ack { cmd: &'static str, ack: AckCode },
    #[error("invalid ack byte 0x{0:02x}")]
    BadAck(u8),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("flux stream: {0}")]
    Flux(#[from] FluxError),
}

/// A byte port with a settable line baud, which carries the control channel.
pub trait HostPort: Read + Write {
    fn set_baud(&mut self, baud: u32) -> io::Result<()>;
}

/// How long the clear-comms baud is held before the normal baud returns.
/// Must exceed the longest gap between two device polls.
pub const CLEAR_COMMS_HOLD: Duration = Duration::from_millis(20);

pub struct Host<P: HostPort> {
    port: P,
    buf: Vec<u8>,
    pos: usize,
    clear_hold: Duration,
}

impl<P: HostPort> Host<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            buf: Vec::with_capacity(4096),
            pos: 0,
            clear_hold: CLEAR_COMMS_HOLD,
        }
    }

    pub fn with_clear_hold(mut self, hold: Duration) -> Self {
        self.clear_hold = hold;
        self
    }

    pub fn into_inner(self) -> P {
        self.port
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        if self.pos == self.buf.len() {
            self.buf.resize(4096, 0);
            let n = self.port.read(&mut self.buf)?;
            if n == 0 {
                self.buf.clear();
                self.pos = 0;
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.buf.truncate(n);
            self.pos = 0;
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        (0..n).map(|_| self.read_byte()).collect()
    }

    fn read_ack(&mut self, cmd: &'static str) -> Result<(), HostError> {
        let b = self.read_byte()?;
        let ack = AckCode::try_from(b).map_err(HostError::BadAck)?;
        match ack {
            AckCode::Okay => Ok(()),
            ack => Err(HostError::Ack { cmd, ack }),
        }
    }

    /// Send one command and check its ack. Any response payload is left
    /// unread for the caller.
    pub fn command(&mut self, opcode: u8, args: &[u8]) -> Result<(), HostError> {
        let pkt = CommandPacket::new(opcode, args);
        debug!(cmd = opcode_name(opcode), len = pkt.declared_len(), "host send");
        self.port.write_all(pkt.as_bytes())?;
        self.port.flush()?;
        self.read_ack(opcode_name(opcode))
    }

    pub fn get_info(&mut self) -> Result<DeviceInfo, HostError> {
        self.command(CMD_GET_INFO, &[GETINFO_FIRMWARE])?;
        let raw = self.read_bytes(INFO_RESPONSE_LEN)?;
        Ok(DeviceInfo::parse(&raw)?)
    }

    pub fn get_bw_stats(&mut self) -> Result<BwStats, HostError> {
        self.command(CMD_GET_INFO, &[GETINFO_BW_STATS])?;
        let raw = self.read_bytes(INFO_RESPONSE_LEN)?;
        Ok(BwStats::parse(&raw)?)
    }

    pub fn reset(&mut self) -> Result<(), HostError> {
        self.command(CMD_RESET, &[])
    }

    pub fn set_bus_type(&mut self, bus: BusType) -> Result<(), HostError> {
        self.command(CMD_SET_BUS_TYPE, &[bus.as_byte()])
    }

    pub fn select(&mut self, unit: u8) -> Result<(), HostError> {
        self.command(CMD_SELECT, &[unit])
    }

    pub fn deselect(&mut self) -> Result<(), HostError> {
        self.command(CMD_DESELECT, &[])
    }

    pub fn motor(&mut self, unit: u8, on: bool) -> Result<(), HostError> {
        self.command(CMD_MOTOR, &[unit, on as u8])
    }

    pub fn seek(&mut self, cyl: u8) -> Result<(), HostError> {
        self.command(CMD_SEEK, &[cyl])
    }

    pub fn side(&mut self, side: u8) -> Result<(), HostError> {
        self.command(CMD_SIDE, &[side])
    }

    pub fn get_delays(&mut self) -> Result<DelayParams, HostError> {
        self.command(CMD_GET_PARAMS, &[PARAMS_DELAYS, DelayParams::WIRE_LEN as u8])?;
        let raw = self.read_bytes(DelayParams::WIRE_LEN)?;
        Ok(DelayParams::parse(&raw)?)
    }

    pub fn set_delays(&mut self, delays: &DelayParams) -> Result<(), HostError> {
        let mut args = bytes::BytesMut::with_capacity(1 + DelayParams::WIRE_LEN);
        args.extend_from_slice(&[PARAMS_DELAYS]);
        delays.put(&mut args);
        self.command(CMD_SET_PARAMS, &args)
    }

    pub fn flux_status(&mut self) -> Result<(), HostError> {
        self.command(CMD_GET_FLUX_STATUS, &[])
    }

    /// Capture `nr_idx` revolutions and return the decoded events.
    pub fn read_flux(&mut self, nr_idx: u8) -> Result<Vec<FluxEvent>, HostError> {
        self.command(CMD_READ_FLUX, &[nr_idx])?;
        let mut dec = FluxDecoder::new();
        let mut events = Vec::new();
        loop {
            let b = self.read_byte()?;
            match dec.feed(b)? {
                Some(FluxToken::Event(ev)) => events.push(ev),
                Some(FluxToken::End) => break,
                None => {}
            }
        }
        self.flux_status()?;
        Ok(events)
    }

    /// Index pulse timestamps of the last capture, in sample ticks.
    pub fn index_times(&mut self, first: u8, nr: u8) -> Result<Vec<u32>, HostError> {
        self.command(CMD_GET_INDEX_TIMES, &[first, nr])?;
        let raw = self.read_bytes(nr as usize * 4)?;
        let mut src = &raw[..];
        Ok((0..nr).map(|_| src.get_u32_le()).collect())
    }

    /// Abort whatever the device is doing and return it to idle.
    pub fn clear_comms(&mut self) -> Result<(), HostError> {
        self.port.set_baud(BAUD_CLEAR_COMMS)?;
        if !self.clear_hold.is_zero() {
            std::thread::sleep(self.clear_hold);
        }
        self.port.set_baud(BAUD_NORMAL)?;
        self.buf.clear();
        self.pos = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Instant;

    use super::*;
    use crate::drive::SimDrive;
    use crate::engine::{Engine, EngineConfig};
    use crate::stats::ManualClock;
    use crate::transport::Loopback;

    /// Host port wired straight into an engine, which runs whenever the
    /// host waits for bytes.
    struct EngineLink {
        engine: Engine<Loopback, SimDrive, ManualClock>,
        pending: VecDeque<u8>,
    }

    impl EngineLink {
        fn new(drive: SimDrive) -> Self {
            let engine = Engine::new(
                Loopback::new(),
                drive,
                ManualClock::new(),
                EngineConfig::default(),
            );
            Self {
                engine,
                pending: VecDeque::new(),
            }
        }

        fn run(&mut self) {
            while self.engine.poll().unwrap() {}
        }
    }

    impl Read for EngineLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                self.run();
                self.pending.extend(self.engine.transport_mut().host_take());
            }
            if self.pending.is_empty() {
                return Err(io::ErrorKind::TimedOut.into());
            }
            let n = buf.len().min(self.pending.len());
            for (slot, b) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = b;
            }
            Ok(n)
        }
    }

    impl Write for EngineLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.engine.transport_mut().host_send(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl HostPort for EngineLink {
        fn set_baud(&mut self, baud: u32) -> io::Result<()> {
            self.engine.transport_mut().set_baud(baud);
            self.run();
            self.pending.clear();
            Ok(())
        }
    }

    fn host() -> Host<EngineLink> {
        Host::new(EngineLink::new(SimDrive::new(vec![120, 240, 360])))
            .with_clear_hold(Duration::ZERO)
    }

    /// Records every baud change with the time it was made.
    #[derive(Default)]
    struct BaudLog {
        changes: Vec<(u32, Instant)>,
    }

    impl Read for BaudLog {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::TimedOut.into())
        }
    }

    impl Write for BaudLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl HostPort for BaudLog {
        fn set_baud(&mut self, baud: u32) -> io::Result<()> {
            self.changes.push((baud, Instant::now()));
            Ok(())
        }
    }

    #[test]
    fn info_and_stats() {
        let mut h = host();
        let info = h.get_info().unwrap();
        assert_eq!(info.max_cmd, CMD_MAX);
        assert_eq!(info.max_index, 15);
        assert_eq!(h.get_bw_stats().unwrap(), BwStats::default());
    }

    #[test]
    fn ack_errors_surface() {
        let mut h = host();
        match h.select(0) {
            Err(HostError::Ack { cmd, ack }) => {
                assert_eq!(cmd, "SELECT");
                assert_eq!(ack, AckCode::NoBus);
            }
            other => panic!("unexpected {:?}", other),
        }
        // the link is still in step
        h.set_bus_type(BusType::Shugart).unwrap();
        h.select(2).unwrap();
    }

    #[test]
    fn delays_roundtrip() {
        let mut h = host();
        let d = DelayParams {
            select_delay: 1,
            step_delay: 2,
            seek_settle: 3,
            motor_delay: 4,
            auto_off: 5,
        };
        h.set_delays(&d).unwrap();
        assert_eq!(h.get_delays().unwrap(), d);
    }

    #[test]
    fn capture_track() {
        let mut h = host();
        h.set_bus_type(BusType::IbmPc).unwrap();
        h.select(0).unwrap();
        h.motor(0, true).unwrap();
        h.seek(2).unwrap();
        h.side(1).unwrap();
        let events = h.read_flux(3).unwrap();
        let indexes = events
            .iter()
            .filter(|e| matches!(e, FluxEvent::Index(_)))
            .count();
        assert_eq!(indexes, 3);
        assert_eq!(events.len(), 12);
        assert_eq!(h.index_times(0, 3).unwrap(), [720, 1440, 2160]);
        let bw = h.get_bw_stats().unwrap();
        assert!(bw.max_bw.bytes > 0);
    }

    #[test]
    fn clear_comms_recovers_stuck_write() {
        let mut h = host();
        h.set_bus_type(BusType::IbmPc).unwrap();
        h.select(0).unwrap();
        h.command(CMD_WRITE_FLUX, &[]).unwrap();
        // half a stream, no terminator
        h.port.write_all(&[100, 0xff, 0x02, 0x03]).unwrap();
        h.clear_comms().unwrap();
        assert!(!h.port.engine.drive().is_playing());
        h.reset().unwrap();
        assert_eq!(h.get_info().unwrap().max_cmd, CMD_MAX);
    }

    #[test]
    fn clear_baud_is_held_long_enough_to_be_sampled() {
        let hold = Duration::from_millis(5);
        let mut h = Host::new(BaudLog::default()).with_clear_hold(hold);
        h.clear_comms().unwrap();
        let log = h.into_inner().changes;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, BAUD_CLEAR_COMMS);
        assert_eq!(log[1].0, BAUD_NORMAL);
        assert!(log[1].1.duration_since(log[0].1) >= hold);
    }
}
