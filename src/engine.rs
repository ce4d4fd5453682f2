//! The command protocol engine.
//!
//! [`Engine::poll`] does one bounded step of work: it checks the control
//! channel, then either assembles and dispatches a command or advances the
//! active stream. The embedding program calls it in a loop.

use std::collections::VecDeque;
use std::io;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::drive::Drive;
use crate::flux::{self, FLUX_END, FluxDecoder, FluxEvent, FluxToken};
use crate::proto::command::*;
use crate::proto::framer::{CommandPacket, Framer};
use crate::proto::wire::{
    BwStats, DeviceInfo, ReadFluxArgs, WriteFluxArgs, pad_info, parse_u32_arg,
};
use crate::state::DeviceState;
use crate::stats::{Bandwidth, Clock};
use crate::transport::Transport;

/// Stream output is generated only while fewer bytes than this are queued.
const OUT_HIGH_WATER: usize = 512;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport I/O: {0}")]
    Transport(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fw_major: u8,
    pub fw_minor: u8,
    pub hw_type: u16,
    /// Flux sample clock in Hz.
    pub sample_freq: u32,
    /// Highest index accepted by GET_INDEX_TIMES.
    pub max_index: u8,
    /// Captured events buffered before READ_FLUX overflows.
    pub capture_buffer: usize,
    /// Silence from the host during WRITE_FLUX before it underflows.
    pub write_starve_us: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fw_major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            fw_minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            hw_type: 1,
            sample_freq: 72_000_000,
            max_index: 15,
            capture_buffer: 4096,
            write_starve_us: 250_000,
        }
    }
}

#[derive(Debug)]
struct ReadFlux {
    nr_idx: u8,
    seen_idx: u8,
    capture: VecDeque<FluxEvent>,
    /// Ticks from capture start to the last flux edge.
    edge_time: u64,
    /// Index timestamps of this capture, kept only if it completes.
    index_times: Vec<u32>,
    finishing: Option<AckCode>,
    bytes: u64,
    started: u64,
}

#[derive(Debug)]
struct WriteFlux {
    decoder: FluxDecoder,
    terminate_at_index: bool,
    playing: bool,
    status: AckCode,
    last_rx: u64,
    bytes: u64,
    started: u64,
}

#[derive(Debug)]
enum Mode {
    Command,
    ReadFlux(ReadFlux),
    WriteFlux(WriteFlux),
    Source { remaining: u32, sent: u32, started: u64 },
    Sink { remaining: u32, received: u32, started: u64 },
}

impl Mode {
    fn name(&self) -> &'static str {
        match self {
            Mode::Command => "command",
            Mode::ReadFlux(_) => "read-flux",
            Mode::WriteFlux(_) => "write-flux",
            Mode::Source { .. } => "source",
            Mode::Sink { .. } => "sink",
        }
    }
}

type Reply = Result<Option<BytesMut>, AckCode>;

pub struct Engine<T: Transport, D: Drive, C: Clock> {
    transport: T,
    drive: D,
    clock: C,
    config: EngineConfig,

    framer: Framer,
    mode: Mode,
    out: VecDeque<u8>,

    state: DeviceState,
    bandwidth: Bandwidth,
    flux_status: AckCode,
    index_times: Vec<u32>,
    mode_request: Option<FwMode>,
    /// Name of the mode being polled, for logging while it is taken out.
    active_mode: &'static str,
}

impl<T: Transport, D: Drive, C: Clock> Engine<T, D, C> {
    pub fn new(transport: T, drive: D, clock: C, config: EngineConfig) -> Self {
        Self {
            transport,
            drive,
            clock,
            config,
            framer: Framer::new(),
            mode: Mode::Command,
            out: VecDeque::new(),
            state: DeviceState::new(),
            bandwidth: Bandwidth::new(),
            flux_status: AckCode::Okay,
            index_times: Vec::new(),
            mode_request: None,
            active_mode: "command",
        }
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            fw_major: self.config.fw_major,
            fw_minor: self.config.fw_minor,
            max_index: self.config.max_index,
            max_cmd: CMD_MAX,
            sample_freq: self.config.sample_freq,
            hw_type: self.config.hw_type,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn bandwidth(&self) -> BwStats {
        self.bandwidth.stats()
    }

    pub fn flux_status(&self) -> AckCode {
        self.flux_status
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn drive(&self) -> &D {
        &self.drive
    }

    pub fn drive_mut(&mut self) -> &mut D {
        &mut self.drive
    }

    /// Idle between commands with nothing left to send.
    pub fn is_idle(&self) -> bool {
        matches!(self.mode, Mode::Command) && self.out.is_empty() && !self.framer.in_progress()
    }

    /// A firmware mode switch requested by the host, if any.
    pub fn take_mode_request(&mut self) -> Option<FwMode> {
        self.mode_request.take()
    }

    /// Run one step. Returns whether anything happened.
    pub fn poll(&mut self) -> Result<bool, EngineError> {
        self.active_mode = self.mode.name();
        if self.check_control()? {
            return Ok(true);
        }
        let mode = std::mem::replace(&mut self.mode, Mode::Command);
        let (mut progress, next) = match mode {
            Mode::Command => (self.poll_command()?, None),
            Mode::ReadFlux(rf) => self.poll_read_flux(rf)?,
            Mode::WriteFlux(wf) => self.poll_write_flux(wf)?,
            Mode::Source {
                remaining,
                sent,
                started,
            } => self.poll_source(remaining, sent, started)?,
            Mode::Sink {
                remaining,
                received,
                started,
            } => self.poll_sink(remaining, received, started)?,
        };
        if let Some(next) = next {
            self.mode = next;
        }
        match self.drain_out()? {
            Some(n) => progress |= n > 0,
            None => progress = true,
        }
        self.transport.flush()?;
        Ok(progress)
    }

    /* -------------------- control channel -------------------- */

    fn check_control(&mut self) -> Result<bool, EngineError> {
        let Some(baud) = self.transport.control_signal()? else {
            return Ok(false);
        };
        match ControlCode::from_baud(baud) {
            ControlCode::ClearComms => {
                self.clear_comms()?;
                Ok(true)
            }
            ControlCode::Normal => {
                debug!(baud, "control channel: normal");
                Ok(false)
            }
        }
    }

    fn clear_comms(&mut self) -> Result<(), EngineError> {
        info!(mode = self.active_mode, "control channel: clear comms");
        self.drive.stop_capture();
        self.drive.stop_playback();
        self.mode = Mode::Command;
        self.framer.clear();
        self.out.clear();
        self.index_times.clear();
        self.transport.reset()?;
        self.state.reset(&mut self.drive);
        Ok(())
    }

    /// Move queued output to the transport, checking the control channel
    /// before every byte. `None` means the transfer was preempted.
    fn drain_out(&mut self) -> Result<Option<usize>, EngineError> {
        let mut n = 0;
        while let Some(&b) = self.out.front() {
            if self.check_control()? {
                return Ok(None);
            }
            if !self.transport.try_write(b)? {
                break;
            }
            self.out.pop_front();
            n += 1;
        }
        Ok(Some(n))
    }

    /* -------------------- command mode -------------------- */

    fn poll_command(&mut self) -> Result<bool, EngineError> {
        if !self.out.is_empty() {
            return Ok(false);
        }
        let mut progress = false;
        while let Some(b) = self.transport.try_read()? {
            progress = true;
            match self.framer.push(b) {
                Ok(None) => {
                    if self.check_control()? {
                        break;
                    }
                }
                Ok(Some(pkt)) => {
                    self.dispatch(&pkt);
                    break;
                }
                Err(e) => {
                    warn!("rejecting packet: {}", e);
                    self.out.push_back(AckCode::BadCommand.as_byte());
                    break;
                }
            }
        }
        Ok(progress)
    }

    /// Execute one command and queue its response.
    fn dispatch(&mut self, pkt: &CommandPacket) {
        let reply = self.handle(pkt);
        let ack = match &reply {
            Ok(_) => AckCode::Okay,
            Err(ack) => *ack,
        };
        debug!(cmd = opcode_name(pkt.opcode()), ?ack, "dispatched");
        self.out.push_back(ack.as_byte());
        if let Ok(Some(payload)) = reply {
            self.out.extend(payload.iter());
        }
    }

    fn handle(&mut self, pkt: &CommandPacket) -> Reply {
        let a = pkt.args();
        match pkt.opcode() {
            CMD_GET_INFO => self.get_info(a[0]),
            CMD_UPDATE => {
                warn!("update requested outside the bootloader");
                Err(AckCode::BadCommand)
            }
            CMD_SEEK => self.state.seek(&mut self.drive, a[0]).map(|_| None),
            CMD_SIDE => self.state.side(&mut self.drive, a[0]).map(|_| None),
            CMD_SET_PARAMS => self.state.set_params(a[0], &a[1..]).map(|_| None),
            CMD_GET_PARAMS => self.state.get_params(a[0], a[1]).map(Some),
            CMD_MOTOR => self
                .state
                .motor(&mut self.drive, a[0], a[1] != 0)
                .map(|_| None),
            CMD_READ_FLUX => self.start_read_flux(ReadFluxArgs::parse(a)),
            CMD_WRITE_FLUX => self.start_write_flux(WriteFluxArgs::parse(a)),
            CMD_GET_FLUX_STATUS => match self.flux_status {
                AckCode::Okay => Ok(None),
                status => Err(status),
            },
            CMD_GET_INDEX_TIMES => self.get_index_times(a[0], a[1]),
            CMD_SWITCH_FW_MODE => {
                let mode = FwMode::try_from(a[0]).map_err(|_| AckCode::BadCommand)?;
                info!(?mode, "firmware mode switch requested");
                self.mode_request = Some(mode);
                Ok(None)
            }
            CMD_SELECT => self.state.select(&mut self.drive, a[0]).map(|_| None),
            CMD_DESELECT => {
                self.state.deselect(&mut self.drive);
                Ok(None)
            }
            CMD_SET_BUS_TYPE => self.state.set_bus(&mut self.drive, a[0]).map(|_| None),
            CMD_SET_PIN => self.state.set_pin(&mut self.drive, a[0], a[1]).map(|_| None),
            CMD_RESET => {
                self.state.reset(&mut self.drive);
                self.bandwidth.reset();
                self.index_times.clear();
                self.flux_status = AckCode::Okay;
                Ok(None)
            }
            CMD_ERASE_FLUX => self.erase_flux(a),
            CMD_SOURCE_BYTES => {
                let nr = parse_u32_arg("gw_sink_source_bytes", a).map_err(|_| AckCode::BadCommand)?;
                if nr > 0 {
                    self.mode = Mode::Source {
                        remaining: nr,
                        sent: 0,
                        started: self.clock.now_micros(),
                    };
                }
                Ok(None)
            }
            CMD_SINK_BYTES => {
                let nr = parse_u32_arg("gw_sink_source_bytes", a).map_err(|_| AckCode::BadCommand)?;
                if nr > 0 {
                    self.mode = Mode::Sink {
                        remaining: nr,
                        received: 0,
                        started: self.clock.now_micros(),
                    };
                } else {
                    // sync byte still follows the ack
                    return Ok(Some(BytesMut::from(&[AckCode::Okay.as_byte()][..])));
                }
                Ok(None)
            }
            _ => Err(AckCode::BadCommand),
        }
    }

    fn get_info(&self, idx: u8) -> Reply {
        let mut buf = BytesMut::new();
        match idx {
            GETINFO_FIRMWARE => self.info().put(&mut buf),
            GETINFO_BW_STATS => self.bandwidth.stats().put(&mut buf),
            _ => return Err(AckCode::BadCommand),
        }
        Ok(Some(pad_info(buf)))
    }

    fn get_index_times(&self, first: u8, nr: u8) -> Reply {
        if first as usize + nr as usize > self.config.max_index as usize + 1 {
            return Err(AckCode::BadCommand);
        }
        let mut buf = BytesMut::with_capacity(nr as usize * 4);
        for i in first as usize..first as usize + nr as usize {
            buf.put_u32_le(self.index_times.get(i).copied().unwrap_or(0));
        }
        Ok(Some(buf))
    }

    fn erase_flux(&mut self, args: &[u8]) -> Reply {
        let ticks = parse_u32_arg("gw_erase_flux", args).map_err(|_| AckCode::BadCommand)?;
        self.state.require_unit()?;
        if self.drive.write_protected() {
            return Err(AckCode::Wrprot);
        }
        let res = self.drive.erase(ticks);
        self.flux_status = res.err().unwrap_or(AckCode::Okay);
        res.map(|_| None)
    }

    /* -------------------- read flux -------------------- */

    fn start_read_flux(&mut self, args: ReadFluxArgs) -> Reply {
        if args.nr_idx == 0 {
            return Err(AckCode::BadCommand);
        }
        self.state.require_unit()?;
        self.drive.start_capture()?;
        info!(nr_idx = args.nr_idx, "read flux started");
        self.index_times.clear();
        self.mode = Mode::ReadFlux(ReadFlux {
            nr_idx: args.nr_idx,
            seen_idx: 0,
            capture: VecDeque::with_capacity(self.config.capture_buffer),
            edge_time: 0,
            index_times: Vec::with_capacity(args.nr_idx as usize),
            finishing: None,
            bytes: 0,
            started: self.clock.now_micros(),
        });
        Ok(None)
    }

    fn finish_read(&mut self, rf: &mut ReadFlux, status: AckCode) {
        self.drive.stop_capture();
        rf.capture.clear();
        if status != AckCode::Okay {
            warn!(%status, "read flux aborted");
            self.out.clear();
        }
        self.out.push_back(FLUX_END);
        rf.bytes += 1;
        rf.finishing = Some(status);
    }

    fn poll_read_flux(&mut self, mut rf: ReadFlux) -> Result<(bool, Option<Mode>), EngineError> {
        let mut progress = false;

        if rf.finishing.is_none() {
            while let Some(ev) = self.drive.poll_capture() {
                progress = true;
                if rf.capture.len() >= self.config.capture_buffer {
                    self.finish_read(&mut rf, AckCode::FluxOverflow);
                    break;
                }
                rf.capture.push_back(ev);
            }
        }

        let mut enc = Vec::with_capacity(8);
        while rf.finishing.is_none() && self.out.len() < OUT_HIGH_WATER {
            let Some(ev) = rf.capture.pop_front() else {
                break;
            };
            progress = true;
            enc.clear();
            if let Err(e) = flux::encode_event(ev, &mut enc) {
                warn!("capture produced unencodable event: {}", e);
                self.finish_read(&mut rf, AckCode::FluxOverflow);
                break;
            }
            self.out.extend(enc.iter());
            rf.bytes += enc.len() as u64;
            match ev {
                FluxEvent::Edge(t) => rf.edge_time += t as u64,
                FluxEvent::Index(t) => {
                    rf.index_times.push((rf.edge_time + t as u64) as u32);
                    rf.seen_idx += 1;
                    if rf.seen_idx >= rf.nr_idx {
                        self.finish_read(&mut rf, AckCode::Okay);
                    }
                }
            }
        }

        match self.drain_out()? {
            None => return Ok((true, None)),
            Some(n) => progress |= n > 0,
        }

        if let Some(status) = rf.finishing
            && self.out.is_empty()
        {
            self.flux_status = status;
            if status == AckCode::Okay {
                self.index_times = std::mem::take(&mut rf.index_times);
            }
            self.record_bandwidth(rf.bytes, rf.started);
            info!(%status, bytes = rf.bytes, revs = rf.seen_idx, "read flux done");
            return Ok((true, None));
        }
        Ok((progress, Some(Mode::ReadFlux(rf))))
    }

    /* -------------------- write flux -------------------- */

    fn start_write_flux(&mut self, args: WriteFluxArgs) -> Reply {
        self.state.require_unit()?;
        if self.drive.write_protected() {
            return Err(AckCode::Wrprot);
        }
        self.drive.start_playback()?;
        info!(
            terminate_at_index = args.terminate_at_index,
            "write flux started"
        );
        let now = self.clock.now_micros();
        self.mode = Mode::WriteFlux(WriteFlux {
            decoder: FluxDecoder::new(),
            terminate_at_index: args.terminate_at_index,
            playing: true,
            status: AckCode::Okay,
            last_rx: now,
            bytes: 0,
            started: now,
        });
        Ok(None)
    }

    fn poll_write_flux(&mut self, mut wf: WriteFlux) -> Result<(bool, Option<Mode>), EngineError> {
        let mut progress = false;
        while let Some(b) = self.transport.try_read()? {
            progress = true;
            wf.bytes += 1;
            match wf.decoder.feed(b) {
                Ok(Some(FluxToken::Event(FluxEvent::Edge(t)))) if wf.playing => {
                    self.drive.play(t);
                    if wf.terminate_at_index && self.drive.index_seen() {
                        debug!("write flux reached index");
                        self.drive.stop_playback();
                        wf.playing = false;
                    }
                }
                Ok(Some(FluxToken::End)) => {
                    self.drive.stop_playback();
                    self.out.push_back(AckCode::Okay.as_byte());
                    self.flux_status = wf.status;
                    self.record_bandwidth(wf.bytes, wf.started);
                    info!(status = %wf.status, bytes = wf.bytes, "write flux done");
                    return Ok((true, None));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("malformed write stream: {}", e);
                    self.drive.stop_playback();
                    wf.playing = false;
                    if wf.status == AckCode::Okay {
                        wf.status = AckCode::BadCommand;
                    }
                }
            }
            if self.check_control()? {
                return Ok((true, None));
            }
        }

        let now = self.clock.now_micros();
        if progress {
            wf.last_rx = now;
        } else if wf.playing && now.saturating_sub(wf.last_rx) > self.config.write_starve_us {
            // playback is lost; the rest of the stream is still drained
            warn!(bytes = wf.bytes, "write flux underflow");
            self.drive.stop_playback();
            wf.playing = false;
            wf.status = AckCode::FluxUnderflow;
            return Ok((true, Some(Mode::WriteFlux(wf))));
        }
        Ok((progress, Some(Mode::WriteFlux(wf))))
    }

    /* -------------------- source / sink -------------------- */

    fn poll_source(
        &mut self,
        mut remaining: u32,
        mut sent: u32,
        started: u64,
    ) -> Result<(bool, Option<Mode>), EngineError> {
        let mut progress = false;
        while remaining > 0 && self.out.len() < OUT_HIGH_WATER {
            self.out.push_back(sent as u8);
            sent = sent.wrapping_add(1);
            remaining -= 1;
            progress = true;
        }
        match self.drain_out()? {
            None => return Ok((true, None)),
            Some(n) => progress |= n > 0,
        }
        if remaining == 0 && self.out.is_empty() {
            self.record_bandwidth(sent as u64, started);
            return Ok((true, None));
        }
        Ok((
            progress,
            Some(Mode::Source {
                remaining,
                sent,
                started,
            }),
        ))
    }

    fn poll_sink(
        &mut self,
        mut remaining: u32,
        mut received: u32,
        started: u64,
    ) -> Result<(bool, Option<Mode>), EngineError> {
        let mut progress = false;
        while remaining > 0 {
            let Some(_) = self.transport.try_read()? else {
                break;
            };
            remaining -= 1;
            received = received.wrapping_add(1);
            progress = true;
            if self.check_control()? {
                return Ok((true, None));
            }
        }
        if remaining == 0 {
            self.out.push_back(AckCode::Okay.as_byte());
            self.record_bandwidth(received as u64, started);
            return Ok((true, None));
        }
        Ok((
            progress,
            Some(Mode::Sink {
                remaining,
                received,
                started,
            }),
        ))
    }

    fn record_bandwidth(&mut self, bytes: u64, started: u64) {
        let usecs = self.clock.now_micros().saturating_sub(started);
        self.bandwidth.record(bytes, usecs);
    }
}
