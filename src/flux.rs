//! Flux stream wire encoding.
//!
//! ```text
//! 00                 end of stream
//! 01..=F9            interval of 1..=249 ticks
//! FA..=FE n          interval 250 + (b - 250) * 255 + n - 1   (250..=1524)
//! FF 01 <N28>        index pulse, N28 ticks after the previous flux edge
//! FF 02 <N28>        space: N28 ticks added to the next interval
//! ```
//!
//! N28 packs a 28-bit value into four bytes with bit 0 set in each, so no
//! byte after the first of a token is ever zero and `00` terminates the
//! stream wherever it appears.

use thiserror::Error;

pub const FLUX_END: u8 = 0x00;
const FLUX_OP: u8 = 0xff;
const FLUXOP_INDEX: u8 = 1;
const FLUXOP_SPACE: u8 = 2;

const SHORT_MAX: u32 = 249;
const LONG_BASE: u32 = 250;
const LONG_MAX: u32 = 1524;
pub const N28_MAX: u32 = (1 << 28) - 1;

/// Longest interval the encoding can carry.
pub const MAX_FLUX_TICKS: u32 = N28_MAX + SHORT_MAX;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FluxError {
    #[error("zero-length flux interval")]
    ZeroInterval,
    #[error("flux interval of {0} ticks exceeds encodable range")]
    TooLong(u32),
    #[error("unknown flux opcode 0x{0:02x}")]
    BadOpcode(u8),
    #[error("malformed N28 byte 0x{0:02x}")]
    BadN28(u8),
}

/// One captured or decoded flux event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxEvent {
    /// Ticks since the previous flux edge.
    Edge(u32),
    /// Index pulse, ticks since the previous flux edge.
    Index(u32),
}

/// Decoder output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxToken {
    Event(FluxEvent),
    End,
}

fn put_n28(n: u32, dst: &mut Vec<u8>) {
    dst.push(1 | (n << 1) as u8);
    dst.push(1 | (n >> 6) as u8);
    dst.push(1 | (n >> 13) as u8);
    dst.push(1 | (n >> 20) as u8);
}

/// Append the wire form of one event.
pub fn encode_event(ev: FluxEvent, dst: &mut Vec<u8>) -> Result<(), FluxError> {
    match ev {
        FluxEvent::Edge(0) => return Err(FluxError::ZeroInterval),
        FluxEvent::Edge(t) if t <= SHORT_MAX => dst.push(t as u8),
        FluxEvent::Edge(t) if t <= LONG_MAX => {
            let off = t - LONG_BASE;
            dst.push((LONG_BASE + off / 255) as u8);
            dst.push((off % 255 + 1) as u8);
        }
        FluxEvent::Edge(t) if t <= MAX_FLUX_TICKS => {
            dst.extend_from_slice(&[FLUX_OP, FLUXOP_SPACE]);
            put_n28(t - SHORT_MAX, dst);
            dst.push(SHORT_MAX as u8);
        }
        FluxEvent::Edge(t) => return Err(FluxError::TooLong(t)),
        FluxEvent::Index(t) if t <= N28_MAX => {
            dst.extend_from_slice(&[FLUX_OP, FLUXOP_INDEX]);
            put_n28(t, dst);
        }
        FluxEvent::Index(t) => return Err(FluxError::TooLong(t)),
    }
    Ok(())
}

/// Encode a whole stream including the terminator.
pub fn encode_stream(events: &[FluxEvent]) -> Result<Vec<u8>, FluxError> {
    let mut out = Vec::with_capacity(events.len() + 1);
    for &ev in events {
        encode_event(ev, &mut out)?;
    }
    out.push(FLUX_END);
    Ok(out)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum DecodeState {
    #[default]
    Idle,
    Long(u8),
    Op,
    N28 { op: u8, have: u8, val: u32 },
}

/// Byte-at-a-time stream decoder.
#[derive(Debug, Default)]
pub struct FluxDecoder {
    state: DecodeState,
    space: u32,
}

impl FluxDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no token is half-decoded and no space is pending.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Idle && self.space == 0
    }

    pub fn reset(&mut self) {
        self.state = DecodeState::Idle;
        self.space = 0;
    }

    fn edge(&mut self, t: u32) -> FluxToken {
        let t = t.saturating_add(std::mem::take(&mut self.space));
        FluxToken::Event(FluxEvent::Edge(t))
    }

    /// Feed one byte. A malformed byte resets the decoder to a token boundary.
    pub fn feed(&mut self, b: u8) -> Result<Option<FluxToken>, FluxError> {
        if b == FLUX_END {
            self.reset();
            return Ok(Some(FluxToken::End));
        }
        match self.state {
            DecodeState::Idle => match b {
                1..=249 => Ok(Some(self.edge(b as u32))),
                250..=254 => {
                    self.state = DecodeState::Long(b);
                    Ok(None)
                }
                _ => {
                    self.state = DecodeState::Op;
                    Ok(None)
                }
            },
            DecodeState::Long(hi) => {
                self.state = DecodeState::Idle;
                let t = LONG_BASE + (hi as u32 - LONG_BASE) * 255 + b as u32 - 1;
                Ok(Some(self.edge(t)))
            }
            DecodeState::Op => match b {
                FLUXOP_INDEX | FLUXOP_SPACE => {
                    self.state = DecodeState::N28 {
                        op: b,
                        have: 0,
                        val: 0,
                    };
                    Ok(None)
                }
                _ => {
                    self.reset();
                    Err(FluxError::BadOpcode(b))
                }
            },
            DecodeState::N28 { op, have, val } => {
                if b & 1 == 0 {
                    self.reset();
                    return Err(FluxError::BadN28(b));
                }
                let val = val | ((b as u32) >> 1) << (7 * have as u32);
                if have < 3 {
                    self.state = DecodeState::N28 {
                        op,
                        have: have + 1,
                        val,
                    };
                    return Ok(None);
                }
                self.state = DecodeState::Idle;
                if op == FLUXOP_INDEX {
                    Ok(Some(FluxToken::Event(FluxEvent::Index(val))))
                } else {
                    self.space = self.space.saturating_add(val);
                    Ok(None)
                }
            }
        }
    }
}

/// Decode a complete stream. Returns the events and the number of bytes
/// consumed up to and including the terminator, or `None` for the count if
/// the input ran out first.
pub fn decode_stream(bytes: &[u8]) -> Result<(Vec<FluxEvent>, Option<usize>), FluxError> {
    let mut dec = FluxDecoder::new();
    let mut events = Vec::new();
    for (i, &b) in bytes.iter().enumerate() {
        match dec.feed(b)? {
            Some(FluxToken::Event(ev)) => events.push(ev),
            Some(FluxToken::End) => return Ok((events, Some(i + 1))),
            None => {}
        }
    }
    Ok((events, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_intervals_roundtrip() {
        let ticks = [
            1,
            SHORT_MAX,
            LONG_BASE,
            LONG_BASE + 254,
            LONG_BASE + 255,
            LONG_MAX,
            LONG_MAX + 1,
            72_000_000,
            MAX_FLUX_TICKS,
        ];
        let events: Vec<_> = ticks.iter().map(|&t| FluxEvent::Edge(t)).collect();
        let bytes = encode_stream(&events).unwrap();
        let (decoded, used) = decode_stream(&bytes).unwrap();
        assert_eq!(decoded, events);
        assert_eq!(used, Some(bytes.len()));
    }

    #[test]
    fn every_short_and_long_interval_roundtrips() {
        let events: Vec<_> = (1..=3000).map(FluxEvent::Edge).collect();
        let bytes = encode_stream(&events).unwrap();
        assert_eq!(bytes.iter().filter(|&&b| b == FLUX_END).count(), 1);
        let (decoded, used) = decode_stream(&bytes).unwrap();
        assert_eq!(decoded, events);
        assert_eq!(used, Some(bytes.len()));
    }

    #[test]
    fn stride_across_space_range_roundtrips() {
        let stride = 65_521;
        let mut ticks: Vec<u32> = (LONG_MAX + 1..=MAX_FLUX_TICKS).step_by(stride).collect();
        ticks.push(MAX_FLUX_TICKS);
        let mut events = Vec::with_capacity(ticks.len() * 2);
        for &t in &ticks {
            events.push(FluxEvent::Edge(t));
            events.push(FluxEvent::Index(t % (N28_MAX + 1)));
        }
        let bytes = encode_stream(&events).unwrap();
        assert!(bytes[..bytes.len() - 1].iter().all(|&b| b != FLUX_END));
        assert_eq!(decode_stream(&bytes).unwrap().0, events);
    }

    #[test]
    fn byte_costs_escalate() {
        let mut out = Vec::new();
        encode_event(FluxEvent::Edge(100), &mut out).unwrap();
        assert_eq!(out, [100]);
        out.clear();
        encode_event(FluxEvent::Edge(LONG_MAX), &mut out).unwrap();
        assert_eq!(out, [254, 255]);
        out.clear();
        encode_event(FluxEvent::Edge(LONG_MAX + 1), &mut out).unwrap();
        assert_eq!(out.len(), 7);
        assert!(out[1..].iter().all(|&b| b != FLUX_END));
    }

    #[test]
    fn index_marker_between_edges() {
        let events = [
            FluxEvent::Edge(80),
            FluxEvent::Index(0),
            FluxEvent::Edge(300),
            FluxEvent::Index(N28_MAX),
        ];
        let bytes = encode_stream(&events).unwrap();
        assert_eq!(decode_stream(&bytes).unwrap().0, events);
    }

    #[test]
    fn producer_rejects_unencodable_intervals() {
        let mut out = Vec::new();
        assert_eq!(
            encode_event(FluxEvent::Edge(0), &mut out),
            Err(FluxError::ZeroInterval)
        );
        assert_eq!(
            encode_event(FluxEvent::Edge(MAX_FLUX_TICKS + 1), &mut out),
            Err(FluxError::TooLong(MAX_FLUX_TICKS + 1))
        );
        assert!(out.is_empty());
    }

    #[test]
    fn terminator_interrupts_partial_token() {
        let mut dec = FluxDecoder::new();
        assert_eq!(dec.feed(0xff), Ok(None));
        assert_eq!(dec.feed(FLUXOP_INDEX), Ok(None));
        assert_eq!(dec.feed(0x03), Ok(None));
        assert_eq!(dec.feed(FLUX_END), Ok(Some(FluxToken::End)));
        assert!(dec.is_idle());
        assert_eq!(
            dec.feed(42),
            Ok(Some(FluxToken::Event(FluxEvent::Edge(42))))
        );
    }

    #[test]
    fn malformed_tokens() {
        let mut dec = FluxDecoder::new();
        dec.feed(0xff).unwrap();
        assert_eq!(dec.feed(0x07), Err(FluxError::BadOpcode(0x07)));
        assert!(dec.is_idle());
        dec.feed(0xff).unwrap();
        dec.feed(FLUXOP_SPACE).unwrap();
        assert_eq!(dec.feed(0x10), Err(FluxError::BadN28(0x10)));
    }

    #[test]
    fn unterminated_stream_reports_no_end() {
        let (events, used) = decode_stream(&[5, 6, 250]).unwrap();
        assert_eq!(events, [FluxEvent::Edge(5), FluxEvent::Edge(6)]);
        assert_eq!(used, None);
    }
}
