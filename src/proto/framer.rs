use thiserror::Error;

use super::command::{CMD_MAX, length_range, opcode_name};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("bad length {len} for {}", opcode_name(*.opcode))]
    BadLength { opcode: u8, len: u8 },
}

/// A complete command: `[opcode, length, args...]` with `length` counting
/// the whole packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    bytes: Vec<u8>,
}

impl CommandPacket {
    /// Build a packet from an opcode and its arguments, filling in the length.
    pub fn new(opcode: u8, args: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(2 + args.len());
        bytes.push(opcode);
        bytes.push((2 + args.len()) as u8);
        bytes.extend_from_slice(args);
        Self { bytes }
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    /// Length from the header, counting the header itself.
    pub fn declared_len(&self) -> u8 {
        self.bytes[1]
    }

    pub fn args(&self) -> &[u8] {
        &self.bytes[2..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Accumulates command bytes one at a time.
///
/// The header is validated as soon as both header bytes are in, so a bad
/// opcode or length is reported without waiting for (or consuming) a body.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(u8::MAX as usize),
        }
    }

    /// True when a partial packet is buffered.
    pub fn in_progress(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drop any partially received packet.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Feed one byte. Returns a packet once its declared length is reached.
    pub fn push(&mut self, byte: u8) -> Result<Option<CommandPacket>, FrameError> {
        self.buf.push(byte);
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let (opcode, len) = (self.buf[0], self.buf[1]);
        if self.buf.len() == 2 {
            if opcode > CMD_MAX {
                self.buf.clear();
                return Err(FrameError::UnknownOpcode(opcode));
            }
            let ok = length_range(opcode).is_some_and(|(lo, hi)| (lo..=hi).contains(&len));
            if !ok {
                self.buf.clear();
                return Err(FrameError::BadLength { opcode, len });
            }
        }
        if self.buf.len() < len as usize {
            return Ok(None);
        }
        let bytes = std::mem::take(&mut self.buf);
        Ok(Some(CommandPacket { bytes }))
    }
}
