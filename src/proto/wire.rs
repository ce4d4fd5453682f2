//! Fixed-layout little-endian structures exchanged with the host.
//!
//! Each structure is serialized field by field; nothing relies on in-memory
//! layout.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use super::command::INFO_RESPONSE_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("short {what}: need {need} bytes, got {got}")]
    Short {
        what: &'static str,
        need: usize,
        got: usize,
    },
}

fn need(what: &'static str, src: &[u8], len: usize) -> Result<(), WireError> {
    if src.len() < len {
        return Err(WireError::Short {
            what,
            need: len,
            got: src.len(),
        });
    }
    Ok(())
}

/// GET_INFO index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub fw_major: u8,
    pub fw_minor: u8,
    pub max_index: u8,
    pub max_cmd: u8,
    /// Tick rate underlying every flux time, in Hz.
    pub sample_freq: u32,
    pub hw_type: u16,
}

impl DeviceInfo {
    pub const WIRE_LEN: usize = 10;

    pub fn put(&self, dst: &mut BytesMut) {
        dst.put_u8(self.fw_major);
        dst.put_u8(self.fw_minor);
        dst.put_u8(self.max_index);
        dst.put_u8(self.max_cmd);
        dst.put_u32_le(self.sample_freq);
        dst.put_u16_le(self.hw_type);
    }

    pub fn parse(mut src: &[u8]) -> Result<Self, WireError> {
        need("gw_info", src, Self::WIRE_LEN)?;
        Ok(Self {
            fw_major: src.get_u8(),
            fw_minor: src.get_u8(),
            max_index: src.get_u8(),
            max_cmd: src.get_u8(),
            sample_freq: src.get_u32_le(),
            hw_type: src.get_u16_le(),
        })
    }
}

/// One throughput sample: `bytes` moved in `usecs` microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BwSample {
    pub bytes: u32,
    pub usecs: u32,
}

impl BwSample {
    /// Throughput in bytes per second, for display.
    pub fn bytes_per_sec(&self) -> f64 {
        if self.usecs == 0 {
            return 0.0;
        }
        self.bytes as f64 * 1_000_000.0 / self.usecs as f64
    }
}

/// GET_INFO index 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BwStats {
    pub min_bw: BwSample,
    pub max_bw: BwSample,
}

impl BwStats {
    pub const WIRE_LEN: usize = 16;

    pub fn put(&self, dst: &mut BytesMut) {
        for s in [self.min_bw, self.max_bw] {
            dst.put_u32_le(s.bytes);
            dst.put_u32_le(s.usecs);
        }
    }

    pub fn parse(mut src: &[u8]) -> Result<Self, WireError> {
        need("gw_bw_stats", src, Self::WIRE_LEN)?;
        let min_bw = BwSample {
            bytes: src.get_u32_le(),
            usecs: src.get_u32_le(),
        };
        let max_bw = BwSample {
            bytes: src.get_u32_le(),
            usecs: src.get_u32_le(),
        };
        Ok(Self { min_bw, max_bw })
    }
}

/// Drive timing policy, PARAMS_DELAYS block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayParams {
    /// usec
    pub select_delay: u16,
    /// usec
    pub step_delay: u16,
    /// msec
    pub seek_settle: u16,
    /// msec
    pub motor_delay: u16,
    /// msec
    pub auto_off: u16,
}

impl Default for DelayParams {
    fn default() -> Self {
        Self {
            select_delay: 10,
            step_delay: 3000,
            seek_settle: 15,
            motor_delay: 750,
            auto_off: 10_000,
        }
    }
}

impl DelayParams {
    pub const WIRE_LEN: usize = 10;

    pub fn put(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.select_delay);
        dst.put_u16_le(self.step_delay);
        dst.put_u16_le(self.seek_settle);
        dst.put_u16_le(self.motor_delay);
        dst.put_u16_le(self.auto_off);
    }

    pub fn parse(mut src: &[u8]) -> Result<Self, WireError> {
        need("gw_delay", src, Self::WIRE_LEN)?;
        Ok(Self {
            select_delay: src.get_u16_le(),
            step_delay: src.get_u16_le(),
            seek_settle: src.get_u16_le(),
            motor_delay: src.get_u16_le(),
            auto_off: src.get_u16_le(),
        })
    }
}

/// READ_FLUX arguments; fields missing from a short packet take defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFluxArgs {
    pub nr_idx: u8,
}

impl ReadFluxArgs {
    pub fn parse(args: &[u8]) -> Self {
        Self {
            nr_idx: args.first().copied().unwrap_or(2),
        }
    }
}

/// WRITE_FLUX arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteFluxArgs {
    pub terminate_at_index: bool,
}

impl WriteFluxArgs {
    pub fn parse(args: &[u8]) -> Self {
        Self {
            terminate_at_index: args.first().is_some_and(|&b| b != 0),
        }
    }
}

/// A single u32 LE argument: `gw_erase_flux.erase_ticks` and
/// `gw_sink_source_bytes.nr_bytes` share this shape.
pub fn parse_u32_arg(what: &'static str, mut args: &[u8]) -> Result<u32, WireError> {
    need(what, args, 4)?;
    Ok(args.get_u32_le())
}

/// Zero-pad a GET_INFO payload to its fixed response size.
pub fn pad_info(mut buf: BytesMut) -> BytesMut {
    buf.resize(INFO_RESPONSE_LEN, 0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_info_layout() {
        let info = DeviceInfo {
            fw_major: 1,
            fw_minor: 2,
            max_index: 15,
            max_cmd: 19,
            sample_freq: 72_000_000,
            hw_type: 7,
        };
        let mut buf = BytesMut::new();
        info.put(&mut buf);
        assert_eq!(
            &buf[..],
            &[1, 2, 15, 19, 0x00, 0xa2, 0x4a, 0x04, 7, 0][..]
        );
        let padded = pad_info(buf);
        assert_eq!(padded.len(), 32);
        assert_eq!(DeviceInfo::parse(&padded).unwrap(), info);
    }

    #[test]
    fn delay_params_layout() {
        let d = DelayParams::default();
        let mut buf = BytesMut::new();
        d.put(&mut buf);
        assert_eq!(buf.len(), DelayParams::WIRE_LEN);
        assert_eq!(&buf[..4], &[10, 0, 0xb8, 0x0b]);
        assert_eq!(DelayParams::parse(&buf).unwrap(), d);
    }

    #[test]
    fn short_inputs_are_rejected() {
        assert!(matches!(
            DelayParams::parse(&[0; 9]),
            Err(WireError::Short { need: 10, got: 9, .. })
        ));
        assert!(BwStats::parse(&[0; 15]).is_err());
        assert!(parse_u32_arg("gw_erase_flux", &[1, 2, 3]).is_err());
        assert_eq!(parse_u32_arg("gw_erase_flux", &[1, 0, 0, 0]).unwrap(), 1);
    }

    #[test]
    fn flux_args_defaults() {
        assert_eq!(ReadFluxArgs::parse(&[]).nr_idx, 2);
        assert_eq!(ReadFluxArgs::parse(&[5]).nr_idx, 5);
        assert!(!WriteFluxArgs::parse(&[]).terminate_at_index);
        assert!(WriteFluxArgs::parse(&[1]).terminate_at_index);
    }
}
