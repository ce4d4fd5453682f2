use std::fmt;

// ---- Opcodes ----
pub const CMD_GET_INFO: u8 = 0;
pub const CMD_UPDATE: u8 = 1;
pub const CMD_SEEK: u8 = 2;
pub const CMD_SIDE: u8 = 3;
pub const CMD_SET_PARAMS: u8 = 4;
pub const CMD_GET_PARAMS: u8 = 5;
pub const CMD_MOTOR: u8 = 6;
pub const CMD_READ_FLUX: u8 = 7;
pub const CMD_WRITE_FLUX: u8 = 8;
pub const CMD_GET_FLUX_STATUS: u8 = 9;
pub const CMD_GET_INDEX_TIMES: u8 = 10;
pub const CMD_SWITCH_FW_MODE: u8 = 11;
pub const CMD_SELECT: u8 = 12;
pub const CMD_DESELECT: u8 = 13;
pub const CMD_SET_BUS_TYPE: u8 = 14;
pub const CMD_SET_PIN: u8 = 15;
pub const CMD_RESET: u8 = 16;
pub const CMD_ERASE_FLUX: u8 = 17;
pub const CMD_SOURCE_BYTES: u8 = 18;
pub const CMD_SINK_BYTES: u8 = 19;
pub const CMD_MAX: u8 = 19;

// ---- GET_INFO indices ----
pub const GETINFO_FIRMWARE: u8 = 0;
pub const GETINFO_BW_STATS: u8 = 1;

// ---- Parameter blocks ----
pub const PARAMS_DELAYS: u8 = 0;

// ---- Control channel (baud-rate field) ----
pub const BAUD_NORMAL: u32 = 9600;
pub const BAUD_CLEAR_COMMS: u32 = 10000;

/// Every response payload of GET_INFO is padded to this size.
pub const INFO_RESPONSE_LEN: usize = 32;

/// Outcome byte sent in front of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckCode {
    Okay = 0,
    BadCommand = 1,
    NoIndex = 2,
    NoTrk0 = 3,
    FluxOverflow = 4,
    FluxUnderflow = 5,
    Wrprot = 6,
    NoUnit = 7,
    NoBus = 8,
    BadUnit = 9,
    BadPin = 10,
}

impl AckCode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for AckCode {
    type Error = u8;
    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Ok(match b {
            0 => AckCode::Okay,
            1 => AckCode::BadCommand,
            2 => AckCode::NoIndex,
            3 => AckCode::NoTrk0,
            4 => AckCode::FluxOverflow,
            5 => AckCode::FluxUnderflow,
            6 => AckCode::Wrprot,
            7 => AckCode::NoUnit,
            8 => AckCode::NoBus,
            9 => AckCode::BadUnit,
            10 => AckCode::BadPin,
            other => return Err(other),
        })
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AckCode::Okay => "okay",
            AckCode::BadCommand => "bad command",
            AckCode::NoIndex => "no index",
            AckCode::NoTrk0 => "track 0 not found",
            AckCode::FluxOverflow => "flux overflow",
            AckCode::FluxUnderflow => "flux underflow",
            AckCode::Wrprot => "disk is write protected",
            AckCode::NoUnit => "no drive selected",
            AckCode::NoBus => "no bus type configured",
            AckCode::BadUnit => "invalid drive unit",
            AckCode::BadPin => "invalid pin",
        })
    }
}

/// How drive-select and motor lines map onto the cable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusType {
    #[default]
    None,
    IbmPc,
    Shugart,
}

impl BusType {
    /// Number of addressable units on this bus.
    pub fn max_units(self) -> u8 {
        match self {
            BusType::None => 0,
            BusType::IbmPc => 2,
            BusType::Shugart => 3,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            BusType::None => 0,
            BusType::IbmPc => 1,
            BusType::Shugart => 2,
        }
    }
}

impl TryFrom<u8> for BusType {
    type Error = u8;
    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(BusType::None),
            1 => Ok(BusType::IbmPc),
            2 => Ok(BusType::Shugart),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwMode {
    Bootloader,
    Normal,
}

impl TryFrom<u8> for FwMode {
    type Error = u8;
    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(FwMode::Bootloader),
            1 => Ok(FwMode::Normal),
            other => Err(other),
        }
    }
}

/// Side-band code carried in the line-coding baud field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    Normal,
    ClearComms,
}

impl ControlCode {
    /// Any baud value other than the clear-comms sentinel is a no-op.
    pub fn from_baud(baud: u32) -> Self {
        if baud == BAUD_CLEAR_COMMS {
            ControlCode::ClearComms
        } else {
            ControlCode::Normal
        }
    }

    pub fn baud(self) -> u32 {
        match self {
            ControlCode::Normal => BAUD_NORMAL,
            ControlCode::ClearComms => BAUD_CLEAR_COMMS,
        }
    }
}

/// Legal total packet length (header included) for an opcode.
pub fn length_range(opcode: u8) -> Option<(u8, u8)> {
    Some(match opcode {
        CMD_GET_INFO => (3, 3),
        CMD_UPDATE => (6, 6),
        CMD_SEEK | CMD_SIDE => (3, 3),
        CMD_SET_PARAMS => (3, u8::MAX),
        CMD_GET_PARAMS | CMD_MOTOR => (4, 4),
        CMD_READ_FLUX | CMD_WRITE_FLUX => (2, 3),
        CMD_GET_FLUX_STATUS => (2, 2),
        CMD_GET_INDEX_TIMES => (4, 4),
        CMD_SWITCH_FW_MODE | CMD_SELECT => (3, 3),
        CMD_DESELECT => (2, 2),
        CMD_SET_BUS_TYPE => (3, 3),
        CMD_SET_PIN => (4, 4),
        CMD_RESET => (2, 2),
        CMD_ERASE_FLUX | CMD_SOURCE_BYTES | CMD_SINK_BYTES => (6, 6),
        _ => return None,
    })
}

pub fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        CMD_GET_INFO => "GET_INFO",
        CMD_UPDATE => "UPDATE",
        CMD_SEEK => "SEEK",
        CMD_SIDE => "SIDE",
        CMD_SET_PARAMS => "SET_PARAMS",
        CMD_GET_PARAMS => "GET_PARAMS",
        CMD_MOTOR => "MOTOR",
        CMD_READ_FLUX => "READ_FLUX",
        CMD_WRITE_FLUX => "WRITE_FLUX",
        CMD_GET_FLUX_STATUS => "GET_FLUX_STATUS",
        CMD_GET_INDEX_TIMES => "GET_INDEX_TIMES",
        CMD_SWITCH_FW_MODE => "SWITCH_FW_MODE",
        CMD_SELECT => "SELECT",
        CMD_DESELECT => "DESELECT",
        CMD_SET_BUS_TYPE => "SET_BUS_TYPE",
        CMD_SET_PIN => "SET_PIN",
        CMD_RESET => "RESET",
        CMD_ERASE_FLUX => "ERASE_FLUX",
        CMD_SOURCE_BYTES => "SOURCE_BYTES",
        CMD_SINK_BYTES => "SINK_BYTES",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_has_a_length() {
        for op in 0..=CMD_MAX {
            assert!(length_range(op).is_some(), "opcode {op}");
        }
        assert!(length_range(CMD_MAX + 1).is_none());
    }

    #[test]
    fn ack_bytes_roundtrip() {
        for b in 0..=10u8 {
            assert_eq!(AckCode::try_from(b).unwrap().as_byte(), b);
        }
        assert_eq!(AckCode::try_from(11), Err(11));
    }

    #[test]
    fn control_codes_from_baud() {
        assert_eq!(ControlCode::from_baud(BAUD_CLEAR_COMMS), ControlCode::ClearComms);
        assert_eq!(ControlCode::from_baud(BAUD_NORMAL), ControlCode::Normal);
        assert_eq!(ControlCode::from_baud(115_200), ControlCode::Normal);
    }

    #[test]
    fn bus_unit_counts() {
        assert_eq!(BusType::None.max_units(), 0);
        assert_eq!(BusType::IbmPc.max_units(), 2);
        assert_eq!(BusType::Shugart.max_units(), 3);
        assert!(BusType::try_from(3).is_err());
    }
}
