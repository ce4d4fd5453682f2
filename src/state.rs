//! Mutable device state and the commands that change it.
//!
//! Every operation validates first and only then touches the drive, so a
//! rejected command leaves both the state and the hardware untouched.

use bytes::BytesMut;
use tracing::debug;

use crate::drive::{Drive, SETTABLE_PINS};
use crate::proto::command::{AckCode, BusType, PARAMS_DELAYS};
use crate::proto::wire::DelayParams;

const MAX_UNITS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitState {
    pub motor_on: bool,
    pub cylinder: u8,
    pub side: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub bus: BusType,
    pub selected: Option<u8>,
    pub units: [UnitState; MAX_UNITS],
    /// Requested level per entry of [`SETTABLE_PINS`]; `true` is high.
    pub pins: [bool; SETTABLE_PINS.len()],
    pub delays: DelayParams,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            bus: BusType::None,
            selected: None,
            units: [UnitState::default(); MAX_UNITS],
            pins: [true; SETTABLE_PINS.len()],
            delays: DelayParams::default(),
        }
    }
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back to power-on defaults, lines released.
    pub fn reset(&mut self, drive: &mut dyn Drive) {
        *self = Self::default();
        drive.reset();
    }

    pub fn require_unit(&self) -> Result<u8, AckCode> {
        self.selected.ok_or(AckCode::NoUnit)
    }

    pub fn current_unit(&self) -> Option<&UnitState> {
        self.selected.map(|u| &self.units[u as usize])
    }

    fn check_unit(&self, unit: u8) -> Result<(), AckCode> {
        if self.bus == BusType::None {
            return Err(AckCode::NoBus);
        }
        if unit >= self.bus.max_units() {
            return Err(AckCode::BadUnit);
        }
        Ok(())
    }

    pub fn set_bus(&mut self, drive: &mut dyn Drive, bus: u8) -> Result<(), AckCode> {
        let bus = BusType::try_from(bus).map_err(|_| AckCode::BadCommand)?;
        self.deselect(drive);
        for unit in 0..self.bus.max_units() {
            if self.units[unit as usize].motor_on {
                drive.motor(self.bus, unit, false, &self.delays);
                self.units[unit as usize].motor_on = false;
            }
        }
        debug!(?bus, "bus type set");
        self.bus = bus;
        Ok(())
    }

    pub fn select(&mut self, drive: &mut dyn Drive, unit: u8) -> Result<(), AckCode> {
        self.check_unit(unit)?;
        if self.selected != Some(unit) {
            self.deselect(drive);
            drive.select(self.bus, unit, &self.delays);
            self.selected = Some(unit);
        }
        Ok(())
    }

    pub fn deselect(&mut self, drive: &mut dyn Drive) {
        if self.selected.take().is_some() {
            drive.deselect();
        }
    }

    pub fn motor(&mut self, drive: &mut dyn Drive, unit: u8, on: bool) -> Result<(), AckCode> {
        self.check_unit(unit)?;
        drive.motor(self.bus, unit, on, &self.delays);
        self.units[unit as usize].motor_on = on;
        Ok(())
    }

    pub fn seek(&mut self, drive: &mut dyn Drive, cyl: u8) -> Result<(), AckCode> {
        let unit = self.require_unit()? as usize;
        let from = self.units[unit].cylinder;
        drive.seek(from, cyl, &self.delays)?;
        self.units[unit].cylinder = cyl;
        Ok(())
    }

    pub fn side(&mut self, drive: &mut dyn Drive, side: u8) -> Result<(), AckCode> {
        if side > 1 {
            return Err(AckCode::BadCommand);
        }
        let unit = self.require_unit()? as usize;
        drive.set_side(side);
        self.units[unit].side = side;
        Ok(())
    }

    pub fn set_pin(&mut self, drive: &mut dyn Drive, pin: u8, level: u8) -> Result<(), AckCode> {
        let slot = SETTABLE_PINS
            .iter()
            .position(|&p| p == pin)
            .ok_or(AckCode::BadPin)?;
        self.require_unit()?;
        let high = level != 0;
        drive.set_pin(pin, high);
        self.pins[slot] = high;
        Ok(())
    }

    pub fn set_params(&mut self, idx: u8, data: &[u8]) -> Result<(), AckCode> {
        if idx != PARAMS_DELAYS || data.len() != DelayParams::WIRE_LEN {
            return Err(AckCode::BadCommand);
        }
        self.delays = DelayParams::parse(data).map_err(|_| AckCode::BadCommand)?;
        Ok(())
    }

    pub fn get_params(&self, idx: u8, nr: u8) -> Result<BytesMut, AckCode> {
        if idx != PARAMS_DELAYS || nr as usize != DelayParams::WIRE_LEN {
            return Err(AckCode::BadCommand);
        }
        let mut out = BytesMut::with_capacity(DelayParams::WIRE_LEN);
        self.delays.put(&mut out);
        Ok(out)
    }
}
