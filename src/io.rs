//! Digital pins of the board.

use serde::{Deserialize, Serialize};

/// Number of pins the simulated board exposes.
pub const NUM_PINS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinMode {
    Input,
    InputPullup,
    Output,
}

/// Digital pin access. Levels are electrical: `true` is HIGH.
pub trait DigitalIo {
    fn set_mode(&mut self, pin: u8, mode: PinMode);
    fn write(&mut self, pin: u8, high: bool);
    fn read(&self, pin: u8) -> bool;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PinState {
    pub mode: Option<PinMode>,
    pub high: bool,
    pub writes: u32,
}

/// Pins held in memory so tests and the simulator can inspect outputs.
#[derive(Debug, Clone)]
pub struct SimulatedIo {
    pins: [PinState; NUM_PINS],
}

impl SimulatedIo {
    pub fn new() -> Self {
        Self { pins: [PinState::default(); NUM_PINS] }
    }

    pub fn pin(&self, pin: u8) -> Option<&PinState> {
        self.pins.get(usize::from(pin))
    }

    /// Drive an input pin from outside, as the attached hardware would.
    pub fn set_input(&mut self, pin: u8, high: bool) {
        if let Some(state) = self.pins.get_mut(usize::from(pin)) {
            state.high = high;
        }
    }

    pub fn is_output(&self, pin: u8) -> bool {
        self.pin(pin).is_some_and(|p| p.mode == Some(PinMode::Output))
    }
}

impl Default for SimulatedIo {
    fn default() -> Self {
        Self::new()
    }
}

impl DigitalIo for SimulatedIo {
    fn set_mode(&mut self, pin: u8, mode: PinMode) {
        if let Some(state) = self.pins.get_mut(usize::from(pin)) {
            state.mode = Some(mode);
            if mode == PinMode::InputPullup {
                state.high = true;
            }
        }
    }

    fn write(&mut self, pin: u8, high: bool) {
        if let Some(state) = self.pins.get_mut(usize::from(pin)) {
            state.high = high;
            state.writes = state.writes.wrapping_add(1);
        }
    }

    fn read(&self, pin: u8) -> bool {
        self.pin(pin).is_some_and(|p| p.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_back() {
        let mut io = SimulatedIo::new();
        io.set_mode(3, PinMode::Output);
        io.write(3, true);
        assert!(io.read(3));
        assert!(io.is_output(3));
        assert_eq!(io.pin(3).unwrap().writes, 1);
    }

    #[test]
    fn test_out_of_range_pins_are_ignored() {
        let mut io = SimulatedIo::new();
        io.write(255, true);
        assert!(!io.read(255));
        assert!(io.pin(255).is_none());
    }

    #[test]
    fn test_pullup_reads_high() {
        let mut io = SimulatedIo::new();
        io.set_mode(26, PinMode::InputPullup);
        assert!(io.read(26));
        io.set_input(26, false);
        assert!(!io.read(26));
    }
}
