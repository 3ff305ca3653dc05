//! Per-motor oscillator model.
//!
//! Each motor slot holds the canonical oscillator parameters for one robot
//! motor. Player inputs adjust them as `"<key> <value>"` text; the tick
//! serializes them into `UPDATE_OSCILLATOR` frames.

use bytes::BufMut;
use edmo_proto::{encode, Instruction};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MotorError {
    #[error("malformed motor parameter: {0:?}")]
    BadInput(String),
}

#[derive(Debug, Clone)]
pub struct Motor {
    index: u8,
    amplitude: f32,
    offset: f32,
    frequency: f32,
    phase_shift: f32,
}

impl Motor {
    pub fn new(index: u8) -> Self {
        Self {
            index,
            amplitude: 0.0,
            offset: 90.0,
            frequency: 0.0,
            phase_shift: 0.0,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    pub fn offset(&self) -> f32 {
        self.offset
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn phase_shift(&self) -> f32 {
        self.phase_shift
    }

    /// Frequency is driven globally by the session, not per-player.
    pub fn set_frequency(&mut self, value: f32) {
        self.frequency = value;
    }

    /// Adjust one parameter from a `"<key> <value>"` input. Recognized keys
    /// are `amp`, `off`, `freq` and `phb`; unrecognized keys are ignored.
    pub fn adjust_from(&mut self, input: &str) -> Result<(), MotorError> {
        let mut parts = input.splitn(2, ' ');
        let key = parts.next().unwrap_or_default().to_ascii_lowercase();
        let value: f32 = parts
            .next()
            .and_then(|raw| raw.trim().parse().ok())
            .ok_or_else(|| MotorError::BadInput(input.to_string()))?;

        match key.as_str() {
            "amp" => self.amplitude = value,
            "off" => self.offset = value,
            "freq" => self.frequency = value,
            "phb" => self.phase_shift = value,
            _ => {}
        }
        Ok(())
    }

    /// The `UPDATE_OSCILLATOR` frame carrying this motor's current state.
    pub fn as_command(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(17);
        body.put_u8(self.index);
        body.put_f32_le(self.frequency);
        body.put_f32_le(self.amplitude);
        body.put_f32_le(self.offset);
        body.put_f32_le(self.phase_shift);
        encode(Instruction::UpdateOscillator, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edmo_proto::try_parse;

    #[test]
    fn defaults() {
        let motor = Motor::new(2);
        assert_eq!(motor.index(), 2);
        assert_eq!(motor.amplitude(), 0.0);
        assert_eq!(motor.offset(), 90.0);
        assert_eq!(motor.frequency(), 0.0);
        assert_eq!(motor.phase_shift(), 0.0);
    }

    #[test]
    fn adjusts_each_recognized_key() {
        let mut motor = Motor::new(0);
        motor.adjust_from("amp 1.5").unwrap();
        motor.adjust_from("off 45").unwrap();
        motor.adjust_from("freq 0.5").unwrap();
        motor.adjust_from("phb 0.25").unwrap();
        assert_eq!(motor.amplitude(), 1.5);
        assert_eq!(motor.offset(), 45.0);
        assert_eq!(motor.frequency(), 0.5);
        assert_eq!(motor.phase_shift(), 0.25);
    }

    #[test]
    fn unknown_key_is_ignored() {
        let mut motor = Motor::new(0);
        motor.adjust_from("spin 3.0").unwrap();
        assert_eq!(motor.amplitude(), 0.0);
        assert_eq!(motor.frequency(), 0.0);
    }

    #[test]
    fn malformed_value_is_rejected() {
        let mut motor = Motor::new(0);
        assert!(motor.adjust_from("amp").is_err());
        assert!(motor.adjust_from("amp fast").is_err());
        assert_eq!(motor.amplitude(), 0.0);
    }

    #[test]
    fn command_layout_is_index_then_freq_amp_offset_phase() {
        let mut motor = Motor::new(3);
        motor.adjust_from("amp 1.0").unwrap();
        motor.adjust_from("freq 0.5").unwrap();

        let frame = motor.as_command();
        let command = try_parse(&frame);
        assert_eq!(command.instruction, Instruction::UpdateOscillator);
        assert_eq!(command.data.len(), 17);
        assert_eq!(command.data[0], 3);
        assert_eq!(f32::from_le_bytes(command.data[1..5].try_into().unwrap()), 0.5);
        assert_eq!(f32::from_le_bytes(command.data[5..9].try_into().unwrap()), 1.0);
        assert_eq!(f32::from_le_bytes(command.data[9..13].try_into().unwrap()), 90.0);
        assert_eq!(f32::from_le_bytes(command.data[13..17].try_into().unwrap()), 0.0);
    }
}
