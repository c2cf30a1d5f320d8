//! Square wave duty generator.
//!
//! An 11-bit frequency value gives a step period of `(2048 - f) * 4` clocks;
//! eight steps make one waveform cycle.

use serde::{Deserialize, Serialize};

/// Duty patterns, one bit per step, MSB first: 12.5%, 25%, 50%, 75%
const DUTY_TABLE: [u8; 4] = [0b0000_0001, 0b1000_0001, 0b1000_0111, 0b0111_1110];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutyGenerator {
    /// Duty select (0-3)
    pub duty: u8,
    /// 11-bit frequency value
    pub frequency: u16,
    /// Current step (0-7)
    step: u8,
    /// Clocks until the next step
    timer: u32,
}

impl DutyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn period(&self) -> u32 {
        (2048 - (self.frequency & 0x07FF) as u32) * 4
    }

    /// Restart the step timer; the step position is kept
    pub fn trigger(&mut self) {
        self.timer = self.period();
    }

    /// Advance by `clocks` master clocks
    pub fn advance(&mut self, mut clocks: u32) {
        while clocks >= self.timer {
            clocks -= self.timer;
            self.timer = self.period();
            self.step = self.step.wrapping_add(1) & 7;
        }
        self.timer -= clocks;
    }

    /// Current duty output
    pub fn high(&self) -> bool {
        DUTY_TABLE[(self.duty & 3) as usize] & (0x80 >> (self.step & 7)) != 0
    }

    /// Reset step position (APU power off)
    pub fn reset_step(&mut self) {
        self.step = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifty_percent_duty_is_balanced() {
        let mut gen = DutyGenerator::new();
        gen.duty = 2;
        gen.frequency = 2047; // 4-clock steps
        gen.trigger();
        let mut high = 0;
        for _ in 0..8 {
            if gen.high() {
                high += 1;
            }
            gen.advance(4);
        }
        assert_eq!(high, 4);
    }

    #[test]
    fn step_advances_after_period() {
        let mut gen = DutyGenerator::new();
        gen.duty = 0;
        gen.frequency = 2046; // 8-clock steps
        gen.trigger();
        gen.advance(7);
        assert_eq!(gen.step, 0);
        gen.advance(1);
        assert_eq!(gen.step, 1);
        gen.advance(8 * 7);
        assert_eq!(gen.step, 0);
    }
}
