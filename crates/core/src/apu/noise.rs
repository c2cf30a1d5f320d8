//! Noise channel linear feedback shift register.
//!
//! NR43 selects the clock: divisor code in bits 2-0, shift in bits 7-4, and
//! bit 3 narrows the register to 7 bits.

use serde::{Deserialize, Serialize};

const DIVISORS: [u32; 8] = [8, 16, 32, 48, 64, 80, 96, 112];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoiseGenerator {
    /// Raw NR43 value
    register: u8,
    lfsr: u16,
    timer: u32,
}

impl Default for NoiseGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseGenerator {
    pub fn new() -> Self {
        Self {
            register: 0,
            lfsr: 0x7FFF,
            timer: 8,
        }
    }

    pub fn write(&mut self, val: u8) {
        self.register = val;
    }

    pub fn read(&self) -> u8 {
        self.register
    }

    fn period(&self) -> u32 {
        DIVISORS[(self.register & 0x07) as usize] << (self.register >> 4)
    }

    pub fn trigger(&mut self) {
        self.lfsr = 0x7FFF;
        self.timer = self.period();
    }

    pub fn advance(&mut self, mut clocks: u32) {
        // Shift values 14 and 15 stop the clock
        if self.register >> 4 >= 14 {
            return;
        }
        while clocks >= self.timer {
            clocks -= self.timer;
            self.timer = self.period();
            self.shift();
        }
        self.timer -= clocks;
    }

    fn shift(&mut self) {
        let xor = (self.lfsr ^ (self.lfsr >> 1)) & 1;
        self.lfsr = (self.lfsr >> 1) | (xor << 14);
        if self.register & 0x08 != 0 {
            self.lfsr = (self.lfsr & !0x40) | (xor << 6);
        }
    }

    /// Output is the inverted low bit
    pub fn high(&self) -> bool {
        self.lfsr & 1 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_low_output() {
        let mut noise = NoiseGenerator::new();
        noise.trigger();
        assert!(!noise.high());
    }

    #[test]
    fn fifteen_bit_sequence_period() {
        let mut noise = NoiseGenerator::new();
        noise.write(0x00);
        noise.trigger();
        let start = noise.lfsr;
        let mut steps = 0u32;
        loop {
            noise.shift();
            steps += 1;
            if noise.lfsr == start {
                break;
            }
        }
        assert_eq!(steps, 32767);
    }

    #[test]
    fn seven_bit_sequence_period() {
        let mut noise = NoiseGenerator::new();
        noise.write(0x08);
        noise.trigger();
        // Settle into the 7-bit cycle first
        for _ in 0..16 {
            noise.shift();
        }
        let start = noise.lfsr & 0x7F;
        let mut steps = 0u32;
        loop {
            noise.shift();
            steps += 1;
            if noise.lfsr & 0x7F == start {
                break;
            }
        }
        assert_eq!(steps, 127);
    }

    #[test]
    fn divisor_and_shift_set_period() {
        let mut noise = NoiseGenerator::new();
        noise.write(0x21); // divisor 16, shift 2
        assert_eq!(noise.period(), 64);
        noise.write(0xE0);
        noise.trigger();
        let lfsr = noise.lfsr;
        noise.advance(100_000);
        assert_eq!(noise.lfsr, lfsr);
    }
}
