//! Programmable wave channel.
//!
//! Plays 32 4-bit samples from 16 bytes of wave RAM. The sample period is
//! `(2048 - f) * 2` clocks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveChannel {
    /// Wave RAM, two samples per byte, high nibble first
    pub ram: [u8; 16],
    /// 11-bit frequency value
    pub frequency: u16,
    /// Volume code (0 = mute, 1 = 100%, 2 = 50%, 3 = 25%)
    pub volume_code: u8,
    /// Current position in the wave table (0-31)
    position: u8,
    /// Last sample read from wave RAM
    sample: u8,
    timer: u32,
}

impl WaveChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn period(&self) -> u32 {
        (2048 - (self.frequency & 0x07FF) as u32) * 2
    }

    /// Restart playback from the first sample. The sample buffer is not
    /// refilled until the first step.
    pub fn trigger(&mut self) {
        self.position = 0;
        // Trigger adds a short startup delay before the first step
        self.timer = self.period() + 6;
    }

    pub fn advance(&mut self, mut clocks: u32) {
        while clocks >= self.timer {
            clocks -= self.timer;
            self.timer = self.period();
            self.position = self.position.wrapping_add(1) & 31;
            let byte = self.ram[(self.position >> 1) as usize];
            self.sample = if self.position & 1 == 0 { byte >> 4 } else { byte & 0x0F };
        }
        self.timer -= clocks;
    }

    /// Current 4-bit output after the volume shift
    pub fn output(&self) -> u8 {
        match self.volume_code & 3 {
            0 => 0,
            1 => self.sample,
            2 => self.sample >> 1,
            _ => self.sample >> 2,
        }
    }

    /// Byte index the channel is currently reading
    pub fn current_byte(&self) -> usize {
        (self.position as usize & 31) >> 1
    }

    pub fn reset(&mut self) {
        self.position = 0;
        self.sample = 0;
        self.timer = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plays_nibbles_in_order() {
        let mut wave = WaveChannel::new();
        wave.ram[0] = 0xAB;
        wave.ram[1] = 0xCD;
        wave.frequency = 2047; // 2-clock samples
        wave.volume_code = 1;
        wave.trigger();
        wave.advance(8); // startup delay + first step lands on position 1
        assert_eq!(wave.output(), 0x0B);
        wave.advance(2);
        assert_eq!(wave.output(), 0x0C);
        wave.advance(2);
        assert_eq!(wave.output(), 0x0D);
    }

    #[test]
    fn volume_shift() {
        let mut wave = WaveChannel::new();
        wave.ram = [0xFF; 16];
        wave.frequency = 2047;
        wave.trigger();
        wave.advance(8);
        wave.volume_code = 2;
        assert_eq!(wave.output(), 7);
        wave.volume_code = 3;
        assert_eq!(wave.output(), 3);
        wave.volume_code = 0;
        assert_eq!(wave.output(), 0);
    }
}
