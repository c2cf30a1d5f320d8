//! Volume envelope for the pulse and noise channels.
//!
//! Configured by an NRx2-style register: initial volume in bits 7-4,
//! direction in bit 3 (1 = louder), period in bits 2-0. Clocked at 64 Hz by
//! the frame sequencer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Raw register value
    register: u8,
    /// Current output volume (0-15)
    volume: u8,
    /// Countdown to the next volume step
    timer: u8,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, val: u8) {
        self.register = val;
    }

    pub fn read(&self) -> u8 {
        self.register
    }

    /// The channel DAC is powered whenever volume or direction is non-zero.
    pub fn dac_enabled(&self) -> bool {
        self.register & 0xF8 != 0
    }

    fn period(&self) -> u8 {
        self.register & 0x07
    }

    /// Reload volume and timer on channel trigger
    pub fn trigger(&mut self) {
        self.volume = self.register >> 4;
        self.timer = match self.period() {
            0 => 8,
            p => p,
        };
    }

    /// Frame-sequencer step 7
    pub fn clock(&mut self) {
        let period = self.period();
        if period == 0 {
            return;
        }
        self.timer = self.timer.saturating_sub(1);
        if self.timer != 0 {
            return;
        }
        self.timer = period;
        if self.register & 0x08 != 0 {
            if self.volume < 15 {
                self.volume += 1;
            }
        } else if self.volume > 0 {
            self.volume -= 1;
        }
    }

    /// Current volume (0-15)
    pub fn volume(&self) -> u8 {
        self.volume
    }
}
