//! Frequency sweep unit for pulse channel 1.
//!
//! The unit works on a shadow copy of the 11-bit frequency and is clocked at
//! 128 Hz by the frame sequencer. Any calculation that overflows past 2047
//! disables the channel.

use serde::{Deserialize, Serialize};

/// Outcome of a sweep clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepEvent {
    None,
    /// New frequency to write back to the channel
    Update(u16),
    /// Channel must be disabled
    Overflow,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepUnit {
    /// Sweep period (0-7)
    period: u8,
    /// Subtract instead of add
    negate: bool,
    /// Shift amount (0-7)
    shift: u8,
    timer: u8,
    enabled: bool,
    shadow: u16,
    /// A subtraction happened since the last trigger
    negate_used: bool,
}

impl SweepUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// NR10 read, unused bit 7 reads as 1
    pub fn read(&self) -> u8 {
        0x80 | (self.period << 4) | ((self.negate as u8) << 3) | self.shift
    }

    /// NR10 write. Returns true when clearing the negate bit after a
    /// subtraction was used, which disables the channel.
    pub fn write(&mut self, val: u8) -> bool {
        self.period = (val >> 4) & 0x07;
        self.negate = val & 0x08 != 0;
        self.shift = val & 0x07;
        !self.negate && self.negate_used
    }

    fn calculate(&mut self) -> u16 {
        let delta = self.shadow >> self.shift;
        if self.negate {
            self.negate_used = true;
            self.shadow.wrapping_sub(delta)
        } else {
            self.shadow + delta
        }
    }

    fn reload_timer(&mut self) {
        self.timer = if self.period > 0 { self.period } else { 8 };
    }

    /// Channel trigger. Returns true when the immediate overflow check fails.
    pub fn trigger(&mut self, frequency: u16) -> bool {
        self.shadow = frequency;
        self.negate_used = false;
        self.reload_timer();
        self.enabled = self.period > 0 || self.shift > 0;
        self.shift > 0 && self.calculate() > 2047
    }

    /// Frame-sequencer sweep step
    pub fn clock(&mut self) -> SweepEvent {
        self.timer = self.timer.saturating_sub(1);
        if self.timer != 0 {
            return SweepEvent::None;
        }
        self.reload_timer();
        if !self.enabled || self.period == 0 {
            return SweepEvent::None;
        }

        let new_freq = self.calculate();
        if new_freq > 2047 {
            return SweepEvent::Overflow;
        }
        if self.shift == 0 {
            return SweepEvent::None;
        }
        self.shadow = new_freq;
        // Second check with the new shadow value, result not written back
        if self.calculate() > 2047 {
            return SweepEvent::Overflow;
        }
        SweepEvent::Update(new_freq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_increases_frequency() {
        let mut sweep = SweepUnit::new();
        sweep.write(0x11); // period 1, increase, shift 1
        assert!(!sweep.trigger(100));
        assert_eq!(sweep.clock(), SweepEvent::Update(150));
    }

    #[test]
    fn sweep_decreases_frequency() {
        let mut sweep = SweepUnit::new();
        sweep.write(0x19);
        sweep.trigger(100);
        assert_eq!(sweep.clock(), SweepEvent::Update(50));
    }

    #[test]
    fn sweep_respects_period() {
        let mut sweep = SweepUnit::new();
        sweep.write(0x31);
        sweep.trigger(100);
        assert_eq!(sweep.clock(), SweepEvent::None);
        assert_eq!(sweep.clock(), SweepEvent::None);
        assert_eq!(sweep.clock(), SweepEvent::Update(150));
    }

    #[test]
    fn overflow_on_trigger() {
        let mut sweep = SweepUnit::new();
        sweep.write(0x11);
        assert!(sweep.trigger(1500));
    }

    #[test]
    fn overflow_on_second_check() {
        let mut sweep = SweepUnit::new();
        sweep.write(0x11);
        // 1000 -> 1500 is fine, but 1500 -> 2250 overflows
        assert!(!sweep.trigger(1000));
        assert_eq!(sweep.clock(), SweepEvent::Overflow);
    }

    #[test]
    fn clearing_negate_after_use_disables() {
        let mut sweep = SweepUnit::new();
        sweep.write(0x19);
        sweep.trigger(100);
        sweep.clock();
        assert!(sweep.write(0x11));
    }

    #[test]
    fn register_readback() {
        let mut sweep = SweepUnit::new();
        sweep.write(0x7F);
        assert_eq!(sweep.read(), 0xFF);
        sweep.write(0x00);
        assert_eq!(sweep.read(), 0x80);
    }
}
