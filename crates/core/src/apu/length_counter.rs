//! Length counter used by all four Game Boy sound channels.
//!
//! Counts up from the written length to the channel maximum (64, or 256 for
//! the wave channel) at 256 Hz while enabled; reaching the maximum silences
//! the channel.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthCounter {
    /// 64 or 256
    max: u16,
    /// Remaining ticks before expiry
    remaining: u16,
    /// NRx4 bit 6
    enabled: bool,
}

impl LengthCounter {
    pub fn new(max: u16) -> Self {
        Self {
            max,
            remaining: 0,
            enabled: false,
        }
    }

    /// Write the length field of NRx1
    pub fn load(&mut self, length: u8) {
        self.remaining = self.max - (length as u16 & (self.max - 1));
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn remaining(&self) -> u16 {
        self.remaining
    }

    /// Update the enable bit. Enabling during a frame-sequencer half that
    /// does not clock lengths takes an extra tick. Returns true when that
    /// tick expires the counter.
    pub fn set_enabled(&mut self, enabled: bool, next_step_clocks_length: bool) -> bool {
        let was_enabled = self.enabled;
        self.enabled = enabled;
        if enabled && !was_enabled && !next_step_clocks_length && self.remaining > 0 {
            self.remaining -= 1;
            return self.remaining == 0;
        }
        false
    }

    /// Reload on trigger when already expired; the extra-tick rule applies
    /// to the reload as well.
    pub fn trigger(&mut self, next_step_clocks_length: bool) {
        if self.remaining == 0 {
            self.remaining = self.max;
            if self.enabled && !next_step_clocks_length {
                self.remaining -= 1;
            }
        }
    }

    /// Frame-sequencer length step. Returns true when the counter expires.
    pub fn clock(&mut self) -> bool {
        if self.enabled && self.remaining > 0 {
            self.remaining -= 1;
            return self.remaining == 0;
        }
        false
    }

    pub fn clear(&mut self) {
        self.remaining = 0;
        self.enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_after_written_length() {
        let mut lc = LengthCounter::new(64);
        lc.load(60);
        lc.set_enabled(true, true);
        assert!(!lc.clock());
        assert!(!lc.clock());
        assert!(!lc.clock());
        assert!(lc.clock());
        assert_eq!(lc.remaining(), 0);
        assert!(!lc.clock());
    }

    #[test]
    fn disabled_counter_holds() {
        let mut lc = LengthCounter::new(256);
        lc.load(0);
        assert_eq!(lc.remaining(), 256);
        lc.clock();
        assert_eq!(lc.remaining(), 256);
    }

    #[test]
    fn enabling_in_off_half_takes_extra_tick() {
        let mut lc = LengthCounter::new(64);
        lc.load(63);
        assert!(lc.set_enabled(true, false));
        assert_eq!(lc.remaining(), 0);
    }

    #[test]
    fn trigger_reloads_only_when_expired() {
        let mut lc = LengthCounter::new(64);
        lc.load(10);
        lc.trigger(true);
        assert_eq!(lc.remaining(), 54);

        lc.clear();
        lc.trigger(true);
        assert_eq!(lc.remaining(), 64);

        lc.clear();
        lc.set_enabled(true, true);
        lc.trigger(false);
        assert_eq!(lc.remaining(), 63);
    }
}
