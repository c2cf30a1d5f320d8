//! MBC3 real-time clock
//!
//! The clock is not ticked. It keeps a `base_time` such that
//! `now - base_time` is the number of seconds the clock has been running,
//! and the five visible registers are computed from that on latch. While
//! halted the elapsed count is frozen in `halt_time` instead.
//!
//! # Registers
//!
//! - 0x08: Seconds (0-59)
//! - 0x09: Minutes (0-59)
//! - 0x0A: Hours (0-23)
//! - 0x0B: Day counter, low 8 bits
//! - 0x0C: bit 0 day counter bit 8, bit 6 halt, bit 7 day carry

use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

const SECONDS_PER_DAY: u64 = 86_400;
/// The day counter is 9 bits wide
const DAY_WRAP: u64 = 512 * SECONDS_PER_DAY;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rtc {
    base_time: u64,
    halt_time: u64,
    halted: bool,
    day_carry: bool,
    latched: [u8; 5],
    /// Last latch-register write was 0x00
    latch_armed: bool,
    /// Current host time in seconds, refreshed by the bus before access
    #[serde(skip)]
    now: u64,
}

impl Rtc {
    /// A running clock reading zero at `now`
    pub fn new(now: u64) -> Self {
        Self {
            base_time: now,
            now,
            ..Self::default()
        }
    }

    pub fn set_now(&mut self, now: u64) {
        self.now = now;
    }

    fn elapsed(&mut self) -> u64 {
        let mut elapsed = if self.halted {
            self.halt_time
        } else {
            self.now.wrapping_sub(self.base_time)
        };
        if elapsed >= DAY_WRAP {
            let wraps = elapsed / DAY_WRAP;
            elapsed %= DAY_WRAP;
            self.day_carry = true;
            if self.halted {
                self.halt_time = elapsed;
            } else {
                self.base_time = self.base_time.wrapping_add(wraps * DAY_WRAP);
            }
        }
        elapsed
    }

    fn set_elapsed(&mut self, elapsed: u64) {
        if self.halted {
            self.halt_time = elapsed;
        } else {
            self.base_time = self.now.wrapping_sub(elapsed);
        }
    }

    /// Compute `[s, m, h, dl, dh]` for the current time
    fn current(&mut self) -> [u8; 5] {
        let elapsed = self.elapsed();
        let days = elapsed / SECONDS_PER_DAY;
        [
            (elapsed % 60) as u8,
            ((elapsed / 60) % 60) as u8,
            ((elapsed / 3600) % 24) as u8,
            days as u8,
            ((days >> 8) as u8 & 1) | ((self.halted as u8) << 6) | ((self.day_carry as u8) << 7),
        ]
    }

    /// Write to the latch register (0x6000-0x7FFF)
    pub fn write_latch(&mut self, val: u8) {
        if self.latch_armed && val == 0x01 {
            self.latched = self.current();
        }
        self.latch_armed = val == 0x00;
    }

    /// Read a latched register, `reg` in 0x08..=0x0C
    pub fn read(&self, reg: u8) -> u8 {
        match reg {
            0x08..=0x0C => self.latched[(reg - 0x08) as usize],
            _ => 0xFF,
        }
    }

    /// Write a clock register, rebasing so the new value holds from now on
    pub fn write(&mut self, reg: u8, val: u8) {
        let elapsed = self.elapsed();
        let mut secs = elapsed % 60;
        let mut mins = (elapsed / 60) % 60;
        let mut hours = (elapsed / 3600) % 24;
        let mut days = elapsed / SECONDS_PER_DAY;

        match reg {
            0x08 => secs = (val & 0x3F) as u64 % 60,
            0x09 => mins = (val & 0x3F) as u64 % 60,
            0x0A => hours = (val & 0x1F) as u64 % 24,
            0x0B => days = (days & 0x100) | val as u64,
            0x0C => {
                days = (days & 0xFF) | (((val & 1) as u64) << 8);
                self.day_carry = val & 0x80 != 0;
                let halt = val & 0x40 != 0;
                if halt != self.halted {
                    log(LogCategory::Cartridge, LogLevel::Debug, || {
                        format!("RTC {}", if halt { "halted" } else { "resumed" })
                    });
                }
                // Switch representation before storing the new elapsed count
                self.halted = halt;
            }
            _ => return,
        }

        let new_elapsed = days * SECONDS_PER_DAY + hours * 3600 + mins * 60 + secs;
        self.set_elapsed(new_elapsed);
        if let Some(slot) = self.latched.get_mut((reg - 0x08) as usize) {
            *slot = val;
        }
    }

    /// Value stored after cartridge RAM in save data
    pub fn base_time_for_save(&mut self) -> u32 {
        let elapsed = self.elapsed();
        self.now.wrapping_sub(elapsed) as u32
    }

    pub fn load_base_time(&mut self, base_time: u32) {
        self.base_time = base_time as u64;
        self.halted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latch(rtc: &mut Rtc) {
        rtc.write_latch(0);
        rtc.write_latch(1);
    }

    #[test]
    fn counts_elapsed_time() {
        let mut rtc = Rtc::new(1000);
        rtc.set_now(1000 + 2 * SECONDS_PER_DAY + 3 * 3600 + 4 * 60 + 5);
        latch(&mut rtc);
        assert_eq!(rtc.read(0x08), 5);
        assert_eq!(rtc.read(0x09), 4);
        assert_eq!(rtc.read(0x0A), 3);
        assert_eq!(rtc.read(0x0B), 2);
        assert_eq!(rtc.read(0x0C), 0);
    }

    #[test]
    fn latch_requires_zero_then_one() {
        let mut rtc = Rtc::new(0);
        rtc.set_now(10);
        rtc.write_latch(1);
        assert_eq!(rtc.read(0x08), 0);
        latch(&mut rtc);
        assert_eq!(rtc.read(0x08), 10);
        rtc.set_now(20);
        assert_eq!(rtc.read(0x08), 10);
    }

    #[test]
    fn day_overflow_sets_carry() {
        let mut rtc = Rtc::new(0);
        rtc.set_now(DAY_WRAP + SECONDS_PER_DAY + 1);
        latch(&mut rtc);
        assert_eq!(rtc.read(0x0B), 1);
        assert_eq!(rtc.read(0x0C) & 0x80, 0x80);
        assert_eq!(rtc.read(0x08), 1);
    }

    #[test]
    fn halt_freezes_time() {
        let mut rtc = Rtc::new(0);
        rtc.set_now(30);
        rtc.write(0x0C, 0x40);
        rtc.set_now(500);
        latch(&mut rtc);
        assert_eq!(rtc.read(0x08), 30);
        assert_eq!(rtc.read(0x0C), 0x40);

        rtc.write(0x0C, 0x00);
        rtc.set_now(505);
        latch(&mut rtc);
        assert_eq!(rtc.read(0x08), 35);
    }

    #[test]
    fn register_write_rebases() {
        let mut rtc = Rtc::new(0);
        rtc.set_now(100);
        rtc.write(0x0A, 5);
        rtc.set_now(110);
        latch(&mut rtc);
        assert_eq!(rtc.read(0x0A), 5);
        assert_eq!(rtc.read(0x09), 1);
        assert_eq!(rtc.read(0x08), 50);
    }

    #[test]
    fn save_base_time_roundtrip() {
        let mut rtc = Rtc::new(5000);
        rtc.set_now(5100);
        let base = rtc.base_time_for_save();
        assert_eq!(base, 5000);

        let mut restored = Rtc::new(0);
        restored.load_base_time(base);
        restored.set_now(5100);
        latch(&mut restored);
        assert_eq!(restored.read(0x09), 1);
        assert_eq!(restored.read(0x08), 40);
    }
}
