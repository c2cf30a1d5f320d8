//! Game Boy Timer implementation
//!
//! The Game Boy includes a programmable timer that can generate interrupts
//! at configurable intervals. This is used by many games for timing and
//! synchronization.
//!
//! # Timer Registers
//!
//! - `$FF04 (DIV)`: Upper byte of the 16-bit divider, write resets it to 0
//! - `$FF05 (TIMA)`: Timer counter - Increments at rate specified by TAC
//! - `$FF06 (TMA)`: Timer modulo - TIMA is loaded with this value on overflow
//! - `$FF07 (TAC)`: Timer control
//!   - Bit 2: Timer enable (0=stop, 1=run)
//!   - Bits 1-0: Clock select
//!     - 00: 4096 Hz (divider bit 9)
//!     - 01: 262144 Hz (divider bit 3)
//!     - 10: 65536 Hz (divider bit 5)
//!     - 11: 16384 Hz (divider bit 7)
//!
//! # Timing
//!
//! The divider counts CPU clocks. TIMA is clocked by the falling edge of
//! `selected_bit AND enable`, so writes to DIV or TAC that drop that signal
//! produce an extra increment, as on hardware.
//!
//! On overflow TIMA reads 0 for one machine cycle; the next cycle loads TMA
//! and raises the interrupt. Writing TIMA during the zero cycle cancels the
//! reload, writing it during the reload cycle is ignored.
//!
//! The falling edge of divider bit 12 (bit 13 in double speed) clocks the
//! sound frame sequencer.

use serde::{Deserialize, Serialize};

/// CPU clocks per machine cycle
const M_CYCLE: u16 = 4;

/// What happened during one timer update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerEvents {
    /// Request the timer interrupt
    pub interrupt: bool,
    /// Clock the sound frame sequencer
    pub apu_step: bool,
}

/// Game Boy Timer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    /// Internal divider, DIV is the upper byte
    counter: u16,
    tima: u8,
    tma: u8,
    tac: u8,
    /// TIMA overflowed this machine cycle and reads 0
    overflow: bool,
    /// TMA was loaded into TIMA this machine cycle
    reloading: bool,
}

impl Timer {
    /// A timer whose divider starts at `div`
    pub fn new(div: u16) -> Self {
        Self {
            counter: div,
            ..Self::default()
        }
    }

    fn selected_bit(&self) -> u16 {
        match self.tac & 0x03 {
            0 => 1 << 9,
            1 => 1 << 3,
            2 => 1 << 5,
            _ => 1 << 7,
        }
    }

    fn timer_signal(&self) -> bool {
        self.tac & 0x04 != 0 && self.counter & self.selected_bit() != 0
    }

    fn apu_signal(&self, double_speed: bool) -> bool {
        let bit = if double_speed { 1 << 13 } else { 1 << 12 };
        self.counter & bit != 0
    }

    fn increment_tima(&mut self) {
        let (tima, overflow) = self.tima.overflowing_add(1);
        self.tima = tima;
        if overflow {
            self.overflow = true;
        }
    }

    /// Set the divider and report any falling edges it causes
    fn set_counter(&mut self, counter: u16, double_speed: bool) -> TimerEvents {
        let timer_before = self.timer_signal();
        let apu_before = self.apu_signal(double_speed);
        self.counter = counter;
        if timer_before && !self.timer_signal() {
            self.increment_tima();
        }
        TimerEvents {
            interrupt: false,
            apu_step: apu_before && !self.apu_signal(double_speed),
        }
    }

    /// Advance by one machine cycle
    pub fn tick(&mut self, double_speed: bool) -> TimerEvents {
        self.reloading = false;
        let mut interrupt = false;
        if self.overflow {
            self.overflow = false;
            self.tima = self.tma;
            self.reloading = true;
            interrupt = true;
        }
        let mut events = self.set_counter(self.counter.wrapping_add(M_CYCLE), double_speed);
        events.interrupt = interrupt;
        events
    }

    pub fn div(&self) -> u8 {
        (self.counter >> 8) as u8
    }

    pub fn read_register(&self, addr: u16) -> u8 {
        match addr {
            0xFF04 => self.div(),
            0xFF05 => self.tima,
            0xFF06 => self.tma,
            0xFF07 => self.tac | 0xF8, // Upper 5 bits always read as 1
            _ => 0xFF,
        }
    }

    pub fn write_register(&mut self, addr: u16, val: u8, double_speed: bool) -> TimerEvents {
        match addr {
            0xFF04 => return self.set_counter(0, double_speed),
            0xFF05 => {
                if self.reloading {
                    return TimerEvents::default();
                }
                self.overflow = false;
                self.tima = val;
            }
            0xFF06 => {
                self.tma = val;
                if self.reloading {
                    self.tima = val;
                }
            }
            0xFF07 => {
                let before = self.timer_signal();
                self.tac = val & 0x07;
                if before && !self.timer_signal() {
                    self.increment_tima();
                }
            }
            _ => {}
        }
        TimerEvents::default()
    }
}
