//! Interrupt controller
//!
//! Holds IE (0xFFFF) and IF (0xFF0F). The master enable flag belongs to the
//! CPU. Lower bits have higher priority.

use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    VBlank = 0,
    LcdStat = 1,
    Timer = 2,
    Serial = 3,
    Joypad = 4,
}

impl Interrupt {
    pub fn mask(self) -> u8 {
        1 << self as u8
    }

    pub fn vector(self) -> u16 {
        0x40 + (self as u16) * 8
    }

    pub fn from_bit(bit: u8) -> Option<Self> {
        match bit {
            0 => Some(Interrupt::VBlank),
            1 => Some(Interrupt::LcdStat),
            2 => Some(Interrupt::Timer),
            3 => Some(Interrupt::Serial),
            4 => Some(Interrupt::Joypad),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptController {
    pub ie: u8,
    pub if_reg: u8,
    /// Vector of the most recently serviced interrupt, for tracing
    pub last_serviced: Option<u16>,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&mut self, interrupt: Interrupt) {
        self.if_reg |= interrupt.mask();
    }

    pub fn pending(&self) -> u8 {
        self.ie & self.if_reg & 0x1F
    }

    /// Clear the request of `bit` as the CPU services it
    pub fn acknowledge(&mut self, bit: u8) {
        self.if_reg &= !(1 << bit);
        if let Some(int) = Interrupt::from_bit(bit) {
            self.last_serviced = Some(int.vector());
            log(LogCategory::Interrupts, LogLevel::Trace, || {
                format!("servicing {:?} at {:04X}", int, int.vector())
            });
        }
    }

    pub fn read_if(&self) -> u8 {
        self.if_reg | 0xE0
    }

    pub fn write_if(&mut self, val: u8) {
        self.if_reg = val & 0x1F;
    }
}
