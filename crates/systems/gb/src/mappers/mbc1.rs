//! MBC1 (Memory Bank Controller 1)
//!
//! The most common Game Boy mapper, used by approximately 70% of cartridges.
//! Supports up to 2MB ROM and 32KB RAM with banking.
//!
//! # Banking Modes
//!
//! MBC1 has two banking modes:
//! - Mode 0: ROM banking mode (default)
//!   - ROM Bank 0 at 0x0000-0x3FFF (fixed)
//!   - ROM Bank 1-127 at 0x4000-0x7FFF (switchable)
//!   - RAM Bank 0 at 0xA000-0xBFFF (fixed, if enabled)
//! - Mode 1: RAM banking mode
//!   - ROM Bank 0/32/64/96 at 0x0000-0x3FFF (switchable via upper bits)
//!   - ROM Bank 1-127 at 0x4000-0x7FFF (switchable)
//!   - RAM Bank 0-3 at 0xA000-0xBFFF (switchable, if enabled)
//!
//! # Register Map
//!
//! - 0x0000-0x1FFF: RAM Enable (write 0x0A to enable, anything else to disable)
//! - 0x2000-0x3FFF: ROM Bank Number (lower 5 bits)
//! - 0x4000-0x5FFF: RAM Bank Number / ROM Bank Number (upper 2 bits)
//! - 0x6000-0x7FFF: Banking Mode Select (0 = ROM banking, 1 = RAM banking)
//!
//! # Multicart
//!
//! 1MB multi-game collections wire the upper register to ROM address bits
//! 18-19 instead of 19-20, so only four bits of the lower register are used
//! and the upper bits shift by four.

use super::{ram_bank_mask, rom_bank_mask, BankMap, RAM_BANK_SIZE, ROM_BANK_SIZE};
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mbc1Regs {
    pub ram_enabled: bool,
    /// 5-bit register (0x2000-0x3FFF)
    pub rom_bank: u8,
    /// 2-bit register (0x4000-0x5FFF)
    pub upper_bits: u8,
    /// 0 or 1
    pub banking_mode: u8,
}

impl Default for Mbc1Regs {
    fn default() -> Self {
        Self {
            ram_enabled: false,
            rom_bank: 1,
            upper_bits: 0,
            banking_mode: 0,
        }
    }
}

/// MBC1 mapper
#[derive(Debug)]
pub struct Mbc1 {
    pub(super) rom: Vec<u8>,
    pub(super) ram: Vec<u8>,
    pub(super) regs: Mbc1Regs,
    pub(super) banks: BankMap,
    multicart: bool,
}

impl Mbc1 {
    pub fn new(rom: Vec<u8>, ram: Vec<u8>, multicart: bool) -> Self {
        let mut mbc = Self {
            rom,
            ram,
            regs: Mbc1Regs::default(),
            banks: BankMap::default(),
            multicart,
        };
        mbc.update_banks();
        mbc
    }

    pub fn is_multicart(&self) -> bool {
        self.multicart
    }

    pub fn update_banks(&mut self) {
        let (low_mask, upper_shift) = if self.multicart { (0x0F, 4) } else { (0x1F, 5) };
        let rom_mask = rom_bank_mask(&self.rom);

        // The zero check looks at all five bits, even on multicarts
        let mut low = (self.regs.rom_bank & 0x1F) as usize;
        if low == 0 {
            low = 1;
        }
        low &= low_mask;
        let upper = (self.regs.upper_bits & 0x03) as usize;

        let rom0_bank = if self.regs.banking_mode == 1 {
            upper << upper_shift
        } else {
            0
        };
        let romx_bank = (upper << upper_shift) | low;

        let ram_bank = if self.regs.banking_mode == 1 {
            upper & ram_bank_mask(&self.ram)
        } else {
            0
        };

        self.banks = BankMap {
            rom0_offset: (rom0_bank & rom_mask) * ROM_BANK_SIZE,
            romx_offset: (romx_bank & rom_mask) * ROM_BANK_SIZE,
            ram_offset: if self.regs.ram_enabled && !self.ram.is_empty() {
                Some(ram_bank * RAM_BANK_SIZE)
            } else {
                None
            },
        };
    }

    pub fn read_rom(&self, addr: u16) -> u8 {
        self.banks.read_rom(&self.rom, addr)
    }

    pub fn write_rom(&mut self, addr: u16, val: u8) {
        match addr {
            0x0000..=0x1FFF => {
                // RAM Enable
                self.regs.ram_enabled = (val & 0x0F) == 0x0A;
            }
            0x2000..=0x3FFF => {
                // ROM Bank Number (lower 5 bits)
                self.regs.rom_bank = val & 0x1F;
            }
            0x4000..=0x5FFF => {
                // RAM Bank Number / Upper ROM Bank bits
                self.regs.upper_bits = val & 0x03;
            }
            0x6000..=0x7FFF => {
                // Banking Mode Select
                self.regs.banking_mode = val & 0x01;
            }
            _ => return,
        }
        self.update_banks();
        log(LogCategory::Cartridge, LogLevel::Trace, || {
            format!("MBC1 write {:04X}={:02X} -> {:?}", addr, val, self.banks)
        });
    }

    pub fn read_ram(&self, addr: u16) -> u8 {
        self.banks.read_ram(&self.ram, addr)
    }

    pub fn write_ram(&mut self, addr: u16, val: u8) {
        self.banks.write_ram(&mut self.ram, addr, val);
    }
}
