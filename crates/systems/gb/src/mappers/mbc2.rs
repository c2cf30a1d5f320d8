//! MBC2 (Memory Bank Controller 2)
//!
//! Supports up to 256KB ROM (16 banks) and has 512x4 bits of built-in RAM.
//!
//! # Register Map
//!
//! Both registers live in 0x0000-0x3FFF; bit 8 of the address selects which:
//! - bit 8 clear: RAM Enable (write 0x0A to enable)
//! - bit 8 set: ROM Bank Number (4 bits, 0 maps to 1)
//!
//! # RAM
//!
//! Only the lower nibble of each byte is stored. The 512 bytes repeat
//! through 0xA000-0xBFFF and the upper nibble reads as 1s.

use super::{rom_bank_mask, BankMap, ROM_BANK_SIZE};
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

pub const MBC2_RAM_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mbc2Regs {
    pub ram_enabled: bool,
    pub rom_bank: u8,
}

impl Default for Mbc2Regs {
    fn default() -> Self {
        Self {
            ram_enabled: false,
            rom_bank: 1,
        }
    }
}

/// MBC2 mapper
#[derive(Debug)]
pub struct Mbc2 {
    pub(super) rom: Vec<u8>,
    pub(super) ram: Vec<u8>,
    pub(super) regs: Mbc2Regs,
    pub(super) banks: BankMap,
}

impl Mbc2 {
    pub fn new(rom: Vec<u8>) -> Self {
        let mut mbc = Self {
            rom,
            ram: vec![0; MBC2_RAM_SIZE],
            regs: Mbc2Regs::default(),
            banks: BankMap::default(),
        };
        mbc.update_banks();
        mbc
    }

    pub fn update_banks(&mut self) {
        let mut bank = (self.regs.rom_bank & 0x0F) as usize;
        if bank == 0 {
            bank = 1;
        }
        self.banks = BankMap {
            rom0_offset: 0,
            romx_offset: (bank & rom_bank_mask(&self.rom)) * ROM_BANK_SIZE,
            ram_offset: if self.regs.ram_enabled { Some(0) } else { None },
        };
    }

    pub fn read_rom(&self, addr: u16) -> u8 {
        self.banks.read_rom(&self.rom, addr)
    }

    pub fn write_rom(&mut self, addr: u16, val: u8) {
        if addr >= 0x4000 {
            return;
        }
        if addr & 0x0100 == 0 {
            self.regs.ram_enabled = (val & 0x0F) == 0x0A;
        } else {
            self.regs.rom_bank = val & 0x0F;
        }
        self.update_banks();
        log(LogCategory::Cartridge, LogLevel::Trace, || {
            format!("MBC2 write {:04X}={:02X} -> {:?}", addr, val, self.banks)
        });
    }

    pub fn read_ram(&self, addr: u16) -> u8 {
        if self.banks.ram_offset.is_none() {
            return 0xFF;
        }
        0xF0 | self.banks.read_ram(&self.ram, addr & 0x01FF)
    }

    pub fn write_ram(&mut self, addr: u16, val: u8) {
        self.banks.write_ram(&mut self.ram, addr & 0x01FF, val & 0x0F);
    }
}
