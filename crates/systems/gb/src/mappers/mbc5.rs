//! MBC5 (Memory Bank Controller 5)
//!
//! Supports up to 8MB ROM (512 banks) and 128KB RAM (16 banks). The first
//! mapper guaranteed to work in CGB double speed mode.
//!
//! # Register Map
//!
//! - 0x0000-0x1FFF: RAM Enable (write 0x0A to enable)
//! - 0x2000-0x2FFF: ROM Bank Number (lower 8 bits)
//! - 0x3000-0x3FFF: ROM Bank Number (bit 8)
//! - 0x4000-0x5FFF: RAM Bank Number (4 bits)
//!
//! Unlike MBC1/MBC3, bank 0 can be mapped at 0x4000. On rumble carts bit 3
//! of the RAM bank register drives the motor instead.

use super::{ram_bank_mask, rom_bank_mask, BankMap, RAM_BANK_SIZE, ROM_BANK_SIZE};
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mbc5Regs {
    pub ram_enabled: bool,
    /// 9-bit ROM bank number
    pub rom_bank: u16,
    pub ram_bank: u8,
}

impl Default for Mbc5Regs {
    fn default() -> Self {
        Self {
            ram_enabled: false,
            rom_bank: 1,
            ram_bank: 0,
        }
    }
}

/// MBC5 mapper
#[derive(Debug)]
pub struct Mbc5 {
    pub(super) rom: Vec<u8>,
    pub(super) ram: Vec<u8>,
    pub(super) regs: Mbc5Regs,
    pub(super) banks: BankMap,
    rumble: bool,
}

impl Mbc5 {
    pub fn new(rom: Vec<u8>, ram: Vec<u8>, rumble: bool) -> Self {
        let mut mbc = Self {
            rom,
            ram,
            regs: Mbc5Regs::default(),
            banks: BankMap::default(),
            rumble,
        };
        mbc.update_banks();
        mbc
    }

    pub fn update_banks(&mut self) {
        let ram_bank_bits = if self.rumble { 0x07 } else { 0x0F };
        let ram_bank = (self.regs.ram_bank & ram_bank_bits) as usize;
        self.banks = BankMap {
            rom0_offset: 0,
            romx_offset: ((self.regs.rom_bank & 0x1FF) as usize & rom_bank_mask(&self.rom)) * ROM_BANK_SIZE,
            ram_offset: if self.regs.ram_enabled && !self.ram.is_empty() {
                Some((ram_bank & ram_bank_mask(&self.ram)) * RAM_BANK_SIZE)
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
                self.regs.ram_enabled = (val & 0x0F) == 0x0A;
            }
            0x2000..=0x2FFF => {
                self.regs.rom_bank = (self.regs.rom_bank & 0x100) | val as u16;
            }
            0x3000..=0x3FFF => {
                self.regs.rom_bank = (self.regs.rom_bank & 0xFF) | (((val & 0x01) as u16) << 8);
            }
            0x4000..=0x5FFF => {
                self.regs.ram_bank = val & 0x0F;
            }
            _ => return,
        }
        self.update_banks();
        log(LogCategory::Cartridge, LogLevel::Trace, || {
            format!("MBC5 write {:04X}={:02X} -> {:?}", addr, val, self.banks)
        });
    }

    pub fn read_ram(&self, addr: u16) -> u8 {
        self.banks.read_ram(&self.ram, addr)
    }

    pub fn write_ram(&mut self, addr: u16, val: u8) {
        self.banks.write_ram(&mut self.ram, addr, val);
    }
}
