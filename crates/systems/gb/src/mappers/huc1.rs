//! HuC1 (Hudson Soft)
//!
//! MBC1-like mapper with an infrared port in place of the banking mode
//! register.
//!
//! # Register Map
//!
//! - 0x0000-0x1FFF: 0x0E selects IR mode, anything else maps RAM
//! - 0x2000-0x3FFF: ROM Bank Number (6 bits, 0 maps to 1)
//! - 0x4000-0x5FFF: RAM Bank Number (2 bits)
//! - 0x6000-0x7FFF: unused
//!
//! In IR mode 0xA000-0xBFFF reads 0xC0 (no light seen) and writes go to the
//! LED, which is not emulated.

use super::{ram_bank_mask, rom_bank_mask, BankMap, RAM_BANK_SIZE, ROM_BANK_SIZE};
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Huc1Regs {
    pub ir_mode: bool,
    pub rom_bank: u8,
    pub ram_bank: u8,
}

impl Default for Huc1Regs {
    fn default() -> Self {
        Self {
            ir_mode: false,
            rom_bank: 1,
            ram_bank: 0,
        }
    }
}

/// HuC1 mapper
#[derive(Debug)]
pub struct Huc1 {
    pub(super) rom: Vec<u8>,
    pub(super) ram: Vec<u8>,
    pub(super) regs: Huc1Regs,
    pub(super) banks: BankMap,
}

impl Huc1 {
    pub fn new(rom: Vec<u8>, ram: Vec<u8>) -> Self {
        let mut mbc = Self {
            rom,
            ram,
            regs: Huc1Regs::default(),
            banks: BankMap::default(),
        };
        mbc.update_banks();
        mbc
    }

    pub fn update_banks(&mut self) {
        let mut bank = (self.regs.rom_bank & 0x3F) as usize;
        if bank == 0 {
            bank = 1;
        }
        self.banks = BankMap {
            rom0_offset: 0,
            romx_offset: (bank & rom_bank_mask(&self.rom)) * ROM_BANK_SIZE,
            ram_offset: if !self.regs.ir_mode && !self.ram.is_empty() {
                Some((self.regs.ram_bank as usize & 0x03 & ram_bank_mask(&self.ram)) * RAM_BANK_SIZE)
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
                self.regs.ir_mode = val == 0x0E;
            }
            0x2000..=0x3FFF => {
                self.regs.rom_bank = val & 0x3F;
            }
            0x4000..=0x5FFF => {
                self.regs.ram_bank = val & 0x03;
            }
            _ => return,
        }
        self.update_banks();
        log(LogCategory::Cartridge, LogLevel::Trace, || {
            format!("HuC1 write {:04X}={:02X} -> {:?}", addr, val, self.banks)
        });
    }

    pub fn read_ram(&self, addr: u16) -> u8 {
        if self.regs.ir_mode {
            return 0xC0;
        }
        self.banks.read_ram(&self.ram, addr)
    }

    pub fn write_ram(&mut self, addr: u16, val: u8) {
        if self.regs.ir_mode {
            return;
        }
        self.banks.write_ram(&mut self.ram, addr, val);
    }
}
