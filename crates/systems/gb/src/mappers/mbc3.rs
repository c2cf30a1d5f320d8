//! MBC3 (Memory Bank Controller 3)
//!
//! Used by many Game Boy games, especially those with battery-backed saves.
//! Some cartridges include a Real-Time Clock (RTC).
//!
//! Supports up to 2MB ROM and 32KB RAM.
//!
//! # Register Map
//!
//! - 0x0000-0x1FFF: RAM and Timer Enable (write 0x0A to enable)
//! - 0x2000-0x3FFF: ROM Bank Number (7 bits, 0 maps to 1)
//! - 0x4000-0x5FFF: RAM Bank Number (0-3) or RTC Register Select (0x08-0x0C)
//! - 0x6000-0x7FFF: Latch Clock Data (write 0x00 then 0x01 to latch)

use super::{ram_bank_mask, rom_bank_mask, BankMap, RAM_BANK_SIZE, ROM_BANK_SIZE};
use crate::rtc::Rtc;
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mbc3Regs {
    pub ram_enabled: bool,
    pub rom_bank: u8,
    /// RAM bank 0-3, or RTC register 0x08-0x0C
    pub ram_select: u8,
}

impl Default for Mbc3Regs {
    fn default() -> Self {
        Self {
            ram_enabled: false,
            rom_bank: 1,
            ram_select: 0,
        }
    }
}

/// MBC3 mapper
#[derive(Debug)]
pub struct Mbc3 {
    pub(super) rom: Vec<u8>,
    pub(super) ram: Vec<u8>,
    pub(super) regs: Mbc3Regs,
    pub(super) banks: BankMap,
    pub(super) rtc: Option<Rtc>,
}

impl Mbc3 {
    pub fn new(rom: Vec<u8>, ram: Vec<u8>, rtc: Option<Rtc>) -> Self {
        let mut mbc = Self {
            rom,
            ram,
            regs: Mbc3Regs::default(),
            banks: BankMap::default(),
            rtc,
        };
        mbc.update_banks();
        mbc
    }

    fn rtc_selected(&self) -> bool {
        self.rtc.is_some() && (0x08..=0x0C).contains(&self.regs.ram_select)
    }

    pub fn update_banks(&mut self) {
        let mut bank = (self.regs.rom_bank & 0x7F) as usize;
        if bank == 0 {
            bank = 1;
        }
        let ram_offset = if self.regs.ram_enabled && !self.ram.is_empty() && self.regs.ram_select < 0x08 {
            Some((self.regs.ram_select as usize & 0x03 & ram_bank_mask(&self.ram)) * RAM_BANK_SIZE)
        } else {
            None
        };
        self.banks = BankMap {
            rom0_offset: 0,
            romx_offset: (bank & rom_bank_mask(&self.rom)) * ROM_BANK_SIZE,
            ram_offset,
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
            0x2000..=0x3FFF => {
                self.regs.rom_bank = val & 0x7F;
            }
            0x4000..=0x5FFF => {
                self.regs.ram_select = val & 0x0F;
            }
            0x6000..=0x7FFF => {
                if let Some(rtc) = self.rtc.as_mut() {
                    rtc.write_latch(val);
                }
                return;
            }
            _ => return,
        }
        self.update_banks();
        log(LogCategory::Cartridge, LogLevel::Trace, || {
            format!("MBC3 write {:04X}={:02X} -> {:?}", addr, val, self.banks)
        });
    }

    pub fn read_ram(&self, addr: u16) -> u8 {
        if self.regs.ram_enabled && self.rtc_selected() {
            return self.rtc.as_ref().map_or(0xFF, |rtc| rtc.read(self.regs.ram_select));
        }
        self.banks.read_ram(&self.ram, addr)
    }

    pub fn write_ram(&mut self, addr: u16, val: u8) {
        if self.regs.ram_enabled && self.rtc_selected() {
            let reg = self.regs.ram_select;
            if let Some(rtc) = self.rtc.as_mut() {
                rtc.write(reg, val);
            }
            return;
        }
        self.banks.write_ram(&mut self.ram, addr, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn banked_rom(banks: usize) -> Vec<u8> {
        let mut rom = vec![0; banks * ROM_BANK_SIZE];
        for bank in 0..banks {
            rom[bank * ROM_BANK_SIZE] = bank as u8;
        }
        rom
    }

    #[test]
    fn test_mbc3_rom_banking() {
        let mut mbc = Mbc3::new(banked_rom(128), vec![], None);
        assert_eq!(mbc.read_rom(0x4000), 1);

        mbc.write_rom(0x2000, 0x45);
        assert_eq!(mbc.read_rom(0x4000), 0x45);

        mbc.write_rom(0x2000, 0x7F);
        assert_eq!(mbc.read_rom(0x4000), 0x7F);

        mbc.write_rom(0x2000, 0);
        assert_eq!(mbc.read_rom(0x4000), 1);
    }

    #[test]
    fn test_mbc3_ram_banking() {
        let mut ram = vec![0; 0x8000];
        for bank in 0..4 {
            ram[bank * RAM_BANK_SIZE] = 0x10 + bank as u8;
        }
        let mut mbc = Mbc3::new(vec![0; 0x8000], ram, None);
        assert_eq!(mbc.read_ram(0xA000), 0xFF);

        mbc.write_rom(0x0000, 0x0A);
        for bank in 0..4u8 {
            mbc.write_rom(0x4000, bank);
            assert_eq!(mbc.read_ram(0xA000), 0x10 + bank);
        }

        mbc.write_rom(0x4000, 2);
        mbc.write_ram(0xA123, 0x99);
        assert_eq!(mbc.ram[2 * RAM_BANK_SIZE + 0x123], 0x99);
    }

    #[test]
    fn test_mbc3_rtc_registers() {
        let mut mbc = Mbc3::new(vec![0; 0x8000], vec![0; 0x2000], Some(Rtc::new(0)));
        mbc.write_rom(0x0000, 0x0A);

        mbc.write_rom(0x4000, 0x0A);
        mbc.write_ram(0xA000, 7);
        assert_eq!(mbc.read_ram(0xA000), 7);

        if let Some(rtc) = mbc.rtc.as_mut() {
            rtc.set_now(60);
        }
        mbc.write_rom(0x6000, 0x00);
        mbc.write_rom(0x6000, 0x01);
        mbc.write_rom(0x4000, 0x09);
        assert_eq!(mbc.read_ram(0xA000), 1);
        mbc.write_rom(0x4000, 0x0A);
        assert_eq!(mbc.read_ram(0xA000), 7);

        // Cartridge RAM is untouched by clock writes
        mbc.write_rom(0x4000, 0x00);
        assert_eq!(mbc.read_ram(0xA000), 0);
    }

    #[test]
    fn test_mbc3_rtc_select_without_clock() {
        let mut mbc = Mbc3::new(vec![0; 0x8000], vec![0; 0x2000], None);
        mbc.write_rom(0x0000, 0x0A);
        mbc.write_rom(0x4000, 0x08);
        assert_eq!(mbc.read_ram(0xA000), 0xFF);
    }

    #[test]
    fn test_mbc3_no_ram() {
        let mut mbc = Mbc3::new(vec![0; 0x8000], vec![], None);
        mbc.write_rom(0x0000, 0x0A);
        mbc.write_ram(0xA000, 0x42);
        assert_eq!(mbc.read_ram(0xA000), 0xFF);
    }
}
