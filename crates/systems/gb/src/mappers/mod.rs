//! Game Boy Memory Bank Controllers (MBCs)
//!
//! This module contains implementations of various Game Boy cartridge mappers
//! that handle ROM/RAM banking and other cartridge hardware features.
//!
//! Every mapper keeps only its raw register values as state. The currently
//! mapped bank offsets live in a [`BankMap`] that is recomputed by
//! `update_banks()` after each register write and after a state restore, so
//! reads never evaluate banking rules on the hot path.

mod huc1;
mod mbc0;
mod mbc1;
mod mbc2;
mod mbc3;
mod mbc5;

pub use huc1::{Huc1, Huc1Regs};
pub use mbc0::Mbc0;
pub use mbc1::{Mbc1, Mbc1Regs};
pub use mbc2::{Mbc2, Mbc2Regs};
pub use mbc3::{Mbc3, Mbc3Regs};
pub use mbc5::{Mbc5, Mbc5Regs};

use crate::cartridge::MapperKind;
use crate::rtc::Rtc;
use serde::{Deserialize, Serialize};

pub const ROM_BANK_SIZE: usize = 0x4000;
pub const RAM_BANK_SIZE: usize = 0x2000;

/// Byte offsets of the banks currently visible in each switchable window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BankMap {
    /// Bank at 0x0000-0x3FFF
    pub rom0_offset: usize,
    /// Bank at 0x4000-0x7FFF
    pub romx_offset: usize,
    /// Bank at 0xA000-0xBFFF, `None` while RAM is disabled or absent
    pub ram_offset: Option<usize>,
}

impl BankMap {
    pub fn read_rom(&self, rom: &[u8], addr: u16) -> u8 {
        let base = if addr < 0x4000 {
            self.rom0_offset
        } else {
            self.romx_offset
        };
        rom.get(base + (addr as usize & 0x3FFF)).copied().unwrap_or(0xFF)
    }

    fn ram_index(&self, ram: &[u8], addr: u16) -> Option<usize> {
        let offset = self.ram_offset?;
        if ram.is_empty() {
            return None;
        }
        // RAM smaller than one bank is mirrored
        Some((offset + (addr as usize & 0x1FFF)) % ram.len())
    }

    pub fn read_ram(&self, ram: &[u8], addr: u16) -> u8 {
        match self.ram_index(ram, addr) {
            Some(i) => ram[i],
            None => 0xFF,
        }
    }

    pub fn write_ram(&self, ram: &mut [u8], addr: u16, val: u8) {
        if let Some(i) = self.ram_index(ram, addr) {
            ram[i] = val;
        }
    }
}

/// ROM bank number mask; the bank count is rounded up to a power of two
pub(crate) fn rom_bank_mask(rom: &[u8]) -> usize {
    (rom.len() / ROM_BANK_SIZE).max(1).next_power_of_two() - 1
}

/// RAM bank number mask, 0 when there is one bank or less
pub(crate) fn ram_bank_mask(ram: &[u8]) -> usize {
    (ram.len() / RAM_BANK_SIZE).max(1).next_power_of_two() - 1
}

/// Serializable register contents of any mapper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapperRegs {
    RomOnly,
    Mbc1(Mbc1Regs),
    Mbc2(Mbc2Regs),
    Mbc3(Mbc3Regs),
    Mbc5(Mbc5Regs),
    Huc1(Huc1Regs),
}

/// Unified mapper enum that dispatches to specific implementations
#[derive(Debug)]
pub enum Mapper {
    Huc1(Huc1),
    Mbc0(Mbc0),
    Mbc1(Mbc1),
    Mbc2(Mbc2),
    Mbc3(Mbc3),
    Mbc5(Mbc5),
}

impl Mapper {
    /// Create a mapper for a parsed cartridge. `rom` must already be padded
    /// to a power-of-two bank count.
    pub fn new(kind: MapperKind, rom: Vec<u8>, ram: Vec<u8>, rumble: bool, rtc: Option<Rtc>) -> Self {
        match kind {
            MapperKind::RomOnly => Mapper::Mbc0(Mbc0::new(rom, ram)),
            MapperKind::Mbc1 => Mapper::Mbc1(Mbc1::new(rom, ram, false)),
            MapperKind::Mbc1Multicart => Mapper::Mbc1(Mbc1::new(rom, ram, true)),
            MapperKind::Mbc2 => Mapper::Mbc2(Mbc2::new(rom)),
            MapperKind::Mbc3 => Mapper::Mbc3(Mbc3::new(rom, ram, rtc)),
            MapperKind::Mbc5 => Mapper::Mbc5(Mbc5::new(rom, ram, rumble)),
            MapperKind::Huc1 => Mapper::Huc1(Huc1::new(rom, ram)),
        }
    }

    /// Read from ROM address space
    pub fn read_rom(&self, addr: u16) -> u8 {
        match self {
            Mapper::Huc1(m) => m.read_rom(addr),
            Mapper::Mbc0(m) => m.read_rom(addr),
            Mapper::Mbc1(m) => m.read_rom(addr),
            Mapper::Mbc2(m) => m.read_rom(addr),
            Mapper::Mbc3(m) => m.read_rom(addr),
            Mapper::Mbc5(m) => m.read_rom(addr),
        }
    }

    /// Write to ROM address space (for mapper registers)
    pub fn write_rom(&mut self, addr: u16, val: u8) {
        match self {
            Mapper::Huc1(m) => m.write_rom(addr, val),
            Mapper::Mbc0(m) => m.write_rom(addr, val),
            Mapper::Mbc1(m) => m.write_rom(addr, val),
            Mapper::Mbc2(m) => m.write_rom(addr, val),
            Mapper::Mbc3(m) => m.write_rom(addr, val),
            Mapper::Mbc5(m) => m.write_rom(addr, val),
        }
    }

    /// Read from RAM address space
    pub fn read_ram(&self, addr: u16) -> u8 {
        match self {
            Mapper::Huc1(m) => m.read_ram(addr),
            Mapper::Mbc0(m) => m.read_ram(addr),
            Mapper::Mbc1(m) => m.read_ram(addr),
            Mapper::Mbc2(m) => m.read_ram(addr),
            Mapper::Mbc3(m) => m.read_ram(addr),
            Mapper::Mbc5(m) => m.read_ram(addr),
        }
    }

    /// Write to RAM address space
    pub fn write_ram(&mut self, addr: u16, val: u8) {
        match self {
            Mapper::Huc1(m) => m.write_ram(addr, val),
            Mapper::Mbc0(m) => m.write_ram(addr, val),
            Mapper::Mbc1(m) => m.write_ram(addr, val),
            Mapper::Mbc2(m) => m.write_ram(addr, val),
            Mapper::Mbc3(m) => m.write_ram(addr, val),
            Mapper::Mbc5(m) => m.write_ram(addr, val),
        }
    }

    /// Recompute the derived bank offsets from the raw registers
    pub fn update_banks(&mut self) {
        match self {
            Mapper::Huc1(m) => m.update_banks(),
            Mapper::Mbc0(_) => {}
            Mapper::Mbc1(m) => m.update_banks(),
            Mapper::Mbc2(m) => m.update_banks(),
            Mapper::Mbc3(m) => m.update_banks(),
            Mapper::Mbc5(m) => m.update_banks(),
        }
    }

    pub fn bank_map(&self) -> BankMap {
        match self {
            Mapper::Huc1(m) => m.banks,
            Mapper::Mbc0(m) => m.banks(),
            Mapper::Mbc1(m) => m.banks,
            Mapper::Mbc2(m) => m.banks,
            Mapper::Mbc3(m) => m.banks,
            Mapper::Mbc5(m) => m.banks,
        }
    }

    pub fn rom(&self) -> &[u8] {
        match self {
            Mapper::Huc1(m) => &m.rom,
            Mapper::Mbc0(m) => &m.rom,
            Mapper::Mbc1(m) => &m.rom,
            Mapper::Mbc2(m) => &m.rom,
            Mapper::Mbc3(m) => &m.rom,
            Mapper::Mbc5(m) => &m.rom,
        }
    }

    /// Cartridge RAM as persisted in save data (MBC2: one nibble per byte)
    pub fn ram(&self) -> &[u8] {
        match self {
            Mapper::Huc1(m) => &m.ram,
            Mapper::Mbc0(m) => &m.ram,
            Mapper::Mbc1(m) => &m.ram,
            Mapper::Mbc2(m) => &m.ram,
            Mapper::Mbc3(m) => &m.ram,
            Mapper::Mbc5(m) => &m.ram,
        }
    }

    pub fn ram_mut(&mut self) -> &mut [u8] {
        match self {
            Mapper::Huc1(m) => &mut m.ram,
            Mapper::Mbc0(m) => &mut m.ram,
            Mapper::Mbc1(m) => &mut m.ram,
            Mapper::Mbc2(m) => &mut m.ram,
            Mapper::Mbc3(m) => &mut m.ram,
            Mapper::Mbc5(m) => &mut m.ram,
        }
    }

    pub fn rtc(&self) -> Option<&Rtc> {
        match self {
            Mapper::Mbc3(m) => m.rtc.as_ref(),
            _ => None,
        }
    }

    pub fn rtc_mut(&mut self) -> Option<&mut Rtc> {
        match self {
            Mapper::Mbc3(m) => m.rtc.as_mut(),
            _ => None,
        }
    }

    pub fn regs(&self) -> MapperRegs {
        match self {
            Mapper::Huc1(m) => MapperRegs::Huc1(m.regs.clone()),
            Mapper::Mbc0(_) => MapperRegs::RomOnly,
            Mapper::Mbc1(m) => MapperRegs::Mbc1(m.regs.clone()),
            Mapper::Mbc2(m) => MapperRegs::Mbc2(m.regs.clone()),
            Mapper::Mbc3(m) => MapperRegs::Mbc3(m.regs.clone()),
            Mapper::Mbc5(m) => MapperRegs::Mbc5(m.regs.clone()),
        }
    }

    /// Whether `regs` was captured from a mapper of the same family
    pub fn accepts(&self, regs: &MapperRegs) -> bool {
        matches!(
            (self, regs),
            (Mapper::Huc1(_), MapperRegs::Huc1(_))
                | (Mapper::Mbc0(_), MapperRegs::RomOnly)
                | (Mapper::Mbc1(_), MapperRegs::Mbc1(_))
                | (Mapper::Mbc2(_), MapperRegs::Mbc2(_))
                | (Mapper::Mbc3(_), MapperRegs::Mbc3(_))
                | (Mapper::Mbc5(_), MapperRegs::Mbc5(_))
        )
    }

    /// Restore raw registers and rebuild the bank map. Mismatched families
    /// are ignored; check with [`Mapper::accepts`] first.
    pub fn restore_regs(&mut self, regs: &MapperRegs) {
        match (&mut *self, regs) {
            (Mapper::Huc1(m), MapperRegs::Huc1(r)) => m.regs = r.clone(),
            (Mapper::Mbc1(m), MapperRegs::Mbc1(r)) => m.regs = r.clone(),
            (Mapper::Mbc2(m), MapperRegs::Mbc2(r)) => m.regs = r.clone(),
            (Mapper::Mbc3(m), MapperRegs::Mbc3(r)) => m.regs = r.clone(),
            (Mapper::Mbc5(m), MapperRegs::Mbc5(r)) => m.regs = r.clone(),
            _ => {}
        }
        self.update_banks();
    }

    /// Put registers back to their power-on values
    pub fn reset_regs(&mut self) {
        match self {
            Mapper::Huc1(m) => m.regs = Huc1Regs::default(),
            Mapper::Mbc0(_) => {}
            Mapper::Mbc1(m) => m.regs = Mbc1Regs::default(),
            Mapper::Mbc2(m) => m.regs = Mbc2Regs::default(),
            Mapper::Mbc3(m) => m.regs = Mbc3Regs::default(),
            Mapper::Mbc5(m) => m.regs = Mbc5Regs::default(),
        }
        self.update_banks();
    }

    /// Get the cartridge type name
    pub fn name(&self) -> &'static str {
        match self {
            Mapper::Huc1(_) => "HuC1",
            Mapper::Mbc0(_) => "MBC0",
            Mapper::Mbc1(m) if m.is_multicart() => "MBC1M",
            Mapper::Mbc1(_) => "MBC1",
            Mapper::Mbc2(_) => "MBC2",
            Mapper::Mbc3(_) => "MBC3",
            Mapper::Mbc5(_) => "MBC5",
        }
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
    fn test_mapper_from_kind() {
        let rom = || vec![0; 0x8000];
        assert_eq!(Mapper::new(MapperKind::RomOnly, rom(), vec![], false, None).name(), "MBC0");
        assert_eq!(Mapper::new(MapperKind::Mbc1, rom(), vec![], false, None).name(), "MBC1");
        assert_eq!(Mapper::new(MapperKind::Mbc1Multicart, rom(), vec![], false, None).name(), "MBC1M");
        assert_eq!(Mapper::new(MapperKind::Mbc2, rom(), vec![], false, None).name(), "MBC2");
        assert_eq!(Mapper::new(MapperKind::Mbc3, rom(), vec![], false, None).name(), "MBC3");
        assert_eq!(Mapper::new(MapperKind::Mbc5, rom(), vec![], false, None).name(), "MBC5");
        assert_eq!(Mapper::new(MapperKind::Huc1, rom(), vec![], false, None).name(), "HuC1");
    }

    #[test]
    fn test_mapper_delegation() {
        let mut rom = vec![0; 0x8000];
        rom[0] = 0xAA;
        rom[0x4000] = 0xBB;

        let mapper = Mapper::new(MapperKind::RomOnly, rom, vec![], false, None);

        assert_eq!(mapper.read_rom(0x0000), 0xAA);
        assert_eq!(mapper.read_rom(0x4000), 0xBB);
    }

    #[test]
    fn test_restore_regs_rebuilds_bank_map() {
        let mut a = Mapper::new(MapperKind::Mbc5, banked_rom(8), vec![0; 0x8000], false, None);
        a.write_rom(0x2000, 5);
        a.write_rom(0x0000, 0x0A);
        a.write_rom(0x4000, 2);
        let regs = a.regs();

        let mut b = Mapper::new(MapperKind::Mbc5, banked_rom(8), vec![0; 0x8000], false, None);
        assert!(b.accepts(&regs));
        b.restore_regs(&regs);
        assert_eq!(b.bank_map(), a.bank_map());
        assert_eq!(b.read_rom(0x4000), 5);

        let c = Mapper::new(MapperKind::Mbc1, banked_rom(8), vec![], false, None);
        assert!(!c.accepts(&regs));
    }

    #[test]
    fn test_reset_regs() {
        let mut m = Mapper::new(MapperKind::Mbc1, banked_rom(8), vec![], false, None);
        m.write_rom(0x2000, 3);
        assert_eq!(m.read_rom(0x4000), 3);
        m.reset_regs();
        assert_eq!(m.read_rom(0x4000), 1);
    }

    #[test]
    fn test_bank_masks() {
        assert_eq!(rom_bank_mask(&vec![0; 0x8000]), 1);
        assert_eq!(rom_bank_mask(&vec![0; 0x100000]), 63);
        assert_eq!(ram_bank_mask(&[]), 0);
        assert_eq!(ram_bank_mask(&vec![0; 0x800]), 0);
        assert_eq!(ram_bank_mask(&vec![0; 0x8000]), 3);
    }
}
