//! MBC0 (No Mapper) - Basic ROM with no banking
//!
//! This is the simplest "mapper" - just a plain ROM with no banking capability.
//! Used by early Game Boy games that fit in 32KB or less. Cartridge types
//! 0x08/0x09 add up to 8KB of RAM that is always accessible.

use super::BankMap;

/// MBC0 mapper - no banking, direct ROM access
#[derive(Debug)]
pub struct Mbc0 {
    pub(super) rom: Vec<u8>,
    pub(super) ram: Vec<u8>,
}

impl Mbc0 {
    pub fn new(rom: Vec<u8>, ram: Vec<u8>) -> Self {
        Self { rom, ram }
    }

    pub fn banks(&self) -> BankMap {
        BankMap {
            rom0_offset: 0,
            romx_offset: 0x4000,
            ram_offset: if self.ram.is_empty() { None } else { Some(0) },
        }
    }

    pub fn read_rom(&self, addr: u16) -> u8 {
        self.rom.get(addr as usize & 0x7FFF).copied().unwrap_or(0xFF)
    }

    pub fn write_rom(&mut self, _addr: u16, _val: u8) {
        // No banking commands for MBC0
    }

    pub fn read_ram(&self, addr: u16) -> u8 {
        self.banks().read_ram(&self.ram, addr)
    }

    pub fn write_ram(&mut self, addr: u16, val: u8) {
        let banks = self.banks();
        banks.write_ram(&mut self.ram, addr, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbc0_rom_read() {
        let mut rom = vec![0; 0x8000]; // 32KB ROM
        rom[0x0000] = 0x12;
        rom[0x4000] = 0x34;

        let mbc = Mbc0::new(rom, vec![]);

        assert_eq!(mbc.read_rom(0x0000), 0x12);
        assert_eq!(mbc.read_rom(0x4000), 0x34);
    }

    #[test]
    fn test_mbc0_ram_has_no_enable_gate() {
        let mut mbc = Mbc0::new(vec![0; 0x8000], vec![0; 0x2000]);
        mbc.write_ram(0xA000, 0x42);
        assert_eq!(mbc.read_ram(0xA000), 0x42);
        mbc.write_rom(0x0000, 0x00);
        assert_eq!(mbc.read_ram(0xA000), 0x42);
    }

    #[test]
    fn test_mbc0_no_ram() {
        let mut mbc = Mbc0::new(vec![0; 0x8000], vec![]);
        mbc.write_ram(0xA000, 0x42);
        assert_eq!(mbc.read_ram(0xA000), 0xFF);
    }
}
