//! Cartridge header parsing and loading
//!
//! # Header Layout
//!
//! ```text
//! $0104-$0133  Nintendo logo
//! $0134-$0143  Title (the last byte doubles as the CGB flag)
//! $0147        Cartridge type
//! $0148        ROM size code (32KB << code)
//! $0149        RAM size code
//! $014D        Header checksum
//! ```
//!
//! Loading validates the header, pads the image to a power-of-two bank
//! count and builds the matching [`Mapper`].

use crate::mappers::{Mapper, ROM_BANK_SIZE};
use crate::rtc::Rtc;
use emu_core::logging::{log, LogCategory, LogLevel};

const HEADER_END: usize = 0x150;
const LOGO_START: usize = 0x104;
const LOGO_LEN: usize = 48;
const MBC2_RAM_LEN: usize = 512;
const MULTICART_SIZE: usize = 0x10_0000;

/// Load-time defects of a cartridge image
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("image too short for a cartridge header ({len} bytes)")]
    HeaderTooShort { len: usize },
    #[error("unsupported cartridge type {cart_type:#04X}")]
    UnsupportedMapper { cart_type: u8 },
    #[error("invalid ROM size code {code:#04X}")]
    InvalidRomSize { code: u8 },
    #[error("invalid RAM size code {code:#04X}")]
    InvalidRamSize { code: u8 },
    #[error("image truncated: header declares {declared} bytes, got {actual}")]
    Truncated { declared: usize, actual: usize },
}

/// Bank controller family, fixed at load time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperKind {
    RomOnly,
    Mbc1,
    Mbc1Multicart,
    Mbc2,
    Mbc3,
    Mbc5,
    Huc1,
}

/// Optional hardware on the cartridge board
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CartFeatures {
    pub has_ram: bool,
    pub has_battery: bool,
    pub has_rtc: bool,
    pub has_rumble: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartridgeHeader {
    pub title: [u8; 16],
    pub cgb_flag: u8,
    pub cart_type: u8,
    pub rom_size_code: u8,
    pub ram_size_code: u8,
    pub header_checksum: u8,
}

impl CartridgeHeader {
    pub fn parse(data: &[u8]) -> Result<Self, LoadError> {
        if data.len() < HEADER_END {
            return Err(LoadError::HeaderTooShort { len: data.len() });
        }
        let mut title = [0; 16];
        title.copy_from_slice(&data[0x134..0x144]);
        let header = Self {
            title,
            cgb_flag: data[0x143],
            cart_type: data[0x147],
            rom_size_code: data[0x148],
            ram_size_code: data[0x149],
            header_checksum: data[0x14D],
        };
        header.mapper_kind()?;
        header.rom_size()?;
        header.ram_size()?;

        let computed = data[0x134..0x14D]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_sub(b).wrapping_sub(1));
        if computed != header.header_checksum {
            log(LogCategory::Cartridge, LogLevel::Warn, || {
                format!(
                    "header checksum mismatch: stored {:02X}, computed {:02X}",
                    header.header_checksum, computed
                )
            });
        }
        Ok(header)
    }

    pub fn mapper_kind(&self) -> Result<MapperKind, LoadError> {
        match self.cart_type {
            0x00 | 0x08 | 0x09 => Ok(MapperKind::RomOnly),
            0x01..=0x03 => Ok(MapperKind::Mbc1),
            0x05 | 0x06 => Ok(MapperKind::Mbc2),
            0x0F..=0x13 => Ok(MapperKind::Mbc3),
            0x19..=0x1E => Ok(MapperKind::Mbc5),
            0xFF => Ok(MapperKind::Huc1),
            cart_type => Err(LoadError::UnsupportedMapper { cart_type }),
        }
    }

    pub fn features(&self) -> CartFeatures {
        let t = self.cart_type;
        CartFeatures {
            has_ram: matches!(t, 0x02 | 0x03 | 0x05 | 0x06 | 0x08 | 0x09 | 0x10 | 0x12 | 0x13 | 0x1A | 0x1B | 0x1D | 0x1E | 0xFF),
            has_battery: matches!(t, 0x03 | 0x06 | 0x09 | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E | 0xFF),
            has_rtc: matches!(t, 0x0F | 0x10),
            has_rumble: matches!(t, 0x1C..=0x1E),
        }
    }

    /// Declared ROM size in bytes
    pub fn rom_size(&self) -> Result<usize, LoadError> {
        match self.rom_size_code {
            code @ 0..=8 => Ok(0x8000 << code),
            // Odd sizes found on a handful of boards
            0x52 => Ok(72 * ROM_BANK_SIZE),
            0x53 => Ok(80 * ROM_BANK_SIZE),
            0x54 => Ok(96 * ROM_BANK_SIZE),
            code => Err(LoadError::InvalidRomSize { code }),
        }
    }

    /// Declared external RAM size in bytes
    pub fn ram_size(&self) -> Result<usize, LoadError> {
        match self.ram_size_code {
            0 | 1 => Ok(0),
            2 => Ok(0x2000),
            3 => Ok(0x8000),
            4 => Ok(0x20000),
            5 => Ok(0x10000),
            code => Err(LoadError::InvalidRamSize { code }),
        }
    }

    /// CGB flag bit 7: the game uses colour features
    pub fn supports_cgb(&self) -> bool {
        self.cgb_flag & 0x80 != 0
    }
}

/// A loaded cartridge: parsed header plus the mapper that owns ROM and RAM
#[derive(Debug)]
pub struct Cartridge {
    pub header: CartridgeHeader,
    pub features: CartFeatures,
    pub mapper: Mapper,
    /// Length of the padded ROM image
    rom_len: usize,
}

impl Cartridge {
    /// Parse and load an image. `now` seeds the clock of RTC carts.
    pub fn load(data: &[u8], now: u64, multicart_compat: bool) -> Result<Self, LoadError> {
        let header = CartridgeHeader::parse(data)?;
        if data.len() < ROM_BANK_SIZE {
            return Err(LoadError::Truncated {
                declared: header.rom_size()?,
                actual: data.len(),
            });
        }

        let declared = header.rom_size()?;
        if data.len() < declared {
            log(LogCategory::Cartridge, LogLevel::Warn, || {
                format!("image shorter than declared: {} < {}, padding", data.len(), declared)
            });
        }

        let mut kind = header.mapper_kind()?;
        if kind == MapperKind::Mbc1 && multicart_compat && is_multicart(data) {
            kind = MapperKind::Mbc1Multicart;
        }

        let features = header.features();
        let rom = pad_rom(data);
        let ram_len = match kind {
            MapperKind::Mbc2 => MBC2_RAM_LEN,
            _ if features.has_ram => header.ram_size()?,
            _ => 0,
        };
        let rtc = features.has_rtc.then(|| Rtc::new(now));
        let rom_len = rom.len();
        // Mbc2 allocates its own nibble RAM
        let ram = if kind == MapperKind::Mbc2 { Vec::new() } else { vec![0; ram_len] };
        let mapper = Mapper::new(kind, rom, ram, features.has_rumble, rtc);

        log(LogCategory::Cartridge, LogLevel::Info, || {
            format!(
                "loaded \"{}\": {} ({:02X}), {} KiB ROM, {} KiB RAM{}{}",
                String::from_utf8_lossy(title_bytes(&header.title)),
                mapper.name(),
                header.cart_type,
                rom_len / 1024,
                ram_len / 1024,
                if features.has_battery { ", battery" } else { "" },
                if features.has_rtc { ", RTC" } else { "" },
            )
        });

        Ok(Self {
            header,
            features,
            mapper,
            rom_len,
        })
    }

    pub fn rom_len(&self) -> usize {
        self.rom_len
    }

    /// Raw title bytes: 16, or 15 when byte 15 is a CGB flag
    pub fn rom_title(&self) -> &[u8] {
        title_bytes(&self.header.title)
    }

    /// Bytes of persistent save data, `None` for carts without a battery
    pub fn save_data_len(&self) -> Option<usize> {
        if !self.features.has_battery {
            return None;
        }
        let rtc_len = if self.features.has_rtc { 4 } else { 0 };
        Some(self.mapper.ram().len() + rtc_len)
    }

    /// Copy RAM (and the clock base time) into `out`. Returns false when the
    /// buffer length does not match [`Cartridge::save_data_len`].
    pub fn save_data(&mut self, out: &mut [u8]) -> bool {
        if self.save_data_len() != Some(out.len()) {
            return false;
        }
        let ram_len = self.mapper.ram().len();
        out[..ram_len].copy_from_slice(self.mapper.ram());
        if let Some(rtc) = self.mapper.rtc_mut() {
            out[ram_len..].copy_from_slice(&rtc.base_time_for_save().to_le_bytes());
        }
        true
    }

    pub fn load_save_data(&mut self, data: &[u8]) -> bool {
        if self.save_data_len() != Some(data.len()) {
            return false;
        }
        let ram_len = self.mapper.ram().len();
        self.mapper.ram_mut().copy_from_slice(&data[..ram_len]);
        if let Some(rtc) = self.mapper.rtc_mut() {
            let mut base = [0; 4];
            base.copy_from_slice(&data[ram_len..ram_len + 4]);
            rtc.load_base_time(u32::from_le_bytes(base));
        }
        log(LogCategory::Cartridge, LogLevel::Debug, || {
            format!("loaded {} bytes of save data", data.len())
        });
        true
    }
}

fn title_bytes(title: &[u8; 16]) -> &[u8] {
    if title[15] & 0x80 != 0 {
        &title[..15]
    } else {
        &title[..]
    }
}

/// Pad with 0xFF to a power-of-two number of banks, at least two
fn pad_rom(data: &[u8]) -> Vec<u8> {
    let banks = data.len().div_ceil(ROM_BANK_SIZE).max(2).next_power_of_two();
    let mut rom = data.to_vec();
    rom.resize(banks * ROM_BANK_SIZE, 0xFF);
    rom
}

/// 1MB MBC1 collections carry a copy of the boot logo at the start of
/// bank 0x10 (the header of the second game).
fn is_multicart(data: &[u8]) -> bool {
    if data.len() != MULTICART_SIZE {
        return false;
    }
    let second = 0x10 * ROM_BANK_SIZE + LOGO_START;
    data[LOGO_START..LOGO_START + LOGO_LEN] == data[second..second + LOGO_LEN]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rom(cart_type: u8, rom_code: u8, ram_code: u8) -> Vec<u8> {
        let mut rom = vec![0; 0x8000 << rom_code];
        rom[0x134..0x138].copy_from_slice(b"TEST");
        rom[0x147] = cart_type;
        rom[0x148] = rom_code;
        rom[0x149] = ram_code;
        rom
    }

    #[test]
    fn test_header_parse() {
        let rom = make_rom(0x13, 2, 3);
        let header = CartridgeHeader::parse(&rom).unwrap();
        assert_eq!(header.mapper_kind().unwrap(), MapperKind::Mbc3);
        assert_eq!(header.rom_size().unwrap(), 0x20000);
        assert_eq!(header.ram_size().unwrap(), 0x8000);
        let features = header.features();
        assert!(features.has_ram && features.has_battery);
        assert!(!features.has_rtc);
    }

    #[test]
    fn test_header_errors() {
        assert_eq!(
            CartridgeHeader::parse(&[0; 0x100]),
            Err(LoadError::HeaderTooShort { len: 0x100 })
        );
        assert_eq!(
            CartridgeHeader::parse(&make_rom(0x20, 0, 0)),
            Err(LoadError::UnsupportedMapper { cart_type: 0x20 })
        );
        let mut rom = make_rom(0x00, 0, 0);
        rom[0x148] = 0x09;
        assert_eq!(CartridgeHeader::parse(&rom), Err(LoadError::InvalidRomSize { code: 9 }));
        rom[0x148] = 0x00;
        rom[0x149] = 0x06;
        assert_eq!(CartridgeHeader::parse(&rom), Err(LoadError::InvalidRamSize { code: 6 }));
    }

    #[test]
    fn test_truncated_image() {
        let rom = make_rom(0x00, 0, 0);
        let err = Cartridge::load(&rom[..0x200], 0, false).unwrap_err();
        assert_eq!(
            err,
            LoadError::Truncated {
                declared: 0x8000,
                actual: 0x200
            }
        );
    }

    #[test]
    fn test_rom_padding() {
        // 3 banks pad to 4, with 0xFF fill
        let mut rom = make_rom(0x01, 1, 0);
        rom.truncate(3 * ROM_BANK_SIZE);
        let cart = Cartridge::load(&rom, 0, false).unwrap();
        assert_eq!(cart.rom_len(), 4 * ROM_BANK_SIZE);
        assert_eq!(cart.mapper.rom()[3 * ROM_BANK_SIZE], 0xFF);

        assert_eq!(pad_rom(&[0; ROM_BANK_SIZE]).len(), 2 * ROM_BANK_SIZE);
    }

    #[test]
    fn test_ram_sizing() {
        // RAM code ignored when the type has no RAM
        let cart = Cartridge::load(&make_rom(0x01, 0, 3), 0, false).unwrap();
        assert!(cart.mapper.ram().is_empty());

        let cart = Cartridge::load(&make_rom(0x06, 0, 0), 0, false).unwrap();
        assert_eq!(cart.mapper.ram().len(), MBC2_RAM_LEN);
        assert_eq!(cart.save_data_len(), Some(MBC2_RAM_LEN));
    }

    #[test]
    fn test_save_data_only_with_battery() {
        let cart = Cartridge::load(&make_rom(0x02, 0, 2), 0, false).unwrap();
        assert_eq!(cart.save_data_len(), None);

        let cart = Cartridge::load(&make_rom(0x03, 0, 2), 0, false).unwrap();
        assert_eq!(cart.save_data_len(), Some(0x2000));
    }

    #[test]
    fn test_save_data_with_rtc() {
        let mut cart = Cartridge::load(&make_rom(0x10, 0, 2), 1234, false).unwrap();
        assert_eq!(cart.save_data_len(), Some(0x2000 + 4));

        cart.mapper.ram_mut()[5] = 0x77;
        let mut buf = vec![0; 0x2004];
        assert!(cart.save_data(&mut buf));
        assert_eq!(buf[5], 0x77);
        assert_eq!(&buf[0x2000..], &1234u32.to_le_bytes());

        let mut other = Cartridge::load(&make_rom(0x10, 0, 2), 0, false).unwrap();
        assert!(other.load_save_data(&buf));
        assert_eq!(other.mapper.ram()[5], 0x77);
        assert!(!other.load_save_data(&buf[..10]));
    }

    #[test]
    fn test_rom_title() {
        let mut rom = make_rom(0x00, 0, 0);
        rom[0x134..0x144].copy_from_slice(b"ABCDEFGHIJKLMNOP");
        let cart = Cartridge::load(&rom, 0, false).unwrap();
        assert_eq!(cart.rom_title(), b"ABCDEFGHIJKLMNOP");

        rom[0x143] = 0x80;
        let cart = Cartridge::load(&rom, 0, false).unwrap();
        assert_eq!(cart.rom_title(), b"ABCDEFGHIJKLMNO");
    }

    #[test]
    fn test_multicart_detection() {
        let mut rom = make_rom(0x01, 5, 0);
        for i in 0..LOGO_LEN {
            rom[LOGO_START + i] = i as u8 + 1;
            rom[0x40000 + LOGO_START + i] = i as u8 + 1;
        }
        let cart = Cartridge::load(&rom, 0, true).unwrap();
        assert_eq!(cart.mapper.name(), "MBC1M");

        // Flag not set
        let cart = Cartridge::load(&rom, 0, false).unwrap();
        assert_eq!(cart.mapper.name(), "MBC1");

        // No logo copy
        rom[0x40000 + LOGO_START] = 0;
        let cart = Cartridge::load(&rom, 0, true).unwrap();
        assert_eq!(cart.mapper.name(), "MBC1");
    }
}
