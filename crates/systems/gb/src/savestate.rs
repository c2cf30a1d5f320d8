//! Binary save states
//!
//! A state is the 4-byte magic `GBSS`, the format version as a little-endian
//! `u32`, then the bincode encoding of [`SaveState`]. The ROM image is never
//! part of a state, so a state only restores onto the cartridge it was
//! captured from.
//!
//! Only raw register and memory contents are stored. Everything derived from
//! them (mapper bank offsets, PPU colour caches) is rebuilt on restore.

use crate::apu::GbApu;
use crate::bus::{BusState, GbBus};
use crate::interrupts::InterruptController;
use crate::mappers::MapperRegs;
use crate::ppu::Ppu;
use crate::rtc::Rtc;
use crate::serial::Serial;
use crate::timer::Timer;
use emu_core::cpu_lr35902::{CpuLr35902, CpuState};
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

pub const STATE_MAGIC: [u8; 4] = *b"GBSS";
pub const STATE_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

/// Save-state decode and validation failures
#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("not a save state")]
    BadMagic,
    #[error("save state version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("corrupt save state: {0}")]
    Decode(#[from] bincode::Error),
    #[error("save state was captured from a different cartridge or model")]
    CartridgeMismatch,
    #[error("save state {0} is inconsistent")]
    Inconsistent(&'static str),
}

/// Cartridge-side state. The identity fields tie the state to one ROM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartState {
    pub header_checksum: u8,
    pub rom_len: u64,
    pub mapper: MapperRegs,
    pub ram: Vec<u8>,
    pub rtc: Option<Rtc>,
}

/// Complete machine snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveState {
    pub cpu: CpuState,
    pub bus: BusState,
    pub interrupts: InterruptController,
    pub timer: Timer,
    pub serial: Serial,
    pub ppu: Ppu,
    pub apu: GbApu,
    pub cart: CartState,
    /// Load flags the machine was started with
    pub flags: u32,
}

impl SaveState {
    /// Snapshot a machine, `None` when no cartridge is loaded
    pub fn capture(cpu: &CpuLr35902<GbBus>, flags: u32) -> Option<Self> {
        let bus = &cpu.memory;
        let cart = bus.cart.as_ref()?;
        Some(Self {
            cpu: cpu.state(),
            bus: bus.state(),
            interrupts: bus.interrupts.clone(),
            timer: bus.timer.clone(),
            serial: bus.serial.clone(),
            ppu: bus.ppu.clone(),
            apu: bus.apu.clone(),
            cart: CartState {
                header_checksum: cart.header.header_checksum,
                rom_len: cart.rom_len() as u64,
                mapper: cart.mapper.regs(),
                ram: cart.mapper.ram().to_vec(),
                rtc: cart.mapper.rtc().cloned(),
            },
            flags,
        })
    }

    /// Check that this state fits the machine without touching it
    pub fn validate(&self, bus: &GbBus) -> Result<(), StateError> {
        let cart = bus.cart.as_ref().ok_or(StateError::CartridgeMismatch)?;
        let fits = cart.header.header_checksum == self.cart.header_checksum
            && cart.rom_len() as u64 == self.cart.rom_len
            && cart.mapper.accepts(&self.cart.mapper)
            && cart.mapper.ram().len() == self.cart.ram.len()
            && cart.mapper.rtc().is_some() == self.cart.rtc.is_some()
            && bus.is_cgb() == self.ppu.is_cgb()
            && bus.accepts(&self.bus);
        if !fits {
            return Err(StateError::CartridgeMismatch);
        }
        if !self.ppu.accepts() {
            return Err(StateError::Inconsistent("PPU"));
        }
        Ok(())
    }

    /// Overwrite the machine with this state. Call [`SaveState::validate`]
    /// first.
    pub fn apply(self, cpu: &mut CpuLr35902<GbBus>) {
        cpu.restore(&self.cpu);
        let bus = &mut cpu.memory;
        bus.restore(self.bus);
        bus.interrupts = self.interrupts;
        bus.timer = self.timer;
        bus.serial = self.serial;
        bus.ppu.restore(self.ppu);
        bus.apu.restore(self.apu);
        if let Some(cart) = bus.cart.as_mut() {
            cart.mapper.ram_mut().copy_from_slice(&self.cart.ram);
            if let (Some(rtc), Some(saved)) = (cart.mapper.rtc_mut(), self.cart.rtc) {
                *rtc = saved;
            }
            // Rebuilds the bank offsets from the raw registers
            cart.mapper.restore_regs(&self.cart.mapper);
        }
        log(LogCategory::Bus, LogLevel::Info, || {
            format!("save state restored at clock {}", cpu.memory.clock())
        });
    }

    pub fn encode(&self) -> Result<Vec<u8>, StateError> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&STATE_MAGIC);
        out.extend_from_slice(&STATE_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, StateError> {
        if data.len() < HEADER_LEN || data[..4] != STATE_MAGIC {
            return Err(StateError::BadMagic);
        }
        let mut version = [0; 4];
        version.copy_from_slice(&data[4..HEADER_LEN]);
        let found = u32::from_le_bytes(version);
        if found != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                found,
                expected: STATE_VERSION,
            });
        }
        Ok(bincode::deserialize(&data[HEADER_LEN..])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::Cartridge;
    use emu_core::cpu_lr35902::MemoryLr35902;

    fn machine(cart_type: u8, ram_code: u8, checksum: u8) -> CpuLr35902<GbBus> {
        let mut rom = vec![0u8; 0x10000];
        rom[0x147] = cart_type;
        rom[0x148] = 1;
        rom[0x149] = ram_code;
        rom[0x14D] = checksum;
        let cart = Cartridge::load(&rom, 0, false).expect("synthetic cart");
        let mut bus = GbBus::new(Some(cart), false, None, 0, 0);
        bus.apply_post_boot();
        CpuLr35902::new(bus)
    }

    #[test]
    fn test_header_checks() {
        assert!(matches!(SaveState::decode(b"GB"), Err(StateError::BadMagic)));
        assert!(matches!(SaveState::decode(b"XXXX\x01\0\0\0"), Err(StateError::BadMagic)));
        assert!(matches!(
            SaveState::decode(b"GBSS\x09\0\0\0"),
            Err(StateError::VersionMismatch { found: 9, expected: STATE_VERSION })
        ));
        assert!(matches!(SaveState::decode(b"GBSS\x01\0\0\0\x01"), Err(StateError::Decode(_))));
    }

    #[test]
    fn test_restore_rebuilds_bank_map() {
        // MBC1 + RAM
        let mut cpu = machine(0x02, 0x02, 0);
        cpu.memory.poke(0xC000, 0x42);
        cpu.memory.write(0x2000, 3);
        cpu.memory.write(0x0000, 0x0A);
        cpu.memory.write(0xA000, 0x99);
        let data = SaveState::capture(&cpu, 0).unwrap().encode().unwrap();

        let mut other = machine(0x02, 0x02, 0);
        let state = SaveState::decode(&data).unwrap();
        state.validate(&other.memory).unwrap();
        state.apply(&mut other);

        assert_eq!(other.memory.peek(0xC000), 0x42);
        assert_eq!(other.memory.peek(0xA000), 0x99);
        let map = other.memory.cart.as_ref().unwrap().mapper.bank_map();
        assert_eq!(map.romx_offset, 3 * 0x4000);
    }

    #[test]
    fn test_rejects_other_cartridge() {
        let cpu = machine(0x02, 0x02, 0);
        let state = SaveState::capture(&cpu, 0).unwrap();
        let other = machine(0x02, 0x02, 0x55);
        assert!(matches!(state.validate(&other.memory), Err(StateError::CartridgeMismatch)));
        let rom_only = machine(0x00, 0x00, 0);
        assert!(matches!(state.validate(&rom_only.memory), Err(StateError::CartridgeMismatch)));
    }

    #[test]
    fn test_rejects_short_ppu_buffers() {
        let cpu = machine(0x00, 0x00, 0);
        let json = serde_json::to_value(SaveState::capture(&cpu, 0).unwrap()).unwrap();
        for field in ["framebuffer", "vram", "oam", "bg_palette_ram"] {
            let mut broken = json.clone();
            broken["ppu"][field] = serde_json::json!([]);
            let state: SaveState = serde_json::from_value(broken).unwrap();
            // Survives the binary encoding unchanged
            let state = SaveState::decode(&state.encode().unwrap()).unwrap();
            assert!(
                matches!(state.validate(&cpu.memory), Err(StateError::Inconsistent(_))),
                "{} accepted",
                field
            );
        }
    }

    #[test]
    fn test_nothing_to_capture_without_cartridge() {
        let cpu = CpuLr35902::new(GbBus::new(None, false, None, 0, 0));
        assert!(SaveState::capture(&cpu, 0).is_none());
    }
}
