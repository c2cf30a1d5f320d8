//! Game Boy system implementation
//!
//! [`GbSystem`] owns the CPU, which owns the bus and through it every other
//! component. [`GbSystem::run_for`] advances the machine by a number of audio
//! samples (2 master clocks each) and returns early when a frame completes.

use emu_core::cpu_lr35902::{CpuLr35902, Registers};
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::{types::Frame, MountPointInfo, System};
use std::sync::Arc;

mod apu;
mod bus;
mod cartridge;
mod interrupts;
mod mappers;
mod ppu;
mod rtc;
mod savestate;
mod serial;
mod timer;

pub use bus::{
    buttons, CdlCallback, CdlEntry, CdlKind, CdlRegion, InputGetter, LinkCallback, MemoryArea, MemoryCallback,
    RtcCallback, ScanlineCallback, CLOCKS_PER_SECOND,
};
pub use cartridge::LoadError;
pub use ppu::{
    DEFAULT_DMG_COLORS, FRAME_CLOCKS, LAYER_ALL, LAYER_BG, LAYER_OBJ, LAYER_WINDOW, SCREEN_HEIGHT, SCREEN_WIDTH,
};
pub use savestate::{StateError, STATE_VERSION};
pub use serial::LinkCommand;

use bus::GbBus;
use cartridge::Cartridge;
use savestate::SaveState;

/// Size of the DMG boot ROM
pub const DMG_BIOS_LEN: usize = 0x100;
/// Size of the CGB boot ROM
pub const CGB_BIOS_LEN: usize = 0x900;
/// Audio samples in one frame
pub const SAMPLES_PER_FRAME: usize = (FRAME_CLOCKS / apu::CLOCKS_PER_SAMPLE) as usize;

/// Called before each instruction with the registers and master clock
pub type TraceCallback = Box<dyn FnMut(&Registers, u64) + Send>;

/// Options for [`GbSystem::load`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadFlags(u32);

impl LoadFlags {
    /// Run CGB-capable cartridges as a DMG
    pub const FORCE_DMG: Self = Self(1);
    /// Report a GBA to CGB software
    pub const GBA_CGB: Self = Self(2);
    /// Detect MBC1 multicarts
    pub const MULTICART_COMPAT: Self = Self(4);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & 7)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for LoadFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum GbError {
    #[error("No cartridge loaded")]
    NoCartridge,
    #[error("Invalid mount point")]
    InvalidMountPoint,
    #[error("Save data is {actual} bytes, expected {expected}")]
    SaveDataLength { expected: usize, actual: usize },
    #[error("Boot ROM must be {expected} bytes, got {actual}")]
    BiosLength { expected: usize, actual: usize },
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Register values the boot ROM leaves behind
fn post_boot_registers(cgb: bool, gba: bool) -> Registers {
    if cgb {
        Registers {
            pc: 0x0100,
            sp: 0xFFFE,
            a: 0x11,
            f: 0x80,
            b: gba as u8,
            c: 0x00,
            d: 0xFF,
            e: 0x56,
            h: 0x00,
            l: 0x0D,
        }
    } else {
        Registers {
            pc: 0x0100,
            sp: 0xFFFE,
            a: 0x01,
            f: 0xB0,
            b: 0x00,
            c: 0x13,
            d: 0x00,
            e: 0xD8,
            h: 0x01,
            l: 0x4D,
        }
    }
}

pub struct GbSystem {
    cpu: CpuLr35902<GbBus>,
    flags: LoadFlags,
    dmg_bios: Option<Vec<u8>>,
    cgb_bios: Option<Vec<u8>>,
    /// Seeds of the last load or reset
    now: u64,
    div: u16,
    breakpoints: Vec<u16>,
    hit_address: Option<u16>,
    trace: Option<TraceCallback>,
    // Display settings survive loads and resets
    dmg_colors: [[u32; 4]; 3],
    cgb_lut: Option<Arc<[u32]>>,
}

impl Default for GbSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl GbSystem {
    pub fn new() -> Self {
        Self {
            cpu: CpuLr35902::new(GbBus::new(None, false, None, 0, 0)),
            flags: LoadFlags::empty(),
            dmg_bios: None,
            cgb_bios: None,
            now: 0,
            div: 0,
            breakpoints: Vec::new(),
            hit_address: None,
            trace: None,
            dmg_colors: [DEFAULT_DMG_COLORS; 3],
            cgb_lut: None,
        }
    }

    /// Load a cartridge image and power on. `now` (seconds) seeds the
    /// cartridge clock, `div` the internal divider. On error the previous
    /// cartridge stays loaded.
    pub fn load(&mut self, rom: &[u8], now: u64, flags: LoadFlags, div: u16) -> Result<(), LoadError> {
        let cart = Cartridge::load(rom, now, flags.contains(LoadFlags::MULTICART_COMPAT))?;
        self.flags = flags;
        self.power_on(cart, now, div);
        Ok(())
    }

    /// Power-cycle the loaded cartridge. Cartridge RAM and clock are kept.
    pub fn reset_with(&mut self, now: u64, div: u16) {
        let Some(mut cart) = self.cpu.memory.cart.take() else {
            return;
        };
        cart.mapper.reset_regs();
        self.power_on(cart, now, div);
    }

    fn power_on(&mut self, cart: Cartridge, now: u64, div: u16) {
        let cgb = cart.header.supports_cgb() && !self.flags.contains(LoadFlags::FORCE_DMG);
        let bios = if cgb { self.cgb_bios.clone() } else { self.dmg_bios.clone() };
        let has_bios = bios.is_some();
        let hooks = std::mem::take(&mut self.cpu.memory.hooks);
        let layers = self.cpu.memory.ppu.layers();

        let mut bus = GbBus::new(Some(cart), cgb, bios, div, now);
        bus.hooks = hooks;
        bus.ppu.set_layers(layers);
        for (palette, colors) in self.dmg_colors.iter().enumerate() {
            for (index, &rgb) in colors.iter().enumerate() {
                bus.ppu.set_dmg_palette_color(palette, index, rgb);
            }
        }
        bus.ppu.set_cgb_lut(self.cgb_lut.clone());
        if !has_bios {
            bus.apply_post_boot();
        }

        self.cpu = CpuLr35902::new(bus);
        if !has_bios {
            let gba = cgb && self.flags.contains(LoadFlags::GBA_CGB);
            self.cpu.set_registers(&post_boot_registers(cgb, gba));
        }
        self.now = now;
        self.div = div;
        self.hit_address = None;
        log(LogCategory::Bus, LogLevel::Info, || {
            format!(
                "power on as {}{}",
                if cgb { "CGB" } else { "DMG" },
                if has_bios { " with boot ROM" } else { "" }
            )
        });
    }

    /// Supply the DMG boot ROM, used from the next load or reset
    pub fn load_dmg_bios(&mut self, data: &[u8]) -> Result<(), GbError> {
        if data.len() != DMG_BIOS_LEN {
            return Err(GbError::BiosLength {
                expected: DMG_BIOS_LEN,
                actual: data.len(),
            });
        }
        self.dmg_bios = Some(data.to_vec());
        Ok(())
    }

    /// Supply the CGB boot ROM, used from the next load or reset
    pub fn load_cgb_bios(&mut self, data: &[u8]) -> Result<(), GbError> {
        if data.len() != CGB_BIOS_LEN {
            return Err(GbError::BiosLength {
                expected: CGB_BIOS_LEN,
                actual: data.len(),
            });
        }
        self.cgb_bios = Some(data.to_vec());
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.cpu.memory.cart.is_some()
    }

    pub fn is_cgb(&self) -> bool {
        self.cpu.memory.is_cgb()
    }

    /// Run until `*samples` audio samples exist or a frame completes.
    ///
    /// On return `*samples` holds the number of samples written to
    /// `sound_buf`. The result is -1 when nothing is loaded, otherwise the
    /// sample index at which a frame completed during this call, or the
    /// sample count when no frame completed.
    pub fn run_for(&mut self, sound_buf: &mut [u32], samples: &mut usize) -> i64 {
        if !self.is_loaded() {
            *samples = 0;
            return -1;
        }
        let requested = (*samples).min(sound_buf.len());
        self.hit_address = None;
        self.cpu.memory.take_blit();

        let mut blit = None;
        while self.cpu.memory.apu.pending_samples() < requested {
            self.step_instruction();
            if let Some(at) = self.cpu.memory.take_blit() {
                blit = Some(at);
                break;
            }
            if !self.breakpoints.is_empty() && self.breakpoints.contains(&self.cpu.pc) {
                self.hit_address = Some(self.cpu.pc);
                break;
            }
        }

        let produced = self.cpu.memory.apu.drain_samples(&mut sound_buf[..requested]);
        *samples = produced;
        match blit {
            Some(at) => {
                let since_blit = (self.cpu.memory.clock() - at) / apu::CLOCKS_PER_SAMPLE as u64;
                produced as i64 - since_blit as i64
            }
            None => produced as i64,
        }
    }

    fn step_instruction(&mut self) {
        if let Some(trace) = &mut self.trace {
            if !self.cpu.halted && !self.cpu.stopped {
                trace(&self.cpu.registers(), self.cpu.memory.clock());
            }
        }
        self.cpu.step();
    }

    /// Copy the last frame into `dst`, one row every `pitch` pixels
    pub fn blit_to(&self, dst: &mut [u32], pitch: usize) {
        if !self.is_loaded() {
            return;
        }
        let frame = self.cpu.memory.ppu.frame();
        for (y, row) in frame.chunks(SCREEN_WIDTH).enumerate() {
            let start = y * pitch;
            if let Some(out) = dst.get_mut(start..start + SCREEN_WIDTH) {
                out.copy_from_slice(row);
            }
        }
    }

    /// Select visible layers, see [`LAYER_BG`], [`LAYER_OBJ`], [`LAYER_WINDOW`]
    pub fn set_layers(&mut self, mask: u8) {
        self.cpu.memory.ppu.set_layers(mask);
    }

    /// Override a DMG colour: palette 0 = BG, 1 = OBP0, 2 = OBP1
    pub fn set_dmg_palette_color(&mut self, palette: usize, index: usize, rgb32: u32) {
        if let Some(slot) = self.dmg_colors.get_mut(palette).and_then(|p| p.get_mut(index)) {
            *slot = rgb32;
            self.cpu.memory.ppu.set_dmg_palette_color(palette, index, rgb32);
        }
    }

    /// Install a BGR555 to RGB32 table (32768 entries) for CGB colours
    pub fn set_cgb_lut(&mut self, lut: Option<Arc<[u32]>>) {
        self.cgb_lut = lut.filter(|l| l.len() >= 0x8000);
        self.cpu.memory.ppu.set_cgb_lut(self.cgb_lut.clone());
    }

    /// Title from the cartridge header
    pub fn rom_title(&self) -> Option<String> {
        let cart = self.cpu.memory.cart.as_ref()?;
        let title = String::from_utf8_lossy(cart.rom_title());
        Some(title.trim_end_matches('\0').to_string())
    }

    /// Length of the battery-backed save data, `None` when there is none
    pub fn save_data_len(&self) -> Option<usize> {
        self.cpu.memory.cart.as_ref()?.save_data_len()
    }

    /// Copy save data into `out`, which must be [`Self::save_data_len`] long
    pub fn save_save_data(&mut self, out: &mut [u8]) -> bool {
        self.cpu.memory.sync_rtc();
        self.cpu
            .memory
            .cart
            .as_mut()
            .is_some_and(|cart| cart.save_data(out))
    }

    pub fn load_save_data(&mut self, data: &[u8]) -> Result<(), GbError> {
        let cart = self.cpu.memory.cart.as_mut().ok_or(GbError::NoCartridge)?;
        let expected = cart.save_data_len().unwrap_or(0);
        if !cart.load_save_data(data) {
            return Err(GbError::SaveDataLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(())
    }

    /// Binary save state, `None` when nothing is loaded
    pub fn capture_state(&self) -> Option<Vec<u8>> {
        let state = SaveState::capture(&self.cpu, self.flags.bits())?;
        match state.encode() {
            Ok(data) => Some(data),
            Err(e) => {
                log(LogCategory::Bus, LogLevel::Error, || format!("save state encode failed: {}", e));
                None
            }
        }
    }

    /// Restore a state from [`Self::capture_state`]. Nothing changes on error.
    pub fn restore_state(&mut self, data: &[u8]) -> Result<(), GbError> {
        if !self.is_loaded() {
            return Err(GbError::NoCartridge);
        }
        let state = SaveState::decode(data)?;
        state.validate(&self.cpu.memory)?;
        self.apply_state(state);
        Ok(())
    }

    fn apply_state(&mut self, state: SaveState) {
        self.flags = LoadFlags::from_bits(state.flags);
        state.apply(&mut self.cpu);
        self.hit_address = None;
    }

    /// Read without side effects
    pub fn peek(&self, addr: u16) -> u8 {
        self.cpu.memory.peek(addr)
    }

    /// Write RAM without side effects
    pub fn poke(&mut self, addr: u16, val: u8) {
        self.cpu.memory.poke(addr, val);
    }

    pub fn memory_area(&self, area: MemoryArea) -> Option<&[u8]> {
        self.cpu.memory.memory_area(area)
    }

    /// `[pc, sp, a, b, c, d, e, f, h, l]`
    pub fn get_regs(&self) -> [u32; 10] {
        self.cpu.registers().to_array()
    }

    pub fn set_regs(&mut self, regs: &Registers) {
        self.cpu.set_registers(regs);
    }

    /// `run_for` stops when the CPU reaches one of these addresses
    pub fn set_interrupt_addresses(&mut self, addrs: &[u16]) {
        self.breakpoints = addrs.to_vec();
    }

    /// Address that stopped the last `run_for`, if any
    pub fn hit_interrupt_address(&self) -> Option<u16> {
        self.hit_address
    }

    /// Vector of the most recently serviced interrupt
    pub fn last_interrupt(&self) -> Option<u16> {
        self.cpu.memory.interrupts.last_serviced
    }

    pub fn link_status(&mut self, cmd: LinkCommand) -> u8 {
        self.cpu.memory.link_status(cmd)
    }

    /// Set pressed buttons directly, see [`buttons`]
    pub fn set_buttons(&mut self, pressed: u8) {
        self.cpu.memory.set_buttons(pressed);
    }

    pub fn set_input_getter(&mut self, getter: Option<InputGetter>) {
        self.cpu.memory.hooks.input = getter;
    }

    pub fn set_read_callback(&mut self, cb: Option<MemoryCallback>) {
        self.cpu.memory.hooks.read = cb;
    }

    pub fn set_write_callback(&mut self, cb: Option<MemoryCallback>) {
        self.cpu.memory.hooks.write = cb;
    }

    pub fn set_exec_callback(&mut self, cb: Option<MemoryCallback>) {
        self.cpu.memory.hooks.exec = cb;
    }

    pub fn set_cdl_callback(&mut self, cb: Option<CdlCallback>) {
        self.cpu.memory.hooks.cdl = cb;
    }

    /// Wall clock for the cartridge RTC. Without one, RTC time follows the
    /// emulated clock from the load-time seed.
    pub fn set_rtc_callback(&mut self, cb: Option<RtcCallback>) {
        self.cpu.memory.hooks.rtc = cb;
    }

    /// Called when the game starts a serial transfer
    pub fn set_link_callback(&mut self, cb: Option<LinkCallback>) {
        self.cpu.memory.hooks.link = cb;
    }

    /// Called when LY reaches `line`
    pub fn set_scanline_callback(&mut self, cb: Option<ScanlineCallback>, line: u8) {
        self.cpu.memory.hooks.scanline = cb.map(|cb| (cb, line));
    }

    pub fn set_trace_callback(&mut self, cb: Option<TraceCallback>) {
        self.trace = cb;
    }
}

impl System for GbSystem {
    type Error = GbError;

    fn reset(&mut self) {
        self.reset_with(self.now, self.div);
    }

    fn step_frame(&mut self) -> Result<Frame, Self::Error> {
        if !self.is_loaded() {
            return Err(GbError::NoCartridge);
        }
        self.cpu.memory.take_blit();
        // The PPU completes a frame every FRAME_CLOCKS even with the LCD off
        while self.cpu.memory.take_blit().is_none() {
            self.step_instruction();
        }
        self.cpu.memory.apu.clear_samples();
        Ok(Frame {
            width: SCREEN_WIDTH as u32,
            height: SCREEN_HEIGHT as u32,
            pixels: self.cpu.memory.ppu.frame().to_vec(),
        })
    }

    fn save_state(&self) -> serde_json::Value {
        SaveState::capture(&self.cpu, self.flags.bits())
            .and_then(|state| serde_json::to_value(state).ok())
            .unwrap_or(serde_json::Value::Null)
    }

    fn load_state(&mut self, v: &serde_json::Value) -> Result<(), serde_json::Error> {
        let state: SaveState = serde_json::from_value(v.clone())?;
        state
            .validate(&self.cpu.memory)
            .map_err(<serde_json::Error as serde::de::Error>::custom)?;
        self.apply_state(state);
        Ok(())
    }

    fn supports_save_states(&self) -> bool {
        true
    }

    fn mount_points(&self) -> Vec<MountPointInfo> {
        vec![
            MountPointInfo {
                id: "Cartridge".to_string(),
                name: "Cartridge Slot".to_string(),
                extensions: vec!["gb".to_string(), "gbc".to_string()],
                required: true,
            },
            MountPointInfo {
                id: "BootROM".to_string(),
                name: "Boot ROM".to_string(),
                extensions: vec!["bin".to_string()],
                required: false,
            },
        ]
    }

    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error> {
        match mount_point_id {
            "Cartridge" => Ok(self.load(data, self.now, self.flags, self.div)?),
            "BootROM" if data.len() == CGB_BIOS_LEN => self.load_cgb_bios(data),
            "BootROM" => self.load_dmg_bios(data),
            _ => Err(GbError::InvalidMountPoint),
        }
    }

    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error> {
        match mount_point_id {
            "Cartridge" => {
                self.cpu.memory.cart = None;
                Ok(())
            }
            "BootROM" => {
                self.dmg_bios = None;
                self.cgb_bios = None;
                Ok(())
            }
            _ => Err(GbError::InvalidMountPoint),
        }
    }

    fn is_mounted(&self, mount_point_id: &str) -> bool {
        match mount_point_id {
            "Cartridge" => self.is_loaded(),
            "BootROM" => self.dmg_bios.is_some() || self.cgb_bios.is_some(),
            _ => false,
        }
    }
}
