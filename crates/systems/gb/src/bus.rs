//! Game Boy memory bus implementation
//!
//! The memory bus connects all components of the Game Boy system and handles
//! address decoding and routing. Every CPU access is one machine cycle: the
//! access happens first, then the timer, serial port, PPU, APU and DMA
//! engines advance by that cycle.
//!
//! # Memory Map
//!
//! ```text
//! $0000-$00FF  Boot ROM (until $FF50 is written; CGB also $0200-$08FF)
//! $0000-$3FFF  ROM Bank 0 (16KB, MBC1 mode 1 can remap it)
//! $4000-$7FFF  ROM Bank 1-N (16KB, switchable via MBC)
//! $8000-$9FFF  Video RAM (8KB) [CGB: 2 banks via VBK]
//! $A000-$BFFF  External RAM (8KB, switchable via MBC, battery-backed)
//! $C000-$CFFF  Work RAM Bank 0 (4KB)
//! $D000-$DFFF  Work RAM Bank 1 (4KB) [CGB: Banks 1-7 via SVBK]
//! $E000-$FDFF  Echo RAM (mirror of $C000-$DDFF)
//! $FE00-$FE9F  OAM - Object Attribute Memory (160 bytes, 40 sprites × 4 bytes)
//! $FEA0-$FEFF  Not usable
//! $FF00-$FF7F  I/O Registers
//! $FF80-$FFFE  High RAM (127 bytes)
//! $FFFF        Interrupt Enable Register
//! ```
//!
//! # I/O Registers
//!
//! ## Joypad
//! - `$FF00 (P1)`: Joypad register
//!   - Bit 5: Select button keys (0=select)
//!   - Bit 4: Select direction keys (0=select)
//!   - Bits 3-0: Input (0=pressed, 1=released)
//!
//! ## Serial, Timer, Interrupts
//! - `$FF01-$FF02`: see [`crate::serial`]
//! - `$FF04-$FF07`: see [`crate::timer`]
//! - `$FF0F (IF)`, `$FFFF (IE)`: see [`crate::interrupts`]
//!
//! ## Video
//! - `$FF40-$FF4B`: LCD registers, see [`crate::ppu`]
//! - `$FF46 (DMA)`: OAM DMA, one byte per machine cycle for 160 cycles;
//!   OAM reads as 0xFF meanwhile
//!
//! ## CGB
//! - `$FF4D (KEY1)`: Speed switch, armed by bit 0 and performed by STOP
//! - `$FF4F (VBK)`: VRAM bank
//! - `$FF51-$FF55 (HDMA1-5)`: VRAM DMA, general purpose or one 16-byte block
//!   per HBlank. The CPU is stalled while a block is copied.
//! - `$FF68-$FF6C`: Palette RAM ports and object priority mode
//! - `$FF70 (SVBK)`: WRAM bank (0 selects 1)
//!
//! ## Other
//! - `$FF50`: Boot ROM disable (write to unmap)

use crate::apu::GbApu;
use crate::cartridge::Cartridge;
use crate::interrupts::{Interrupt, InterruptController};
use crate::ppu::Ppu;
use crate::serial::{LinkCommand, Serial};
use crate::timer::Timer;
use emu_core::cpu_lr35902::{Fetch, MemoryLr35902};
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

/// Master clock rate in Hz
pub const CLOCKS_PER_SECOND: u64 = 4_194_304;

const WRAM_BANK_SIZE: usize = 0x1000;
const OAM_DMA_LEN: u8 = 160;
/// Machine cycles the CPU sits out after a speed switch
const SPEED_SWITCH_CYCLES: u32 = 2050;

/// Joypad bits as returned by the input getter, 1 = pressed
pub mod buttons {
    pub const A: u8 = 0x01;
    pub const B: u8 = 0x02;
    pub const SELECT: u8 = 0x04;
    pub const START: u8 = 0x08;
    pub const RIGHT: u8 = 0x10;
    pub const LEFT: u8 = 0x20;
    pub const UP: u8 = 0x40;
    pub const DOWN: u8 = 0x80;
}

/// Memory region a code/data log entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdlRegion {
    Rom,
    CartRam,
    Wram,
    Hram,
}

/// How a byte was accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdlKind {
    /// First byte of an instruction
    ExecOpcode,
    /// Instruction operand
    ExecOperand,
    /// Plain data read
    Data,
}

/// One code/data log entry: the physical offset inside `region`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdlEntry {
    pub region: CdlRegion,
    pub offset: u32,
    pub kind: CdlKind,
}

/// Raw memory regions exposed to diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryArea {
    Vram,
    Rom,
    Wram,
    CartRam,
    Oam,
    Hram,
}

/// Access callback: address and master clock of the access
pub type MemoryCallback = Box<dyn FnMut(u16, u64) + Send>;
pub type CdlCallback = Box<dyn FnMut(CdlEntry) + Send>;
pub type InputGetter = Box<dyn FnMut() -> u8 + Send>;
/// Returns the current time in seconds
pub type RtcCallback = Box<dyn FnMut() -> u64 + Send>;
pub type LinkCallback = Box<dyn FnMut() + Send>;
pub type ScanlineCallback = Box<dyn FnMut() + Send>;

/// Host callbacks. All are optional and only fire on CPU-visible accesses.
#[derive(Default)]
pub struct Hooks {
    pub read: Option<MemoryCallback>,
    pub write: Option<MemoryCallback>,
    pub exec: Option<MemoryCallback>,
    pub cdl: Option<CdlCallback>,
    pub input: Option<InputGetter>,
    pub rtc: Option<RtcCallback>,
    pub link: Option<LinkCallback>,
    /// Callback and the line that triggers it
    pub scanline: Option<(ScanlineCallback, u8)>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .field("exec", &self.exec.is_some())
            .field("cdl", &self.cdl.is_some())
            .field("input", &self.input.is_some())
            .field("rtc", &self.rtc.is_some())
            .field("link", &self.link.is_some())
            .field("scanline", &self.scanline.as_ref().map(|(_, line)| *line))
            .finish()
    }
}

/// OAM DMA and VRAM DMA progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaState {
    /// Last value written to 0xFF46
    pub oam_reg: u8,
    pub oam_source: u16,
    /// Next byte to copy, `OAM_DMA_LEN` when idle
    pub oam_index: u8,
    /// The first cycle after the write only sets the transfer up
    pub oam_starting: bool,
    pub hdma_source: u16,
    pub hdma_dest: u16,
    /// 16-byte blocks left
    pub hdma_blocks: u8,
    /// HBlank mode transfer in progress
    pub hdma_hblank: bool,
    /// An HBlank started and a block is due
    pub hdma_block_due: bool,
}

impl DmaState {
    fn idle() -> Self {
        Self {
            oam_index: OAM_DMA_LEN,
            ..Self::default()
        }
    }

    fn oam_active(&self) -> bool {
        self.oam_index < OAM_DMA_LEN && !self.oam_starting
    }
}

/// Bus-owned state that goes into a save state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusState {
    pub wram: Vec<u8>,
    pub hram: Vec<u8>,
    pub svbk: u8,
    pub double_speed: bool,
    pub key1_armed: bool,
    pub boot_rom_mapped: bool,
    pub p1: u8,
    pub buttons: u8,
    pub clock: u64,
    pub rtc_seed: u64,
    pub dma: DmaState,
}

/// Game Boy memory bus
pub struct GbBus {
    /// Loaded cartridge (ROM, RAM, mapper, RTC)
    pub cart: Option<Cartridge>,
    /// Work RAM, 8 banks of 4KB on CGB, 2 on DMG
    wram: Vec<u8>,
    svbk: u8,
    /// High RAM (127 bytes)
    hram: Vec<u8>,
    pub interrupts: InterruptController,
    pub timer: Timer,
    pub serial: Serial,
    pub ppu: Ppu,
    pub apu: GbApu,
    dma: DmaState,
    cgb: bool,
    double_speed: bool,
    key1_armed: bool,
    boot_rom: Option<Vec<u8>>,
    boot_rom_mapped: bool,
    /// Selection bits 4-5 of P1
    p1: u8,
    /// Pressed buttons, see [`buttons`]
    buttons: u8,
    /// Master clocks since load
    clock: u64,
    /// Host time at load, in seconds
    rtc_seed: u64,
    /// Master clock of the most recent completed frame
    last_blit: Option<u64>,
    pub hooks: Hooks,
}

impl GbBus {
    /// A bus in power-on state. With a boot ROM the CPU starts at 0x0000,
    /// otherwise the caller applies the post-boot state.
    pub fn new(cart: Option<Cartridge>, cgb: bool, boot_rom: Option<Vec<u8>>, div: u16, now: u64) -> Self {
        let boot_rom_mapped = boot_rom.is_some();
        Self {
            cart,
            wram: vec![0; WRAM_BANK_SIZE * if cgb { 8 } else { 2 }],
            svbk: 0,
            hram: vec![0; 0x7F],
            interrupts: InterruptController::new(),
            timer: Timer::new(div),
            serial: Serial::new(),
            ppu: Ppu::new(cgb),
            apu: GbApu::new(cgb),
            dma: DmaState::idle(),
            cgb,
            double_speed: false,
            key1_armed: false,
            boot_rom,
            boot_rom_mapped,
            p1: 0x30,
            buttons: 0,
            clock: 0,
            rtc_seed: now,
            last_blit: None,
            hooks: Hooks::default(),
        }
    }

    /// Register state the boot ROM leaves behind
    pub fn apply_post_boot(&mut self) {
        self.ppu.apply_post_boot();
        self.apu.apply_post_boot();
        self.interrupts.if_reg = Interrupt::VBlank.mask();
        self.p1 = 0;
        self.boot_rom_mapped = false;
    }

    pub fn is_cgb(&self) -> bool {
        self.cgb
    }

    pub fn double_speed(&self) -> bool {
        self.double_speed
    }

    pub fn boot_rom_mapped(&self) -> bool {
        self.boot_rom_mapped
    }

    /// Master clocks since load
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Master clock of the last completed frame, cleared by the caller
    pub fn take_blit(&mut self) -> Option<u64> {
        self.last_blit.take()
    }

    pub fn state(&self) -> BusState {
        BusState {
            wram: self.wram.clone(),
            hram: self.hram.clone(),
            svbk: self.svbk,
            double_speed: self.double_speed,
            key1_armed: self.key1_armed,
            boot_rom_mapped: self.boot_rom_mapped,
            p1: self.p1,
            buttons: self.buttons,
            clock: self.clock,
            rtc_seed: self.rtc_seed,
            dma: self.dma.clone(),
        }
    }

    /// Check that a bus state fits this machine before restoring it
    pub fn accepts(&self, state: &BusState) -> bool {
        state.wram.len() == self.wram.len() && state.hram.len() == self.hram.len()
    }

    pub fn restore(&mut self, state: BusState) {
        self.wram = state.wram;
        self.hram = state.hram;
        self.svbk = state.svbk;
        self.double_speed = state.double_speed;
        self.key1_armed = state.key1_armed;
        self.boot_rom_mapped = state.boot_rom_mapped && self.boot_rom.is_some();
        self.p1 = state.p1;
        self.buttons = state.buttons;
        self.clock = state.clock;
        self.rtc_seed = state.rtc_seed;
        self.dma = state.dma;
        self.last_blit = None;
    }

    fn wram_index(&self, addr: u16) -> usize {
        let offset = addr as usize & 0x1FFF;
        if offset < WRAM_BANK_SIZE {
            return offset;
        }
        let bank = if self.cgb { (self.svbk as usize & 7).max(1) } else { 1 };
        bank * WRAM_BANK_SIZE + (offset - WRAM_BANK_SIZE)
    }

    fn boot_rom_byte(&self, addr: u16) -> Option<u8> {
        if !self.boot_rom_mapped {
            return None;
        }
        let rom = self.boot_rom.as_ref()?;
        let a = addr as usize;
        let mapped = a < 0x100 || (self.cgb && (0x200..0x900).contains(&a));
        if mapped {
            rom.get(a).copied()
        } else {
            None
        }
    }

    fn rtc_now(&mut self) -> u64 {
        match &mut self.hooks.rtc {
            Some(cb) => cb(),
            None => self.rtc_seed + self.clock / CLOCKS_PER_SECOND,
        }
    }

    pub(crate) fn sync_rtc(&mut self) {
        let has_rtc = self.cart.as_ref().is_some_and(|c| c.features.has_rtc);
        if !has_rtc {
            return;
        }
        let now = self.rtc_now();
        if let Some(rtc) = self.cart.as_mut().and_then(|c| c.mapper.rtc_mut()) {
            rtc.set_now(now);
        }
    }

    fn joypad_lines(&self) -> u8 {
        let mut lines = 0x0F;
        if self.p1 & 0x10 == 0 {
            lines &= !(self.buttons >> 4);
        }
        if self.p1 & 0x20 == 0 {
            lines &= !self.buttons;
        }
        lines & 0x0F
    }

    /// Update the pressed buttons; a line going low requests the joypad
    /// interrupt.
    pub fn set_buttons(&mut self, pressed: u8) {
        let before = self.joypad_lines();
        self.buttons = pressed;
        if before & !self.joypad_lines() != 0 {
            self.interrupts.request(Interrupt::Joypad);
        }
    }

    fn poll_input(&mut self) {
        if let Some(getter) = &mut self.hooks.input {
            let pressed = getter();
            self.set_buttons(pressed);
        }
    }

    /// Read without side effects: no callbacks, no lockout, no DMA effects
    pub fn peek(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x7FFF => {
                if let Some(b) = self.boot_rom_byte(addr) {
                    return b;
                }
                self.cart.as_ref().map_or(0xFF, |c| c.mapper.read_rom(addr))
            }
            0x8000..=0x9FFF => self.ppu.read_vram(addr),
            0xA000..=0xBFFF => self.cart.as_ref().map_or(0xFF, |c| c.mapper.read_ram(addr)),
            0xC000..=0xFDFF => self.wram[self.wram_index(addr)],
            0xFE00..=0xFE9F => self.ppu.read_oam(addr - 0xFE00),
            0xFEA0..=0xFEFF => 0xFF,
            0xFF00..=0xFF7F => self.read_io(addr),
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize],
            0xFFFF => self.interrupts.ie,
        }
    }

    /// Write RAM regions without callbacks. ROM and I/O are left alone.
    pub fn poke(&mut self, addr: u16, val: u8) {
        match addr {
            0x8000..=0x9FFF => self.ppu.write_vram(addr, val),
            0xA000..=0xBFFF => {
                if let Some(cart) = &mut self.cart {
                    let map = cart.mapper.bank_map();
                    map.write_ram(cart.mapper.ram_mut(), addr, val);
                }
            }
            0xC000..=0xFDFF => {
                let i = self.wram_index(addr);
                self.wram[i] = val;
            }
            0xFE00..=0xFE9F => self.ppu.write_oam(addr - 0xFE00, val),
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = val,
            0xFFFF => self.interrupts.ie = val,
            _ => {}
        }
    }

    pub fn memory_area(&self, area: MemoryArea) -> Option<&[u8]> {
        match area {
            MemoryArea::Vram => Some(self.ppu.vram()),
            MemoryArea::Rom => self.cart.as_ref().map(|c| c.mapper.rom()),
            MemoryArea::Wram => Some(&self.wram),
            MemoryArea::CartRam => self.cart.as_ref().map(|c| c.mapper.ram()).filter(|r| !r.is_empty()),
            MemoryArea::Oam => Some(self.ppu.oam()),
            MemoryArea::Hram => Some(&self.hram),
        }
    }

    pub fn link_status(&mut self, cmd: LinkCommand) -> u8 {
        let (val, irq) = self.serial.link_status(cmd);
        if irq {
            self.interrupts.request(Interrupt::Serial);
        }
        val
    }

    /// CPU-visible read, with lockouts
    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x8000..=0x9FFF if !self.ppu.vram_accessible() => 0xFF,
            0xA000..=0xBFFF => {
                self.sync_rtc();
                self.peek(addr)
            }
            0xFE00..=0xFEFF if self.dma.oam_active() || !self.ppu.oam_accessible() => 0xFF,
            0xFF00 => {
                self.poll_input();
                self.read_io(addr)
            }
            _ => self.peek(addr),
        }
    }

    fn read_io(&self, addr: u16) -> u8 {
        match addr {
            0xFF00 => 0xC0 | self.p1 | self.joypad_lines(),
            0xFF01 | 0xFF02 => self.serial.read_register(addr, self.cgb),
            0xFF04..=0xFF07 => self.timer.read_register(addr),
            0xFF0F => self.interrupts.read_if(),
            0xFF10..=0xFF3F => self.apu.read_register(addr),
            0xFF46 => self.dma.oam_reg,
            0xFF40..=0xFF4B => self.ppu.read_register(addr),
            0xFF4D if self.cgb => 0x7E | (self.double_speed as u8) << 7 | self.key1_armed as u8,
            0xFF4F | 0xFF68..=0xFF6C => self.ppu.read_register(addr),
            0xFF55 if self.cgb => self.read_hdma5(),
            0xFF70 if self.cgb => 0xF8 | self.svbk,
            _ => 0xFF,
        }
    }

    fn cpu_write(&mut self, addr: u16, val: u8) {
        match addr {
            0x0000..=0x7FFF => {
                // The RTC latch lives in this range
                self.sync_rtc();
                if let Some(cart) = &mut self.cart {
                    cart.mapper.write_rom(addr, val);
                }
            }
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.write_vram(addr, val);
                }
            }
            0xA000..=0xBFFF => {
                self.sync_rtc();
                if let Some(cart) = &mut self.cart {
                    cart.mapper.write_ram(addr, val);
                }
            }
            0xC000..=0xFDFF => {
                let i = self.wram_index(addr);
                self.wram[i] = val;
            }
            0xFE00..=0xFE9F => {
                if !self.dma.oam_active() && self.ppu.oam_accessible() {
                    self.ppu.write_oam(addr - 0xFE00, val);
                }
            }
            0xFEA0..=0xFEFF => {}
            0xFF00..=0xFF7F => self.write_io(addr, val),
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = val,
            0xFFFF => self.interrupts.ie = val,
        }
    }

    fn write_io(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF00 => {
                let before = self.joypad_lines();
                self.p1 = val & 0x30;
                if before & !self.joypad_lines() != 0 {
                    self.interrupts.request(Interrupt::Joypad);
                }
            }
            0xFF01 | 0xFF02 => {
                if self.serial.write_register(addr, val, self.cgb) {
                    if let Some(cb) = &mut self.hooks.link {
                        cb();
                    }
                }
            }
            0xFF04..=0xFF07 => {
                let events = self.timer.write_register(addr, val, self.double_speed);
                if events.apu_step {
                    self.apu.step_frame_sequencer();
                }
            }
            0xFF0F => self.interrupts.write_if(val),
            0xFF10..=0xFF3F => self.apu.write_register(addr, val),
            0xFF46 => {
                self.dma.oam_reg = val;
                self.dma.oam_source = (val as u16) << 8;
                self.dma.oam_index = 0;
                self.dma.oam_starting = true;
            }
            0xFF40..=0xFF4B | 0xFF4F | 0xFF68..=0xFF6C => {
                if self.ppu.write_register(addr, val) {
                    self.interrupts.request(Interrupt::LcdStat);
                }
            }
            0xFF4D if self.cgb => self.key1_armed = val & 1 != 0,
            0xFF50 => {
                if self.boot_rom_mapped {
                    log(LogCategory::Bus, LogLevel::Debug, || "boot ROM unmapped".to_string());
                }
                self.boot_rom_mapped = false;
            }
            0xFF51 if self.cgb => self.dma.hdma_source = (self.dma.hdma_source & 0x00FF) | (val as u16) << 8,
            0xFF52 if self.cgb => self.dma.hdma_source = (self.dma.hdma_source & 0xFF00) | (val & 0xF0) as u16,
            0xFF53 if self.cgb => self.dma.hdma_dest = (self.dma.hdma_dest & 0x00FF) | ((val & 0x1F) as u16) << 8,
            0xFF54 if self.cgb => self.dma.hdma_dest = (self.dma.hdma_dest & 0xFF00) | (val & 0xF0) as u16,
            0xFF55 if self.cgb => self.write_hdma5(val),
            0xFF70 if self.cgb => self.svbk = val & 0x07,
            _ => {
                log(LogCategory::Stubs, LogLevel::Trace, || {
                    format!("write to unmapped I/O {:04X} = {:02X}", addr, val)
                });
            }
        }
    }

    fn read_hdma5(&self) -> u8 {
        let left = self.dma.hdma_blocks.wrapping_sub(1) & 0x7F;
        if self.dma.hdma_hblank {
            left
        } else if self.dma.hdma_blocks == 0 {
            0xFF
        } else {
            0x80 | left
        }
    }

    fn write_hdma5(&mut self, val: u8) {
        if self.dma.hdma_hblank && val & 0x80 == 0 {
            self.dma.hdma_hblank = false;
            self.dma.hdma_block_due = false;
            return;
        }
        self.dma.hdma_blocks = (val & 0x7F) + 1;
        if val & 0x80 != 0 {
            self.dma.hdma_hblank = true;
            return;
        }
        log(LogCategory::Bus, LogLevel::Trace, || {
            format!(
                "general DMA {:04X} -> {:04X}, {} blocks",
                self.dma.hdma_source,
                0x8000 | self.dma.hdma_dest,
                self.dma.hdma_blocks
            )
        });
        while self.dma.hdma_blocks > 0 {
            self.hdma_block();
        }
    }

    /// Copy one 16-byte VRAM DMA block, stalling the CPU meanwhile
    fn hdma_block(&mut self) {
        for _ in 0..16 {
            let byte = self.dma_read(self.dma.hdma_source);
            self.ppu.write_vram(0x8000 | (self.dma.hdma_dest & 0x1FFF), byte);
            self.dma.hdma_source = self.dma.hdma_source.wrapping_add(1);
            self.dma.hdma_dest = (self.dma.hdma_dest + 1) & 0x1FFF;
        }
        self.dma.hdma_blocks -= 1;
        if self.dma.hdma_blocks == 0 {
            self.dma.hdma_hblank = false;
        }
        let stall = if self.double_speed { 16 } else { 8 };
        for _ in 0..stall {
            self.tick_components();
        }
    }

    /// Source read for DMA engines: no lockout, no callbacks
    fn dma_read(&self, addr: u16) -> u8 {
        match addr {
            0xE000..=0xFFFF => self.wram[self.wram_index(addr - 0x2000)],
            _ => self.peek(addr),
        }
    }

    fn oam_dma_step(&mut self) {
        if self.dma.oam_index >= OAM_DMA_LEN {
            return;
        }
        if self.dma.oam_starting {
            self.dma.oam_starting = false;
            return;
        }
        let i = self.dma.oam_index as u16;
        let byte = self.dma_read(self.dma.oam_source + i);
        self.ppu.write_oam(i, byte);
        self.dma.oam_index += 1;
    }

    /// Advance everything but the CPU by one machine cycle
    fn tick_components(&mut self) {
        let clocks = if self.double_speed { 2 } else { 4 };
        self.clock += clocks as u64;

        let timer = self.timer.tick(self.double_speed);
        if timer.interrupt {
            self.interrupts.request(Interrupt::Timer);
        }
        if timer.apu_step {
            self.apu.step_frame_sequencer();
        }

        if self.serial.tick(4) {
            self.interrupts.request(Interrupt::Serial);
        }

        let ppu = self.ppu.tick(clocks);
        if ppu.vblank {
            self.interrupts.request(Interrupt::VBlank);
        }
        if ppu.stat {
            self.interrupts.request(Interrupt::LcdStat);
        }
        if ppu.hblank && self.dma.hdma_hblank {
            self.dma.hdma_block_due = true;
        }
        if ppu.line_start {
            if let Some((cb, line)) = &mut self.hooks.scanline {
                if self.ppu.ly() == *line {
                    cb();
                }
            }
        }
        if ppu.frame_done {
            self.last_blit = Some(self.clock);
            self.poll_input();
        }

        self.apu.tick(clocks);
        self.oam_dma_step();
    }

    /// One CPU machine cycle, including any VRAM DMA block it triggered
    fn cycle(&mut self) {
        self.tick_components();
        if self.dma.hdma_block_due {
            self.dma.hdma_block_due = false;
            self.hdma_block();
        }
    }

    fn classify(&mut self, addr: u16, kind: CdlKind) {
        if self.hooks.cdl.is_none() || self.boot_rom_byte(addr).is_some() {
            return;
        }
        let entry = match addr {
            0x0000..=0x7FFF => self.cart.as_ref().map(|c| {
                let map = c.mapper.bank_map();
                let base = if addr < 0x4000 { map.rom0_offset } else { map.romx_offset };
                (CdlRegion::Rom, base + (addr as usize & 0x3FFF))
            }),
            0xA000..=0xBFFF => self.cart.as_ref().and_then(|c| {
                let offset = c.mapper.bank_map().ram_offset?;
                Some((CdlRegion::CartRam, offset + (addr as usize & 0x1FFF)))
            }),
            0xC000..=0xFDFF => Some((CdlRegion::Wram, self.wram_index(addr))),
            0xFF80..=0xFFFE => Some((CdlRegion::Hram, (addr - 0xFF80) as usize)),
            _ => None,
        };
        if let (Some((region, offset)), Some(cb)) = (entry, &mut self.hooks.cdl) {
            cb(CdlEntry {
                region,
                offset: offset as u32,
                kind,
            });
        }
    }
}

impl MemoryLr35902 for GbBus {
    fn read(&mut self, addr: u16) -> u8 {
        let val = self.cpu_read(addr);
        if let Some(cb) = &mut self.hooks.read {
            cb(addr, self.clock);
        }
        self.classify(addr, CdlKind::Data);
        self.cycle();
        val
    }

    fn write(&mut self, addr: u16, val: u8) {
        self.cpu_write(addr, val);
        if let Some(cb) = &mut self.hooks.write {
            cb(addr, self.clock);
        }
        self.cycle();
    }

    fn fetch(&mut self, addr: u16, kind: Fetch) -> u8 {
        let val = self.cpu_read(addr);
        match kind {
            Fetch::Opcode => {
                if let Some(cb) = &mut self.hooks.exec {
                    cb(addr, self.clock);
                }
                self.classify(addr, CdlKind::ExecOpcode);
            }
            Fetch::Operand => self.classify(addr, CdlKind::ExecOperand),
        }
        self.cycle();
        val
    }

    fn tick(&mut self) {
        self.cycle();
    }

    fn pending_interrupts(&self) -> u8 {
        self.interrupts.pending()
    }

    fn acknowledge_interrupt(&mut self, bit: u8) {
        self.interrupts.acknowledge(bit);
    }

    fn stop(&mut self) -> bool {
        // STOP resets the divider in both cases
        let events = self.timer.write_register(0xFF04, 0, self.double_speed);
        if events.apu_step {
            self.apu.step_frame_sequencer();
        }
        if self.cgb && self.key1_armed {
            self.double_speed = !self.double_speed;
            self.key1_armed = false;
            log(LogCategory::Bus, LogLevel::Debug, || {
                format!("speed switch: {} speed", if self.double_speed { "double" } else { "normal" })
            });
            // The rest of the machine keeps running at the new speed
            for _ in 0..SPEED_SWITCH_CYCLES {
                self.tick_components();
            }
            return true;
        }
        false
    }

    fn stop_wakeup(&mut self) -> bool {
        self.poll_input();
        self.buttons != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn cart(cart_type: u8, rom_banks: usize, ram_code: u8) -> Cartridge {
        let mut rom = vec![0u8; rom_banks * 0x4000];
        for (bank, chunk) in rom.chunks_mut(0x4000).enumerate() {
            chunk[0x100] = bank as u8;
        }
        rom[0x147] = cart_type;
        rom[0x148] = (rom_banks / 2).trailing_zeros() as u8;
        rom[0x149] = ram_code;
        Cartridge::load(&rom, 0, false).expect("synthetic cart")
    }

    fn dmg_bus() -> GbBus {
        let mut bus = GbBus::new(Some(cart(0x00, 2, 0)), false, None, 0, 0);
        bus.apply_post_boot();
        bus
    }

    fn cgb_bus() -> GbBus {
        let mut bus = GbBus::new(Some(cart(0x00, 2, 0)), true, None, 0, 0);
        bus.apply_post_boot();
        bus
    }

    #[test]
    fn test_wram_and_echo() {
        let mut bus = dmg_bus();
        bus.write(0xC123, 0x42);
        assert_eq!(bus.read(0xE123), 0x42);
        bus.write(0xFD00, 0x17);
        assert_eq!(bus.read(0xDD00), 0x17);
    }

    #[test]
    fn test_cgb_wram_banks() {
        let mut bus = cgb_bus();
        bus.write(0xFF70, 0);
        bus.write(0xD000, 1);
        bus.write(0xFF70, 2);
        bus.write(0xD000, 2);
        assert_eq!(bus.read(0xFF70), 0xFA);
        bus.write(0xFF70, 1);
        assert_eq!(bus.read(0xD000), 1);
        bus.write(0xFF70, 2);
        assert_eq!(bus.read(0xD000), 2);
    }

    #[test]
    fn test_hram_and_ie() {
        let mut bus = dmg_bus();
        bus.write(0xFF80, 0x11);
        bus.write(0xFFFF, 0x1F);
        assert_eq!(bus.read(0xFF80), 0x11);
        assert_eq!(bus.read(0xFFFF), 0x1F);
        assert_eq!(bus.pending_interrupts(), 0x01);
    }

    #[test]
    fn test_each_access_is_one_machine_cycle() {
        let mut bus = dmg_bus();
        bus.read(0xC000);
        bus.write(0xC000, 0);
        bus.tick();
        assert_eq!(bus.clock(), 12);
    }

    #[test]
    fn test_oam_dma() {
        let mut bus = dmg_bus();
        bus.write(0xFF40, 0x00); // LCD off so OAM is open
        for i in 0..0xA0u16 {
            bus.write(0xC000 + i, i as u8);
        }
        bus.write(0xFF46, 0xC0);
        assert_eq!(bus.read(0xFF46), 0xC0);
        // Transfer in progress: OAM reads 0xFF
        assert_eq!(bus.read(0xFE00), 0xFF);
        for _ in 0..160 {
            bus.tick();
        }
        assert_eq!(bus.read(0xFE00), 0x00);
        assert_eq!(bus.read(0xFE9F), 0x9F);
    }

    #[test]
    fn test_vram_locked_in_mode_3() {
        let mut bus = dmg_bus();
        bus.poke(0x8000, 0x5A);
        // Mode 2 lasts 80 clocks (20 cycles)
        for _ in 0..20 {
            bus.tick();
        }
        assert_eq!(bus.ppu.mode(), 3);
        assert_eq!(bus.read(0x8000), 0xFF);
        assert_eq!(bus.peek(0x8000), 0x5A);
    }

    #[test]
    fn test_general_hdma() {
        let mut bus = cgb_bus();
        bus.write(0xFF40, 0x00);
        for i in 0..0x20u16 {
            bus.write(0xC000 + i, 0x80 + i as u8);
        }
        bus.write(0xFF51, 0xC0);
        bus.write(0xFF52, 0x00);
        bus.write(0xFF53, 0x01);
        bus.write(0xFF54, 0x00);
        let before = bus.clock();
        bus.write(0xFF55, 0x01); // 2 blocks
        // 2 blocks of 8 stall cycles plus the write itself
        assert_eq!(bus.clock() - before, 4 * 17);
        assert_eq!(bus.read(0xFF55), 0xFF);
        assert_eq!(bus.peek(0x8100), 0x80);
        assert_eq!(bus.peek(0x811F), 0x9F);
    }

    #[test]
    fn test_hblank_hdma_one_block_per_line() {
        let mut bus = cgb_bus();
        bus.write(0xFF51, 0xC0);
        bus.write(0xFF52, 0x00);
        bus.write(0xFF53, 0x00);
        bus.write(0xFF54, 0x00);
        bus.write(0xFF55, 0x81); // 2 blocks, HBlank mode
        assert_eq!(bus.read(0xFF55), 0x01);
        for _ in 0..(456 / 4) {
            bus.tick();
        }
        assert_eq!(bus.read(0xFF55), 0x00);
        for _ in 0..(456 / 4) {
            bus.tick();
        }
        assert_eq!(bus.read(0xFF55), 0xFF);
    }

    #[test]
    fn test_joypad_matrix_and_interrupt() {
        let mut bus = dmg_bus();
        bus.interrupts.if_reg = 0;
        bus.write(0xFF00, 0x20); // directions
        bus.set_buttons(buttons::DOWN | buttons::A);
        assert_eq!(bus.read(0xFF00) & 0x0F, 0x07);
        assert_ne!(bus.interrupts.if_reg & Interrupt::Joypad.mask(), 0);

        bus.write(0xFF00, 0x10); // buttons
        assert_eq!(bus.read(0xFF00) & 0x0F, 0x0E);
        bus.write(0xFF00, 0x30);
        assert_eq!(bus.read(0xFF00), 0xFF);
    }

    #[test]
    fn test_input_getter_polled_on_read() {
        let mut bus = dmg_bus();
        bus.hooks.input = Some(Box::new(|| buttons::START));
        bus.write(0xFF00, 0x10);
        assert_eq!(bus.read(0xFF00) & 0x0F, 0x07);
        assert!(bus.stop_wakeup());
    }

    #[test]
    fn test_boot_rom_overlay() {
        let boot = vec![0xAA; 0x100];
        let mut bus = GbBus::new(Some(cart(0x00, 2, 0)), false, Some(boot), 0, 0);
        assert_eq!(bus.read(0x0000), 0xAA);
        assert_eq!(bus.read(0x0100), 0x00);
        bus.write(0xFF50, 1);
        assert_eq!(bus.read(0x0000), 0x00);
    }

    #[test]
    fn test_cgb_boot_rom_has_gap_for_header() {
        let boot = vec![0xBB; 0x900];
        let mut bus = GbBus::new(Some(cart(0x00, 2, 0)), true, Some(boot), 0, 0);
        assert_eq!(bus.read(0x00FF), 0xBB);
        assert_eq!(bus.read(0x0147), 0x00);
        assert_eq!(bus.read(0x0200), 0xBB);
        assert_eq!(bus.read(0x0900), 0x00);
    }

    #[test]
    fn test_speed_switch() {
        let mut bus = cgb_bus();
        assert_eq!(bus.read(0xFF4D), 0x7E);
        bus.write(0xFF4D, 0x01);
        assert_eq!(bus.read(0xFF4D), 0x7F);
        let start = bus.clock();
        assert!(bus.stop());
        assert!(bus.double_speed());
        // The pause runs at double speed
        assert_eq!(bus.clock() - start, SPEED_SWITCH_CYCLES as u64 * 2);
        // STOP cleared DIV, which kept counting through the pause
        assert_eq!(bus.peek(0xFF04), (SPEED_SWITCH_CYCLES * 4 >> 8) as u8);
        assert_eq!(bus.read(0xFF4D), 0xFE);

        let before = bus.clock();
        bus.tick();
        assert_eq!(bus.clock() - before, 2);

        // Not armed: plain STOP
        assert!(!bus.stop());
    }

    #[test]
    fn test_key1_ignored_on_dmg() {
        let mut bus = dmg_bus();
        bus.write(0xFF4D, 0x01);
        assert_eq!(bus.read(0xFF4D), 0xFF);
        assert!(!bus.stop());
    }

    #[test]
    fn test_callbacks_skip_peek_and_poke() {
        let mut bus = dmg_bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let reads = Arc::clone(&seen);
        bus.hooks.read = Some(Box::new(move |addr, _| reads.lock().unwrap().push(addr)));

        bus.poke(0xC000, 1);
        assert_eq!(bus.peek(0xC000), 1);
        assert!(seen.lock().unwrap().is_empty());

        bus.read(0xC000);
        assert_eq!(*seen.lock().unwrap(), vec![0xC000]);
    }

    #[test]
    fn test_poke_leaves_mapper_alone() {
        let mut bus = GbBus::new(Some(cart(0x01, 4, 0)), false, None, 0, 0);
        bus.poke(0x2000, 2);
        assert_eq!(bus.peek(0x4100), 1);
        bus.write(0x2000, 2);
        assert_eq!(bus.peek(0x4100), 2);
    }

    #[test]
    fn test_cdl_reports_physical_rom_offset() {
        let mut bus = GbBus::new(Some(cart(0x01, 4, 0)), false, None, 0, 0);
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        bus.hooks.cdl = Some(Box::new(move |e| sink.lock().unwrap().push(e)));
        bus.write(0x2000, 3);
        bus.fetch(0x4010, Fetch::Opcode);
        assert_eq!(
            log.lock().unwrap()[0],
            CdlEntry {
                region: CdlRegion::Rom,
                offset: 3 * 0x4000 + 0x10,
                kind: CdlKind::ExecOpcode,
            }
        );
    }

    #[test]
    fn test_memory_areas() {
        let bus = dmg_bus();
        assert_eq!(bus.memory_area(MemoryArea::Rom).map(|r| r.len()), Some(0x8000));
        assert_eq!(bus.memory_area(MemoryArea::Wram).map(|r| r.len()), Some(0x2000));
        assert_eq!(bus.memory_area(MemoryArea::Hram).map(|r| r.len()), Some(0x7F));
        assert!(bus.memory_area(MemoryArea::CartRam).is_none());
    }

    #[test]
    fn test_rtc_time_follows_emulated_clock() {
        // MBC3+TIMER+RAM+BATTERY
        let mut bus = GbBus::new(Some(cart(0x10, 4, 2)), false, None, 0, 0);
        bus.write(0x0000, 0x0A);
        bus.write(0x4000, 0x08);
        for _ in 0..(CLOCKS_PER_SECOND / 4) {
            bus.tick();
        }
        bus.write(0x6000, 0);
        bus.write(0x6000, 1);
        assert_eq!(bus.read(0xA000), 1);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut bus = cgb_bus();
        bus.write(0xFF70, 3);
        bus.write(0xD000, 0x77);
        let state = bus.state();

        let mut other = cgb_bus();
        assert!(other.accepts(&state));
        other.restore(state);
        assert_eq!(other.read(0xD000), 0x77);
        assert!(!dmg_bus().accepts(&bus.state()));
    }
}
