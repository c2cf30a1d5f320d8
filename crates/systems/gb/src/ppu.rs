//! Game Boy PPU (LCD Controller) implementation
//!
//! # Line Timeline
//!
//! Every line takes 456 clocks. Visible lines (0-143) run mode 2 (OAM scan)
//! for 80 clocks, then mode 3 (pixel transfer) for a variable length, then
//! mode 0 (HBlank) for the rest. Lines 144-153 are mode 1 (VBlank).
//!
//! Mode 3 lasts `172 + (SCX & 7)` clocks, plus 6 when the window starts on
//! the line, plus object fetch penalties. Objects and the window are picked
//! when mode 3 starts. Pixels then leave at one per clock after the fetch
//! delay, and every register write that changes the picture first draws the
//! pixels already shifted out, so mid-line writes split the line where they
//! land.
//!
//! # STAT Interrupt
//!
//! The enabled sources (mode 0, mode 1, mode 2, LY=LYC) are ORed into one
//! line and only a rising edge requests the interrupt, so a source that
//! becomes true while another one already holds the line is swallowed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SCREEN_WIDTH: usize = 160;
pub const SCREEN_HEIGHT: usize = 144;

pub const LINE_CLOCKS: u32 = 456;
pub const FRAME_CLOCKS: u32 = LINE_CLOCKS * 154;
const MODE2_CLOCKS: u32 = 80;
const MODE3_BASE_CLOCKS: u32 = 172;
const MODE3_MAX_CLOCKS: u32 = 289;
const OAM_LEN: usize = 0xA0;
const PALETTE_RAM_LEN: usize = 64;
const MAX_LINE_OBJECTS: usize = 10;

/// Layer mask bits for [`Ppu::set_layers`]
pub const LAYER_BG: u8 = 1;
pub const LAYER_OBJ: u8 = 2;
pub const LAYER_WINDOW: u8 = 4;
pub const LAYER_ALL: u8 = LAYER_BG | LAYER_OBJ | LAYER_WINDOW;

// LCDC bits
const LCDC_ENABLE: u8 = 0x80;
const LCDC_WIN_TILEMAP: u8 = 0x40;
const LCDC_WIN_ENABLE: u8 = 0x20;
const LCDC_BG_WIN_TILES: u8 = 0x10;
const LCDC_BG_TILEMAP: u8 = 0x08;
const LCDC_OBJ_SIZE: u8 = 0x04;
const LCDC_OBJ_ENABLE: u8 = 0x02;
const LCDC_BG_WIN_ENABLE: u8 = 0x01;

// STAT interrupt source bits
const STAT_LYC: u8 = 0x40;
const STAT_MODE2: u8 = 0x20;
const STAT_MODE1: u8 = 0x10;
const STAT_MODE0: u8 = 0x08;

/// White to black, the default for every DMG palette
pub const DEFAULT_DMG_COLORS: [u32; 4] = [0xFFFFFFFF, 0xFFAAAAAA, 0xFF555555, 0xFF000000];

/// What happened during one PPU update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PpuEvents {
    pub vblank: bool,
    pub stat: bool,
    /// Mode 0 started on a visible line (HBlank DMA trigger)
    pub hblank: bool,
    /// A full frame is in the framebuffer
    pub frame_done: bool,
    /// A new line started, LY changed
    pub line_start: bool,
}

impl PpuEvents {
    fn merge(&mut self, other: PpuEvents) {
        self.vblank |= other.vblank;
        self.stat |= other.stat;
        self.hblank |= other.hblank;
        self.frame_done |= other.frame_done;
        self.line_start |= other.line_start;
    }
}

/// Game Boy PPU state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ppu {
    /// VRAM, two 8KB banks on CGB
    vram: Vec<u8>,
    vram_bank: u8,
    /// OAM (Object Attribute Memory - 160 bytes)
    oam: Vec<u8>,

    /// LCD Control (0xFF40)
    pub lcdc: u8,
    /// Writable STAT bits 3-6 (0xFF41)
    stat: u8,
    /// Scroll Y (0xFF42)
    pub scy: u8,
    /// Scroll X (0xFF43)
    pub scx: u8,
    /// Current line
    ly: u8,
    /// LY Compare (0xFF45)
    pub lyc: u8,
    /// BG Palette (0xFF47)
    pub bgp: u8,
    /// OBJ Palette 0 (0xFF48)
    pub obp0: u8,
    /// OBJ Palette 1 (0xFF49)
    pub obp1: u8,
    /// Window Y (0xFF4A)
    pub wy: u8,
    /// Window X (0xFF4B)
    pub wx: u8,

    /// CGB palette RAM, 8 palettes x 4 colours x 2 bytes each
    bg_palette_ram: Vec<u8>,
    obj_palette_ram: Vec<u8>,
    bcps: u8,
    ocps: u8,
    /// Object priority mode (0xFF6C), bit 0 set = by X coordinate
    opri: u8,

    cgb: bool,
    mode: u8,
    /// Clock within the current line
    line_clock: u32,
    mode3_clocks: u32,
    window_line: u8,
    /// LY matched WY at some point this frame
    wy_triggered: bool,
    /// The window may open on the current line
    line_window: bool,
    /// At least one window pixel was fetched on the current line
    window_drawn: bool,
    /// OAM indices picked for the current line, highest priority first
    line_objects: Vec<u8>,
    /// Next pixel of the current line to draw
    rendered_x: u8,
    stat_line: bool,
    /// Clocks since the LCD was switched off
    off_clock: u32,

    framebuffer: Vec<u32>,

    #[serde(skip)]
    dmg_colors: [[u32; 4]; 3],
    #[serde(skip)]
    cgb_lut: Option<Arc<[u32]>>,
    #[serde(skip)]
    layers: u8,
    #[serde(skip)]
    bg_colors: [u32; 32],
    #[serde(skip)]
    obj_colors: [u32; 32],
}

impl Ppu {
    pub fn new(cgb: bool) -> Self {
        let mut ppu = Self {
            vram: vec![0; if cgb { 0x4000 } else { 0x2000 }],
            vram_bank: 0,
            oam: vec![0; OAM_LEN],
            lcdc: 0,
            stat: 0,
            scy: 0,
            scx: 0,
            ly: 0,
            lyc: 0,
            bgp: 0,
            obp0: 0,
            obp1: 0,
            wy: 0,
            wx: 0,
            bg_palette_ram: vec![0xFF; PALETTE_RAM_LEN],
            obj_palette_ram: vec![0xFF; PALETTE_RAM_LEN],
            bcps: 0,
            ocps: 0,
            opri: if cgb { 0 } else { 1 },
            cgb,
            mode: 0,
            line_clock: 0,
            mode3_clocks: MODE3_BASE_CLOCKS,
            window_line: 0,
            wy_triggered: false,
            line_window: false,
            window_drawn: false,
            line_objects: Vec::with_capacity(MAX_LINE_OBJECTS),
            rendered_x: 0,
            stat_line: false,
            off_clock: 0,
            framebuffer: vec![0xFFFFFFFF; SCREEN_WIDTH * SCREEN_HEIGHT],
            dmg_colors: [DEFAULT_DMG_COLORS; 3],
            cgb_lut: None,
            layers: LAYER_ALL,
            bg_colors: [0; 32],
            obj_colors: [0; 32],
        };
        ppu.refresh_colors();
        ppu
    }

    /// Register values left behind by the boot ROM
    pub fn apply_post_boot(&mut self) {
        self.bgp = 0xFC;
        self.obp0 = 0xFF;
        self.obp1 = 0xFF;
        self.write_register(0xFF40, 0x91);
    }

    /// Take over a restored state, keeping host display settings
    pub fn restore(&mut self, mut state: Ppu) {
        state.dmg_colors = self.dmg_colors;
        state.cgb_lut = self.cgb_lut.take();
        state.layers = self.layers;
        *self = state;
        self.refresh_colors();
    }

    /// Whether a deserialized PPU can run: every buffer has its hardware
    /// size and the line position agrees with the mode
    pub fn accepts(&self) -> bool {
        let vram_len = if self.cgb { 0x4000 } else { 0x2000 };
        let sizes = self.vram.len() == vram_len
            && self.oam.len() == OAM_LEN
            && self.framebuffer.len() == SCREEN_WIDTH * SCREEN_HEIGHT
            && self.bg_palette_ram.len() == PALETTE_RAM_LEN
            && self.obj_palette_ram.len() == PALETTE_RAM_LEN;
        let line = self.line_objects.len() <= MAX_LINE_OBJECTS
            && self.line_objects.iter().all(|&i| (i as usize) < OAM_LEN / 4)
            && self.rendered_x as usize <= SCREEN_WIDTH
            && (MODE3_BASE_CLOCKS..=MODE3_MAX_CLOCKS).contains(&self.mode3_clocks);
        let registers = (self.cgb || self.vram_bank == 0) && self.vram_bank <= 1 && self.off_clock < FRAME_CLOCKS;
        sizes && line && registers && self.position_valid()
    }

    fn position_valid(&self) -> bool {
        if self.line_clock >= LINE_CLOCKS || self.ly > 153 {
            return false;
        }
        if !self.lcd_on() {
            return true;
        }
        let mode3_end = MODE2_CLOCKS + self.mode3_clocks;
        match (self.ly < SCREEN_HEIGHT as u8, self.mode) {
            (false, mode) => mode == 1,
            (true, 2) => self.line_clock < MODE2_CLOCKS,
            (true, 3) => (MODE2_CLOCKS..mode3_end).contains(&self.line_clock),
            (true, 0) => self.line_clock >= mode3_end,
            _ => false,
        }
    }

    pub fn is_cgb(&self) -> bool {
        self.cgb
    }

    pub fn frame(&self) -> &[u32] {
        &self.framebuffer
    }

    pub fn set_layers(&mut self, mask: u8) {
        self.layers = mask & LAYER_ALL;
    }

    pub fn layers(&self) -> u8 {
        self.layers
    }

    /// Override one colour of a DMG palette: 0 = BG, 1 = OBP0, 2 = OBP1
    pub fn set_dmg_palette_color(&mut self, palette: usize, index: usize, rgb32: u32) {
        if let Some(slot) = self.dmg_colors.get_mut(palette).and_then(|p| p.get_mut(index)) {
            *slot = rgb32;
        }
    }

    /// Install a 32768-entry BGR555 lookup table, `None` restores the default
    pub fn set_cgb_lut(&mut self, lut: Option<Arc<[u32]>>) {
        self.cgb_lut = lut.filter(|l| l.len() >= 0x8000);
        self.refresh_colors();
    }

    fn convert_color(&self, bgr555: u16) -> u32 {
        let c = bgr555 & 0x7FFF;
        if let Some(lut) = &self.cgb_lut {
            return lut[c as usize];
        }
        let expand = |v: u16| {
            let v = (v & 0x1F) as u32;
            (v << 3) | (v >> 2)
        };
        0xFF000000 | (expand(c) << 16) | (expand(c >> 5) << 8) | expand(c >> 10)
    }

    fn refresh_colors(&mut self) {
        for i in 0..32 {
            self.bg_colors[i] = self.convert_color(palette_entry(&self.bg_palette_ram, i));
            self.obj_colors[i] = self.convert_color(palette_entry(&self.obj_palette_ram, i));
        }
    }

    fn lcd_on(&self) -> bool {
        self.lcdc & LCDC_ENABLE != 0
    }

    /// LY as the CPU sees it: line 153 reads 0 after its first 4 clocks
    pub fn ly(&self) -> u8 {
        if self.ly == 153 && self.line_clock >= 4 {
            0
        } else {
            self.ly
        }
    }

    pub fn mode(&self) -> u8 {
        if self.lcd_on() {
            self.mode
        } else {
            0
        }
    }

    pub fn vram_accessible(&self) -> bool {
        self.mode() != 3
    }

    pub fn oam_accessible(&self) -> bool {
        !matches!(self.mode(), 2 | 3)
    }

    pub fn read_vram(&self, addr: u16) -> u8 {
        self.vram.get(self.vram_index(addr)).copied().unwrap_or(0xFF)
    }

    pub fn write_vram(&mut self, addr: u16, val: u8) {
        let i = self.vram_index(addr);
        if let Some(slot) = self.vram.get_mut(i) {
            *slot = val;
        }
    }

    fn vram_index(&self, addr: u16) -> usize {
        (self.vram_bank as usize & 1) * 0x2000 + (addr as usize & 0x1FFF)
    }

    /// VRAM byte by raw offset for the pixel pipeline
    fn vram_byte(&self, offset: usize) -> u8 {
        self.vram.get(offset).copied().unwrap_or(0)
    }

    pub fn read_oam(&self, addr: u16) -> u8 {
        self.oam.get(addr as usize).copied().unwrap_or(0xFF)
    }

    pub fn write_oam(&mut self, addr: u16, val: u8) {
        if let Some(slot) = self.oam.get_mut(addr as usize) {
            *slot = val;
        }
    }

    pub fn vram(&self) -> &[u8] {
        &self.vram
    }

    pub fn oam(&self) -> &[u8] {
        &self.oam
    }

    pub fn read_register(&self, addr: u16) -> u8 {
        match addr {
            0xFF40 => self.lcdc,
            0xFF41 => {
                let coincidence = if self.lcd_on() && self.ly() == self.lyc { 0x04 } else { 0 };
                0x80 | self.stat | coincidence | self.mode()
            }
            0xFF42 => self.scy,
            0xFF43 => self.scx,
            0xFF44 => {
                if self.lcd_on() {
                    self.ly()
                } else {
                    0
                }
            }
            0xFF45 => self.lyc,
            0xFF47 => self.bgp,
            0xFF48 => self.obp0,
            0xFF49 => self.obp1,
            0xFF4A => self.wy,
            0xFF4B => self.wx,
            0xFF4F if self.cgb => 0xFE | self.vram_bank,
            0xFF68 if self.cgb => self.bcps | 0x40,
            0xFF69 if self.cgb => self.read_palette(false),
            0xFF6A if self.cgb => self.ocps | 0x40,
            0xFF6B if self.cgb => self.read_palette(true),
            0xFF6C if self.cgb => 0xFE | self.opri,
            _ => 0xFF,
        }
    }

    /// Register write. Returns a STAT interrupt request caused by the write.
    pub fn write_register(&mut self, addr: u16, val: u8) -> bool {
        if matches!(addr, 0xFF40 | 0xFF42 | 0xFF43 | 0xFF47..=0xFF4B | 0xFF69 | 0xFF6B) {
            self.catch_up();
        }
        match addr {
            0xFF40 => {
                let was_on = self.lcd_on();
                self.lcdc = val;
                if was_on && !self.lcd_on() {
                    self.ly = 0;
                    self.line_clock = 0;
                    self.mode = 0;
                    self.off_clock = 0;
                    self.stat_line = false;
                } else if !was_on && self.lcd_on() {
                    self.ly = 0;
                    self.line_clock = 0;
                    self.mode = 2;
                    self.window_line = 0;
                    self.wy_triggered = self.wy == 0;
                    return self.update_stat_line();
                }
                false
            }
            0xFF41 => {
                self.stat = val & 0x78;
                self.update_stat_line()
            }
            0xFF42 => {
                self.scy = val;
                false
            }
            0xFF43 => {
                self.scx = val;
                false
            }
            0xFF45 => {
                self.lyc = val;
                self.update_stat_line()
            }
            0xFF47 => {
                self.bgp = val;
                false
            }
            0xFF48 => {
                self.obp0 = val;
                false
            }
            0xFF49 => {
                self.obp1 = val;
                false
            }
            0xFF4A => {
                self.wy = val;
                false
            }
            0xFF4B => {
                self.wx = val;
                false
            }
            0xFF4F if self.cgb => {
                self.vram_bank = val & 1;
                false
            }
            0xFF68 if self.cgb => {
                self.bcps = val & 0xBF;
                false
            }
            0xFF69 if self.cgb => {
                self.write_palette(false, val);
                false
            }
            0xFF6A if self.cgb => {
                self.ocps = val & 0xBF;
                false
            }
            0xFF6B if self.cgb => {
                self.write_palette(true, val);
                false
            }
            0xFF6C if self.cgb => {
                self.opri = val & 1;
                false
            }
            _ => false,
        }
    }

    fn read_palette(&self, obj: bool) -> u8 {
        if self.mode() == 3 {
            return 0xFF;
        }
        let (spec, ram) = if obj {
            (self.ocps, &self.obj_palette_ram)
        } else {
            (self.bcps, &self.bg_palette_ram)
        };
        ram.get((spec & 0x3F) as usize).copied().unwrap_or(0xFF)
    }

    fn write_palette(&mut self, obj: bool, val: u8) {
        let locked = self.mode() == 3;
        let spec = if obj { &mut self.ocps } else { &mut self.bcps };
        let index = (*spec & 0x3F) as usize;
        if *spec & 0x80 != 0 {
            *spec = (*spec & 0x80) | ((*spec + 1) & 0x3F);
        }
        if locked {
            return;
        }
        let ram = if obj {
            &mut self.obj_palette_ram
        } else {
            &mut self.bg_palette_ram
        };
        if let Some(slot) = ram.get_mut(index) {
            *slot = val;
        }
        let entry = index / 2;
        let raw = palette_entry(ram, entry);
        let color = self.convert_color(raw);
        if obj {
            self.obj_colors[entry] = color;
        } else {
            self.bg_colors[entry] = color;
        }
    }

    fn stat_signal(&self) -> bool {
        if !self.lcd_on() {
            return false;
        }
        (self.stat & STAT_LYC != 0 && self.ly() == self.lyc)
            || (self.stat & STAT_MODE0 != 0 && self.mode == 0)
            || (self.stat & STAT_MODE1 != 0 && self.mode == 1)
            || (self.stat & STAT_MODE2 != 0 && self.mode == 2)
    }

    /// Re-evaluate the STAT line, true on a rising edge
    fn update_stat_line(&mut self) -> bool {
        let signal = self.stat_signal();
        let rising = signal && !self.stat_line;
        self.stat_line = signal;
        rising
    }

    fn next_boundary(&self) -> u32 {
        if self.ly < SCREEN_HEIGHT as u8 {
            match self.mode {
                2 => MODE2_CLOCKS,
                3 => MODE2_CLOCKS + self.mode3_clocks,
                _ => LINE_CLOCKS,
            }
        } else if self.ly == 153 && self.line_clock < 4 {
            4
        } else {
            LINE_CLOCKS
        }
    }

    /// Advance by `clocks` dot clocks
    pub fn tick(&mut self, clocks: u32) -> PpuEvents {
        let mut events = PpuEvents::default();
        if !self.lcd_on() {
            self.off_clock += clocks;
            if self.off_clock >= FRAME_CLOCKS {
                self.off_clock -= FRAME_CLOCKS;
                self.blank_frame();
                events.frame_done = true;
            }
            return events;
        }

        let mut remaining = clocks;
        while remaining > 0 {
            let boundary = self.next_boundary();
            let step = remaining.min(boundary - self.line_clock);
            self.line_clock += step;
            remaining -= step;
            if self.line_clock == boundary {
                let ev = self.on_boundary();
                events.merge(ev);
            }
        }
        events
    }

    fn on_boundary(&mut self) -> PpuEvents {
        let mut events = PpuEvents::default();
        if self.line_clock == LINE_CLOCKS {
            self.line_clock = 0;
            self.ly += 1;
            events.line_start = true;
            if self.ly == SCREEN_HEIGHT as u8 {
                self.mode = 1;
                events.vblank = true;
                events.frame_done = true;
            } else if self.ly > 153 {
                self.ly = 0;
                self.window_line = 0;
                self.wy_triggered = false;
                self.start_oam_scan();
            } else if self.ly < SCREEN_HEIGHT as u8 {
                self.start_oam_scan();
            }
        } else if self.mode == 2 {
            self.mode = 3;
            self.start_pixel_transfer();
        } else if self.mode == 3 {
            self.render_pixels(SCREEN_WIDTH as u8);
            if self.window_drawn {
                self.window_line = self.window_line.wrapping_add(1);
            }
            self.mode = 0;
            events.hblank = true;
        }
        events.stat = self.update_stat_line();
        events
    }

    fn start_oam_scan(&mut self) {
        self.mode = 2;
        if self.ly == self.wy {
            self.wy_triggered = true;
        }
    }

    fn blank_frame(&mut self) {
        let color = if self.cgb {
            0xFFFFFFFF
        } else {
            self.dmg_colors[0][0]
        };
        self.framebuffer.fill(color);
    }

    fn obj_height(&self) -> u8 {
        if self.lcdc & LCDC_OBJ_SIZE != 0 {
            16
        } else {
            8
        }
    }

    /// OAM indices of up to 10 objects on the current line, in OAM order
    fn scan_objects(&self) -> ([usize; 10], usize) {
        let mut found = [0usize; 10];
        let mut count = 0;
        if self.lcdc & LCDC_OBJ_ENABLE == 0 {
            return (found, 0);
        }
        let line = self.ly as u16 + 16;
        let height = self.obj_height() as u16;
        for i in 0..40 {
            let y = self.oam[i * 4] as u16;
            if line >= y && line < y + height {
                found[count] = i;
                count += 1;
                if count == found.len() {
                    break;
                }
            }
        }
        (found, count)
    }

    fn window_visible(&self) -> bool {
        let enabled = self.lcdc & LCDC_WIN_ENABLE != 0 && (self.cgb || self.lcdc & LCDC_BG_WIN_ENABLE != 0);
        enabled && self.wy_triggered && self.wx <= 166
    }

    fn mode3_length(&self, objects: &[usize], window: bool) -> u32 {
        let scx = self.scx as u32;
        let mut clocks = MODE3_BASE_CLOCKS + (scx & 7);
        if window {
            clocks += 6;
        }
        let mut by_x: Vec<u32> = objects.iter().map(|&i| self.oam[i * 4 + 1] as u32).collect();
        by_x.sort_unstable();
        let mut seen_columns: Vec<u32> = Vec::with_capacity(10);
        for x in by_x {
            if x == 0 {
                clocks += 11;
                continue;
            }
            clocks += 6;
            let column = (x + scx) >> 3;
            if !seen_columns.contains(&column) {
                seen_columns.push(column);
                clocks += 5u32.saturating_sub((x + scx) & 7);
            }
        }
        clocks.min(MODE3_MAX_CLOCKS)
    }

    fn tile_row(&self, tile: u8, row: u8, bank: usize, unsigned_tiles: bool) -> (u8, u8) {
        let base = if unsigned_tiles {
            tile as usize * 16
        } else {
            (0x1000 + (tile as i8 as i32) * 16) as usize
        };
        let addr = bank * 0x2000 + base + row as usize * 2;
        (self.vram_byte(addr), self.vram_byte(addr + 1))
    }

    /// Mode 3 start: pick the line's objects and window, fix the mode 3 length
    fn start_pixel_transfer(&mut self) {
        let (objects, count) = self.scan_objects();
        let objects = &objects[..count];
        self.line_window = self.window_visible();
        self.mode3_clocks = self.mode3_length(objects, self.line_window);

        let mut order: Vec<u8> = objects.iter().map(|&i| i as u8).collect();
        if !self.cgb || self.opri & 1 != 0 {
            order.sort_by_key(|&i| (self.oam[i as usize * 4 + 1], i));
        }
        self.line_objects = order;
        self.rendered_x = 0;
        self.window_drawn = false;
    }

    /// Draw every pixel shifted out by the current mode 3 clock
    fn catch_up(&mut self) {
        if !self.lcd_on() || self.mode != 3 {
            return;
        }
        let fetch_delay = self.mode3_clocks.saturating_sub(SCREEN_WIDTH as u32);
        let shifted = self.line_clock.saturating_sub(MODE2_CLOCKS + fetch_delay);
        self.render_pixels(shifted.min(SCREEN_WIDTH as u32) as u8);
    }

    fn render_pixels(&mut self, to: u8) {
        let row_start = self.ly as usize * SCREEN_WIDTH;
        while self.rendered_x < to {
            let x = self.rendered_x;
            let color = self.pixel_color(x);
            if let Some(slot) = self.framebuffer.get_mut(row_start + x as usize) {
                *slot = color;
            }
            self.rendered_x += 1;
        }
    }

    fn pixel_color(&mut self, x: u8) -> u32 {
        let (bg, bg_attr) = self.background_pixel(x);
        let master_priority = !self.cgb || self.lcdc & LCDC_BG_WIN_ENABLE != 0;
        match self.object_pixel(x) {
            Some((index, attr)) if !master_priority || bg == 0 || (attr & 0x80 == 0 && bg_attr & 0x80 == 0) => {
                self.obj_color(index, attr)
            }
            _ => self.bg_color(bg, bg_attr),
        }
    }

    /// Background or window colour index and CGB attributes at `x`
    fn background_pixel(&mut self, x: u8) -> (u8, u8) {
        if !self.cgb && self.lcdc & LCDC_BG_WIN_ENABLE == 0 {
            return (0, 0);
        }
        let win_start = self.wx as i16 - 7;
        let in_window = self.line_window && self.lcdc & LCDC_WIN_ENABLE != 0 && x as i16 >= win_start;
        let (map, px, py, visible) = if in_window {
            self.window_drawn = true;
            let map = if self.lcdc & LCDC_WIN_TILEMAP != 0 { 0x1C00 } else { 0x1800 };
            let px = (x as i16 - win_start) as u8;
            (map, px, self.window_line, self.layers & LAYER_WINDOW != 0)
        } else {
            let map = if self.lcdc & LCDC_BG_TILEMAP != 0 { 0x1C00 } else { 0x1800 };
            (map, x.wrapping_add(self.scx), self.ly.wrapping_add(self.scy), self.layers & LAYER_BG != 0)
        };
        let map_addr = map + (py as usize / 8) * 32 + px as usize / 8;
        let tile = self.vram_byte(map_addr);
        let attr = if self.cgb { self.vram_byte(0x2000 + map_addr) } else { 0 };
        if !visible {
            return (0, attr);
        }
        let row = if attr & 0x40 != 0 { 7 - py % 8 } else { py % 8 };
        let bank = ((attr >> 3) & 1) as usize;
        let (lo, hi) = self.tile_row(tile, row, bank, self.lcdc & LCDC_BG_WIN_TILES != 0);
        let bit = if attr & 0x20 != 0 { px % 8 } else { 7 - px % 8 };
        (((hi >> bit) & 1) << 1 | ((lo >> bit) & 1), attr)
    }

    /// Colour index and attributes of the winning object pixel at `x`
    fn object_pixel(&self, x: u8) -> Option<(u8, u8)> {
        if self.layers & LAYER_OBJ == 0 || self.lcdc & LCDC_OBJ_ENABLE == 0 {
            return None;
        }
        let height = self.obj_height();
        for &i in &self.line_objects {
            let base = i as usize * 4;
            let Some(entry) = self.oam.get(base..base + 4) else {
                continue;
            };
            let (y, obj_x, mut tile, attr) = (entry[0], entry[1], entry[2], entry[3]);
            let sx = x as i16 + 8 - obj_x as i16;
            if !(0..8).contains(&sx) {
                continue;
            }
            // OBJ size may have changed since the scan
            let row = (self.ly as u16 + 16).wrapping_sub(y as u16);
            if row >= height as u16 {
                continue;
            }
            let mut row = row as u8;
            if attr & 0x40 != 0 {
                row = height - 1 - row;
            }
            if height == 16 {
                tile &= 0xFE;
            }
            let bank = if self.cgb { ((attr >> 3) & 1) as usize } else { 0 };
            let (lo, hi) = self.tile_row(tile.wrapping_add(row / 8), row % 8, bank, true);
            let bit = if attr & 0x20 != 0 { sx as u8 } else { 7 - sx as u8 };
            let index = ((hi >> bit) & 1) << 1 | ((lo >> bit) & 1);
            if index != 0 {
                return Some((index, attr));
            }
        }
        None
    }

    fn bg_color(&self, index: u8, attr: u8) -> u32 {
        if self.cgb {
            self.bg_colors[((attr & 7) * 4 + index) as usize]
        } else {
            let shade = (self.bgp >> (index * 2)) & 3;
            self.dmg_colors[0][shade as usize]
        }
    }

    fn obj_color(&self, index: u8, attr: u8) -> u32 {
        if self.cgb {
            self.obj_colors[((attr & 7) * 4 + index) as usize]
        } else {
            let palette = if attr & 0x10 != 0 { 1 } else { 0 };
            let reg = if palette == 1 { self.obp1 } else { self.obp0 };
            let shade = (reg >> (index * 2)) & 3;
            self.dmg_colors[1 + palette][shade as usize]
        }
    }
}

/// One BGR555 colour from palette RAM, missing bytes read as 0xFF
fn palette_entry(ram: &[u8], entry: usize) -> u16 {
    let byte = |i: usize| ram.get(i).copied().unwrap_or(0xFF);
    u16::from_le_bytes([byte(entry * 2), byte(entry * 2 + 1)])
}
