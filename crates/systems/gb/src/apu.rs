//! Game Boy APU (Audio Processing Unit) implementation.
//!
//! This module wires the reusable sound units from the core crate into the
//! Game Boy register interface.
//!
//! ## Game Boy Audio Architecture
//!
//! The Game Boy has 4 sound channels:
//!
//! 1. **Pulse 1**: Square wave with sweep (NR10-NR14)
//! 2. **Pulse 2**: Square wave without sweep (NR21-NR24)
//! 3. **Wave**: 32 x 4-bit samples in wave RAM (NR30-NR34, $FF30-$FF3F)
//! 4. **Noise**: 15/7-bit LFSR (NR41-NR44)
//!
//! ## Register Map
//!
//! - **$FF10-$FF14**: Pulse 1 (NR10-NR14)
//! - **$FF15-$FF19**: Pulse 2 (NR20-NR24, NR20 unused)
//! - **$FF1A-$FF1E**: Wave (NR30-NR34)
//! - **$FF1F-$FF23**: Noise (NR40-NR44, NR40 unused)
//! - **$FF24**: Master volume (NR50)
//! - **$FF25**: Sound panning (NR51)
//! - **$FF26**: Sound on/off (NR52)
//! - **$FF30-$FF3F**: Wave pattern RAM
//!
//! ## Frame Sequencer
//!
//! The frame sequencer is clocked at 512 Hz by the falling edge of a divider
//! bit (see the timer), so writing DIV shifts its phase:
//! - Steps 0, 2, 4, 6: Length counters
//! - Steps 2, 6: Sweep
//! - Step 7: Envelopes
//!
//! ## Audio Output
//!
//! One stereo sample pair is produced every 2 clocks (2097152 Hz). Each pair
//! is packed into a `u32` with the left sample in the high half and the right
//! sample in the low half, both signed 16-bit.

use emu_core::apu::{DutyGenerator, Envelope, LengthCounter, NoiseGenerator, SweepEvent, SweepUnit, WaveChannel};
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::types::pack_stereo;
use serde::{Deserialize, Serialize};

/// Clocks per output sample pair
pub const CLOCKS_PER_SAMPLE: u32 = 2;

/// Scale from the summed channel level (0..=480) to 16 bits
const MIX_SCALE: i32 = 64;

/// Read-back OR masks for $FF10-$FF2F, write-only bits read as 1
const READ_MASKS: [u8; 0x20] = [
    0x80, 0x3F, 0x00, 0xFF, 0xBF, // NR10-NR14
    0xFF, 0x3F, 0x00, 0xFF, 0xBF, // NR20-NR24
    0x7F, 0xFF, 0x9F, 0xFF, 0xBF, // NR30-NR34
    0xFF, 0xFF, 0x00, 0x00, 0xBF, // NR40-NR44
    0x00, 0x00, 0x70, // NR50-NR52
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// Game Boy APU with 4 sound channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbApu {
    pulse1: DutyGenerator,
    pulse1_sweep: SweepUnit,
    pulse1_envelope: Envelope,
    pulse1_length: LengthCounter,
    pulse1_enabled: bool,

    pulse2: DutyGenerator,
    pulse2_envelope: Envelope,
    pulse2_length: LengthCounter,
    pulse2_enabled: bool,

    wave: WaveChannel,
    wave_length: LengthCounter,
    wave_dac_enabled: bool,
    wave_enabled: bool,

    noise: NoiseGenerator,
    noise_envelope: Envelope,
    noise_length: LengthCounter,
    noise_enabled: bool,

    /// Next frame sequencer step (0-7)
    frame_sequencer_step: u8,

    power_on: bool,
    nr50: u8,
    nr51: u8,
    cgb: bool,

    /// Clocks not yet turned into a sample
    clock_phase: u32,

    /// Samples produced but not yet handed to the host. Part of the state
    /// so a restored machine delivers exactly what the original would.
    samples: Vec<u32>,
}

impl GbApu {
    /// Power-on state as seen by the boot ROM: everything off
    pub fn new(cgb: bool) -> Self {
        Self {
            pulse1: DutyGenerator::new(),
            pulse1_sweep: SweepUnit::new(),
            pulse1_envelope: Envelope::new(),
            pulse1_length: LengthCounter::new(64),
            pulse1_enabled: false,

            pulse2: DutyGenerator::new(),
            pulse2_envelope: Envelope::new(),
            pulse2_length: LengthCounter::new(64),
            pulse2_enabled: false,

            wave: WaveChannel::new(),
            wave_length: LengthCounter::new(256),
            wave_dac_enabled: false,
            wave_enabled: false,

            noise: NoiseGenerator::new(),
            noise_envelope: Envelope::new(),
            noise_length: LengthCounter::new(64),
            noise_enabled: false,

            frame_sequencer_step: 0,
            power_on: false,
            nr50: 0,
            nr51: 0,
            cgb,
            clock_phase: 0,
            samples: Vec::new(),
        }
    }

    /// Register values left behind by the boot ROM
    pub fn apply_post_boot(&mut self) {
        self.power_on = true;
        self.nr50 = 0x77;
        self.nr51 = 0xF3;
        self.pulse1.duty = 2;
        self.pulse1_envelope.write(0xF3);
        self.pulse1_enabled = true;
    }

    pub fn restore(&mut self, state: GbApu) {
        *self = state;
    }

    fn next_step_clocks_length(&self) -> bool {
        self.frame_sequencer_step & 1 == 0
    }

    /// Clock the frame sequencer (512 Hz, driven by the divider)
    pub fn step_frame_sequencer(&mut self) {
        if !self.power_on {
            return;
        }
        let step = self.frame_sequencer_step;
        if step & 1 == 0 {
            if self.pulse1_length.clock() {
                self.pulse1_enabled = false;
            }
            if self.pulse2_length.clock() {
                self.pulse2_enabled = false;
            }
            if self.wave_length.clock() {
                self.wave_enabled = false;
            }
            if self.noise_length.clock() {
                self.noise_enabled = false;
            }
        }
        if step == 2 || step == 6 {
            match self.pulse1_sweep.clock() {
                SweepEvent::Update(freq) => self.pulse1.frequency = freq,
                SweepEvent::Overflow => self.pulse1_enabled = false,
                SweepEvent::None => {}
            }
        }
        if step == 7 {
            self.pulse1_envelope.clock();
            self.pulse2_envelope.clock();
            self.noise_envelope.clock();
        }
        self.frame_sequencer_step = (step + 1) & 7;
    }

    /// Advance by `clocks` dot clocks, producing one sample per 2 clocks
    pub fn tick(&mut self, clocks: u32) {
        self.clock_phase += clocks;
        while self.clock_phase >= CLOCKS_PER_SAMPLE {
            self.clock_phase -= CLOCKS_PER_SAMPLE;
            if self.power_on {
                self.advance_channels(CLOCKS_PER_SAMPLE);
            }
            let sample = self.mix();
            self.samples.push(sample);
        }
    }

    fn advance_channels(&mut self, clocks: u32) {
        if self.pulse1_enabled {
            self.pulse1.advance(clocks);
        }
        if self.pulse2_enabled {
            self.pulse2.advance(clocks);
        }
        if self.wave_enabled {
            self.wave.advance(clocks);
        }
        if self.noise_enabled {
            self.noise.advance(clocks);
        }
    }

    /// Current level of each channel, 0..=15
    fn channel_levels(&self) -> [i32; 4] {
        let level = |on: bool, high: bool, volume: u8| if on && high { volume as i32 } else { 0 };
        [
            level(
                self.pulse1_enabled && self.pulse1_envelope.dac_enabled(),
                self.pulse1.high(),
                self.pulse1_envelope.volume(),
            ),
            level(
                self.pulse2_enabled && self.pulse2_envelope.dac_enabled(),
                self.pulse2.high(),
                self.pulse2_envelope.volume(),
            ),
            level(self.wave_enabled && self.wave_dac_enabled, true, self.wave.output()),
            level(
                self.noise_enabled && self.noise_envelope.dac_enabled(),
                self.noise.high(),
                self.noise_envelope.volume(),
            ),
        ]
    }

    fn mix(&self) -> u32 {
        if !self.power_on {
            return 0;
        }
        let levels = self.channel_levels();
        let mut left = 0;
        let mut right = 0;
        for (ch, level) in levels.iter().enumerate() {
            if self.nr51 & (0x10 << ch) != 0 {
                left += level;
            }
            if self.nr51 & (0x01 << ch) != 0 {
                right += level;
            }
        }
        let left_vol = ((self.nr50 >> 4) & 7) as i32 + 1;
        let right_vol = (self.nr50 & 7) as i32 + 1;
        pack_stereo((left * left_vol * MIX_SCALE) as i16, (right * right_vol * MIX_SCALE) as i16)
    }

    /// Number of samples waiting to be delivered
    pub fn pending_samples(&self) -> usize {
        self.samples.len()
    }

    /// Move up to `out.len()` samples into `out`, returns how many were moved.
    /// The rest stay queued for the next call.
    pub fn drain_samples(&mut self, out: &mut [u32]) -> usize {
        let n = out.len().min(self.samples.len());
        out[..n].copy_from_slice(&self.samples[..n]);
        self.samples.drain(..n);
        n
    }

    /// Drop queued samples
    pub fn clear_samples(&mut self) {
        self.samples.clear();
    }

    /// Read from an APU register
    pub fn read_register(&self, addr: u16) -> u8 {
        let raw = match addr {
            0xFF10 => self.pulse1_sweep.read(),
            0xFF11 => self.pulse1.duty << 6,
            0xFF12 => self.pulse1_envelope.read(),
            0xFF16 => self.pulse2.duty << 6,
            0xFF17 => self.pulse2_envelope.read(),
            0xFF14 => (self.pulse1_length.is_enabled() as u8) << 6,
            0xFF19 => (self.pulse2_length.is_enabled() as u8) << 6,
            0xFF1A => (self.wave_dac_enabled as u8) << 7,
            0xFF1C => self.wave.volume_code << 5,
            0xFF1E => (self.wave_length.is_enabled() as u8) << 6,
            0xFF21 => self.noise_envelope.read(),
            0xFF22 => self.noise.read(),
            0xFF23 => (self.noise_length.is_enabled() as u8) << 6,
            0xFF24 => self.nr50,
            0xFF25 => self.nr51,
            0xFF26 => {
                (self.power_on as u8) << 7
                    | (self.noise_enabled as u8) << 3
                    | (self.wave_enabled as u8) << 2
                    | (self.pulse2_enabled as u8) << 1
                    | self.pulse1_enabled as u8
            }
            0xFF30..=0xFF3F => return self.read_wave_ram(addr),
            0xFF13..=0xFF2F => 0,
            _ => return 0xFF,
        };
        raw | READ_MASKS[(addr - 0xFF10) as usize]
    }

    fn read_wave_ram(&self, addr: u16) -> u8 {
        // While playing, the CPU sees the byte the channel is reading
        if self.wave_enabled {
            self.wave.ram[self.wave.current_byte()]
        } else {
            self.wave.ram[(addr - 0xFF30) as usize]
        }
    }

    /// Write to an APU register
    pub fn write_register(&mut self, addr: u16, val: u8) {
        if (0xFF30..=0xFF3F).contains(&addr) {
            let i = if self.wave_enabled {
                self.wave.current_byte()
            } else {
                (addr - 0xFF30) as usize
            };
            self.wave.ram[i] = val;
            return;
        }
        if addr == 0xFF26 {
            self.write_nr52(val);
            return;
        }
        if !self.power_on {
            // Length counters stay writable on DMG while powered off
            if !self.cgb {
                match addr {
                    0xFF11 => self.pulse1_length.load(val & 0x3F),
                    0xFF16 => self.pulse2_length.load(val & 0x3F),
                    0xFF1B => self.wave_length.load(val),
                    0xFF20 => self.noise_length.load(val & 0x3F),
                    _ => {}
                }
            }
            return;
        }

        let nscl = self.next_step_clocks_length();
        match addr {
            0xFF10 => {
                if self.pulse1_sweep.write(val) {
                    self.pulse1_enabled = false;
                }
            }
            0xFF11 => {
                self.pulse1.duty = val >> 6;
                self.pulse1_length.load(val & 0x3F);
            }
            0xFF12 => {
                self.pulse1_envelope.write(val);
                if !self.pulse1_envelope.dac_enabled() {
                    self.pulse1_enabled = false;
                }
            }
            0xFF13 => self.pulse1.frequency = (self.pulse1.frequency & 0x0700) | val as u16,
            0xFF14 => {
                self.pulse1.frequency = (self.pulse1.frequency & 0x00FF) | ((val as u16 & 0x07) << 8);
                let expired = self.pulse1_length.set_enabled(val & 0x40 != 0, nscl);
                if val & 0x80 != 0 {
                    self.pulse1_enabled = self.pulse1_envelope.dac_enabled();
                    self.pulse1_length.trigger(nscl);
                    self.pulse1.trigger();
                    self.pulse1_envelope.trigger();
                    if self.pulse1_sweep.trigger(self.pulse1.frequency) {
                        self.pulse1_enabled = false;
                    }
                } else if expired {
                    self.pulse1_enabled = false;
                }
            }
            0xFF16 => {
                self.pulse2.duty = val >> 6;
                self.pulse2_length.load(val & 0x3F);
            }
            0xFF17 => {
                self.pulse2_envelope.write(val);
                if !self.pulse2_envelope.dac_enabled() {
                    self.pulse2_enabled = false;
                }
            }
            0xFF18 => self.pulse2.frequency = (self.pulse2.frequency & 0x0700) | val as u16,
            0xFF19 => {
                self.pulse2.frequency = (self.pulse2.frequency & 0x00FF) | ((val as u16 & 0x07) << 8);
                let expired = self.pulse2_length.set_enabled(val & 0x40 != 0, nscl);
                if val & 0x80 != 0 {
                    self.pulse2_enabled = self.pulse2_envelope.dac_enabled();
                    self.pulse2_length.trigger(nscl);
                    self.pulse2.trigger();
                    self.pulse2_envelope.trigger();
                } else if expired {
                    self.pulse2_enabled = false;
                }
            }
            0xFF1A => {
                self.wave_dac_enabled = val & 0x80 != 0;
                if !self.wave_dac_enabled {
                    self.wave_enabled = false;
                }
            }
            0xFF1B => self.wave_length.load(val),
            0xFF1C => self.wave.volume_code = (val >> 5) & 0x03,
            0xFF1D => self.wave.frequency = (self.wave.frequency & 0x0700) | val as u16,
            0xFF1E => {
                self.wave.frequency = (self.wave.frequency & 0x00FF) | ((val as u16 & 0x07) << 8);
                let expired = self.wave_length.set_enabled(val & 0x40 != 0, nscl);
                if val & 0x80 != 0 {
                    self.wave_enabled = self.wave_dac_enabled;
                    self.wave_length.trigger(nscl);
                    self.wave.trigger();
                } else if expired {
                    self.wave_enabled = false;
                }
            }
            0xFF20 => self.noise_length.load(val & 0x3F),
            0xFF21 => {
                self.noise_envelope.write(val);
                if !self.noise_envelope.dac_enabled() {
                    self.noise_enabled = false;
                }
            }
            0xFF22 => self.noise.write(val),
            0xFF23 => {
                let expired = self.noise_length.set_enabled(val & 0x40 != 0, nscl);
                if val & 0x80 != 0 {
                    self.noise_enabled = self.noise_envelope.dac_enabled();
                    self.noise_length.trigger(nscl);
                    self.noise.trigger();
                    self.noise_envelope.trigger();
                } else if expired {
                    self.noise_enabled = false;
                }
            }
            0xFF24 => self.nr50 = val,
            0xFF25 => self.nr51 = val,
            _ => {}
        }
    }

    fn write_nr52(&mut self, val: u8) {
        let power = val & 0x80 != 0;
        if power == self.power_on {
            return;
        }
        log(LogCategory::Apu, LogLevel::Debug, || {
            format!("sound {}", if power { "on" } else { "off" })
        });
        if power {
            self.power_on = true;
            self.frame_sequencer_step = 0;
            self.pulse1.reset_step();
            self.pulse2.reset_step();
        } else {
            self.power_off();
        }
    }

    /// Clear every register. Wave RAM survives, and so do the length
    /// counters on DMG.
    fn power_off(&mut self) {
        let wave_ram = self.wave.ram;
        let lengths = [
            self.pulse1_length.clone(),
            self.pulse2_length.clone(),
            self.wave_length.clone(),
            self.noise_length.clone(),
        ];
        let samples = std::mem::take(&mut self.samples);
        let clock_phase = self.clock_phase;

        *self = Self::new(self.cgb);
        self.wave.ram = wave_ram;
        self.samples = samples;
        self.clock_phase = clock_phase;
        if !self.cgb {
            let [p1, p2, w, n] = lengths;
            self.pulse1_length = p1;
            self.pulse2_length = p2;
            self.wave_length = w;
            self.noise_length = n;
            for length in [
                &mut self.pulse1_length,
                &mut self.pulse2_length,
                &mut self.wave_length,
                &mut self.noise_length,
            ] {
                length.set_enabled(false, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_core::types::unpack_stereo;

    fn powered(cgb: bool) -> GbApu {
        let mut apu = GbApu::new(cgb);
        apu.write_register(0xFF26, 0x80);
        apu
    }

    #[test]
    fn test_power_control() {
        let mut apu = GbApu::new(false);
        assert_eq!(apu.read_register(0xFF26), 0x70);

        apu.write_register(0xFF26, 0x80);
        assert_eq!(apu.read_register(0xFF26), 0xF0);

        apu.write_register(0xFF26, 0x00);
        assert_eq!(apu.read_register(0xFF26), 0x70);
    }

    #[test]
    fn test_register_read_masks() {
        let mut apu = powered(false);
        apu.write_register(0xFF11, 0xBF);
        apu.write_register(0xFF13, 0x12);
        apu.write_register(0xFF1C, 0x60);
        apu.write_register(0xFF24, 0x53);

        assert_eq!(apu.read_register(0xFF10), 0x80);
        assert_eq!(apu.read_register(0xFF11), 0xBF);
        assert_eq!(apu.read_register(0xFF13), 0xFF);
        assert_eq!(apu.read_register(0xFF14), 0xBF);
        assert_eq!(apu.read_register(0xFF1A), 0x7F);
        assert_eq!(apu.read_register(0xFF1C), 0xFF);
        assert_eq!(apu.read_register(0xFF24), 0x53);
        assert_eq!(apu.read_register(0xFF27), 0xFF);
    }

    #[test]
    fn test_power_off_clears_and_blocks_writes() {
        let mut apu = powered(false);
        apu.write_register(0xFF12, 0xF0);
        apu.write_register(0xFF24, 0x77);
        apu.write_register(0xFF30, 0x5A);

        apu.write_register(0xFF26, 0x00);
        assert_eq!(apu.read_register(0xFF12), 0x00);
        assert_eq!(apu.read_register(0xFF24), 0x00);

        apu.write_register(0xFF24, 0x77);
        assert_eq!(apu.read_register(0xFF24), 0x00);

        // Wave RAM survives and stays writable
        assert_eq!(apu.read_register(0xFF30), 0x5A);
        apu.write_register(0xFF31, 0xA5);
        assert_eq!(apu.read_register(0xFF31), 0xA5);
    }

    #[test]
    fn test_length_writable_while_off_on_dmg_only() {
        let mut apu = GbApu::new(false);
        apu.write_register(0xFF11, 0x3E); // length 2
        apu.write_register(0xFF26, 0x80);
        apu.write_register(0xFF12, 0xF0);
        apu.write_register(0xFF14, 0xC0);
        // Step 0 clocks length
        apu.step_frame_sequencer();
        assert_eq!(apu.read_register(0xFF26) & 0x01, 0x01);
        apu.step_frame_sequencer();
        apu.step_frame_sequencer();
        assert_eq!(apu.read_register(0xFF26) & 0x01, 0x00);

        let mut apu = GbApu::new(true);
        apu.write_register(0xFF11, 0x3E);
        assert_eq!(apu.pulse1_length.remaining(), 0);
    }

    #[test]
    fn test_trigger_requires_dac() {
        let mut apu = powered(false);
        apu.write_register(0xFF12, 0x00);
        apu.write_register(0xFF14, 0x80);
        assert_eq!(apu.read_register(0xFF26) & 0x01, 0);

        apu.write_register(0xFF12, 0xF0);
        apu.write_register(0xFF14, 0x80);
        assert_eq!(apu.read_register(0xFF26) & 0x01, 1);

        // DAC off kills the channel
        apu.write_register(0xFF12, 0x00);
        assert_eq!(apu.read_register(0xFF26) & 0x01, 0);
    }

    #[test]
    fn test_sweep_overflow_on_trigger_disables() {
        let mut apu = powered(false);
        apu.write_register(0xFF10, 0x11);
        apu.write_register(0xFF12, 0xF0);
        apu.write_register(0xFF13, 0xFF);
        apu.write_register(0xFF14, 0x87); // frequency 2047
        assert_eq!(apu.read_register(0xFF26) & 0x01, 0);
    }

    #[test]
    fn test_envelope_on_step_7() {
        let mut apu = powered(false);
        apu.write_register(0xFF17, 0x09); // volume 0, increase, period 1
        apu.write_register(0xFF19, 0x80);
        for _ in 0..7 {
            apu.step_frame_sequencer();
        }
        assert_eq!(apu.pulse2_envelope.volume(), 0);
        apu.step_frame_sequencer();
        assert_eq!(apu.pulse2_envelope.volume(), 1);
    }

    #[test]
    fn test_one_sample_per_two_clocks() {
        let mut apu = powered(false);
        apu.tick(4);
        apu.tick(3);
        assert_eq!(apu.pending_samples(), 3);
        apu.tick(1);
        assert_eq!(apu.pending_samples(), 4);
    }

    #[test]
    fn test_drain_keeps_overflow() {
        let mut apu = powered(false);
        apu.tick(20);
        let mut out = [0u32; 6];
        assert_eq!(apu.drain_samples(&mut out), 6);
        assert_eq!(apu.pending_samples(), 4);
        assert_eq!(apu.drain_samples(&mut out), 4);
        assert_eq!(apu.pending_samples(), 0);
    }

    #[test]
    fn test_panning_routes_channels() {
        let mut apu = powered(false);
        apu.write_register(0xFF24, 0x77);
        apu.write_register(0xFF25, 0x10); // pulse 1 left only
        apu.write_register(0xFF11, 0x80); // 50% duty, high on step 0
        apu.write_register(0xFF12, 0xF0);
        apu.write_register(0xFF14, 0x80);
        apu.tick(2);
        let mut out = [0u32; 1];
        apu.drain_samples(&mut out);
        let (left, right) = unpack_stereo(out[0]);
        assert_eq!(left, 15 * 8 * MIX_SCALE as i16);
        assert_eq!(right, 0);
    }

    #[test]
    fn test_silent_when_powered_off() {
        let mut apu = GbApu::new(false);
        apu.tick(8);
        let mut out = [1u32; 4];
        apu.drain_samples(&mut out);
        assert_eq!(out, [0; 4]);
    }
}
