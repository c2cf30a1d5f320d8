use anyhow::{Context, Result};
use clap::Parser;
use emu_core::logging::{LogConfig, LogLevel};
use emu_core::System;
use emu_gb::{GbSystem, LoadFlags, SAMPLES_PER_FRAME};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Run a Game Boy ROM headless for a number of frames
#[derive(Parser)]
#[command(name = "gbrun")]
struct Args {
    /// Path to the ROM image
    rom: PathBuf,

    /// Number of frames to run
    #[arg(long, default_value_t = 60)]
    frames: u32,

    /// Run CGB cartridges in DMG mode
    #[arg(long, default_value_t = false)]
    force_dmg: bool,

    /// Identify as a GBA to CGB software
    #[arg(long, default_value_t = false)]
    gba: bool,

    /// Detect MBC1 multicarts
    #[arg(long, default_value_t = false)]
    multicart: bool,

    /// Boot ROM (0x100 bytes DMG or 0x900 bytes CGB)
    #[arg(long)]
    bios: Option<PathBuf>,

    /// Battery save to load before running
    #[arg(long)]
    save_ram_in: Option<PathBuf>,

    /// Write battery save data here after running
    #[arg(long)]
    save_ram_out: Option<PathBuf>,

    /// Write a binary save state here after running
    #[arg(long)]
    state_out: Option<PathBuf>,

    /// Write the JSON view of the save state here after running
    #[arg(long)]
    json_state: Option<PathBuf>,

    /// Core log level: off, error, warn, info, debug, trace
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Suppress the per-frame summary
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

impl Args {
    fn load_flags(&self) -> LoadFlags {
        let mut flags = LoadFlags::empty();
        if self.force_dmg {
            flags = flags | LoadFlags::FORCE_DMG;
        }
        if self.gba {
            flags = flags | LoadFlags::GBA_CGB;
        }
        if self.multicart {
            flags = flags | LoadFlags::MULTICART_COMPAT;
        }
        flags
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = LogLevel::from_str(&args.log_level)
        .with_context(|| format!("unknown log level {:?}", args.log_level))?;
    LogConfig::global().set_global_level(level);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace")).init();

    let mut sys = GbSystem::new();
    if let Some(path) = &args.bios {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        sys.mount("BootROM", &data)?;
    }

    let rom = fs::read(&args.rom).with_context(|| format!("reading {}", args.rom.display()))?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    sys.load(&rom, now, args.load_flags(), 0)?;
    log::info!(
        "{} ({})",
        sys.rom_title().unwrap_or_default(),
        if sys.is_cgb() { "CGB" } else { "DMG" }
    );

    if let Some(path) = &args.save_ram_in {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        sys.load_save_data(&data)?;
    }

    let mut audio = vec![0u32; SAMPLES_PER_FRAME];
    let mut frame = vec![0u32; emu_gb::SCREEN_WIDTH * emu_gb::SCREEN_HEIGHT];
    let mut frames_done = 0;
    let mut total_samples = 0usize;
    while frames_done < args.frames {
        let mut samples = SAMPLES_PER_FRAME;
        let result = sys.run_for(&mut audio, &mut samples);
        total_samples += samples;
        if result < 0 {
            anyhow::bail!("emulator stopped running");
        }
        // Without a frame the whole budget is used and the result equals it
        if result as usize >= samples {
            continue;
        }
        sys.blit_to(&mut frame, emu_gb::SCREEN_WIDTH);
        frames_done += 1;
        if !args.quiet {
            let checksum = frame.iter().fold(0u32, |acc, &p| acc.rotate_left(5) ^ p);
            println!("frame {:4}: pixels {:08X}, samples {}", frames_done, checksum, total_samples);
        }
    }

    if let Some(path) = &args.save_ram_out {
        match sys.save_data_len() {
            Some(len) => {
                let mut data = vec![0; len];
                sys.save_save_data(&mut data);
                fs::write(path, &data).with_context(|| format!("writing {}", path.display()))?;
            }
            None => log::warn!("cartridge has no battery, not writing {}", path.display()),
        }
    }

    if let Some(path) = &args.state_out {
        let state = sys.capture_state().context("capturing save state")?;
        fs::write(path, state).with_context(|| format!("writing {}", path.display()))?;
    }

    if let Some(path) = &args.json_state {
        let state = sys.save_state();
        let mut f = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        write!(f, "{}", serde_json::to_string_pretty(&state)?)?;
    }

    Ok(())
}
