//! Centralized logging configuration for the emulator.
//!
//! # Architecture
//!
//! - **LogConfig**: process-wide filter configuration held in atomics
//! - **LogLevel**: hierarchical levels (Off < Error < Warn < Info < Debug < Trace)
//! - **LogCategory**: emulator components (CPU, Bus, PPU, APU, Interrupts, Cartridge, Stubs)
//! - **log()**: lazily formatted, rate-limited entry point
//!
//! Accepted records are forwarded to the [`log`] crate facade with the target
//! `emu::<category>`, so whichever backend the host installs (e.g.
//! `env_logger`) decides where they end up. The filter lives here because
//! emulation hot paths need a check that costs one atomic load when disabled.
//!
//! Only filter configuration is global. Machine state never is, so independent
//! emulator instances do not interact through this module.
//!
//! # Usage
//!
//! ```rust
//! use emu_core::logging::{log, LogCategory, LogLevel};
//!
//! log(LogCategory::Cpu, LogLevel::Debug, || {
//!     format!("STOP at PC={:04X}", 0x0150)
//! });
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

const CATEGORY_COUNT: usize = 7;

/// Log level for controlling verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse log level from string (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }

    /// Matching level of the `log` facade, `None` for `Off`.
    fn facade_level(self) -> Option<::log::Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(::log::Level::Error),
            LogLevel::Warn => Some(::log::Level::Warn),
            LogLevel::Info => Some(::log::Level::Info),
            LogLevel::Debug => Some(::log::Level::Debug),
            LogLevel::Trace => Some(::log::Level::Trace),
        }
    }
}

/// Log category for different emulator components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Instruction execution, STOP/HALT transitions
    Cpu,
    /// Address decoding, DMA, bank register writes
    Bus,
    /// Picture unit mode changes and register writes
    Ppu,
    /// Sound unit
    Apu,
    /// Interrupt requests and dispatch
    Interrupts,
    /// Cartridge header parsing, save RAM, RTC
    Cartridge,
    /// Unimplemented or undefined behaviour hit at runtime
    Stubs,
}

impl LogCategory {
    fn index(self) -> usize {
        match self {
            LogCategory::Cpu => 0,
            LogCategory::Bus => 1,
            LogCategory::Ppu => 2,
            LogCategory::Apu => 3,
            LogCategory::Interrupts => 4,
            LogCategory::Cartridge => 5,
            LogCategory::Stubs => 6,
        }
    }

    /// Target string used for the `log` facade.
    pub fn target(self) -> &'static str {
        match self {
            LogCategory::Cpu => "emu::cpu",
            LogCategory::Bus => "emu::bus",
            LogCategory::Ppu => "emu::ppu",
            LogCategory::Apu => "emu::apu",
            LogCategory::Interrupts => "emu::interrupts",
            LogCategory::Cartridge => "emu::cartridge",
            LogCategory::Stubs => "emu::stubs",
        }
    }
}

#[derive(Default)]
struct WindowState {
    timestamps: VecDeque<Instant>,
    dropped: usize,
}

/// Sliding-window limiter, one window per category.
struct RateLimiter {
    max_per_second: AtomicUsize,
    window: Duration,
    state: Mutex<[WindowState; CATEGORY_COUNT]>,
}

impl RateLimiter {
    fn new(max_per_second: usize) -> Self {
        Self {
            max_per_second: AtomicUsize::new(max_per_second),
            window: Duration::from_secs(1),
            state: Mutex::new(Default::default()),
        }
    }

    /// Returns `(allowed, dropped_since_last_allowed)`.
    fn should_allow(&self, category: LogCategory) -> (bool, usize) {
        let now = Instant::now();
        let max = self.max_per_second.load(Ordering::Relaxed);
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let slot = &mut state[category.index()];

        while let Some(&front) = slot.timestamps.front() {
            if now.duration_since(front) > self.window {
                slot.timestamps.pop_front();
            } else {
                break;
            }
        }

        if slot.timestamps.len() < max {
            slot.timestamps.push_back(now);
            let dropped = std::mem::take(&mut slot.dropped);
            (true, dropped)
        } else {
            slot.dropped += 1;
            (false, 0)
        }
    }
}

/// Global logging filter configuration
pub struct LogConfig {
    global_level: AtomicU8,
    levels: [AtomicU8; CATEGORY_COUNT],
    rate_limiter: RateLimiter,
}

impl LogConfig {
    /// All logging disabled, 60 records per second per category.
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            levels: Default::default(),
            rate_limiter: RateLimiter::new(60),
        }
    }

    /// Get the global singleton instance
    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    /// Set log level for a specific category (`Off` means "use the global level")
    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    pub fn get_level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.levels[category.index()].load(Ordering::Relaxed))
    }

    /// A category-specific level wins; otherwise the global level applies.
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        if level == LogLevel::Off {
            return false;
        }
        let category_level = self.get_level(category);
        if category_level != LogLevel::Off {
            level <= category_level
        } else {
            level <= self.get_global_level()
        }
    }

    /// Reset all logging to Off
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for level in &self.levels {
            level.store(LogLevel::Off as u8, Ordering::Relaxed);
        }
    }

    /// Set the maximum records per second per category
    pub fn set_rate_limit(&self, max_logs_per_second: usize) {
        self.rate_limiter
            .max_per_second
            .store(max_logs_per_second, Ordering::Relaxed);
    }

    pub fn get_rate_limit(&self) -> usize {
        self.rate_limiter.max_per_second.load(Ordering::Relaxed)
    }
}

/// Log a message with the specified category and level.
///
/// `message_fn` only runs when the record passes both the level filter and
/// the rate limiter.
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }
    let Some(facade_level) = level.facade_level() else {
        return;
    };

    let (allowed, dropped) = config.rate_limiter.should_allow(category);
    if dropped > 0 {
        ::log::log!(
            target: category.target(),
            ::log::Level::Warn,
            "rate limit exceeded, {} message(s) dropped",
            dropped
        );
    }
    if allowed {
        ::log::log!(target: category.target(), facade_level, "{}", message_fn());
    }
}
