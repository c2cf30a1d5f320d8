//! Core APU (Audio Processing Unit) components.
//!
//! Reusable building blocks for the Game Boy sound hardware. Each unit keeps
//! its own raw register bits and internal counters and derives
//! `Serialize`/`Deserialize`, so a system can snapshot them directly.
//!
//! ## Components
//!
//! - **DutyGenerator**: square wave with four duty cycles
//! - **WaveChannel**: 32-sample programmable waveform
//! - **NoiseGenerator**: 15/7-bit LFSR
//! - **LengthCounter**: automatic note duration
//! - **Envelope**: volume fade in/out
//! - **SweepUnit**: frequency sweep with overflow detection
//!
//! Timers are advanced in master clocks; the frame-sequencer driven units
//! (length, envelope, sweep) are clocked by the owning system.

pub mod envelope;
pub mod length_counter;
pub mod noise;
pub mod pulse;
pub mod sweep;
pub mod wave;

pub use envelope::Envelope;
pub use length_counter::LengthCounter;
pub use noise::NoiseGenerator;
pub use pulse::DutyGenerator;
pub use sweep::{SweepEvent, SweepUnit};
pub use wave::WaveChannel;
