//! Core emulator primitives and traits shared by system crates.
//!
//! - [`cpu_lr35902`]: the Sharp LR35902 instruction execution unit
//! - [`apu`]: reusable sound-unit building blocks
//! - [`logging`]: categorised, rate-limited logging on top of the `log` facade

pub mod apu;
pub mod cpu_lr35902;
pub mod logging;

pub mod types {
    use serde::{Deserialize, Serialize};

    /// A completed video frame in packed `0xAARRGGBB` pixels, row-major.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Frame {
        pub width: u32,
        pub height: u32,
        pub pixels: Vec<u32>,
    }

    impl Frame {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                pixels: vec![0; (width * height) as usize],
            }
        }
    }

    /// One interleaved stereo pair: left in the high half, right in the low half.
    pub type StereoSample = u32;

    /// Pack signed left/right samples into a [`StereoSample`].
    #[inline]
    pub fn pack_stereo(left: i16, right: i16) -> StereoSample {
        ((left as u16 as u32) << 16) | right as u16 as u32
    }

    /// Split a [`StereoSample`] back into `(left, right)`.
    #[inline]
    pub fn unpack_stereo(sample: StereoSample) -> (i16, i16) {
        ((sample >> 16) as u16 as i16, sample as u16 as i16)
    }
}

use serde_json::Value;

/// A CPU-like component that can be stepped; returns cycles consumed.
pub trait Cpu {
    fn reset(&mut self);
    fn step(&mut self) -> u32;
}

/// Description of a mount point (media slot) that a system supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPointInfo {
    /// Unique identifier for this mount point (e.g. "Cartridge", "BootROM")
    pub id: String,
    /// User-friendly name for display
    pub name: String,
    /// File extensions accepted by this mount point
    pub extensions: Vec<String>,
    /// Whether this mount point is required for the system to function
    pub required: bool,
}

/// A high-level System trait tying components together.
pub trait System {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reset to initial power-on state
    fn reset(&mut self);

    /// Emulate until a frame is produced and return a framebuffer.
    fn step_frame(&mut self) -> Result<types::Frame, Self::Error>;

    /// Return a JSON view of the save state for debugging.
    /// Save states never include ROM/cartridge image data.
    fn save_state(&self) -> Value;

    /// Load a JSON save state produced by [`System::save_state`].
    fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error>;

    /// Check if this system supports save/load state functionality
    fn supports_save_states(&self) -> bool {
        false
    }

    /// Get the list of mount points this system supports
    fn mount_points(&self) -> Vec<MountPointInfo>;

    /// Load media into a specific mount point
    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error>;

    /// Unload media from a specific mount point
    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error>;

    /// Check if a mount point has media loaded
    fn is_mounted(&self, mount_point_id: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::types::{pack_stereo, unpack_stereo, Frame};
    use super::*;

    #[test]
    fn frame_initialization() {
        let f = Frame::new(10, 10);
        assert_eq!(f.pixels.len(), 100);
        assert_eq!(f.width, 10);
        assert_eq!(f.height, 10);
    }

    #[test]
    fn stereo_packing() {
        let s = pack_stereo(-1, 0x1234);
        assert_eq!(s, 0xFFFF_1234);
        assert_eq!(unpack_stereo(s), (-1, 0x1234));
        assert_eq!(unpack_stereo(pack_stereo(i16::MIN, i16::MAX)), (i16::MIN, i16::MAX));
    }

    struct MockSystem {
        mounted: bool,
    }

    impl System for MockSystem {
        type Error = std::convert::Infallible;

        fn reset(&mut self) {}

        fn step_frame(&mut self) -> Result<Frame, Self::Error> {
            Ok(Frame::new(2, 2))
        }

        fn save_state(&self) -> Value {
            serde_json::json!({"mock": true, "version": 1})
        }

        fn load_state(&mut self, _v: &Value) -> Result<(), serde_json::Error> {
            Ok(())
        }

        fn mount_points(&self) -> Vec<MountPointInfo> {
            vec![MountPointInfo {
                id: "test".to_string(),
                name: "Test Slot".to_string(),
                extensions: vec!["bin".to_string()],
                required: false,
            }]
        }

        fn mount(&mut self, _mount_point_id: &str, _data: &[u8]) -> Result<(), Self::Error> {
            self.mounted = true;
            Ok(())
        }

        fn unmount(&mut self, _mount_point_id: &str) -> Result<(), Self::Error> {
            self.mounted = false;
            Ok(())
        }

        fn is_mounted(&self, _mount_point_id: &str) -> bool {
            self.mounted
        }
    }

    #[test]
    fn mock_system_save_load_roundtrip() {
        let sys = MockSystem { mounted: false };
        let v = sys.save_state();
        let s = serde_json::to_string(&v).expect("serialize");
        let v2: Value = serde_json::from_str(&s).expect("deserialize");
        let mut sys2 = MockSystem { mounted: false };
        assert!(sys2.load_state(&v2).is_ok());
        assert!(!sys2.supports_save_states());
    }

    #[test]
    fn mock_system_mount_cycle() {
        let mut sys = MockSystem { mounted: false };
        assert_eq!(sys.mount_points()[0].id, "test");
        assert!(sys.mount("test", &[1, 2, 3]).is_ok());
        assert!(sys.is_mounted("test"));
        assert!(sys.unmount("test").is_ok());
        assert!(!sys.is_mounted("test"));
    }
}
