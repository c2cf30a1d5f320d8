//! Serial link port
//!
//! - `$FF01 (SB)`: Serial transfer data
//! - `$FF02 (SC)`: bit 7 transfer start/busy, bit 1 fast clock (CGB),
//!   bit 0 internal clock
//!
//! An internal-clock transfer shifts one bit every 512 CPU clocks (16 with
//! the CGB fast clock). With nothing on the other end the line reads high,
//! so the received byte is 0xFF. A host that emulates a partner uses
//! [`LinkCommand`] to exchange bytes instead.

use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

const CLOCKS_PER_BIT: u32 = 512;
const CLOCKS_PER_BIT_FAST: u32 = 16;

/// Host side of the link cable protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    /// 1 while an internal-clock transfer has a byte waiting to be sent
    ShiftOutReady,
    /// 1 while an external-clock transfer is armed and waiting for a byte
    ShiftInReady,
    /// Returns SB and marks the outgoing byte as sent
    TakeOutByte,
    /// Deliver a received byte, completing the transfer
    PutInByte(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Serial {
    sb: u8,
    sc: u8,
    /// Bits left in the current internal-clock transfer
    bits_left: u8,
    /// CPU clocks until the next bit
    countdown: u32,
    /// Outgoing byte not yet taken by the host
    out_pending: bool,
}

impl Default for Serial {
    fn default() -> Self {
        Self::new()
    }
}

impl Serial {
    pub fn new() -> Self {
        Self {
            sb: 0,
            sc: 0,
            bits_left: 0,
            countdown: 0,
            out_pending: false,
        }
    }

    pub fn read_register(&self, addr: u16, cgb: bool) -> u8 {
        match addr {
            0xFF01 => self.sb,
            0xFF02 if cgb => self.sc | 0x7C,
            0xFF02 => self.sc | 0x7E,
            _ => 0xFF,
        }
    }

    /// Returns true when the write started a transfer
    pub fn write_register(&mut self, addr: u16, val: u8, cgb: bool) -> bool {
        match addr {
            0xFF01 => {
                self.sb = val;
                false
            }
            0xFF02 => {
                self.sc = if cgb { val & 0x83 } else { val & 0x81 };
                if self.sc & 0x80 == 0 {
                    self.bits_left = 0;
                    self.out_pending = false;
                    return false;
                }
                if self.sc & 0x01 != 0 {
                    self.bits_left = 8;
                    self.countdown = self.bit_period();
                    self.out_pending = true;
                }
                log(LogCategory::Bus, LogLevel::Trace, || {
                    format!("serial transfer started, SB={:02X} SC={:02X}", self.sb, self.sc)
                });
                true
            }
            _ => false,
        }
    }

    fn bit_period(&self) -> u32 {
        if self.sc & 0x02 != 0 {
            CLOCKS_PER_BIT_FAST
        } else {
            CLOCKS_PER_BIT
        }
    }

    /// Advance by `clocks` CPU clocks. Returns true when a transfer finished.
    pub fn tick(&mut self, clocks: u32) -> bool {
        if self.bits_left == 0 {
            return false;
        }
        let mut remaining = clocks;
        while remaining >= self.countdown {
            remaining -= self.countdown;
            self.countdown = self.bit_period();
            self.sb = (self.sb << 1) | 1;
            self.bits_left -= 1;
            if self.bits_left == 0 {
                self.finish();
                return true;
            }
        }
        self.countdown -= remaining;
        false
    }

    fn finish(&mut self) {
        self.sc &= 0x7F;
        self.bits_left = 0;
        self.out_pending = false;
    }

    /// Host link protocol. Returns the requested value and whether a serial
    /// interrupt must be raised.
    pub fn link_status(&mut self, cmd: LinkCommand) -> (u8, bool) {
        match cmd {
            LinkCommand::ShiftOutReady => (self.out_pending as u8, false),
            LinkCommand::ShiftInReady => ((self.sc & 0x81 == 0x80) as u8, false),
            LinkCommand::TakeOutByte => {
                self.out_pending = false;
                (self.sb, false)
            }
            LinkCommand::PutInByte(b) => {
                if self.sc & 0x80 == 0 {
                    return (0, false);
                }
                self.sb = b;
                self.finish();
                (0, true)
            }
        }
    }
}
