//! Sharp LR35902 CPU core (Game Boy CPU)
//!
//! This is a Z80-like CPU used in Game Boy and Game Boy Color.
//! It's similar to Z80 but with some instructions removed and others modified.
//!
//! Execution is memory-cycle accurate: every bus access and every internal
//! delay is one machine cycle, and the memory implementation advances the
//! rest of the machine on each of them. Instruction totals therefore fall out
//! of the access pattern instead of a lookup table.

use crate::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

/// Kind of instruction-stream read, for code/data classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// First byte of an instruction (or the byte after a 0xCB prefix)
    Opcode,
    /// Immediate operand byte
    Operand,
}

/// Memory interface trait for the LR35902 CPU
///
/// `read`, `write`, `fetch` and `tick` each represent exactly one machine
/// cycle; implementations advance timers, video and sound by that amount.
pub trait MemoryLr35902 {
    /// Read a byte from memory
    fn read(&mut self, addr: u16) -> u8;

    /// Write a byte to memory
    fn write(&mut self, addr: u16, val: u8);

    /// Read a byte from the instruction stream
    fn fetch(&mut self, addr: u16, kind: Fetch) -> u8 {
        let _ = kind;
        self.read(addr)
    }

    /// Internal machine cycle without a bus access
    fn tick(&mut self);

    /// IE & IF, lower five bits
    fn pending_interrupts(&self) -> u8;

    /// Clear the request flag of interrupt `bit` as it is being serviced
    fn acknowledge_interrupt(&mut self, bit: u8);

    /// STOP was executed. Returns true when it was consumed by a speed switch
    /// and execution continues immediately.
    fn stop(&mut self) -> bool {
        false
    }

    /// Polled while stopped; true once a joypad line has gone low.
    fn stop_wakeup(&mut self) -> bool {
        true
    }
}

/// Plain register snapshot, used for diagnostics and save states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub pc: u16,
    pub sp: u16,
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub f: u8,
    pub h: u8,
    pub l: u8,
}

impl Registers {
    /// `[pc, sp, a, b, c, d, e, f, h, l]`
    pub fn to_array(&self) -> [u32; 10] {
        [
            self.pc as u32,
            self.sp as u32,
            self.a as u32,
            self.b as u32,
            self.c as u32,
            self.d as u32,
            self.e as u32,
            self.f as u32,
            self.h as u32,
            self.l as u32,
        ]
    }
}

/// Everything needed to resume the CPU exactly where it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub regs: Registers,
    pub ime: bool,
    pub ei_delay: u8,
    pub halted: bool,
    pub halt_bug: bool,
    pub stopped: bool,
    pub locked: bool,
    pub cycles: u64,
}

/// Sharp LR35902 CPU state
#[derive(Debug)]
pub struct CpuLr35902<M: MemoryLr35902> {
    /// Accumulator & Flags (combined as AF)
    pub a: u8,
    pub f: u8,
    /// BC register pair
    pub b: u8,
    pub c: u8,
    /// DE register pair
    pub d: u8,
    pub e: u8,
    /// HL register pair
    pub h: u8,
    pub l: u8,
    /// Stack pointer
    pub sp: u16,
    /// Program counter
    pub pc: u16,
    /// Interrupt Master Enable flag
    pub ime: bool,
    /// Steps until a pending EI takes effect (0 = none)
    ei_delay: u8,
    /// Halted state
    pub halted: bool,
    /// Next opcode fetch does not advance PC
    halt_bug: bool,
    /// Stopped state (for STOP instruction)
    pub stopped: bool,
    /// Hung on an undefined opcode
    pub locked: bool,
    /// Total CPU clocks executed (4 per machine cycle)
    pub cycles: u64,
    /// Memory interface
    pub memory: M,
}

// Flag bit positions (in F register)
const FLAG_Z: u8 = 0b10000000; // Zero
const FLAG_N: u8 = 0b01000000; // Subtract (BCD)
const FLAG_H: u8 = 0b00100000; // Half Carry (BCD)
const FLAG_C: u8 = 0b00010000; // Carry

/// Clocks per machine cycle at CPU speed
const M_CYCLE: u64 = 4;

impl<M: MemoryLr35902> CpuLr35902<M> {
    /// Create a new LR35902 CPU
    pub fn new(memory: M) -> Self {
        Self {
            a: 0,
            f: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            sp: 0,
            pc: 0,
            ime: false,
            ei_delay: 0,
            halted: false,
            halt_bug: false,
            stopped: false,
            locked: false,
            cycles: 0,
            memory,
        }
    }

    /// Reset the CPU to the point where a boot ROM starts executing
    pub fn reset(&mut self) {
        self.set_registers(&Registers::default());
        self.ime = false;
        self.ei_delay = 0;
        self.halted = false;
        self.halt_bug = false;
        self.stopped = false;
        self.locked = false;
        self.cycles = 0;
    }

    pub fn registers(&self) -> Registers {
        Registers {
            pc: self.pc,
            sp: self.sp,
            a: self.a,
            b: self.b,
            c: self.c,
            d: self.d,
            e: self.e,
            f: self.f,
            h: self.h,
            l: self.l,
        }
    }

    pub fn set_registers(&mut self, regs: &Registers) {
        self.pc = regs.pc;
        self.sp = regs.sp;
        self.a = regs.a;
        self.b = regs.b;
        self.c = regs.c;
        self.d = regs.d;
        self.e = regs.e;
        self.f = regs.f & 0xF0;
        self.h = regs.h;
        self.l = regs.l;
    }

    pub fn state(&self) -> CpuState {
        CpuState {
            regs: self.registers(),
            ime: self.ime,
            ei_delay: self.ei_delay,
            halted: self.halted,
            halt_bug: self.halt_bug,
            stopped: self.stopped,
            locked: self.locked,
            cycles: self.cycles,
        }
    }

    pub fn restore(&mut self, state: &CpuState) {
        self.set_registers(&state.regs);
        self.ime = state.ime;
        self.ei_delay = state.ei_delay;
        self.halted = state.halted;
        self.halt_bug = state.halt_bug;
        self.stopped = state.stopped;
        self.locked = state.locked;
        self.cycles = state.cycles;
    }

    /// Execute one instruction (or one idle machine cycle while halted,
    /// stopped or locked, or one interrupt dispatch). Returns CPU clocks.
    pub fn step(&mut self) -> u32 {
        let start = self.cycles;

        if self.locked {
            self.idle();
            return (self.cycles - start) as u32;
        }

        if self.stopped {
            self.idle();
            if self.memory.stop_wakeup() {
                self.stopped = false;
            }
            return (self.cycles - start) as u32;
        }

        let pending = self.memory.pending_interrupts() & 0x1F;

        if self.halted {
            if pending == 0 {
                self.idle();
                return (self.cycles - start) as u32;
            }
            self.halted = false;
            if self.ime {
                // Leaving halt costs one extra cycle before dispatch
                self.idle();
            }
        }

        if self.ime && pending != 0 {
            self.dispatch_interrupt();
        } else {
            let opcode = self.fetch_opcode();
            self.execute(opcode);
            if self.ei_delay > 0 {
                self.ei_delay -= 1;
                if self.ei_delay == 0 {
                    self.ime = true;
                }
            }
        }

        (self.cycles - start) as u32
    }

    fn dispatch_interrupt(&mut self) {
        self.ime = false;
        self.idle();
        self.idle();

        let pc = self.pc;
        self.sp = self.sp.wrapping_sub(1);
        self.write8(self.sp, (pc >> 8) as u8);

        // The high byte push may land on IE and cancel the request
        let pending = self.memory.pending_interrupts() & 0x1F;

        self.sp = self.sp.wrapping_sub(1);
        self.write8(self.sp, pc as u8);

        if pending == 0 {
            log(LogCategory::Interrupts, LogLevel::Debug, || {
                "interrupt dispatch cancelled by IE write, jumping to 0000".to_string()
            });
            self.pc = 0x0000;
        } else {
            let bit = pending.trailing_zeros() as u8;
            self.memory.acknowledge_interrupt(bit);
            self.pc = 0x0040 + (bit as u16) * 8;
        }
        self.idle();
    }

    // Bus cycles

    fn idle(&mut self) {
        self.cycles += M_CYCLE;
        self.memory.tick();
    }

    fn read8(&mut self, addr: u16) -> u8 {
        self.cycles += M_CYCLE;
        self.memory.read(addr)
    }

    fn write8(&mut self, addr: u16, val: u8) {
        self.cycles += M_CYCLE;
        self.memory.write(addr, val);
    }

    fn fetch_opcode(&mut self) -> u8 {
        self.cycles += M_CYCLE;
        let val = self.memory.fetch(self.pc, Fetch::Opcode);
        if self.halt_bug {
            self.halt_bug = false;
        } else {
            self.pc = self.pc.wrapping_add(1);
        }
        val
    }

    fn read_pc(&mut self) -> u8 {
        self.cycles += M_CYCLE;
        let val = self.memory.fetch(self.pc, Fetch::Operand);
        self.pc = self.pc.wrapping_add(1);
        val
    }

    fn read_pc_u16(&mut self) -> u16 {
        let lo = self.read_pc() as u16;
        let hi = self.read_pc() as u16;
        (hi << 8) | lo
    }

    /// PUSH timing: one internal cycle, then high byte, then low byte
    fn push_u16(&mut self, val: u16) {
        self.idle();
        self.sp = self.sp.wrapping_sub(1);
        self.write8(self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        self.write8(self.sp, val as u8);
    }

    fn pop_u16(&mut self) -> u16 {
        let lo = self.read8(self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        let hi = self.read8(self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        (hi << 8) | lo
    }

    fn jump_relative(&mut self, offset: i8) {
        self.pc = self.pc.wrapping_add(offset as u16);
        self.idle();
    }

    fn call(&mut self, addr: u16) {
        self.push_u16(self.pc);
        self.pc = addr;
    }

    fn ret(&mut self) {
        self.pc = self.pop_u16();
        self.idle();
    }

    // Register pair accessors
    fn bc(&self) -> u16 {
        ((self.b as u16) << 8) | (self.c as u16)
    }

    fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    fn de(&self) -> u16 {
        ((self.d as u16) << 8) | (self.e as u16)
    }

    fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    fn hl(&self) -> u16 {
        ((self.h as u16) << 8) | (self.l as u16)
    }

    fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    fn af(&self) -> u16 {
        ((self.a as u16) << 8) | (self.f as u16)
    }

    fn set_af(&mut self, val: u16) {
        self.a = (val >> 8) as u8;
        self.f = val as u8 & 0xF0; // Lower 4 bits always 0
    }

    /// 8-bit operand by encoding index; 6 is (HL) and costs a bus cycle
    fn reg8(&mut self, idx: u8) -> u8 {
        match idx & 7 {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => self.read8(self.hl()),
            _ => self.a,
        }
    }

    fn set_reg8(&mut self, idx: u8, val: u8) {
        match idx & 7 {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => self.write8(self.hl(), val),
            _ => self.a = val,
        }
    }

    // Flag operations
    fn set_flag(&mut self, flag: u8, val: bool) {
        if val {
            self.f |= flag;
        } else {
            self.f &= !flag;
        }
    }

    fn get_flag(&self, flag: u8) -> bool {
        (self.f & flag) != 0
    }

    fn update_flags_zn(&mut self, val: u8, subtract: bool) {
        self.set_flag(FLAG_Z, val == 0);
        self.set_flag(FLAG_N, subtract);
    }

    /// Condition codes NZ, Z, NC, C
    fn condition(&self, cc: u8) -> bool {
        match cc & 3 {
            0 => !self.get_flag(FLAG_Z),
            1 => self.get_flag(FLAG_Z),
            2 => !self.get_flag(FLAG_C),
            _ => self.get_flag(FLAG_C),
        }
    }

    // Arithmetic operations
    fn add(&mut self, val: u8, carry: bool) {
        let c = if carry && self.get_flag(FLAG_C) { 1 } else { 0 };
        let result = self.a as u16 + val as u16 + c as u16;

        self.set_flag(FLAG_H, ((self.a & 0x0F) + (val & 0x0F) + c) > 0x0F);
        self.set_flag(FLAG_C, result > 0xFF);
        self.a = result as u8;
        self.update_flags_zn(self.a, false);
    }

    fn sub(&mut self, val: u8, carry: bool) {
        let c = if carry && self.get_flag(FLAG_C) { 1 } else { 0 };
        let result = self.a as i16 - val as i16 - c as i16;

        self.set_flag(FLAG_H, (self.a & 0x0F) < ((val & 0x0F) + c));
        self.set_flag(FLAG_C, result < 0);
        self.a = result as u8;
        self.update_flags_zn(self.a, true);
    }

    fn and(&mut self, val: u8) {
        self.a &= val;
        self.f = FLAG_H;
        self.update_flags_zn(self.a, false);
    }

    fn xor(&mut self, val: u8) {
        self.a ^= val;
        self.f = 0;
        self.update_flags_zn(self.a, false);
    }

    fn or(&mut self, val: u8) {
        self.a |= val;
        self.f = 0;
        self.update_flags_zn(self.a, false);
    }

    fn cp(&mut self, val: u8) {
        let result = self.a as i16 - val as i16;
        self.set_flag(FLAG_H, (self.a & 0x0F) < (val & 0x0F));
        self.set_flag(FLAG_C, result < 0);
        self.update_flags_zn(result as u8, true);
    }

    fn alu(&mut self, op: u8, val: u8) {
        match op & 7 {
            0 => self.add(val, false),
            1 => self.add(val, true),
            2 => self.sub(val, false),
            3 => self.sub(val, true),
            4 => self.and(val),
            5 => self.xor(val),
            6 => self.or(val),
            _ => self.cp(val),
        }
    }

    fn inc(&mut self, val: u8) -> u8 {
        let result = val.wrapping_add(1);
        self.set_flag(FLAG_H, (val & 0x0F) == 0x0F);
        self.update_flags_zn(result, false);
        result
    }

    fn dec(&mut self, val: u8) -> u8 {
        let result = val.wrapping_sub(1);
        self.set_flag(FLAG_H, (val & 0x0F) == 0);
        self.update_flags_zn(result, true);
        result
    }

    fn add_hl(&mut self, val: u16) {
        let hl = self.hl();
        let result = hl.wrapping_add(val);
        self.set_flag(FLAG_N, false);
        self.set_flag(FLAG_H, ((hl & 0x0FFF) + (val & 0x0FFF)) > 0x0FFF);
        self.set_flag(FLAG_C, result < hl);
        self.set_hl(result);
        self.idle();
    }

    /// SP + signed immediate, flags from the low byte (ADD SP,e / LD HL,SP+e)
    fn sp_offset(&mut self) -> u16 {
        let offset = self.read_pc() as i8 as i16 as u16;
        let result = self.sp.wrapping_add(offset);
        self.f = 0;
        self.set_flag(FLAG_H, ((self.sp & 0x000F) + (offset & 0x000F)) > 0x000F);
        self.set_flag(FLAG_C, ((self.sp & 0x00FF) + (offset & 0x00FF)) > 0x00FF);
        result
    }

    fn daa(&mut self) {
        let mut carry = self.get_flag(FLAG_C);
        if self.get_flag(FLAG_N) {
            let mut adjust = 0u8;
            if carry {
                adjust |= 0x60;
            }
            if self.get_flag(FLAG_H) {
                adjust |= 0x06;
            }
            self.a = self.a.wrapping_sub(adjust);
        } else {
            let mut adjust = 0u8;
            if carry || self.a > 0x99 {
                adjust |= 0x60;
                carry = true;
            }
            if self.get_flag(FLAG_H) || (self.a & 0x0F) > 0x09 {
                adjust |= 0x06;
            }
            self.a = self.a.wrapping_add(adjust);
        }
        self.set_flag(FLAG_Z, self.a == 0);
        self.set_flag(FLAG_H, false);
        self.set_flag(FLAG_C, carry);
    }

    fn rlc(&mut self, val: u8) -> u8 {
        let carry = (val & 0x80) != 0;
        let result = val.rotate_left(1);
        self.f = 0;
        self.set_flag(FLAG_C, carry);
        self.set_flag(FLAG_Z, result == 0);
        result
    }

    fn rrc(&mut self, val: u8) -> u8 {
        let carry = (val & 0x01) != 0;
        let result = val.rotate_right(1);
        self.f = 0;
        self.set_flag(FLAG_C, carry);
        self.set_flag(FLAG_Z, result == 0);
        result
    }

    fn rl(&mut self, val: u8) -> u8 {
        let old_carry = if self.get_flag(FLAG_C) { 1 } else { 0 };
        let new_carry = (val & 0x80) != 0;
        let result = (val << 1) | old_carry;
        self.f = 0;
        self.set_flag(FLAG_C, new_carry);
        self.set_flag(FLAG_Z, result == 0);
        result
    }

    fn rr(&mut self, val: u8) -> u8 {
        let old_carry = if self.get_flag(FLAG_C) { 0x80 } else { 0 };
        let new_carry = (val & 0x01) != 0;
        let result = (val >> 1) | old_carry;
        self.f = 0;
        self.set_flag(FLAG_C, new_carry);
        self.set_flag(FLAG_Z, result == 0);
        result
    }

    fn sla(&mut self, val: u8) -> u8 {
        let carry = (val & 0x80) != 0;
        let result = val << 1;
        self.f = 0;
        self.set_flag(FLAG_C, carry);
        self.set_flag(FLAG_Z, result == 0);
        result
    }

    fn sra(&mut self, val: u8) -> u8 {
        let carry = (val & 0x01) != 0;
        let result = (val >> 1) | (val & 0x80);
        self.f = 0;
        self.set_flag(FLAG_C, carry);
        self.set_flag(FLAG_Z, result == 0);
        result
    }

    fn swap(&mut self, val: u8) -> u8 {
        let result = val.rotate_left(4);
        self.f = 0;
        self.set_flag(FLAG_Z, result == 0);
        result
    }

    fn srl(&mut self, val: u8) -> u8 {
        let carry = (val & 0x01) != 0;
        let result = val >> 1;
        self.f = 0;
        self.set_flag(FLAG_C, carry);
        self.set_flag(FLAG_Z, result == 0);
        result
    }

    fn bit(&mut self, bit: u8, val: u8) {
        self.set_flag(FLAG_Z, (val & (1 << bit)) == 0);
        self.set_flag(FLAG_N, false);
        self.set_flag(FLAG_H, true);
    }

    fn halt(&mut self) {
        let pending = self.memory.pending_interrupts() & 0x1F;
        if !self.ime && self.ei_delay == 0 && pending != 0 {
            // Halt bug: no halt, and the next opcode byte is read twice
            self.halt_bug = true;
        } else {
            self.halted = true;
        }
    }

    fn stop(&mut self) {
        // STOP is followed by a padding byte that is skipped
        self.pc = self.pc.wrapping_add(1);
        if self.memory.stop() {
            return;
        }
        log(LogCategory::Cpu, LogLevel::Debug, || {
            format!("STOP at PC={:04X}", self.pc.wrapping_sub(2))
        });
        self.stopped = true;
    }

    fn lock_up(&mut self, opcode: u8) {
        log(LogCategory::Stubs, LogLevel::Warn, || {
            format!(
                "undefined opcode {:02X} at PC={:04X}, CPU locked",
                opcode,
                self.pc.wrapping_sub(1)
            )
        });
        self.locked = true;
    }

    fn execute(&mut self, opcode: u8) {
        match opcode {
            // NOP
            0x00 => {}

            // LD BC,d16 / LD DE,d16 / LD HL,d16 / LD SP,d16
            0x01 => { let val = self.read_pc_u16(); self.set_bc(val); }
            0x11 => { let val = self.read_pc_u16(); self.set_de(val); }
            0x21 => { let val = self.read_pc_u16(); self.set_hl(val); }
            0x31 => { self.sp = self.read_pc_u16(); }

            // LD (BC),A / LD (DE),A / LD (HL+),A / LD (HL-),A
            0x02 => { self.write8(self.bc(), self.a); }
            0x12 => { self.write8(self.de(), self.a); }
            0x22 => { let addr = self.hl(); self.write8(addr, self.a); self.set_hl(addr.wrapping_add(1)); }
            0x32 => { let addr = self.hl(); self.write8(addr, self.a); self.set_hl(addr.wrapping_sub(1)); }

            // INC BC / INC DE / INC HL / INC SP
            0x03 => { self.set_bc(self.bc().wrapping_add(1)); self.idle(); }
            0x13 => { self.set_de(self.de().wrapping_add(1)); self.idle(); }
            0x23 => { self.set_hl(self.hl().wrapping_add(1)); self.idle(); }
            0x33 => { self.sp = self.sp.wrapping_add(1); self.idle(); }

            // INC r / DEC r
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let idx = opcode >> 3;
                let val = self.reg8(idx);
                let result = self.inc(val);
                self.set_reg8(idx, result);
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let idx = opcode >> 3;
                let val = self.reg8(idx);
                let result = self.dec(val);
                self.set_reg8(idx, result);
            }

            // LD r,d8
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let val = self.read_pc();
                self.set_reg8(opcode >> 3, val);
            }

            // RLCA / RRCA / RLA / RRA
            0x07 => { self.a = self.rlc(self.a); self.set_flag(FLAG_Z, false); }
            0x0F => { self.a = self.rrc(self.a); self.set_flag(FLAG_Z, false); }
            0x17 => { self.a = self.rl(self.a); self.set_flag(FLAG_Z, false); }
            0x1F => { self.a = self.rr(self.a); self.set_flag(FLAG_Z, false); }

            // LD (a16),SP
            0x08 => {
                let addr = self.read_pc_u16();
                self.write8(addr, self.sp as u8);
                self.write8(addr.wrapping_add(1), (self.sp >> 8) as u8);
            }

            // ADD HL,r16
            0x09 => { self.add_hl(self.bc()); }
            0x19 => { self.add_hl(self.de()); }
            0x29 => { self.add_hl(self.hl()); }
            0x39 => { self.add_hl(self.sp); }

            // LD A,(BC) / LD A,(DE) / LD A,(HL+) / LD A,(HL-)
            0x0A => { self.a = self.read8(self.bc()); }
            0x1A => { self.a = self.read8(self.de()); }
            0x2A => { let addr = self.hl(); self.a = self.read8(addr); self.set_hl(addr.wrapping_add(1)); }
            0x3A => { let addr = self.hl(); self.a = self.read8(addr); self.set_hl(addr.wrapping_sub(1)); }

            // DEC BC / DEC DE / DEC HL / DEC SP
            0x0B => { self.set_bc(self.bc().wrapping_sub(1)); self.idle(); }
            0x1B => { self.set_de(self.de().wrapping_sub(1)); self.idle(); }
            0x2B => { self.set_hl(self.hl().wrapping_sub(1)); self.idle(); }
            0x3B => { self.sp = self.sp.wrapping_sub(1); self.idle(); }

            // JR r8 / JR cc,r8
            0x18 => { let offset = self.read_pc() as i8; self.jump_relative(offset); }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.read_pc() as i8;
                if self.condition(opcode >> 3) {
                    self.jump_relative(offset);
                }
            }

            // DAA / CPL / SCF / CCF
            0x27 => { self.daa(); }
            0x2F => { self.a = !self.a; self.set_flag(FLAG_N, true); self.set_flag(FLAG_H, true); }
            0x37 => { self.set_flag(FLAG_N, false); self.set_flag(FLAG_H, false); self.set_flag(FLAG_C, true); }
            0x3F => { self.set_flag(FLAG_N, false); self.set_flag(FLAG_H, false); self.set_flag(FLAG_C, !self.get_flag(FLAG_C)); }

            // STOP / HALT
            0x10 => { self.stop(); }
            0x76 => { self.halt(); }

            // LD r,r (0x40-0x7F except 0x76 which is HALT)
            0x40..=0x7F => {
                let val = self.reg8(opcode);
                self.set_reg8(opcode >> 3, val);
            }

            // ADD/ADC/SUB/SBC/AND/XOR/OR/CP r (0x80-0xBF)
            0x80..=0xBF => {
                let val = self.reg8(opcode);
                self.alu(opcode >> 3, val);
            }

            // RET cc
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                self.idle();
                if self.condition(opcode >> 3) {
                    self.ret();
                }
            }

            // POP BC/DE/HL/AF
            0xC1 => { let val = self.pop_u16(); self.set_bc(val); }
            0xD1 => { let val = self.pop_u16(); self.set_de(val); }
            0xE1 => { let val = self.pop_u16(); self.set_hl(val); }
            0xF1 => { let val = self.pop_u16(); self.set_af(val); }

            // JP cc,a16
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let addr = self.read_pc_u16();
                if self.condition(opcode >> 3) {
                    self.pc = addr;
                    self.idle();
                }
            }

            // JP a16
            0xC3 => { self.pc = self.read_pc_u16(); self.idle(); }

            // CALL cc,a16
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let addr = self.read_pc_u16();
                if self.condition(opcode >> 3) {
                    self.call(addr);
                }
            }

            // PUSH BC/DE/HL/AF
            0xC5 => { self.push_u16(self.bc()); }
            0xD5 => { self.push_u16(self.de()); }
            0xE5 => { self.push_u16(self.hl()); }
            0xF5 => { self.push_u16(self.af()); }

            // ADD/ADC/SUB/SBC/AND/XOR/OR/CP d8
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let val = self.read_pc();
                self.alu(opcode >> 3, val);
            }

            // RST n
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                self.call((opcode & 0x38) as u16);
            }

            // RET / RETI
            0xC9 => { self.ret(); }
            0xD9 => { self.ret(); self.ime = true; self.ei_delay = 0; }

            // JP (HL)
            0xE9 => { self.pc = self.hl(); }

            // LD SP,HL
            0xF9 => { self.sp = self.hl(); self.idle(); }

            // CALL a16
            0xCD => { let addr = self.read_pc_u16(); self.call(addr); }

            // CB prefix
            0xCB => {
                self.cycles += M_CYCLE;
                let cb_op = self.memory.fetch(self.pc, Fetch::Opcode);
                self.pc = self.pc.wrapping_add(1);
                self.execute_cb(cb_op);
            }

            // LDH (a8),A / LDH A,(a8)
            0xE0 => { let offset = self.read_pc() as u16; self.write8(0xFF00 | offset, self.a); }
            0xF0 => { let offset = self.read_pc() as u16; self.a = self.read8(0xFF00 | offset); }

            // LD (C),A / LD A,(C)
            0xE2 => { self.write8(0xFF00 | self.c as u16, self.a); }
            0xF2 => { self.a = self.read8(0xFF00 | self.c as u16); }

            // LD (a16),A / LD A,(a16)
            0xEA => { let addr = self.read_pc_u16(); self.write8(addr, self.a); }
            0xFA => { let addr = self.read_pc_u16(); self.a = self.read8(addr); }

            // DI / EI
            0xF3 => { self.ime = false; self.ei_delay = 0; }
            0xFB => { if !self.ime { self.ei_delay = 2; } }

            // ADD SP,r8
            0xE8 => {
                self.sp = self.sp_offset();
                self.idle();
                self.idle();
            }

            // LD HL,SP+r8
            0xF8 => {
                let result = self.sp_offset();
                self.set_hl(result);
                self.idle();
            }

            // Undefined: 0xD3 0xDB 0xDD 0xE3 0xE4 0xEB 0xEC 0xED 0xF4 0xFC 0xFD
            _ => self.lock_up(opcode),
        }
    }

    fn execute_cb(&mut self, opcode: u8) {
        let reg = opcode & 0x07;
        let op = (opcode >> 3) & 0x07;

        let val = self.reg8(reg);

        let result = match opcode >> 6 {
            0 => match op {
                0 => self.rlc(val),
                1 => self.rrc(val),
                2 => self.rl(val),
                3 => self.rr(val),
                4 => self.sla(val),
                5 => self.sra(val),
                6 => self.swap(val),
                _ => self.srl(val),
            },
            1 => {
                self.bit(op, val);
                return;
            }
            2 => val & !(1 << op), // RES
            _ => val | (1 << op),  // SET
        };

        self.set_reg8(reg, result);
    }
}

impl<M: MemoryLr35902> crate::Cpu for CpuLr35902<M> {
    fn reset(&mut self) {
        self.reset();
    }

    fn step(&mut self) -> u32 {
        self.step()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ArrayMemory {
        mem: Box<[u8; 65536]>,
        ticks: u32,
        ie: u8,
        if_reg: u8,
        speed_switch: bool,
        opcode_fetches: Vec<u16>,
    }

    impl MemoryLr35902 for ArrayMemory {
        fn read(&mut self, addr: u16) -> u8 {
            self.ticks += 1;
            self.mem[addr as usize]
        }

        fn write(&mut self, addr: u16, val: u8) {
            self.ticks += 1;
            if addr == 0xFFFF {
                self.ie = val;
            }
            self.mem[addr as usize] = val;
        }

        fn fetch(&mut self, addr: u16, kind: Fetch) -> u8 {
            if kind == Fetch::Opcode {
                self.opcode_fetches.push(addr);
            }
            self.read(addr)
        }

        fn tick(&mut self) {
            self.ticks += 1;
        }

        fn pending_interrupts(&self) -> u8 {
            self.ie & self.if_reg & 0x1F
        }

        fn acknowledge_interrupt(&mut self, bit: u8) {
            self.if_reg &= !(1 << bit);
        }

        fn stop(&mut self) -> bool {
            self.speed_switch
        }

        fn stop_wakeup(&mut self) -> bool {
            self.if_reg & 0x10 != 0
        }
    }

    fn make_cpu() -> CpuLr35902<ArrayMemory> {
        CpuLr35902::new(ArrayMemory {
            mem: Box::new([0; 65536]),
            ticks: 0,
            ie: 0,
            if_reg: 0,
            speed_switch: false,
            opcode_fetches: Vec::new(),
        })
    }

    fn load(cpu: &mut CpuLr35902<ArrayMemory>, program: &[u8]) {
        cpu.pc = 0x100;
        cpu.sp = 0xFFFE;
        cpu.memory.mem[0x100..0x100 + program.len()].copy_from_slice(program);
    }

    #[test]
    fn test_nop() {
        let mut cpu = make_cpu();
        load(&mut cpu, &[0x00]);
        let cycles = cpu.step();
        assert_eq!(cycles, 4);
        assert_eq!(cpu.pc, 0x101);
        assert_eq!(cpu.memory.ticks, 1);
    }

    #[test]
    fn test_ld_bc_d16() {
        let mut cpu = make_cpu();
        load(&mut cpu, &[0x01, 0x34, 0x12]);
        assert_eq!(cpu.step(), 12);
        assert_eq!(cpu.bc(), 0x1234);
    }

    #[test]
    fn test_inc_dec() {
        let mut cpu = make_cpu();
        cpu.b = 0xFF;
        load(&mut cpu, &[0x04, 0x05]);
        cpu.step();
        assert_eq!(cpu.b, 0x00);
        assert!(cpu.get_flag(FLAG_Z));
        assert!(cpu.get_flag(FLAG_H));
        cpu.step();
        assert_eq!(cpu.b, 0xFF);
        assert!(cpu.get_flag(FLAG_N));
    }

    #[test]
    fn test_inc_hl_indirect_timing() {
        let mut cpu = make_cpu();
        cpu.set_hl(0xC000);
        cpu.memory.mem[0xC000] = 0x41;
        load(&mut cpu, &[0x34]);
        assert_eq!(cpu.step(), 12);
        assert_eq!(cpu.memory.mem[0xC000], 0x42);
    }

    #[test]
    fn test_add_and_carry() {
        let mut cpu = make_cpu();
        cpu.a = 0xFF;
        cpu.b = 0x01;
        load(&mut cpu, &[0x80, 0x88]);
        cpu.step();
        assert_eq!(cpu.a, 0x00);
        assert!(cpu.get_flag(FLAG_C));
        assert!(cpu.get_flag(FLAG_Z));
        cpu.step(); // ADC A,B with carry in
        assert_eq!(cpu.a, 0x02);
    }

    #[test]
    fn test_sub_cp_and_logic() {
        let mut cpu = make_cpu();
        cpu.a = 0x30;
        cpu.b = 0x10;
        load(&mut cpu, &[0x90, 0xB8, 0xA0, 0xE6, 0x00, 0xF6, 0x0F, 0xEE, 0x0F]);
        cpu.step();
        assert_eq!(cpu.a, 0x20);
        cpu.step();
        assert!(!cpu.get_flag(FLAG_Z));
        cpu.step(); // AND B
        assert_eq!(cpu.a, 0x00);
        assert!(cpu.get_flag(FLAG_H));
        cpu.step(); // AND 0
        assert!(cpu.get_flag(FLAG_Z));
        cpu.step(); // OR 0F
        assert_eq!(cpu.a, 0x0F);
        cpu.step(); // XOR 0F
        assert_eq!(cpu.a, 0x00);
        assert_eq!(cpu.f, FLAG_Z);
    }

    #[test]
    fn test_daa_after_add_and_sub() {
        let mut cpu = make_cpu();
        cpu.a = 0x45;
        cpu.b = 0x38;
        load(&mut cpu, &[0x80, 0x27, 0x90, 0x27]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.a, 0x83);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.a, 0x45);
        assert!(!cpu.get_flag(FLAG_C));
    }

    #[test]
    fn test_jp_and_jr_timing() {
        let mut cpu = make_cpu();
        load(&mut cpu, &[0xC3, 0x10, 0x01]);
        assert_eq!(cpu.step(), 16);
        assert_eq!(cpu.pc, 0x110);

        cpu.memory.mem[0x110] = 0x18; // JR -2
        cpu.memory.mem[0x111] = 0xFE;
        assert_eq!(cpu.step(), 12);
        assert_eq!(cpu.pc, 0x110);
    }

    #[test]
    fn test_conditional_jr() {
        let mut cpu = make_cpu();
        cpu.f = FLAG_Z;
        load(&mut cpu, &[0x20, 0x05, 0x28, 0x05]);
        assert_eq!(cpu.step(), 8); // JR NZ not taken
        assert_eq!(cpu.pc, 0x102);
        assert_eq!(cpu.step(), 12); // JR Z taken
        assert_eq!(cpu.pc, 0x109);
    }

    #[test]
    fn test_call_ret() {
        let mut cpu = make_cpu();
        load(&mut cpu, &[0xCD, 0x00, 0x02]);
        cpu.memory.mem[0x200] = 0xC9;
        assert_eq!(cpu.step(), 24);
        assert_eq!(cpu.pc, 0x200);
        assert_eq!(cpu.sp, 0xFFFC);
        assert_eq!(cpu.memory.mem[0xFFFD], 0x01);
        assert_eq!(cpu.memory.mem[0xFFFC], 0x03);
        assert_eq!(cpu.step(), 16);
        assert_eq!(cpu.pc, 0x103);
        assert_eq!(cpu.sp, 0xFFFE);
    }

    #[test]
    fn test_ret_cc_timing() {
        let mut cpu = make_cpu();
        cpu.sp = 0xC000;
        cpu.memory.mem[0xC000] = 0x34;
        cpu.memory.mem[0xC001] = 0x12;
        cpu.pc = 0x100;
        cpu.memory.mem[0x100] = 0xC0; // RET NZ
        cpu.memory.mem[0x101] = 0xC8; // RET Z
        cpu.f = FLAG_Z;
        assert_eq!(cpu.step(), 8);
        assert_eq!(cpu.step(), 20);
        assert_eq!(cpu.pc, 0x1234);
    }

    #[test]
    fn test_push_pop() {
        let mut cpu = make_cpu();
        cpu.set_bc(0x1234);
        load(&mut cpu, &[0xC5, 0xF1]);
        assert_eq!(cpu.step(), 16);
        assert_eq!(cpu.step(), 12);
        assert_eq!(cpu.a, 0x12);
        assert_eq!(cpu.f, 0x30); // low nibble dropped
    }

    #[test]
    fn test_16bit_ops() {
        let mut cpu = make_cpu();
        cpu.set_hl(0x0FFF);
        cpu.set_bc(0x0001);
        load(&mut cpu, &[0x09, 0x03, 0x0B]);
        assert_eq!(cpu.step(), 8);
        assert_eq!(cpu.hl(), 0x1000);
        assert!(cpu.get_flag(FLAG_H));
        assert_eq!(cpu.step(), 8);
        assert_eq!(cpu.bc(), 0x0002);
        cpu.step();
        assert_eq!(cpu.bc(), 0x0001);
    }

    #[test]
    fn test_sp_offset_ops() {
        let mut cpu = make_cpu();
        load(&mut cpu, &[0xE8, 0x02, 0xF8, 0xFF]);
        cpu.sp = 0xFFF8;
        assert_eq!(cpu.step(), 16);
        assert_eq!(cpu.sp, 0xFFFA);
        assert_eq!(cpu.step(), 12);
        assert_eq!(cpu.hl(), 0xFFF9);
        assert!(cpu.get_flag(FLAG_C));
        assert!(!cpu.get_flag(FLAG_Z));
    }

    #[test]
    fn test_ld_indirect_and_hl_inc_dec() {
        let mut cpu = make_cpu();
        cpu.a = 0x42;
        cpu.set_hl(0xC000);
        load(&mut cpu, &[0x22, 0x32, 0x2A]);
        cpu.step();
        assert_eq!(cpu.memory.mem[0xC000], 0x42);
        assert_eq!(cpu.hl(), 0xC001);
        cpu.step();
        assert_eq!(cpu.hl(), 0xC000);
        cpu.memory.mem[0xC000] = 0x99;
        cpu.step();
        assert_eq!(cpu.a, 0x99);
        assert_eq!(cpu.hl(), 0xC001);
    }

    #[test]
    fn test_ldh_and_ld_a16_sp() {
        let mut cpu = make_cpu();
        cpu.a = 0x55;
        load(&mut cpu, &[0xE0, 0x80, 0x08, 0x00, 0xC0]);
        assert_eq!(cpu.step(), 12);
        assert_eq!(cpu.memory.mem[0xFF80], 0x55);
        assert_eq!(cpu.step(), 20);
        assert_eq!(cpu.memory.mem[0xC000], 0xFE);
        assert_eq!(cpu.memory.mem[0xC001], 0xFF);
    }

    #[test]
    fn test_cb_ops() {
        let mut cpu = make_cpu();
        cpu.b = 0x85;
        cpu.set_hl(0xC000);
        cpu.memory.mem[0xC000] = 0x01;
        // RLC B, BIT 7,B, RES 0,(HL), SET 7,(HL), BIT 0,(HL)
        load(&mut cpu, &[0xCB, 0x00, 0xCB, 0x78, 0xCB, 0x86, 0xCB, 0xFE, 0xCB, 0x46]);
        assert_eq!(cpu.step(), 8);
        assert_eq!(cpu.b, 0x0B);
        assert!(cpu.get_flag(FLAG_C));
        cpu.step();
        assert!(cpu.get_flag(FLAG_Z));
        assert_eq!(cpu.step(), 16);
        assert_eq!(cpu.memory.mem[0xC000], 0x00);
        assert_eq!(cpu.step(), 16);
        assert_eq!(cpu.memory.mem[0xC000], 0x80);
        assert_eq!(cpu.step(), 12); // BIT 0,(HL)
        assert!(cpu.get_flag(FLAG_Z));
    }

    #[test]
    fn test_rst() {
        let mut cpu = make_cpu();
        load(&mut cpu, &[0xEF]);
        assert_eq!(cpu.step(), 16);
        assert_eq!(cpu.pc, 0x28);
    }

    #[test]
    fn test_ei_takes_effect_after_next_instruction() {
        let mut cpu = make_cpu();
        cpu.memory.ie = 0x01;
        cpu.memory.if_reg = 0x01;
        load(&mut cpu, &[0xFB, 0x00, 0x00]);
        cpu.step(); // EI
        assert!(!cpu.ime);
        cpu.step(); // NOP runs before the interrupt
        assert_eq!(cpu.pc, 0x102);
        assert!(cpu.ime);
        assert_eq!(cpu.step(), 20);
        assert_eq!(cpu.pc, 0x40);
        assert_eq!(cpu.memory.if_reg, 0);
        assert!(!cpu.ime);
    }

    #[test]
    fn test_di_cancels_pending_ei() {
        let mut cpu = make_cpu();
        cpu.memory.ie = 0x01;
        cpu.memory.if_reg = 0x01;
        load(&mut cpu, &[0xFB, 0xF3, 0x00, 0x00]);
        for _ in 0..3 {
            cpu.step();
        }
        assert!(!cpu.ime);
        assert_eq!(cpu.pc, 0x103);
    }

    #[test]
    fn test_interrupt_priority() {
        let mut cpu = make_cpu();
        cpu.ime = true;
        cpu.memory.ie = 0x1F;
        cpu.memory.if_reg = 0x14; // timer and joypad
        load(&mut cpu, &[0x00]);
        cpu.step();
        assert_eq!(cpu.pc, 0x50);
        assert_eq!(cpu.memory.if_reg, 0x10);
    }

    #[test]
    fn test_dispatch_cancelled_by_ie_push() {
        let mut cpu = make_cpu();
        cpu.ime = true;
        cpu.memory.ie = 0x01;
        cpu.memory.if_reg = 0x01;
        // High byte of PC (0x02) lands on IE and clears bit 0
        cpu.pc = 0x0200;
        cpu.sp = 0x0000;
        cpu.step();
        assert_eq!(cpu.pc, 0x0000);
        assert_eq!(cpu.memory.if_reg, 0x01);
    }

    #[test]
    fn test_halt_waits_for_interrupt() {
        let mut cpu = make_cpu();
        cpu.memory.ie = 0x04;
        load(&mut cpu, &[0x76, 0x00]);
        cpu.step();
        assert!(cpu.halted);
        assert_eq!(cpu.step(), 4);
        assert_eq!(cpu.pc, 0x101);

        // IME off: resume after HALT without dispatch
        cpu.memory.if_reg = 0x04;
        cpu.step();
        assert!(!cpu.halted);
        assert_eq!(cpu.pc, 0x102);
        assert_eq!(cpu.memory.if_reg, 0x04);
    }

    #[test]
    fn test_halt_wakeup_dispatch_costs_extra_cycle() {
        let mut cpu = make_cpu();
        cpu.ime = true;
        cpu.memory.ie = 0x01;
        load(&mut cpu, &[0x76]);
        cpu.step();
        cpu.memory.if_reg = 0x01;
        assert_eq!(cpu.step(), 24);
        assert_eq!(cpu.pc, 0x40);
    }

    #[test]
    fn test_halt_bug_repeats_next_byte() {
        let mut cpu = make_cpu();
        cpu.memory.ie = 0x01;
        cpu.memory.if_reg = 0x01;
        // HALT; INC A; NOP
        load(&mut cpu, &[0x76, 0x3C, 0x00]);
        cpu.step();
        assert!(!cpu.halted);
        cpu.step();
        assert_eq!(cpu.pc, 0x101);
        cpu.step();
        assert_eq!(cpu.pc, 0x102);
        assert_eq!(cpu.a, 2);
        assert_eq!(cpu.memory.opcode_fetches, vec![0x100, 0x101, 0x101]);
    }

    #[test]
    fn test_undefined_opcode_locks() {
        let mut cpu = make_cpu();
        load(&mut cpu, &[0xD3, 0x3C]);
        cpu.step();
        assert!(cpu.locked);
        for _ in 0..4 {
            assert_eq!(cpu.step(), 4);
        }
        assert_eq!(cpu.pc, 0x101);
        assert_eq!(cpu.a, 0);
    }

    #[test]
    fn test_stop_and_wakeup() {
        let mut cpu = make_cpu();
        load(&mut cpu, &[0x10, 0x00, 0x3C]);
        cpu.step();
        assert!(cpu.stopped);
        assert_eq!(cpu.pc, 0x102);
        cpu.step();
        assert!(cpu.stopped);
        cpu.memory.if_reg = 0x10;
        cpu.step();
        assert!(!cpu.stopped);
        cpu.step();
        assert_eq!(cpu.a, 1);
    }

    #[test]
    fn test_stop_speed_switch_continues() {
        let mut cpu = make_cpu();
        cpu.memory.speed_switch = true;
        load(&mut cpu, &[0x10, 0x00]);
        cpu.step();
        assert!(!cpu.stopped);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut cpu = make_cpu();
        load(&mut cpu, &[0x3E, 0x12, 0xFB]);
        cpu.step();
        cpu.step();
        let state = cpu.state();
        let mut other = make_cpu();
        other.restore(&state);
        assert_eq!(other.registers(), cpu.registers());
        assert_eq!(other.state(), state);
        assert_eq!(state.regs.to_array()[2], 0x12);
    }
}
