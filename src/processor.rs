use std::convert::TryFrom;

use log::{debug, warn};
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

use crate::machine::{Byte, Machine, SCRATCH_SIZE};
use crate::screen::{Screen, GRID_SIZE};

macro_rules! instructions {
    ( $( $( #[doc = $doc:expr] )+ $name:ident = $repr:literal , )+ ) => {
        /// The closed instruction set
        ///
        /// Variant names double as assembly mnemonics. A zero byte is not an
        /// instruction: the step engine treats it as a clean halt, which is
        /// what untouched memory reads as. The assembly-only `EP` directive
        /// has no opcode either; its historical slot (0x24) decodes as
        /// unknown.
        #[allow(non_camel_case_types)]
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        #[derive(TryFromPrimitive, IntoPrimitive)]
        pub enum Instruction {
            $(
                $( #[doc = $doc] )+
                $name = $repr,
            )+
        }

        impl Instruction {
            pub const ALL: &'static [Self] = &[
                $( Self::$name , )+
            ];

            pub fn name(&self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name) , )+
                }
            }
        }

        impl ::std::fmt::Display for Instruction {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self {
                    $( Self::$name => f.write_str(stringify!($name)) , )+
                }
            }
        }
    }
}

instructions! {
    /// Turn on each listed (x, y) pixel
    /// Operands: count byte, then two coordinate bytes per pair
    SET = 0x01,
    /// Turn off each listed (x, y) pixel
    CLEAR = 0x02,
    /// Suspend dispatch for N step calls
    WAIT = 0x03,
    /// Jump back to the entry point
    LOOP = 0x04,
    /// memory[addr] = value
    STORE = 0x05,
    /// Probe memory[addr]: pixel (0, 0) shows whether it is non-zero
    LOAD = 0x06,
    /// Jump to addr
    JUMP = 0x07,
    /// Jump to addr if memory[test] is non-zero
    JUMPIF = 0x08,
    /// memory[dst] = memory[a] + memory[b], wrapping
    ADD = 0x09,
    /// Turn every pixel on
    SETALL = 0x10,
    /// Turn every pixel off
    SETNONE = 0x11,
    /// scratch[cell] = value, persisted
    SCRATCH_STORE = 0x12,
    /// memory[addr] = scratch[cell]
    SCRATCH_LOAD = 0x13,
    /// scratch[dst] = scratch[a] + scratch[b], wrapping, persisted
    SCRATCH_ADD = 0x14,
    /// scratch[cell] = memory[addr], persisted
    SCRATCH_COPY = 0x15,
    /// Jump to addr if scratch[cell] is non-zero
    SCRATCH_JUMPIF = 0x16,
    /// memory[dst] = memory[a] & memory[b]
    AND = 0x17,
    /// memory[dst] = memory[a] | memory[b]
    OR = 0x18,
    /// memory[dst] = memory[a] ^ memory[b]
    XOR = 0x19,
    /// memory[dst] = !memory[a]
    NOT = 0x20,
    /// memory[dst] = memory[a] - memory[b], wrapping
    SUB = 0x21,
    /// memory[dst] = memory[a] << 1, high bit dropped
    SHL = 0x22,
    /// memory[dst] = memory[a] >> 1
    SHR = 0x23,
}

const ARGS_OUT_OF_RANGE: &str = "Instruction arguments out of range";

impl Machine {
    /// Executes exactly one clock tick
    ///
    /// Either consumes one pending WAIT cycle or dispatches the instruction
    /// at `pc`. Run-time faults halt the machine with [`Machine::error`] set
    /// and leave `pc` on the failing instruction; a zero opcode halts
    /// cleanly. Stepping is not gated on [`Machine::is_running`]; hosts
    /// check it between ticks.
    pub fn step<S: Screen>(&mut self, screen: &mut S) {
        if self.delay_remaining > 0 {
            self.delay_remaining -= 1;
            if self.delay_remaining == 0 {
                self.delay_total = 0;
            }
            return;
        }

        if self.pc >= self.memory.len() {
            self.fault("Program counter out of range");
            return;
        }

        let opcode = self.memory[self.pc];
        if opcode == 0x00 {
            debug!("halt at {}", self.pc);
            self.running = false;
            return;
        }

        let instruction = match Instruction::try_from(opcode) {
            Ok(instruction) => instruction,
            Err(_) => {
                self.fault(format!("Unknown opcode: {}", opcode));
                return;
            }
        };

        use Instruction::*;
        match instruction {
            SET => self.pixel_list(screen, true),
            CLEAR => self.pixel_list(screen, false),
            WAIT => {
                if !self.has_operands(1) {
                    return self.fault(ARGS_OUT_OF_RANGE);
                }
                let cycles = self.memory[self.pc + 1];
                self.delay_remaining = cycles;
                self.delay_total = cycles;
                self.pc += 2;

                debug!("WAIT {}", cycles);
            }
            LOOP => {
                self.pc = self.entry_point;

                debug!("LOOP -> {}", self.entry_point);
            }
            SETALL => {
                self.fill(screen, true);
                self.pc += 1;

                debug!("SETALL");
            }
            SETNONE => {
                self.fill(screen, false);
                self.pc += 1;

                debug!("SETNONE");
            }
            STORE => {
                if !self.has_operands(2) {
                    return self.fault(ARGS_OUT_OF_RANGE);
                }
                let addr = self.memory[self.pc + 1] as usize;
                let value = self.memory[self.pc + 2];
                if addr >= self.memory.len() {
                    return self.fault(format!("Invalid RAM address: {}", addr));
                }
                self.memory[addr] = value;
                self.pc += 3;

                debug!("STORE {} {}", addr, value);
            }
            LOAD => {
                if !self.has_operands(1) {
                    return self.fault(ARGS_OUT_OF_RANGE);
                }
                let addr = self.memory[self.pc + 1] as usize;
                if addr >= self.memory.len() {
                    return self.fault(format!("Invalid RAM address: {}", addr));
                }
                screen.set_pixel(0, 0, self.memory[addr] > 0);
                self.pc += 2;

                debug!("LOAD {}: {}", addr, self.memory[addr]);
            }
            JUMP => {
                if !self.has_operands(1) {
                    return self.fault(ARGS_OUT_OF_RANGE);
                }
                let addr = self.memory[self.pc + 1] as usize;
                if addr >= self.memory.len() {
                    return self.fault(format!("Invalid jump address: {}", addr));
                }
                self.pc = addr;

                debug!("JUMP {}", addr);
            }
            JUMPIF => {
                if !self.has_operands(2) {
                    return self.fault(ARGS_OUT_OF_RANGE);
                }
                let addr = self.memory[self.pc + 1] as usize;
                let test = self.memory[self.pc + 2] as usize;
                if addr >= self.memory.len() || test >= self.memory.len() {
                    return self.fault("Invalid jump address or RAM address");
                }
                let taken = self.memory[test] > 0;
                if taken {
                    self.pc = addr;
                } else {
                    self.pc += 3;
                }

                debug!("JUMPIF {} {}: {}", addr, test, taken);
            }
            ADD => self.alu2("ADD", |a, b| a.wrapping_add(b)),
            SUB => self.alu2("SUB", |a, b| a.wrapping_sub(b)),
            AND => self.alu2("AND", |a, b| a & b),
            OR => self.alu2("OR", |a, b| a | b),
            XOR => self.alu2("XOR", |a, b| a ^ b),
            NOT => self.alu1("NOT", |a| !a),
            SHL => self.alu1("SHL", |a| a << 1),
            SHR => self.alu1("SHR", |a| a >> 1),
            SCRATCH_STORE => {
                if !self.has_operands(2) {
                    return self.fault(ARGS_OUT_OF_RANGE);
                }
                let cell = self.memory[self.pc + 1] as usize;
                let value = self.memory[self.pc + 2];
                if cell >= SCRATCH_SIZE {
                    return self.fault(format!("Invalid scratchpad address: {}", cell));
                }
                self.scratch[cell] = value;
                self.persist_scratch();
                self.pc += 3;

                debug!("SCRATCH_STORE {} {}", cell, value);
            }
            SCRATCH_LOAD => {
                if !self.has_operands(2) {
                    return self.fault(ARGS_OUT_OF_RANGE);
                }
                let cell = self.memory[self.pc + 1] as usize;
                let addr = self.memory[self.pc + 2] as usize;
                if cell >= SCRATCH_SIZE || addr >= self.memory.len() {
                    return self.fault("Invalid scratchpad or RAM address");
                }
                self.memory[addr] = self.scratch[cell];
                self.pc += 3;

                debug!("SCRATCH_LOAD {} -> {}", cell, addr);
            }
            SCRATCH_ADD => {
                if !self.has_operands(3) {
                    return self.fault(ARGS_OUT_OF_RANGE);
                }
                let a = self.memory[self.pc + 1] as usize;
                let b = self.memory[self.pc + 2] as usize;
                let dst = self.memory[self.pc + 3] as usize;
                if a >= SCRATCH_SIZE || b >= SCRATCH_SIZE || dst >= SCRATCH_SIZE {
                    return self.fault("Invalid scratchpad address");
                }
                let result = self.scratch[a].wrapping_add(self.scratch[b]);
                self.scratch[dst] = result;
                self.persist_scratch();
                self.pc += 4;

                debug!("SCRATCH_ADD {} {} -> {}: {}", a, b, dst, result);
            }
            SCRATCH_COPY => {
                if !self.has_operands(2) {
                    return self.fault(ARGS_OUT_OF_RANGE);
                }
                let addr = self.memory[self.pc + 1] as usize;
                let cell = self.memory[self.pc + 2] as usize;
                if addr >= self.memory.len() || cell >= SCRATCH_SIZE {
                    return self.fault("Invalid RAM or scratchpad address");
                }
                self.scratch[cell] = self.memory[addr];
                self.persist_scratch();
                self.pc += 3;

                debug!("SCRATCH_COPY {} -> {}", addr, cell);
            }
            SCRATCH_JUMPIF => {
                if !self.has_operands(2) {
                    return self.fault(ARGS_OUT_OF_RANGE);
                }
                let addr = self.memory[self.pc + 1] as usize;
                let cell = self.memory[self.pc + 2] as usize;
                if addr >= self.memory.len() || cell >= SCRATCH_SIZE {
                    return self.fault("Invalid jump address or scratchpad address");
                }
                if self.scratch[cell] > 0 {
                    self.pc = addr;
                } else {
                    self.pc += 3;
                }

                debug!("SCRATCH_JUMPIF {} {}: {}", addr, cell, self.scratch[cell]);
            }
        }
    }

    /// Whether `count` operand bytes after the opcode lie within memory
    fn has_operands(&self, count: usize) -> bool {
        self.pc + count < self.memory.len()
    }

    /// Halts with a run-time diagnostic, leaving `pc` on the failing opcode
    fn fault<M: Into<String>>(&mut self, message: M) {
        let message = message.into();
        warn!("halted: {}", message);
        self.error = Some(message);
        self.running = false;
    }

    /// SET/CLEAR: apply each encoded pair, validating as it goes
    ///
    /// Pairs already applied stay applied when a later pair is invalid or
    /// truncated; the instruction then faults with `pc` unadvanced.
    fn pixel_list<S: Screen>(&mut self, screen: &mut S, on: bool) {
        let name = if on { "SET" } else { "CLEAR" };

        let mut cursor = self.pc + 1;
        if cursor >= self.memory.len() {
            return self.fault(format!("Missing count in {}", name));
        }
        let count = self.memory[cursor];
        cursor += 1;

        for _ in 0..count {
            if cursor + 1 >= self.memory.len() {
                return self.fault(format!("Incomplete pair in {}", name));
            }
            let x = self.memory[cursor];
            let y = self.memory[cursor + 1];
            if x as usize >= GRID_SIZE || y as usize >= GRID_SIZE {
                return self.fault(format!("Invalid {} coordinates ({}, {})", name, x, y));
            }
            screen.set_pixel(x, y, on);
            cursor += 2;
        }
        self.pc = cursor;

        debug!("{} {} pairs", name, count);
    }

    fn fill<S: Screen>(&mut self, screen: &mut S, on: bool) {
        for y in 0..GRID_SIZE as Byte {
            for x in 0..GRID_SIZE as Byte {
                screen.set_pixel(x, y, on);
            }
        }
    }

    /// Three-address memory ops: dst = f(a, b)
    fn alu2(&mut self, name: &str, f: impl Fn(Byte, Byte) -> Byte) {
        if !self.has_operands(3) {
            return self.fault(ARGS_OUT_OF_RANGE);
        }
        let a = self.memory[self.pc + 1] as usize;
        let b = self.memory[self.pc + 2] as usize;
        let dst = self.memory[self.pc + 3] as usize;
        if a >= self.memory.len() || b >= self.memory.len() || dst >= self.memory.len() {
            return self.fault("Invalid RAM address");
        }
        let result = f(self.memory[a], self.memory[b]);
        self.memory[dst] = result;
        self.pc += 4;

        debug!("{} {} {} -> {}: {}", name, a, b, dst, result);
    }

    /// Two-address memory ops: dst = f(a)
    fn alu1(&mut self, name: &str, f: impl Fn(Byte) -> Byte) {
        if !self.has_operands(2) {
            return self.fault(ARGS_OUT_OF_RANGE);
        }
        let a = self.memory[self.pc + 1] as usize;
        let dst = self.memory[self.pc + 2] as usize;
        if a >= self.memory.len() || dst >= self.memory.len() {
            return self.fault("Invalid RAM address");
        }
        let result = f(self.memory[a]);
        self.memory[dst] = result;
        self.pc += 3;

        debug!("{} {} -> {}: {}", name, a, dst, result);
    }
}
