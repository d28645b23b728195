//! Single-pass assembler
//!
//! ```text
//! # draw a diagonal, then idle
//! EP 0
//! SET 0 0,1 1,2 2
//! WAIT 10
//! LOOP
//! ```
//!
//! Lines are case-insensitive; `#` starts a comment. Each instruction is
//! encoded at the write cursor and the cursor's source line recorded in the
//! machine's debug map. `EP` moves the cursor instead of emitting bytes,
//! leaving a zero-initialized data segment below the entry point.

use std::error;
use std::fmt;

use log::debug;

use crate::machine::{Byte, Machine, MemorySize, SCRATCH_SIZE};
use crate::processor::Instruction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleErrorKind {
    UnknownCommand(String),
    MissingOperand,
    InvalidNumber(String),
    InvalidPair(String),
    PairsRequired(&'static str),
    AddressOutOfRange(i64),
    ScratchAddressOutOfRange(i64),
    EntryPointOutOfRange,
    NotEnoughRam,
}

impl fmt::Display for AssembleErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssembleErrorKind::UnknownCommand(cmd) => {
                write!(f, "Unknown command '{}'", cmd)
            }
            AssembleErrorKind::MissingOperand => f.write_str("Missing operand"),
            AssembleErrorKind::InvalidNumber(token) => {
                write!(f, "Invalid number '{}'", token)
            }
            AssembleErrorKind::InvalidPair(pair) => write!(f, "Invalid pair '{}'", pair),
            AssembleErrorKind::PairsRequired(name) => write!(f, "{} requires pairs", name),
            AssembleErrorKind::AddressOutOfRange(addr) => {
                write!(f, "Address {} out of range", addr)
            }
            AssembleErrorKind::ScratchAddressOutOfRange(addr) => {
                write!(f, "Scratchpad address {} out of range", addr)
            }
            AssembleErrorKind::EntryPointOutOfRange => f.write_str("Entry point out of range"),
            AssembleErrorKind::NotEnoughRam => f.write_str("Not enough RAM"),
        }
    }
}

/// A line-numbered assembly diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembleError {
    pub kind: AssembleErrorKind,
    pub line: usize,
}

impl AssembleError {
    fn new(kind: AssembleErrorKind, line: usize) -> Self {
        Self { kind, line }
    }
}

impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error on line {}: {}", self.line, self.kind)
    }
}

impl error::Error for AssembleError {}

pub type Result<T, E = AssembleError> = std::result::Result<T, E>;

/// Parses an integer token, accepting 0x/0o/0b radix prefixes
///
/// The caller upper-cases lines before tokenizing, so only upper-case
/// prefixes occur here. Negative numbers are decimal only.
fn parse_int(token: &str) -> Option<i64> {
    let (radix, digits) = match token.as_bytes() {
        [b'0', b'B', ..] => (2, &token[2..]),
        [b'0', b'O', ..] => (8, &token[2..]),
        [b'0', b'X', ..] => (16, &token[2..]),
        _ => (10, token),
    };
    i64::from_str_radix(digits, radix).ok()
}

/// Writes a program's byte image into a machine
///
/// Single forward pass; the first failing line aborts assembly, leaving any
/// bytes already emitted in place.
pub(crate) struct Assembler<'m> {
    machine: &'m mut Machine,
    cursor: usize,
}

impl<'m> Assembler<'m> {
    /// Assembles `source` into `machine`, returning the final cursor
    ///
    /// The caller is responsible for resetting the machine first and for
    /// moving `pc` to the entry point on success.
    pub(crate) fn assemble(machine: &'m mut Machine, source: &str) -> Result<usize> {
        let mut asm = Assembler { machine, cursor: 0 };
        for (index, raw) in source.lines().enumerate() {
            asm.assemble_line(index + 1, raw)?;
        }
        Ok(asm.cursor)
    }

    fn assemble_line(&mut self, line_nr: usize, raw: &str) -> Result<()> {
        let line = raw.trim().to_uppercase();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let cmd = tokens[0];

        if cmd == "EP" {
            return self.entry_point(line_nr, &tokens);
        }

        let instruction = *Instruction::ALL
            .iter()
            .find(|instruction| cmd == instruction.name())
            .ok_or_else(|| {
                AssembleError::new(AssembleErrorKind::UnknownCommand(cmd.to_string()), line_nr)
            })?;

        debug!("[{}] {} at {}", line_nr, instruction, self.cursor);
        self.machine.addr_to_line.insert(self.cursor, line_nr);

        use crate::processor::Instruction::*;
        match instruction {
            SET | CLEAR => self.pixel_list(line_nr, &tokens, instruction),
            WAIT => {
                self.require(line_nr, 2)?;
                let cycles = self.cycle_count(line_nr, &tokens, 1)?;
                self.put(&[WAIT as Byte, cycles]);
                Ok(())
            }
            LOOP | SETALL | SETNONE => {
                self.require(line_nr, 1)?;
                self.put(&[instruction as Byte]);
                Ok(())
            }
            STORE => {
                self.require(line_nr, 3)?;
                let addr = self.mem_address(line_nr, &tokens, 1)?;
                let value = self.value(line_nr, &tokens, 2)?;
                self.put(&[STORE as Byte, addr, value]);
                Ok(())
            }
            LOAD => {
                self.require(line_nr, 2)?;
                let addr = self.mem_address(line_nr, &tokens, 1)?;
                self.put(&[LOAD as Byte, addr]);
                Ok(())
            }
            JUMP => {
                self.require(line_nr, 2)?;
                let addr = self.mem_address(line_nr, &tokens, 1)?;
                self.put(&[JUMP as Byte, addr]);
                Ok(())
            }
            JUMPIF => {
                self.require(line_nr, 3)?;
                let addr = self.mem_address(line_nr, &tokens, 1)?;
                let test = self.mem_address(line_nr, &tokens, 2)?;
                self.put(&[JUMPIF as Byte, addr, test]);
                Ok(())
            }
            ADD | AND | OR | XOR | SUB => {
                self.require(line_nr, 4)?;
                let a = self.mem_address(line_nr, &tokens, 1)?;
                let b = self.mem_address(line_nr, &tokens, 2)?;
                let dst = self.mem_address(line_nr, &tokens, 3)?;
                self.put(&[instruction as Byte, a, b, dst]);
                Ok(())
            }
            NOT | SHL | SHR => {
                self.require(line_nr, 3)?;
                let a = self.mem_address(line_nr, &tokens, 1)?;
                let dst = self.mem_address(line_nr, &tokens, 2)?;
                self.put(&[instruction as Byte, a, dst]);
                Ok(())
            }
            SCRATCH_STORE => {
                self.require(line_nr, 3)?;
                let cell = self.scratch_address(line_nr, &tokens, 1)?;
                let value = self.value(line_nr, &tokens, 2)?;
                self.put(&[SCRATCH_STORE as Byte, cell, value]);
                Ok(())
            }
            SCRATCH_LOAD => {
                self.require(line_nr, 3)?;
                let cell = self.scratch_address(line_nr, &tokens, 1)?;
                let addr = self.mem_address(line_nr, &tokens, 2)?;
                self.put(&[SCRATCH_LOAD as Byte, cell, addr]);
                Ok(())
            }
            SCRATCH_ADD => {
                self.require(line_nr, 4)?;
                let a = self.scratch_address(line_nr, &tokens, 1)?;
                let b = self.scratch_address(line_nr, &tokens, 2)?;
                let dst = self.scratch_address(line_nr, &tokens, 3)?;
                self.put(&[SCRATCH_ADD as Byte, a, b, dst]);
                Ok(())
            }
            SCRATCH_COPY => {
                self.require(line_nr, 3)?;
                let addr = self.mem_address(line_nr, &tokens, 1)?;
                let cell = self.scratch_address(line_nr, &tokens, 2)?;
                self.put(&[SCRATCH_COPY as Byte, addr, cell]);
                Ok(())
            }
            SCRATCH_JUMPIF => {
                self.require(line_nr, 3)?;
                let addr = self.mem_address(line_nr, &tokens, 1)?;
                let cell = self.scratch_address(line_nr, &tokens, 2)?;
                self.put(&[SCRATCH_JUMPIF as Byte, addr, cell]);
                Ok(())
            }
        }
    }

    /// `EP <addr>`: relocate the write cursor and set the entry point
    ///
    /// Emits nothing; the bytes skipped over stay zero and serve as a data
    /// segment below the entry point.
    fn entry_point(&mut self, line_nr: usize, tokens: &[&str]) -> Result<()> {
        self.machine.addr_to_line.insert(self.cursor, line_nr);
        let addr = self.int_operand(line_nr, tokens, 1)?;
        if addr < 0 || addr as usize >= self.machine.memory.len() {
            return Err(AssembleError::new(
                AssembleErrorKind::EntryPointOutOfRange,
                line_nr,
            ));
        }
        debug!("[{}] EP {}", line_nr, addr);
        self.machine.entry_point = addr as usize;
        self.cursor = addr as usize;
        Ok(())
    }

    /// `SET`/`CLEAR`: encode opcode, pair count, then the pairs in order
    fn pixel_list(
        &mut self,
        line_nr: usize,
        tokens: &[&str],
        instruction: Instruction,
    ) -> Result<()> {
        let params = tokens[1..].join(" ");
        let mut pairs: Vec<(Byte, Byte)> = Vec::new();
        for pair in params.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            pairs.push(self.coordinate_pair(line_nr, pair)?);
        }
        if pairs.is_empty() {
            return Err(AssembleError::new(
                AssembleErrorKind::PairsRequired(instruction.name()),
                line_nr,
            ));
        }

        self.require(line_nr, 2 + 2 * pairs.len())?;
        self.put(&[instruction as Byte, pairs.len() as Byte]);
        for (x, y) in pairs {
            self.put(&[x, y]);
        }
        Ok(())
    }

    /// One "x y" pair; both halves must be byte-valued integers
    ///
    /// The 0..4 coordinate range is enforced at execution time, not here.
    fn coordinate_pair(&self, line_nr: usize, pair: &str) -> Result<(Byte, Byte)> {
        let invalid =
            || AssembleError::new(AssembleErrorKind::InvalidPair(pair.to_string()), line_nr);

        let halves: Vec<&str> = pair.split_whitespace().collect();
        if halves.len() != 2 {
            return Err(invalid());
        }
        let x = parse_int(halves[0]).ok_or_else(invalid)?;
        let y = parse_int(halves[1]).ok_or_else(invalid)?;
        if !(0..=255).contains(&x) || !(0..=255).contains(&y) {
            return Err(invalid());
        }
        Ok((x as Byte, y as Byte))
    }

    /// Fails with "Not enough RAM" if `bytes` more would overrun memory
    fn require(&self, line_nr: usize, bytes: usize) -> Result<()> {
        if self.cursor + bytes > self.machine.memory.len() {
            Err(AssembleError::new(AssembleErrorKind::NotEnoughRam, line_nr))
        } else {
            Ok(())
        }
    }

    /// Writes bytes at the cursor; bounds must already be established
    fn put(&mut self, bytes: &[Byte]) {
        self.machine.memory[self.cursor..self.cursor + bytes.len()].copy_from_slice(bytes);
        self.cursor += bytes.len();
    }

    fn int_operand(&self, line_nr: usize, tokens: &[&str], index: usize) -> Result<i64> {
        let token = tokens
            .get(index)
            .ok_or_else(|| AssembleError::new(AssembleErrorKind::MissingOperand, line_nr))?;
        parse_int(token).ok_or_else(|| {
            AssembleError::new(AssembleErrorKind::InvalidNumber(token.to_string()), line_nr)
        })
    }

    /// A memory address operand; validated against memory size, never masked
    fn mem_address(&self, line_nr: usize, tokens: &[&str], index: usize) -> Result<Byte> {
        let addr = self.int_operand(line_nr, tokens, index)?;
        if addr < 0 || addr as usize >= self.machine.memory.len() {
            return Err(AssembleError::new(
                AssembleErrorKind::AddressOutOfRange(addr),
                line_nr,
            ));
        }
        Ok(addr as Byte)
    }

    /// A scratchpad cell operand; the fixed 0..8 space
    fn scratch_address(&self, line_nr: usize, tokens: &[&str], index: usize) -> Result<Byte> {
        let cell = self.int_operand(line_nr, tokens, index)?;
        if cell < 0 || cell as usize >= SCRATCH_SIZE {
            return Err(AssembleError::new(
                AssembleErrorKind::ScratchAddressOutOfRange(cell),
                line_nr,
            ));
        }
        Ok(cell as Byte)
    }

    /// A value operand; any integer, reduced modulo 256
    fn value(&self, line_nr: usize, tokens: &[&str], index: usize) -> Result<Byte> {
        let value = self.int_operand(line_nr, tokens, index)?;
        Ok((value & 0xFF) as Byte)
    }

    /// A WAIT cycle count; must itself fit a byte, no masking
    fn cycle_count(&self, line_nr: usize, tokens: &[&str], index: usize) -> Result<Byte> {
        let token = tokens
            .get(index)
            .ok_or_else(|| AssembleError::new(AssembleErrorKind::MissingOperand, line_nr))?;
        let cycles = parse_int(token).filter(|c| (0..=255).contains(c)).ok_or_else(|| {
            AssembleError::new(AssembleErrorKind::InvalidNumber(token.to_string()), line_nr)
        })?;
        Ok(cycles as Byte)
    }
}

/// Measures the byte footprint of a program without touching a live machine
///
/// Reports the final write-cursor position, so an `EP` that relocates the
/// cursor counts the skipped data segment too. Useful for byte-counter style
/// host UI.
pub fn measure(source: &str, size: MemorySize) -> Result<usize> {
    let mut machine = Machine::new(size, Box::new(crate::storage::MemoryStorage::new()));
    Assembler::assemble(&mut machine, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::NullScreen;

    fn load(source: &str) -> Machine {
        let mut machine = Machine::default();
        machine.load_program(source, &mut NullScreen).unwrap();
        machine
    }

    fn load_err(source: &str) -> (Machine, AssembleError) {
        let mut machine = Machine::default();
        let err = machine
            .load_program(source, &mut NullScreen)
            .expect_err("program should not assemble");
        (machine, err)
    }

    #[test]
    fn test_set_encoding() {
        let machine = load("SET 0 0,1 1");
        assert_eq!(&machine.memory()[..6], &[0x01, 2, 0, 0, 1, 1]);
        assert_eq!(machine.memory()[6], 0);
    }

    #[test]
    fn test_clear_encoding_preserves_pair_order() {
        let machine = load("CLEAR 3 1,0 2,2 0");
        assert_eq!(&machine.memory()[..8], &[0x02, 3, 3, 1, 0, 2, 2, 0]);
    }

    #[test]
    fn test_fixed_op_encodings() {
        let machine = load("STORE 10 255\nLOAD 10\nADD 10 10 11\nLOOP");
        assert_eq!(
            &machine.memory()[..10],
            &[0x05, 10, 255, 0x06, 10, 0x09, 10, 10, 11, 0x04]
        );
    }

    #[test]
    fn test_scratch_op_encodings() {
        let machine = load("SCRATCH_STORE 2 100\nSCRATCH_COPY 10 2\nSCRATCH_JUMPIF 0 2");
        assert_eq!(
            &machine.memory()[..9],
            &[0x12, 2, 100, 0x15, 10, 2, 0x16, 0, 2]
        );
    }

    #[test]
    fn test_mnemonics_are_case_insensitive() {
        let machine = load("store 10 1\nSeTaLl");
        assert_eq!(&machine.memory()[..4], &[0x05, 10, 1, 0x10]);
    }

    #[test]
    fn test_comments_and_blank_lines_are_skipped() {
        let machine = load("# header\n\n  \nSETALL\n# trailing");
        assert_eq!(machine.memory()[0], 0x10);
        assert_eq!(machine.source_line(0), Some(4));
    }

    #[test]
    fn test_radix_prefixed_literals() {
        let machine = load("STORE 0x0A 0b1010\nSTORE 0o12 12");
        assert_eq!(&machine.memory()[..6], &[0x05, 10, 10, 0x05, 10, 12]);
    }

    #[test]
    fn test_values_are_masked_modulo_256() {
        let machine = load("STORE 10 300\nSTORE 11 -5\nSCRATCH_STORE 0 256");
        assert_eq!(machine.memory()[2], 44); // 300 & 0xFF
        assert_eq!(machine.memory()[5], 251); // -5 & 0xFF
        assert_eq!(machine.memory()[8], 0);
    }

    #[test]
    fn test_entry_point_relocates_cursor() {
        let machine = load("EP 10\nSETALL");
        assert_eq!(machine.entry_point(), 10);
        assert_eq!(machine.pc(), 10);
        // the pre-entry segment stays zero-initialized
        assert_eq!(&machine.memory()[..10], &[0; 10]);
        assert_eq!(machine.memory()[10], 0x10);
        assert_eq!(machine.source_line(10), Some(2));
    }

    #[test]
    fn test_debug_map_records_each_instruction() {
        let machine = load("STORE 0 1\nSETALL\nLOOP");
        assert_eq!(machine.source_line(0), Some(1));
        assert_eq!(machine.source_line(3), Some(2));
        assert_eq!(machine.source_line(4), Some(3));
        assert_eq!(machine.source_line(1), None);
    }

    #[test]
    fn test_unknown_command() {
        let (machine, err) = load_err("SETALL\nFROB 1 2");
        assert_eq!(err.to_string(), "Error on line 2: Unknown command 'FROB'");
        assert_eq!(machine.error(), Some("Error on line 2: Unknown command 'FROB'"));
        assert!(!machine.is_running());
        // the first line was already emitted and is not rolled back
        assert_eq!(machine.memory()[0], 0x10);
    }

    #[test]
    fn test_missing_operand() {
        let (_, err) = load_err("STORE 10");
        assert_eq!(err.to_string(), "Error on line 1: Missing operand");
    }

    #[test]
    fn test_invalid_number() {
        let (_, err) = load_err("JUMP banana");
        assert_eq!(err.to_string(), "Error on line 1: Invalid number 'BANANA'");
    }

    #[test]
    fn test_invalid_pair() {
        let (_, err) = load_err("SET 0 0,7");
        assert_eq!(err.to_string(), "Error on line 1: Invalid pair '7'");

        let (_, err) = load_err("SET 1 2 3");
        assert_eq!(err.to_string(), "Error on line 1: Invalid pair '1 2 3'");
    }

    #[test]
    fn test_pairs_required() {
        let (_, err) = load_err("SET");
        assert_eq!(err.to_string(), "Error on line 1: SET requires pairs");

        let (_, err) = load_err("CLEAR ,");
        assert_eq!(err.to_string(), "Error on line 1: CLEAR requires pairs");
    }

    #[test]
    fn test_address_out_of_range() {
        let (_, err) = load_err("STORE 64 1");
        assert_eq!(err.to_string(), "Error on line 1: Address 64 out of range");

        let (_, err) = load_err("SCRATCH_STORE 8 1");
        assert_eq!(
            err.to_string(),
            "Error on line 1: Scratchpad address 8 out of range"
        );

        let (_, err) = load_err("EP 64");
        assert_eq!(err.to_string(), "Error on line 1: Entry point out of range");
    }

    #[test]
    fn test_not_enough_ram() {
        // 64 one-byte instructions fill a 64-byte machine; the 65th overruns
        let source = vec!["SETALL"; 65].join("\n");
        let (machine, err) = load_err(&source);
        assert_eq!(err.to_string(), "Error on line 65: Not enough RAM");
        assert!(!machine.is_running());

        let (_, err) = load_err("EP 62\nADD 0 1 2");
        assert_eq!(err.to_string(), "Error on line 2: Not enough RAM");
    }

    #[test]
    fn test_wait_cycles_must_fit_a_byte() {
        let (_, err) = load_err("WAIT 300");
        assert_eq!(err.to_string(), "Error on line 1: Invalid number '300'");

        let machine = load("WAIT 255");
        assert_eq!(&machine.memory()[..2], &[0x03, 255]);
    }

    #[test]
    fn test_extra_operands_are_ignored() {
        let machine = load("LOOP 5\nSETALL 9 9");
        assert_eq!(&machine.memory()[..2], &[0x04, 0x10]);
    }

    #[test]
    fn test_reassembly_preserves_scratch() {
        let mut machine = Machine::default();
        let mut screen = NullScreen;

        machine
            .load_program("SCRATCH_STORE 2 100", &mut screen)
            .unwrap();
        machine.start();
        machine.step(&mut screen);
        assert_eq!(machine.scratch()[2], 100);

        machine.load_program("SETALL", &mut screen).unwrap();
        assert_eq!(machine.scratch()[2], 100);
        assert_eq!(machine.memory()[0], 0x10);
        assert_eq!(machine.memory()[1], 0);
        assert_eq!(machine.pc(), 0);
        assert_eq!(machine.error(), None);
        assert_eq!(machine.source_line(0), Some(1));
        assert_eq!(machine.source_line(3), None);
    }

    #[test]
    fn test_measure() {
        assert_eq!(measure("STORE 10 1\nLOOP", MemorySize::B64).unwrap(), 4);
        assert_eq!(measure("EP 50\nSETALL", MemorySize::B64).unwrap(), 51);
        assert_eq!(measure("", MemorySize::B64).unwrap(), 0);

        let err = measure("SPIN", MemorySize::B64).unwrap_err();
        assert_eq!(err.to_string(), "Error on line 1: Unknown command 'SPIN'");
    }
}
