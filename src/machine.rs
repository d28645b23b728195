use std::collections::HashMap;
use std::fmt::Write as _;

use log::error;

use crate::machine::assemble::{AssembleError, Assembler};
use crate::screen::Screen;
use crate::storage::ScratchStorage;

pub mod assemble;

pub type Byte = u8; // 1 byte

/// Size of the scratchpad address space, independent of memory size
pub const SCRATCH_SIZE: usize = 8;

/// Legal memory sizes
///
/// Memory is shared between program bytes and data, and addresses travel in
/// single operand bytes, so 256 is the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySize {
    B32,
    B64,
    B128,
    B256,
}

impl MemorySize {
    pub fn bytes(self) -> usize {
        match self {
            MemorySize::B32 => 32,
            MemorySize::B64 => 64,
            MemorySize::B128 => 128,
            MemorySize::B256 => 256,
        }
    }
}

impl Default for MemorySize {
    fn default() -> Self {
        MemorySize::B64
    }
}

/// The whole mutable state of one virtual machine
///
/// Memory holds program bytes and data in a single address space; the
/// scratchpad is a separate 8-cell space that survives resets and, through
/// the storage port, process restarts. Hosts drive the machine by loading a
/// program and then calling [`Machine::step`] on a timer or a single-step
/// trigger.
pub struct Machine {
    pub(crate) memory: Vec<Byte>,
    pub(crate) scratch: [Byte; SCRATCH_SIZE],
    pub(crate) pc: usize,
    pub(crate) delay_remaining: Byte,
    pub(crate) delay_total: Byte,
    pub(crate) entry_point: usize,
    pub(crate) running: bool,
    pub(crate) error: Option<String>,
    pub(crate) addr_to_line: HashMap<usize, usize>,
    pub(crate) storage: Box<dyn ScratchStorage>,
}

impl Default for Machine {
    /// A 64-byte machine with ephemeral in-memory scratch storage
    fn default() -> Self {
        Self::new(
            MemorySize::default(),
            Box::new(crate::storage::MemoryStorage::new()),
        )
    }
}

impl Machine {
    /// Initializes a machine and loads the persisted scratchpad
    ///
    /// A storage failure leaves the scratchpad all-zero and is only logged;
    /// construction never fails.
    pub fn new(size: MemorySize, mut storage: Box<dyn ScratchStorage>) -> Self {
        let scratch = match storage.load() {
            Ok(image) => image,
            Err(e) => {
                error!("Error loading scratchpad: {}", e);
                [0; SCRATCH_SIZE]
            }
        };
        Self {
            memory: vec![0; size.bytes()],
            scratch,
            pc: 0,
            delay_remaining: 0,
            delay_total: 0,
            entry_point: 0,
            running: false,
            error: None,
            addr_to_line: HashMap::new(),
            storage,
        }
    }

    /// Assembles `source` directly into memory
    ///
    /// The machine is reset first (scratchpad excepted), so a failed load
    /// leaves it halted with [`Machine::error`] set and whatever partial
    /// image was already written; it cannot be resumed, only reloaded. On
    /// success the program counter sits at the entry point and the machine
    /// waits for [`Machine::start`].
    pub fn load_program<S: Screen>(
        &mut self,
        source: &str,
        screen: &mut S,
    ) -> Result<(), AssembleError> {
        self.reset(screen);
        match Assembler::assemble(self, source) {
            Ok(_) => {
                self.pc = self.entry_point;
                Ok(())
            }
            Err(e) => {
                self.error = Some(e.to_string());
                self.running = false;
                Err(e)
            }
        }
    }

    /// Returns the machine to its idle state
    ///
    /// Memory is zeroed, the screen cleared, the program counter parked on
    /// the entry point and the debug map dropped. The scratchpad is
    /// deliberately preserved.
    pub fn reset<S: Screen>(&mut self, screen: &mut S) {
        self.pc = self.entry_point;
        self.delay_remaining = 0;
        self.delay_total = 0;
        for byte in self.memory.iter_mut() {
            *byte = 0;
        }
        screen.clear_all();
        self.running = false;
        self.error = None;
        self.addr_to_line.clear();
    }

    /// Allows dispatch; the host still has to call [`Machine::step`]
    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Steps until the machine halts, cleanly or on an error
    ///
    /// A program that ends in LOOP never halts; hosts that load such
    /// programs must drive [`Machine::step`] themselves.
    pub fn run_to_halt<S: Screen>(&mut self, screen: &mut S) {
        self.start();
        while self.running {
            self.step(screen);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    pub fn memory(&self) -> &[Byte] {
        &self.memory
    }

    pub fn memory_size(&self) -> usize {
        self.memory.len()
    }

    pub fn scratch(&self) -> &[Byte; SCRATCH_SIZE] {
        &self.scratch
    }

    /// Source line that produced the instruction at `addr`, if any
    pub fn source_line(&self, addr: usize) -> Option<usize> {
        self.addr_to_line.get(&addr).copied()
    }

    /// The whole address-to-source-line debug map
    pub fn source_map(&self) -> &HashMap<usize, usize> {
        &self.addr_to_line
    }

    /// Progress through an active WAIT as `(elapsed, total)`, 1-based
    ///
    /// `None` when no wait is in flight.
    pub fn wait_progress(&self) -> Option<(Byte, Byte)> {
        if self.delay_remaining > 0 {
            Some((self.delay_total - self.delay_remaining + 1, self.delay_total))
        } else {
            None
        }
    }

    /// Renders memory as rows of eight bytes for host-side inspection
    pub fn dump_memory(&self) -> String {
        let mut out = String::new();
        for (i, row) in self.memory.chunks(8).enumerate() {
            write!(out, "{:02}:", i * 8).unwrap();
            for byte in row {
                write!(out, " {:02X}", byte).unwrap();
            }
            out.push('\n');
        }
        out
    }

    /// Saves the scratchpad through the storage port
    ///
    /// Persistence failures are logged and never halt the machine.
    pub(crate) fn persist_scratch(&mut self) {
        if let Err(e) = self.storage.save(&self.scratch) {
            error!("Error saving scratchpad: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::{NullScreen, Recorder};
    use crate::storage::MemoryStorage;

    #[test]
    fn test_construction_loads_persisted_scratch() {
        let storage = MemoryStorage::with_contents([7, 0, 0, 0, 0, 0, 0, 9]);
        let machine = Machine::new(MemorySize::B64, Box::new(storage));
        assert_eq!(machine.scratch(), &[7, 0, 0, 0, 0, 0, 0, 9]);
    }

    #[test]
    fn test_storage_failure_leaves_scratch_zeroed() {
        struct Broken;
        impl ScratchStorage for Broken {
            fn load(&mut self) -> color_eyre::eyre::Result<[Byte; SCRATCH_SIZE]> {
                color_eyre::eyre::bail!("no backing store")
            }
            fn save(&mut self, _: &[Byte; SCRATCH_SIZE]) -> color_eyre::eyre::Result<()> {
                color_eyre::eyre::bail!("no backing store")
            }
        }

        let machine = Machine::new(MemorySize::B64, Box::new(Broken));
        assert_eq!(machine.scratch(), &[0; SCRATCH_SIZE]);
    }

    #[test]
    fn test_memory_sizes() {
        for &(size, bytes) in &[
            (MemorySize::B32, 32),
            (MemorySize::B64, 64),
            (MemorySize::B128, 128),
            (MemorySize::B256, 256),
        ] {
            let machine = Machine::new(size, Box::new(MemoryStorage::new()));
            assert_eq!(machine.memory_size(), bytes);
        }
    }

    #[test]
    fn test_reset_preserves_scratch_and_clears_the_rest() {
        let mut machine = Machine::default();
        let mut screen = Recorder::default();

        machine.load_program("EP 10\nSTORE 0 255", &mut screen).unwrap();
        machine.start();
        machine.step(&mut NullScreen);
        machine.scratch[3] = 42;
        machine.error = Some("stale".to_string());

        machine.reset(&mut screen);

        assert_eq!(machine.memory(), &[0; 64][..]);
        assert_eq!(machine.pc(), 10);
        assert_eq!(machine.entry_point(), 10);
        assert!(!machine.is_running());
        assert_eq!(machine.error(), None);
        assert_eq!(machine.source_line(10), None);
        assert_eq!(machine.scratch()[3], 42);
        assert!(screen.clears >= 2); // load_program resets too
    }

    #[test]
    fn test_dump_memory_format() {
        let mut machine = Machine::new(MemorySize::B32, Box::new(MemoryStorage::new()));
        machine.memory[0] = 0xFF;
        machine.memory[9] = 0x0A;

        let dump = machine.dump_memory();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "00: FF 00 00 00 00 00 00 00");
        assert_eq!(lines[1], "08: 00 0A 00 00 00 00 00 00");
        assert_eq!(lines[3], "24: 00 00 00 00 00 00 00 00");
    }

    #[test]
    fn test_wait_progress_reporting() {
        let mut machine = Machine::default();
        let mut screen = NullScreen;

        machine.load_program("WAIT 3", &mut screen).unwrap();
        machine.start();
        assert_eq!(machine.wait_progress(), None);

        machine.step(&mut screen); // WAIT executes
        assert_eq!(machine.wait_progress(), Some((1, 3)));
        machine.step(&mut screen);
        assert_eq!(machine.wait_progress(), Some((2, 3)));
        machine.step(&mut screen);
        assert_eq!(machine.wait_progress(), Some((3, 3)));
        machine.step(&mut screen);
        assert_eq!(machine.wait_progress(), None);
    }

    #[test]
    fn test_start_stop() {
        let mut machine = Machine::default();
        assert!(!machine.is_running());
        machine.start();
        assert!(machine.is_running());
        machine.stop();
        assert!(!machine.is_running());
    }
}
