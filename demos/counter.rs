use color_eyre::eyre::Result;
use log::LevelFilter;
use simple_logger::SimpleLogger;

use pixvm::machine::{Machine, MemorySize};
use pixvm::screen::PixelGrid;
use pixvm::storage::FileStorage;

/// Counts its own runs in scratch cell 0, which survives process restarts
/// through the scratchpad file. Run it a few times and watch the number grow.
const PROGRAM: &str = "\
# increment the persistent run counter
SCRATCH_LOAD 0 20
STORE 21 1
ADD 20 21 20
SCRATCH_COPY 20 0
LOAD 20
";

fn main() -> Result<()> {
    color_eyre::install()?; // rust error handling
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap(); // logging

    let mut screen = PixelGrid::new();
    let mut machine = Machine::new(MemorySize::B64, Box::new(FileStorage::new("scratchpad.dat")));

    machine.load_program(PROGRAM, &mut screen)?;
    machine.run_to_halt(&mut screen);

    if let Some(error) = machine.error() {
        println!("halted with error: {}", error);
    } else {
        println!("this machine has now run {} time(s)", machine.scratch()[0]);
        println!("{}", screen);
    }

    Ok(())
}
