use std::thread;
use std::time::Duration;

use color_eyre::eyre::Result;
use log::LevelFilter;
use simple_logger::SimpleLogger;

use pixvm::machine::{Machine, MemorySize};
use pixvm::screen::PixelGrid;
use pixvm::storage::MemoryStorage;

/// Blinks the whole panel forever; we run a handful of frames of it.
const PROGRAM: &str = "\
# full-panel blinker
EP 0
SETALL
WAIT 2
SETNONE
WAIT 2
LOOP
";

fn main() -> Result<()> {
    color_eyre::install()?; // rust error handling
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap(); // logging

    let mut screen = PixelGrid::new();
    let mut machine = Machine::new(MemorySize::B64, Box::new(MemoryStorage::new()));

    machine.load_program(PROGRAM, &mut screen)?;
    machine.start();

    for _ in 0..24 {
        machine.step(&mut screen);
        println!("{}", screen);
        thread::sleep(Duration::from_millis(100));
    }

    Ok(())
}
