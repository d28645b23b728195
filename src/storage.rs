use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use color_eyre::eyre::{bail, Result, WrapErr};

use crate::machine::{Byte, SCRATCH_SIZE};

/// Durable home of the 8-byte scratchpad
///
/// The machine loads through this port once at construction and saves after
/// every scratch-mutating instruction. Failures on either path are reported
/// to the log and never halt the machine; a failed load leaves the scratchpad
/// all-zero.
pub trait ScratchStorage {
    /// Reads the whole persisted image
    fn load(&mut self) -> Result<[Byte; SCRATCH_SIZE]>;

    /// Writes the whole image
    fn save(&mut self, scratch: &[Byte; SCRATCH_SIZE]) -> Result<()>;
}

/// Scratchpad persisted as 8 raw bytes in a file
///
/// A missing file reads as a fresh all-zero image; a file of any other length
/// is treated as corrupt.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl ScratchStorage for FileStorage {
    fn load(&mut self) -> Result<[Byte; SCRATCH_SIZE]> {
        if !self.path.exists() {
            return Ok([0; SCRATCH_SIZE]);
        }
        let bytes = fs::read(&self.path)
            .wrap_err_with(|| format!("failed to read {}", self.path.display()))?;
        if bytes.len() != SCRATCH_SIZE {
            bail!(
                "{} holds {} bytes, expected {}",
                self.path.display(),
                bytes.len(),
                SCRATCH_SIZE
            );
        }
        let mut scratch = [0; SCRATCH_SIZE];
        scratch.copy_from_slice(&bytes);
        Ok(scratch)
    }

    fn save(&mut self, scratch: &[Byte; SCRATCH_SIZE]) -> Result<()> {
        fs::write(&self.path, scratch)
            .wrap_err_with(|| format!("failed to write {}", self.path.display()))
    }
}

/// In-memory storage, for tests and ephemeral machines
///
/// Clones share the same backing cell, so a test can keep a handle and
/// observe what the machine persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Rc<RefCell<Option<[Byte; SCRATCH_SIZE]>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-seeded with a persisted image
    pub fn with_contents(scratch: [Byte; SCRATCH_SIZE]) -> Self {
        Self {
            data: Rc::new(RefCell::new(Some(scratch))),
        }
    }

    /// The last image saved, if any
    pub fn contents(&self) -> Option<[Byte; SCRATCH_SIZE]> {
        *self.data.borrow()
    }
}

impl ScratchStorage for MemoryStorage {
    fn load(&mut self) -> Result<[Byte; SCRATCH_SIZE]> {
        Ok(self.data.borrow().unwrap_or([0; SCRATCH_SIZE]))
    }

    fn save(&mut self, scratch: &[Byte; SCRATCH_SIZE]) -> Result<()> {
        *self.data.borrow_mut() = Some(*scratch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pixvm-scratch-{}-{}", tag, process::id()))
    }

    #[test]
    fn test_file_roundtrip() -> Result<()> {
        let path = temp_path("roundtrip");
        let mut storage = FileStorage::new(&path);

        let image = [1, 2, 3, 4, 5, 6, 7, 255];
        storage.save(&image)?;
        assert_eq!(storage.load()?, image);

        fs::remove_file(&path).ok();
        Ok(())
    }

    #[test]
    fn test_missing_file_reads_as_zero() -> Result<()> {
        let mut storage = FileStorage::new(temp_path("missing"));
        assert_eq!(storage.load()?, [0; SCRATCH_SIZE]);
        Ok(())
    }

    #[test]
    fn test_wrong_length_is_corrupt() {
        let path = temp_path("corrupt");
        fs::write(&path, b"too short").unwrap();

        let mut storage = FileStorage::new(&path);
        assert!(storage.load().is_err());

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_memory_storage_shares_backing_cell() -> Result<()> {
        let handle = MemoryStorage::new();
        let mut storage = handle.clone();

        assert_eq!(handle.contents(), None);
        assert_eq!(storage.load()?, [0; SCRATCH_SIZE]);

        storage.save(&[9; SCRATCH_SIZE])?;
        assert_eq!(handle.contents(), Some([9; SCRATCH_SIZE]));
        assert_eq!(storage.load()?, [9; SCRATCH_SIZE]);
        Ok(())
    }
}
