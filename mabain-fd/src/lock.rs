//! The exclusive, OS-enforced writer lock (spec §4.10: "at most one writer per DB directory").
#[cfg(feature = "std")]
use std::fs::{File, OpenOptions};
#[cfg(feature = "std")]
use std::os::unix::io::AsRawFd;
#[cfg(feature = "std")]
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockError {
    /// Another writer already holds the lock on this directory.
    WriterExist,
    /// The marker file itself could not be opened.
    Open,
}

/// An exclusive, advisory lock over a single marker file in a DB directory.
///
/// Held for the lifetime of the writer process (or thread, for an in-process singleton); dropped
/// automatically on close or crash (the OS releases `flock`s when the owning descriptor closes).
#[cfg(feature = "std")]
pub struct WriterLock {
    file: File,
}

#[cfg(all(feature = "std", feature = "libc"))]
impl WriterLock {
    /// Acquire the writer lock on `marker`, creating the file if necessary.
    pub fn acquire(marker: &Path) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(marker)
            .map_err(|_| LockError::Open)?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            return Err(LockError::WriterExist);
        }

        Ok(WriterLock { file })
    }
}

#[cfg(all(feature = "std", feature = "libc"))]
impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

impl core::fmt::Display for LockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LockError::WriterExist => write!(f, "a writer already holds this database"),
            LockError::Open => write!(f, "failed to open the writer lock marker file"),
        }
    }
}
