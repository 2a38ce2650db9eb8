//! A POSIX FIFO used to wake the writer thread when a command lands in the shared queue (spec
//! §4.7: "Polls on the named pipe with a 1 ms timeout").
#[cfg(all(feature = "std", feature = "libc"))]
use std::fs::{File, OpenOptions};
#[cfg(all(feature = "std", feature = "libc"))]
use std::io::{Read, Write};
#[cfg(all(feature = "std", feature = "libc"))]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(all(feature = "std", feature = "libc"))]
use std::os::unix::io::AsRawFd;
#[cfg(all(feature = "std", feature = "libc"))]
use std::path::Path;
#[cfg(all(feature = "std", feature = "libc"))]
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeError;

impl core::fmt::Display for PipeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "failed to create or open the writer wake-up pipe")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PipeError {}

/// One end of the named pipe at a fixed path, created on demand.
#[cfg(all(feature = "std", feature = "libc"))]
pub struct NamedPipe {
    file: File,
}

#[cfg(all(feature = "std", feature = "libc"))]
impl NamedPipe {
    /// Create the FIFO special file at `path` if it doesn't already exist.
    pub fn create(path: &Path) -> Result<(), PipeError> {
        let bytes = path.as_os_str().as_encoded_bytes();
        let c_path = std::ffi::CString::new(bytes).map_err(|_| PipeError)?;
        let ret = unsafe { libc::mkfifo(c_path.as_ptr().cast(), 0o600) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(PipeError);
            }
        }
        Ok(())
    }

    /// Open the read end, non-blocking, for the writer thread's poll loop.
    pub fn open_reader(path: &Path) -> Result<Self, PipeError> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|_| PipeError)?;
        Ok(NamedPipe { file })
    }

    /// Open the write end, non-blocking, for command-queue producers.
    pub fn open_writer(path: &Path) -> Result<Self, PipeError> {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|_| PipeError)?;
        Ok(NamedPipe { file })
    }

    /// Wake up anyone polling the read end. A full pipe (writer not draining fast enough) is not
    /// an error: the writer will still observe the queued command on its next poll.
    pub fn signal(&mut self) {
        let _ = self.file.write(&[1u8]);
    }

    /// Block for up to `timeout` waiting for a signal, then drain whatever is buffered so the
    /// next `poll` starts from empty. Returns whether a signal was observed.
    pub fn poll(&mut self, timeout: Duration) -> bool {
        let fd = self.file.as_raw_fd();
        let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ret <= 0 {
            return false;
        }
        let mut buf = [0u8; 64];
        while matches!(self.file.read(&mut buf), Ok(n) if n > 0) {}
        true
    }
}
