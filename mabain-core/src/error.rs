//! The error taxonomy of spec §7, as stable integer codes.

/// Every outcome an operation against a [`crate::Db`] can produce.
///
/// `NotExist` is deliberately part of this enum rather than folded into `Result`'s `Ok` side: it
/// is the natural "miss" outcome of `find*`, not a failure, but callers still need to distinguish
/// it from `InDict` and from a hard error. `TryAgain` is handled internally by bounded retry loops
/// (lock-free reader races, queue slot contention) before it would ever reach a caller; it is
/// surfaced here only because a caller-visible `add_async` can legitimately return it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum MBError {
    Success = 0,
    NoMemory,
    OutOfBound,
    InvalidArg,
    NotInitialized,
    NotExist,
    InDict,
    MmapFailed,
    NotAllowed,
    OpenFailure,
    WriteError,
    ReadError,
    TryAgain,
    WriterExist,
    DbClosed,
    RcSkipped,
    VersionMismatch,
    NoDb,
    /// Corruption detected during exception recovery: an `excep_updating_status` value outside
    /// the nine defined cases (spec §4.10).
    Corruption,
}

pub type MBResult<T> = Result<T, MBError>;

impl core::fmt::Display for MBError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            MBError::Success => "success",
            MBError::NoMemory => "allocator refused, segment max reached",
            MBError::OutOfBound => "key or value exceeds configured limits",
            MBError::InvalidArg => "invalid argument for this operation",
            MBError::NotInitialized => "operation on a never-opened or failed handle",
            MBError::NotExist => "key not present",
            MBError::InDict => "key already present",
            MBError::MmapFailed => "block map failure",
            MBError::NotAllowed => "operation not allowed for this handle's mode",
            MBError::OpenFailure => "failed to open database files",
            MBError::WriteError => "low-level write failure",
            MBError::ReadError => "low-level read failure",
            MBError::TryAgain => "retry protocol: lock-free race or busy queue slot",
            MBError::WriterExist => "a writer already holds this database",
            MBError::DbClosed => "operation after close",
            MBError::RcSkipped => "resource collection skipped: below threshold or shutting down",
            MBError::VersionMismatch => "header version incompatible with this build",
            MBError::NoDb => "directory exists but the database was never initialized",
            MBError::Corruption => "exception slot holds an unrecognized recovery status",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for MBError {}

impl From<mabain_mem::AllocError> for MBError {
    fn from(e: mabain_mem::AllocError) -> Self {
        match e {
            mabain_mem::AllocError::NoMemory => MBError::NoMemory,
            mabain_mem::AllocError::Mem(_) => MBError::MmapFailed,
        }
    }
}

impl From<mabain_fd::LockError> for MBError {
    fn from(e: mabain_fd::LockError) -> Self {
        match e {
            mabain_fd::LockError::WriterExist => MBError::WriterExist,
            mabain_fd::LockError::Open => MBError::OpenFailure,
        }
    }
}
