//! The writer-publishes / reader-verifies protocol over the header's lock-free slot (spec §4.6).
use crate::error::MBError;
use crate::header::{ExcepStatus, HeaderPage, SENTINEL_OFFSET};
use core::sync::atomic::Ordering;
use std::time::Duration;

/// Bounded retry budget for a reader's lock-free guard (spec §4.5.4: "a bounded number of times,
/// sleeping 10 ns between attempts").
const MAX_RETRIES: u32 = 1000;
const RETRY_SLEEP: Duration = Duration::from_nanos(10);

/// RAII guard around one writer-side edge mutation (spec §4.6 steps 1-8).
///
/// Construction stages the exception slot (steps 1-3); [`WriterGuard::publish`] performs the
/// mapped-memory write and the remaining steps. Dropping without calling `publish` is a logic
/// error in this crate (every call site publishes or the guard is never constructed), so it only
/// asserts in debug builds rather than trying to recover a sane state.
pub struct WriterGuard<'h> {
    header: &'h HeaderPage,
    edge_offset: u64,
    published: bool,
}

impl<'h> WriterGuard<'h> {
    /// Stage the pending mutation (steps 1-3).
    pub fn begin(header: &'h HeaderPage, status: ExcepStatus, excep_offset: u64, edge_offset: u64, buff: &[u8]) -> Self {
        header.set_excep_buff(buff);
        header.excep_offset.store(excep_offset, Ordering::Relaxed);
        header.excep_lf_offset.store(edge_offset, Ordering::Relaxed);
        header.excep_updating_status.store(status as u32, Ordering::Release);
        header.lf_offset.store(edge_offset, Ordering::Release);
        WriterGuard { header, edge_offset, published: false }
    }

    /// Steps 5-8, to be called once the caller has performed the actual write (step 4).
    pub fn publish(mut self) {
        let header = self.header;
        let counter = header.lf_counter.load(Ordering::Relaxed);
        header.lf_offset_cache[(counter % 4) as usize].store(self.edge_offset, Ordering::Release);
        header.lf_counter.store(counter.wrapping_add(1), Ordering::Release);
        header.lf_offset.store(SENTINEL_OFFSET, Ordering::Release);
        header.excep_updating_status.store(ExcepStatus::None as u32, Ordering::Release);
        self.published = true;
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        debug_assert!(self.published, "WriterGuard dropped without publish()");
    }
}

/// Outcome of a reader's guarded edge read.
pub enum ReadOutcome<T> {
    Ok(T),
    /// The writer was mid-mutation on exactly this edge; `T` is reconstructed from the exception
    /// buffer per `status` (spec §4.6 step 4). Callers should treat this as valid once received,
    /// never retry a saved edge further.
    Saved(T),
}

/// Snapshot taken before a reader touches a given edge offset.
pub struct ReaderGuard<'h> {
    header: &'h HeaderPage,
    counter0: u32,
}

impl<'h> ReaderGuard<'h> {
    pub fn snapshot(header: &'h HeaderPage) -> Self {
        ReaderGuard { header, counter0: header.lf_counter.load(Ordering::Acquire) }
    }

    /// Validate a read of `edge_off`, where `read` performs the actual mapped-memory read and
    /// `reconstruct` rebuilds the value from the exception buffer for the "saved edge" case.
    pub fn validate<T>(
        &self,
        edge_off: u64,
        read: impl Fn() -> T,
        reconstruct: impl Fn(ExcepStatus, [u8; 16]) -> T,
    ) -> Result<ReadOutcome<T>, MBError> {
        let header = self.header;
        let value = read();

        let offset = header.lf_offset.load(Ordering::Acquire);
        let counter1 = header.lf_counter.load(Ordering::Acquire);

        if offset == edge_off {
            let status = ExcepStatus::from_u32(header.excep_updating_status.load(Ordering::Acquire))
                .unwrap_or(ExcepStatus::None);
            let buff = header.excep_buff_snapshot();
            return Ok(ReadOutcome::Saved(reconstruct(status, buff)));
        }

        let delta = counter1.wrapping_sub(self.counter0);
        if delta == 0 {
            return Ok(ReadOutcome::Ok(value));
        }
        if delta >= 4 {
            return Err(MBError::TryAgain);
        }

        for i in 0..delta {
            let slot = (self.counter0.wrapping_add(i) % 4) as usize;
            if header.lf_offset_cache[slot].load(Ordering::Acquire) == edge_off {
                return Err(MBError::TryAgain);
            }
        }

        let counter2 = header.lf_counter.load(Ordering::Acquire);
        if counter2.wrapping_sub(self.counter0) >= 4 {
            return Err(MBError::TryAgain);
        }

        Ok(ReadOutcome::Ok(value))
    }
}

/// Run `body` until it stops returning `TryAgain`, up to [`MAX_RETRIES`], sleeping
/// [`RETRY_SLEEP`] between attempts (spec §4.5.4).
pub fn retry<T>(mut body: impl FnMut() -> Result<T, MBError>) -> Result<T, MBError> {
    for _ in 0..MAX_RETRIES {
        match body() {
            Err(MBError::TryAgain) => std::thread::sleep(RETRY_SLEEP),
            other => return other,
        }
    }
    Err(MBError::TryAgain)
}
