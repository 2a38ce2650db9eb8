//! The single mmap'd header page: counters, segment high-water marks, the lock-free slot, the
//! exception slot, and the rc-root/queue indices (spec §3.1, §6).
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use memmap2::MmapRaw;

/// Offset value meaning "the writer is not mid-mutation on any edge" (spec §4.6).
pub const SENTINEL_OFFSET: u64 = u64::MAX;

pub const MAX_KEY_LENGTH: usize = 256;
pub const MAX_DATA_SIZE: usize = u16::MAX as usize;
pub const DATA_HEADER_SIZE: u64 = 4096;
pub const HEADER_PAGE_SIZE: usize = 4096;

/// `excep_updating_status` values (spec §4.10); `NONE` is the quiescent state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ExcepStatus {
    None = 0,
    AddEdge = 1,
    AddDataOff = 2,
    AddNode = 3,
    RemoveEdge = 4,
    ClearEdge = 5,
    RcNode = 6,
    RcData = 7,
    RcEdgeStr = 8,
}

impl ExcepStatus {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => ExcepStatus::None,
            1 => ExcepStatus::AddEdge,
            2 => ExcepStatus::AddDataOff,
            3 => ExcepStatus::AddNode,
            4 => ExcepStatus::RemoveEdge,
            5 => ExcepStatus::ClearEdge,
            6 => ExcepStatus::RcNode,
            7 => ExcepStatus::RcData,
            8 => ExcepStatus::RcEdgeStr,
            _ => return None,
        })
    }
}

/// Bit-exact header page, one OS page, living at the start of `_mabain_h`.
///
/// Every field past `version` is an atomic so that the single writer and any number of readers can
/// touch it without a lock; the ordering each accessor uses is documented at the call site, not
/// here, since the right ordering depends on what it is paired with (see [`crate::lockfree`]).
#[repr(C)]
pub struct HeaderPage {
    pub version: [AtomicU16; 4],

    pub count: AtomicU64,
    pub num_update: AtomicU64,

    pub m_index_offset: AtomicU64,
    pub m_data_offset: AtomicU64,
    pub pending_index_buff_size: AtomicU64,
    pub pending_data_buff_size: AtomicU64,

    pub entry_per_bucket: AtomicU32,
    pub eviction_bucket_index: AtomicU16,
    pub arena_mode: AtomicU16,

    pub num_writer: AtomicU32,
    pub num_reader: AtomicU32,

    /// Lock-free slot (spec §4.6).
    pub lf_counter: AtomicU32,
    pub lf_offset: AtomicU64,
    pub lf_offset_cache: [AtomicU64; 4],

    /// Exception slot (spec §4.10).
    pub excep_updating_status: AtomicU32,
    pub excep_offset: AtomicU64,
    pub excep_lf_offset: AtomicU64,
    pub excep_buff: [AtomicU8; 16],

    /// rc-root bookkeeping (spec §3.3, §4.9).
    pub rc_root_offset: AtomicU64,
    pub rc_m_index_off_pre: AtomicU64,
    pub rc_m_data_off_pre: AtomicU64,
    pub rc_count: AtomicU64,

    /// Shared command queue indices (spec §4.7).
    pub queue_index: AtomicU64,
    pub writer_index: AtomicU64,
}

impl HeaderPage {
    pub const CURRENT_VERSION: [u16; 4] = [1, 0, 0, 0];

    pub fn version(&self) -> [u16; 4] {
        [
            self.version[0].load(Ordering::Relaxed),
            self.version[1].load(Ordering::Relaxed),
            self.version[2].load(Ordering::Relaxed),
            self.version[3].load(Ordering::Relaxed),
        ]
    }

    pub fn set_version(&self, v: [u16; 4]) {
        for (slot, value) in self.version.iter().zip(v) {
            slot.store(value, Ordering::Relaxed);
        }
    }

    /// Zero every field as if freshly created, then stamp the version and the root layout (spec
    /// §4.10: "initialize the header page ... root allocated at fixed low offset").
    pub fn initialize(&self, root_offset: u64, root_size: u64) {
        self.set_version(Self::CURRENT_VERSION);
        self.count.store(0, Ordering::Relaxed);
        self.num_update.store(0, Ordering::Relaxed);
        self.m_index_offset.store(root_offset + root_size, Ordering::Relaxed);
        self.m_data_offset.store(DATA_HEADER_SIZE, Ordering::Relaxed);
        self.pending_index_buff_size.store(0, Ordering::Relaxed);
        self.pending_data_buff_size.store(0, Ordering::Relaxed);
        self.entry_per_bucket.store(0, Ordering::Relaxed);
        self.eviction_bucket_index.store(0, Ordering::Relaxed);
        self.num_writer.store(0, Ordering::Relaxed);
        self.num_reader.store(0, Ordering::Relaxed);

        self.lf_counter.store(0, Ordering::Relaxed);
        self.lf_offset.store(SENTINEL_OFFSET, Ordering::Relaxed);
        for slot in &self.lf_offset_cache {
            slot.store(SENTINEL_OFFSET, Ordering::Relaxed);
        }

        self.excep_updating_status.store(ExcepStatus::None as u32, Ordering::Relaxed);
        self.excep_offset.store(0, Ordering::Relaxed);
        self.excep_lf_offset.store(0, Ordering::Relaxed);
        for b in &self.excep_buff {
            b.store(0, Ordering::Relaxed);
        }

        self.rc_root_offset.store(0, Ordering::Relaxed);
        self.rc_m_index_off_pre.store(0, Ordering::Relaxed);
        self.rc_m_data_off_pre.store(0, Ordering::Relaxed);
        self.rc_count.store(0, Ordering::Relaxed);

        self.queue_index.store(0, Ordering::Relaxed);
        self.writer_index.store(0, Ordering::Relaxed);
    }

    pub fn excep_buff_snapshot(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (dst, src) in out.iter_mut().zip(&self.excep_buff) {
            *dst = src.load(Ordering::Acquire);
        }
        out
    }

    pub fn set_excep_buff(&self, bytes: &[u8]) {
        for (dst, &b) in self.excep_buff.iter().zip(bytes) {
            dst.store(b, Ordering::Relaxed);
        }
    }
}

/// Owns the mmap backing a [`HeaderPage`].
///
/// Mirrors the raw-pointer-into-a-kept-mapping pattern: `page` is derived from `map` and is only
/// valid as long as `map` stays mapped, which this struct guarantees by keeping both together.
pub struct Header {
    page: &'static HeaderPage,
    #[allow(dead_code)]
    map: MmapRaw,
}

impl Header {
    pub fn open<T: std::os::unix::io::AsRawFd>(fd: &T, len: usize) -> std::io::Result<Self> {
        let map = MmapRaw::map_raw(fd)?;
        assert!(map.len() >= len, "header file shorter than one header page");

        // Safety: `map` lives at least as long as `page` since both are owned by `self`, and the
        // page is laid out `#[repr(C)]` with only atomic/plain-integer fields, so any bit pattern
        // (including a freshly-zeroed file) is a valid value.
        let page = unsafe { &*(map.as_ptr() as *const HeaderPage) };
        Ok(Header { page, map })
    }

    pub fn page(&self) -> &HeaderPage {
        self.page
    }

    /// Like [`Header::page`] but keeps the field's actual `'static` lifetime in the return type,
    /// for a spawned thread that needs to hold the reference past the borrow that produced it.
    ///
    /// Sound only as long as the owning `Header` (and its `map`) outlives every thread holding the
    /// result; callers must join any such thread before dropping the `Header`, which is why
    /// [`crate::db::Db`] declares its writer thread field ahead of its `Header` field so normal
    /// drop order enforces this, not just its explicit `close`.
    pub fn page_static(&self) -> &'static HeaderPage {
        self.page
    }
}
