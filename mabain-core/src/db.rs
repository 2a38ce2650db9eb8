//! The public handle (spec §5, §6): opens a database directory, wires up the index/data segments,
//! the header page, the writer lock or shared command queue, and dispatches every external
//! operation onto the lower layers.
use crate::dict::Dict;
use crate::error::{MBError, MBResult};
use crate::header::{Header, HeaderPage, HEADER_PAGE_SIZE};
use crate::iter::Traversal;
use crate::queue::{Command, CommandType, QueueFile};
use crate::rc::{self, RcThresholds};
use crate::search::SearchEngine;
use crate::trie::{DictMem, ROOT_SIZE};
use crate::writer::{AsyncWriter, SharedDict, WriterContext};
use mabain_fd::{NamedPipe, WriterLock};
use mabain_mem::{AnyAllocator, ArenaAllocator, BlockPool, BlockPoolOptions, FreeListAllocator};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

const HEADER_FILE: &str = "_mabain_h";
const INDEX_PREFIX: &str = "_mabain_i";
const DATA_PREFIX: &str = "_mabain_d";
const LOCK_FILE: &str = "_mabain_wl";
const QUEUE_FILE: &str = "_mabain_q";
const PIPE_FILE: &str = "_mabain_p";
const INDEX_FREE_LIST_FILE: &str = "_mabain_fli";
const DATA_FREE_LIST_FILE: &str = "_mabain_fld";
const FILE_PREFIXES: &[&str] = &[HEADER_FILE, INDEX_PREFIX, DATA_PREFIX, INDEX_FREE_LIST_FILE, DATA_FREE_LIST_FILE];

/// Open-time configuration (spec §6's `open(dir, options, memcap_index, memcap_data, id,
/// queue_size)`; `id`/`queue_size` are kept as separate `Db::open` arguments rather than fields
/// here since they name a specific opening, not a property of the database itself).
pub struct DbOptions {
    /// This handle holds the exclusive writer role for the directory.
    pub writer: bool,
    /// Arena (bump, reclaim only via resource collection) vs. free-list segment allocation (spec
    /// §4.2, §9). Fixed for the database's lifetime; a reopen with a mismatched value is rejected.
    pub arena_mode: bool,
    /// Block size backing both `BlockPool`s; must be a multiple of the OS page size.
    pub block_size: u64,
    /// Free-list alignment for the index segment. Edges are a fixed 13 bytes, so 1 is natural.
    pub index_alignment: usize,
    /// Free-list alignment for the data segment.
    pub data_alignment: usize,
    /// Cap on how many freed offsets a single free-list size class keeps before discarding slack.
    pub max_per_free_class: usize,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            writer: false,
            arena_mode: false,
            block_size: 1 << 22,
            index_alignment: 8,
            data_alignment: 1,
            max_per_free_class: 4096,
        }
    }
}

/// Parameters needed to rebuild a fresh pair of allocators over the same block files, used both
/// at open time and whenever a resource collection pass re-roots the live `Dict` (spec §4.9).
#[derive(Clone)]
pub(crate) struct BlockLayout {
    pub dir: PathBuf,
    pub block_size: u64,
    pub index_blocks: u32,
    pub data_blocks: u32,
    pub arena_mode: bool,
    pub index_alignment: usize,
    pub data_alignment: usize,
    pub max_per_free_class: usize,
}

fn blocks_for(memcap: u64, block_size: u64) -> u32 {
    let blocks = (memcap + block_size - 1) / block_size.max(1);
    blocks.clamp(1, u32::MAX as u64) as u32
}

fn open_pool(dir: &Path, prefix: &'static str, block_size: u64, max_blocks: u32, writable: bool) -> MBResult<BlockPool> {
    BlockPool::open(BlockPoolOptions { dir: dir.to_path_buf(), prefix, block_size, max_blocks, writable })
        .map_err(|_| MBError::MmapFailed)
}

/// Build a fresh `(index, data)` allocator pair over the existing block files.
///
/// `persist_free_list` controls whether a saved free list is loaded from disk (the ordinary reopen
/// path) or a deliberately empty one is used (right after a resource collection pass, where any
/// previously saved free list describes offsets from the abandoned region).
pub(crate) fn build_allocators(
    layout: &BlockLayout,
    index_high: u64,
    data_high: u64,
    persist_free_list: bool,
    writable: bool,
) -> MBResult<(AnyAllocator, AnyAllocator)> {
    let index_pool = open_pool(&layout.dir, INDEX_PREFIX, layout.block_size, layout.index_blocks, writable)?;
    let data_pool = open_pool(&layout.dir, DATA_PREFIX, layout.block_size, layout.data_blocks, writable)?;

    let index = if layout.arena_mode {
        AnyAllocator::Arena(ArenaAllocator::new(index_pool, index_high))
    } else if persist_free_list {
        AnyAllocator::FreeList(
            FreeListAllocator::load(
                index_pool,
                layout.index_alignment,
                layout.max_per_free_class,
                index_high,
                &layout.dir.join(INDEX_FREE_LIST_FILE),
            )
            .map_err(|_| MBError::OpenFailure)?,
        )
    } else {
        AnyAllocator::FreeList(FreeListAllocator::new(index_pool, layout.index_alignment, layout.max_per_free_class, index_high))
    };

    let data = if layout.arena_mode {
        AnyAllocator::Arena(ArenaAllocator::new(data_pool, data_high))
    } else if persist_free_list {
        AnyAllocator::FreeList(
            FreeListAllocator::load(
                data_pool,
                layout.data_alignment,
                layout.max_per_free_class,
                data_high,
                &layout.dir.join(DATA_FREE_LIST_FILE),
            )
            .map_err(|_| MBError::OpenFailure)?,
        )
    } else {
        AnyAllocator::FreeList(FreeListAllocator::new(data_pool, layout.data_alignment, layout.max_per_free_class, data_high))
    };

    Ok((index, data))
}

/// Run one resource collection pass and re-root the live `Dict` at the result (spec §4.9).
///
/// `rc::collect` only publishes the new state into the header page; it does not know about a
/// process's already-open, in-memory `Dict`, whose cached allocator high-water marks and trie root
/// would otherwise go stale the instant the swap lands. This re-opens fresh allocators at the
/// published high-water marks and replaces `*dict.lock()` with a `Dict` rooted at the new offset.
pub(crate) fn perform_collect(
    dict: &SharedDict,
    header: &HeaderPage,
    dir: &Path,
    layout: &BlockLayout,
    thresholds: &RcThresholds,
) -> MBResult<()> {
    let index_high = header.m_index_offset.load(Ordering::Relaxed);
    let data_high = header.m_data_offset.load(Ordering::Relaxed);
    let (new_index, new_data) = build_allocators(layout, index_high, data_high, false, true)?;

    let new_root = {
        let mut guard = dict.lock().unwrap();
        rc::collect(header, &mut *guard, new_index, new_data, thresholds)?
    };

    let published_index_high = header.m_index_offset.load(Ordering::Relaxed);
    let published_data_high = header.m_data_offset.load(Ordering::Relaxed);
    let (live_index, live_data) = build_allocators(layout, published_index_high, published_data_high, false, true)?;
    live_index.save_free_list(&dir.join(INDEX_FREE_LIST_FILE)).map_err(|_| MBError::WriteError)?;
    live_data.save_free_list(&dir.join(DATA_FREE_LIST_FILE)).map_err(|_| MBError::WriteError)?;

    let trie = DictMem::new(live_index, new_root);
    let rebuilt = Dict::new(trie, live_data);
    *dict.lock().unwrap() = rebuilt;
    #[cfg(feature = "tracing")]
    tracing::info!(new_root, index_high = published_index_high, data_high = published_data_high, "resource collection published");
    Ok(())
}

pub(crate) fn copy_db_files(src_dir: &Path, dst_dir: &Path) -> MBResult<()> {
    std::fs::create_dir_all(dst_dir).map_err(|_| MBError::OpenFailure)?;
    let entries = std::fs::read_dir(src_dir).map_err(|_| MBError::OpenFailure)?;
    for entry in entries {
        let entry = entry.map_err(|_| MBError::ReadError)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if FILE_PREFIXES.iter().any(|p| name_str.starts_with(p)) {
            std::fs::copy(&path, dst_dir.join(&name)).map_err(|_| MBError::WriteError)?;
        }
    }
    Ok(())
}

/// Snapshot of header counters for `print_stats` (spec §6).
#[derive(Clone, Copy, Debug)]
pub struct Stats {
    pub count: u64,
    pub num_update: u64,
    pub index_high_water: u64,
    pub data_high_water: u64,
    pub pending_index_buff_size: u64,
    pub pending_data_buff_size: u64,
    pub rc_count: u64,
}

/// Cursor for the iterated `find_prefix` API (spec §6): every ancestor MATCH along a key's path is
/// resolved once, up front, and handed out one entry per call thereafter.
#[derive(Default)]
pub struct PrefixIterState {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    next: usize,
    started: bool,
}

impl PrefixIterState {
    pub fn new() -> Self {
        PrefixIterState::default()
    }

    /// Start over on the next call, e.g. because the caller is now iterating a different key.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.next = 0;
        self.started = false;
    }
}

struct SubmitQueue {
    queue: Arc<QueueFile>,
    /// `Db::add_async`/`remove_async` take `&self` (any handle may submit concurrently with its
    /// own reads), so the wake-up pipe needs its own lock independent of the dict mutex.
    pipe: Mutex<NamedPipe>,
}

/// A handle onto one database directory (spec §5, §6).
///
/// Field order matters: `async_writer` is declared ahead of `dict`/`header` so the default drop
/// order joins the background thread (which holds a `'static` header reference and a clone of
/// `dict`) before either goes away, even if a caller drops a `Db` without calling [`Db::close`].
pub struct Db {
    dir: PathBuf,
    async_writer: Option<AsyncWriter>,
    submit: Option<SubmitQueue>,
    dict: SharedDict,
    layout: BlockLayout,
    header: Header,
    _lock: Option<WriterLock>,
    is_writer: bool,
}

impl Db {
    /// **open** (spec §6). `memcap_index`/`memcap_data` bound the two segments in bytes; `id`
    /// distinguishes this database's queue/pipe names from any other database sharing the same
    /// `/dev/shm` namespace; `queue_size` is the number of command-queue slots, `0` disabling
    /// `add_async` entirely.
    pub fn open(
        dir: &Path,
        options: DbOptions,
        memcap_index: u64,
        memcap_data: u64,
        id: &str,
        queue_size: usize,
    ) -> MBResult<Self> {
        if options.writer {
            std::fs::create_dir_all(dir).map_err(|_| MBError::OpenFailure)?;
        }
        if !dir.is_dir() {
            return Err(MBError::NoDb);
        }

        let header_path = dir.join(HEADER_FILE);
        let header_file = OpenOptions::new()
            .create(options.writer)
            .read(true)
            .write(options.writer)
            .open(&header_path)
            .map_err(|_| MBError::OpenFailure)?;

        let file_len = header_file.metadata().map_err(|_| MBError::OpenFailure)?.len();
        if options.writer {
            if file_len < HEADER_PAGE_SIZE as u64 {
                header_file.set_len(HEADER_PAGE_SIZE as u64).map_err(|_| MBError::OpenFailure)?;
            }
        } else if file_len < HEADER_PAGE_SIZE as u64 {
            return Err(MBError::NoDb);
        }

        let header = Header::open(&header_file, HEADER_PAGE_SIZE).map_err(|_| MBError::MmapFailed)?;
        let page = header.page();

        let lock = if options.writer { Some(WriterLock::acquire(&dir.join(LOCK_FILE))?) } else { None };

        let version = page.version();
        let fresh = version == [0, 0, 0, 0];
        if fresh {
            if !options.writer {
                return Err(MBError::NoDb);
            }
            page.initialize(0, ROOT_SIZE);
            page.arena_mode.store(options.arena_mode as u16, Ordering::Relaxed);
            #[cfg(feature = "tracing")]
            tracing::info!(dir = %dir.display(), arena_mode = options.arena_mode, "initialized new database");
        } else {
            if version != HeaderPage::CURRENT_VERSION {
                return Err(MBError::VersionMismatch);
            }
            let existing_arena = page.arena_mode.load(Ordering::Relaxed) != 0;
            if existing_arena != options.arena_mode {
                return Err(MBError::InvalidArg);
            }
        }

        let layout = BlockLayout {
            dir: dir.to_path_buf(),
            block_size: options.block_size,
            index_blocks: blocks_for(memcap_index, options.block_size),
            data_blocks: blocks_for(memcap_data, options.block_size),
            arena_mode: options.arena_mode,
            index_alignment: options.index_alignment,
            data_alignment: options.data_alignment,
            max_per_free_class: options.max_per_free_class,
        };

        let index_high = page.m_index_offset.load(Ordering::Relaxed);
        let data_high = page.m_data_offset.load(Ordering::Relaxed);
        let (index_alloc, data_alloc) = build_allocators(&layout, index_high, data_high, true, options.writer)?;

        let trie = DictMem::new(index_alloc, 0);
        let mut dict = Dict::new(trie, data_alloc);
        if fresh {
            dict.trie_mut().init_root()?;
        } else if options.writer {
            // **ExceptionRecovery** (spec §4.10): replay any mutation the previous writer was
            // mid-publishing when it stopped.
            dict.recover_from_exception(page)?;
        }

        let dict: SharedDict = Arc::new(Mutex::new(dict));

        let (submit, async_writer) = if queue_size > 0 {
            let shm_dir = PathBuf::from("/dev/shm");
            let queue_dir = if shm_dir.is_dir() { shm_dir } else { dir.to_path_buf() };
            let queue_path = queue_dir.join(format!("{QUEUE_FILE}_{id}"));
            let pipe_path = queue_dir.join(format!("{PIPE_FILE}_{id}"));

            NamedPipe::create(&pipe_path).map_err(|_| MBError::OpenFailure)?;
            let own_queue = Arc::new(QueueFile::open(&queue_path, queue_size, true).map_err(|_| MBError::MmapFailed)?);
            let own_pipe = NamedPipe::open_writer(&pipe_path).map_err(|_| MBError::OpenFailure)?;

            let worker = if options.writer {
                let reader_pipe = NamedPipe::open_reader(&pipe_path).map_err(|_| MBError::OpenFailure)?;
                let ctx = WriterContext {
                    dict: dict.clone(),
                    header: header.page_static(),
                    dir: dir.to_path_buf(),
                    layout: layout.clone(),
                    rc_thresholds: RcThresholds::default(),
                };
                Some(AsyncWriter::spawn(ctx, own_queue.clone(), reader_pipe))
            } else {
                None
            };

            (Some(SubmitQueue { queue: own_queue, pipe: Mutex::new(own_pipe) }), worker)
        } else {
            (None, None)
        };

        Ok(Db {
            dir: dir.to_path_buf(),
            header,
            dict,
            layout,
            _lock: lock,
            async_writer,
            submit,
            is_writer: options.writer,
        })
    }

    /// **close** (spec §6). Persists free-list state (if any) and stops the async writer thread.
    pub fn close(mut self) -> MBResult<()> {
        if let Some(worker) = self.async_writer.take() {
            worker.shutdown();
        }
        if self.is_writer {
            let guard = self.dict.lock().unwrap();
            guard.trie().alloc().save_free_list(&self.dir.join(INDEX_FREE_LIST_FILE)).map_err(|_| MBError::WriteError)?;
            guard.data().save_free_list(&self.dir.join(DATA_FREE_LIST_FILE)).map_err(|_| MBError::WriteError)?;
        }
        Ok(())
    }

    fn require_writer(&self) -> MBResult<()> {
        if self.is_writer {
            Ok(())
        } else {
            Err(MBError::NotAllowed)
        }
    }

    fn search(&self) -> SearchEngine<'_> {
        SearchEngine::new(self.header.page())
    }

    /// **add** (spec §6).
    pub fn add(&self, key: &[u8], value: &[u8], overwrite: bool) -> MBResult<()> {
        self.require_writer()?;
        let mut dict = self.dict.lock().unwrap();
        dict.add(self.header.page(), key, value, overwrite)
    }

    /// **add_async** (spec §6): enqueue onto the shared command queue for the writer process to
    /// apply; available to any handle with a queue configured, writer or not.
    pub fn add_async(&self, key: &[u8], value: &[u8], overwrite: bool) -> MBResult<()> {
        self.submit(Command { kind: CommandType::Add, key: key.to_vec(), data: value.to_vec(), overwrite })
    }

    /// **remove** (spec §6).
    pub fn remove(&self, key: &[u8]) -> MBResult<()> {
        self.require_writer()?;
        let mut dict = self.dict.lock().unwrap();
        dict.remove(self.header.page(), key)
    }

    pub fn remove_async(&self, key: &[u8]) -> MBResult<()> {
        self.submit(Command { kind: CommandType::Remove, key: key.to_vec(), data: Vec::new(), overwrite: false })
    }

    /// **removeAll** (spec §6).
    pub fn remove_all(&self) -> MBResult<()> {
        self.require_writer()?;
        let mut dict = self.dict.lock().unwrap();
        dict.remove_all(self.header.page())
    }

    fn submit(&self, cmd: Command) -> MBResult<()> {
        let Some(submit) = &self.submit else { return Err(MBError::NotAllowed) };
        let queue = submit.queue.queue(&self.header.page().queue_index, &self.header.page().writer_index);
        queue.submit(&cmd).map_err(|()| MBError::TryAgain)?;
        submit.pipe.lock().unwrap().signal();
        Ok(())
    }

    /// **find** (spec §6).
    pub fn find(&self, key: &[u8]) -> MBResult<Vec<u8>> {
        let mut dict = self.dict.lock().unwrap();
        self.search().find(&mut *dict, key)
    }

    /// **findPrefix** (spec §6), iterated: the first call for a given `state` resolves every
    /// ancestor MATCH along `key`'s path, shortest first, then hands one out per call.
    pub fn find_prefix(&self, key: &[u8], state: &mut PrefixIterState) -> MBResult<Vec<u8>> {
        if !state.started {
            let mut dict = self.dict.lock().unwrap();
            state.entries = self.search().find_all_prefixes(&mut *dict, key)?;
            state.next = 0;
            state.started = true;
        }
        if state.next >= state.entries.len() {
            return Err(MBError::NotExist);
        }
        let (_, value) = state.entries[state.next].clone();
        state.next += 1;
        Ok(value)
    }

    /// **findLongestPrefix** (spec §6).
    pub fn find_longest_prefix(&self, key: &[u8]) -> MBResult<(Vec<u8>, Vec<u8>)> {
        let mut dict = self.dict.lock().unwrap();
        self.search().find_longest_prefix(&mut *dict, key)
    }

    /// **findLowerBound** (spec §6).
    pub fn find_lower_bound(&self, key: &[u8]) -> MBResult<(Vec<u8>, Vec<u8>)> {
        let mut dict = self.dict.lock().unwrap();
        self.search().find_lower_bound(&mut *dict, key)
    }

    /// **iterator** (spec §6): every live `(key, value)` pair, optionally restricted to a prefix
    /// and/or walking the rc-root region instead of the main trie. Collected eagerly into a `Vec`
    /// rather than a lazy streaming iterator, since a lazy version would need to hold the dict
    /// mutex across calls; documented as a simplification in DESIGN.md.
    pub fn iterator(&self, prefix: Option<&[u8]>, rc_mode: bool) -> MBResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut dict = self.dict.lock().unwrap();
        let root = if rc_mode {
            self.header.page().rc_root_offset.load(Ordering::Acquire)
        } else {
            dict.trie().root_offset()
        };
        let mut out = Vec::new();
        let mut trav = Traversal::new(root);
        while let Some(visited) = trav.next(&mut *dict)? {
            if let Some(p) = prefix {
                if !visited.key.starts_with(p) {
                    continue;
                }
            }
            let value = dict.read_value(visited.value_offset)?;
            out.push((visited.key, value));
        }
        Ok(out)
    }

    /// **collectResource** (spec §6, §4.9). `max_dbsize`/`max_dbcount` additionally trigger LRU
    /// eviction (oldest bucket first) if the collected database is still over either limit.
    pub fn collect_resource(&self, min_index_size: u64, min_data_size: u64, max_dbsize: u64, max_dbcount: u64) -> MBResult<()> {
        self.require_writer()?;
        let thresholds = RcThresholds { min_index_size, min_data_size };
        perform_collect(&self.dict, self.header.page(), &self.dir, &self.layout, &thresholds)?;
        self.evict_if_over(max_dbsize, max_dbcount)
    }

    /// Delete whole eviction buckets, oldest first, until both the data segment's high-water mark
    /// and the live key count are under the given caps (spec §4.9's bucketed LRU eviction).
    fn evict_if_over(&self, max_dbsize: u64, max_dbcount: u64) -> MBResult<()> {
        if max_dbsize == 0 && max_dbcount == 0 {
            return Ok(());
        }
        let header = self.header.page();

        for _ in 0..(u16::MAX as usize + 1) {
            let size = header.m_data_offset.load(Ordering::Relaxed);
            let count = header.count.load(Ordering::Relaxed);
            if (max_dbsize == 0 || size <= max_dbsize) && (max_dbcount == 0 || count <= max_dbcount) {
                return Ok(());
            }

            let bucket = header.eviction_bucket_index.load(Ordering::Relaxed);
            let mut victims = Vec::new();
            {
                let mut dict = self.dict.lock().unwrap();
                let mut trav = Traversal::new(dict.trie().root_offset());
                while let Some(visited) = trav.next(&mut *dict)? {
                    if dict.bucket_index(visited.value_offset)? == bucket {
                        victims.push(visited.key);
                    }
                }
                for key in &victims {
                    dict.remove(header, key)?;
                }
            }
            header.eviction_bucket_index.store(bucket.wrapping_add(1), Ordering::Relaxed);
        }
        Ok(())
    }

    /// **backup** (spec §6): copy the live segment/header/free-list files to `dst_dir`.
    pub fn backup(&self, dst_dir: &Path) -> MBResult<()> {
        copy_db_files(&self.dir, dst_dir)
    }

    pub fn stats(&self) -> Stats {
        let header = self.header.page();
        Stats {
            count: header.count.load(Ordering::Relaxed),
            num_update: header.num_update.load(Ordering::Relaxed),
            index_high_water: header.m_index_offset.load(Ordering::Relaxed),
            data_high_water: header.m_data_offset.load(Ordering::Relaxed),
            pending_index_buff_size: header.pending_index_buff_size.load(Ordering::Relaxed),
            pending_data_buff_size: header.pending_data_buff_size.load(Ordering::Relaxed),
            rc_count: header.rc_count.load(Ordering::Relaxed),
        }
    }

    /// **printStats** (spec §6).
    pub fn print_stats(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        let s = self.stats();
        writeln!(out, "count: {}", s.count)?;
        writeln!(out, "num_update: {}", s.num_update)?;
        writeln!(out, "index_high_water: {}", s.index_high_water)?;
        writeln!(out, "data_high_water: {}", s.data_high_water)?;
        writeln!(out, "pending_index_buff_size: {}", s.pending_index_buff_size)?;
        writeln!(out, "pending_data_buff_size: {}", s.pending_data_buff_size)?;
        writeln!(out, "rc_count: {}", s.rc_count)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_opts() -> DbOptions {
        DbOptions { writer: true, block_size: 4096, ..DbOptions::default() }
    }

    #[test]
    fn add_then_find_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), writer_opts(), 1 << 20, 1 << 20, "t1", 0).unwrap();

        db.add(b"abc", b"123", false).unwrap();
        assert_eq!(db.find(b"abc").unwrap(), b"123");
        assert_eq!(db.stats().count, 1);
    }

    #[test]
    fn split_and_link_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), writer_opts(), 1 << 20, 1 << 20, "t2", 0).unwrap();

        db.add(b"abc", b"123", false).unwrap();
        db.add(b"abcd", b"456", false).unwrap();
        assert_eq!(db.find(b"abcd").unwrap(), b"456");
        assert_eq!(db.find(b"abc").unwrap(), b"123");

        db.add(b"abce", b"789", false).unwrap();
        assert_eq!(db.find(b"abcd").unwrap(), b"456");
        assert_eq!(db.find(b"abce").unwrap(), b"789");
    }

    #[test]
    fn add_without_overwrite_rejects_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), writer_opts(), 1 << 20, 1 << 20, "t3", 0).unwrap();

        db.add(b"abc", b"v1", false).unwrap();
        assert_eq!(db.add(b"abc", b"v2", false), Err(MBError::InDict));
        assert_eq!(db.find(b"abc").unwrap(), b"v1");

        db.add(b"abc", b"v2", true).unwrap();
        assert_eq!(db.find(b"abc").unwrap(), b"v2");
        assert_eq!(db.stats().count, 1);
    }

    #[test]
    fn remove_then_remove_all() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), writer_opts(), 1 << 20, 1 << 20, "t4", 0).unwrap();

        db.add(b"abc", b"v", false).unwrap();
        db.remove(b"abc").unwrap();
        assert_eq!(db.find(b"abc"), Err(MBError::NotExist));
        assert_eq!(db.stats().count, 0);

        db.add(b"x", b"1", false).unwrap();
        db.add(b"y", b"2", false).unwrap();
        db.remove_all().unwrap();
        assert_eq!(db.stats().count, 0);
        assert_eq!(db.stats().data_high_water, crate::header::DATA_HEADER_SIZE);
    }

    #[test]
    fn longest_prefix_and_lower_bound() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), writer_opts(), 1 << 20, 1 << 20, "t5", 0).unwrap();

        db.add(b"ab", b"ab-v", false).unwrap();
        db.add(b"abcd", b"abcd-v", false).unwrap();
        db.add(b"abce", b"abce-v", false).unwrap();

        let (k, v) = db.find_longest_prefix(b"abcdxyz").unwrap();
        assert_eq!(k, b"abcd");
        assert_eq!(v, b"abcd-v");

        let (k, v) = db.find_lower_bound(b"abcz").unwrap();
        assert_eq!(k, b"abce");
        assert_eq!(v, b"abce-v");
    }

    #[test]
    fn iterator_enumerates_live_set() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), writer_opts(), 1 << 20, 1 << 20, "t6", 0).unwrap();

        db.add(b"a", b"1", false).unwrap();
        db.add(b"b", b"2", false).unwrap();
        db.add(b"c", b"3", false).unwrap();
        db.remove(b"b").unwrap();

        let mut entries = db.iterator(None, false).unwrap();
        entries.sort();
        assert_eq!(entries, vec![(b"a".to_vec(), b"1".to_vec()), (b"c".to_vec(), b"3".to_vec())]);
    }

    #[test]
    fn collect_resource_preserves_live_set() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), writer_opts(), 1 << 20, 1 << 20, "t7", 0).unwrap();

        for i in 0..200u32 {
            db.add(&i.to_le_bytes(), &(i * 2).to_le_bytes(), false).unwrap();
        }
        for i in (0..200u32).step_by(2) {
            db.remove(&i.to_le_bytes()).unwrap();
        }

        db.collect_resource(0, 0, 0, 0).unwrap();

        assert_eq!(db.stats().count, 100);
        for i in (1..200u32).step_by(2) {
            assert_eq!(db.find(&i.to_le_bytes()).unwrap(), (i * 2).to_le_bytes());
        }
        for i in (0..200u32).step_by(2) {
            assert_eq!(db.find(&i.to_le_bytes()), Err(MBError::NotExist));
        }
    }

    #[test]
    fn reader_handle_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Db::open(dir.path(), writer_opts(), 1 << 20, 1 << 20, "t8", 0).unwrap();
        writer.add(b"k", b"v", false).unwrap();

        let reader_opts = DbOptions { writer: false, block_size: 4096, ..DbOptions::default() };
        let reader = Db::open(dir.path(), reader_opts, 1 << 20, 1 << 20, "t8", 0).unwrap();
        assert_eq!(reader.find(b"k").unwrap(), b"v");
        assert_eq!(reader.add(b"k2", b"v2", false), Err(MBError::NotAllowed));
    }

    #[test]
    fn second_writer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let _first = Db::open(dir.path(), writer_opts(), 1 << 20, 1 << 20, "t9", 0).unwrap();
        let err = Db::open(dir.path(), writer_opts(), 1 << 20, 1 << 20, "t9", 0).unwrap_err();
        assert_eq!(err, MBError::WriterExist);
    }
}
