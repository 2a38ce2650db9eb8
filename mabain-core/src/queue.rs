//! Shared-memory command queue through which non-writer processes submit mutations to the single
//! writer (spec §4.7). Its slot-reuse discipline is deliberately independent of the trie's
//! lock-free protocol (spec §9).
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use memmap2::MmapRaw;
use std::fs::OpenOptions;
use std::path::Path;

pub const MAX_QUEUE_KEY: usize = 256;
pub const MAX_QUEUE_DATA: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    None = 0,
    Add = 1,
    Append = 2,
    Remove = 3,
    RemoveAll = 4,
    Rc = 5,
    Backup = 6,
    Freeze = 7,
}

impl CommandType {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CommandType::Add,
            2 => CommandType::Append,
            3 => CommandType::Remove,
            4 => CommandType::RemoveAll,
            5 => CommandType::Rc,
            6 => CommandType::Backup,
            7 => CommandType::Freeze,
            _ => CommandType::None,
        }
    }
}

/// One queue slot (spec §4.7). `key`/`data` are plain bytes guarded entirely by `in_use`: a
/// producer only fills them while `in_use` is false and `num_reader` was observed zero, and the
/// writer only reads them after observing `in_use == true`.
#[repr(C)]
pub struct Slot {
    in_use: AtomicBool,
    num_reader: AtomicU16,
    key_len: AtomicU16,
    data_len: AtomicU32,
    overwrite: AtomicBool,
    command: AtomicU32,
    key: [std::cell::UnsafeCell<u8>; MAX_QUEUE_KEY],
    data: [std::cell::UnsafeCell<u8>; MAX_QUEUE_DATA],
}

// Safety: access to `key`/`data` is serialized by the `in_use`/`num_reader` protocol documented on
// `Slot`; there is never a concurrent reader and writer touching the bytes at once.
unsafe impl Sync for Slot {}

pub struct Command {
    pub kind: CommandType,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub overwrite: bool,
}

impl Slot {
    /// Producer side (spec §4.7 "Multi-producer discipline").
    pub fn try_reserve(&self) -> Result<(), ()> {
        if self.in_use.load(Ordering::Acquire) {
            return Err(());
        }
        if self.num_reader.fetch_add(1, Ordering::AcqRel) != 0 {
            self.num_reader.fetch_sub(1, Ordering::AcqRel);
            return Err(());
        }
        Ok(())
    }

    pub fn fill(&self, cmd: &Command) {
        let key_len = cmd.key.len().min(MAX_QUEUE_KEY);
        let data_len = cmd.data.len().min(MAX_QUEUE_DATA);
        for (cell, &b) in self.key.iter().zip(&cmd.key[..key_len]) {
            unsafe { *cell.get() = b };
        }
        for (cell, &b) in self.data.iter().zip(&cmd.data[..data_len]) {
            unsafe { *cell.get() = b };
        }
        self.key_len.store(key_len as u16, Ordering::Relaxed);
        self.data_len.store(data_len as u32, Ordering::Relaxed);
        self.overwrite.store(cmd.overwrite, Ordering::Relaxed);
        self.command.store(cmd.kind as u32, Ordering::Relaxed);
        self.in_use.store(true, Ordering::Release);
    }

    /// Writer side: read and clear a live slot.
    pub fn take(&self) -> Option<Command> {
        if !self.in_use.load(Ordering::Acquire) {
            return None;
        }
        let key_len = self.key_len.load(Ordering::Relaxed) as usize;
        let data_len = self.data_len.load(Ordering::Relaxed) as usize;
        let key = self.key[..key_len].iter().map(|c| unsafe { *c.get() }).collect();
        let data = self.data[..data_len].iter().map(|c| unsafe { *c.get() }).collect();
        let cmd = Command {
            kind: CommandType::from_u8(self.command.load(Ordering::Relaxed) as u8),
            key,
            data,
            overwrite: self.overwrite.load(Ordering::Relaxed),
        };
        self.command.store(CommandType::None as u32, Ordering::Relaxed);
        self.num_reader.store(0, Ordering::Relaxed);
        self.in_use.store(false, Ordering::Release);
        Some(cmd)
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

/// The fixed-size ring of slots plus the shared `queue_index`/`writer_index` counters. Lives in
/// its own mmap'd file (`_mabain_q`), separate from the header page (spec §4.7).
pub struct CommandQueue<'m> {
    slots: &'m [Slot],
    queue_index: &'m AtomicU64,
    writer_index: &'m AtomicU64,
}

impl<'m> CommandQueue<'m> {
    pub fn new(slots: &'m [Slot], queue_index: &'m AtomicU64, writer_index: &'m AtomicU64) -> Self {
        CommandQueue { slots, queue_index, writer_index }
    }

    /// Producer: reserve the next slot in this producer's monotonic sequence.
    pub fn submit(&self, cmd: &Command) -> Result<(), ()> {
        let index = self.queue_index.fetch_add(1, Ordering::AcqRel);
        let slot = &self.slots[(index as usize) % self.slots.len()];
        slot.try_reserve()?;
        slot.fill(cmd);
        Ok(())
    }

    /// Writer: drain slots starting at `writer_index` in FIFO order. If the slot at
    /// `writer_index` is idle while `writer_index < queue_index` (a producer crashed mid-reserve),
    /// scan forward to the next truly in-use slot rather than stalling forever.
    pub fn drain(&self, mut apply: impl FnMut(Command)) {
        let queue_index = self.queue_index.load(Ordering::Acquire);
        let mut idx = self.writer_index.load(Ordering::Relaxed);

        while idx < queue_index {
            let slot = &self.slots[(idx as usize) % self.slots.len()];
            match slot.take() {
                Some(cmd) => {
                    apply(cmd);
                    idx += 1;
                }
                None => {
                    let mut scan = idx + 1;
                    while scan < queue_index && !self.slots[(scan as usize) % self.slots.len()].in_use() {
                        scan += 1;
                    }
                    idx = scan;
                }
            }
        }
        self.writer_index.store(idx, Ordering::Relaxed);
    }
}

/// Owns the mmap backing the `_mabain_q` slot array. Defaults to living under `/dev/shm` (spec
/// §6: "the queue file, by default in shared memory, separate from the index/data blocks") so
/// that producer processes never need to touch the on-disk segments at all.
pub struct QueueFile {
    slots: &'static [Slot],
    #[allow(dead_code)]
    map: MmapRaw,
}

impl QueueFile {
    /// Create or open the queue file at `path`, sized for `slot_count` slots.
    pub fn open(path: &Path, slot_count: usize, writable: bool) -> std::io::Result<Self> {
        let len = slot_count * std::mem::size_of::<Slot>();
        let file = OpenOptions::new()
            .create(writable)
            .read(true)
            .write(writable)
            .open(path)?;

        if writable && file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }

        let map = MmapRaw::map_raw(&file)?;
        assert!(map.len() >= len, "queue file shorter than slot_count * size_of::<Slot>()");

        // Safety: `map` stays mapped for as long as `self` does, `Slot` is `#[repr(C)]` with only
        // atomic fields, and a freshly-zeroed file is a valid all-`Slot::default`-like bit pattern
        // (`in_use == false`, `command == CommandType::None as u32`).
        let slots = unsafe {
            std::slice::from_raw_parts(map.as_ptr() as *const Slot, slot_count)
        };
        Ok(QueueFile { slots, map })
    }

    pub fn slots(&self) -> &[Slot] {
        self.slots
    }

    /// Borrow a [`CommandQueue`] view over these slots plus the header's shared indices.
    pub fn queue<'m>(&'m self, queue_index: &'m AtomicU64, writer_index: &'m AtomicU64) -> CommandQueue<'m> {
        CommandQueue::new(self.slots, queue_index, writer_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_slot() -> Slot {
        const KEY_INIT: std::cell::UnsafeCell<u8> = std::cell::UnsafeCell::new(0);
        const DATA_INIT: std::cell::UnsafeCell<u8> = std::cell::UnsafeCell::new(0);
        Slot {
            in_use: AtomicBool::new(false),
            num_reader: AtomicU16::new(0),
            key_len: AtomicU16::new(0),
            data_len: AtomicU32::new(0),
            overwrite: AtomicBool::new(false),
            command: AtomicU32::new(0),
            key: [KEY_INIT; MAX_QUEUE_KEY],
            data: [DATA_INIT; MAX_QUEUE_DATA],
        }
    }

    #[test]
    fn submit_then_drain_round_trips() {
        let slots = vec![new_slot(), new_slot(), new_slot()];
        let queue_index = AtomicU64::new(0);
        let writer_index = AtomicU64::new(0);
        let queue = CommandQueue::new(&slots, &queue_index, &writer_index);

        let cmd = Command {
            kind: CommandType::Add,
            key: b"hello".to_vec(),
            data: b"world".to_vec(),
            overwrite: true,
        };
        queue.submit(&cmd).unwrap();

        let mut seen = Vec::new();
        queue.drain(|c| seen.push(c.key));
        assert_eq!(seen, vec![b"hello".to_vec()]);
    }

    #[test]
    fn busy_slot_rejects_second_reservation() {
        let slot = new_slot();
        slot.try_reserve().unwrap();
        assert!(slot.try_reserve().is_err());
    }
}
