//! Per-thread and cross-process prefix caches that seed exact-find traversal (spec §4.8).
use crate::trie::{Edge, EdgePtrs};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// First-N-bytes key used to index both cache variants. `N` is configurable in [1, 8], default 4.
pub fn cache_key(key: &[u8], n: usize) -> Option<u64> {
    if key.len() < n {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..n].copy_from_slice(&key[..n]);
    Some(u64::from_le_bytes(buf))
}

#[derive(Clone, Copy)]
struct Entry {
    key: u64,
    node_offset: u64,
    edge_offset: u64,
    edge: Edge,
}

/// Thread-local cache (spec §4.8, "Per-thread cache"): small, set-associative, not shared.
pub struct ThreadPrefixCache {
    n: usize,
    ways: usize,
    slots: RefCell<Vec<Option<Entry>>>,
}

impl ThreadPrefixCache {
    pub fn new(n: usize, buckets: usize, ways: usize) -> Self {
        assert!((1..=8).contains(&n));
        ThreadPrefixCache {
            n,
            ways,
            slots: RefCell::new(vec![None; buckets * ways]),
        }
    }

    fn bucket(&self, key: u64) -> usize {
        let buckets = self.slots.borrow().len() / self.ways;
        (key as usize) % buckets.max(1)
    }

    pub fn lookup(&self, key: &[u8]) -> Option<EdgePtrs> {
        let k = cache_key(key, self.n)?;
        let base = self.bucket(k) * self.ways;
        let slots = self.slots.borrow();
        for way in 0..self.ways {
            if let Some(entry) = slots[base + way] {
                if entry.key == k {
                    return Some(EdgePtrs {
                        node_offset: entry.node_offset,
                        edge_offset: entry.edge_offset,
                        first_byte: key[0],
                        edge: entry.edge,
                    });
                }
            }
        }
        None
    }

    pub fn insert(&self, key: &[u8], ptrs: &EdgePtrs) {
        let Some(k) = cache_key(key, self.n) else { return };
        let base = self.bucket(k) * self.ways;
        let mut slots = self.slots.borrow_mut();
        // Round-robin eviction inside the way-set; good enough for a hint cache whose entries are
        // always re-validated against the live segment before use.
        let victim = base + (k as usize % self.ways);
        slots[victim] = Some(Entry {
            key: k,
            node_offset: ptrs.node_offset,
            edge_offset: ptrs.edge_offset,
            edge: ptrs.edge,
        });
    }
}

thread_local! {
    static THREAD_CACHE: RefCell<Option<ThreadPrefixCache>> = RefCell::new(None);
}

/// Run `f` with this thread's prefix cache, creating it with the given shape on first use.
pub fn with_thread_cache<R>(n: usize, buckets: usize, ways: usize, f: impl FnOnce(&ThreadPrefixCache) -> R) -> R {
    THREAD_CACHE.with(|cell| {
        if cell.borrow().is_none() {
            *cell.borrow_mut() = Some(ThreadPrefixCache::new(n, buckets, ways));
        }
        f(cell.borrow().as_ref().unwrap())
    })
}

/// One way of a shared, mmap'd set-associative bucket: 13 raw edge bytes plus the key this entry
/// was seeded for, all as plain bytes behind per-byte atomics so a racing writer insert can never
/// produce a torn read (spec §4.8, "Shared cache").
#[repr(C)]
pub struct SharedCacheWay {
    key: AtomicU64,
    valid: AtomicU8,
    edge: [AtomicU8; 13],
}

impl SharedCacheWay {
    pub fn read(&self) -> Option<(u64, [u8; 13])> {
        if self.valid.load(Ordering::Acquire) == 0 {
            return None;
        }
        let key = self.key.load(Ordering::Acquire);
        let mut bytes = [0u8; 13];
        for (dst, src) in bytes.iter_mut().zip(&self.edge) {
            *dst = src.load(Ordering::Acquire);
        }
        Some((key, bytes))
    }

    /// Only the writer calls this (spec §4.8: "only the writer inserts entries").
    pub fn write(&self, key: u64, edge: &[u8; 13]) {
        self.valid.store(0, Ordering::Release);
        for (dst, &b) in self.edge.iter().zip(edge) {
            dst.store(b, Ordering::Relaxed);
        }
        self.key.store(key, Ordering::Relaxed);
        self.valid.store(1, Ordering::Release);
    }
}

/// A mmap'd set-associative table of [`SharedCacheWay`] slots, `ways` per bucket.
pub struct SharedPrefixCache<'m> {
    n: usize,
    ways: usize,
    table: &'m [SharedCacheWay],
}

impl<'m> SharedPrefixCache<'m> {
    pub fn new(n: usize, ways: usize, table: &'m [SharedCacheWay]) -> Self {
        assert!((1..=8).contains(&n));
        SharedPrefixCache { n, ways, table }
    }

    fn bucket(&self, key: u64) -> usize {
        let buckets = self.table.len() / self.ways;
        (key as usize) % buckets.max(1)
    }

    /// Seed a lookup; returns the raw edge bytes for the caller to re-validate against the live
    /// segment through the lock-free guard when `num_writer > 0` (spec §4.8).
    pub fn lookup(&self, key: &[u8]) -> Option<(u64, [u8; 13])> {
        let k = cache_key(key, self.n)?;
        let base = self.bucket(k) * self.ways;
        for way in &self.table[base..base + self.ways] {
            if let Some((stored_key, bytes)) = way.read() {
                if stored_key == k {
                    return Some((k, bytes));
                }
            }
        }
        None
    }

    pub fn insert(&self, key: &[u8], edge: &[u8; 13]) {
        let Some(k) = cache_key(key, self.n) else { return };
        let base = self.bucket(k) * self.ways;
        let victim = base + (k as usize % self.ways);
        self.table[victim].write(k, edge);
    }
}
