//! The two allocator strategies from spec §4.2, both layered over a [`BlockPool`].
use crate::block::BlockPool;
use crate::MemError;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    Mem(MemError),
    /// The segment's high-water mark would exceed `block_size * max_blocks`.
    NoMemory,
}

impl From<MemError> for AllocError {
    fn from(e: MemError) -> Self {
        AllocError::Mem(e)
    }
}

impl core::fmt::Display for AllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AllocError::Mem(e) => write!(f, "{e}"),
            AllocError::NoMemory => write!(f, "segment high-water would exceed the configured maximum"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Common interface over a segment's allocation strategy (spec §9: "Polymorphic allocator").
pub trait Allocator {
    fn reserve(&mut self, size: usize) -> Result<u64, AllocError>;
    /// Returns the number of bytes that became reclaimable (usually `size`, used to update the
    /// header's `pending_*_buff_size` counters).
    fn release(&mut self, offset: u64, size: usize) -> u64;
    fn high_water(&self) -> u64;
    fn pool_mut(&mut self) -> &mut BlockPool;
}

/// Size-classed free-list allocator: the "old way" of managing memory (spec §4.2, free-list mode).
pub struct FreeListAllocator {
    pool: BlockPool,
    alignment: usize,
    high_water: u64,
    classes: HashMap<u64, VecDeque<u64>>,
    max_per_class: usize,
}

impl FreeListAllocator {
    pub fn new(pool: BlockPool, alignment: usize, max_per_class: usize, high_water: u64) -> Self {
        FreeListAllocator {
            pool,
            alignment: alignment.max(1),
            high_water,
            classes: HashMap::new(),
            max_per_class,
        }
    }

    fn round_up(&self, size: usize) -> u64 {
        let a = self.alignment as u64;
        let size = size as u64;
        ((size + a - 1) / a) * a
    }

    /// Persist the free lists so a restarted writer does not lose reclaimable space (spec §4.2).
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut out = std::fs::File::create(path)?;
        out.write_all(&(self.classes.len() as u64).to_le_bytes())?;
        for (class, offsets) in &self.classes {
            out.write_all(&class.to_le_bytes())?;
            out.write_all(&(offsets.len() as u64).to_le_bytes())?;
            for off in offsets {
                out.write_all(&off.to_le_bytes())?;
            }
        }
        Ok(())
    }

    pub fn load(
        pool: BlockPool,
        alignment: usize,
        max_per_class: usize,
        high_water: u64,
        path: &Path,
    ) -> std::io::Result<Self> {
        let mut this = FreeListAllocator::new(pool, alignment, max_per_class, high_water);
        let Ok(mut file) = std::fs::File::open(path) else {
            return Ok(this);
        };

        let mut u64buf = [0u8; 8];
        file.read_exact(&mut u64buf)?;
        let num_classes = u64::from_le_bytes(u64buf);

        for _ in 0..num_classes {
            file.read_exact(&mut u64buf)?;
            let class = u64::from_le_bytes(u64buf);
            file.read_exact(&mut u64buf)?;
            let count = u64::from_le_bytes(u64buf);

            let mut list = VecDeque::with_capacity(count as usize);
            for _ in 0..count {
                file.read_exact(&mut u64buf)?;
                list.push_back(u64::from_le_bytes(u64buf));
            }
            this.classes.insert(class, list);
        }

        Ok(this)
    }

    fn push_slack(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        let class = self.round_up(size as usize).min(size);
        let list = self.classes.entry(class).or_default();
        if list.len() < self.max_per_class {
            list.push_back(offset);
        }
    }
}

impl Allocator for FreeListAllocator {
    fn reserve(&mut self, size: usize) -> Result<u64, AllocError> {
        let class = self.round_up(size);

        if let Some(list) = self.classes.get_mut(&class) {
            if let Some(offset) = list.pop_front() {
                return Ok(offset);
            }
        }

        if self.high_water + class > self.pool.max_size() {
            return Err(AllocError::NoMemory);
        }

        let (aligned, _ptr) = self.pool.reserve(self.high_water, class as usize)?;
        if aligned > self.high_water {
            let slack = aligned - self.high_water;
            self.push_slack(self.high_water, slack);
        }

        self.high_water = aligned + class;
        Ok(aligned)
    }

    fn release(&mut self, offset: u64, size: usize) -> u64 {
        let class = self.round_up(size);
        let list = self.classes.entry(class).or_default();
        if list.len() < self.max_per_class {
            list.push_back(offset);
        }
        class
    }

    fn high_water(&self) -> u64 {
        self.high_water
    }

    fn pool_mut(&mut self) -> &mut BlockPool {
        &mut self.pool
    }
}

/// Arena-scoped bump allocator: the "alloc" hook just advances the high-water mark, "dalloc" is a
/// no-op, and "purge" advises the OS to drop clean pages (spec §4.2, arena mode). The segment is
/// append-only between resource-collection passes.
pub struct ArenaAllocator {
    pool: BlockPool,
    high_water: u64,
}

impl ArenaAllocator {
    pub fn new(pool: BlockPool, high_water: u64) -> Self {
        ArenaAllocator { pool, high_water }
    }

    pub fn purge(&mut self, offset: u64, size: usize) -> Result<(), MemError> {
        self.pool.purge(offset, size)
    }
}

impl Allocator for ArenaAllocator {
    fn reserve(&mut self, size: usize) -> Result<u64, AllocError> {
        if self.high_water + size as u64 > self.pool.max_size() {
            return Err(AllocError::NoMemory);
        }
        let (aligned, _ptr) = self.pool.reserve(self.high_water, size)?;
        self.high_water = aligned + size as u64;
        Ok(aligned)
    }

    fn release(&mut self, _offset: u64, size: usize) -> u64 {
        // Append-only until resource collection; nothing to reclaim immediately.
        size as u64
    }

    fn high_water(&self) -> u64 {
        self.high_water
    }

    fn pool_mut(&mut self) -> &mut BlockPool {
        &mut self.pool
    }
}

/// The runtime choice between the two allocator strategies (spec §9: "Model the two allocator
/// strategies as an interface ... choose at open time from the header's options flag"). A `Db`
/// instantiates `Dict`/`DictMem` generically over this instead of over `FreeListAllocator` or
/// `ArenaAllocator` directly, since the mode is a per-database runtime option, not a compile-time
/// choice.
pub enum AnyAllocator {
    FreeList(FreeListAllocator),
    Arena(ArenaAllocator),
}

impl AnyAllocator {
    pub fn is_arena(&self) -> bool {
        matches!(self, AnyAllocator::Arena(_))
    }

    /// Persist free-list state to `path`; a no-op in arena mode, since there is nothing to persist.
    pub fn save_free_list(&self, path: &Path) -> std::io::Result<()> {
        match self {
            AnyAllocator::FreeList(a) => a.save(path),
            AnyAllocator::Arena(_) => Ok(()),
        }
    }
}

impl Allocator for AnyAllocator {
    fn reserve(&mut self, size: usize) -> Result<u64, AllocError> {
        match self {
            AnyAllocator::FreeList(a) => a.reserve(size),
            AnyAllocator::Arena(a) => a.reserve(size),
        }
    }

    fn release(&mut self, offset: u64, size: usize) -> u64 {
        match self {
            AnyAllocator::FreeList(a) => a.release(offset, size),
            AnyAllocator::Arena(a) => a.release(offset, size),
        }
    }

    fn high_water(&self) -> u64 {
        match self {
            AnyAllocator::FreeList(a) => a.high_water(),
            AnyAllocator::Arena(a) => a.high_water(),
        }
    }

    fn pool_mut(&mut self) -> &mut BlockPool {
        match self {
            AnyAllocator::FreeList(a) => a.pool_mut(),
            AnyAllocator::Arena(a) => a.pool_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockPoolOptions;

    fn pool(dir: &std::path::Path) -> BlockPool {
        BlockPool::open(BlockPoolOptions {
            dir: dir.to_path_buf(),
            prefix: "_mabain_a",
            block_size: 4096,
            max_blocks: 16,
            writable: true,
        })
        .unwrap()
    }

    #[test]
    fn free_list_reuses_released_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut alloc = FreeListAllocator::new(pool(dir.path()), 8, 64, 0);

        let a = alloc.reserve(32).unwrap();
        alloc.release(a, 32);
        let b = alloc.reserve(32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn arena_never_reuses_before_rc() {
        let dir = tempfile::tempdir().unwrap();
        let mut alloc = ArenaAllocator::new(pool(dir.path()), 0);

        let a = alloc.reserve(32).unwrap();
        alloc.release(a, 32);
        let b = alloc.reserve(32).unwrap();
        assert_ne!(a, b);
    }
}
