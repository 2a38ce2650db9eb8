//! A logical file realized as a sequence of fixed-size, numbered, mmap'd block files.
//!
//! Mirrors the `_mabain_i0`, `_mabain_i1`, ... rollable file scheme: blocks are created lazily on
//! first write and mapped lazily on first access, so that a reader which never touches the tail
//! of a growing segment never maps it.
use crate::MemError;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::PathBuf;

pub struct BlockPoolOptions {
    /// Directory the block files live in.
    pub dir: PathBuf,
    /// File name prefix, e.g. `_mabain_i` for the index segment, `_mabain_d` for data.
    pub prefix: &'static str,
    /// Size in bytes of every block. Must be a multiple of the OS page size.
    pub block_size: u64,
    /// Maximum number of blocks; bounds the logical segment to `block_size * max_blocks`.
    pub max_blocks: u32,
    /// Open for writing (creates/extends block files) vs. read-only mapping.
    pub writable: bool,
}

struct Block {
    map: MmapMut,
}

/// A sequence of fixed-size mmap'd block files forming one logical, rollable segment.
pub struct BlockPool {
    opt: BlockPoolOptions,
    blocks: Vec<Option<Block>>,
}

impl BlockPool {
    pub fn open(opt: BlockPoolOptions) -> Result<Self, MemError> {
        let max_blocks = opt.max_blocks as usize;
        let mut blocks = Vec::with_capacity(max_blocks);
        blocks.resize_with(max_blocks, || None);
        Ok(BlockPool { opt, blocks })
    }

    pub fn block_size(&self) -> u64 {
        self.opt.block_size
    }

    pub fn max_size(&self) -> u64 {
        self.opt.block_size * u64::from(self.opt.max_blocks)
    }

    fn block_path(&self, index: usize) -> PathBuf {
        self.opt.dir.join(format!("{}{}", self.opt.prefix, index))
    }

    /// Align `offset` so that a reservation of `size` bytes does not straddle a block boundary.
    ///
    /// Returns the (possibly bumped) offset; the gap between the original and the aligned offset
    /// is "alignment slack" that the caller should return to a smaller allocator size class.
    pub fn align_for_reservation(&self, offset: u64, size: usize) -> u64 {
        let block_size = self.opt.block_size;
        if size as u64 > block_size {
            return offset;
        }
        let start_block = offset / block_size;
        let end_block = (offset + size as u64 - 1) / block_size;
        if start_block != end_block {
            (start_block + 1) * block_size
        } else {
            offset
        }
    }

    fn ensure_mapped(&mut self, index: usize) -> Result<(), MemError> {
        if index >= self.blocks.len() {
            return Err(MemError::OutOfBound);
        }
        if self.blocks[index].is_some() {
            return Ok(());
        }

        let path = self.block_path(index);
        let file = OpenOptions::new()
            .create(self.opt.writable)
            .read(true)
            .write(self.opt.writable)
            .open(&path)
            .map_err(|_| MemError::BlockCreate)?;

        if self.opt.writable {
            let len = file.metadata().map_err(|_| MemError::BlockCreate)?.len();
            if len < self.opt.block_size {
                file.set_len(self.opt.block_size)
                    .map_err(|_| MemError::BlockCreate)?;
            }
        }

        // Safety: the file is exclusively ours per-block (only ever grown, never truncated while
        // mapped), and we hold the mapping for at least as long as any pointer derived from it.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|_| MemError::MmapFailed)?;
        self.blocks[index] = Some(Block { map });
        Ok(())
    }

    /// Reserve `size` bytes at `offset`, aligning first if needed.
    ///
    /// Returns the (possibly aligned) offset and a direct pointer when the whole range maps into
    /// a single block; `None` for the pointer means the caller must fall back to
    /// [`BlockPool::random_write`] (this happens only if `size` exceeds the block size).
    pub fn reserve(&mut self, offset: u64, size: usize) -> Result<(u64, Option<*mut u8>), MemError> {
        let aligned = self.align_for_reservation(offset, size);
        if size as u64 > self.opt.block_size {
            return Ok((aligned, None));
        }

        let index = (aligned / self.opt.block_size) as usize;
        self.ensure_mapped(index)?;
        let in_block = (aligned % self.opt.block_size) as usize;
        let block = self.blocks[index].as_mut().unwrap();
        Ok((aligned, Some(unsafe { block.map.as_mut_ptr().add(in_block) })))
    }

    /// A pointer into mapped memory, valid only if the whole range is within a single block.
    pub fn get_shm_ptr(&mut self, offset: u64, size: usize) -> Result<Option<*mut u8>, MemError> {
        if size as u64 > self.opt.block_size {
            return Ok(None);
        }
        let start_block = offset / self.opt.block_size;
        let end_block = (offset + size as u64 - 1) / self.opt.block_size;
        if start_block != end_block {
            return Ok(None);
        }
        let index = start_block as usize;
        self.ensure_mapped(index)?;
        let in_block = (offset % self.opt.block_size) as usize;
        let block = self.blocks[index].as_mut().unwrap();
        Ok(Some(unsafe { block.map.as_mut_ptr().add(in_block) }))
    }

    pub fn random_read(&mut self, mut buf: &mut [u8], mut offset: u64) -> Result<(), MemError> {
        while !buf.is_empty() {
            let index = (offset / self.opt.block_size) as usize;
            self.ensure_mapped(index)?;
            let in_block = (offset % self.opt.block_size) as usize;
            let block = self.blocks[index].as_ref().unwrap();
            let avail = self.opt.block_size as usize - in_block;
            let n = avail.min(buf.len());
            buf[..n].copy_from_slice(&block.map[in_block..in_block + n]);
            buf = &mut buf[n..];
            offset += n as u64;
        }
        Ok(())
    }

    pub fn random_write(&mut self, mut buf: &[u8], mut offset: u64) -> Result<(), MemError> {
        while !buf.is_empty() {
            let index = (offset / self.opt.block_size) as usize;
            self.ensure_mapped(index)?;
            let in_block = (offset % self.opt.block_size) as usize;
            let block = self.blocks[index].as_mut().unwrap();
            let avail = self.opt.block_size as usize - in_block;
            let n = avail.min(buf.len());
            block.map[in_block..in_block + n].copy_from_slice(&buf[..n]);
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }

    /// Drop clean pages of an already-freed range back to the OS (arena `purge` hook, §4.2).
    pub fn purge(&mut self, offset: u64, size: usize) -> Result<(), MemError> {
        let index = (offset / self.opt.block_size) as usize;
        if index >= self.blocks.len() {
            return Ok(());
        }
        if let Some(block) = &self.blocks[index] {
            let in_block = (offset % self.opt.block_size) as usize;
            let len = size.min(self.opt.block_size as usize - in_block);
            let _ = block.map.advise_range(memmap2::Advice::DontNeed, in_block, len);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(dir: &std::path::Path) -> BlockPool {
        BlockPool::open(BlockPoolOptions {
            dir: dir.to_path_buf(),
            prefix: "_mabain_t",
            block_size: 4096,
            max_blocks: 4,
            writable: true,
        })
        .unwrap()
    }

    #[test]
    fn reserve_does_not_straddle_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool(dir.path());

        let (offset, ptr) = pool.reserve(4090, 13).unwrap();
        assert_eq!(offset, 4096);
        assert!(ptr.is_some());
    }

    #[test]
    fn write_then_read_roundtrips_across_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool(dir.path());

        let data = vec![0xABu8; 8192];
        pool.random_write(&data, 4000).unwrap();

        let mut out = vec![0u8; 8192];
        pool.random_read(&mut out, 4000).unwrap();
        assert_eq!(out, data);
    }
}
