//! The value layer (spec §4.4): data records, Add/Remove/RemoveAll on top of [`DictMem`].
use crate::error::{MBError, MBResult};
use crate::header::{ExcepStatus, HeaderPage, MAX_DATA_SIZE, MAX_KEY_LENGTH};
use crate::trie::{DictMem, EdgePtrs};
use mabain_mem::Allocator;
use std::sync::atomic::Ordering;

const NODE_FLAG_MATCH: u8 = 0x01;

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// `bytes 0..1 length, 2..3 bucket index, 4.. value` (spec §3.1).
fn encode_record(bucket_index: u16, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + value.len());
    buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
    buf.extend_from_slice(&bucket_index.to_le_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Sits on top of [`DictMem`] (index segment) and a data-segment allocator.
pub struct Dict<AI: Allocator, AD: Allocator> {
    trie: DictMem<AI>,
    data: AD,
}

impl<AI: Allocator, AD: Allocator> Dict<AI, AD> {
    pub fn new(trie: DictMem<AI>, data: AD) -> Self {
        Dict { trie, data }
    }

    pub fn trie(&self) -> &DictMem<AI> {
        &self.trie
    }

    pub fn trie_mut(&mut self) -> &mut DictMem<AI> {
        &mut self.trie
    }

    pub fn data(&self) -> &AD {
        &self.data
    }

    /// Unwrap into the owned index/data halves, e.g. to hand a freshly-built replacement off to
    /// the resource collector's publish step.
    pub fn into_parts(self) -> (DictMem<AI>, AD) {
        (self.trie, self.data)
    }

    fn reserve_data(&mut self, value: &[u8], bucket_index: u16) -> MBResult<u64> {
        if value.len() > MAX_DATA_SIZE {
            return Err(MBError::OutOfBound);
        }
        let record = encode_record(bucket_index, value);
        let off = self.data.reserve(record.len())?;
        self.data
            .pool_mut()
            .random_write(&record, off)
            .map_err(|_| MBError::WriteError)?;
        Ok(off)
    }

    fn free_data(&mut self, header: &HeaderPage, off: u64) -> MBResult<()> {
        let mut len_buf = [0u8; 2];
        self.data
            .pool_mut()
            .random_read(&mut len_buf, off)
            .map_err(|_| MBError::ReadError)?;
        let total = 4 + u16::from_le_bytes(len_buf) as usize;
        let reclaimed = self.data.release(off, total);
        header.pending_data_buff_size.fetch_add(reclaimed, Ordering::Relaxed);
        Ok(())
    }

    /// Read the value bytes stored at a data offset.
    pub fn read_value(&mut self, off: u64) -> MBResult<Vec<u8>> {
        let mut header = [0u8; 4];
        self.data
            .pool_mut()
            .random_read(&mut header, off)
            .map_err(|_| MBError::ReadError)?;
        let len = u16::from_le_bytes([header[0], header[1]]) as usize;
        let mut value = vec![0u8; len];
        self.data
            .pool_mut()
            .random_read(&mut value, off + 4)
            .map_err(|_| MBError::ReadError)?;
        Ok(value)
    }

    pub fn bucket_index(&mut self, off: u64) -> MBResult<u16> {
        let mut header = [0u8; 4];
        self.data
            .pool_mut()
            .random_read(&mut header, off)
            .map_err(|_| MBError::ReadError)?;
        Ok(u16::from_le_bytes([header[2], header[3]]))
    }

    /// **Add** (spec §4.4).
    pub fn add(&mut self, header: &HeaderPage, key: &[u8], value: &[u8], overwrite: bool) -> MBResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(MBError::OutOfBound);
        }
        let bucket = header.eviction_bucket_index.load(Ordering::Relaxed);
        let first_byte = key[0];
        let mut edge_ptrs = self.trie.get_root_edge(0, first_byte)?;

        if edge_ptrs.edge.is_empty() {
            let off = self.reserve_data(value, bucket)?;
            self.trie.add_root_edge(header, first_byte, &key[1..], off)?;
            header.count.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let mut remaining = &key[1..];
        loop {
            let edge = edge_ptrs.edge;
            let tail = self.trie.read_tail(&edge)?;
            let common = common_prefix_len(&tail, remaining);

            if common == tail.len() && common == remaining.len() {
                let created = self.update_data_buffer(header, &edge_ptrs, bucket, value, overwrite)?;
                if created {
                    header.count.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(());
            }

            if common < tail.len() && common < remaining.len() {
                let off = self.reserve_data(value, bucket)?;
                self.trie.add_link(header, &edge_ptrs, (common + 1) as u8, &remaining[common..], off)?;
                header.count.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            if common == remaining.len() && common < tail.len() {
                let off = self.reserve_data(value, bucket)?;
                self.trie.insert_node(header, &edge_ptrs, (common + 1) as u8, off)?;
                header.count.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            // common == tail.len() < remaining.len(): label consumed exactly, more key remains.
            remaining = &remaining[tail.len()..];

            if edge.data_off {
                let off = self.reserve_data(value, bucket)?;
                self.trie.promote_leaf_to_node(header, &edge_ptrs, remaining, off)?;
                header.count.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            let node_offset = edge.child;
            let next_byte = remaining[0];
            match self.trie.find_next(node_offset, next_byte)? {
                Some(next) => {
                    edge_ptrs = next;
                    remaining = &remaining[1..];
                }
                None => {
                    let off = self.reserve_data(value, bucket)?;
                    self.trie.update_node(header, &edge_ptrs, remaining, off)?;
                    header.count.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
        }
    }

    /// The overwrite / promote-to-MATCH transitions (spec §4.4).
    fn update_data_buffer(&mut self, header: &HeaderPage, edge_ptrs: &EdgePtrs, bucket: u16, value: &[u8], overwrite: bool) -> MBResult<bool> {
        if edge_ptrs.edge.data_off {
            if !overwrite {
                return Err(MBError::InDict);
            }
            let old = edge_ptrs.edge.child;
            let new_off = self.reserve_data(value, bucket)?;
            self.free_data(header, old)?;
            self.trie.write_edge_data_off_guarded(header, edge_ptrs.edge_offset, new_off)?;
            return Ok(false);
        }

        let node_offset = edge_ptrs.edge.child;
        match self.trie.node_match(node_offset)? {
            Some(old) => {
                if !overwrite {
                    return Err(MBError::InDict);
                }
                let new_off = self.reserve_data(value, bucket)?;
                self.free_data(header, old)?;
                self.trie.set_node_match(header, node_offset, new_off)?;
                Ok(false)
            }
            None => {
                let new_off = self.reserve_data(value, bucket)?;
                self.trie.set_node_match(header, node_offset, new_off)?;
                Ok(true)
            }
        }
    }

    /// **Remove** (spec §4.4).
    pub fn remove(&mut self, header: &HeaderPage, key: &[u8]) -> MBResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(MBError::OutOfBound);
        }
        let first_byte = key[0];
        let mut path = vec![self.trie.get_root_edge(0, first_byte)?];
        if path[0].edge.is_empty() {
            return Err(MBError::NotExist);
        }

        let mut remaining = &key[1..];
        loop {
            let edge_ptrs = *path.last().unwrap();
            let edge = edge_ptrs.edge;
            let tail = self.trie.read_tail(&edge)?;
            let common = common_prefix_len(&tail, remaining);

            if common == tail.len() && common == remaining.len() {
                break;
            }
            if common < tail.len() {
                return Err(MBError::NotExist);
            }

            remaining = &remaining[tail.len()..];
            if edge.data_off {
                return Err(MBError::NotExist);
            }

            let node_offset = edge.child;
            let next_byte = remaining[0];
            match self.trie.find_next(node_offset, next_byte)? {
                Some(next) => {
                    path.push(next);
                    remaining = &remaining[1..];
                }
                None => return Err(MBError::NotExist),
            }
        }

        let target = *path.last().unwrap();

        if !target.edge.data_off {
            // Non-leaf match: key ends at an internal node. Clear MATCH, keep structure.
            let node_offset = target.edge.child;
            let old = self.trie.clear_node_match(header, node_offset)?;
            if old == 0 {
                return Err(MBError::NotExist);
            }
            self.free_data(header, old)?;
            header.count.fetch_sub(1, Ordering::Relaxed);
            return Ok(());
        }

        self.free_data(header, target.edge.child)?;
        let grandparent = if path.len() >= 2 { Some(path[path.len() - 2]) } else { None };
        let relocated = self.trie.remove_edge(header, grandparent.as_ref(), &target)?;
        header.count.fetch_sub(1, Ordering::Relaxed);

        if let (Some(new_node_offset), Some(grandparent)) = (relocated, grandparent) {
            let (new_nt, is_match) = self.trie.node_child_count(new_node_offset)?;
            if new_nt == 0 && !is_match {
                self.trie.collapse_single_child(header, new_node_offset, &grandparent)?;
            }
        }

        Ok(())
    }

    /// **RemoveAll** (spec §4.4): free-list mode resets the root and both segments to empty.
    pub fn remove_all(&mut self, header: &HeaderPage) -> MBResult<()> {
        self.trie.init_root()?;
        header.count.store(0, Ordering::Relaxed);
        header.m_data_offset.store(crate::header::DATA_HEADER_SIZE, Ordering::Relaxed);
        header.pending_index_buff_size.store(0, Ordering::Relaxed);
        header.pending_data_buff_size.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// **ExceptionRecovery** (spec §4.10): on reopen, replay the single staged mutation exactly
    /// once using `excep_buff`/`excep_offset`/`excep_lf_offset`, then reset the rc-root bookkeeping.
    /// A no-op when `excep_updating_status` is already `None`.
    pub fn recover_from_exception(&mut self, header: &HeaderPage) -> MBResult<()> {
        let raw = header.excep_updating_status.load(Ordering::Acquire);
        let status = ExcepStatus::from_u32(raw).ok_or(MBError::Corruption)?;

        if status == ExcepStatus::None {
            return Ok(());
        }
        #[cfg(feature = "tracing")]
        tracing::warn!(?status, "replaying staged mutation from exception slot");

        let buff = header.excep_buff_snapshot();
        let excep_offset = header.excep_offset.load(Ordering::Relaxed);
        let excep_lf_offset = header.excep_lf_offset.load(Ordering::Relaxed);
        let pool = self.trie.alloc_mut().pool_mut();

        match status {
            ExcepStatus::None => unreachable!("handled by the early return above"),
            ExcepStatus::AddEdge => {
                pool.random_write(&buff[0..13], excep_lf_offset).map_err(|_| MBError::WriteError)?;
                header.count.fetch_add(1, Ordering::Relaxed);
            }
            ExcepStatus::AddDataOff => {
                pool.random_write(&buff[0..6], excep_lf_offset + 7).map_err(|_| MBError::WriteError)?;
            }
            ExcepStatus::AddNode => {
                pool.random_write(&buff[0..8], excep_offset).map_err(|_| MBError::WriteError)?;
                if buff[0] & NODE_FLAG_MATCH != 0 {
                    header.count.fetch_add(1, Ordering::Relaxed);
                }
            }
            ExcepStatus::RemoveEdge => {
                pool.random_write(&buff[0..13], excep_lf_offset).map_err(|_| MBError::WriteError)?;
            }
            ExcepStatus::ClearEdge => {
                pool.random_write(&[0u8; 13], excep_lf_offset).map_err(|_| MBError::WriteError)?;
                header.count.fetch_sub(1, Ordering::Relaxed);
            }
            ExcepStatus::RcNode => {
                let mut idx_bytes = [0u8; 8];
                idx_bytes[0..6].copy_from_slice(&buff[0..6]);
                let mut data_bytes = [0u8; 8];
                data_bytes[0..6].copy_from_slice(&buff[6..12]);
                header.m_index_offset.store(u64::from_le_bytes(idx_bytes), Ordering::Relaxed);
                header.m_data_offset.store(u64::from_le_bytes(data_bytes), Ordering::Relaxed);
            }
            // Never staged by this crate's single-pass rc (see rc.rs), but still valid
            // `excep_updating_status` values a header could carry; nothing more to replay beyond
            // the rc-root reset below.
            ExcepStatus::RcData | ExcepStatus::RcEdgeStr => {}
        }

        header.excep_updating_status.store(ExcepStatus::None as u32, Ordering::Relaxed);
        header.rc_root_offset.store(0, Ordering::Relaxed);
        header.rc_m_index_off_pre.store(0, Ordering::Relaxed);
        header.rc_m_data_off_pre.store(0, Ordering::Relaxed);
        header.rc_count.store(0, Ordering::Relaxed);
        Ok(())
    }
}
