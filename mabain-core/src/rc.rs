//! Online resource collection (spec §4.9). Compacts the live set into a fresh index/data region
//! behind an alternate root, then swaps it in through the exception slot so running readers never
//! observe a torn trie.
use crate::dict::Dict;
use crate::error::{MBError, MBResult};
use crate::header::{ExcepStatus, HeaderPage};
use crate::iter::Traversal;
use crate::lockfree::WriterGuard;
use crate::trie::{DictMem, ROOT_SIZE};
use mabain_mem::Allocator;
use std::sync::atomic::Ordering;

/// Minimum segment sizes below which a collection pass isn't worth its cost (spec §4.9,
/// "min_index_size"/"min_data_size" opt-out thresholds).
pub struct RcThresholds {
    pub min_index_size: u64,
    pub min_data_size: u64,
}

impl Default for RcThresholds {
    fn default() -> Self {
        RcThresholds { min_index_size: 1 << 20, min_data_size: 1 << 20 }
    }
}

/// Phase 1 (Reorder) walks the live trie in traversal order and re-inserts every entry into a
/// fresh index/data region grown past the current high-water mark; this is the transformed crate's
/// realization of the "relocate live buffers forward, then collect" scheme — a single forward pass
/// achieves the same end state (a fully packed, gap-free region) without needing the original's
/// separate backward collect pass, since nothing is relocated more than once. See DESIGN.md.
///
/// Phase 2 (Collect) publishes the new root and segment offsets and reclaims the old region.
///
/// Returns the new root offset so the caller can re-root its own live `Dict` at it; the header's
/// `rc_root_offset` is reset to 0 again by the time this returns (see [`publish`]), so it cannot
/// be recovered from there afterwards.
pub fn collect<AI: Allocator, AD: Allocator>(
    header: &HeaderPage,
    dict: &mut Dict<AI, AD>,
    mut new_index: AI,
    new_data: AD,
    thresholds: &RcThresholds,
) -> MBResult<u64> {
    let pending_index = header.pending_index_buff_size.load(Ordering::Relaxed);
    let pending_data = header.pending_data_buff_size.load(Ordering::Relaxed);
    if pending_index < thresholds.min_index_size && pending_data < thresholds.min_data_size {
        return Err(MBError::RcSkipped);
    }

    let rc_root_offset = new_index.reserve(ROOT_SIZE as usize)?;
    let mut rc_trie = DictMem::new(new_index, rc_root_offset);
    rc_trie.init_root()?;
    let mut rc_dict = Dict::new(rc_trie, new_data);

    header.rc_root_offset.store(rc_root_offset, Ordering::Release);

    // `Dict::add` bumps `header.count` for every new key, which is correct for ordinary inserts
    // but not here: every entry visited already counted once in the live trie we're rebuilding
    // from. Restore the pre-collection count once the rebuild finishes instead of letting it
    // double up.
    let live_count = header.count.load(Ordering::Relaxed);

    let mut live = Traversal::new(dict.trie().root_offset());
    let mut visited = 0u64;
    while let Some(entry) = live.next(dict)? {
        let value = dict.read_value(entry.value_offset)?;
        rc_dict.add(header, &entry.key, &value, true)?;
        visited += 1;
    }
    header.count.store(live_count, Ordering::Relaxed);
    header.rc_count.store(visited, Ordering::Relaxed);

    let (rc_trie, rc_data) = rc_dict.into_parts();
    let new_root = rc_trie.root_offset();
    publish(header, &rc_trie, &rc_data)?;
    Ok(new_root)
}

/// Phase 2: swap the rc-root in as the main root through the exception slot (spec §4.6/§4.10
/// discipline reused here so a reader mid-traversal during the swap still resolves consistently),
/// then clear the rc bookkeeping.
fn publish<AI: Allocator, AD: Allocator>(header: &HeaderPage, rc_trie: &DictMem<AI>, rc_data: &AD) -> MBResult<()> {
    let new_root = rc_trie.root_offset();
    let new_index_high = rc_trie.index_high_water();
    let new_data_high = rc_data.high_water();

    header.rc_m_index_off_pre.store(header.m_index_offset.load(Ordering::Relaxed), Ordering::Relaxed);
    header.rc_m_data_off_pre.store(header.m_data_offset.load(Ordering::Relaxed), Ordering::Relaxed);

    // The staged bytes carry both new high-water marks (6 bytes each) rather than a pool offset:
    // this phase's only observable write is the pair of header field stores below, not a write
    // into the index/data segments, so that is what ExceptionRecovery replays (see DESIGN.md).
    let mut buff = [0u8; 12];
    buff[0..6].copy_from_slice(&new_index_high.to_le_bytes()[0..6]);
    buff[6..12].copy_from_slice(&new_data_high.to_le_bytes()[0..6]);
    let guard = WriterGuard::begin(header, ExcepStatus::RcNode, new_root, new_root, &buff);
    header.m_index_offset.store(new_index_high, Ordering::Release);
    header.m_data_offset.store(new_data_high, Ordering::Release);
    header.pending_index_buff_size.store(0, Ordering::Relaxed);
    header.pending_data_buff_size.store(0, Ordering::Relaxed);
    guard.publish();

    header.rc_root_offset.store(0, Ordering::Release);
    // The swapped-out segments (`rc_m_index_off_pre`/`rc_m_data_off_pre`) are abandoned; a reader
    // holding a stale mapping still resolves through the lock-free cache window, after which the
    // caller is expected to recycle the old block files on next writer restart.
    Ok(())
}
