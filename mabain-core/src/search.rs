//! Read-only traversal: exact find, longest/all prefix match, lower bound (spec §4.5).
use crate::dict::Dict;
use crate::error::{MBError, MBResult};
use crate::header::HeaderPage;
use crate::lockfree::{retry, ReadOutcome, ReaderGuard};
use crate::prefix_cache::with_thread_cache;
use crate::trie::{Edge, EdgePtrs};
use mabain_mem::Allocator;
use std::sync::atomic::Ordering;

/// Guards against pathological cycles from on-disk corruption (spec §4.5.1).
const FIND_TRAVERSAL_LIMIT: usize = 4096;

/// Per-thread prefix cache shape (spec §4.8): first 4 key bytes, 256 buckets, 4-way.
const PREFIX_CACHE_N: usize = 4;
const PREFIX_CACHE_BUCKETS: usize = 256;
const PREFIX_CACHE_WAYS: usize = 4;

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Read-only orchestration over a [`Dict`]; holds no state of its own beyond the header reference.
pub struct SearchEngine<'h> {
    header: &'h HeaderPage,
}

impl<'h> SearchEngine<'h> {
    pub fn new(header: &'h HeaderPage) -> Self {
        SearchEngine { header }
    }

    fn guarded_root_edge<AI: Allocator, AD: Allocator>(
        &self,
        dict: &mut Dict<AI, AD>,
        root: u64,
        first_byte: u8,
    ) -> MBResult<EdgePtrs> {
        retry(|| {
            let guard = ReaderGuard::snapshot(self.header);
            let edge_ptrs = dict.trie_mut().get_root_edge(root, first_byte)?;
            let edge_offset = edge_ptrs.edge_offset;
            match guard.validate(
                edge_offset,
                || edge_ptrs,
                |status, buff| reconstruct_edge(edge_ptrs, status, &buff),
            )? {
                ReadOutcome::Ok(e) | ReadOutcome::Saved(e) => Ok(e),
            }
        })
    }

    /// Root-edge lookup for the exact-find hot path (spec §4.5.1): when no writer is active the
    /// trie cannot change under us, so a per-thread cache hit can stand in for the lock-free
    /// guarded read entirely; otherwise fall back to the guarded path and skip the cache, since
    /// validating a cached entry against a live writer needs the same guard anyway.
    fn root_edge_for<AI: Allocator, AD: Allocator>(
        &self,
        dict: &mut Dict<AI, AD>,
        root: u64,
        key: &[u8],
    ) -> MBResult<EdgePtrs> {
        if root != 0 || self.header.num_writer.load(Ordering::Acquire) != 0 {
            return self.guarded_root_edge(dict, root, key[0]);
        }
        if let Some(cached) = with_thread_cache(PREFIX_CACHE_N, PREFIX_CACHE_BUCKETS, PREFIX_CACHE_WAYS, |c| c.lookup(key)) {
            return Ok(cached);
        }
        let ptrs = dict.trie_mut().get_root_edge(root, key[0])?;
        with_thread_cache(PREFIX_CACHE_N, PREFIX_CACHE_BUCKETS, PREFIX_CACHE_WAYS, |c| c.insert(key, &ptrs));
        Ok(ptrs)
    }

    fn guarded_find_next<AI: Allocator, AD: Allocator>(
        &self,
        dict: &mut Dict<AI, AD>,
        node_offset: u64,
        c: u8,
    ) -> MBResult<Option<EdgePtrs>> {
        retry(|| {
            let guard = ReaderGuard::snapshot(self.header);
            let found = dict.trie_mut().find_next(node_offset, c)?;
            let Some(edge_ptrs) = found else { return Ok(None) };
            let edge_offset = edge_ptrs.edge_offset;
            match guard.validate(
                edge_offset,
                || edge_ptrs,
                |status, buff| reconstruct_edge(edge_ptrs, status, &buff),
            )? {
                ReadOutcome::Ok(e) | ReadOutcome::Saved(e) => Ok(Some(e)),
            }
        })
    }

    /// **find** (spec §4.5.1): rc-root first, falling back to the main root.
    pub fn find<AI: Allocator, AD: Allocator>(&self, dict: &mut Dict<AI, AD>, key: &[u8]) -> MBResult<Vec<u8>> {
        let rc_root = self.header.rc_root_offset.load(Ordering::Acquire);
        if rc_root != 0 {
            match self.find_internal(dict, rc_root, key) {
                Ok(v) => return Ok(v),
                Err(MBError::NotExist) => {}
                Err(e) => return Err(e),
            }
        }
        self.find_internal(dict, 0, key)
    }

    fn find_internal<AI: Allocator, AD: Allocator>(&self, dict: &mut Dict<AI, AD>, root: u64, key: &[u8]) -> MBResult<Vec<u8>> {
        if key.is_empty() {
            return Err(MBError::InvalidArg);
        }
        let mut edge_ptrs = self.root_edge_for(dict, root, key)?;
        if edge_ptrs.edge.is_empty() {
            return Err(MBError::NotExist);
        }

        let mut remaining = &key[1..];
        for _ in 0..FIND_TRAVERSAL_LIMIT {
            let edge = edge_ptrs.edge;
            let tail = dict.trie_mut().read_tail(&edge)?;
            let common = common_prefix_len(&tail, remaining);

            if common < tail.len() {
                return Err(MBError::NotExist);
            }
            if common == tail.len() && common == remaining.len() {
                if edge.data_off {
                    return dict.read_value(edge.child);
                }
                return match dict.trie_mut().node_match_guarded(self.header, edge.child)? {
                    Some(off) => dict.read_value(off),
                    None => Err(MBError::NotExist),
                };
            }

            remaining = &remaining[tail.len()..];
            if edge.data_off {
                return Err(MBError::NotExist);
            }

            match self.guarded_find_next(dict, edge.child, remaining[0])? {
                Some(next) => {
                    edge_ptrs = next;
                    remaining = &remaining[1..];
                }
                None => return Err(MBError::NotExist),
            }
        }
        Err(MBError::OutOfBound)
    }

    /// **findPrefix** (spec §4.5.2): the deepest MATCH encountered along the key's path.
    pub fn find_longest_prefix<AI: Allocator, AD: Allocator>(
        &self,
        dict: &mut Dict<AI, AD>,
        key: &[u8],
    ) -> MBResult<(Vec<u8>, Vec<u8>)> {
        let rc_root = self.header.rc_root_offset.load(Ordering::Acquire);
        let mut best = self.find_prefix_internal(dict, 0, key)?;
        if rc_root != 0 {
            if let Ok(alt) = self.find_prefix_internal(dict, rc_root, key) {
                if best.as_ref().map_or(true, |(k, _)| alt.0.len() > k.len()) {
                    best = Some(alt);
                }
            }
        }
        best.map(|(k, v)| (k, v)).ok_or(MBError::NotExist)
    }

    fn find_prefix_internal<AI: Allocator, AD: Allocator>(
        &self,
        dict: &mut Dict<AI, AD>,
        root: u64,
        key: &[u8],
    ) -> MBResult<Option<(Vec<u8>, Vec<u8>)>> {
        if key.is_empty() {
            return Ok(None);
        }
        let mut edge_ptrs = self.guarded_root_edge(dict, root, key[0])?;
        if edge_ptrs.edge.is_empty() {
            return Ok(None);
        }

        let mut consumed = vec![key[0]];
        let mut remaining = &key[1..];
        let mut best: Option<Vec<u8>> = None;

        for _ in 0..FIND_TRAVERSAL_LIMIT {
            let edge = edge_ptrs.edge;
            let tail = dict.trie_mut().read_tail(&edge)?;
            let common = common_prefix_len(&tail, remaining);
            consumed.extend_from_slice(&tail[..common]);

            if common < tail.len() {
                break;
            }
            remaining = &remaining[tail.len()..];

            if edge.data_off {
                if remaining.is_empty() {
                    best = Some(consumed.clone());
                }
                break;
            }

            if let Some(_off) = dict.trie_mut().node_match_guarded(self.header, edge.child)? {
                best = Some(consumed.clone());
            }
            if remaining.is_empty() {
                break;
            }

            match self.guarded_find_next(dict, edge.child, remaining[0])? {
                Some(next) => {
                    consumed.push(remaining[0]);
                    edge_ptrs = next;
                    remaining = &remaining[1..];
                }
                None => break,
            }
        }

        let Some(matched_key) = best else { return Ok(None) };
        let value = self.find_internal(dict, root, &matched_key)?;
        Ok(Some((matched_key, value)))
    }

    /// Every ancestor MATCH along `key`'s path, shortest prefix first (spec §4.5.2, the iterated
    /// variant backing the public `find_prefix`). rc-root and main-root results are merged,
    /// de-duplicated by key, then sorted by length.
    pub fn find_all_prefixes<AI: Allocator, AD: Allocator>(
        &self,
        dict: &mut Dict<AI, AD>,
        key: &[u8],
    ) -> MBResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = self.all_prefixes_internal(dict, 0, key)?;
        let rc_root = self.header.rc_root_offset.load(Ordering::Acquire);
        if rc_root != 0 {
            for (k, v) in self.all_prefixes_internal(dict, rc_root, key)? {
                if !out.iter().any(|(existing, _)| *existing == k) {
                    out.push((k, v));
                }
            }
        }
        out.sort_by_key(|(k, _)| k.len());
        Ok(out)
    }

    fn all_prefixes_internal<AI: Allocator, AD: Allocator>(
        &self,
        dict: &mut Dict<AI, AD>,
        root: u64,
        key: &[u8],
    ) -> MBResult<Vec<(Vec<u8>, Vec<u8>)>> {
        if key.is_empty() {
            return Ok(Vec::new());
        }
        let mut edge_ptrs = self.guarded_root_edge(dict, root, key[0])?;
        if edge_ptrs.edge.is_empty() {
            return Ok(Vec::new());
        }

        let mut consumed = vec![key[0]];
        let mut remaining = &key[1..];
        let mut matches = Vec::new();

        for _ in 0..FIND_TRAVERSAL_LIMIT {
            let edge = edge_ptrs.edge;
            let tail = dict.trie_mut().read_tail(&edge)?;
            let common = common_prefix_len(&tail, remaining);
            consumed.extend_from_slice(&tail[..common]);

            if common < tail.len() {
                break;
            }
            remaining = &remaining[tail.len()..];

            if edge.data_off {
                if remaining.is_empty() {
                    matches.push(consumed.clone());
                }
                break;
            }

            if dict.trie_mut().node_match_guarded(self.header, edge.child)?.is_some() {
                matches.push(consumed.clone());
            }
            if remaining.is_empty() {
                break;
            }

            match self.guarded_find_next(dict, edge.child, remaining[0])? {
                Some(next) => {
                    consumed.push(remaining[0]);
                    edge_ptrs = next;
                    remaining = &remaining[1..];
                }
                None => break,
            }
        }

        let mut out = Vec::with_capacity(matches.len());
        for matched_key in matches {
            let value = self.find_internal(dict, root, &matched_key)?;
            out.push((matched_key, value));
        }
        Ok(out)
    }

    /// **lowerBound** (spec §4.5.3): the largest key ≤ `key`, byte-lex.
    ///
    /// Walks the same path as `find`, remembering the best "less-than" candidate seen at each
    /// divergence; on mismatch or exhaustion it descends that candidate's subtree along its
    /// rightmost path rather than re-deriving it from a saved raw-byte snapshot.
    pub fn find_lower_bound<AI: Allocator, AD: Allocator>(
        &self,
        dict: &mut Dict<AI, AD>,
        key: &[u8],
    ) -> MBResult<(Vec<u8>, Vec<u8>)> {
        if key.is_empty() {
            return Err(MBError::InvalidArg);
        }

        let mut candidate: Option<Vec<u8>> = None;
        for b in (0..key[0]).rev() {
            let edge_ptrs = self.guarded_root_edge(dict, 0, b)?;
            if !edge_ptrs.edge.is_empty() {
                candidate = Some(vec![b]);
                break;
            }
        }

        let mut edge_ptrs = self.guarded_root_edge(dict, 0, key[0])?;
        let mut consumed = vec![key[0]];
        let mut remaining = &key[1..];
        let mut exact_path_alive = !edge_ptrs.edge.is_empty();

        if exact_path_alive {
            for _ in 0..FIND_TRAVERSAL_LIMIT {
                let edge = edge_ptrs.edge;
                let tail = dict.trie_mut().read_tail(&edge)?;
                let common = common_prefix_len(&tail, remaining);

                if common < tail.len() {
                    if common < remaining.len() && tail[common] < remaining[common] {
                        let mut c = consumed.clone();
                        c.extend_from_slice(&tail);
                        candidate = if edge.data_off {
                            Some(c)
                        } else {
                            self.rightmost_under(dict, edge.child, &c)?.or(candidate)
                        };
                    }
                    exact_path_alive = false;
                    break;
                }

                consumed.extend_from_slice(&tail);
                remaining = &remaining[tail.len()..];

                if edge.data_off {
                    if remaining.is_empty() {
                        return Ok((consumed.clone(), dict.read_value(edge.child)?));
                    }
                    exact_path_alive = false;
                    break;
                }

                if remaining.is_empty() {
                    if let Some(off) = dict.trie_mut().node_match_guarded(self.header, edge.child)? {
                        return Ok((consumed.clone(), dict.read_value(off)?));
                    }
                    candidate = self.rightmost_under(dict, edge.child, &consumed)?.or(candidate);
                    exact_path_alive = false;
                    break;
                }

                let next_byte = remaining[0];
                for b in (0..next_byte).rev() {
                    if let Some(sib) = self.guarded_find_next(dict, edge.child, b)? {
                        let mut c = consumed.clone();
                        c.push(b);
                        let sib_tail = dict.trie_mut().read_tail(&sib.edge)?;
                        c.extend_from_slice(&sib_tail);
                        candidate = if sib.edge.data_off {
                            Some(c)
                        } else {
                            self.rightmost_under(dict, sib.edge.child, &c)?.or(Some(c))
                        };
                        break;
                    }
                }

                match self.guarded_find_next(dict, edge.child, next_byte)? {
                    Some(next) => {
                        edge_ptrs = next;
                        consumed.push(next_byte);
                        remaining = &remaining[1..];
                    }
                    None => {
                        exact_path_alive = false;
                        break;
                    }
                }
            }
        }

        let Some(bound_key) = candidate else { return Err(MBError::NotExist) };
        let value = self.find_internal(dict, 0, &bound_key)?;
        Ok((bound_key, value))
    }

    /// Descend the rightmost (largest first-byte) path under `node_offset`, used to resolve a
    /// lower-bound candidate into its actual largest key (spec §4.5.3, `NextMaxEdge`).
    fn rightmost_under<AI: Allocator, AD: Allocator>(
        &self,
        dict: &mut Dict<AI, AD>,
        node_offset: u64,
        prefix: &[u8],
    ) -> MBResult<Option<Vec<u8>>> {
        let mut key = prefix.to_vec();
        let mut node = node_offset;
        for _ in 0..FIND_TRAVERSAL_LIMIT {
            let children = dict.trie_mut().children(node)?;
            let Some((first_byte, edge)) = children.into_iter().max_by_key(|(b, _)| *b) else {
                return Ok(Some(key));
            };
            key.push(first_byte);
            let tail = dict.trie_mut().read_tail(&edge)?;
            key.extend_from_slice(&tail);
            if edge.data_off {
                return Ok(Some(key));
            }
            node = edge.child;
        }
        Ok(Some(key))
    }
}

/// Reconstruct an edge from the exception buffer for the "writer is mid-mutation on exactly this
/// edge" case (spec §4.6 step 4). `AddEdge`/`AddNode`/`ClearEdge`/`RemoveEdge` all republish a
/// full 13-byte edge (filling an empty slot, retargeting to a freshly split node, zeroing a
/// removed slot, and a shrunk node's relocated pointer, respectively); only `AddDataOff` patches
/// the 6-byte child-offset sub-field in place. The `Rc*` statuses don't touch an edge slot, so
/// there's nothing to splice.
fn reconstruct_edge(pre: EdgePtrs, status: crate::header::ExcepStatus, buff: &[u8; 16]) -> EdgePtrs {
    use crate::header::ExcepStatus::*;
    let mut bytes = pre.edge.encode();
    match status {
        AddEdge | AddNode | ClearEdge | RemoveEdge => bytes.copy_from_slice(&buff[0..13]),
        AddDataOff => bytes[7..13].copy_from_slice(&buff[0..6]),
        _ => {}
    }
    EdgePtrs { edge: Edge::decode(&bytes), ..pre }
}
