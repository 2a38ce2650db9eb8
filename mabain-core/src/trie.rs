//! Trie memory (DictMem): node/edge encode-decode and the structural mutations Add/Remove need
//! (spec §4.3). Owns the index segment through an [`Allocator`].
use crate::error::{MBError, MBResult};
use crate::header::{ExcepStatus, HeaderPage, MAX_KEY_LENGTH};
use crate::lockfree::WriterGuard;
use core::sync::atomic::Ordering;
use mabain_mem::Allocator;

pub const EDGE_SIZE: usize = 13;
pub const NODE_HEADER_SIZE: usize = 8;
pub const ROOT_NT: u8 = 255;
pub const ROOT_SIZE: u64 = (NODE_HEADER_SIZE + 256 + 256 * EDGE_SIZE) as u64;

/// bit 0 of a node's flags byte.
const NODE_FLAG_MATCH: u8 = 0x01;
/// bit 1 of a node's flags byte: hint only, not relied on for correctness.
const NODE_FLAG_SORTED: u8 = 0x02;
/// bit 0 of an edge's flags byte: child offset is a data offset, not a node offset.
const EDGE_FLAG_DATA_OFF: u8 = 0x01;

fn node_size(nt: u8) -> usize {
    let children = nt as usize + 1;
    NODE_HEADER_SIZE + children + children * EDGE_SIZE
}

/// A decoded 13-byte edge (spec §3.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    /// `1 + label_tail_len`; 0 means the slot is empty.
    pub edge_len: u8,
    pub data_off: bool,
    pub tail: Tail,
    /// Interpreted as a data offset if `data_off`, else a child-node offset.
    pub child: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tail {
    /// Tail bytes stored inline, label length `len` (≤ 5).
    Inline([u8; 5]),
    /// A 5-byte offset into the index segment holding the overflowed tail bytes.
    Overflow(u64),
}

impl Edge {
    pub const EMPTY: Edge = Edge {
        edge_len: 0,
        data_off: false,
        tail: Tail::Inline([0; 5]),
        child: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.edge_len == 0
    }

    pub fn tail_len(&self) -> usize {
        self.edge_len.saturating_sub(1) as usize
    }

    pub fn encode(&self) -> [u8; EDGE_SIZE] {
        let mut buf = [0u8; EDGE_SIZE];
        if self.is_empty() {
            return buf;
        }
        match self.tail {
            Tail::Inline(bytes) => buf[0..5].copy_from_slice(&bytes),
            Tail::Overflow(off) => buf[0..5].copy_from_slice(&off.to_le_bytes()[0..5]),
        }
        buf[5] = self.edge_len;
        buf[6] = if self.data_off { EDGE_FLAG_DATA_OFF } else { 0 };
        buf[7..13].copy_from_slice(&self.child.to_le_bytes()[0..6]);
        buf
    }

    pub fn decode(buf: &[u8; EDGE_SIZE]) -> Edge {
        let edge_len = buf[5];
        if edge_len == 0 {
            return Edge::EMPTY;
        }
        let data_off = buf[6] & EDGE_FLAG_DATA_OFF != 0;
        let tail_len = edge_len as usize - 1;
        let tail = if tail_len > 5 {
            let mut off_bytes = [0u8; 8];
            off_bytes[0..5].copy_from_slice(&buf[0..5]);
            Tail::Overflow(u64::from_le_bytes(off_bytes))
        } else {
            let mut bytes = [0u8; 5];
            bytes.copy_from_slice(&buf[0..5]);
            Tail::Inline(bytes)
        };
        let mut child_bytes = [0u8; 8];
        child_bytes[0..6].copy_from_slice(&buf[7..13]);
        Edge {
            edge_len,
            data_off,
            tail,
            child: u64::from_le_bytes(child_bytes),
        }
    }
}

/// Address of one edge slot: which node it lives in, and its absolute byte offset.
#[derive(Clone, Copy, Debug)]
pub struct EdgePtrs {
    pub node_offset: u64,
    pub edge_offset: u64,
    pub first_byte: u8,
    pub edge: Edge,
}

/// Owns the index segment: node/edge reservation and the structural mutations.
pub struct DictMem<A: Allocator> {
    alloc: A,
    root_offset: u64,
}

impl<A: Allocator> DictMem<A> {
    pub fn new(alloc: A, root_offset: u64) -> Self {
        DictMem { alloc, root_offset }
    }

    pub fn root_offset(&self) -> u64 {
        self.root_offset
    }

    pub fn alloc(&self) -> &A {
        &self.alloc
    }

    pub fn alloc_mut(&mut self) -> &mut A {
        &mut self.alloc
    }

    pub fn index_high_water(&self) -> u64 {
        self.alloc.high_water()
    }

    /// Reserve and zero-initialize the 256-slot root node. Only called once, at DB creation.
    pub fn init_root(&mut self) -> MBResult<()> {
        let mut buf = vec![0u8; ROOT_SIZE as usize];
        buf[1] = ROOT_NT;
        self.alloc
            .pool_mut()
            .random_write(&buf, self.root_offset)
            .map_err(|_| MBError::WriteError)?;
        Ok(())
    }

    fn read_node_header(&mut self, node_offset: u64) -> MBResult<(u8, bool, u64)> {
        let mut buf = [0u8; NODE_HEADER_SIZE];
        self.alloc
            .pool_mut()
            .random_read(&mut buf, node_offset)
            .map_err(|_| MBError::ReadError)?;
        let is_match = buf[0] & NODE_FLAG_MATCH != 0;
        let nt = buf[1];
        let mut off_bytes = [0u8; 8];
        off_bytes[0..6].copy_from_slice(&buf[2..8]);
        Ok((nt, is_match, u64::from_le_bytes(off_bytes)))
    }

    fn write_node_header(&mut self, node_offset: u64, is_match: bool, nt: u8, data_off: u64) -> MBResult<()> {
        let mut buf = [0u8; NODE_HEADER_SIZE];
        buf[0] = if is_match { NODE_FLAG_MATCH } else { 0 } | NODE_FLAG_SORTED;
        buf[1] = nt;
        buf[2..8].copy_from_slice(&data_off.to_le_bytes()[0..6]);
        self.alloc
            .pool_mut()
            .random_write(&buf, node_offset)
            .map_err(|_| MBError::WriteError)?;
        Ok(())
    }

    fn first_byte_table(&mut self, node_offset: u64, nt: u8) -> MBResult<Vec<u8>> {
        let n = nt as usize + 1;
        let mut buf = vec![0u8; n];
        self.alloc
            .pool_mut()
            .random_read(&mut buf, node_offset + NODE_HEADER_SIZE as u64)
            .map_err(|_| MBError::ReadError)?;
        Ok(buf)
    }

    fn edge_at(&mut self, node_offset: u64, nt: u8, index: usize) -> MBResult<Edge> {
        let n = nt as usize + 1;
        let table_end = node_offset + NODE_HEADER_SIZE as u64 + n as u64;
        let edge_off = table_end + (index * EDGE_SIZE) as u64;
        let mut buf = [0u8; EDGE_SIZE];
        self.alloc
            .pool_mut()
            .random_read(&mut buf, edge_off)
            .map_err(|_| MBError::ReadError)?;
        Ok(Edge::decode(&buf))
    }

    fn edge_offset_of(&self, node_offset: u64, nt: u8, index: usize) -> u64 {
        let n = nt as usize + 1;
        node_offset + NODE_HEADER_SIZE as u64 + n as u64 + (index * EDGE_SIZE) as u64
    }

    /// `GetRootEdge` (spec §4.3). `rc_off = 0` means the main root.
    pub fn get_root_edge(&mut self, rc_off: u64, first_byte: u8) -> MBResult<EdgePtrs> {
        let root = if rc_off != 0 { rc_off } else { self.root_offset };
        let edge_off = root + NODE_HEADER_SIZE as u64 + 256 + u64::from(first_byte) * EDGE_SIZE as u64;
        let mut buf = [0u8; EDGE_SIZE];
        self.alloc
            .pool_mut()
            .random_read(&mut buf, edge_off)
            .map_err(|_| MBError::ReadError)?;
        Ok(EdgePtrs {
            node_offset: root,
            edge_offset: edge_off,
            first_byte,
            edge: Edge::decode(&buf),
        })
    }

    /// Read the label tail of an edge, resolving overflow storage if needed.
    pub fn read_tail(&mut self, edge: &Edge) -> MBResult<Vec<u8>> {
        let len = edge.tail_len();
        match edge.tail {
            Tail::Inline(bytes) => Ok(bytes[..len].to_vec()),
            Tail::Overflow(off) => {
                let mut buf = vec![0u8; len];
                self.alloc
                    .pool_mut()
                    .random_read(&mut buf, off)
                    .map_err(|_| MBError::ReadError)?;
                Ok(buf)
            }
        }
    }

    fn write_tail(&mut self, tail: &[u8]) -> MBResult<Tail> {
        if tail.len() <= 5 {
            let mut bytes = [0u8; 5];
            bytes[..tail.len()].copy_from_slice(tail);
            Ok(Tail::Inline(bytes))
        } else {
            let off = self.alloc.reserve(tail.len())?;
            self.alloc
                .pool_mut()
                .random_write(tail, off)
                .map_err(|_| MBError::WriteError)?;
            Ok(Tail::Overflow(off))
        }
    }

    fn free_tail(&mut self, header: &HeaderPage, edge: &Edge) {
        if let Tail::Overflow(off) = edge.tail {
            let reclaimed = self.alloc.release(off, edge.tail_len());
            header.pending_index_buff_size.fetch_add(reclaimed, Ordering::Relaxed);
        }
    }

    pub(crate) fn write_edge(&mut self, edge_offset: u64, edge: &Edge) -> MBResult<()> {
        self.alloc
            .pool_mut()
            .random_write(&edge.encode(), edge_offset)
            .map_err(|_| MBError::WriteError)
    }

    /// Republish a live, reader-visible edge slot through the exception slot (spec §4.6 steps
    /// 1-8): readers validate against exactly this offset via [`crate::lockfree::ReaderGuard`].
    /// Every structural mutation that changes what an already-reachable edge points to goes
    /// through this, not the bare [`Self::write_edge`].
    fn write_edge_guarded(&mut self, header: &HeaderPage, status: ExcepStatus, edge_offset: u64, edge: &Edge) -> MBResult<()> {
        let guard = WriterGuard::begin(header, status, edge_offset, edge_offset, &edge.encode());
        self.write_edge(edge_offset, edge)?;
        guard.publish();
        Ok(())
    }

    /// Patch only the 6-byte child-offset sub-field of an already-published leaf edge (spec §4.4
    /// `UpdateDataBuffer` leaf case, `EXCEP_STATUS_ADD_DATA_OFF`: "the exception buffer carries the
    /// new offset, `excep_lf_offset` is the edge offset"). Readers validate against `edge_offset`
    /// exactly as for a full edge write.
    pub(crate) fn write_edge_data_off_guarded(&mut self, header: &HeaderPage, edge_offset: u64, new_child: u64) -> MBResult<()> {
        let child_bytes = new_child.to_le_bytes();
        let guard = WriterGuard::begin(header, ExcepStatus::AddDataOff, edge_offset, edge_offset, &child_bytes[0..6]);
        self.alloc
            .pool_mut()
            .random_write(&child_bytes[0..6], edge_offset + 7)
            .map_err(|_| MBError::WriteError)?;
        guard.publish();
        Ok(())
    }

    /// Republish a node header through the exception slot (`EXCEP_STATUS_ADD_NODE`: "write
    /// `excep_buff[0..8]` to `excep_offset` (node header)"). The lock-free ring keys on
    /// `node_offset` exactly as it would on an edge offset, so a reader checking this node's MATCH
    /// bit mid-mutation gets the same saved-value treatment (spec §4.6 step 4 generalizes to any
    /// location the writer is mid-publish on, not only edge slots).
    fn write_node_header_guarded(&mut self, header: &HeaderPage, node_offset: u64, is_match: bool, nt: u8, data_off: u64) -> MBResult<()> {
        let mut buf = [0u8; NODE_HEADER_SIZE];
        buf[0] = if is_match { NODE_FLAG_MATCH } else { 0 } | NODE_FLAG_SORTED;
        buf[1] = nt;
        buf[2..8].copy_from_slice(&data_off.to_le_bytes()[0..6]);
        let guard = WriterGuard::begin(header, ExcepStatus::AddNode, node_offset, node_offset, &buf);
        self.write_node_header(node_offset, is_match, nt, data_off)?;
        guard.publish();
        Ok(())
    }

    /// `FindNext` (spec §4.3): scan `node_offset`'s first-byte table for `c`.
    pub fn find_next(&mut self, node_offset: u64, c: u8) -> MBResult<Option<EdgePtrs>> {
        let (nt, _is_match, _data_off) = self.read_node_header(node_offset)?;
        let table = self.first_byte_table(node_offset, nt)?;
        for (index, &byte) in table.iter().enumerate() {
            if byte == c {
                let edge = self.edge_at(node_offset, nt, index)?;
                if edge.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(EdgePtrs {
                    node_offset,
                    edge_offset: self.edge_offset_of(node_offset, nt, index),
                    first_byte: c,
                    edge,
                }));
            }
        }
        Ok(None)
    }

    /// Every `(first_byte, Edge)` pair actually populated under `node_offset`, in table order.
    pub fn children(&mut self, node_offset: u64) -> MBResult<Vec<(u8, Edge)>> {
        let (nt, _is_match, _data_off) = self.read_node_header(node_offset)?;
        let table = self.first_byte_table(node_offset, nt)?;
        let mut out = Vec::with_capacity(table.len());
        for (index, &byte) in table.iter().enumerate() {
            let edge = self.edge_at(node_offset, nt, index)?;
            if !edge.is_empty() {
                out.push((byte, edge));
            }
        }
        Ok(out)
    }

    pub fn node_match(&mut self, node_offset: u64) -> MBResult<Option<u64>> {
        let (_nt, is_match, data_off) = self.read_node_header(node_offset)?;
        Ok(is_match.then_some(data_off))
    }

    /// **AddRootEdge** (spec §4.3): fill an empty root slot with a new leaf edge.
    pub fn add_root_edge(&mut self, header: &HeaderPage, first_byte: u8, key_tail: &[u8], data_off: u64) -> MBResult<()> {
        if key_tail.len() + 1 > MAX_KEY_LENGTH {
            return Err(MBError::OutOfBound);
        }
        let tail = self.write_tail(key_tail)?;
        let edge = Edge {
            edge_len: (key_tail.len() + 1) as u8,
            data_off: true,
            tail,
            child: data_off,
        };
        let ptrs = self.get_root_edge(0, first_byte)?;
        self.write_edge_guarded(header, ExcepStatus::AddEdge, ptrs.edge_offset, &edge)
    }

    /// **InsertNode** (spec §4.3): `edge`'s label is a strict prefix of the stored key; split.
    pub fn insert_node(&mut self, header: &HeaderPage, edge_ptrs: &EdgePtrs, match_len: u8, data_off: u64) -> MBResult<()> {
        let edge = edge_ptrs.edge;
        let full_tail = self.read_tail(&edge)?;
        let head_tail = &full_tail[..match_len as usize - 1];
        let tail_tail = &full_tail[match_len as usize - 1..];

        let new_node_size = node_size(0);
        let new_node_offset = self.alloc.reserve(new_node_size)?;

        let tail_edge = Edge {
            edge_len: (tail_tail.len() + 1) as u8,
            data_off: edge.data_off,
            tail: self.write_tail_from_existing(tail_tail, &edge)?,
            child: edge.child,
        };

        self.write_node_header(new_node_offset, true, 0, data_off)?;
        let table_off = new_node_offset + NODE_HEADER_SIZE as u64;
        let first_tail_byte = tail_tail[0];
        self.alloc
            .pool_mut()
            .random_write(&[first_tail_byte], table_off)
            .map_err(|_| MBError::WriteError)?;
        self.write_edge(table_off + 1, &tail_edge)?;

        let head_edge = Edge {
            edge_len: (head_tail.len() + 1) as u8,
            data_off: false,
            tail: self.write_tail(head_tail)?,
            child: new_node_offset,
        };
        self.free_tail(header, &edge);
        self.write_edge_guarded(header, ExcepStatus::AddNode, edge_ptrs.edge_offset, &head_edge)
    }

    /// Reuse an already-allocated overflow buffer's storage decision when splitting an edge: if
    /// the tail fits inline now, copy it; if it still overflows, the bytes already live at
    /// `edge.tail`'s offset plus `head_len`, but we re-materialize to keep allocator bookkeeping
    /// simple (spec does not mandate in-place sub-slicing of overflow buffers).
    fn write_tail_from_existing(&mut self, tail: &[u8], _orig: &Edge) -> MBResult<Tail> {
        self.write_tail(tail)
    }

    /// **AddLink** (spec §4.3): the new key diverges mid-edge.
    pub fn add_link(
        &mut self,
        header: &HeaderPage,
        edge_ptrs: &EdgePtrs,
        match_len: u8,
        new_key_tail: &[u8],
        data_off: u64,
    ) -> MBResult<()> {
        let edge = edge_ptrs.edge;
        let full_tail = self.read_tail(&edge)?;
        let head_tail = &full_tail[..match_len as usize - 1];
        let old_tail = &full_tail[match_len as usize - 1..];

        let new_node_size = node_size(1);
        let new_node_offset = self.alloc.reserve(new_node_size)?;

        let old_edge = Edge {
            edge_len: (old_tail.len() + 1) as u8,
            data_off: edge.data_off,
            tail: self.write_tail(old_tail)?,
            child: edge.child,
        };
        let new_edge = Edge {
            edge_len: (new_key_tail.len() + 1) as u8,
            data_off: true,
            tail: self.write_tail(new_key_tail)?,
            child: data_off,
        };

        self.write_node_header(new_node_offset, false, 1, 0)?;
        let table_off = new_node_offset + NODE_HEADER_SIZE as u64;
        let (first_a, first_b, edge_a, edge_b) = if old_tail[0] < new_key_tail[0] {
            (old_tail[0], new_key_tail[0], old_edge, new_edge)
        } else {
            (new_key_tail[0], old_tail[0], new_edge, old_edge)
        };
        self.alloc
            .pool_mut()
            .random_write(&[first_a, first_b], table_off)
            .map_err(|_| MBError::WriteError)?;
        self.write_edge(table_off + 2, &edge_a)?;
        self.write_edge(table_off + 2 + EDGE_SIZE as u64, &edge_b)?;

        let head_edge = Edge {
            edge_len: (head_tail.len() + 1) as u8,
            data_off: false,
            tail: self.write_tail(head_tail)?,
            child: new_node_offset,
        };
        self.free_tail(header, &edge);
        self.write_edge_guarded(header, ExcepStatus::AddNode, edge_ptrs.edge_offset, &head_edge)
    }

    /// Promote a leaf edge whose full label has just been consumed by a longer incoming key: the
    /// old data becomes the new node's MATCH value, and `new_key_tail` (first byte included)
    /// becomes its sole child edge. A generalization of InsertNode for the mirrored case where the
    /// *stored* key is the shorter one (spec §4.4 step 3, "key consumes the label exactly and more
    /// remains", specialized to a leaf edge).
    pub fn promote_leaf_to_node(
        &mut self,
        header: &HeaderPage,
        edge_ptrs: &EdgePtrs,
        new_key_tail: &[u8],
        new_data_off: u64,
    ) -> MBResult<()> {
        let old_data_off = edge_ptrs.edge.child;
        let new_node_offset = self.alloc.reserve(node_size(0))?;
        self.write_node_header(new_node_offset, true, 0, old_data_off)?;

        let table_off = new_node_offset + NODE_HEADER_SIZE as u64;
        self.alloc
            .pool_mut()
            .random_write(&new_key_tail[..1], table_off)
            .map_err(|_| MBError::WriteError)?;

        let new_edge = Edge {
            edge_len: new_key_tail.len() as u8,
            data_off: true,
            tail: self.write_tail(&new_key_tail[1..])?,
            child: new_data_off,
        };
        self.write_edge(table_off + 1, &new_edge)?;

        let republished = Edge {
            data_off: false,
            child: new_node_offset,
            ..edge_ptrs.edge
        };
        self.write_edge_guarded(header, ExcepStatus::AddNode, edge_ptrs.edge_offset, &republished)
    }

    /// **UpdateNode** (spec §4.3): add a sibling edge to `node_offset`, growing it one size class.
    pub fn update_node(&mut self, header: &HeaderPage, parent_edge: &EdgePtrs, key_tail: &[u8], data_off: u64) -> MBResult<()> {
        let node_offset = parent_edge.edge.child;
        let (nt, is_match, match_data_off) = self.read_node_header(node_offset)?;
        let table = self.first_byte_table(node_offset, nt)?;
        let mut edges = Vec::with_capacity(table.len());
        for i in 0..table.len() {
            edges.push(self.edge_at(node_offset, nt, i)?);
        }

        let new_nt = nt + 1;
        let new_size = node_size(new_nt);
        let new_node_offset = self.alloc.reserve(new_size)?;

        self.write_node_header(new_node_offset, is_match, new_nt, match_data_off)?;
        let mut new_table = table.clone();
        new_table.push(key_tail[0]);

        let new_edge = Edge {
            edge_len: (key_tail.len() + 1) as u8,
            data_off: true,
            tail: self.write_tail(&key_tail[1..])?,
            child: data_off,
        };

        let table_off = new_node_offset + NODE_HEADER_SIZE as u64;
        self.alloc
            .pool_mut()
            .random_write(&new_table, table_off)
            .map_err(|_| MBError::WriteError)?;
        let edges_off = table_off + new_table.len() as u64;
        for (i, e) in edges.iter().enumerate() {
            self.write_edge(edges_off + (i * EDGE_SIZE) as u64, e)?;
        }
        self.write_edge(edges_off + (edges.len() * EDGE_SIZE) as u64, &new_edge)?;

        let reclaimed = self.alloc.release(node_offset, node_size(nt));
        header.pending_index_buff_size.fetch_add(reclaimed, Ordering::Relaxed);

        let mut updated_parent = parent_edge.edge;
        updated_parent.child = new_node_offset;
        self.write_edge_guarded(header, ExcepStatus::AddNode, parent_edge.edge_offset, &updated_parent)
    }

    /// **RemoveEdgeByIndex** (spec §4.3). `grandparent` is the edge pointing at the node
    /// `target` lives in; `None` only for a root-table edge, which never needs a node
    /// reallocation (blanking the slot is the whole operation). Otherwise the owning node shrinks
    /// by one size class and `grandparent` must be republished to the relocated offset — returned
    /// so the caller can use it for a following single-child collapse check.
    pub fn remove_edge(&mut self, header: &HeaderPage, grandparent: Option<&EdgePtrs>, target: &EdgePtrs) -> MBResult<Option<u64>> {
        self.free_tail(header, &target.edge);

        let Some(grandparent) = grandparent else {
            self.write_edge_guarded(header, ExcepStatus::ClearEdge, target.edge_offset, &Edge::EMPTY)?;
            return Ok(None);
        };

        let parent_offset = target.node_offset;
        let (nt, is_match, data_off) = self.read_node_header(parent_offset)?;
        let table = self.first_byte_table(parent_offset, nt)?;
        let mut remaining: Vec<(u8, Edge)> = Vec::new();
        for i in 0..table.len() {
            if table[i] == target.first_byte {
                continue;
            }
            remaining.push((table[i], self.edge_at(parent_offset, nt, i)?));
        }

        let new_nt = (remaining.len().max(1) - 1) as u8;
        let new_size = node_size(new_nt);
        let new_node_offset = self.alloc.reserve(new_size)?;
        self.write_node_header(new_node_offset, is_match, new_nt, data_off)?;

        let new_table: Vec<u8> = remaining.iter().map(|(b, _)| *b).collect();
        let table_off = new_node_offset + NODE_HEADER_SIZE as u64;
        self.alloc
            .pool_mut()
            .random_write(&new_table, table_off)
            .map_err(|_| MBError::WriteError)?;
        let edges_off = table_off + new_table.len() as u64;
        for (i, (_, e)) in remaining.iter().enumerate() {
            self.write_edge(edges_off + (i * EDGE_SIZE) as u64, e)?;
        }

        let reclaimed = self.alloc.release(parent_offset, node_size(nt));
        header.pending_index_buff_size.fetch_add(reclaimed, Ordering::Relaxed);

        let mut updated_grandparent = grandparent.edge;
        updated_grandparent.child = new_node_offset;
        self.write_edge_guarded(header, ExcepStatus::RemoveEdge, grandparent.edge_offset, &updated_grandparent)?;
        Ok(Some(new_node_offset))
    }

    /// Promote the sole remaining sibling into the parent edge directly, collapsing the
    /// intermediate node (spec §4.3, two-children-and-MATCH case).
    pub fn promote_sibling(
        &mut self,
        header: &HeaderPage,
        grandparent_edge: &EdgePtrs,
        sibling: &Edge,
        sibling_label_prefix: &[u8],
    ) -> MBResult<()> {
        let mut combined_tail = self.read_tail(&grandparent_edge.edge)?;
        combined_tail.truncate(grandparent_edge.edge.edge_len as usize - 1);
        combined_tail.extend_from_slice(sibling_label_prefix);
        let sibling_tail = self.read_tail(sibling)?;
        combined_tail.extend_from_slice(&sibling_tail);

        let new_edge = Edge {
            edge_len: (combined_tail.len() + 1) as u8,
            data_off: sibling.data_off,
            tail: self.write_tail(&combined_tail)?,
            child: sibling.child,
        };
        self.free_tail(header, &grandparent_edge.edge);
        self.write_edge_guarded(header, ExcepStatus::AddEdge, grandparent_edge.edge_offset, &new_edge)
    }

    /// Collapse a non-root, non-MATCH node that was just left with a single child: merge its
    /// remaining edge's label onto `grandparent_edge` and free the now-empty node (spec §4.3,
    /// "exactly 2 children" boundary case; see DESIGN.md for why this reading was chosen over the
    /// literal text).
    pub fn collapse_single_child(&mut self, header: &HeaderPage, node_offset: u64, grandparent_edge: &EdgePtrs) -> MBResult<()> {
        let (nt, _is_match, _data_off) = self.read_node_header(node_offset)?;
        let table = self.first_byte_table(node_offset, nt)?;
        let edge = self.edge_at(node_offset, nt, 0)?;
        self.promote_sibling(header, grandparent_edge, &edge, &table[..1])?;
        let reclaimed = self.alloc.release(node_offset, node_size(nt));
        header.pending_index_buff_size.fetch_add(reclaimed, Ordering::Relaxed);
        Ok(())
    }

    pub fn node_child_count(&mut self, node_offset: u64) -> MBResult<(u8, bool)> {
        let (nt, is_match, _data_off) = self.read_node_header(node_offset)?;
        Ok((nt, is_match))
    }

    pub fn clear_node_match(&mut self, header: &HeaderPage, node_offset: u64) -> MBResult<u64> {
        let (nt, is_match, data_off) = self.read_node_header(node_offset)?;
        if !is_match {
            return Ok(0);
        }
        self.write_node_header_guarded(header, node_offset, false, nt, 0)?;
        Ok(data_off)
    }

    pub fn set_node_match(&mut self, header: &HeaderPage, node_offset: u64, data_off: u64) -> MBResult<()> {
        let (nt, _is_match, _old) = self.read_node_header(node_offset)?;
        self.write_node_header_guarded(header, node_offset, true, nt, data_off)
    }

    /// Guarded read of a node's MATCH bit / data offset for the read path (spec §4.5: node-header
    /// reads need the same lock-free validation as edge reads since `write_node_header_guarded`
    /// publishes through the same ring keyed on `node_offset`).
    pub fn node_match_guarded(&mut self, header: &HeaderPage, node_offset: u64) -> MBResult<Option<u64>> {
        use crate::lockfree::{ReadOutcome, ReaderGuard};
        crate::lockfree::retry(|| {
            let guard = ReaderGuard::snapshot(header);
            let (nt, is_match, data_off) = self.read_node_header(node_offset)?;
            let value = is_match.then_some(data_off);
            match guard.validate(
                node_offset,
                || value,
                |status, buff| reconstruct_node_match(status, &buff, nt),
            )? {
                ReadOutcome::Ok(v) | ReadOutcome::Saved(v) => Ok(v),
            }
        })
    }
}

/// Reconstruct a node's MATCH/data-offset pair from the exception buffer for the "writer is
/// mid-mutation on exactly this node header" case (spec §4.6 step 4, generalized to `AddNode`).
fn reconstruct_node_match(status: ExcepStatus, buff: &[u8; 16], _nt: u8) -> Option<u64> {
    if status != ExcepStatus::AddNode {
        return None;
    }
    let is_match = buff[0] & NODE_FLAG_MATCH != 0;
    if !is_match {
        return None;
    }
    let mut off_bytes = [0u8; 8];
    off_bytes[0..6].copy_from_slice(&buff[2..8]);
    Some(u64::from_le_bytes(off_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_roundtrips_inline() {
        let e = Edge {
            edge_len: 4,
            data_off: true,
            tail: Tail::Inline([1, 2, 3, 0, 0]),
            child: 0xABCDEF,
        };
        assert_eq!(Edge::decode(&e.encode()), e);
    }

    #[test]
    fn edge_roundtrips_overflow() {
        let e = Edge {
            edge_len: 9,
            data_off: false,
            tail: Tail::Overflow(0x1122_3344_55),
            child: 42,
        };
        assert_eq!(Edge::decode(&e.encode()), e);
    }

    #[test]
    fn empty_edge_is_all_zero() {
        assert_eq!(Edge::EMPTY.encode(), [0u8; EDGE_SIZE]);
    }
}
