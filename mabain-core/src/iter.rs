//! Depth-first trie traversal used internally by the resource collector and by `iterator()`'s
//! backing implementation (spec §4.9, §9: "explicit stack of (node_offset, cumulative_key,
//! parent_edge_offset) frames").
use crate::dict::Dict;
use crate::error::MBResult;
use mabain_mem::Allocator;

/// One live `(key, value)` pair discovered by a traversal.
pub struct Visited {
    pub key: Vec<u8>,
    pub value_offset: u64,
}

enum Frame {
    /// About to visit the 256 root slots, starting at `next`.
    Root { next: u16 },
    /// About to visit a node's children, starting at `next`.
    Node { node_offset: u64, key: Vec<u8>, next: usize },
}

/// An explicit-stack DFS over the live trie rooted at `root_offset`.
pub struct Traversal {
    root_offset: u64,
    stack: Vec<Frame>,
}

impl Traversal {
    pub fn new(root_offset: u64) -> Self {
        Traversal { root_offset, stack: vec![Frame::Root { next: 0 }] }
    }

    /// Advance to the next live entry, or `None` when the traversal is exhausted.
    pub fn next<AI: Allocator, AD: Allocator>(&mut self, dict: &mut Dict<AI, AD>) -> MBResult<Option<Visited>> {
        loop {
            let Some(frame) = self.stack.last_mut() else { return Ok(None) };

            match frame {
                Frame::Root { next } => {
                    if *next >= 256 {
                        self.stack.pop();
                        continue;
                    }
                    let first_byte = *next as u8;
                    *next += 1;
                    let edge_ptrs = dict.trie_mut().get_root_edge(self.root_offset, first_byte)?;
                    if edge_ptrs.edge.is_empty() {
                        continue;
                    }
                    let tail = dict.trie_mut().read_tail(&edge_ptrs.edge)?;
                    let mut key = vec![first_byte];
                    key.extend_from_slice(&tail);

                    if edge_ptrs.edge.data_off {
                        return Ok(Some(Visited { key, value_offset: edge_ptrs.edge.child }));
                    }
                    self.push_node(dict, edge_ptrs.edge.child, key)?;
                }
                Frame::Node { node_offset, key, next } => {
                    let node_offset = *node_offset;
                    let children = dict.trie_mut().children(node_offset)?;

                    if *next == 0 {
                        if let Some(off) = dict.trie_mut().node_match(node_offset)? {
                            *next += 1;
                            let key = key.clone();
                            return Ok(Some(Visited { key, value_offset: off }));
                        }
                        *next += 1;
                    }

                    let child_index = *next - 1;
                    if child_index >= children.len() {
                        self.stack.pop();
                        continue;
                    }
                    *next += 1;

                    let (first_byte, edge) = children[child_index];
                    let tail = dict.trie_mut().read_tail(&edge)?;
                    let mut child_key = key.clone();
                    child_key.push(first_byte);
                    child_key.extend_from_slice(&tail);

                    if edge.data_off {
                        return Ok(Some(Visited { key: child_key, value_offset: edge.child }));
                    }
                    self.push_node(dict, edge.child, child_key)?;
                }
            }
        }
    }

    fn push_node<AI: Allocator, AD: Allocator>(&mut self, _dict: &mut Dict<AI, AD>, node_offset: u64, key: Vec<u8>) -> MBResult<()> {
        self.stack.push(Frame::Node { node_offset, key, next: 0 });
        Ok(())
    }
}
