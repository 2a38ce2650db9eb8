//! Radix-trie key-value store over memory-mapped files: the trie/value layers, lock-free reads,
//! the shared command queue, and the writer lifecycle that ties them into a [`Db`] handle.
mod db;
mod dict;
mod error;
mod header;
mod iter;
mod lockfree;
mod prefix_cache;
mod queue;
mod rc;
mod search;
mod trie;
mod writer;

pub use db::{Db, DbOptions, PrefixIterState, Stats};
pub use dict::Dict;
pub use error::{MBError, MBResult};
pub use header::{ExcepStatus, HeaderPage, MAX_DATA_SIZE, MAX_KEY_LENGTH};
pub use iter::{Traversal, Visited};
pub use prefix_cache::{ThreadPrefixCache, SharedCacheWay, SharedPrefixCache};
pub use queue::{CommandQueue, CommandType, QueueFile};
pub use rc::RcThresholds;
pub use search::SearchEngine;
pub use trie::{DictMem, Edge, EdgePtrs, Tail};
