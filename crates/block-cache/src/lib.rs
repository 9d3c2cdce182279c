//! Block-level cache for byte-range access to large gridded data files.
//!
//! # Architecture
//!
//! ```text
//! ChunkedReader::read(offset, len, f)
//!      │
//!      ├─► Map range onto block indices (O(1) arithmetic)
//!      │
//!      ├─► BlockCache lookup per block (lock-free, no suspension on hit)
//!      │         │
//!      │         └─► Miss: CacheCoordinator
//!      │                   ├─► join a fetch already in flight, or
//!      │                   └─► claim the run of missing blocks and issue
//!      │                       one RangeSource::get_range for all of them
//!      │
//!      └─► f(&[u8]) on the cached block, a contiguous cached run,
//!          or an assembled scratch buffer
//! ```
//!
//! The cache table lives in a [`BackingStorage`] region: a memory-mapped file
//! that persists across restarts ([`MmapStorage`]) or a heap buffer
//! ([`HeapStorage`]).

pub mod cache;
pub mod coordinator;
pub mod reader;
pub mod source;
pub mod storage;

pub use cache::{table_size, BlockCache, BlockCacheStats, BlockRef, MAX_PROBE};
pub use cache_common::{BlockKey, CacheError, CacheResult};
pub use coordinator::{CacheCoordinator, CoordinatorStats, DEFAULT_MAX_RUN_BLOCKS};
pub use reader::ChunkedReader;
pub use source::{MemorySource, RangeSource};
pub use storage::{BackingStorage, HeapStorage, MmapStorage};
