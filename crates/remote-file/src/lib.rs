//! Logical file access over local storage and remote HTTP object stores.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RemoteFileManager                                            │
//! │  read(file, ranges) / read_with / prefetch / tick            │
//! ├──────────────┬───────────────────────────────────────────────┤
//! │ LocalFile    │ RemoteRangeBackend ── ChunkedReader           │
//! │ (mmap)       │ (HEAD probe, If-Match)   │                    │
//! │              │                          ▼                    │
//! │              │                  CacheCoordinator             │
//! │              │                          │                    │
//! │              │                          ▼                    │
//! │              │                  BlockCache (mmap table)      │
//! ├──────────────┴───────────────────────────────────────────────┤
//! │ MetaCache: persisted HEAD results, skips probes on restart   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use remote_file::{FileCacheConfig, RemoteFileManager};
//!
//! let config = FileCacheConfig::from_env();
//! let cache = Arc::new(config.open_block_cache()?);
//! let manager = RemoteFileManager::new(cache, &config)?;
//! let _revalidation = manager.spawn_revalidation(config.tick_interval());
//!
//! let parts = manager.read("gfs/2024010100/temperature.om", &[(0, 4096)]).await?;
//! ```

pub mod config;
pub mod local;
pub mod manager;
pub mod meta_cache;
pub mod policy;
pub mod remote;

pub use cache_common::{CacheError, CacheResult, Clock, ManualClock, SystemClock};
pub use config::FileCacheConfig;
pub use local::LocalFile;
pub use manager::{
    EntryInfo, EntryState, FileStatsSnapshot, ManagerStats, RemoteFileManager, TickReport,
};
pub use meta_cache::{MetaCache, MetaRecord};
pub use policy::{RevalidationPolicy, TieredRevalidation};
pub use remote::{probe_metadata, RemoteMetadata, RemoteRangeBackend};

/// Result type alias using CacheError.
pub type Result<T> = CacheResult<T>;
