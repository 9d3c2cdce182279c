//! Configuration for the block cache and the remote file manager.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use block_cache::{table_size, BlockCache, HeapStorage, MmapStorage};
use cache_common::{CacheError, CacheResult};

use crate::policy::TieredRevalidation;

/// Configuration for the file cache stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCacheConfig {
    /// Cache table file. `None` keeps the table on the heap.
    pub block_cache_path: Option<PathBuf>,

    /// Size of the cache table (metadata and data) in megabytes.
    pub block_cache_size_mb: usize,

    /// Block size in kilobytes.
    pub block_size_kb: usize,

    /// Directory searched first for logical files.
    pub local_data_dir: Option<PathBuf>,

    /// Base URL of the remote object store, e.g. `https://bucket.s3.amazonaws.com/data`.
    pub remote_base_url: Option<String>,

    /// Fixed-record file memoizing remote metadata across restarts.
    pub meta_cache_path: Option<PathBuf>,

    /// Records in the meta-cache file.
    pub meta_cache_records: usize,

    /// Interval of the background revalidation tick.
    pub revalidate_tick_secs: u64,

    /// Entries untouched for this long are evicted.
    pub idle_eviction_secs: i64,

    /// Delay before blocks of an outdated version are deleted.
    pub stale_grace_secs: i64,

    /// HTTP request timeout.
    pub http_timeout_secs: u64,

    /// Upper bound on blocks per backend request.
    pub max_run_blocks: u64,

    /// Revalidation intervals.
    pub revalidation: TieredRevalidation,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            block_cache_path: None,
            block_cache_size_mb: 1024,
            block_size_kb: 64,
            local_data_dir: None,
            remote_base_url: None,
            meta_cache_path: None,
            meta_cache_records: 16 * 1024,
            revalidate_tick_secs: 10,
            idle_eviction_secs: 15 * 60,
            stale_grace_secs: 60,
            http_timeout_secs: 30,
            max_run_blocks: block_cache::DEFAULT_MAX_RUN_BLOCKS,
            revalidation: TieredRevalidation::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl FileCacheConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("BLOCK_CACHE_PATH") {
            if !val.is_empty() {
                config.block_cache_path = Some(PathBuf::from(val));
            }
        }
        if let Some(size) = env_parse("BLOCK_CACHE_SIZE_MB") {
            config.block_cache_size_mb = size;
        }
        if let Some(size) = env_parse("BLOCK_SIZE_KB") {
            config.block_size_kb = size;
        }
        if let Ok(val) = std::env::var("LOCAL_DATA_DIR") {
            if !val.is_empty() {
                config.local_data_dir = Some(PathBuf::from(val));
            }
        }
        if let Ok(val) = std::env::var("REMOTE_BASE_URL") {
            if !val.is_empty() {
                config.remote_base_url = Some(val);
            }
        }
        if let Ok(val) = std::env::var("META_CACHE_PATH") {
            if !val.is_empty() {
                config.meta_cache_path = Some(PathBuf::from(val));
            }
        }
        if let Some(secs) = env_parse("REVALIDATE_TICK_SECS") {
            config.revalidate_tick_secs = secs;
        }
        if let Some(secs) = env_parse("IDLE_EVICTION_SECS") {
            config.idle_eviction_secs = secs;
        }
        if let Some(secs) = env_parse("STALE_GRACE_SECS") {
            config.stale_grace_secs = secs;
        }
        if let Some(secs) = env_parse("HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = secs;
        }
        if let Some(blocks) = env_parse("MAX_RUN_BLOCKS") {
            config.max_run_blocks = blocks;
        }

        let r = &mut config.revalidation;
        if let Some(secs) = env_parse("REVALIDATE_MISSING_SECS") {
            r.missing_secs = secs;
        }
        if let Some(secs) = env_parse("REVALIDATE_RECENT_SECS") {
            r.recent_secs = secs;
        }
        if let Some(secs) = env_parse("REVALIDATE_STABLE_SECS") {
            r.stable_secs = secs;
        }
        if let Some(secs) = env_parse("RECENT_WINDOW_SECS") {
            r.recent_window_secs = secs;
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.block_size_kb == 0 {
            return Err("block_size_kb must be > 0".to_string());
        }
        if self.block_cache_size_bytes() < self.slot_size_bytes() {
            return Err("block_cache_size_mb must hold at least one block".to_string());
        }
        if self.meta_cache_records == 0 {
            return Err("meta_cache_records must be > 0".to_string());
        }
        if self.revalidate_tick_secs == 0 {
            return Err("revalidate_tick_secs must be > 0".to_string());
        }
        if self.idle_eviction_secs <= 0 {
            return Err("idle_eviction_secs must be > 0".to_string());
        }
        if self.stale_grace_secs < 0 {
            return Err("stale_grace_secs must be >= 0".to_string());
        }
        if let Some(url) = &self.remote_base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("remote_base_url must be http(s): {}", url));
            }
        }
        if self.revalidation.missing_secs <= 0
            || self.revalidation.recent_secs <= 0
            || self.revalidation.stable_secs <= 0
        {
            return Err("revalidation intervals must be > 0".to_string());
        }
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        self.block_size_kb * 1024
    }

    pub fn block_cache_size_bytes(&self) -> usize {
        self.block_cache_size_mb * 1024 * 1024
    }

    fn slot_size_bytes(&self) -> usize {
        self.block_size() + block_cache::cache::SLOT_META_SIZE
    }

    /// Slot count of the cache table.
    pub fn block_cache_slots(&self) -> usize {
        self.block_cache_size_bytes() / self.slot_size_bytes()
    }

    /// Build the block cache: file backed if `block_cache_path` is set,
    /// heap backed otherwise.
    pub fn open_block_cache(&self) -> CacheResult<BlockCache> {
        self.validate().map_err(CacheError::Config)?;
        let slots = self.block_cache_slots();
        let bytes = table_size(slots, self.block_size());
        let cache = match &self.block_cache_path {
            Some(path) => BlockCache::new(MmapStorage::open(path, bytes)?, self.block_size()),
            None => BlockCache::new(HeapStorage::new(bytes), self.block_size()),
        };
        info!(
            slots,
            block_size = self.block_size(),
            path = ?self.block_cache_path,
            "Block cache ready"
        );
        Ok(cache)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.revalidate_tick_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
