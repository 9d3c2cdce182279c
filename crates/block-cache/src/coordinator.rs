//! Single-flight and coalescing of block fetches.
//!
//! Cache hits never touch the registry lock. On a miss, the caller either
//! joins a fetch already in flight for that block, or claims the longest run
//! of following blocks that are neither cached nor in flight and issues one
//! backend request for the whole run.
//!
//! Backend requests run on spawned tasks: dropping the caller never cancels a
//! fetch that other callers are waiting on, and every waiter is resolved
//! exactly once with the fetch outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use cache_common::{BlockKey, CacheError, CacheResult};

use crate::cache::BlockCache;
use crate::source::RangeSource;

/// Default upper bound on blocks per backend request.
pub const DEFAULT_MAX_RUN_BLOCKS: u64 = 256;

type Waiter = oneshot::Sender<CacheResult<Bytes>>;

enum Claim {
    /// Another caller is fetching the block.
    Wait(oneshot::Receiver<CacheResult<Bytes>>),
    /// The block landed in the cache meanwhile.
    Cached,
    /// This caller fetches blocks `[start, end)`.
    Fetch { end: u64 },
}

#[derive(Debug, Default)]
struct CoordinatorCounters {
    backend_fetches: AtomicU64,
    blocks_fetched: AtomicU64,
    waits: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of coordinator counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    pub backend_fetches: u64,
    pub blocks_fetched: u64,
    /// Times a caller waited on another caller's fetch.
    pub waits: u64,
    pub failures: u64,
}

struct CoordinatorInner {
    cache: Arc<BlockCache>,
    source: Arc<dyn RangeSource>,
    key: BlockKey,
    max_run_blocks: u64,
    inflight: Mutex<HashMap<u64, Vec<Waiter>>>,
    counters: CoordinatorCounters,
}

/// Coordinates block fetches of one source into a shared [`BlockCache`].
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl CacheCoordinator {
    pub fn new(cache: Arc<BlockCache>, source: Arc<dyn RangeSource>, key: BlockKey) -> Self {
        Self::with_max_run(cache, source, key, DEFAULT_MAX_RUN_BLOCKS)
    }

    pub fn with_max_run(
        cache: Arc<BlockCache>,
        source: Arc<dyn RangeSource>,
        key: BlockKey,
        max_run_blocks: u64,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                cache,
                source,
                key,
                max_run_blocks: max_run_blocks.max(1),
                inflight: Mutex::new(HashMap::new()),
                counters: CoordinatorCounters::default(),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.inner.cache
    }

    pub fn source(&self) -> &Arc<dyn RangeSource> {
        &self.inner.source
    }

    pub fn key(&self) -> BlockKey {
        self.inner.key
    }

    /// Deliver blocks `[first_block, first_block + count)` in order to
    /// `on_block(block_index, bytes)`.
    ///
    /// Cached blocks are full `block_size` slices; a freshly fetched last
    /// block of the source may be shorter.
    pub async fn fetch<F>(&self, first_block: u64, count: u64, mut on_block: F) -> CacheResult<()>
    where
        F: FnMut(u64, &[u8]) -> CacheResult<()> + Send,
    {
        let end = first_block + count;
        let mut block = first_block;

        while block < end {
            if let Some(hit) = self.inner.cache.get(self.inner.key.block(block)) {
                on_block(block, hit.as_slice())?;
                block += 1;
                continue;
            }

            match self.claim(block, end).await {
                Claim::Cached => continue,
                Claim::Wait(rx) => {
                    self.inner.counters.waits.fetch_add(1, Ordering::Relaxed);
                    let data = rx
                        .await
                        .map_err(|_| CacheError::internal("fetch ended without a result"))??;
                    on_block(block, &data)?;
                    block += 1;
                }
                Claim::Fetch { end: run_end } => {
                    let data = self.spawn_fetch(block, run_end - block).await?;
                    let block_size = self.inner.cache.block_size();
                    for b in block..run_end {
                        on_block(b, block_slice(&data, (b - block) as usize, block_size))?;
                    }
                    block = run_end;
                }
            }
        }

        Ok(())
    }

    /// Advise cached blocks and start a background fetch for missing ones.
    /// Never waits for data. Must be called within a tokio runtime.
    pub fn prefetch(&self, first_block: u64, count: u64) {
        let mut missing = false;
        for block in first_block..first_block + count {
            let key = self.inner.key.block(block);
            if self.inner.cache.contains(key) {
                self.inner.cache.prefetch(key);
            } else {
                missing = true;
            }
        }

        if missing {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.fetch(first_block, count, |_, _| Ok(())).await {
                    debug!(error = %e, first_block, count, "Background prefetch failed");
                }
            });
        }
    }

    /// Register a run of missing blocks starting at `start`, or join the
    /// fetch already in flight for it.
    async fn claim(&self, start: u64, limit: u64) -> Claim {
        let inner = &self.inner;
        let mut inflight = inner.inflight.lock().await;

        let start_key = inner.key.block(start);
        if let Some(waiters) = inflight.get_mut(&start_key) {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            return Claim::Wait(rx);
        }
        if inner.cache.contains(start_key) {
            return Claim::Cached;
        }

        let mut end = start + 1;
        while end < limit && end - start < inner.max_run_blocks {
            let key = inner.key.block(end);
            if inflight.contains_key(&key) || inner.cache.contains(key) {
                break;
            }
            end += 1;
        }

        for block in start..end {
            inflight.insert(inner.key.block(block), Vec::new());
        }
        Claim::Fetch { end }
    }

    async fn spawn_fetch(&self, start: u64, count: u64) -> CacheResult<Bytes> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run_fetch(start, count).await })
            .await
            .map_err(|e| CacheError::internal(format!("fetch task failed: {}", e)))?
    }

    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.inner.counters;
        CoordinatorStats {
            backend_fetches: c.backend_fetches.load(Ordering::Relaxed),
            blocks_fetched: c.blocks_fetched.load(Ordering::Relaxed),
            waits: c.waits.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }
}

impl CoordinatorInner {
    /// One backend request for blocks `[start, start + count)`; fills the
    /// cache and resolves every registered waiter.
    async fn run_fetch(&self, start: u64, count: u64) -> CacheResult<Bytes> {
        let block_size = self.cache.block_size();
        let offset = start * block_size as u64;
        let len = (count * block_size as u64).min(self.source.len().saturating_sub(offset));

        self.counters.backend_fetches.fetch_add(1, Ordering::Relaxed);
        counter!("block_cache_backend_fetches_total").increment(1);
        if count > 1 {
            counter!("block_cache_coalesced_blocks_total").increment(count);
        }
        debug!(start, count, offset, len, "Fetching block run");

        let result = if len == 0 {
            Err(CacheError::InvalidRange {
                offset,
                len: count * block_size as u64,
                file_len: self.source.len(),
            })
        } else {
            self.source.get_range(offset, len).await.and_then(|data| {
                if data.len() as u64 == len {
                    Ok(data)
                } else {
                    Err(CacheError::io(format!(
                        "short read at {}: expected {} bytes, got {}",
                        offset,
                        len,
                        data.len()
                    )))
                }
            })
        };

        match &result {
            Ok(data) => {
                self.counters
                    .blocks_fetched
                    .fetch_add(count, Ordering::Relaxed);
                for b in 0..count {
                    let chunk = block_slice(data, b as usize, block_size);
                    self.cache.set(self.key.block(start + b), chunk);
                }
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, start, count, "Block fetch failed");
            }
        }

        let mut inflight = self.inflight.lock().await;
        for b in 0..count {
            let waiters = inflight
                .remove(&self.key.block(start + b))
                .unwrap_or_default();
            for waiter in waiters {
                let outcome = match &result {
                    Ok(data) => {
                        let lo = (b as usize * block_size).min(data.len());
                        let hi = (lo + block_size).min(data.len());
                        Ok(data.slice(lo..hi))
                    }
                    Err(e) => Err(e.clone()),
                };
                // The waiter may have been dropped; nothing to deliver then.
                let _ = waiter.send(outcome);
            }
        }

        result
    }
}

fn block_slice(data: &[u8], index: usize, block_size: usize) -> &[u8] {
    let lo = (index * block_size).min(data.len());
    let hi = (lo + block_size).min(data.len());
    &data[lo..hi]
}
