//! Resolution and revalidation of logical files.
//!
//! A logical file name resolves to, in order of preference:
//!
//! 1. a local file under `local_data_dir`, read straight from a mapping,
//! 2. a remote object under `remote_base_url`, read through the block cache,
//! 3. `Missing`.
//!
//! Resolved entries live in a registry behind one async mutex. Concurrent
//! first accesses of the same file share a single resolution. [`tick`]
//! revalidates entries whose interval elapsed, evicts idle ones and deletes
//! cached blocks of outdated remote versions once their grace period ends.
//!
//! ```text
//!  Unresolved --resolve--> Missing | LocalOpen | RemoteOpen --idle--> Evicted
//!       ^                                 |            |
//!       +------ changed / invalidated ----+            +-- version flip --> RemoteOpen'
//! ```
//!
//! [`tick`]: RemoteFileManager::tick

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use block_cache::{
    BlockCache, BlockCacheStats, BlockKey, CacheCoordinator, ChunkedReader, CoordinatorStats,
    RangeSource,
};
use cache_common::{CacheError, CacheResult, Clock, ContentVersion, SystemClock};

use crate::config::FileCacheConfig;
use crate::local::LocalFile;
use crate::meta_cache::{MetaCache, MetaRecord};
use crate::policy::RevalidationPolicy;
use crate::remote::{probe_metadata, RemoteMetadata, RemoteRangeBackend};

type Waiter = oneshot::Sender<CacheResult<Arc<Entry>>>;

enum Slot {
    Resolving(Vec<Waiter>),
    Ready(Arc<Entry>),
}

enum Resolution {
    Missing,
    Local(LocalFile),
    Remote {
        backend: Arc<RemoteRangeBackend>,
        reader: ChunkedReader,
    },
}

impl Resolution {
    fn state(&self) -> EntryState {
        match self {
            Resolution::Missing => EntryState::Missing,
            Resolution::Local(_) => EntryState::Local,
            Resolution::Remote { .. } => EntryState::Remote,
        }
    }

    fn namespace(&self) -> Option<(BlockKey, u64)> {
        match self {
            Resolution::Remote { reader, .. } => Some((reader.key(), reader.block_count())),
            _ => None,
        }
    }

    fn version(&self) -> Option<ContentVersion> {
        match self {
            Resolution::Remote { backend, .. } => Some(backend.version()),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct FileStats {
    reads: AtomicU64,
    bytes_read: AtomicU64,
    stale_retries: AtomicU64,
    revalidations: AtomicU64,
    version_flips: AtomicU64,
}

/// Per-file counters. They survive re-resolution of the same file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileStatsSnapshot {
    pub reads: u64,
    pub bytes_read: u64,
    pub stale_retries: u64,
    pub revalidations: u64,
    pub version_flips: u64,
}

impl FileStats {
    fn snapshot(&self) -> FileStatsSnapshot {
        FileStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            stale_retries: self.stale_retries.load(Ordering::Relaxed),
            revalidations: self.revalidations.load(Ordering::Relaxed),
            version_flips: self.version_flips.load(Ordering::Relaxed),
        }
    }
}

struct Entry {
    file: String,
    resolution: Resolution,
    /// Last check of a missing or local file, in unix seconds.
    checked_at: AtomicI64,
    last_accessed: AtomicI64,
    /// Cache tick at the last successful validation.
    validated_tick: AtomicU64,
    stats: Arc<FileStats>,
}

impl Entry {
    fn new(
        file: String,
        resolution: Resolution,
        stats: Arc<FileStats>,
        now: i64,
        tick: u64,
    ) -> Self {
        Self {
            file,
            resolution,
            checked_at: AtomicI64::new(now),
            last_accessed: AtomicI64::new(now),
            validated_tick: AtomicU64::new(tick),
            stats,
        }
    }

    /// New resolution of the same file, keeping access time and counters.
    fn replacing(old: &Entry, resolution: Resolution, now: i64, tick: u64) -> Self {
        Self {
            file: old.file.clone(),
            resolution,
            checked_at: AtomicI64::new(now),
            last_accessed: AtomicI64::new(old.last_accessed.load(Ordering::Relaxed)),
            validated_tick: AtomicU64::new(tick),
            stats: old.stats.clone(),
        }
    }

    fn touch(&self, now: i64) {
        self.last_accessed.fetch_max(now, Ordering::Relaxed);
    }

    fn last_validated(&self) -> i64 {
        match &self.resolution {
            Resolution::Remote { backend, .. } => backend.last_validated(),
            _ => self.checked_at.load(Ordering::Relaxed),
        }
    }

    fn last_modified(&self) -> Option<i64> {
        match &self.resolution {
            Resolution::Remote { backend, .. } => backend.metadata().last_modified,
            Resolution::Local(local) => local.modified_secs(),
            Resolution::Missing => None,
        }
    }
}

/// Resolution state of a file, as reported by [`RemoteFileManager::entry_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Resolving,
    Missing,
    Local,
    Remote,
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub file: String,
    pub state: EntryState,
    pub content_length: Option<u64>,
    pub namespace: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<i64>,
    pub last_validated: Option<i64>,
    pub last_accessed: Option<i64>,
    pub stats: FileStatsSnapshot,
    pub coordinator: Option<CoordinatorStats>,
}

/// What one [`RemoteFileManager::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub revalidated: usize,
    pub changed: usize,
    pub version_flips: usize,
    pub evicted: usize,
    pub preloaded_blocks: usize,
    pub deleted_blocks: usize,
}

/// Manager-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub entries: usize,
    pub pending_deletes: usize,
    pub revalidations: u64,
    pub version_flips: u64,
    pub stale_retries: u64,
    pub idle_evictions: u64,
    pub cache: BlockCacheStats,
}

#[derive(Debug, Default)]
struct ManagerCounters {
    revalidations: AtomicU64,
    version_flips: AtomicU64,
    stale_retries: AtomicU64,
    idle_evictions: AtomicU64,
}

struct PendingDelete {
    key: BlockKey,
    blocks: u64,
    due: i64,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Slot>,
    /// Counters per file, kept until the file is evicted for idleness.
    stats: HashMap<String, Arc<FileStats>>,
    pending_deletes: Vec<PendingDelete>,
}

struct ManagerInner {
    cache: Arc<BlockCache>,
    client: Client,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn RevalidationPolicy>,
    meta: Option<MetaCache>,
    local_dir: Option<PathBuf>,
    remote_base_url: Option<String>,
    idle_eviction_secs: i64,
    stale_grace_secs: i64,
    max_run_blocks: u64,
    registry: Mutex<Registry>,
    tick_lock: Mutex<()>,
    counters: ManagerCounters,
}

/// Resolves logical files to local or remote backends and keeps the
/// resolutions fresh.
#[derive(Clone)]
pub struct RemoteFileManager {
    inner: Arc<ManagerInner>,
}

impl RemoteFileManager {
    /// Manager on the system clock with the configured revalidation tiers.
    pub fn new(cache: Arc<BlockCache>, config: &FileCacheConfig) -> CacheResult<Self> {
        Self::with_parts(
            cache,
            config,
            Arc::new(SystemClock),
            Arc::new(config.revalidation.clone()),
        )
    }

    pub fn with_parts(
        cache: Arc<BlockCache>,
        config: &FileCacheConfig,
        clock: Arc<dyn Clock>,
        policy: Arc<dyn RevalidationPolicy>,
    ) -> CacheResult<Self> {
        config.validate().map_err(CacheError::Config)?;

        let client = Client::builder()
            .timeout(config.http_timeout())
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(8)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| CacheError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let meta = config
            .meta_cache_path
            .as_ref()
            .map(|path| MetaCache::open(path, config.meta_cache_records))
            .transpose()?;

        info!(
            local_dir = ?config.local_data_dir,
            remote_base_url = ?config.remote_base_url,
            meta_cache = ?config.meta_cache_path,
            "Remote file manager initialized"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                cache,
                client,
                clock,
                policy,
                meta,
                local_dir: config.local_data_dir.clone(),
                remote_base_url: config
                    .remote_base_url
                    .as_ref()
                    .map(|url| url.trim_end_matches('/').to_string()),
                idle_eviction_secs: config.idle_eviction_secs,
                stale_grace_secs: config.stale_grace_secs,
                max_run_blocks: config.max_run_blocks,
                registry: Mutex::new(Registry::default()),
                tick_lock: Mutex::new(()),
                counters: ManagerCounters::default(),
            }),
        })
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.inner.cache
    }

    /// Run `f` on bytes `[offset, offset + len)` of `file`.
    ///
    /// If the remote object changed under the open entry, the file is
    /// resolved again and the read retried once.
    pub async fn read_with<R, F>(&self, file: &str, offset: u64, len: u64, f: F) -> CacheResult<R>
    where
        F: FnOnce(&[u8]) -> R + Send,
        R: Send,
    {
        let mut f = Some(f);
        let entry = self.inner.entry(file).await?;
        match self.inner.read_entry(&entry, offset, len, &mut f).await {
            Err(e) if e.is_stale() => {
                warn!(file, error = %e, "Stale remote content, resolving again");
                entry.stats.stale_retries.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .counters
                    .stale_retries
                    .fetch_add(1, Ordering::Relaxed);
                counter!("remote_file_stale_retries_total").increment(1);

                self.inner.invalidate_entry(file, Some(&entry)).await;
                let fresh = self.inner.entry(file).await?;
                self.inner.retire(&entry, &fresh).await;
                self.inner.read_entry(&fresh, offset, len, &mut f).await
            }
            other => other,
        }
    }

    /// Read several ranges of `file` concurrently.
    pub async fn read(&self, file: &str, ranges: &[(u64, u64)]) -> CacheResult<Vec<Bytes>> {
        futures::future::try_join_all(
            ranges
                .iter()
                .map(|&(offset, len)| self.read_with(file, offset, len, Bytes::copy_from_slice)),
        )
        .await
    }

    /// Hint that `ranges` of `file` will be read soon. Waits for resolution
    /// of the file but never for data. Missing files are ignored.
    pub async fn prefetch(&self, file: &str, ranges: &[(u64, u64)]) -> CacheResult<()> {
        let entry = self.inner.entry(file).await?;
        match &entry.resolution {
            Resolution::Missing => {}
            Resolution::Local(local) => {
                for &(offset, len) in ranges {
                    local.advise(offset, len);
                }
            }
            Resolution::Remote { reader, .. } => {
                for &(offset, len) in ranges {
                    reader.prefetch(offset, len);
                }
            }
        }
        Ok(())
    }

    /// Revalidate due entries, evict idle ones and delete blocks of outdated
    /// versions whose grace period ended.
    pub async fn tick(&self) -> TickReport {
        self.inner.tick().await
    }

    /// Run [`tick`](Self::tick) every `interval` until the manager is dropped.
    pub fn spawn_revalidation(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("Manager dropped, stopping revalidation");
                    break;
                };
                let report = inner.tick().await;
                if report != TickReport::default() {
                    debug!(?report, "Revalidation tick");
                }
            }
        })
    }

    /// Forget the resolution of `file`; the next access resolves it again
    /// without consulting the meta-cache.
    pub async fn invalidate(&self, file: &str) {
        self.inner.invalidate_entry(file, None).await;
    }

    pub async fn entry_info(&self, file: &str) -> Option<EntryInfo> {
        let registry = self.inner.registry.lock().await;
        match registry.entries.get(file)? {
            Slot::Resolving(_) => Some(EntryInfo {
                file: file.to_string(),
                state: EntryState::Resolving,
                content_length: None,
                namespace: None,
                etag: None,
                last_modified: None,
                last_validated: None,
                last_accessed: None,
                stats: FileStatsSnapshot::default(),
                coordinator: None,
            }),
            Slot::Ready(entry) => Some(describe(entry)),
        }
    }

    /// Number of registry entries, including ones being resolved.
    pub async fn len(&self) -> usize {
        self.inner.registry.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> ManagerStats {
        let registry = self.inner.registry.lock().await;
        let c = &self.inner.counters;
        ManagerStats {
            entries: registry.entries.len(),
            pending_deletes: registry.pending_deletes.len(),
            revalidations: c.revalidations.load(Ordering::Relaxed),
            version_flips: c.version_flips.load(Ordering::Relaxed),
            stale_retries: c.stale_retries.load(Ordering::Relaxed),
            idle_evictions: c.idle_evictions.load(Ordering::Relaxed),
            cache: self.inner.cache.stats(),
        }
    }

    /// Flush the block cache and the meta-cache to disk.
    pub fn flush(&self) -> CacheResult<()> {
        self.inner.cache.flush()?;
        if let Some(meta) = &self.inner.meta {
            meta.flush()?;
        }
        Ok(())
    }
}

fn describe(entry: &Entry) -> EntryInfo {
    let (content_length, namespace, etag, coordinator) = match &entry.resolution {
        Resolution::Missing => (None, None, None, None),
        Resolution::Local(local) => (Some(local.len()), None, None, None),
        Resolution::Remote { backend, reader } => (
            Some(backend.len()),
            Some(reader.key().namespace()),
            backend.metadata().etag.clone(),
            Some(reader.stats()),
        ),
    };
    EntryInfo {
        file: entry.file.clone(),
        state: entry.resolution.state(),
        content_length,
        namespace,
        etag,
        last_modified: entry.last_modified(),
        last_validated: Some(entry.last_validated()),
        last_accessed: Some(entry.last_accessed.load(Ordering::Relaxed)),
        stats: entry.stats.snapshot(),
        coordinator,
    }
}

impl ManagerInner {
    fn now(&self) -> i64 {
        self.clock.now_secs()
    }

    /// Current entry of `file`, resolving it first if needed.
    async fn entry(self: &Arc<Self>, file: &str) -> CacheResult<Arc<Entry>> {
        let rx = {
            let mut registry = self.registry.lock().await;
            match registry.entries.get_mut(file) {
                Some(Slot::Ready(entry)) => {
                    entry.touch(self.now());
                    return Ok(entry.clone());
                }
                Some(Slot::Resolving(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    registry
                        .entries
                        .insert(file.to_string(), Slot::Resolving(vec![tx]));
                    self.spawn_resolve(file.to_string());
                    rx
                }
            }
        };
        rx.await
            .map_err(|_| CacheError::internal("resolution ended without a result"))?
    }

    fn spawn_resolve(self: &Arc<Self>, file: String) {
        let inner = self.clone();
        tokio::spawn(async move {
            let task_inner = inner.clone();
            let task_file = file.clone();
            let result = tokio::spawn(async move { task_inner.resolve(&task_file, true).await })
                .await
                .unwrap_or_else(|e| {
                    Err(CacheError::internal(format!("resolution task failed: {}", e)))
                });
            inner.finish_resolve(&file, result).await;
        });
    }

    async fn finish_resolve(&self, file: &str, result: CacheResult<Resolution>) {
        let mut registry = self.registry.lock().await;
        let waiters = match registry.entries.remove(file) {
            Some(Slot::Resolving(waiters)) => waiters,
            Some(ready @ Slot::Ready(_)) => {
                registry.entries.insert(file.to_string(), ready);
                Vec::new()
            }
            None => Vec::new(),
        };

        let outcome = result.map(|resolution| {
            let stats = registry.stats.entry(file.to_string()).or_default().clone();
            let entry = Arc::new(Entry::new(
                file.to_string(),
                resolution,
                stats,
                self.now(),
                self.cache.tick(),
            ));
            registry
                .entries
                .insert(file.to_string(), Slot::Ready(entry.clone()));
            entry
        });

        match &outcome {
            Ok(entry) => debug!(file, state = ?entry.resolution.state(), "Resolved file"),
            Err(e) => warn!(file, error = %e, "Resolution failed"),
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn local_path(&self, file: &str) -> CacheResult<Option<PathBuf>> {
        let Some(dir) = &self.local_dir else {
            return Ok(None);
        };
        let relative = Path::new(file);
        if file.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(CacheError::InvalidFormat(format!(
                "invalid logical file name: {:?}",
                file
            )));
        }
        Ok(Some(dir.join(relative)))
    }

    fn remote_url(&self, file: &str) -> Option<String> {
        self.remote_base_url
            .as_ref()
            .map(|base| format!("{}/{}", base, file.trim_start_matches('/')))
    }

    fn open_remote(&self, url: String, metadata: RemoteMetadata, validated_at: i64) -> Resolution {
        let key = BlockKey::new(&url, Some(&metadata.version()));
        let backend = Arc::new(RemoteRangeBackend::from_metadata(
            self.client.clone(),
            url,
            metadata,
            self.clock.clone(),
            validated_at,
        ));
        let source: Arc<dyn RangeSource> = backend.clone();
        let reader = ChunkedReader::from_coordinator(CacheCoordinator::with_max_run(
            self.cache.clone(),
            source,
            key,
            self.max_run_blocks,
        ));
        Resolution::Remote { backend, reader }
    }

    fn remember(&self, url: &str, metadata: Option<RemoteMetadata>, checked_at: i64) {
        if let Some(meta) = &self.meta {
            if let Err(e) = meta.put(url, &MetaRecord { metadata, checked_at }) {
                warn!(url, error = %e, "Failed to write meta-cache record");
            }
        }
    }

    /// Memoized metadata of `url`, if recent enough to skip a probe.
    fn recall(&self, url: &str, now: i64) -> Option<MetaRecord> {
        let meta = self.meta.as_ref()?;
        let record = match meta.get(url) {
            Ok(record) => record?,
            Err(e) => {
                warn!(url, error = %e, "Failed to read meta-cache record");
                return None;
            }
        };
        let last_modified = record.metadata.as_ref().and_then(|m| m.last_modified);
        let fresh_until =
            record.checked_at + self.policy.revalidate_every_seconds(last_modified, now);
        (now < fresh_until).then_some(record)
    }

    /// Resolve `file`: local first, then remote, else missing.
    async fn resolve(&self, file: &str, use_meta: bool) -> CacheResult<Resolution> {
        if let Some(path) = self.local_path(file)? {
            if let Some(local) = LocalFile::open(&path)? {
                return Ok(Resolution::Local(local));
            }
        }

        let Some(url) = self.remote_url(file) else {
            return Ok(Resolution::Missing);
        };
        let now = self.now();

        if use_meta {
            if let Some(record) = self.recall(&url, now) {
                debug!(file, url = %url, "Resolved from meta-cache");
                return Ok(match record.metadata {
                    Some(metadata) => self.open_remote(url, metadata, record.checked_at),
                    None => Resolution::Missing,
                });
            }
        }

        let metadata = probe_metadata(&self.client, &url).await?;
        self.remember(&url, metadata.clone(), now);
        Ok(match metadata {
            Some(metadata) => self.open_remote(url, metadata, now),
            None => Resolution::Missing,
        })
    }

    async fn read_entry<R, F>(
        &self,
        entry: &Entry,
        offset: u64,
        len: u64,
        f: &mut Option<F>,
    ) -> CacheResult<R>
    where
        F: FnOnce(&[u8]) -> R + Send,
        R: Send,
    {
        let result = match &entry.resolution {
            Resolution::Missing => Err(CacheError::not_found(entry.file.clone())),
            Resolution::Local(local) => {
                let bytes = local.slice(offset, len)?;
                f.take()
                    .map(|f| f(bytes))
                    .ok_or_else(|| CacheError::internal("read callback already used"))
            }
            Resolution::Remote { reader, .. } => reader
                .read(offset, len, |bytes| f.take().map(|f| f(bytes)))
                .await?
                .ok_or_else(|| CacheError::internal("read callback already used")),
        };
        if result.is_ok() {
            entry.stats.reads.fetch_add(1, Ordering::Relaxed);
            entry.stats.bytes_read.fetch_add(len, Ordering::Relaxed);
        }
        result
    }

    /// Drop the registry entry of `file`. With `expected`, only if it is
    /// still that entry.
    async fn invalidate_entry(&self, file: &str, expected: Option<&Arc<Entry>>) {
        {
            let mut registry = self.registry.lock().await;
            let matches = match (registry.entries.get(file), expected) {
                (Some(Slot::Ready(current)), Some(expected)) => Arc::ptr_eq(current, expected),
                (Some(Slot::Ready(_)), None) => true,
                _ => false,
            };
            if matches {
                registry.entries.remove(file);
                debug!(file, "Invalidated entry");
            }
        }
        if let (Some(meta), Some(url)) = (&self.meta, self.remote_url(file)) {
            if let Err(e) = meta.remove(&url) {
                warn!(url, error = %e, "Failed to remove meta-cache record");
            }
        }
    }

    /// Schedule deletion of `old`'s blocks if `new` moved to another namespace.
    async fn retire(&self, old: &Entry, new: &Entry) {
        let Some((key, blocks)) = old.resolution.namespace() else {
            return;
        };
        if new.resolution.namespace().map(|(k, _)| k) == Some(key) {
            return;
        }
        let due = self.now() + self.stale_grace_secs;
        self.registry
            .lock()
            .await
            .pending_deletes
            .push(PendingDelete { key, blocks, due });
    }

    /// Swap `old` for `new` if `old` is still the current entry of its file.
    async fn replace(&self, old: &Arc<Entry>, new: Option<Arc<Entry>>) -> bool {
        let mut registry = self.registry.lock().await;
        let current = matches!(
            registry.entries.get(&old.file),
            Some(Slot::Ready(entry)) if Arc::ptr_eq(entry, old)
        );
        if !current {
            return false;
        }
        match new {
            Some(entry) => {
                registry
                    .entries
                    .insert(old.file.clone(), Slot::Ready(entry));
            }
            None => {
                registry.entries.remove(&old.file);
            }
        }
        true
    }

    fn is_due(&self, entry: &Entry, now: i64) -> bool {
        match &entry.resolution {
            // Replacement of a local file is cheap to detect.
            Resolution::Local(_) => true,
            Resolution::Missing => {
                now >= entry.last_validated() + self.policy.revalidate_every_seconds(None, now)
            }
            Resolution::Remote { backend, .. } => {
                let every = self
                    .policy
                    .revalidate_every_seconds(backend.metadata().last_modified, now);
                now >= backend.last_validated() + every
            }
        }
    }

    async fn tick(&self) -> TickReport {
        let _serial = self.tick_lock.lock().await;
        let now = self.now();
        let mut report = TickReport::default();

        let (due, expired) = {
            let mut registry = self.registry.lock().await;

            let idle_before = now - self.idle_eviction_secs;
            let mut idle = Vec::new();
            registry.entries.retain(|file, slot| match slot {
                Slot::Ready(entry) if entry.last_accessed.load(Ordering::Relaxed) <= idle_before => {
                    idle.push(file.clone());
                    false
                }
                _ => true,
            });
            for file in &idle {
                registry.stats.remove(file);
                info!(file = %file, "Evicting idle entry");
            }
            report.evicted = idle.len();

            let due: Vec<Arc<Entry>> = registry
                .entries
                .values()
                .filter_map(|slot| match slot {
                    Slot::Ready(entry) if self.is_due(entry, now) => Some(entry.clone()),
                    _ => None,
                })
                .collect();

            let (expired, pending): (Vec<_>, Vec<_>) = registry
                .pending_deletes
                .drain(..)
                .partition(|p| p.due <= now);
            registry.pending_deletes = pending;

            (due, expired)
        };

        if report.evicted > 0 {
            self.counters
                .idle_evictions
                .fetch_add(report.evicted as u64, Ordering::Relaxed);
            counter!("remote_file_idle_evictions_total").increment(report.evicted as u64);
        }

        for pending in expired {
            let removed = self
                .cache
                .remove_namespace(pending.key.namespace(), pending.blocks);
            info!(
                namespace = pending.key.namespace(),
                removed, "Deleted blocks of outdated version"
            );
            report.deleted_blocks += removed;
        }

        for entry in due {
            self.revalidate(&entry, now, &mut report).await;
        }

        report
    }

    async fn revalidate(&self, entry: &Arc<Entry>, now: i64, report: &mut TickReport) {
        if let Resolution::Local(local) = &entry.resolution {
            if !local.is_unchanged() {
                info!(file = %entry.file, "Local file changed, resolving again");
                if self.replace(entry, None).await {
                    report.changed += 1;
                }
            }
            return;
        }

        report.revalidated += 1;
        entry.stats.revalidations.fetch_add(1, Ordering::Relaxed);
        self.counters.revalidations.fetch_add(1, Ordering::Relaxed);
        counter!("remote_file_revalidations_total").increment(1);

        let resolution = match self.resolve(&entry.file, false).await {
            Ok(resolution) => resolution,
            Err(e) => {
                // Keep serving the current resolution; retry next tick.
                warn!(file = %entry.file, error = %e, "Revalidation failed");
                return;
            }
        };

        let unchanged = match (&entry.resolution, &resolution) {
            (Resolution::Missing, Resolution::Missing) => true,
            (Resolution::Remote { .. }, Resolution::Remote { .. }) => {
                entry.resolution.version() == resolution.version()
                    && entry.resolution.namespace().map(|(_, b)| b)
                        == resolution.namespace().map(|(_, b)| b)
            }
            _ => false,
        };
        if unchanged {
            if let Resolution::Remote { backend, .. } = &entry.resolution {
                backend.mark_validated(now);
            }
            entry.checked_at.store(now, Ordering::Relaxed);
            entry
                .validated_tick
                .store(self.cache.tick(), Ordering::Relaxed);
            return;
        }

        let new_entry = Arc::new(Entry::replacing(
            entry,
            resolution,
            now,
            self.cache.tick(),
        ));
        if !self.replace(entry, Some(new_entry.clone())).await {
            return;
        }
        report.changed += 1;

        if let (
            Some((old_key, old_blocks)),
            Resolution::Remote {
                reader: new_reader, ..
            },
        ) = (entry.resolution.namespace(), &new_entry.resolution)
        {
            let touched = self.cache.keys_touched_since(
                old_key.namespace(),
                old_blocks,
                entry.validated_tick.load(Ordering::Relaxed),
            );
            info!(
                file = %entry.file,
                old = ?entry.resolution.version(),
                new = ?new_entry.resolution.version(),
                preload = touched.len(),
                "Remote file changed"
            );
            new_reader.prefetch_blocks(&touched);
            report.preloaded_blocks += touched.len();
            report.version_flips += 1;
            entry.stats.version_flips.fetch_add(1, Ordering::Relaxed);
            self.counters.version_flips.fetch_add(1, Ordering::Relaxed);
            counter!("remote_file_version_flips_total").increment(1);
        } else {
            info!(
                file = %entry.file,
                from = ?entry.resolution.state(),
                to = ?new_entry.resolution.state(),
                "File resolution changed"
            );
        }

        self.retire(entry, &new_entry).await;
    }
}
