//! End-to-end tests of the file manager against an in-process range server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use block_cache::{table_size, BlockCache, HeapStorage};
use remote_file::{
    CacheError, EntryState, FileCacheConfig, ManualClock, RemoteFileManager, TieredRevalidation,
};
use test_utils::{assert_pattern, eventually, files, pattern_bytes, sizes, DataDir, RangeServer};

const BS: u64 = sizes::BLOCK_SIZE as u64;

struct Harness {
    server: RangeServer,
    data: DataDir,
    clock: Arc<ManualClock>,
    manager: RemoteFileManager,
}

fn new_cache() -> Arc<BlockCache> {
    Arc::new(BlockCache::new(
        HeapStorage::new(table_size(sizes::CACHE_SLOTS, sizes::BLOCK_SIZE)),
        sizes::BLOCK_SIZE,
    ))
}

fn config(server: &RangeServer, data: &DataDir, meta: Option<PathBuf>) -> FileCacheConfig {
    FileCacheConfig {
        local_data_dir: Some(data.path().to_path_buf()),
        remote_base_url: Some(server.base_url().to_string()),
        meta_cache_path: meta,
        meta_cache_records: 64,
        ..Default::default()
    }
}

fn build_manager(
    config: &FileCacheConfig,
    clock: &Arc<ManualClock>,
    cache: Arc<BlockCache>,
) -> RemoteFileManager {
    RemoteFileManager::with_parts(
        cache,
        config,
        clock.clone(),
        Arc::new(TieredRevalidation::default()),
    )
    .unwrap()
}

async fn harness() -> Harness {
    let server = RangeServer::start().await.unwrap();
    let data = DataDir::new().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let manager = build_manager(&config(&server, &data, None), &clock, new_cache());
    Harness {
        server,
        data,
        clock,
        manager,
    }
}

impl Harness {
    fn now(&self) -> i64 {
        use remote_file::Clock;
        self.clock.now_secs()
    }
}

#[tokio::test]
async fn test_local_file_preferred_over_remote() {
    let h = harness().await;
    h.server.put(files::TEMPERATURE, pattern_bytes(5000, 2));
    h.data
        .write(files::TEMPERATURE, &pattern_bytes(5000, 1))
        .unwrap();

    let parts = h
        .manager
        .read(files::TEMPERATURE, &[(0, 100), (4000, 1000)])
        .await
        .unwrap();
    assert_pattern!(parts[0], 0, 1);
    assert_pattern!(parts[1], 4000, 1);
    assert_eq!(h.server.head_count(), 0);
    assert_eq!(h.server.get_count(), 0);

    let info = h.manager.entry_info(files::TEMPERATURE).await.unwrap();
    assert_eq!(info.state, EntryState::Local);
}

#[tokio::test]
async fn test_remote_read_then_cache_hit() {
    let h = harness().await;
    h.server.put(files::TEMPERATURE, pattern_bytes(10_000, 1));

    let parts = h
        .manager
        .read(files::TEMPERATURE, &[(0, 100), (5000, 3000), (9990, 10)])
        .await
        .unwrap();
    assert_pattern!(parts[0], 0, 1);
    assert_pattern!(parts[1], 5000, 1);
    assert_pattern!(parts[2], 9990, 1);
    assert_eq!(h.server.head_count(), 1);
    let gets = h.server.get_count();
    assert!(gets >= 1);

    let again = h
        .manager
        .read_with(files::TEMPERATURE, 5000, 3000, |b| b.to_vec())
        .await
        .unwrap();
    assert_pattern!(again, 5000, 1);
    assert_eq!(h.server.get_count(), gets);

    let info = h.manager.entry_info(files::TEMPERATURE).await.unwrap();
    assert_eq!(info.state, EntryState::Remote);
    assert_eq!(info.content_length, Some(10_000));
    assert!(info.namespace.is_some());
    assert_eq!(info.stats.reads, 4);

    let err = h
        .manager
        .read(files::TEMPERATURE, &[(9990, 11)])
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidRange { .. }));
}

#[tokio::test]
async fn test_ranged_requests_carry_validators() {
    let h = harness().await;
    let object = h.server.put(files::TEMPERATURE, pattern_bytes(4000, 1));

    h.manager
        .read(files::TEMPERATURE, &[(BS + 10, 10)])
        .await
        .unwrap();

    let requests = h.server.requests();
    assert_eq!(requests[0].method, "HEAD");
    let get = requests.iter().find(|r| r.method == "GET").unwrap();
    assert_eq!(get.range.as_deref(), Some("bytes=1024-2047"));
    assert_eq!(get.path, files::TEMPERATURE);
    assert!(object.etag.starts_with('"'));
}

#[tokio::test]
async fn test_missing_file_backoff() {
    let h = harness().await;

    let err = h.manager.read(files::MISSING, &[(0, 1)]).await.unwrap_err();
    assert_eq!(err, CacheError::NotFound(files::MISSING.to_string()));
    assert_eq!(h.server.head_count(), 1);

    // Reads of a known-missing file do not probe again.
    assert!(h.manager.read(files::MISSING, &[(0, 1)]).await.is_err());
    assert_eq!(h.server.head_count(), 1);

    h.clock.advance(179);
    assert_eq!(h.manager.tick().await.revalidated, 0);
    assert_eq!(h.server.head_count(), 1);

    h.clock.advance(1);
    let report = h.manager.tick().await;
    assert_eq!(report.revalidated, 1);
    assert_eq!(report.changed, 0);
    assert_eq!(h.server.head_count(), 2);

    // The file appears; the next due probe picks it up.
    h.server.put(files::MISSING, pattern_bytes(300, 5));
    h.clock.advance(180);
    let report = h.manager.tick().await;
    assert_eq!(report.changed, 1);
    let parts = h.manager.read(files::MISSING, &[(0, 300)]).await.unwrap();
    assert_pattern!(parts[0], 0, 5);
}

#[tokio::test]
async fn test_version_flip_preloads_and_deletes_after_grace() {
    let h = harness().await;
    let len = BS as usize * 6;
    h.server
        .put_modified_at(files::TEMPERATURE, pattern_bytes(len, 1), h.now() - 10);

    let parts = h
        .manager
        .read(files::TEMPERATURE, &[(0, BS * 3)])
        .await
        .unwrap();
    assert_pattern!(parts[0], 0, 1);
    let old_namespace = h
        .manager
        .entry_info(files::TEMPERATURE)
        .await
        .unwrap()
        .namespace;

    h.server
        .put_modified_at(files::TEMPERATURE, pattern_bytes(len, 2), h.now() - 5);

    // Recently modified files are revalidated every 60 seconds.
    h.clock.advance(59);
    assert_eq!(h.manager.tick().await.revalidated, 0);
    h.clock.advance(1);
    let report = h.manager.tick().await;
    assert_eq!(report.revalidated, 1);
    assert_eq!(report.version_flips, 1);
    assert_eq!(report.preloaded_blocks, 3);

    let info = h.manager.entry_info(files::TEMPERATURE).await.unwrap();
    assert_ne!(info.namespace, old_namespace);
    assert_eq!(info.stats.version_flips, 1);

    // Blocks touched under the old version are fetched for the new one.
    let manager = h.manager.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let manager = manager.clone();
            async move {
                manager
                    .entry_info(files::TEMPERATURE)
                    .await
                    .and_then(|i| i.coordinator)
                    .map_or(false, |c| c.blocks_fetched >= 3)
            }
        })
        .await
    );
    h.server.reset_counts();
    let parts = h
        .manager
        .read(files::TEMPERATURE, &[(0, BS * 3)])
        .await
        .unwrap();
    assert_pattern!(parts[0], 0, 2);
    assert_eq!(h.server.get_count(), 0);

    // Old blocks survive until the grace period ends.
    assert_eq!(h.manager.stats().await.pending_deletes, 1);
    h.clock.advance(59);
    assert_eq!(h.manager.tick().await.deleted_blocks, 0);
    h.clock.advance(1);
    assert_eq!(h.manager.tick().await.deleted_blocks, 3);
    assert_eq!(h.manager.stats().await.pending_deletes, 0);

    // Deleting the old version leaves the new blocks cached.
    h.server.reset_counts();
    let parts = h
        .manager
        .read(files::TEMPERATURE, &[(0, BS * 3)])
        .await
        .unwrap();
    assert_pattern!(parts[0], 0, 2);
    assert_eq!(h.server.get_count(), 0);
}

#[tokio::test]
async fn test_unchanged_remote_keeps_namespace() {
    let h = harness().await;
    // Old files fall in the stable tier.
    h.server
        .put_modified_at(files::WIND, pattern_bytes(2000, 1), h.now() - 86_400);
    h.manager.read(files::WIND, &[(0, 10)]).await.unwrap();
    let before = h.manager.entry_info(files::WIND).await.unwrap();

    // Keep the entry from going idle.
    h.clock.advance(3599);
    h.manager.read(files::WIND, &[(0, 10)]).await.unwrap();
    assert_eq!(h.manager.tick().await.revalidated, 0);
    h.clock.advance(1);
    let report = h.manager.tick().await;
    assert_eq!(report.revalidated, 1);
    assert_eq!(report.changed, 0);

    let after = h.manager.entry_info(files::WIND).await.unwrap();
    assert_eq!(after.namespace, before.namespace);
    assert_eq!(after.last_validated, Some(h.now()));
}

#[tokio::test]
async fn test_stale_content_resolves_again_once() {
    let h = harness().await;
    h.server.put(files::TEMPERATURE, pattern_bytes(4000, 1));
    let parts = h.manager.read(files::TEMPERATURE, &[(0, 100)]).await.unwrap();
    assert_pattern!(parts[0], 0, 1);

    // The object changes without a tick noticing; the next uncached block
    // fails its If-Match and the read is retried on the new version.
    h.server.put(files::TEMPERATURE, pattern_bytes(4000, 2));
    let parts = h
        .manager
        .read(files::TEMPERATURE, &[(2 * BS, 100)])
        .await
        .unwrap();
    assert_pattern!(parts[0], 2 * BS, 2);
    assert_eq!(h.server.head_count(), 2);

    let info = h.manager.entry_info(files::TEMPERATURE).await.unwrap();
    assert_eq!(info.stats.stale_retries, 1);
    let stats = h.manager.stats().await;
    assert_eq!(stats.stale_retries, 1);
    assert_eq!(stats.pending_deletes, 1);
}

#[tokio::test]
async fn test_shrunk_object_maps_416_to_stale() {
    let h = harness().await;
    h.server.put(files::TEMPERATURE, pattern_bytes(4000, 1));
    h.manager.read(files::TEMPERATURE, &[(0, 10)]).await.unwrap();

    h.server.set_ignore_preconditions(true);
    h.server.put(files::TEMPERATURE, pattern_bytes(1500, 2));

    // Block 2 now starts past the end: 416, re-resolution, and the retry
    // sees the new, shorter length.
    let err = h
        .manager
        .read(files::TEMPERATURE, &[(2 * BS, 100)])
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidRange { file_len: 1500, .. }));
    assert_eq!(h.manager.stats().await.stale_retries, 1);
}

#[tokio::test]
async fn test_idle_entries_are_evicted() {
    let h = harness().await;
    h.server
        .put_modified_at(files::TEMPERATURE, pattern_bytes(3000, 1), h.now() - 86_400);
    h.manager.read(files::TEMPERATURE, &[(0, 3000)]).await.unwrap();
    let gets = h.server.get_count();

    h.clock.advance(899);
    assert_eq!(h.manager.tick().await.evicted, 0);
    h.clock.advance(1);
    let report = h.manager.tick().await;
    assert_eq!(report.evicted, 1);
    assert!(h.manager.entry_info(files::TEMPERATURE).await.is_none());
    assert!(h.manager.is_empty().await);

    // Resolving again lands in the same namespace; cached blocks are reused.
    let parts = h
        .manager
        .read(files::TEMPERATURE, &[(0, 3000)])
        .await
        .unwrap();
    assert_pattern!(parts[0], 0, 1);
    assert_eq!(h.server.head_count(), 2);
    assert_eq!(h.server.get_count(), gets);
    assert_eq!(h.manager.stats().await.idle_evictions, 1);
}

#[tokio::test]
async fn test_local_deletion_falls_back_to_remote() {
    let h = harness().await;
    h.data.write(files::WIND, &pattern_bytes(2000, 1)).unwrap();
    h.server.put(files::WIND, pattern_bytes(2000, 2));

    let parts = h.manager.read(files::WIND, &[(0, 2000)]).await.unwrap();
    assert_pattern!(parts[0], 0, 1);

    h.data.remove(files::WIND).unwrap();
    let report = h.manager.tick().await;
    assert_eq!(report.changed, 1);
    assert!(h.manager.entry_info(files::WIND).await.is_none());

    let parts = h.manager.read(files::WIND, &[(0, 2000)]).await.unwrap();
    assert_pattern!(parts[0], 0, 2);
    assert_eq!(
        h.manager.entry_info(files::WIND).await.unwrap().state,
        EntryState::Remote
    );
}

#[tokio::test]
async fn test_local_replacement_is_picked_up() {
    let h = harness().await;
    h.data.write(files::WIND, &pattern_bytes(2000, 1)).unwrap();
    h.manager.read(files::WIND, &[(0, 10)]).await.unwrap();

    h.data.replace(files::WIND, &pattern_bytes(2500, 3)).unwrap();
    assert_eq!(h.manager.tick().await.changed, 1);

    let parts = h.manager.read(files::WIND, &[(2000, 500)]).await.unwrap();
    assert_pattern!(parts[0], 2000, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_reads_share_one_probe_and_fetch() {
    let h = harness().await;
    h.server.put(files::TEMPERATURE, pattern_bytes(4000, 1));
    h.server.set_delay(Duration::from_millis(100));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            manager.read(files::TEMPERATURE, &[(10, 100)]).await
        }));
    }
    for handle in handles {
        let parts = handle.await.unwrap().unwrap();
        assert_pattern!(parts[0], 10, 1);
    }

    assert_eq!(h.server.head_count(), 1);
    assert_eq!(h.server.get_count(), 1);
}

#[tokio::test]
async fn test_meta_cache_skips_probe_on_restart() {
    let h = harness().await;
    let meta_dir = tempfile::tempdir().unwrap();
    let config = config(&h.server, &h.data, Some(meta_dir.path().join("meta.bin")));
    h.server.put(files::TEMPERATURE, pattern_bytes(4000, 1));

    let first = build_manager(&config, &h.clock, new_cache());
    first.read(files::TEMPERATURE, &[(0, 10)]).await.unwrap();
    first.flush().unwrap();
    assert_eq!(h.server.head_count(), 1);
    drop(first);

    let second = build_manager(&config, &h.clock, new_cache());
    let parts = second.read(files::TEMPERATURE, &[(0, 10)]).await.unwrap();
    assert_pattern!(parts[0], 0, 1);
    assert_eq!(h.server.head_count(), 1);

    // Invalidation forgets the memo as well.
    second.invalidate(files::TEMPERATURE).await;
    second.read(files::TEMPERATURE, &[(0, 10)]).await.unwrap();
    assert_eq!(h.server.head_count(), 2);
}

#[tokio::test]
async fn test_meta_cache_expires_with_policy() {
    let h = harness().await;
    let meta_dir = tempfile::tempdir().unwrap();
    let config = config(&h.server, &h.data, Some(meta_dir.path().join("meta.bin")));

    let first = build_manager(&config, &h.clock, new_cache());
    assert!(first.read(files::MISSING, &[(0, 1)]).await.is_err());
    assert_eq!(h.server.head_count(), 1);

    h.clock.advance(180);
    let second = build_manager(&config, &h.clock, new_cache());
    assert!(second.read(files::MISSING, &[(0, 1)]).await.is_err());
    assert_eq!(h.server.head_count(), 2);
}

#[tokio::test]
async fn test_prefetch_warms_cache() {
    let h = harness().await;
    h.server.put(files::TEMPERATURE, pattern_bytes(8000, 1));

    h.manager
        .prefetch(files::TEMPERATURE, &[(0, 8000)])
        .await
        .unwrap();
    let manager = h.manager.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let manager = manager.clone();
            async move {
                manager
                    .entry_info(files::TEMPERATURE)
                    .await
                    .and_then(|i| i.coordinator)
                    .map_or(false, |c| c.blocks_fetched == 8)
            }
        })
        .await
    );

    let gets = h.server.get_count();
    let parts = h
        .manager
        .read(files::TEMPERATURE, &[(100, 7000)])
        .await
        .unwrap();
    assert_pattern!(parts[0], 100, 1);
    assert_eq!(h.server.get_count(), gets);
}

#[tokio::test]
async fn test_background_revalidation_task() {
    let h = harness().await;
    assert!(h.manager.read(files::MISSING, &[(0, 1)]).await.is_err());
    h.clock.advance(180);

    let task = h.manager.spawn_revalidation(Duration::from_millis(20));
    let server = &h.server;
    assert!(
        eventually(Duration::from_secs(5), move || async move { server.head_count() >= 2 })
            .await
    );
    task.abort();
}
