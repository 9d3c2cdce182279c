//! Lock-free, fixed-capacity block cache over a [`BackingStorage`] region.
//!
//! ## Layout
//!
//! ```text
//! [ N x (key: u64, timestamp: u64) ][ N x block_size bytes ]
//! ```
//!
//! The table never resizes. A file-backed table survives restarts.
//!
//! ## Slot protocol
//!
//! The low bit of the timestamp is the commit flag: even and non-zero means a
//! writer holds the slot, odd means committed, zero means empty. Timestamps
//! are unique ticks from a per-cache counter. A compare-and-swap on the
//! timestamp word therefore only succeeds if the slot was not rewritten since
//! it was read, which makes it equivalent to a CAS on the `(key, timestamp)`
//! pair. The key word is only written by the writer holding the in-flight
//! state.
//!
//! Removal writes the tombstone `1`, an odd value no commit produces because
//! ticks start at 1. Lookups step over tombstones. An insert reuses one only
//! after the rest of the chain shows the key is absent. A used slot never
//! returns to zero, so an empty slot ends every probe chain.
//!
//! Readers may observe a slot that a writer starts to overwrite after the
//! reader validated it. [`BlockRef::is_current`] detects this after the fact.
//! A torn read degrades to a cache miss for callers that check; it never
//! changes which slot a key resolves to.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info};

use crate::storage::BackingStorage;

/// Maximum number of slots scanned from a key's home slot.
pub const MAX_PROBE: usize = 1024;

/// Bytes of metadata per slot.
pub const SLOT_META_SIZE: usize = 16;

/// Bounded retries for contended timestamp updates.
const MAX_CAS_RETRIES: usize = 16;

/// Bytes needed for a table of `capacity` slots of `block_size` bytes.
pub fn table_size(capacity: usize, block_size: usize) -> usize {
    capacity * (SLOT_META_SIZE + block_size)
}

fn committed(tick: u64) -> u64 {
    (tick << 1) | 1
}

fn in_flight(tick: u64) -> u64 {
    tick << 1
}

/// Timestamp of a removed slot.
const TOMBSTONE: u64 = 1;

fn is_committed(ts: u64) -> bool {
    ts & 1 == 1 && ts != TOMBSTONE
}

/// Counters for the block cache. All fields are atomic for lock-free reads.
#[derive(Debug, Default)]
pub struct BlockCacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    contention: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    /// Lost CAS races (writes abandoned or timestamp bumps retried).
    pub contention: u64,
    pub capacity: usize,
    pub block_size: usize,
}

impl BlockCacheStats {
    /// Hit rate as a percentage (0-100).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Lock-free block cache keyed by 64-bit block keys.
pub struct BlockCache {
    storage: Box<dyn BackingStorage>,
    block_size: usize,
    capacity: usize,
    probe: usize,
    clock: AtomicU64,
    counters: BlockCacheCounters,
}

/// View of one or more contiguous committed blocks.
pub struct BlockRef<'a> {
    cache: &'a BlockCache,
    key: u64,
    slot: usize,
    count: usize,
}

impl<'a> BlockRef<'a> {
    /// The block bytes, `count * block_size` long.
    pub fn as_slice(&self) -> &'a [u8] {
        self.cache.data(self.slot, self.count)
    }

    /// Number of blocks in this view.
    pub fn blocks(&self) -> usize {
        self.count
    }

    /// First slot index of the view.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Call after reading the bytes: true if every viewed slot is still
    /// committed under the same key, i.e. the bytes read were not torn by a
    /// concurrent overwrite with another key.
    pub fn is_current(&self) -> bool {
        std::sync::atomic::fence(Ordering::Acquire);
        (0..self.count).all(|i| {
            let slot = self.slot + i;
            is_committed(self.cache.ts(slot).load(Ordering::Acquire))
                && self.cache.key(slot).load(Ordering::Acquire) == self.key.wrapping_add(i as u64)
        })
    }
}

impl std::fmt::Debug for BlockRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRef")
            .field("slot", &self.slot)
            .field("count", &self.count)
            .finish()
    }
}

impl BlockCache {
    /// Build a cache over `storage` with blocks of `block_size` bytes.
    ///
    /// The slot count is `storage.len() / (16 + block_size)`. Slots left
    /// in-flight by a crashed writer are marked removed, and the tick counter
    /// resumes above the newest stored timestamp.
    pub fn new<S: BackingStorage + 'static>(mut storage: S, block_size: usize) -> Self {
        assert!(block_size > 0, "block_size must be > 0");
        let capacity = storage.len() / (SLOT_META_SIZE + block_size);
        assert!(capacity > 0, "storage too small for a single block");

        let (max_tick, reset) = storage.with_mutable_bytes(|bytes| {
            let mut max_tick = 0u64;
            let mut reset = 0usize;
            for slot in 0..capacity {
                let at = slot * SLOT_META_SIZE + 8;
                let mut word = [0u8; 8];
                word.copy_from_slice(&bytes[at..at + 8]);
                let ts = u64::from_le_bytes(word);
                if ts != 0 && ts & 1 == 0 {
                    bytes[at..at + 8].copy_from_slice(&TOMBSTONE.to_le_bytes());
                    reset += 1;
                } else {
                    max_tick = max_tick.max(ts >> 1);
                }
            }
            (max_tick, reset)
        });

        if reset > 0 {
            info!(slots = reset, "Reset in-flight cache slots left by previous run");
        }
        debug!(capacity, block_size, max_tick, "Block cache ready");

        Self {
            storage: Box::new(storage),
            block_size,
            capacity,
            probe: capacity.min(MAX_PROBE),
            clock: AtomicU64::new(max_tick),
            counters: BlockCacheCounters::default(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current value of the recency clock. Every insert and every hit moves
    /// it forward.
    pub fn tick(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn meta(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.capacity);
        // SAFETY: slot < capacity, so the 16-byte record lies inside the region.
        unsafe { self.storage.as_mut_ptr().add(slot * SLOT_META_SIZE) }
    }

    fn key(&self, slot: usize) -> &AtomicU64 {
        // SAFETY: the region is 8-byte aligned and only ever accessed as
        // atomics in the metadata area.
        unsafe { &*(self.meta(slot) as *const AtomicU64) }
    }

    fn ts(&self, slot: usize) -> &AtomicU64 {
        // SAFETY: see `key`.
        unsafe { &*(self.meta(slot).add(8) as *const AtomicU64) }
    }

    fn data_offset(&self, slot: usize) -> usize {
        self.capacity * SLOT_META_SIZE + slot * self.block_size
    }

    fn data(&self, slot: usize, count: usize) -> &[u8] {
        debug_assert!(slot + count <= self.capacity);
        // SAFETY: the range lies inside the data region. Concurrent writers may
        // overwrite these bytes; callers accept that weak consistency and can
        // check `BlockRef::is_current`.
        unsafe {
            std::slice::from_raw_parts(
                self.storage.as_mut_ptr().add(self.data_offset(slot)),
                count * self.block_size,
            )
        }
    }

    fn home(&self, key: u64) -> usize {
        (key % self.capacity as u64) as usize
    }

    /// Locate the committed slot holding `key` without touching recency.
    fn find(&self, key: u64) -> Option<(usize, u64)> {
        let home = self.home(key);
        for p in 0..self.probe {
            let slot = (home + p) % self.capacity;
            let ts = self.ts(slot).load(Ordering::Acquire);
            if ts == 0 {
                return None;
            }
            if !is_committed(ts) {
                continue;
            }
            if self.key(slot).load(Ordering::Acquire) == key {
                // Re-check so the key read belongs to this commit.
                if self.ts(slot).load(Ordering::Acquire) == ts {
                    return Some((slot, ts));
                }
            }
        }
        None
    }

    /// Move the slot's timestamp to a fresh tick. Returns the new timestamp,
    /// or `None` if a writer claimed the slot or it now holds another key.
    fn touch(&self, slot: usize, key: u64, mut observed: u64) -> Option<u64> {
        for _ in 0..MAX_CAS_RETRIES {
            let next = committed(self.next_tick());
            match self.ts(slot).compare_exchange(
                observed,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(next),
                Err(actual) => {
                    self.counters.contention.fetch_add(1, Ordering::Relaxed);
                    if !is_committed(actual) || self.key(slot).load(Ordering::Acquire) != key {
                        return None;
                    }
                    observed = actual;
                }
            }
        }
        // Another reader keeps bumping it; the block is evidently hot.
        Some(observed)
    }

    /// Whether `key` is cached, without updating recency or counters.
    pub fn contains(&self, key: u64) -> bool {
        self.find(key).is_some()
    }

    /// Recency timestamp tick of `key`, if cached.
    pub fn last_touched(&self, key: u64) -> Option<u64> {
        self.find(key).map(|(_, ts)| ts >> 1)
    }

    /// Look up a committed block and bump its recency.
    pub fn get(&self, key: u64) -> Option<BlockRef<'_>> {
        let found = self
            .find(key)
            .and_then(|(slot, ts)| self.touch(slot, key, ts).map(|_| slot));
        match found {
            Some(slot) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(BlockRef {
                    cache: self,
                    key,
                    slot,
                    count: 1,
                })
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return `count` consecutive keys starting at `key` as one contiguous
    /// view, only if they occupy `count` contiguous slots and all are
    /// committed.
    pub fn get_run(&self, key: u64, count: usize) -> Option<BlockRef<'_>> {
        if count == 0 {
            return None;
        }
        let (first, ts) = self.find(key)?;
        if first + count > self.capacity {
            return None;
        }

        let mut observed = Vec::with_capacity(count);
        observed.push(ts);
        for i in 1..count {
            let slot = first + i;
            let ts = self.ts(slot).load(Ordering::Acquire);
            let expected = key.wrapping_add(i as u64);
            if !is_committed(ts) || self.key(slot).load(Ordering::Acquire) != expected {
                return None;
            }
            observed.push(ts);
        }

        for (i, ts) in observed.into_iter().enumerate() {
            self.touch(first + i, key.wrapping_add(i as u64), ts)?;
        }
        self.counters
            .hits
            .fetch_add(count as u64, Ordering::Relaxed);

        Some(BlockRef {
            cache: self,
            key,
            slot: first,
            count,
        })
    }

    /// Store `value` under `key` and return a view of the stored block.
    ///
    /// `value` may be shorter than the block size (the last block of a file);
    /// the rest of the block is zero-filled. Returns `None` only when every
    /// candidate slot was lost to concurrent writers; the value is then simply
    /// not cached.
    pub fn set(&self, key: u64, value: &[u8]) -> Option<BlockRef<'_>> {
        assert!(
            value.len() <= self.block_size,
            "value of {} bytes exceeds block size {}",
            value.len(),
            self.block_size
        );

        let home = self.home(key);
        for _ in 0..MAX_CAS_RETRIES {
            let mut existing: Option<(usize, u64)> = None;
            let mut free: Option<(usize, u64)> = None;
            let mut oldest: Option<(usize, u64)> = None;

            for p in 0..self.probe {
                let slot = (home + p) % self.capacity;
                let ts = self.ts(slot).load(Ordering::Acquire);
                if ts == 0 || ts == TOMBSTONE {
                    free = free.or(Some((slot, ts)));
                    if ts == 0 {
                        break;
                    }
                    continue;
                }
                if !is_committed(ts) {
                    continue;
                }
                if self.key(slot).load(Ordering::Acquire) == key {
                    existing = Some((slot, ts));
                    break;
                }
                if oldest.map_or(true, |(_, oldest_ts)| ts < oldest_ts) {
                    oldest = Some((slot, ts));
                }
            }

            let evicting = existing.is_none() && free.is_none();
            let Some((slot, observed)) = existing.or(free).or(oldest) else {
                // Every probed slot is being written right now.
                self.counters.contention.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let claim = in_flight(self.next_tick());
            if self
                .ts(slot)
                .compare_exchange(observed, claim, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                self.counters.contention.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.key(slot).store(key, Ordering::Release);
            // SAFETY: this thread owns the slot while its timestamp is the
            // in-flight claim; the destination lies inside the data region.
            unsafe {
                let dst = self.storage.as_mut_ptr().add(self.data_offset(slot));
                std::ptr::copy_nonoverlapping(value.as_ptr(), dst, value.len());
                std::ptr::write_bytes(dst.add(value.len()), 0, self.block_size - value.len());
            }

            let commit = committed(self.next_tick());
            if self
                .ts(slot)
                .compare_exchange(claim, commit, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Only the owner moves an in-flight slot, so this is unreachable
                // unless the table is shared with another process.
                self.counters.contention.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.counters.inserts.fetch_add(1, Ordering::Relaxed);
            if evicting {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
            // A racing insert of the same key may have committed elsewhere in
            // the chain; only this copy stays.
            self.remove_copies(key, Some(slot));

            return Some(BlockRef {
                cache: self,
                key,
                slot,
                count: 1,
            });
        }

        debug!(key, "Gave up caching block after repeated contention");
        None
    }

    /// Issue a "will need" hint for a cached block. No-op if absent.
    pub fn prefetch(&self, key: u64) {
        if let Some((slot, _)) = self.find(key) {
            self.storage
                .advise(self.data_offset(slot), self.block_size);
        }
    }

    /// Remove `key` if it is cached and committed. Returns whether it was
    /// removed.
    pub fn remove(&self, key: u64) -> bool {
        self.remove_copies(key, None) > 0
    }

    /// Mark every committed copy of `key` in its probe chain removed, except
    /// the one in `keep`.
    fn remove_copies(&self, key: u64, keep: Option<usize>) -> usize {
        let home = self.home(key);
        let mut removed = 0;
        for p in 0..self.probe {
            let slot = (home + p) % self.capacity;
            let ts = self.ts(slot).load(Ordering::Acquire);
            if ts == 0 {
                break;
            }
            if Some(slot) == keep || !is_committed(ts) {
                continue;
            }
            if self.key(slot).load(Ordering::Acquire) == key && self.clear_slot(slot, ts) {
                removed += 1;
            }
        }
        removed
    }

    fn clear_slot(&self, slot: usize, observed: u64) -> bool {
        self.ts(slot)
            .compare_exchange(observed, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn in_namespace(key: u64, namespace: u64, blocks: u64) -> bool {
        key.wrapping_sub(namespace) < blocks
    }

    /// Block indices of `[namespace, namespace + blocks)` that are cached and
    /// were touched after `since_tick`. Scans the whole table.
    pub fn keys_touched_since(&self, namespace: u64, blocks: u64, since_tick: u64) -> Vec<u64> {
        let mut indices = Vec::new();
        for slot in 0..self.capacity {
            let ts = self.ts(slot).load(Ordering::Acquire);
            if !is_committed(ts) || (ts >> 1) <= since_tick {
                continue;
            }
            let key = self.key(slot).load(Ordering::Acquire);
            if Self::in_namespace(key, namespace, blocks) {
                indices.push(key.wrapping_sub(namespace));
            }
        }
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Remove every cached block of `[namespace, namespace + blocks)`.
    /// Scans the whole table and returns the number of slots cleared.
    pub fn remove_namespace(&self, namespace: u64, blocks: u64) -> usize {
        let mut removed = 0;
        for slot in 0..self.capacity {
            let ts = self.ts(slot).load(Ordering::Acquire);
            if !is_committed(ts) {
                continue;
            }
            let key = self.key(slot).load(Ordering::Acquire);
            if Self::in_namespace(key, namespace, blocks) && self.clear_slot(slot, ts) {
                removed += 1;
            }
        }
        removed
    }

    pub fn stats(&self) -> BlockCacheStats {
        BlockCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            contention: self.counters.contention.load(Ordering::Relaxed),
            capacity: self.capacity,
            block_size: self.block_size,
        }
    }

    /// Flush a file-backed table to disk.
    pub fn flush(&self) -> cache_common::CacheResult<()> {
        self.storage.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{HeapStorage, MmapStorage};
    use std::sync::Arc;

    const BS: usize = 64;

    fn heap_cache(slots: usize) -> BlockCache {
        BlockCache::new(HeapStorage::new(table_size(slots, BS)), BS)
    }

    fn block(fill: u8) -> Vec<u8> {
        vec![fill; BS]
    }

    #[test]
    fn test_set_then_get() {
        let cache = heap_cache(16);
        assert!(cache.get(5).is_none());

        let stored = cache.set(5, &block(9)).unwrap();
        assert_eq!(stored.as_slice(), &block(9)[..]);

        let got = cache.get(5).unwrap();
        assert_eq!(got.as_slice(), &block(9)[..]);
        assert!(got.is_current());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.inserts, 1);
    }

    #[test]
    fn test_set_overwrites_same_key() {
        let cache = heap_cache(16);
        let first = cache.set(3, &block(1)).unwrap().slot();
        let second = cache.set(3, &block(2)).unwrap().slot();
        assert_eq!(first, second);
        assert_eq!(cache.get(3).unwrap().as_slice(), &block(2)[..]);
    }

    #[test]
    fn test_short_value_zero_padded() {
        let cache = heap_cache(4);
        cache.set(1, &block(0xff)).unwrap();
        cache.set(1, &[7u8; 10]).unwrap();

        let got = cache.get(1).unwrap();
        let bytes = got.as_slice();
        assert_eq!(&bytes[..10], &[7u8; 10]);
        assert!(bytes[10..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_many_keys_roundtrip() {
        let cache = heap_cache(256);
        for key in 1000..1100u64 {
            cache.set(key, &block(key as u8)).unwrap();
        }
        for key in 1000..1100u64 {
            assert_eq!(cache.get(key).unwrap().as_slice()[0], key as u8);
        }
    }

    #[test]
    fn test_eviction_reuses_lowest_timestamp() {
        let cache = heap_cache(8);
        for key in 0..8u64 {
            cache.set(key, &block(key as u8)).unwrap();
        }
        // Key 0 becomes the most recently used; key 1 is now the oldest.
        assert!(cache.get(0).is_some());

        let slot = cache.set(8, &block(8)).unwrap().slot();
        assert_eq!(slot, 1);

        assert!(cache.get(1).is_none());
        assert!(cache.get(0).is_some());
        assert_eq!(cache.get(8).unwrap().as_slice(), &block(8)[..]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_get_run_requires_contiguous_slots() {
        let cache = heap_cache(16);
        for key in 20..23u64 {
            cache.set(key, &block(key as u8)).unwrap();
        }

        let run = cache.get_run(20, 3).unwrap();
        assert_eq!(run.blocks(), 3);
        let bytes = run.as_slice();
        assert_eq!(bytes.len(), 3 * BS);
        assert_eq!(bytes[0], 20);
        assert_eq!(bytes[BS], 21);
        assert_eq!(bytes[2 * BS], 22);

        // Missing tail block.
        assert!(cache.get_run(20, 4).is_none());
    }

    #[test]
    fn test_get_run_rejects_wrap_around() {
        let cache = heap_cache(4);
        // Keys 3 and 4 hash to slots 3 and 0: present but not contiguous.
        cache.set(3, &block(3)).unwrap();
        cache.set(4, &block(4)).unwrap();
        assert!(cache.get(3).is_some());
        assert!(cache.get(4).is_some());
        assert!(cache.get_run(3, 2).is_none());
    }

    #[test]
    fn test_remove_and_namespace_maintenance() {
        let cache = heap_cache(64);
        let ns = 1_000u64;
        for i in 0..5u64 {
            cache.set(ns + i, &block(i as u8)).unwrap();
        }
        cache.set(5_000, &block(1)).unwrap();

        assert!(cache.remove(ns + 4));
        assert!(!cache.remove(ns + 4));

        let since = cache.tick();
        assert!(cache.get(ns + 1).is_some());
        assert!(cache.get(ns + 3).is_some());
        assert_eq!(cache.keys_touched_since(ns, 5, since), vec![1, 3]);

        assert_eq!(cache.remove_namespace(ns, 5), 4);
        assert!(!cache.contains(ns));
        assert!(cache.contains(5_000));
    }

    #[test]
    fn test_reclaim_stays_inside_probe_window() {
        let slots = 2 * MAX_PROBE;
        let cache = heap_cache(slots);
        // Oldest block in the table, outside the window of home slot 0.
        let outside = (slots - 1) as u64;
        cache.set(outside, &block(0xee)).unwrap();
        for key in 0..MAX_PROBE as u64 {
            cache.set(key, &block(key as u8)).unwrap();
        }
        assert!(cache.get(0).is_some());

        let slot = cache.set(slots as u64, &block(0xaa)).unwrap().slot();
        assert_eq!(slot, 1);
        assert!(!cache.contains(1));
        assert!((2..MAX_PROBE as u64).all(|key| cache.contains(key)));
        assert_eq!(cache.get(outside).unwrap().as_slice(), &block(0xee)[..]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_remove_keeps_rest_of_chain_reachable() {
        let cache = heap_cache(8);
        cache.set(0, &block(0)).unwrap();
        assert_eq!(cache.set(8, &block(8)).unwrap().slot(), 1);

        assert!(cache.remove(0));
        assert_eq!(cache.get(8).unwrap().as_slice(), &block(8)[..]);

        // The removed slot is reused by the next key of the chain.
        assert_eq!(cache.set(16, &block(16)).unwrap().slot(), 0);
        assert!(cache.get(8).is_some());
        assert!(cache.get(16).is_some());
    }

    #[test]
    fn test_namespace_removal_keeps_colliding_keys() {
        let cache = heap_cache(8);
        // Both home to slot 4.
        cache.set(100, &block(1)).unwrap();
        cache.set(108, &block(2)).unwrap();

        assert_eq!(cache.remove_namespace(100, 1), 1);
        assert!(!cache.contains(100));
        assert_eq!(cache.get(108).unwrap().as_slice(), &block(2)[..]);
    }

    #[test]
    fn test_rewrite_after_remove_leaves_no_stale_copy() {
        let cache = heap_cache(8);
        cache.set(0, &block(1)).unwrap();
        cache.set(8, &block(2)).unwrap();
        assert!(cache.remove(0));

        // Key 8 is rewritten in place, not in the freed slot ahead of it.
        assert_eq!(cache.set(8, &block(3)).unwrap().slot(), 1);
        assert_eq!(cache.get(8).unwrap().as_slice(), &block(3)[..]);

        assert!(cache.remove(8));
        cache.set(16, &block(4)).unwrap();
        assert!(cache.get(8).is_none());
        assert_eq!(cache.get(16).unwrap().as_slice(), &block(4)[..]);
    }

    #[test]
    fn test_set_collapses_duplicate_copies() {
        let mut storage = HeapStorage::new(table_size(4, BS));
        storage.with_mutable_bytes(|bytes| {
            // Key 4 committed twice in its chain, slots 0 and 1.
            for (slot, ts) in [(0usize, 11u64), (1, 13)] {
                let at = slot * SLOT_META_SIZE;
                bytes[at..at + 8].copy_from_slice(&4u64.to_le_bytes());
                bytes[at + 8..at + 16].copy_from_slice(&ts.to_le_bytes());
            }
        });
        let cache = BlockCache::new(storage, BS);

        assert_eq!(cache.set(4, &block(9)).unwrap().slot(), 0);
        assert_eq!(cache.get(4).unwrap().as_slice(), &block(9)[..]);
        assert!(cache.remove(4));
        assert!(cache.get(4).is_none());
    }

    #[test]
    fn test_prefetch_absent_is_noop() {
        let cache = heap_cache(4);
        cache.prefetch(99);
        cache.set(1, &block(1)).unwrap();
        cache.prefetch(1);
    }

    #[test]
    fn test_persisted_table_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.bin");
        let size = table_size(32, BS);

        let tick_before = {
            let cache = BlockCache::new(MmapStorage::open(&path, size).unwrap(), BS);
            cache.set(77, &block(7)).unwrap();
            cache.flush().unwrap();
            cache.tick()
        };

        let cache = BlockCache::new(MmapStorage::open(&path, size).unwrap(), BS);
        assert_eq!(cache.get(77).unwrap().as_slice(), &block(7)[..]);
        assert!(cache.tick() >= tick_before);
    }

    #[test]
    fn test_inflight_slots_reset_on_open() {
        let mut storage = HeapStorage::new(table_size(4, BS));
        storage.with_mutable_bytes(|bytes| {
            // Slot 2: key 2, even (in-flight) timestamp.
            bytes[32..40].copy_from_slice(&2u64.to_le_bytes());
            bytes[40..48].copy_from_slice(&10u64.to_le_bytes());
        });
        let cache = BlockCache::new(storage, BS);
        assert!(!cache.contains(2));
        assert!(cache.set(2, &block(2)).is_some());
    }

    #[test]
    fn test_inflight_reset_keeps_chain_reachable() {
        let mut storage = HeapStorage::new(table_size(4, BS));
        storage.with_mutable_bytes(|bytes| {
            // Slot 0: key 0 left in flight. Slot 1: key 4 committed behind it.
            bytes[8..16].copy_from_slice(&10u64.to_le_bytes());
            bytes[16..24].copy_from_slice(&4u64.to_le_bytes());
            bytes[24..32].copy_from_slice(&11u64.to_le_bytes());
        });
        let cache = BlockCache::new(storage, BS);
        assert!(!cache.contains(0));
        assert!(cache.get(4).is_some());
        assert!(cache.tick() >= 5);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let cache = Arc::new(heap_cache(128));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        let key = t * 1_000 + (i % 40);
                        cache.set(key, &[key as u8; BS]);
                        if let Some(found) = cache.get(key) {
                            let copy = found.as_slice().to_vec();
                            // Only trust the bytes if nobody rewrote the slot.
                            if found.is_current() {
                                assert!(copy.iter().all(|b| *b == key as u8));
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.stats().inserts > 0);
    }
}
