//! Arbitrary byte-range reads over the fixed block grid.

use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;

use cache_common::{BlockKey, CacheError, CacheResult};

use crate::cache::BlockCache;
use crate::coordinator::{CacheCoordinator, CoordinatorStats};
use crate::source::RangeSource;

/// Reads `(offset, len)` ranges of a source through the block cache.
///
/// A range inside one block is handed to the caller as a sub-slice of the
/// cached block. Ranges over several blocks use a contiguous cached run when
/// one exists, and otherwise are assembled into a single scratch buffer.
#[derive(Clone)]
pub struct ChunkedReader {
    coordinator: CacheCoordinator,
    len: u64,
    block_size: u64,
}

impl ChunkedReader {
    pub fn new(cache: Arc<BlockCache>, source: Arc<dyn RangeSource>, key: BlockKey) -> Self {
        Self::from_coordinator(CacheCoordinator::new(cache, source, key))
    }

    pub fn from_coordinator(coordinator: CacheCoordinator) -> Self {
        let len = coordinator.source().len();
        let block_size = coordinator.cache().block_size() as u64;
        Self {
            coordinator,
            len,
            block_size,
        }
    }

    /// Length of the underlying source in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn key(&self) -> BlockKey {
        self.coordinator.key()
    }

    /// Number of blocks covering the whole source.
    pub fn block_count(&self) -> u64 {
        self.len.div_ceil(self.block_size)
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.coordinator.stats()
    }

    /// Block indices covering `[offset, offset + len)`.
    pub fn block_range(&self, offset: u64, len: u64) -> Range<u64> {
        if len == 0 {
            return offset / self.block_size..offset / self.block_size;
        }
        offset / self.block_size..(offset + len).div_ceil(self.block_size)
    }

    fn check_range(&self, offset: u64, len: u64) -> CacheResult<usize> {
        let in_bounds = offset
            .checked_add(len)
            .map_or(false, |end| end <= self.len);
        if !in_bounds {
            return Err(CacheError::InvalidRange {
                offset,
                len,
                file_len: self.len,
            });
        }
        usize::try_from(len).map_err(|_| CacheError::InvalidRange {
            offset,
            len,
            file_len: self.len,
        })
    }

    /// Run `f` on the bytes `[offset, offset + len)`.
    pub async fn read<R, F>(&self, offset: u64, len: u64, f: F) -> CacheResult<R>
    where
        F: FnOnce(&[u8]) -> R + Send,
        R: Send,
    {
        let len_usize = self.check_range(offset, len)?;
        if len_usize == 0 {
            return Ok(f(&[]));
        }

        let blocks = self.block_range(offset, len);
        let first = blocks.start;
        let count = blocks.end - blocks.start;
        let start_in_block = (offset - first * self.block_size) as usize;

        if count == 1 {
            let mut f = Some(f);
            let mut out = None;
            self.coordinator
                .fetch(first, 1, |_, block| {
                    let bytes = block
                        .get(start_in_block..start_in_block + len_usize)
                        .ok_or_else(|| short_block(first, block.len()))?;
                    if let Some(f) = f.take() {
                        out = Some(f(bytes));
                    }
                    Ok(())
                })
                .await?;
            return out.ok_or_else(|| CacheError::internal("block was not delivered"));
        }

        if let Some(run) = self
            .coordinator
            .cache()
            .get_run(self.key().block(first), count as usize)
        {
            return Ok(f(&run.as_slice()[start_in_block..start_in_block + len_usize]));
        }

        let mut scratch = vec![0u8; len_usize];
        let end = offset + len;
        let block_size = self.block_size;
        self.coordinator
            .fetch(first, count, |index, block| {
                let block_start = index * block_size;
                let lo = offset.max(block_start);
                let hi = end.min(block_start + block_size);
                let src = block
                    .get((lo - block_start) as usize..(hi - block_start) as usize)
                    .ok_or_else(|| short_block(index, block.len()))?;
                scratch[(lo - offset) as usize..(hi - offset) as usize].copy_from_slice(src);
                Ok(())
            })
            .await?;

        Ok(f(&scratch))
    }

    /// Copy `[offset, offset + len)` into an owned buffer.
    pub async fn read_bytes(&self, offset: u64, len: u64) -> CacheResult<Bytes> {
        self.read(offset, len, Bytes::copy_from_slice).await
    }

    /// Hint that `[offset, offset + len)` will be read soon. Out-of-bounds
    /// parts are ignored.
    pub fn prefetch(&self, offset: u64, len: u64) {
        let end = offset.saturating_add(len).min(self.len);
        if offset >= end {
            return;
        }
        let blocks = self.block_range(offset, end - offset);
        self.coordinator
            .prefetch(blocks.start, blocks.end - blocks.start);
    }

    /// Prefetch the given block indices, grouped into consecutive runs.
    pub fn prefetch_blocks(&self, indices: &[u64]) {
        let total = self.block_count();
        let mut sorted: Vec<u64> = indices.iter().copied().filter(|i| *i < total).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut iter = sorted.into_iter().peekable();
        while let Some(start) = iter.next() {
            let mut end = start + 1;
            while iter.peek() == Some(&end) {
                iter.next();
                end += 1;
            }
            self.coordinator.prefetch(start, end - start);
        }
    }
}

fn short_block(index: u64, got: usize) -> CacheError {
    CacheError::InvalidFormat(format!("block {} is only {} bytes", index, got))
}
