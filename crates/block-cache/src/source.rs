//! Byte-range sources that fill the block cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use cache_common::{CacheError, CacheResult};

/// A readable, fixed-length byte range backend.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch exactly `len` bytes at `offset`.
    async fn get_range(&self, offset: u64, len: u64) -> CacheResult<Bytes>;
}

/// In-memory source with call accounting, used for small fixtures and tests.
#[derive(Debug)]
pub struct MemorySource {
    data: Bytes,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<(u64, u64)>>,
    failure: Mutex<Option<CacheError>>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    /// Delay every fetch, to widen race windows in tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make every following fetch fail with `err` (or succeed again with `None`).
    pub fn set_failure(&self, err: Option<CacheError>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = err;
        }
    }

    /// Number of `get_range` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(offset, len)` of every call so far.
    pub fn requests(&self) -> Vec<(u64, u64)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RangeSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn get_range(&self, offset: u64, len: u64) -> CacheResult<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((offset, len));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(err);
        }

        let end = offset.checked_add(len).filter(|end| *end <= self.len());
        match end {
            Some(end) => Ok(self.data.slice(offset as usize..end as usize)),
            None => Err(CacheError::InvalidRange {
                offset,
                len,
                file_len: self.len(),
            }),
        }
    }
}
