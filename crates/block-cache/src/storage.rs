//! Fixed-size byte regions that back the block cache table.
//!
//! The cache accesses the region concurrently through atomics and raw
//! pointers; exclusive `&mut` access is only used while no cache exists yet
//! (validation and reset on open).

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;

use memmap2::MmapMut;
use tracing::{debug, info, warn};

use cache_common::CacheResult;

/// A directly addressable, fixed-size memory region.
pub trait BackingStorage: Send + Sync {
    /// Size of the region in bytes. Never changes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Base pointer for shared concurrent access. The region is at least
    /// 8-byte aligned and valid for `len()` bytes while `self` lives.
    fn as_mut_ptr(&self) -> *mut u8;

    /// Exclusive view of the whole region.
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Best-effort "will need" hint. No-op where unsupported.
    fn advise(&self, _offset: usize, _len: usize) {}

    /// Persist dirty pages, if the region is file backed.
    fn flush(&self) -> CacheResult<()> {
        Ok(())
    }

    /// Scoped exclusive access to the whole region.
    fn with_mutable_bytes<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R
    where
        Self: Sized,
    {
        f(self.bytes_mut())
    }
}

/// Heap-allocated region, used when no cache file is configured and in tests.
pub struct HeapStorage {
    // AtomicU64 words give 8-byte alignment and interior mutability, so writes
    // through the shared base pointer are permitted.
    words: Box<[AtomicU64]>,
    len: usize,
}

impl HeapStorage {
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(8)).map(|_| AtomicU64::new(0)).collect();
        Self { words, len }
    }
}

impl BackingStorage for HeapStorage {
    fn len(&self) -> usize {
        self.len
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: `&mut self` guarantees exclusive access; the allocation holds
        // at least `len` bytes and u8 has no alignment requirement.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }
}

/// Memory-mapped file region. The file is reused across restarts when its
/// size matches the requested size.
pub struct MmapStorage {
    mmap: MmapMut,
    ptr: *mut u8,
    path: PathBuf,
    reused: bool,
}

// SAFETY: `ptr` points into `mmap`, which is owned by this struct and never
// remapped. All concurrent access through `ptr` is coordinated by the cache
// using atomics on the metadata region.
unsafe impl Send for MmapStorage {}
unsafe impl Sync for MmapStorage {}

impl MmapStorage {
    /// Open or create the cache file at `path` with exactly `len` bytes.
    pub fn open(path: impl AsRef<Path>, len: usize) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let existing = file.metadata()?.len();
        let reused = existing == len as u64;
        if !reused {
            if existing != 0 {
                warn!(
                    path = %path.display(),
                    existing_bytes = existing,
                    expected_bytes = len,
                    "Cache file size mismatch, recreating"
                );
            }
            // Truncate first so the recreated table is zero-filled.
            file.set_len(0)?;
            file.set_len(len as u64)?;
        }

        // SAFETY: the file is opened read/write and sized to `len`. Concurrent
        // modification by another process is not supported.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();

        info!(
            path = %path.display(),
            size_mb = format!("{:.1}", len as f64 / (1024.0 * 1024.0)),
            reused = reused,
            "Opened block cache file"
        );

        Ok(Self {
            mmap,
            ptr,
            path,
            reused,
        })
    }

    /// Whether an existing file of the right size was reused.
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackingStorage for MmapStorage {
    fn len(&self) -> usize {
        self.mmap.len()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    #[cfg(unix)]
    fn advise(&self, offset: usize, len: usize) {
        if let Err(e) = self
            .mmap
            .advise_range(memmap2::Advice::WillNeed, offset, len)
        {
            debug!(error = %e, offset, len, "madvise WILLNEED failed");
        }
    }

    fn flush(&self) -> CacheResult<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_storage_alignment_and_len() {
        let mut storage = HeapStorage::new(100);
        assert_eq!(storage.len(), 100);
        assert_eq!(storage.as_mut_ptr() as usize % 8, 0);

        storage.with_mutable_bytes(|bytes| {
            assert_eq!(bytes.len(), 100);
            assert!(bytes.iter().all(|b| *b == 0));
            bytes[99] = 7;
        });
        assert_eq!(storage.bytes_mut()[99], 7);
    }

    #[test]
    fn test_mmap_storage_reused_when_size_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("blocks.bin");

        {
            let mut storage = MmapStorage::open(&path, 4096).unwrap();
            assert!(!storage.reused());
            storage.bytes_mut()[10] = 42;
            storage.flush().unwrap();
        }

        let mut storage = MmapStorage::open(&path, 4096).unwrap();
        assert!(storage.reused());
        assert_eq!(storage.bytes_mut()[10], 42);
    }

    #[test]
    fn test_mmap_storage_recreated_on_size_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.bin");

        {
            let mut storage = MmapStorage::open(&path, 4096).unwrap();
            storage.bytes_mut()[10] = 42;
            storage.flush().unwrap();
        }

        let mut storage = MmapStorage::open(&path, 8192).unwrap();
        assert!(!storage.reused());
        assert_eq!(storage.len(), 8192);
        assert_eq!(storage.bytes_mut()[10], 0);
    }
}
