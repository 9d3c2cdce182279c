//! Read-only memory-mapped local files.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use memmap2::Mmap;
use tracing::debug;

use cache_common::{CacheError, CacheResult};

/// A local file mapped for reading.
///
/// The page cache already caches local files, so reads are served straight
/// from the mapping and never go through the block cache.
#[derive(Debug)]
pub struct LocalFile {
    path: PathBuf,
    // Zero-length files cannot be mapped.
    mmap: Option<Mmap>,
    len: u64,
    modified: Option<SystemTime>,
}

impl LocalFile {
    /// Map `path`. Returns `Ok(None)` if it does not exist or is not a file.
    pub fn open(path: impl AsRef<Path>) -> CacheResult<Option<Self>> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Ok(None);
        }

        let len = metadata.len();
        let mmap = if len == 0 {
            None
        } else {
            // SAFETY: the mapping is read-only. Replacing the file goes through
            // a new inode and is detected by `is_unchanged`; truncating it in
            // place is outside what this cache supports.
            Some(unsafe { Mmap::map(&file)? })
        };

        debug!(path = %path.display(), len, "Mapped local file");

        Ok(Some(Self {
            path: path.to_path_buf(),
            mmap,
            len,
            modified: metadata.modified().ok(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Modification time as unix seconds.
    pub fn modified_secs(&self) -> Option<i64> {
        self.modified
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
    }

    /// True while the file on disk still has the length and mtime seen at open.
    pub fn is_unchanged(&self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len() == self.len && meta.modified().ok() == self.modified,
            Err(_) => false,
        }
    }

    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Borrow `[offset, offset + len)`.
    pub fn slice(&self, offset: u64, len: u64) -> CacheResult<&[u8]> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.len)
            .ok_or(CacheError::InvalidRange {
                offset,
                len,
                file_len: self.len,
            })?;
        Ok(&self.bytes()[offset as usize..end as usize])
    }

    /// Ask the kernel to read `[offset, offset + len)` ahead. Best effort.
    pub fn advise(&self, offset: u64, len: u64) {
        let end = offset.saturating_add(len).min(self.len);
        if offset >= end {
            return;
        }
        if let Some(mmap) = &self.mmap {
            advise_will_need(mmap, offset as usize, (end - offset) as usize);
        }
    }
}

#[cfg(unix)]
fn advise_will_need(mmap: &Mmap, offset: usize, len: usize) {
    if let Err(e) = mmap.advise_range(memmap2::Advice::WillNeed, offset, len) {
        debug!(error = %e, offset, len, "madvise WILLNEED failed");
    }
}

#[cfg(not(unix))]
fn advise_will_need(_mmap: &Mmap, _offset: usize, _len: usize) {}
