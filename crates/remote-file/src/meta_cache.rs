//! Persistent memo of remote metadata.
//!
//! A direct-mapped file of fixed 128-byte records, slot `xxh3(url) % records`.
//! A colliding URL simply overwrites the slot. Layout of a record (little
//! endian):
//!
//! ```text
//!   0..8    url hash
//!   8       flags (VALID | EXISTS | HAS_ETAG | HAS_LAST_MODIFIED)
//!   9       etag length
//!  16..24   content length
//!  24..32   last modified (unix seconds)
//!  32..40   checked at (unix seconds)
//!  40..48   checksum of the rest of the record
//!  56..128  etag bytes
//! ```
//!
//! Records with a bad checksum read as absent, so a torn write costs one
//! extra HEAD probe and nothing else.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use cache_common::{hash_identity, CacheError, CacheResult};

use crate::remote::RemoteMetadata;

pub const RECORD_SIZE: usize = 128;
const ETAG_OFFSET: usize = 56;
const MAX_ETAG_LEN: usize = RECORD_SIZE - ETAG_OFFSET;

const FLAG_VALID: u8 = 1;
const FLAG_EXISTS: u8 = 1 << 1;
const FLAG_HAS_ETAG: u8 = 1 << 2;
const FLAG_HAS_LAST_MODIFIED: u8 = 1 << 3;

/// What was known about a URL at `checked_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRecord {
    /// `None` if the URL did not exist.
    pub metadata: Option<RemoteMetadata>,
    pub checked_at: i64,
}

/// Fixed-record metadata file.
#[derive(Debug)]
pub struct MetaCache {
    path: PathBuf,
    records: u64,
    file: Mutex<File>,
}

impl MetaCache {
    /// Open or create the file. A file of the wrong size is recreated empty.
    pub fn open(path: impl AsRef<Path>, records: usize) -> CacheResult<Self> {
        let path = path.as_ref();
        if records == 0 {
            return Err(CacheError::Config("meta-cache needs at least one record".into()));
        }
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
            .open(path)?;
        let expected = (records * RECORD_SIZE) as u64;
        let actual = file.metadata()?.len();
        if actual != expected {
            if actual != 0 {
                warn!(path = %path.display(), actual, expected, "Meta-cache size changed, recreating");
            }
            file.set_len(0)?;
            file.set_len(expected)?;
        } else {
            info!(path = %path.display(), records, "Reusing meta-cache");
        }

        Ok(Self {
            path: path.to_path_buf(),
            records: records as u64,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn slot_offset(&self, hash: u64) -> u64 {
        (hash % self.records) * RECORD_SIZE as u64
    }

    fn lock(&self) -> CacheResult<std::sync::MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| CacheError::internal("meta-cache lock poisoned"))
    }

    /// Look up `url`. Absent, colliding and corrupt records all read as `None`.
    pub fn get(&self, url: &str) -> CacheResult<Option<MetaRecord>> {
        let hash = hash_identity(url);
        let mut buf = [0u8; RECORD_SIZE];
        {
            let mut file = self.lock()?;
            file.seek(SeekFrom::Start(self.slot_offset(hash)))?;
            file.read_exact(&mut buf)?;
        }
        Ok(decode(&buf, hash))
    }

    /// Store what is known about `url`. A record whose ETag does not fit is
    /// not memoized, and any older record for `url` is dropped with it.
    pub fn put(&self, url: &str, record: &MetaRecord) -> CacheResult<()> {
        let hash = hash_identity(url);
        let Some(buf) = encode(record, hash) else {
            debug!(url, "ETag too long for meta-cache record, forgetting url");
            return self.remove(url);
        };
        let mut file = self.lock()?;
        file.seek(SeekFrom::Start(self.slot_offset(hash)))?;
        file.write_all(&buf)?;
        Ok(())
    }

    /// Forget `url` if its record is present.
    pub fn remove(&self, url: &str) -> CacheResult<()> {
        let hash = hash_identity(url);
        if self.get(url)?.is_none() {
            return Ok(());
        }
        let mut file = self.lock()?;
        file.seek(SeekFrom::Start(self.slot_offset(hash)))?;
        file.write_all(&[0u8; RECORD_SIZE])?;
        Ok(())
    }

    pub fn flush(&self) -> CacheResult<()> {
        self.lock()?.sync_data()?;
        Ok(())
    }
}

fn checksum(buf: &[u8; RECORD_SIZE]) -> u64 {
    let mut copy = *buf;
    copy[40..48].fill(0);
    xxh3_64(&copy)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(word)
}

fn encode(record: &MetaRecord, hash: u64) -> Option<[u8; RECORD_SIZE]> {
    let mut buf = [0u8; RECORD_SIZE];
    buf[0..8].copy_from_slice(&hash.to_le_bytes());
    let mut flags = FLAG_VALID;
    if let Some(meta) = &record.metadata {
        flags |= FLAG_EXISTS;
        buf[16..24].copy_from_slice(&meta.content_length.to_le_bytes());
        if let Some(lm) = meta.last_modified {
            flags |= FLAG_HAS_LAST_MODIFIED;
            buf[24..32].copy_from_slice(&lm.to_le_bytes());
        }
        if let Some(etag) = &meta.etag {
            let bytes = etag.as_bytes();
            if bytes.len() > MAX_ETAG_LEN {
                return None;
            }
            flags |= FLAG_HAS_ETAG;
            buf[9] = bytes.len() as u8;
            buf[ETAG_OFFSET..ETAG_OFFSET + bytes.len()].copy_from_slice(bytes);
        }
    }
    buf[8] = flags;
    buf[32..40].copy_from_slice(&record.checked_at.to_le_bytes());
    let sum = checksum(&buf);
    buf[40..48].copy_from_slice(&sum.to_le_bytes());
    Some(buf)
}

fn decode(buf: &[u8; RECORD_SIZE], hash: u64) -> Option<MetaRecord> {
    let flags = buf[8];
    if flags & FLAG_VALID == 0 || read_u64(buf, 0) != hash || read_u64(buf, 40) != checksum(buf) {
        return None;
    }
    let checked_at = read_u64(buf, 32) as i64;
    if flags & FLAG_EXISTS == 0 {
        return Some(MetaRecord {
            metadata: None,
            checked_at,
        });
    }

    let etag = if flags & FLAG_HAS_ETAG != 0 {
        let len = (buf[9] as usize).min(MAX_ETAG_LEN);
        Some(String::from_utf8(buf[ETAG_OFFSET..ETAG_OFFSET + len].to_vec()).ok()?)
    } else {
        None
    };
    let last_modified = (flags & FLAG_HAS_LAST_MODIFIED != 0).then(|| read_u64(buf, 24) as i64);

    Some(MetaRecord {
        metadata: Some(RemoteMetadata {
            content_length: read_u64(buf, 16),
            etag,
            last_modified,
        }),
        checked_at,
    })
}
