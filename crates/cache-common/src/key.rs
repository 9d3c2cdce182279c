//! Block key derivation.
//!
//! A block key is `hash(identity) ^ hash(version) + block_index`. Any change of
//! the remote content version moves a file to a disjoint key namespace, so
//! stale blocks are never served under the new version; they are reclaimed
//! lazily or removed after a grace period.
//!
//! Hashes use xxh3 rather than `DefaultHasher` because keys are persisted in
//! file-backed cache tables and must be stable across process restarts.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

/// Stable 64-bit hash of a logical file identity (path or URL).
pub fn hash_identity(identity: &str) -> u64 {
    xxh3_64(identity.as_bytes())
}

/// Remote content version derived from `ETag` and `Last-Modified`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentVersion {
    pub etag: Option<String>,
    /// Last-Modified as unix seconds.
    pub last_modified: Option<i64>,
}

impl ContentVersion {
    pub fn new(etag: Option<String>, last_modified: Option<i64>) -> Self {
        Self {
            etag,
            last_modified,
        }
    }

    pub fn hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        if let Some(etag) = &self.etag {
            hasher.update(etag.as_bytes());
        }
        hasher.update(&[0]);
        if let Some(lm) = self.last_modified {
            hasher.update(&lm.to_le_bytes());
        }
        hasher.digest()
    }
}

/// Key namespace of one version of one logical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    namespace: u64,
}

impl BlockKey {
    /// Namespace for a file; `version` is `None` for local files.
    pub fn new(identity: &str, version: Option<&ContentVersion>) -> Self {
        let version_hash = version.map(ContentVersion::hash).unwrap_or(0);
        Self {
            namespace: hash_identity(identity) ^ version_hash,
        }
    }

    pub fn from_namespace(namespace: u64) -> Self {
        Self { namespace }
    }

    pub fn namespace(&self) -> u64 {
        self.namespace
    }

    /// Cache key of block `index`.
    pub fn block(&self, index: u64) -> u64 {
        self.namespace.wrapping_add(index)
    }
}
