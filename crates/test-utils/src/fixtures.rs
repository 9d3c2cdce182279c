//! Common fixtures: data directories and polling helpers.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

/// Logical file names shaped like the store's layout.
pub mod files {
    pub const TEMPERATURE: &str = "gfs/2024011512/temperature_2m.om";
    pub const WIND: &str = "gfs/2024011512/wind_u_10m.om";
    pub const MISSING: &str = "gfs/2024011512/does_not_exist.om";
}

/// Block sizes small enough to make multi-block reads cheap in tests.
pub mod sizes {
    pub const BLOCK_SIZE: usize = 1024;
    pub const CACHE_SLOTS: usize = 256;
}

/// A temporary data directory.
pub struct DataDir {
    dir: TempDir,
}

impl DataDir {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `data` to the logical file `name`, creating parent directories.
    pub fn write(&self, name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)?;
        Ok(path)
    }

    /// Replace `name` through a rename, the way producers publish files.
    pub fn replace(&self, name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.dir.path().join(name);
        let tmp = path.with_extension("partial");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    pub fn remove(&self, name: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.dir.path().join(name))
    }
}

/// Poll `check` every 10ms until it returns true or `timeout` passes.
/// Returns the last result.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
