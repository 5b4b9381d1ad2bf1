//! Test-only temporary directories and files.

#![cfg_attr(not(test), allow(dead_code))]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

fn unique_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    format!("{}_{}_{}", std::process::id(), nanos, SEQ.fetch_add(1, Ordering::SeqCst))
}

/// A scratch directory, usable as a shm candidate in fallback tests.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let base = PathBuf::from("/tmp/shmstore_tests");
        fs::create_dir_all(&base)?;
        let path = base.join(format!("dir_{}", unique_suffix()));
        fs::create_dir(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// A path for a file that does not exist yet; removed on drop if created.
pub struct NamedTempFile {
    path: PathBuf,
}

impl NamedTempFile {
    pub fn new() -> std::io::Result<Self> {
        let base = PathBuf::from("/tmp/shmstore_tests");
        fs::create_dir_all(&base)?;
        let path = base.join(format!("file_{}", unique_suffix()));
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NamedTempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// A directory path guaranteed not to exist.
pub fn missing_dir() -> PathBuf {
    PathBuf::from(format!("/tmp/shmstore_tests/missing_{}", unique_suffix()))
}
