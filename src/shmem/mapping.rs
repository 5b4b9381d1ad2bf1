//! Backing memory for the shared region.
//!
//! The region is created once, before any worker forks. The preferred
//! backing is an anonymous `MAP_SHARED` mapping, which forked children
//! inherit for free. When the kernel refuses (overcommit limits, cgroup
//! memory pressure), we fall back to a file on one of the configured
//! candidate filesystems, checking each for existence and free space and
//! recording every rejection before moving on. Only when the whole chain is
//! exhausted does init fail.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;

use crate::config::ShmConfig;
use crate::error::{Error, Result};
use crate::telemetry;

/// Counter name for candidate filesystems rejected during init.
pub const REJECTED_CANDIDATE_SAMPLE: &str = "shared-region init: candidate rejected";

static FILE_SEQ: AtomicU64 = AtomicU64::new(0);

/// The mapped bytes backing the shared region.
#[derive(Debug)]
pub enum Mapping {
    /// `MAP_SHARED | MAP_ANONYMOUS`, inherited by forked children.
    Anonymous { ptr: *mut u8, len: usize },
    /// A file on one of the candidate filesystems, mapped shared.
    File {
        map: MmapMut,
        ptr: *mut u8,
        path: PathBuf,
    },
    /// A mapping created by another arena in this process tree and adopted
    /// through a handle. Never unmapped on drop.
    Adopted { ptr: *mut u8, len: usize },
}

impl Mapping {
    /// Establishes the region: anonymous first, then the candidate chain.
    pub fn establish(config: &ShmConfig) -> Result<Mapping> {
        match Self::anonymous(config.global_size) {
            Ok(mapping) => Ok(mapping),
            Err(err) => {
                tracing::warn!(error = %err, "anonymous shared mapping failed, trying filesystems");
                Self::from_candidates(config)
            }
        }
    }

    /// Creates an anonymous shared mapping of `len` bytes.
    pub fn anonymous(len: usize) -> Result<Mapping> {
        if len == 0 {
            return Err(Error::AnonymousMappingFailed("zero-length region".into()));
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::AnonymousMappingFailed(
                io::Error::last_os_error().to_string(),
            ));
        }
        Ok(Mapping::Anonymous {
            ptr: ptr as *mut u8,
            len,
        })
    }

    /// Walks the candidate filesystems in order, recording each rejection,
    /// and maps a region-sized file on the first usable one.
    pub fn from_candidates(config: &ShmConfig) -> Result<Mapping> {
        for dir in &config.shm_dirs {
            match Self::file_backed(dir, config.global_size, config.shm_min_avail) {
                Ok(mapping) => return Ok(mapping),
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), error = %err, "rejected shm candidate");
                    telemetry::sample(REJECTED_CANDIDATE_SAMPLE, 1);
                }
            }
        }
        Err(Error::OutOfSharedMemory)
    }

    /// Maps a fresh region-sized file in `dir`, enforcing the free-space
    /// minimum.
    pub fn file_backed(dir: &Path, len: usize, min_avail: u64) -> Result<Mapping> {
        if !dir.is_dir() {
            return Err(Error::FilesystemUnusable {
                path: dir.to_path_buf(),
                reason: "not a directory".into(),
            });
        }
        let available = fs2::available_space(dir).map_err(|e| Error::FilesystemUnusable {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        if available < min_avail {
            return Err(Error::LessThanMinimumAvailable {
                path: dir.to_path_buf(),
                available,
                required: min_avail,
            });
        }

        let name = format!(
            "shmstore_{}_{}",
            std::process::id(),
            FILE_SEQ.fetch_add(1, Ordering::SeqCst),
        );
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::FilesystemUnusable {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?;
        file.set_len(len as u64)
            .map_err(|e| Error::FilesystemUnusable {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?;
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::FilesystemUnusable {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        let ptr = map.as_mut_ptr();
        tracing::info!(path = %path.display(), len, "shared region backed by file");
        Ok(Mapping::File { map, ptr, path })
    }

    /// Re-maps the file a handle points at. Used by `connect` in processes
    /// that did not inherit the mapping.
    pub fn reopen(path: &Path) -> Result<Mapping> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::FilesystemUnusable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let ptr = map.as_mut_ptr();
        Ok(Mapping::File {
            map,
            ptr,
            path: path.to_path_buf(),
        })
    }

    /// Adopts an inherited mapping by base address. The caller guarantees
    /// the address comes from a live mapping in this process tree.
    pub unsafe fn adopt(ptr: *mut u8, len: usize) -> Mapping {
        Mapping::Adopted { ptr, len }
    }

    pub fn ptr(&self) -> *mut u8 {
        match self {
            Mapping::Anonymous { ptr, .. } => *ptr,
            Mapping::File { ptr, .. } => *ptr,
            Mapping::Adopted { ptr, .. } => *ptr,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Mapping::Anonymous { len, .. } => *len,
            Mapping::File { map, .. } => map.len(),
            Mapping::Adopted { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The backing path, when file-backed.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Mapping::File { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        match self {
            Mapping::Anonymous { ptr, len } => unsafe {
                libc::munmap(*ptr as *mut libc::c_void, *len);
            },
            Mapping::File { path, .. } => {
                let _ = std::fs::remove_file(path);
            }
            Mapping::Adopted { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_anonymous_mapping_is_writable() {
        let mapping = Mapping::anonymous(4096).unwrap();
        unsafe {
            mapping.ptr().write(0xab);
            assert_eq!(mapping.ptr().read(), 0xab);
        }
    }

    #[test]
    fn test_file_backed_mapping_is_writable() {
        let dir = TempDir::new().unwrap();
        let mapping = Mapping::file_backed(dir.path(), 4096, 0).unwrap();
        assert!(mapping.path().is_some());
        unsafe {
            mapping.ptr().write(0xcd);
            assert_eq!(mapping.ptr().read(), 0xcd);
        }
    }

    #[test]
    fn test_missing_directory_is_unusable() {
        let err = Mapping::file_backed(Path::new("/no/such/dir"), 4096, 0).unwrap_err();
        assert!(matches!(err, Error::FilesystemUnusable { .. }));
    }

    #[test]
    fn test_free_space_minimum_enforced() {
        let dir = TempDir::new().unwrap();
        let err = Mapping::file_backed(dir.path(), 4096, u64::MAX).unwrap_err();
        assert!(matches!(err, Error::LessThanMinimumAvailable { .. }));
    }

    #[test]
    fn test_candidate_chain_skips_to_first_usable() {
        let dir = TempDir::new().unwrap();
        let config = ShmConfig {
            global_size: 4096,
            shm_dirs: vec![
                PathBuf::from("/no/such/dir"),
                PathBuf::from("/also/missing"),
                dir.path().to_path_buf(),
            ],
            shm_min_avail: 0,
            ..ShmConfig::small()
        };
        let mapping = Mapping::from_candidates(&config).unwrap();
        assert!(mapping.path().unwrap().starts_with(dir.path()));
    }

    #[test]
    fn test_candidate_chain_exhaustion() {
        let config = ShmConfig {
            global_size: 4096,
            shm_dirs: vec![PathBuf::from("/no/such/dir")],
            ..ShmConfig::small()
        };
        assert_eq!(
            Mapping::from_candidates(&config).unwrap_err(),
            Error::OutOfSharedMemory
        );
    }

    #[test]
    fn test_rejections_are_sampled() {
        let dir = TempDir::new().unwrap();
        telemetry::reset();
        telemetry::set_log_level(1);
        let config = ShmConfig {
            global_size: 4096,
            shm_dirs: vec![PathBuf::from("/no/such/dir"), dir.path().to_path_buf()],
            shm_min_avail: 0,
            ..ShmConfig::small()
        };
        Mapping::from_candidates(&config).unwrap();
        let telemetry::Telemetry::Group(root) = telemetry::get_telemetry() else {
            panic!("expected group");
        };
        let Some(telemetry::Telemetry::Group(samples)) = root.get("samples") else {
            panic!("expected samples");
        };
        assert!(samples.contains_key(REJECTED_CANDIDATE_SAMPLE));
        telemetry::set_log_level(0);
        telemetry::reset();
    }
}
