//! The shared arena.
//!
//! One contiguous region, established before any worker forks and frozen in
//! geometry from then on:
//!
//! ```text
//! +--------+----------------------+-------------------+------------------+
//! | Header | Hash-slot table      | Dep-edge table    | Blob heap        |
//! +--------+----------------------+-------------------+------------------+
//! ```
//!
//! The header holds the magic, the frozen sizes and the shared counters
//! (heap bump and waste, slot occupancy). All cross-process state lives in
//! this region; everything else in the crate is per-process. Writers are
//! serialized by the hosting runtime, readers are wait-free.

pub mod deptable;
pub mod hashtable;
pub mod heap;
pub mod mapping;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{self, GcAggressiveness, ShmConfig};
use crate::errassert;
use crate::error::{Error, Result};
use crate::key::Digest;
use crate::telemetry;

use deptable::DepTable;
use hashtable::{HashTable, InsertOutcome};
use heap::{Heap, HeapBlob, HEAP_RESERVE};
use mapping::Mapping;

const MAGIC: u64 = 0x7368_6d73_746f_7265; // "shmstore"
const FORMAT_VERSION: u64 = 1;

/// Header size in bytes; the hash table starts at this offset.
const HEADER_BYTES: usize = 128;

// Header word indices.
const WORD_MAGIC: usize = 0;
const WORD_FORMAT: usize = 1;
const WORD_GLOBAL_SIZE: usize = 2;
const WORD_HEAP_SIZE: usize = 3;
const WORD_HASH_POW: usize = 4;
const WORD_DEP_POW: usize = 5;
const WORD_HEAP_BUMP: usize = 6;
const WORD_HEAP_WASTED: usize = 7;
const WORD_HASH_NONEMPTY: usize = 8;
const WORD_HASH_USED: usize = 9;
const WORD_DEP_USED: usize = 10;
const WORD_DEP_LOADED: usize = 11;

#[derive(Debug)]
struct Header {
    base: *mut u8,
}

impl Header {
    fn word(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index * 8 < HEADER_BYTES);
        unsafe { &*(self.base.add(index * 8) as *const AtomicU64) }
    }

    fn get(&self, index: usize) -> u64 {
        self.word(index).load(Ordering::Acquire)
    }

    fn set(&self, index: usize, value: u64) {
        self.word(index).store(value, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    hash_off: usize,
    dep_off: usize,
    heap_off: usize,
    total: usize,
}

fn geometry(hash_pow: u8, dep_pow: u8, heap_size: usize) -> Geometry {
    let hash_off = HEADER_BYTES;
    let dep_off = hash_off + HashTable::bytes_for(hash_pow);
    let heap_off = dep_off + DepTable::bytes_for(dep_pow);
    Geometry {
        hash_off,
        dep_off,
        heap_off,
        total: heap_off + heap_size,
    }
}

/// Everything a child process needs to adopt the region: the frozen
/// geometry, the mapping base, and the backing path when file-backed.
#[derive(Debug, Clone)]
pub struct Handle {
    base: usize,
    path: Option<PathBuf>,
    pub global_size: usize,
    pub heap_size: usize,
    pub hash_table_pow: u8,
    pub dep_table_pow: u8,
    gc: GcAggressiveness,
    scratch_capacity: usize,
}

/// What `add` did, with the sizes recorded for telemetry. A non-fresh
/// outcome is the "no new allocation" sentinel: the digest was already
/// bound and nothing was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    pub fresh: bool,
    pub compressed_size: u64,
    pub original_size: u64,
    pub total_size: u64,
}

impl AddOutcome {
    fn present() -> Self {
        AddOutcome {
            fresh: false,
            compressed_size: 0,
            original_size: 0,
            total_size: 0,
        }
    }
}

/// Result of a collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    pub ran: bool,
    pub used_before: u64,
    pub used_after: u64,
}

/// The process's view of the shared region.
///
/// Holding an `Arena` keeps the mapping alive. The struct itself is
/// per-process and must not cross threads; the region it views is shared
/// with every process holding a connected arena.
#[derive(Debug)]
pub struct Arena {
    mapping: Mapping,
    header: Header,
    hash: HashTable,
    heap: Heap,
    deps: DepTable,
    gc: GcAggressiveness,
    worker_id: Option<usize>,
    scratch_capacity: usize,
}

impl Arena {
    /// Creates and formats the shared region in the master process.
    pub fn init(config: &ShmConfig) -> Result<Arena> {
        let geo = geometry(config.hash_table_pow, config.dep_table_pow, config.heap_size);
        if config.global_size < geo.total {
            return errassert!(
                "global size {} cannot hold tables and heap ({} required)",
                config.global_size,
                geo.total
            );
        }
        if config.heap_size as u64 <= HEAP_RESERVE {
            return errassert!("heap size too small");
        }

        let mapping = Mapping::establish(config)?;
        telemetry::set_log_level(config.log_level);

        let header = Header {
            base: mapping.ptr(),
        };
        header.set(WORD_GLOBAL_SIZE, config.global_size as u64);
        header.set(WORD_HEAP_SIZE, config.heap_size as u64);
        header.set(WORD_HASH_POW, config.hash_table_pow as u64);
        header.set(WORD_DEP_POW, config.dep_table_pow as u64);
        header.set(WORD_HEAP_BUMP, HEAP_RESERVE);
        header.set(WORD_HEAP_WASTED, 0);
        header.set(WORD_HASH_NONEMPTY, 0);
        header.set(WORD_HASH_USED, 0);
        header.set(WORD_DEP_USED, 0);
        header.set(WORD_DEP_LOADED, 0);
        header.set(WORD_FORMAT, FORMAT_VERSION);
        // Magic last: a connecting process seeing it can trust the rest.
        header.set(WORD_MAGIC, MAGIC);

        let scratch_capacity = scratch_capacity(config);
        tracing::info!(
            global_size = config.global_size,
            heap_size = config.heap_size,
            hash_slots = 1u64 << config.hash_table_pow,
            dep_slots = 1u64 << config.dep_table_pow,
            "shared region initialized"
        );

        Ok(Self::assemble(
            mapping,
            config.hash_table_pow,
            config.dep_table_pow,
            config.heap_size,
            config.gc,
            None,
            scratch_capacity,
        ))
    }

    /// Adopts a region created by [`Arena::init`].
    ///
    /// # Safety
    ///
    /// The handle must come from a live arena in this process tree: either
    /// this process forked from the initializing master (anonymous
    /// mapping), or the handle carries a backing path that still exists.
    pub unsafe fn connect(handle: &Handle, worker_id: usize) -> Result<Arena> {
        let mapping = match &handle.path {
            Some(path) => Mapping::reopen(path)?,
            None => Mapping::adopt(handle.base as *mut u8, handle.global_size),
        };
        let header = Header {
            base: mapping.ptr(),
        };
        if header.get(WORD_MAGIC) != MAGIC {
            return Err(Error::Assertion("bad magic in shared region".into()));
        }
        if header.get(WORD_FORMAT) != FORMAT_VERSION {
            return Err(Error::Assertion("shared region format mismatch".into()));
        }
        if header.get(WORD_HASH_POW) != handle.hash_table_pow as u64
            || header.get(WORD_DEP_POW) != handle.dep_table_pow as u64
            || header.get(WORD_HEAP_SIZE) != handle.heap_size as u64
        {
            return Err(Error::Assertion("handle geometry mismatch".into()));
        }
        tracing::debug!(worker_id, "connected to shared region");
        Ok(Self::assemble(
            mapping,
            handle.hash_table_pow,
            handle.dep_table_pow,
            handle.heap_size,
            handle.gc,
            Some(worker_id),
            handle.scratch_capacity,
        ))
    }

    fn assemble(
        mapping: Mapping,
        hash_pow: u8,
        dep_pow: u8,
        heap_size: usize,
        gc: GcAggressiveness,
        worker_id: Option<usize>,
        scratch_capacity: usize,
    ) -> Arena {
        let geo = geometry(hash_pow, dep_pow, heap_size);
        let base = mapping.ptr();
        let header = Header { base };
        let hash = unsafe { HashTable::new(base.add(geo.hash_off), hash_pow) };
        let deps = unsafe {
            DepTable::new(
                base.add(geo.dep_off),
                dep_pow,
                header.word(WORD_DEP_USED) as *const AtomicU64,
            )
        };
        let heap = unsafe {
            Heap::new(
                base.add(geo.heap_off),
                heap_size as u64,
                header.word(WORD_HEAP_BUMP) as *const AtomicU64,
                header.word(WORD_HEAP_WASTED) as *const AtomicU64,
            )
        };
        Arena {
            mapping,
            header,
            hash,
            heap,
            deps,
            gc,
            worker_id,
            scratch_capacity,
        }
    }

    /// The handle child processes connect with.
    pub fn handle(&self) -> Handle {
        Handle {
            base: self.mapping.ptr() as usize,
            path: self.mapping.path().map(|p| p.to_path_buf()),
            global_size: self.header.get(WORD_GLOBAL_SIZE) as usize,
            heap_size: self.header.get(WORD_HEAP_SIZE) as usize,
            hash_table_pow: self.header.get(WORD_HASH_POW) as u8,
            dep_table_pow: self.header.get(WORD_DEP_POW) as u8,
            gc: self.gc,
            scratch_capacity: self.scratch_capacity,
        }
    }

    pub fn worker_id(&self) -> Option<usize> {
        self.worker_id
    }

    /// Capacity hint for per-worker serialize scratch buffers.
    pub fn scratch_capacity(&self) -> usize {
        self.scratch_capacity
    }

    fn check_writes_allowed(&self) -> Result<()> {
        if !config::allow_hashtable_writes_by_current_process() {
            return Err(Error::WritesDisabled);
        }
        Ok(())
    }

    /// Stores a blob under `digest`. Idempotent: a digest with a live
    /// binding is left untouched and the no-new-allocation sentinel is
    /// returned.
    pub fn add(
        &self,
        digest: &Digest,
        bytes: &[u8],
        uncompressed_len: u32,
        compressed: bool,
    ) -> Result<AddOutcome> {
        self.check_writes_allowed()?;
        if self.hash.lookup(digest).is_some() {
            return Ok(AddOutcome::present());
        }
        let (offset, total) = self.heap.alloc(bytes, uncompressed_len, compressed)?;
        match self.hash.insert(digest, offset)? {
            InsertOutcome::Fresh => {
                self.header.word(WORD_HASH_NONEMPTY).fetch_add(1, Ordering::AcqRel);
                self.header.word(WORD_HASH_USED).fetch_add(1, Ordering::AcqRel);
            }
            InsertOutcome::Rebound => {
                self.header.word(WORD_HASH_USED).fetch_add(1, Ordering::AcqRel);
            }
            InsertOutcome::Present(_) => {
                // Single-writer discipline makes this unreachable; recover
                // by wasting the orphaned blob.
                self.heap.free(offset);
                return Ok(AddOutcome::present());
            }
        }
        Ok(AddOutcome {
            fresh: true,
            compressed_size: bytes.len() as u64,
            original_size: uncompressed_len as u64,
            total_size: total,
        })
    }

    /// Constant-time membership.
    pub fn mem(&self, digest: &Digest) -> bool {
        self.hash.lookup(digest).is_some()
    }

    /// Reads the blob bound to `digest`. Requires membership.
    pub fn get(&self, digest: &Digest) -> Result<HeapBlob> {
        let addr = self.hash.lookup(digest).ok_or(Error::KeyMissing)?;
        self.heap.read(addr)
    }

    /// Total form of [`Arena::get`].
    pub fn try_get(&self, digest: &Digest) -> Result<Option<HeapBlob>> {
        match self.hash.lookup(digest) {
            Some(addr) => Ok(Some(self.heap.read(addr)?)),
            None => Ok(None),
        }
    }

    /// Unbinds `digest`, returning the freed byte count. Requires
    /// membership.
    pub fn remove(&self, digest: &Digest) -> Result<u64> {
        self.check_writes_allowed()?;
        if !config::allow_removes() {
            return Err(Error::RemovesDisabled);
        }
        let addr = self.hash.clear_addr(digest).map_err(|err| match err {
            Error::KeyMissing => Error::RemoveAbsent,
            other => other,
        })?;
        self.header.word(WORD_HASH_USED).fetch_sub(1, Ordering::AcqRel);
        Ok(self.heap.free(addr))
    }

    /// Atomically rebinds the blob at `src` to `dst`. Requires
    /// `mem(src)` and `!mem(dst)`.
    pub fn rename(&self, src: &Digest, dst: &Digest) -> Result<()> {
        self.check_writes_allowed()?;
        if self.hash.lookup(dst).is_some() {
            return Err(Error::MoveDestinationPresent);
        }
        let addr = self.hash.clear_addr(src).map_err(|err| match err {
            Error::KeyMissing => Error::MoveSourceMissing,
            other => other,
        })?;
        match self.hash.insert(dst, addr)? {
            InsertOutcome::Fresh => {
                self.header.word(WORD_HASH_NONEMPTY).fetch_add(1, Ordering::AcqRel);
            }
            InsertOutcome::Rebound => {}
            InsertOutcome::Present(_) => {
                return Err(Error::Assertion("rename raced a concurrent writer".into()));
            }
        }
        Ok(())
    }

    /// Compacts the blob heap when enough of it is garbage, per the
    /// configured aggressiveness. Writers must be quiescent for the
    /// duration; readers in other processes must not run concurrently
    /// with a pass that actually moves blobs.
    pub fn collect(&self) -> Result<CollectStats> {
        self.check_writes_allowed()?;
        let used_before = self.heap.used();
        let reachable = self.heap.reachable();
        if (used_before as f64) < (reachable as f64) * self.gc.overhead() {
            return Ok(CollectStats {
                ran: false,
                used_before,
                used_after: used_before,
            });
        }

        let mut live: Vec<(usize, u64)> = Vec::new();
        self.hash.for_each_live(|slot, _, addr| live.push((slot, addr)));
        live.sort_by_key(|(_, addr)| *addr);

        let mut new_bump = HEAP_RESERVE;
        for (slot, addr) in live {
            let total = self.heap.total_size(addr);
            if addr != new_bump {
                self.heap.slide(addr, new_bump, total);
                self.hash.set_addr_at(slot, new_bump);
            }
            new_bump += total;
        }
        self.heap.reset_after_compaction(new_bump);
        tracing::info!(
            used_before,
            used_after = new_bump,
            "collected shared heap"
        );
        Ok(CollectStats {
            ran: true,
            used_before,
            used_after: new_bump,
        })
    }

    // Diagnostics.

    pub fn heap_used(&self) -> u64 {
        self.heap.used()
    }

    pub fn heap_wasted(&self) -> u64 {
        self.heap.wasted_bytes()
    }

    pub fn heap_size(&self) -> u64 {
        self.heap.size()
    }

    /// Slots ever claimed by a digest.
    pub fn hash_nonempty_slots(&self) -> u64 {
        self.header.get(WORD_HASH_NONEMPTY)
    }

    /// Slots with a live blob.
    pub fn hash_used_slots(&self) -> u64 {
        self.header.get(WORD_HASH_USED)
    }

    pub fn hash_slots(&self) -> u64 {
        self.hash.slots() as u64
    }

    // Dependency-edge table.

    pub fn dep_add(&self, edge: u64) -> Result<bool> {
        self.check_writes_allowed()?;
        self.deps.add(edge)
    }

    pub fn dep_mem(&self, edge: u64) -> bool {
        self.deps.mem(edge)
    }

    pub fn dep_used_slots(&self) -> u64 {
        self.deps.used_slots()
    }

    pub fn dep_slots(&self) -> u64 {
        self.deps.slots() as u64
    }

    pub fn dep_for_each(&self, f: impl FnMut(u64)) {
        self.deps.for_each(f)
    }

    /// Replaces the live edge table with `edges`.
    pub fn dep_replace_all(&self, edges: impl IntoIterator<Item = u64>) -> Result<u64> {
        self.check_writes_allowed()?;
        self.deps.clear();
        let mut loaded = 0;
        for edge in edges {
            self.deps.add(edge)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Whether the edge table was loaded from a saved state. Saving such a
    /// table is rejected; callers must use `update`.
    pub fn dep_table_loaded_from_saved_state(&self) -> bool {
        self.header.get(WORD_DEP_LOADED) != 0
    }

    pub fn set_dep_table_loaded_from_saved_state(&self, loaded: bool) {
        self.header.set(WORD_DEP_LOADED, loaded as u64);
    }
}

fn scratch_capacity(config: &ShmConfig) -> usize {
    const MIN: usize = 64 * 1024;
    const MAX: usize = 16 * 1024 * 1024;
    let workers = config.workers.unwrap_or(1).max(1);
    (config.heap_size / workers).clamp(MIN, MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arena {
        Arena::init(&ShmConfig::small()).unwrap()
    }

    fn digest(name: &str) -> Digest {
        Digest(md5::compute(name.as_bytes()).0)
    }

    #[test]
    fn test_add_get_roundtrip() {
        let arena = arena();
        let outcome = arena.add(&digest("foo"), b"bar", 3, false).unwrap();
        assert!(outcome.fresh);
        assert_eq!(outcome.compressed_size, 3);
        assert_eq!(outcome.original_size, 3);
        assert_eq!(arena.get(&digest("foo")).unwrap().bytes, b"bar");
    }

    #[test]
    fn test_second_add_is_noop() {
        let arena = arena();
        arena.add(&digest("foo"), b"bar", 3, false).unwrap();
        let outcome = arena.add(&digest("foo"), b"baz", 3, false).unwrap();
        assert!(!outcome.fresh);
        // The first binding wins.
        assert_eq!(arena.get(&digest("foo")).unwrap().bytes, b"bar");
    }

    #[test]
    fn test_remove_then_absent() {
        let arena = arena();
        arena.add(&digest("k"), b"v", 1, false).unwrap();
        let freed = arena.remove(&digest("k")).unwrap();
        assert!(freed > 0);
        assert!(!arena.mem(&digest("k")));
        assert_eq!(arena.remove(&digest("k")).unwrap_err(), Error::RemoveAbsent);
        assert_eq!(arena.get(&digest("k")).unwrap_err(), Error::KeyMissing);
        assert_eq!(arena.try_get(&digest("k")).unwrap(), None);
    }

    #[test]
    fn test_rename() {
        let arena = arena();
        arena.add(&digest("a"), b"v", 1, false).unwrap();
        arena.rename(&digest("a"), &digest("b")).unwrap();
        assert!(!arena.mem(&digest("a")));
        assert_eq!(arena.get(&digest("b")).unwrap().bytes, b"v");
    }

    #[test]
    fn test_rename_preconditions() {
        let arena = arena();
        arena.add(&digest("a"), b"1", 1, false).unwrap();
        arena.add(&digest("b"), b"2", 1, false).unwrap();
        assert_eq!(
            arena.rename(&digest("a"), &digest("b")).unwrap_err(),
            Error::MoveDestinationPresent
        );
        assert_eq!(
            arena.rename(&digest("gone"), &digest("c")).unwrap_err(),
            Error::MoveSourceMissing
        );
    }

    #[test]
    fn test_slot_accounting() {
        let arena = arena();
        arena.add(&digest("a"), b"1", 1, false).unwrap();
        arena.add(&digest("b"), b"2", 1, false).unwrap();
        assert_eq!(arena.hash_nonempty_slots(), 2);
        assert_eq!(arena.hash_used_slots(), 2);
        arena.remove(&digest("a")).unwrap();
        // Claimed slots are monotonic; used slots are not.
        assert_eq!(arena.hash_nonempty_slots(), 2);
        assert_eq!(arena.hash_used_slots(), 1);
        arena.add(&digest("a"), b"1", 1, false).unwrap();
        assert_eq!(arena.hash_nonempty_slots(), 2);
        assert_eq!(arena.hash_used_slots(), 2);
    }

    #[test]
    fn test_collect_compacts_and_preserves() {
        let arena = arena();
        arena.add(&digest("keep1"), b"first", 5, false).unwrap();
        arena.add(&digest("dead"), &[0u8; 256], 256, false).unwrap();
        arena.add(&digest("keep2"), b"second", 6, false).unwrap();
        arena.remove(&digest("dead")).unwrap();

        let wasted = arena.heap_wasted();
        assert!(wasted > 0);
        let stats = arena.collect().unwrap();
        assert!(stats.ran);
        assert_eq!(stats.used_after, stats.used_before - wasted);
        assert_eq!(arena.heap_wasted(), 0);
        assert_eq!(arena.get(&digest("keep1")).unwrap().bytes, b"first");
        assert_eq!(arena.get(&digest("keep2")).unwrap().bytes, b"second");
    }

    #[test]
    fn test_collect_respects_overhead() {
        let mut config = ShmConfig::small();
        config.gc = GcAggressiveness::Gentle;
        let arena = Arena::init(&config).unwrap();
        arena.add(&digest("keep"), &[1u8; 512], 512, false).unwrap();
        arena.add(&digest("drop"), &[2u8; 16], 16, false).unwrap();
        arena.remove(&digest("drop")).unwrap();
        // Far less than half the heap is garbage; gentle GC declines.
        let stats = arena.collect().unwrap();
        assert!(!stats.ran);
        assert!(arena.heap_wasted() > 0);
    }

    #[test]
    fn test_heap_exhaustion() {
        let mut config = ShmConfig::small();
        config.heap_size = 4096;
        let arena = Arena::init(&config).unwrap();
        let mut err = None;
        for i in 0..64u32 {
            if let Err(e) = arena.add(&digest(&format!("k{i}")), &[0u8; 512], 512, false) {
                err = Some(e);
                break;
            }
        }
        assert_eq!(err, Some(Error::HeapFull));
    }

    #[test]
    fn test_connect_sees_masters_writes() {
        let arena = arena();
        arena.add(&digest("shared"), b"value", 5, false).unwrap();
        let worker = unsafe { Arena::connect(&arena.handle(), 1) }.unwrap();
        assert_eq!(worker.worker_id(), Some(1));
        assert_eq!(worker.get(&digest("shared")).unwrap().bytes, b"value");
        // And the other direction.
        worker.add(&digest("back"), b"w", 1, false).unwrap();
        assert_eq!(arena.get(&digest("back")).unwrap().bytes, b"w");
    }

    #[test]
    fn test_write_gates() {
        let arena = arena();
        arena.add(&digest("k"), b"v", 1, false).unwrap();

        config::set_allow_removes(false);
        assert_eq!(arena.remove(&digest("k")).unwrap_err(), Error::RemovesDisabled);
        config::set_allow_removes(true);

        config::set_allow_hashtable_writes_by_current_process(false);
        assert_eq!(
            arena.add(&digest("x"), b"v", 1, false).unwrap_err(),
            Error::WritesDisabled
        );
        assert_eq!(arena.remove(&digest("k")).unwrap_err(), Error::WritesDisabled);
        config::set_allow_hashtable_writes_by_current_process(true);
        arena.remove(&digest("k")).unwrap();
    }

    #[test]
    fn test_dep_table_roundtrip() {
        let arena = arena();
        assert!(arena.dep_add(77).unwrap());
        assert!(!arena.dep_add(77).unwrap());
        assert!(arena.dep_mem(77));
        assert_eq!(arena.dep_used_slots(), 1);
        assert_eq!(arena.dep_slots(), 1024);

        assert_eq!(arena.dep_replace_all([5u64, 6, 7]).unwrap(), 3);
        assert!(!arena.dep_mem(77));
        assert!(arena.dep_mem(6));
    }

    #[test]
    fn test_geometry_must_fit() {
        let config = ShmConfig {
            global_size: 4096,
            heap_size: 1024 * 1024,
            ..ShmConfig::small()
        };
        assert!(matches!(
            Arena::init(&config).unwrap_err(),
            Error::Assertion(_)
        ));
    }
}
