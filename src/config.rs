use std::cell::Cell;
use std::path::PathBuf;

/// How eagerly `collect()` should be triggered. The overhead factor is the
/// permitted ratio of heap bytes used to heap bytes reachable before a
/// collection is considered worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcAggressiveness {
    /// Collect only once half the used heap is garbage.
    Gentle,
    /// Collect once roughly a sixth of the used heap is garbage.
    Aggressive,
    /// Collect whenever any garbage exists. Test configurations only.
    Testing,
}

impl GcAggressiveness {
    pub fn overhead(self) -> f64 {
        match self {
            GcAggressiveness::Gentle => 2.0,
            GcAggressiveness::Aggressive => 1.2,
            GcAggressiveness::Testing => 1.0,
        }
    }
}

/// Configuration for the shared region and the per-process machinery layered
/// on top of it. All sizes are frozen at init time; child processes adopt
/// them through the [`Handle`](crate::shmem::Handle).
#[derive(Debug, Clone)]
pub struct ShmConfig {
    /// Total size of the shared region in bytes. Must cover the header, both
    /// tables and the heap.
    pub global_size: usize,

    /// Size of the compressed-blob heap in bytes.
    pub heap_size: usize,

    /// The hash table holds `2^hash_table_pow` slots.
    pub hash_table_pow: u8,

    /// The dependency table holds `2^dep_table_pow` slots.
    pub dep_table_pow: u8,

    /// Candidate filesystems for a file-backed region, tried in order when
    /// an anonymous mapping cannot be created.
    pub shm_dirs: Vec<PathBuf>,

    /// Minimum free bytes a candidate filesystem must report.
    pub shm_min_avail: u64,

    /// 0 disables telemetry sampling, 1 samples basic totals, 2 and above
    /// additionally samples deserialized-allocation estimates.
    pub log_level: u8,

    /// Fraction of writes wrapped in a profiling envelope (0.0 - 1.0).
    pub sample_rate: f64,

    /// Worker count, used only to size per-worker serialize scratch buffers.
    pub workers: Option<usize>,

    /// Garbage-collection trigger policy.
    pub gc: GcAggressiveness,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            global_size: 1024 * 1024 * 1024, // 1GB
            heap_size: 512 * 1024 * 1024,    // 512MB
            hash_table_pow: 18,
            dep_table_pow: 17,
            shm_dirs: vec![PathBuf::from("/dev/shm"), PathBuf::from("/tmp")],
            shm_min_avail: 512 * 1024 * 1024,
            log_level: 0,
            sample_rate: 0.0,
            workers: None,
            gc: GcAggressiveness::Gentle,
        }
    }
}

impl ShmConfig {
    /// A small region suitable for tests: 1MB heap, 2^10 hash slots.
    pub fn small() -> Self {
        Self {
            global_size: 8 * 1024 * 1024,
            heap_size: 1024 * 1024,
            hash_table_pow: 10,
            dep_table_pow: 10,
            shm_min_avail: 0,
            gc: GcAggressiveness::Testing,
            ..Self::default()
        }
    }
}

/// Per-process cache sizing. L1 is insertion-ordered, L2 is frequency-kept;
/// L2 holds up to twice its capacity between collection passes.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub l1_capacity: usize,
    pub l2_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 1000,
            l2_capacity: 1000,
        }
    }
}

thread_local! {
    // Process-local write gates. Workers that must never mutate the shared
    // region close these; every mutating arena path consults them.
    static ALLOW_REMOVES: Cell<bool> = const { Cell::new(true) };
    static ALLOW_HASHTABLE_WRITES: Cell<bool> = const { Cell::new(true) };
}

/// Forbid or re-allow `remove` in this process.
pub fn set_allow_removes(allow: bool) {
    ALLOW_REMOVES.with(|gate| gate.set(allow));
}

pub fn allow_removes() -> bool {
    ALLOW_REMOVES.with(|gate| gate.get())
}

/// Gate all hash-table writes by the current process.
pub fn set_allow_hashtable_writes_by_current_process(allow: bool) {
    ALLOW_HASHTABLE_WRITES.with(|gate| gate.set(allow));
}

pub fn allow_hashtable_writes_by_current_process() -> bool {
    ALLOW_HASHTABLE_WRITES.with(|gate| gate.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_overheads() {
        assert_eq!(GcAggressiveness::Gentle.overhead(), 2.0);
        assert_eq!(GcAggressiveness::Aggressive.overhead(), 1.2);
        assert_eq!(GcAggressiveness::Testing.overhead(), 1.0);
    }
}
