//! Per-process telemetry and cache-invalidation registries.
//!
//! Everything here is process-local state: the shared region is never
//! involved. Samplers accumulate named counters as stores move bytes in and
//! out of the arena; stores, overlay stacks and local caches register
//! enumerator callbacks so a single [`get_telemetry`] call can fold the whole
//! process into one structured object. Registries are explicit singletons
//! with a `reset` for tests rather than ambient module state.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use serde::Serialize;

/// A folded telemetry tree: counters grouped by value-type description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Telemetry {
    Group(BTreeMap<String, Telemetry>),
    Counter { count: u64, bytes: u64 },
}

impl Telemetry {
    pub fn empty_group() -> Self {
        Telemetry::Group(BTreeMap::new())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Stat {
    count: u64,
    bytes: u64,
}

thread_local! {
    static LOG_LEVEL: Cell<u8> = const { Cell::new(0) };
    static SAMPLES: RefCell<BTreeMap<String, Stat>> = RefCell::new(BTreeMap::new());
    static ENUMERATORS: RefCell<Vec<(String, Box<dyn Fn() -> Telemetry>)>> =
        RefCell::new(Vec::new());
    static INVALIDATORS: RefCell<Vec<Box<dyn Fn()>>> = RefCell::new(Vec::new());
}

/// Sets the sampling level for this process. 0 disables sampling entirely;
/// levels above 1 enable the expensive reachable-allocation measurements.
pub fn set_log_level(level: u8) {
    LOG_LEVEL.with(|l| l.set(level));
}

pub fn log_level() -> u8 {
    LOG_LEVEL.with(|l| l.get())
}

/// Accumulates one observation under `name`. No-op when sampling is off.
pub fn sample(name: &str, bytes: u64) {
    if log_level() == 0 {
        return;
    }
    SAMPLES.with(|samples| {
        let mut samples = samples.borrow_mut();
        let stat = samples.entry(name.to_string()).or_default();
        stat.count += 1;
        stat.bytes += bytes;
    });
}

/// Emits an access event for a profiled value: the value written at
/// `write_ms` (milliseconds since the epoch) was just read back.
pub fn sample_access(description: &str, write_ms: u64) {
    tracing::debug!(description, write_ms, "profiled value accessed");
    sample(&format!("{description} (profiled accesses)"), write_ms);
}

/// Registers a callback that contributes a named subtree to
/// [`get_telemetry`]. Stores, overlay stacks and local caches register one
/// at construction.
pub fn register_enumerator(name: impl Into<String>, f: Box<dyn Fn() -> Telemetry>) {
    let name = name.into();
    ENUMERATORS.with(|e| e.borrow_mut().push((name, f)));
}

/// Registers a callback that drops every entry of one local cache.
pub fn register_invalidator(f: Box<dyn Fn()>) {
    INVALIDATORS.with(|i| i.borrow_mut().push(f));
}

/// Clears every local cache registered in this process.
pub fn invalidate_all_local_caches() {
    INVALIDATORS.with(|i| {
        for f in i.borrow().iter() {
            f();
        }
    });
}

/// Folds the sampler counters and every registered enumerator into a single
/// telemetry tree.
pub fn get_telemetry() -> Telemetry {
    let mut root = BTreeMap::new();

    SAMPLES.with(|samples| {
        let samples = samples.borrow();
        if !samples.is_empty() {
            let counters = samples
                .iter()
                .map(|(name, stat)| {
                    (
                        name.clone(),
                        Telemetry::Counter {
                            count: stat.count,
                            bytes: stat.bytes,
                        },
                    )
                })
                .collect();
            root.insert("samples".to_string(), Telemetry::Group(counters));
        }
    });

    ENUMERATORS.with(|e| {
        for (name, f) in e.borrow().iter() {
            root.insert(name.clone(), f());
        }
    });

    Telemetry::Group(root)
}

/// Drops all per-process telemetry state. Test teardown only.
pub fn reset() {
    SAMPLES.with(|s| s.borrow_mut().clear());
    ENUMERATORS.with(|e| e.borrow_mut().clear());
    INVALIDATORS.with(|i| i.borrow_mut().clear());
}
