//! Per-process value caches.
//!
//! Two policies compose into the [`LocalCache`] every cached store carries:
//!
//! - [`OrderedCache`] evicts in strict insertion order (least recently
//!   added). Reads never reorder the queue.
//! - [`FreqCache`] keeps a hit counter per entry and holds up to twice its
//!   capacity; once full it purges the lower half by counter in a single
//!   pass and resets the survivors.
//!
//! Both are strictly process-local. Invalidation across every cache in the
//! process goes through [`crate::telemetry::invalidate_all_local_caches`].

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use itertools::Itertools;

use crate::config::CacheConfig;

/// Hit/miss counters shared by both policies.
pub struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::SeqCst),
            self.misses.load(Ordering::SeqCst),
        )
    }
}

/// Least-recently-added cache: a hash table plus a FIFO insertion queue.
///
/// The queue may carry stale keys for entries removed out of band; eviction
/// tolerates them.
pub struct OrderedCache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    capacity: usize,
    queue: VecDeque<K>,
    entries: HashMap<K, V>,
    stats: Stats,
}

impl<K, V> OrderedCache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        OrderedCache {
            capacity,
            queue: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
            stats: Stats::new(),
        }
    }

    /// Inserts or replaces. A replaced key keeps its original queue
    /// position; a fresh key at capacity evicts the oldest insertion first.
    pub fn add(&mut self, key: K, value: V) {
        if !self.entries.contains_key(&key) {
            if self.entries.len() >= self.capacity {
                if let Some(oldest) = self.queue.pop_front() {
                    // May already have been removed out of band.
                    self.entries.remove(&oldest);
                }
            }
            self.queue.push_back(key.clone());
        }
        self.entries.insert(key, value);
    }

    /// Reads without touching insertion order.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.entries.get(key) {
            Some(value) => {
                self.stats.hit();
                Some(value.clone())
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn remove(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

/// Least-frequently-used cache with deferred, batched eviction.
pub struct FreqCache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone + PartialEq,
{
    capacity: usize,
    entries: HashMap<K, (u64, V)>,
    stats: Stats,
}

impl<K, V> FreqCache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone + PartialEq,
{
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        FreqCache {
            capacity,
            entries: HashMap::with_capacity(2 * capacity),
            stats: Stats::new(),
        }
    }

    /// Inserts a value. Re-adding a key with an equal value bumps its
    /// counter; a different value resets the counter to zero. Once the
    /// table holds twice its capacity a collection pass runs first.
    pub fn add(&mut self, key: K, value: V) {
        if self.entries.len() >= 2 * self.capacity {
            self.collect();
        }
        match self.entries.get_mut(&key) {
            Some((freq, stored)) if *stored == value => *freq += 1,
            _ => {
                self.entries.insert(key, (0, value));
            }
        }
    }

    /// Reads and bumps the hit counter.
    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get_mut(key) {
            Some((freq, value)) => {
                *freq += 1;
                self.stats.hit();
                Some(value.clone())
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn remove(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// One pass over the table: keep the top `capacity` entries by counter
    /// with their counters reset, discard the rest. Ties are broken
    /// arbitrarily.
    fn collect(&mut self) {
        let survivors = self
            .entries
            .drain()
            .sorted_by(|(_, (fa, _)), (_, (fb, _))| fb.cmp(fa))
            .take(self.capacity)
            .map(|(key, (_, value))| (key, (0, value)))
            .collect();
        self.entries = survivors;
    }
}

/// The two-tier cache fronting a cached store: L1 ordered, L2 frequency.
///
/// A read hitting L1 refreshes the key's L2 counter; a read hitting only L2
/// promotes the entry back into L1. Writes land in both tiers.
pub struct LocalCache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone + PartialEq,
{
    l1: OrderedCache<K, V>,
    l2: FreqCache<K, V>,
}

impl<K, V> LocalCache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone + PartialEq,
{
    pub fn new(config: CacheConfig) -> Self {
        LocalCache {
            l1: OrderedCache::new(config.l1_capacity),
            l2: FreqCache::new(config.l2_capacity),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        if let Some(value) = self.l1.get(key) {
            self.l2.add(key.clone(), value.clone());
            return Some(value);
        }
        if let Some(value) = self.l2.get(key) {
            self.l1.add(key.clone(), value.clone());
            return Some(value);
        }
        None
    }

    pub fn add(&mut self, key: K, value: V) {
        self.l1.add(key.clone(), value.clone());
        self.l2.add(key, value);
    }

    pub fn remove(&mut self, key: &K) {
        self.l1.remove(key);
        self.l2.remove(key);
    }

    pub fn clear(&mut self) {
        self.l1.clear();
        self.l2.clear();
    }

    pub fn len(&self) -> usize {
        // Tiers overlap; this is an upper bound used for telemetry only.
        self.l1.len() + self.l2.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ordered(capacity: usize) -> OrderedCache<&'static str, &'static str> {
        OrderedCache::new(capacity)
    }

    #[test]
    fn test_ordered_add_and_read() {
        let mut cache = ordered(2);
        cache.add("apple", "red");
        cache.add("banana", "yellow");
        assert_eq!(cache.get(&"apple"), Some("red"));
        assert_eq!(cache.get(&"banana"), Some("yellow"));
    }

    #[test]
    fn test_ordered_evicts_oldest_insertion() {
        let mut cache = ordered(2);
        cache.add("apple", "red");
        cache.add("banana", "yellow");
        // Reads must not protect "apple" from FIFO eviction.
        assert_eq!(cache.get(&"apple"), Some("red"));
        cache.add("orange", "orange");
        assert_eq!(cache.get(&"apple"), None);
        assert_eq!(cache.get(&"banana"), Some("yellow"));
        assert_eq!(cache.get(&"orange"), Some("orange"));
    }

    #[test]
    fn test_ordered_replace_keeps_queue_position() {
        let mut cache = ordered(2);
        cache.add("apple", "red");
        cache.add("banana", "yellow");
        cache.add("apple", "green");
        cache.add("orange", "orange");
        // "apple" was inserted first and stays first in line despite the
        // later replacement.
        assert_eq!(cache.get(&"apple"), None);
        assert_eq!(cache.get(&"orange"), Some("orange"));
    }

    #[test]
    fn test_ordered_tolerates_stale_queue_entries() {
        let mut cache = ordered(2);
        cache.add("apple", "red");
        cache.add("banana", "yellow");
        cache.remove(&"apple");
        cache.add("orange", "orange");
        cache.add("pear", "green");
        assert!(cache.len() <= 2);
        assert_eq!(cache.get(&"pear"), Some("green"));
    }

    #[test]
    fn test_ordered_hit_ratio() {
        let cache = {
            let mut cache = OrderedCache::new(10);
            for i in 0..10u64 {
                cache.add(i, i);
            }
            cache
        };
        for i in 0..10u64 {
            assert_eq!(cache.get(&i), Some(i));
        }
        assert_eq!(cache.stats().get(), (10, 0));
    }

    #[test]
    fn test_freq_equal_add_bumps_counter() {
        let mut cache: FreqCache<u64, &str> = FreqCache::new(2);
        cache.add(1, "a");
        cache.add(2, "b");
        cache.add(3, "c");
        // Equal re-adds bump key 1 to frequency 2 and protect it through
        // the collection triggered by the add of key 5.
        cache.add(1, "a");
        cache.add(1, "a");
        cache.add(4, "d");
        cache.get(&2);
        cache.add(5, "e");
        assert_eq!(cache.get(&1), Some("a"));
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.get(&4), None);
    }

    #[test]
    fn test_freq_changed_value_resets_counter() {
        let mut cache: FreqCache<u64, &str> = FreqCache::new(2);
        cache.add(1, "a");
        for _ in 0..5 {
            cache.get(&1);
        }
        // A differing value resets key 1's counter to zero.
        cache.add(1, "changed");
        cache.add(2, "b");
        cache.get(&2);
        cache.get(&2);
        cache.add(3, "c");
        cache.get(&3);
        cache.add(4, "d");
        // The table is at twice capacity; this add collects first. Keys 2
        // and 3 outrank the reset key 1.
        cache.add(5, "e");
        assert_eq!(cache.get(&2), Some("b"));
        assert_eq!(cache.get(&3), Some("c"));
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&4), None);
    }

    #[test]
    fn test_freq_collection_keeps_read_keys() {
        let mut cache: FreqCache<u64, &str> = FreqCache::new(2);
        cache.add(1, "one");
        cache.add(2, "two");
        cache.add(3, "three");
        cache.add(4, "four");
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&2), Some("two"));
        // The table is at twice capacity; this add collects first, keeping
        // the two most frequently used entries.
        cache.add(5, "five");
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&2), Some("two"));
        assert_eq!(cache.get(&5), Some("five"));
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.get(&4), None);
        assert!(cache.len() <= 3);
    }

    #[test]
    fn test_freq_counters_reset_after_collection() {
        let mut cache: FreqCache<u64, &str> = FreqCache::new(1);
        cache.add(1, "one");
        for _ in 0..10 {
            cache.get(&1);
        }
        cache.add(2, "two");
        cache.get(&2);
        cache.get(&2);
        // The table is at 2C = 2; this add collects first, keeping key 1
        // (ten hits against two) with its counter reset to zero.
        cache.add(3, "three");
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&2), None);
        // Post-reset, two fresh hits on key 3 outrank key 1's single one.
        cache.get(&3);
        cache.get(&3);
        cache.add(4, "four");
        assert_eq!(cache.get(&3), Some("three"));
        assert_eq!(cache.get(&1), None);
    }

    fn local(l1: usize, l2: usize) -> LocalCache<u64, String> {
        LocalCache::new(CacheConfig {
            l1_capacity: l1,
            l2_capacity: l2,
        })
    }

    #[test]
    fn test_local_promotes_from_l2() {
        let mut cache = local(2, 4);
        cache.add(1, "one".into());
        cache.add(2, "two".into());
        // Push key 1 out of L1; it survives in L2.
        cache.add(3, "three".into());
        cache.add(4, "four".into());
        assert!(cache.l1.get(&1).is_none());
        assert_eq!(cache.get(&1), Some("one".into()));
        // The hit promoted it back into L1.
        assert_eq!(cache.l1.get(&1), Some("one".into()));
    }

    #[test]
    fn test_local_remove_clears_both_tiers() {
        let mut cache = local(2, 2);
        cache.add(1, "one".into());
        cache.remove(&1);
        assert_eq!(cache.get(&1), None);
        assert!(cache.l1.is_empty());
        assert!(cache.l2.is_empty());
    }

    #[test]
    fn test_local_clear() {
        let mut cache = local(2, 2);
        cache.add(1, "one".into());
        cache.add(2, "two".into());
        cache.clear();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get(&1), None);
    }
}
