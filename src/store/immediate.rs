//! The typed store talking directly to the arena.
//!
//! Values are bincode-serialized, compressed when it pays, and written as
//! opaque blobs under their key digest. Every size the arena reports is
//! fed into the process sampler under names derived from the value
//! description, and each store registers a telemetry enumerator at
//! construction so one [`crate::telemetry::get_telemetry`] call covers
//! every store in the process.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::key::{Digest, Value};
use crate::shmem::heap::HeapBlob;
use crate::shmem::Arena;
use crate::store::DigestStore;
use crate::telemetry::{self, Telemetry};

/// Serialized payloads shorter than this are stored uncompressed; zstd
/// framing would only grow them.
const COMPRESSION_THRESHOLD: usize = 128;

const COMPRESSION_LEVEL: i32 = 1;

#[derive(Default)]
struct Counters {
    adds: Cell<u64>,
    added_bytes: Cell<u64>,
    gets: Cell<u64>,
    read_bytes: Cell<u64>,
}

impl Counters {
    fn telemetry(&self) -> Telemetry {
        let mut group = BTreeMap::new();
        group.insert(
            "adds".to_string(),
            Telemetry::Counter {
                count: self.adds.get(),
                bytes: self.added_bytes.get(),
            },
        );
        group.insert(
            "gets".to_string(),
            Telemetry::Counter {
                count: self.gets.get(),
                bytes: self.read_bytes.get(),
            },
        );
        Telemetry::Group(group)
    }
}

/// Typed add/get/remove/rename over the arena for one value type.
pub struct ImmediateStore<V> {
    arena: Rc<Arena>,
    counters: Rc<Counters>,
    // Reused across adds; sized from the arena's per-worker hint.
    scratch: RefCell<Vec<u8>>,
    _marker: PhantomData<V>,
}

impl<V: Value> ImmediateStore<V> {
    pub fn new(arena: Rc<Arena>) -> Self {
        let counters = Rc::new(Counters::default());
        let enumerated = counters.clone();
        telemetry::register_enumerator(
            V::description(),
            Box::new(move || enumerated.telemetry()),
        );
        let scratch = RefCell::new(Vec::with_capacity(arena.scratch_capacity()));
        ImmediateStore {
            arena,
            counters,
            scratch,
            _marker: PhantomData,
        }
    }

    pub fn arena(&self) -> &Rc<Arena> {
        &self.arena
    }

    fn decode(&self, blob: HeapBlob) -> Result<V> {
        let serialized = if blob.compressed {
            zstd::bulk::decompress(&blob.bytes, blob.uncompressed_len as usize)
                .map_err(crate::error::Error::from)?
        } else {
            blob.bytes
        };
        self.counters.gets.set(self.counters.gets.get() + 1);
        self.counters
            .read_bytes
            .set(self.counters.read_bytes.get() + serialized.len() as u64);
        telemetry::sample(
            &format!("{} (bytes deserialized from shared heap)", V::description()),
            serialized.len() as u64,
        );
        if telemetry::log_level() > 1 {
            // Allocation estimate for the materialized value; the
            // serialized form is the closest cheap proxy.
            telemetry::sample(
                &format!("{} (bytes allocated for deserialized value)", V::description()),
                serialized.len() as u64,
            );
        }
        Ok(bincode::deserialize(&serialized)?)
    }
}

impl<V: Value> DigestStore<V> for ImmediateStore<V> {
    fn add(&self, digest: &Digest, value: &V) -> Result<()> {
        let mut scratch = self.scratch.borrow_mut();
        scratch.clear();
        bincode::serialize_into(&mut *scratch, value)?;
        let uncompressed_len = scratch.len();

        let mut packed = None;
        if uncompressed_len >= COMPRESSION_THRESHOLD {
            let candidate = zstd::bulk::compress(&scratch, COMPRESSION_LEVEL)
                .map_err(crate::error::Error::from)?;
            if candidate.len() < uncompressed_len {
                packed = Some(candidate);
            }
        }
        let (bytes, compressed): (&[u8], bool) = match &packed {
            Some(candidate) => (candidate, true),
            None => (&scratch, false),
        };

        let outcome = self
            .arena
            .add(digest, bytes, uncompressed_len as u32, compressed)?;
        if outcome.fresh {
            self.counters.adds.set(self.counters.adds.get() + 1);
            self.counters
                .added_bytes
                .set(self.counters.added_bytes.get() + outcome.total_size);
            let desc = V::description();
            telemetry::sample(
                &format!("{desc} (bytes serialized into shared heap)"),
                outcome.original_size,
            );
            telemetry::sample(
                &format!("{desc} (compressed bytes written into shared heap)"),
                outcome.compressed_size,
            );
            telemetry::sample(
                &format!("{desc} (total bytes including header and padding)"),
                outcome.total_size,
            );
        }
        Ok(())
    }

    fn try_get(&self, digest: &Digest) -> Result<Option<V>> {
        match self.arena.try_get(digest)? {
            Some(blob) => Ok(Some(self.decode(blob)?)),
            None => Ok(None),
        }
    }

    fn mem(&self, digest: &Digest) -> bool {
        self.arena.mem(digest)
    }

    fn remove(&self, digest: &Digest) -> Result<()> {
        self.arena.remove(digest)?;
        Ok(())
    }

    fn rename(&self, src: &Digest, dst: &Digest) -> Result<()> {
        self.arena.rename(src, dst)
    }
}

/// The profiling envelope. Reads handle both variants, so a store can be
/// switched between profiled and plain only together with a fresh arena.
#[derive(Serialize, Deserialize)]
enum Sampled<V> {
    Plain(V),
    Profiled { value: V, write_ms: u64 },
}

impl<V: Value> Value for Sampled<V> {
    fn prefix() -> crate::key::Prefix {
        V::prefix()
    }

    fn description() -> &'static str {
        V::description()
    }
}

/// An immediate store that wraps a configured fraction of writes in a
/// write-timestamp envelope and emits an access sample whenever a profiled
/// value is read back.
pub struct ProfiledStore<V> {
    inner: ImmediateStore<Sampled<V>>,
    sample_rate: f64,
}

impl<V: Value> ProfiledStore<V> {
    pub fn new(arena: Rc<Arena>, sample_rate: f64) -> Self {
        ProfiledStore {
            inner: ImmediateStore::new(arena),
            sample_rate,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl<V: Value + Clone> DigestStore<V> for ProfiledStore<V> {
    fn add(&self, digest: &Digest, value: &V) -> Result<()> {
        let envelope = if rand::thread_rng().gen::<f64>() < self.sample_rate {
            Sampled::Profiled {
                value: value.clone(),
                write_ms: now_ms(),
            }
        } else {
            Sampled::Plain(value.clone())
        };
        self.inner.add(digest, &envelope)
    }

    fn try_get(&self, digest: &Digest) -> Result<Option<V>> {
        match self.inner.try_get(digest)? {
            None => Ok(None),
            Some(Sampled::Plain(value)) => Ok(Some(value)),
            Some(Sampled::Profiled { value, write_ms }) => {
                telemetry::sample_access(V::description(), write_ms);
                Ok(Some(value))
            }
        }
    }

    fn mem(&self, digest: &Digest) -> bool {
        self.inner.mem(digest)
    }

    fn remove(&self, digest: &Digest) -> Result<()> {
        self.inner.remove(digest)
    }

    fn rename(&self, src: &Digest, dst: &Digest) -> Result<()> {
        self.inner.rename(src, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShmConfig;
    use crate::key::Prefix;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Decl {
        name: String,
        arity: u32,
    }

    impl Value for Decl {
        fn prefix() -> Prefix {
            Prefix(0x10)
        }

        fn description() -> &'static str {
            "Decl"
        }
    }

    fn store() -> ImmediateStore<Decl> {
        let arena = Rc::new(Arena::init(&ShmConfig::small()).unwrap());
        ImmediateStore::new(arena)
    }

    fn digest(name: &str) -> Digest {
        Digest(md5::compute(name.as_bytes()).0)
    }

    fn decl(name: &str) -> Decl {
        Decl {
            name: name.to_string(),
            arity: name.len() as u32,
        }
    }

    #[test]
    fn test_roundtrip() {
        let store = store();
        store.add(&digest("f"), &decl("f")).unwrap();
        assert_eq!(store.get(&digest("f")).unwrap(), decl("f"));
        assert!(store.mem(&digest("f")));
        assert_eq!(store.try_get(&digest("missing")).unwrap(), None);
    }

    #[test]
    fn test_first_write_wins() {
        let store = store();
        store.add(&digest("f"), &decl("first")).unwrap();
        store.add(&digest("f"), &decl("second")).unwrap();
        assert_eq!(store.get(&digest("f")).unwrap(), decl("first"));
    }

    #[test]
    fn test_large_values_compress() {
        let store = store();
        let big = Decl {
            name: "x".repeat(64 * 1024),
            arity: 1,
        };
        store.add(&digest("big"), &big).unwrap();
        // A 64K run of one byte must compress well below the heap cost of
        // storing it raw.
        let arena = store.arena();
        assert!(arena.heap_used() < 16 * 1024);
        assert_eq!(store.get(&digest("big")).unwrap(), big);
    }

    #[test]
    fn test_small_values_stay_plain() {
        let store = store();
        store.add(&digest("s"), &decl("tiny")).unwrap();
        assert_eq!(store.get(&digest("s")).unwrap(), decl("tiny"));
    }

    #[test]
    fn test_profiled_roundtrip_both_variants() {
        let arena = Rc::new(Arena::init(&ShmConfig::small()).unwrap());
        // Rate 1.0: every write is enveloped with a timestamp.
        let profiled: ProfiledStore<Decl> = ProfiledStore::new(arena.clone(), 1.0);
        profiled.add(&digest("p"), &decl("p")).unwrap();
        assert_eq!(profiled.get(&digest("p")).unwrap(), decl("p"));

        // Rate 0.0: plain envelopes, same read path.
        let plain: ProfiledStore<Decl> = ProfiledStore::new(arena, 0.0);
        plain.add(&digest("q"), &decl("q")).unwrap();
        assert_eq!(plain.get(&digest("q")).unwrap(), decl("q"));
        // Either store reads the other's writes.
        assert_eq!(plain.get(&digest("p")).unwrap(), decl("p"));
        assert_eq!(profiled.get(&digest("q")).unwrap(), decl("q"));
    }

    #[test]
    fn test_rename_moves_value() {
        let store = store();
        store.add(&digest("a"), &decl("v")).unwrap();
        store.rename(&digest("a"), &digest("b")).unwrap();
        assert!(!store.mem(&digest("a")));
        assert_eq!(store.get(&digest("b")).unwrap(), decl("v"));
    }
}
