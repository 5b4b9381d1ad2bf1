//! Typed stores layered over the arena.
//!
//! The layering, bottom up: [`ImmediateStore`] serializes values straight
//! into the shared region; [`OverlayStack`] interposes speculative change
//! frames with revert/commit; [`NewOldView`] splits the key space into new
//! and old namespaces; [`CachedStore`] fronts the whole column with the
//! per-process two-tier cache. Each layer only talks to the one below it.

pub mod cached;
pub mod immediate;
pub mod overlay;
pub mod view;

pub use cached::CachedStore;
pub use immediate::{ImmediateStore, ProfiledStore};
pub use overlay::{Action, OverlayStack};
pub use view::NewOldView;

use crate::error::Result;
use crate::key::Digest;

/// A digest-keyed typed backend: the seam between the overlay machinery
/// and whatever ultimately holds the bytes.
pub trait DigestStore<V> {
    /// Binds `value` under `digest`. A no-op if the digest is already
    /// bound (first write wins at this level).
    fn add(&self, digest: &Digest, value: &V) -> Result<()>;

    /// Total read.
    fn try_get(&self, digest: &Digest) -> Result<Option<V>>;

    /// Partial read; fails with `KeyMissing` when absent.
    fn get(&self, digest: &Digest) -> Result<V> {
        self.try_get(digest)?.ok_or(crate::error::Error::KeyMissing)
    }

    fn mem(&self, digest: &Digest) -> bool;

    /// Unbinds `digest`. Requires membership.
    fn remove(&self, digest: &Digest) -> Result<()>;

    /// Rebinds `src`'s value under `dst`. Requires `mem(src)` and
    /// `!mem(dst)`.
    fn rename(&self, src: &Digest, dst: &Digest) -> Result<()>;
}
