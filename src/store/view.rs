//! The old/new split over one overlay stack.
//!
//! A user key resolves to two digests: its new-namespace digest and the
//! digest of its `old_`-prefixed twin. Normal reads and writes see only
//! the new namespace; `get_old`/`mem_old`/`remove_old` see only the old
//! one. The sole crossings are `oldify`, which moves a binding into the
//! old namespace to stage a recomputation, and `revive`, which moves it
//! back, dropping any binding the recomputation produced in the meantime.
//!
//! Batch operations are per-element; nothing is atomic across a batch.

use std::marker::PhantomData;

use crate::error::Result;
use crate::key::{Digest, Key, Prefix, StoreKey, Value};
use crate::store::{DigestStore, OverlayStack};

/// Typed old/new view over an overlay stack.
pub struct NewOldView<K, V, S> {
    overlay: OverlayStack<V, S>,
    prefix: Prefix,
    _marker: PhantomData<K>,
}

impl<K, V, S> NewOldView<K, V, S>
where
    K: Key,
    V: Value + Clone,
    S: DigestStore<V>,
{
    pub fn new(overlay: OverlayStack<V, S>) -> Self {
        NewOldView {
            overlay,
            prefix: V::prefix(),
            _marker: PhantomData,
        }
    }

    pub fn overlay(&self) -> &OverlayStack<V, S> {
        &self.overlay
    }

    fn digests(&self, key: &K) -> Result<(Digest, Digest)> {
        let store_key = StoreKey::make(self.prefix, key)?;
        Ok((store_key.md5(), store_key.md5_old()))
    }

    fn digest_new(&self, key: &K) -> Result<Digest> {
        Ok(StoreKey::make(self.prefix, key)?.md5())
    }

    fn digest_old(&self, key: &K) -> Result<Digest> {
        Ok(StoreKey::make(self.prefix, key)?.md5_old())
    }

    // New namespace.

    pub fn add(&mut self, key: &K, value: V) -> Result<()> {
        let digest = self.digest_new(key)?;
        self.overlay.add(digest, value)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.overlay.get(&self.digest_new(key)?)
    }

    pub fn fetch(&self, key: &K) -> Result<V> {
        self.overlay.fetch(&self.digest_new(key)?)
    }

    pub fn mem(&self, key: &K) -> Result<bool> {
        Ok(self.overlay.mem(&self.digest_new(key)?))
    }

    pub fn remove(&mut self, key: &K) -> Result<()> {
        let digest = self.digest_new(key)?;
        self.overlay.remove(&digest)
    }

    // Old namespace.

    pub fn get_old(&self, key: &K) -> Result<Option<V>> {
        self.overlay.get(&self.digest_old(key)?)
    }

    pub fn mem_old(&self, key: &K) -> Result<bool> {
        Ok(self.overlay.mem(&self.digest_old(key)?))
    }

    pub fn remove_old(&mut self, key: &K) -> Result<()> {
        let digest = self.digest_old(key)?;
        self.overlay.remove(&digest)
    }

    // Crossings.

    /// Moves the key's binding into the old namespace.
    pub fn oldify(&mut self, key: &K) -> Result<()> {
        let (new, old) = self.digests(key)?;
        self.overlay.rename(&new, &old)
    }

    /// Moves the key's old binding back, dropping any new binding first
    /// so the move precondition holds.
    pub fn revive(&mut self, key: &K) -> Result<()> {
        let (new, old) = self.digests(key)?;
        if self.overlay.mem(&new) {
            self.overlay.remove(&new)?;
        }
        self.overlay.rename(&old, &new)
    }

    // Batches. Per-element semantics: absent elements degrade to the
    // cleanup the staging protocol expects instead of failing the batch.

    /// Oldifies every present key; for absent keys, clears a stale old
    /// binding if one exists.
    pub fn oldify_batch<'a>(&mut self, keys: impl IntoIterator<Item = &'a K>) -> Result<()>
    where
        K: 'a,
    {
        for key in keys {
            if self.mem(key)? {
                self.oldify(key)?;
            } else if self.mem_old(key)? {
                self.remove_old(key)?;
            }
        }
        Ok(())
    }

    /// Revives every key with an old binding; for the rest, drops the new
    /// binding if one exists.
    pub fn revive_batch<'a>(&mut self, keys: impl IntoIterator<Item = &'a K>) -> Result<()>
    where
        K: 'a,
    {
        for key in keys {
            if self.mem_old(key)? {
                self.revive(key)?;
            } else if self.mem(key)? {
                self.remove(key)?;
            }
        }
        Ok(())
    }

    /// Removes every present key; absent keys are skipped.
    pub fn remove_batch<'a>(&mut self, keys: impl IntoIterator<Item = &'a K>) -> Result<()>
    where
        K: 'a,
    {
        for key in keys {
            if self.mem(key)? {
                self.remove(key)?;
            }
        }
        Ok(())
    }

    /// Removes every key's old binding; keys without one are skipped.
    pub fn remove_old_batch<'a>(&mut self, keys: impl IntoIterator<Item = &'a K>) -> Result<()>
    where
        K: 'a,
    {
        for key in keys {
            if self.mem_old(key)? {
                self.remove_old(key)?;
            }
        }
        Ok(())
    }

    /// Reads every key, preserving order; absent keys yield `None`.
    pub fn get_batch<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a K>,
    ) -> Result<Vec<Option<V>>>
    where
        K: 'a,
    {
        keys.into_iter().map(|key| self.get(key)).collect()
    }

    /// Old-namespace counterpart of [`NewOldView::get_batch`].
    pub fn get_old_batch<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a K>,
    ) -> Result<Vec<Option<V>>>
    where
        K: 'a,
    {
        keys.into_iter().map(|key| self.get_old(key)).collect()
    }

    // Overlay stack controls, forwarded for the cached layer.

    pub fn push_stack(&mut self) {
        self.overlay.push_stack();
    }

    pub fn pop_stack(&mut self) -> Result<()> {
        self.overlay.pop_stack()
    }

    pub fn revert_all(&mut self) {
        self.overlay.revert_all();
    }

    pub fn commit_all(&mut self) -> Result<()> {
        self.overlay.commit_all()
    }
}
