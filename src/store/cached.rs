//! The cache-fronted store the type checker actually uses.
//!
//! Composition, outermost first: the two-tier [`LocalCache`], the old/new
//! view, the overlay stack, the immediate store, the arena. Reads check
//! the cache and populate it on a hit from below; writes go through and
//! populate; `write_around` goes through without touching the cache. The
//! old namespace bypasses the cache entirely (only new-namespace values
//! are ever cached). Pushing or popping an overlay frame clears the whole
//! cache, since entries are not frame-qualified.

use std::cell::RefCell;
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

use crate::cache::LocalCache;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::key::{Key, Value};
use crate::store::view::NewOldView;
use crate::store::DigestStore;
use crate::telemetry::{self, Telemetry};

pub struct CachedStore<K, V, S>
where
    K: Key + Hash + Eq + Clone + Debug,
    V: Value + Clone + PartialEq,
    S: DigestStore<V>,
{
    view: NewOldView<K, V, S>,
    cache: Rc<RefCell<LocalCache<K, V>>>,
}

impl<K, V, S> CachedStore<K, V, S>
where
    K: Key + Hash + Eq + Clone + Debug + 'static,
    V: Value + Clone + PartialEq + 'static,
    S: DigestStore<V>,
{
    pub fn new(view: NewOldView<K, V, S>, config: CacheConfig) -> Self {
        let cache = Rc::new(RefCell::new(LocalCache::new(config)));

        let invalidated = Rc::downgrade(&cache);
        telemetry::register_invalidator(Box::new(move || {
            if let Some(cache) = invalidated.upgrade() {
                cache.borrow_mut().clear();
            }
        }));

        let enumerated = Rc::downgrade(&cache);
        telemetry::register_enumerator(
            format!("{} (local cache)", V::description()),
            Box::new(move || {
                let count = enumerated
                    .upgrade()
                    .map(|cache| cache.borrow().len() as u64)
                    .unwrap_or(0);
                Telemetry::Counter { count, bytes: 0 }
            }),
        );

        CachedStore { view, cache }
    }

    /// Entries currently cached, across both tiers.
    pub fn cache_len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        if let Some(value) = self.cache.borrow_mut().get(key) {
            return Ok(Some(value));
        }
        match self.view.get(key)? {
            Some(value) => {
                self.cache.borrow_mut().add(key.clone(), value.clone());
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn fetch(&self, key: &K) -> Result<V> {
        self.get(key)?.ok_or(crate::error::Error::KeyMissing)
    }

    pub fn mem(&self, key: &K) -> Result<bool> {
        if self.cache.borrow_mut().get(key).is_some() {
            return Ok(true);
        }
        self.view.mem(key)
    }

    /// Writes through and populates the cache.
    pub fn add(&mut self, key: &K, value: V) -> Result<()> {
        self.view.add(key, value.clone())?;
        self.cache.borrow_mut().add(key.clone(), value);
        Ok(())
    }

    /// Writes to the underlying store without touching the cache. Sound
    /// only because `add` is first-write-wins below the overlay: a caller
    /// uses this when its cached entry is fresher than the store.
    pub fn write_around(&mut self, key: &K, value: V) -> Result<()> {
        self.view.add(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Result<()> {
        self.view.remove(key)?;
        self.cache.borrow_mut().remove(key);
        Ok(())
    }

    // Old namespace: never cached.

    pub fn get_old(&self, key: &K) -> Result<Option<V>> {
        self.view.get_old(key)
    }

    pub fn mem_old(&self, key: &K) -> Result<bool> {
        self.view.mem_old(key)
    }

    pub fn remove_old(&mut self, key: &K) -> Result<()> {
        self.view.remove_old(key)
    }

    pub fn get_old_batch<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a K>,
    ) -> Result<Vec<Option<V>>>
    where
        K: 'a,
    {
        self.view.get_old_batch(keys)
    }

    // Crossings invalidate the affected cache entries.

    pub fn oldify(&mut self, key: &K) -> Result<()> {
        self.view.oldify(key)?;
        self.cache.borrow_mut().remove(key);
        Ok(())
    }

    pub fn revive(&mut self, key: &K) -> Result<()> {
        self.view.revive(key)?;
        self.cache.borrow_mut().remove(key);
        Ok(())
    }

    pub fn oldify_batch<'a>(&mut self, keys: impl IntoIterator<Item = &'a K> + Clone) -> Result<()>
    where
        K: 'a,
    {
        self.view.oldify_batch(keys.clone())?;
        let mut cache = self.cache.borrow_mut();
        for key in keys {
            cache.remove(key);
        }
        Ok(())
    }

    pub fn revive_batch<'a>(&mut self, keys: impl IntoIterator<Item = &'a K> + Clone) -> Result<()>
    where
        K: 'a,
    {
        self.view.revive_batch(keys.clone())?;
        let mut cache = self.cache.borrow_mut();
        for key in keys {
            cache.remove(key);
        }
        Ok(())
    }

    pub fn remove_batch<'a>(&mut self, keys: impl IntoIterator<Item = &'a K> + Clone) -> Result<()>
    where
        K: 'a,
    {
        self.view.remove_batch(keys.clone())?;
        let mut cache = self.cache.borrow_mut();
        for key in keys {
            cache.remove(key);
        }
        Ok(())
    }

    // Overlay frames. Cache entries are not frame-qualified, so both
    // transitions drop the whole cache.

    pub fn push_stack(&mut self) {
        self.view.push_stack();
        self.cache.borrow_mut().clear();
    }

    pub fn pop_stack(&mut self) -> Result<()> {
        self.view.pop_stack()?;
        self.cache.borrow_mut().clear();
        Ok(())
    }

    pub fn revert_all(&mut self) {
        self.view.revert_all();
    }

    pub fn commit_all(&mut self) -> Result<()> {
        self.view.commit_all()
    }
}
