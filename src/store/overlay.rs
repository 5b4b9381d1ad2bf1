//! Speculative change frames over a store that cannot roll back.
//!
//! The arena itself is append-only and shared, so transactional behavior
//! lives entirely in this per-process layer. Each frame maps a digest to
//! at most one pending [`Action`]; reads walk from the top frame down and
//! fall through to the base store. Frames live in a `Vec` arena and refer
//! to their parent by index, which keeps `pop_stack` free of any pointer
//! back-references.
//!
//! Per key, within one frame:
//!
//! ```text
//!         add v                 remove
//! Empty  -------->  Add(v)    -------->  (entry erased)
//! Filled -------->  Replace(v)
//! Remove -------->  Replace(v)
//! Add(v)    -- add w --> Add(w)
//! Replace(v)-- add w --> Replace(w);  -- remove --> Remove
//! Remove    -- remove --> error
//! ```
//!
//! "Filled"/"Empty" is visibility through the frames below plus the base.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::key::{Digest, Value};
use crate::store::DigestStore;
use crate::telemetry::{self, Telemetry};

/// A pending change to one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Action<V> {
    /// Shadows a binding visible below.
    Remove,
    /// A binding not present below.
    Add(V),
    /// Overwrites a binding visible below.
    Replace(V),
}

struct Frame<V> {
    actions: HashMap<Digest, Action<V>>,
    parent: Option<usize>,
}

#[derive(Default)]
struct OverlayStats {
    frames: Cell<u64>,
    actions: Cell<u64>,
}

/// A stack of speculative frames over a digest-keyed base store.
pub struct OverlayStack<V, S> {
    base: S,
    frames: Vec<Frame<V>>,
    top: Option<usize>,
    stats: Rc<OverlayStats>,
}

impl<V, S> OverlayStack<V, S>
where
    V: Clone,
    S: DigestStore<V>,
{
    pub fn new(base: S) -> Self
    where
        V: Value,
    {
        let stats = Rc::new(OverlayStats::default());
        let enumerated = stats.clone();
        telemetry::register_enumerator(
            format!("{} (overlay)", V::description()),
            Box::new(move || {
                Telemetry::Counter {
                    count: enumerated.frames.get(),
                    bytes: enumerated.actions.get(),
                }
            }),
        );
        OverlayStack {
            base,
            frames: Vec::new(),
            top: None,
            stats,
        }
    }

    pub fn base(&self) -> &S {
        &self.base
    }

    /// Live frame count.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn sync_stats(&self) {
        self.stats.frames.set(self.frames.len() as u64);
        self.stats
            .actions
            .set(self.frames.iter().map(|f| f.actions.len() as u64).sum());
    }

    /// Opens a fresh speculative frame.
    pub fn push_stack(&mut self) {
        let parent = self.top;
        self.frames.push(Frame {
            actions: HashMap::new(),
            parent,
        });
        self.top = Some(self.frames.len() - 1);
        self.sync_stats();
    }

    /// Discards the top frame and everything it held.
    pub fn pop_stack(&mut self) -> Result<()> {
        let top = self.top.ok_or(Error::EmptyStack)?;
        // Push/pop are strictly LIFO, so the top frame is the last slot.
        debug_assert_eq!(top, self.frames.len() - 1);
        self.top = self.frames[top].parent;
        self.frames.truncate(top);
        self.sync_stats();
        Ok(())
    }

    fn mem_at(&self, level: Option<usize>, digest: &Digest) -> bool {
        let mut cursor = level;
        while let Some(index) = cursor {
            if let Some(action) = self.frames[index].actions.get(digest) {
                return !matches!(action, Action::Remove);
            }
            cursor = self.frames[index].parent;
        }
        self.base.mem(digest)
    }

    fn get_at(&self, level: Option<usize>, digest: &Digest) -> Result<Option<V>> {
        let mut cursor = level;
        while let Some(index) = cursor {
            match self.frames[index].actions.get(digest) {
                Some(Action::Add(value)) | Some(Action::Replace(value)) => {
                    return Ok(Some(value.clone()));
                }
                Some(Action::Remove) => return Ok(None),
                None => cursor = self.frames[index].parent,
            }
        }
        self.base.try_get(digest)
    }

    fn add_at(&mut self, level: Option<usize>, digest: Digest, value: V) -> Result<()> {
        let Some(index) = level else {
            return self.base.add(&digest, &value);
        };
        let next = match self.frames[index].actions.get(&digest) {
            Some(Action::Add(_)) => Action::Add(value),
            Some(Action::Replace(_)) | Some(Action::Remove) => Action::Replace(value),
            None => {
                if self.mem_at(self.frames[index].parent, &digest) {
                    Action::Replace(value)
                } else {
                    Action::Add(value)
                }
            }
        };
        self.frames[index].actions.insert(digest, next);
        self.sync_stats();
        Ok(())
    }

    fn remove_at(&mut self, level: Option<usize>, digest: &Digest) -> Result<()> {
        let Some(index) = level else {
            return self.base.remove(digest);
        };
        match self.frames[index].actions.get(digest) {
            Some(Action::Add(_)) => {
                // The binding never existed below; erase the entry.
                self.frames[index].actions.remove(digest);
            }
            Some(Action::Replace(_)) => {
                self.frames[index].actions.insert(*digest, Action::Remove);
            }
            Some(Action::Remove) => return Err(Error::RemoveAbsent),
            None => {
                if !self.mem_at(self.frames[index].parent, digest) {
                    return Err(Error::RemoveAbsent);
                }
                self.frames[index].actions.insert(*digest, Action::Remove);
            }
        }
        self.sync_stats();
        Ok(())
    }

    pub fn add(&mut self, digest: Digest, value: V) -> Result<()> {
        self.add_at(self.top, digest, value)
    }

    pub fn remove(&mut self, digest: &Digest) -> Result<()> {
        self.remove_at(self.top, digest)
    }

    /// Total read through the stack.
    pub fn get(&self, digest: &Digest) -> Result<Option<V>> {
        self.get_at(self.top, digest)
    }

    /// Partial read; fails with `KeyMissing` when nothing is visible.
    pub fn fetch(&self, digest: &Digest) -> Result<V> {
        self.get(digest)?.ok_or(Error::KeyMissing)
    }

    pub fn mem(&self, digest: &Digest) -> bool {
        self.mem_at(self.top, digest)
    }

    /// Moves the visible binding of `src` to `dst` at the current view.
    pub fn rename(&mut self, src: &Digest, dst: &Digest) -> Result<()> {
        if !self.mem(src) {
            return Err(Error::MoveSourceMissing);
        }
        if self.mem(dst) {
            return Err(Error::MoveDestinationPresent);
        }
        if self.top.is_none() {
            // No speculative state in the way; move the blob in place.
            return self.base.rename(src, dst);
        }
        let value = self.fetch(src)?;
        self.remove(src)?;
        self.add(*dst, value)
    }

    /// Drops the top-frame action on one key.
    pub fn revert(&mut self, digest: &Digest) {
        if let Some(top) = self.top {
            self.frames[top].actions.remove(digest);
            self.sync_stats();
        }
    }

    /// Drops every action in the top frame.
    pub fn revert_all(&mut self) {
        if let Some(top) = self.top {
            self.frames[top].actions.clear();
            self.sync_stats();
        }
    }

    fn apply_below(&mut self, parent: Option<usize>, digest: Digest, action: Action<V>) -> Result<()> {
        match action {
            Action::Add(value) => self.add_at(parent, digest, value),
            Action::Replace(value) => {
                self.remove_at(parent, &digest)?;
                self.add_at(parent, digest, value)
            }
            Action::Remove => self.remove_at(parent, &digest),
        }
    }

    /// Applies the top-frame action on one key to the frame beneath (or
    /// the base store when this is the only frame).
    pub fn commit(&mut self, digest: &Digest) -> Result<()> {
        let Some(top) = self.top else {
            return Ok(());
        };
        let parent = self.frames[top].parent;
        if let Some(action) = self.frames[top].actions.remove(digest) {
            self.apply_below(parent, *digest, action)?;
        }
        self.sync_stats();
        Ok(())
    }

    /// Applies every action in the top frame one level down.
    pub fn commit_all(&mut self) -> Result<()> {
        let Some(top) = self.top else {
            return Ok(());
        };
        let parent = self.frames[top].parent;
        let actions: Vec<_> = self.frames[top].actions.drain().collect();
        for (digest, action) in actions {
            self.apply_below(parent, digest, action)?;
        }
        self.sync_stats();
        Ok(())
    }
}
