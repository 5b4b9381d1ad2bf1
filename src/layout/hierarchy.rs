//! The layout lattice: construction, sealing, and type operations.
//!
//! Layouts form a lattice with an abstract top. The hierarchy is built
//! incrementally at startup: every layout must name parents that already
//! exist, so creation order is a topological sort. Parent edges need not
//! form a covering relation; a layout's ancestor set is the transitive
//! closure of its parent edges.
//!
//! Once [`Hierarchy::seal`] runs, the lattice is immutable: subtype, meet
//! and join become valid everywhere, every layout gets its precomputed
//! ancestor and descendant sets, and its layout test, the minimal
//! `(mask, eq)` pair such that `index & mask == eq` exactly for its
//! descendants. Before sealing, only operations on the top layout are
//! permitted; this is what lets profiling code use top while the final
//! hierarchy is still unknown.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::layout::vtable::{
    ArrayLayoutHint, BespokeArray, DispatchTable, LayoutHints, LayoutVTable, TypeBound,
    DEFAULT_HINTS,
};
use crate::layout::{LayoutIndex, FAMILY_BYTES};

/// The abstract top of the lattice, installed before any other layout.
pub const BESPOKE_TOP_INDEX: LayoutIndex = LayoutIndex(0);

/// A precomputed subtype test: `index & mask == eq` iff the indexed
/// layout is a descendant of the test's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTest {
    pub mask: u16,
    pub eq: u16,
}

impl LayoutTest {
    pub fn matches(self, index: LayoutIndex) -> bool {
        index.0 & self.mask == self.eq
    }
}

/// One node of the lattice.
pub struct Layout {
    index: LayoutIndex,
    description: String,
    concrete: bool,
    parents: BTreeSet<LayoutIndex>,
    children: BTreeSet<LayoutIndex>,
    vtable: Option<&'static LayoutVTable>,
    hints: &'static (dyn LayoutHints + Sync),
    topo_index: usize,
    // Filled in by seal(); both closures include the layout itself.
    ancestors: BTreeSet<LayoutIndex>,
    descendants: BTreeSet<LayoutIndex>,
    test: Option<LayoutTest>,
}

impl Layout {
    pub fn index(&self) -> LayoutIndex {
        self.index
    }

    pub fn describe(&self) -> &str {
        &self.description
    }

    pub fn is_concrete(&self) -> bool {
        self.concrete
    }

    pub fn parents(&self) -> &BTreeSet<LayoutIndex> {
        &self.parents
    }

    /// The operation table. Only concrete layouts have one.
    pub fn vtable(&self) -> Result<&'static LayoutVTable> {
        self.vtable.ok_or(Error::AbstractVtable(self.index.0))
    }

    /// The precomputed subtype test. Available once sealed.
    pub fn layout_test(&self) -> Result<LayoutTest> {
        self.test.ok_or(Error::HierarchyUnsealed)
    }

    // Jit type helpers, forwarded to the layout's refinement hooks.

    pub fn append_type(&self, val: TypeBound) -> ArrayLayoutHint {
        self.hints.append_type(val)
    }

    pub fn remove_type(&self, key: TypeBound) -> ArrayLayoutHint {
        self.hints.remove_type(key)
    }

    pub fn set_type(&self, key: TypeBound, val: TypeBound) -> ArrayLayoutHint {
        self.hints.set_type(key, val)
    }

    pub fn elem_type(&self, key: TypeBound) -> (TypeBound, bool) {
        self.hints.elem_type(key)
    }

    pub fn first_last_type(&self, is_first: bool, is_key: bool) -> (TypeBound, bool) {
        self.hints.first_last_type(is_first, is_key)
    }

    pub fn iter_pos_type(&self, pos: TypeBound, is_key: bool) -> TypeBound {
        self.hints.iter_pos_type(pos, is_key)
    }
}

/// The layout registry and lattice.
pub struct Hierarchy {
    layouts: BTreeMap<LayoutIndex, Layout>,
    order: Vec<LayoutIndex>,
    sealed: bool,
    dispatch: DispatchTable,
}

impl Hierarchy {
    /// A hierarchy holding only the abstract top layout.
    pub fn new() -> Hierarchy {
        let mut hierarchy = Hierarchy {
            layouts: BTreeMap::new(),
            order: Vec::new(),
            sealed: false,
            dispatch: DispatchTable::new(),
        };
        hierarchy
            .install(BESPOKE_TOP_INDEX, "BespokeTop".to_string(), &[], false, None, None)
            .expect("installing top cannot fail");
        hierarchy
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Registers an abstract layout: type-level only, no vtable.
    pub fn add_abstract(
        &mut self,
        index: LayoutIndex,
        description: impl Into<String>,
        parents: &[LayoutIndex],
    ) -> Result<LayoutIndex> {
        self.install(index, description.into(), parents, false, None, None)
    }

    /// Registers a concrete layout carrying its operation table and,
    /// optionally, sharpened jit type hints.
    pub fn add_concrete(
        &mut self,
        index: LayoutIndex,
        description: impl Into<String>,
        parents: &[LayoutIndex],
        vtable: &'static LayoutVTable,
        hints: Option<&'static (dyn LayoutHints + Sync)>,
    ) -> Result<LayoutIndex> {
        self.install(index, description.into(), parents, true, Some(vtable), hints)
    }

    fn install(
        &mut self,
        index: LayoutIndex,
        description: String,
        parents: &[LayoutIndex],
        concrete: bool,
        vtable: Option<&'static LayoutVTable>,
        hints: Option<&'static (dyn LayoutHints + Sync)>,
    ) -> Result<LayoutIndex> {
        if self.sealed {
            return Err(Error::HierarchySealed);
        }
        if index > LayoutIndex::MAX {
            return Err(Error::Assertion(format!(
                "layout index {:#06x} exceeds 15 bits",
                index.0
            )));
        }
        if self.layouts.contains_key(&index) {
            return Err(Error::DuplicateLayoutIndex(index.0));
        }
        if concrete && !FAMILY_BYTES.contains(&index.family_byte()) {
            return Err(Error::Assertion(format!(
                "concrete layout {:#06x} has no valid family byte",
                index.0
            )));
        }
        if index != BESPOKE_TOP_INDEX && parents.is_empty() {
            return Err(Error::Assertion(format!(
                "layout {:#06x} must declare at least one parent",
                index.0
            )));
        }
        for parent in parents {
            if !self.layouts.contains_key(parent) {
                return Err(Error::MissingParent(parent.0));
            }
        }

        for parent in parents {
            self.layouts
                .get_mut(parent)
                .expect("parent checked above")
                .children
                .insert(index);
        }
        let topo_index = self.order.len();
        self.layouts.insert(
            index,
            Layout {
                index,
                description,
                concrete,
                parents: parents.iter().copied().collect(),
                children: BTreeSet::new(),
                vtable,
                hints: hints.unwrap_or(&DEFAULT_HINTS),
                topo_index,
                ancestors: BTreeSet::new(),
                descendants: BTreeSet::new(),
                test: None,
            },
        );
        self.order.push(index);
        Ok(index)
    }

    /// Seals the lattice: computes every transitive closure and layout
    /// test, registers concrete vtables in the dispatch table, and
    /// freezes creation.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Error::Assertion("layout hierarchy already sealed".into()));
        }

        // Ancestors, in creation order: parents always precede children.
        let mut ancestors: BTreeMap<LayoutIndex, BTreeSet<LayoutIndex>> = BTreeMap::new();
        for &index in &self.order {
            let mut set = BTreeSet::from([index]);
            for parent in &self.layouts[&index].parents {
                set.extend(ancestors[parent].iter().copied());
            }
            ancestors.insert(index, set);
        }

        // Descendants, in reverse creation order.
        let mut descendants: BTreeMap<LayoutIndex, BTreeSet<LayoutIndex>> = BTreeMap::new();
        for &index in self.order.iter().rev() {
            let mut set = BTreeSet::from([index]);
            for child in &self.layouts[&index].children {
                set.extend(descendants[child].iter().copied());
            }
            descendants.insert(index, set);
        }

        let universe: Vec<u16> = self.order.iter().map(|i| i.0).collect();
        for &index in &self.order {
            let descendant_set = descendants.remove(&index).expect("computed above");
            let test = compute_layout_test(&universe, &descendant_set).ok_or_else(|| {
                Error::Assertion(format!(
                    "no mask/eq test separates descendants of {:#06x}",
                    index.0
                ))
            })?;
            let layout = self.layouts.get_mut(&index).expect("registered");
            layout.ancestors = ancestors.remove(&index).expect("computed above");
            layout.descendants = descendant_set;
            layout.test = Some(test);
        }

        for &index in &self.order {
            let layout = &self.layouts[&index];
            if let Some(vtable) = layout.vtable {
                self.dispatch.register(index.family_byte(), vtable)?;
            }
        }

        self.sealed = true;
        tracing::debug!(layouts = self.order.len(), "layout hierarchy sealed");
        Ok(())
    }

    /// Looks a layout up by index.
    pub fn get(&self, index: LayoutIndex) -> Option<&Layout> {
        self.layouts.get(&index)
    }

    fn fetch(&self, index: LayoutIndex) -> Result<&Layout> {
        self.layouts
            .get(&index)
            .ok_or_else(|| Error::Assertion(format!("unknown layout index {:#06x}", index.0)))
    }

    fn check_operable(&self, a: LayoutIndex, b: LayoutIndex) -> Result<()> {
        if !self.sealed && (a != BESPOKE_TOP_INDEX || b != BESPOKE_TOP_INDEX) {
            return Err(Error::HierarchyUnsealed);
        }
        Ok(())
    }

    /// `a <= b`: is `a` a descendant of `b` (equality included)?
    pub fn is_subtype(&self, a: LayoutIndex, b: LayoutIndex) -> Result<bool> {
        self.check_operable(a, b)?;
        if !self.sealed {
            return Ok(true); // both are top
        }
        self.fetch(a)?;
        Ok(self.fetch(b)?.descendants.contains(&a))
    }

    /// `a | b`: the least common ancestor. Total: top bounds everything.
    pub fn join(&self, a: LayoutIndex, b: LayoutIndex) -> Result<LayoutIndex> {
        self.check_operable(a, b)?;
        if !self.sealed {
            return Ok(BESPOKE_TOP_INDEX);
        }
        let common: Vec<&Layout> = self
            .fetch(a)?
            .ancestors
            .intersection(&self.fetch(b)?.ancestors)
            .map(|&index| &self.layouts[&index])
            .collect();
        let best = common
            .iter()
            .max_by_key(|layout| layout.topo_index)
            .ok_or_else(|| Error::Assertion("join found no common ancestor".into()))?;
        // The deepest common ancestor must bound every other one, or the
        // lattice has no unique join for this pair.
        for other in &common {
            if !other.descendants.contains(&best.index) {
                return Err(Error::Assertion(format!(
                    "join of {:#06x} and {:#06x} is not unique",
                    a.0, b.0
                )));
            }
        }
        Ok(best.index)
    }

    /// `a & b`: the greatest common descendant, or `None` for bottom.
    pub fn meet(&self, a: LayoutIndex, b: LayoutIndex) -> Result<Option<LayoutIndex>> {
        self.check_operable(a, b)?;
        if !self.sealed {
            return Ok(Some(BESPOKE_TOP_INDEX));
        }
        let common: Vec<&Layout> = self
            .fetch(a)?
            .descendants
            .intersection(&self.fetch(b)?.descendants)
            .map(|&index| &self.layouts[&index])
            .collect();
        let Some(best) = common.iter().min_by_key(|layout| layout.topo_index) else {
            return Ok(None);
        };
        for other in &common {
            if !best.descendants.contains(&other.index) {
                return Err(Error::Assertion(format!(
                    "meet of {:#06x} and {:#06x} is not unique",
                    a.0, b.0
                )));
            }
        }
        Ok(Some(best.index))
    }

    /// Visits every layout in topological (creation) order.
    pub fn each_layout(&self, mut f: impl FnMut(&Layout)) {
        for index in &self.order {
            f(&self.layouts[index]);
        }
    }

    /// Routes a bespoke array header to its family vtable.
    pub fn vtable_for_array(&self, ad: &BespokeArray) -> Result<&'static LayoutVTable> {
        #[cfg(debug_assertions)]
        if let Some(index) = ad.layout_index() {
            debug_assert!(
                self.layouts.get(&index).map_or(false, Layout::is_concrete),
                "dispatch on an unregistered or abstract layout index"
            );
        }
        self.dispatch.for_array(ad)
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    /// Debug listing of the whole hierarchy, in topological order.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.each_layout(|layout| {
            let kind = if layout.is_concrete() {
                "concrete"
            } else {
                "abstract"
            };
            let parents: Vec<String> = layout
                .parents
                .iter()
                .map(|p| format!("{:#06x}", p.0))
                .collect();
            out.push_str(&format!(
                "{:#06x} {kind} {} <- [{}]\n",
                layout.index.0,
                layout.describe(),
                parents.join(", ")
            ));
        });
        out
    }
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-global hierarchy, shared by every thread after startup
/// seals it.
pub fn global() -> &'static RwLock<Hierarchy> {
    static GLOBAL: OnceLock<RwLock<Hierarchy>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(Hierarchy::new()))
}

/// Finds the minimal-popcount `(mask, eq)` separating `descendants` from
/// the rest of the registered universe. The mask may only use bits that
/// are constant across all descendant indices.
fn compute_layout_test(universe: &[u16], descendants: &BTreeSet<LayoutIndex>) -> Option<LayoutTest> {
    let inside: Vec<u16> = descendants.iter().map(|index| index.0).collect();
    let outside: Vec<u16> = universe
        .iter()
        .copied()
        .filter(|raw| !descendants.contains(&LayoutIndex(*raw)))
        .collect();

    let first = inside[0];
    let mut constant = 0x7fffu16;
    for &index in &inside {
        constant &= !(index ^ first);
    }

    let mut candidates: Vec<u16> = (0u16..=0x7fff).filter(|m| m & !constant == 0).collect();
    candidates.sort_by_key(|m| (m.count_ones(), *m));
    candidates.into_iter().find_map(|mask| {
        let eq = first & mask;
        outside
            .iter()
            .all(|&index| index & mask != eq)
            .then_some(LayoutTest { mask, eq })
    })
}
