//! Counted references between nodes.
//!
//! A node refers to other nodes only through the types in this module. Each
//! reports its targets from [`Trace::trace`], and each target's edge count
//! goes up when the owning node is placed and whenever an edge is redirected
//! with a heap-aware setter.
//!
//! Edges built before their owner is placed (with `new`, `from_targets` or
//! `Clone`) are not yet counted; [`Heap::alloc`] counts them. The setters
//! that take a `&Heap` are for edges inside placed nodes only.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;

use crate::error::AllocError;
use crate::heap::Heap;
use crate::ptr::{Gc, NodeId};
use crate::trace::{Trace, Visitor};

/// A reference from one node to another.
pub struct GcEdge<T: ?Sized> {
    target: Cell<Option<NodeId>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ?Sized> GcEdge<T> {
    /// An edge to `target`, counted once its owner is placed.
    #[must_use]
    pub fn new(target: Option<Gc<T>>) -> Self {
        Self {
            target: Cell::new(target.map(Gc::id)),
            _marker: PhantomData,
        }
    }

    /// An edge to nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            target: Cell::new(None),
            _marker: PhantomData,
        }
    }

    /// The current target.
    #[must_use]
    pub fn get(&self) -> Option<Gc<T>> {
        self.target.get().map(Gc::from_id)
    }

    /// Redirect a placed edge. The old target may be reclaimed at once if
    /// this was its last reference.
    pub fn set(&self, heap: &Heap, target: Option<Gc<T>>) {
        let new = target.map(Gc::id);
        let old = self.target.replace(new);
        if old == new {
            return;
        }
        if let Some(id) = new {
            heap.add_edge(id);
        }
        if let Some(id) = old {
            heap.remove_edge(id);
        }
    }

    /// Clear the edge without touching any counts.
    pub fn detach(&self) {
        self.target.set(None);
    }
}

impl<T: ?Sized> Default for GcEdge<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized> Clone for GcEdge<T> {
    fn clone(&self) -> Self {
        Self {
            target: Cell::new(self.target.get()),
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for GcEdge<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GcEdge").field(&self.target.get()).finish()
    }
}

// SAFETY: reports its single target
unsafe impl<T: ?Sized> Trace for GcEdge<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(id) = self.target.get() {
            visitor.visit(id);
        }
    }

    fn detach(&self) {
        GcEdge::detach(self);
    }
}

/// An edge with copy-on-duplicate semantics.
///
/// [`duplicate`](Self::duplicate) clones the target node rather than sharing
/// it, for node types that need value semantics for their children.
pub struct RHandle<T: Trace + Clone + 'static> {
    edge: GcEdge<T>,
}

impl<T: Trace + Clone + 'static> RHandle<T> {
    /// A handle to `target`, counted once its owner is placed.
    #[must_use]
    pub fn new(target: Option<Gc<T>>) -> Self {
        Self {
            edge: GcEdge::new(target),
        }
    }

    /// A handle to nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            edge: GcEdge::empty(),
        }
    }

    /// The current target.
    #[must_use]
    pub fn get(&self) -> Option<Gc<T>> {
        self.edge.get()
    }

    /// Redirect a placed handle.
    pub fn set(&self, heap: &Heap, target: Option<Gc<T>>) {
        self.edge.set(heap, target);
    }

    /// A new, unplaced handle to a fresh copy of the target node.
    ///
    /// An empty handle, or one whose target is gone, duplicates to an empty
    /// handle.
    ///
    /// # Errors
    ///
    /// [`AllocError`] if the copy cannot be placed.
    pub fn duplicate(&self, heap: &Heap) -> Result<Self, AllocError> {
        let Some(original) = self.get().and_then(|gc| heap.get(gc)) else {
            return Ok(Self::empty());
        };
        let copy = heap.alloc(T::clone(&original))?;
        Ok(Self::new(Some(copy)))
    }
}

impl<T: Trace + Clone + 'static> std::fmt::Debug for RHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RHandle").field(&self.edge.target.get()).finish()
    }
}

// SAFETY: reports its single target
unsafe impl<T: Trace + Clone + 'static> Trace for RHandle<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.edge.trace(visitor);
    }

    fn detach(&self) {
        self.edge.detach();
    }
}

/// A growable list of edges, for nodes with a variable number of children.
///
/// The list takes its interior borrow only for the duration of each call,
/// so it never blocks tracing.
pub struct EdgeList<T: ?Sized> {
    targets: RefCell<Vec<NodeId>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ?Sized> EdgeList<T> {
    /// An empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            targets: RefCell::new(Vec::new()),
            _marker: PhantomData,
        }
    }

    /// A list of edges counted once its owner is placed.
    pub fn from_targets(targets: impl IntoIterator<Item = Gc<T>>) -> Self {
        Self {
            targets: RefCell::new(targets.into_iter().map(Gc::id).collect()),
            _marker: PhantomData,
        }
    }

    /// Append an edge to a placed list.
    pub fn push(&self, heap: &Heap, target: Gc<T>) {
        self.targets.borrow_mut().push(target.id());
        heap.add_edge(target.id());
    }

    /// Remove the last edge of a placed list.
    ///
    /// The returned target may already have been reclaimed if this was its
    /// last reference; root it beforehand to keep it.
    pub fn pop(&self, heap: &Heap) -> Option<Gc<T>> {
        let id = self.targets.borrow_mut().pop()?;
        heap.remove_edge(id);
        Some(Gc::from_id(id))
    }

    /// Redirect edge `index` of a placed list. Returns `false`, changing
    /// nothing, if `index` is out of range.
    pub fn set(&self, heap: &Heap, index: usize, target: Gc<T>) -> bool {
        let old = {
            let mut targets = self.targets.borrow_mut();
            let Some(slot) = targets.get_mut(index) else {
                return false;
            };
            std::mem::replace(slot, target.id())
        };
        if old != target.id() {
            heap.add_edge(target.id());
            heap.remove_edge(old);
        }
        true
    }

    /// Target of edge `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Gc<T>> {
        self.targets.borrow().get(index).copied().map(Gc::from_id)
    }

    /// Number of edges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.borrow().len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.borrow().is_empty()
    }

    /// Snapshot of all targets, in order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Gc<T>> {
        self.targets.borrow().iter().copied().map(Gc::from_id).collect()
    }
}

impl<T: ?Sized> Default for EdgeList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Clone for EdgeList<T> {
    fn clone(&self) -> Self {
        Self {
            targets: RefCell::new(self.targets.borrow().clone()),
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for EdgeList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.targets.borrow().iter()).finish()
    }
}

// SAFETY: reports every target
unsafe impl<T: ?Sized> Trace for EdgeList<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.targets.borrow().iter().for_each(|&id| visitor.visit(id));
    }

    fn detach(&self) {
        self.targets.borrow_mut().clear();
    }
}
