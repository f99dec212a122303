//! Node identities and typed handles.
//!
//! A node is named by a [`NodeId`]: a slot in the heap's node table plus
//! the reuse stamp of that slot. Ids are plain values; holding one does not
//! keep a node alive, and an id whose node has been reclaimed simply stops
//! resolving. [`Gc<T>`] adds the static type, and [`NodeRef`] is the
//! borrow guard through which node contents are read.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::heap::Heap;
use crate::trace::Trace;

/// Identity of a node in a [`Heap`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    stamp: u32,
}

impl NodeId {
    pub(crate) const fn from_raw_parts(index: u32, stamp: u32) -> Self {
        Self { index, stamp }
    }

    pub(crate) const fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) const fn slot(self) -> u32 {
        self.index
    }

    pub(crate) const fn stamp(self) -> u32 {
        self.stamp
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}#{})", self.index, self.stamp)
    }
}

/// A typed handle to a node holding a `T`.
///
/// `Gc<T>` is `Copy` and carries no ownership: it must be reachable from a
/// root (or a rooted node) across anything that can collect, or it may go
/// stale. Access goes through [`Heap::get`].
pub struct Gc<T: ?Sized> {
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ?Sized> Gc<T> {
    pub(crate) const fn from_id(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The untyped identity of this node.
    #[must_use]
    pub const fn id(self) -> NodeId {
        self.id
    }
}

impl<T: ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for Gc<T> {}

impl<T: ?Sized> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: ?Sized> Eq for Gc<T> {}

impl<T: ?Sized> std::hash::Hash for Gc<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T: ?Sized> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gc").field(&self.id).finish()
    }
}

impl<T: ?Sized> From<Gc<T>> for NodeId {
    fn from(gc: Gc<T>) -> Self {
        gc.id
    }
}

/// A borrow of a node's contents.
///
/// While a `NodeRef` exists its node counts as held: it survives any
/// collection and is not reclaimed when its other references go away.
/// Dropping the last holder of an otherwise unreferenced node reclaims it.
pub struct NodeRef<'h, T: Trace + 'static> {
    heap: &'h Heap,
    id: NodeId,
    value: NonNull<T>,
}

impl<'h, T: Trace + 'static> NodeRef<'h, T> {
    /// # Safety
    ///
    /// `value` must point at the live contents of node `id`, and the caller
    /// must already have counted this guard as a holder of the node.
    pub(crate) unsafe fn new(heap: &'h Heap, id: NodeId, value: NonNull<T>) -> Self {
        Self { heap, id, value }
    }

    /// Typed handle to the borrowed node.
    #[must_use]
    pub fn gc(this: &Self) -> Gc<T> {
        Gc::from_id(this.id)
    }

    /// Identity of the borrowed node.
    #[must_use]
    pub fn id(this: &Self) -> NodeId {
        this.id
    }
}

impl<T: Trace + 'static> Deref for NodeRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the node is held for as long as this guard lives, so its
        // contents are neither dropped nor moved.
        unsafe { self.value.as_ref() }
    }
}

impl<T: Trace + 'static> Clone for NodeRef<'_, T> {
    fn clone(&self) -> Self {
        self.heap.hold(self.id);
        Self {
            heap: self.heap,
            id: self.id,
            value: self.value,
        }
    }
}

impl<T: Trace + 'static> Drop for NodeRef<'_, T> {
    fn drop(&mut self) {
        self.heap.unhold(self.id);
    }
}

impl<T: Trace + fmt::Debug + 'static> fmt::Debug for NodeRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
