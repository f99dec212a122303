//! Root registration.
//!
//! Three kinds of root keep nodes alive across collections:
//!
//! - [`GcStackRoot`]: scoped roots with strict LIFO lifetimes, backed by an
//!   arena of stamped entries.
//! - The protect stack: an index-addressed stack for code whose rooting does
//!   not follow lexical scopes, manipulated with [`Heap::protect`] and
//!   friends.
//! - Global roots: [`Heap::preserve`] / [`Heap::release`].
//!
//! Every root entry counts as a holder of its node, so dropping the last
//! root of an otherwise unreferenced node reclaims it on the spot.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use crate::context::ContextId;
use crate::error::{fatal_error, RootingError};
use crate::heap::Heap;
use crate::ptr::{Gc, NodeId, NodeRef};
use crate::trace::{Trace, Visitor};

/// Arena behind [`GcStackRoot`].
#[derive(Debug, Default)]
pub(crate) struct StackRootArena {
    entries: Vec<(Option<NodeId>, u64)>,
    next_stamp: u64,
}

impl StackRootArena {
    fn push(&mut self, target: Option<NodeId>) -> (usize, u64) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.entries.push((target, stamp));
        (self.entries.len() - 1, stamp)
    }

    fn pop(&mut self, stamp: u64) -> Option<NodeId> {
        match self.entries.last() {
            Some(&(target, top)) if top == stamp => {
                self.entries.pop();
                target
            }
            _ => fatal_error("GCStackRoots must be destroyed in reverse order of creation"),
        }
    }

    fn entry_mut(&mut self, slot: usize, stamp: u64) -> &mut Option<NodeId> {
        match self.entries.get_mut(slot) {
            Some((target, s)) if *s == stamp => target,
            _ => fatal_error("GcStackRoot used after its arena entry was discarded"),
        }
    }

    fn get(&self, slot: usize, stamp: u64) -> Option<NodeId> {
        match self.entries.get(slot) {
            Some(&(target, s)) if s == stamp => target,
            _ => fatal_error("GcStackRoot used after its arena entry was discarded"),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The protect stack.
#[derive(Debug, Default)]
pub(crate) struct ProtectStack {
    entries: Vec<(Option<NodeId>, ContextId)>,
}

impl ProtectStack {
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Counted multiset of global roots.
#[derive(Debug, Default)]
pub(crate) struct GlobalRoots {
    counts: BTreeMap<NodeId, usize>,
}

/// All explicit roots of a heap.
#[derive(Debug, Default)]
pub(crate) struct RootSet {
    pub stack: StackRootArena,
    pub protect: ProtectStack,
    pub global: GlobalRoots,
}

impl RootSet {
    /// Report every rooted node: scoped roots, then the protect stack, then
    /// global roots.
    pub fn visit_roots(&self, visitor: &mut dyn Visitor) {
        let scoped = self.stack.entries.iter().filter_map(|&(target, _)| target);
        let protected = self.protect.entries.iter().filter_map(|&(target, _)| target);
        for id in scoped.chain(protected).chain(self.global.counts.keys().copied()) {
            visitor.visit(id);
        }
    }
}

/// A scoped root.
///
/// Keeps its target (if any) alive until it is dropped. Roots must be
/// dropped in the reverse order of their creation, which ordinary lexical
/// scoping guarantees; dropping one out of order is a fatal error.
///
/// ```
/// use cellgc::{GcStackRoot, Heap};
///
/// let heap = Heap::new();
/// let node = heap.alloc(7_u32).unwrap();
/// let root = GcStackRoot::new(&heap, Some(node));
/// heap.collect_full();
/// assert_eq!(*root.borrow().unwrap(), 7);
/// ```
pub struct GcStackRoot<'h, T: Trace + 'static> {
    heap: &'h Heap,
    slot: usize,
    stamp: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<'h, T: Trace + 'static> GcStackRoot<'h, T> {
    /// Root `target` until the returned guard is dropped.
    pub fn new(heap: &'h Heap, target: Option<Gc<T>>) -> Self {
        let target = target.map(Gc::id);
        if let Some(id) = target {
            heap.hold(id);
        }
        let (slot, stamp) = heap.state.borrow_mut().roots.stack.push(target);
        Self {
            heap,
            slot,
            stamp,
            _marker: PhantomData,
        }
    }

    /// The rooted node.
    #[must_use]
    pub fn get(&self) -> Option<Gc<T>> {
        let state = self.heap.state.borrow();
        state.roots.stack.get(self.slot, self.stamp).map(Gc::from_id)
    }

    /// Redirect the root to another node (or none).
    pub fn set(&self, target: Option<Gc<T>>) {
        let target = target.map(Gc::id);
        if let Some(id) = target {
            self.heap.hold(id);
        }
        let old = {
            let mut state = self.heap.state.borrow_mut();
            std::mem::replace(state.roots.stack.entry_mut(self.slot, self.stamp), target)
        };
        if let Some(id) = old {
            self.heap.unhold(id);
        }
    }

    /// Borrow the rooted node's contents.
    #[must_use]
    pub fn borrow(&self) -> Option<NodeRef<'h, T>> {
        self.heap.get(self.get()?)
    }
}

impl<T: Trace + 'static> Drop for GcStackRoot<'_, T> {
    fn drop(&mut self) {
        let target = self.heap.state.borrow_mut().roots.stack.pop(self.stamp);
        if let Some(id) = target {
            self.heap.unhold(id);
        }
    }
}

impl<T: Trace + 'static> std::fmt::Debug for GcStackRoot<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcStackRoot")
            .field("slot", &self.slot)
            .field("target", &self.get())
            .finish()
    }
}

impl Heap {
    /// Push `node` (which may be `None`) onto the protect stack.
    ///
    /// Returns the index of the new entry, for use with
    /// [`reprotect`](Self::reprotect).
    pub fn protect(&self, node: Option<NodeId>) -> usize {
        if let Some(id) = node {
            self.hold(id);
        }
        let mut state = self.state.borrow_mut();
        let context = state.contexts.current();
        state.roots.protect.entries.push((node, context));
        state.roots.protect.entries.len() - 1
    }

    /// Protect a typed node, returning it together with its index.
    pub fn protect_with_index<T: ?Sized>(&self, node: Gc<T>) -> (Gc<T>, usize) {
        (node, self.protect(Some(node.id())))
    }

    /// Replace the entry at `index` with `node`.
    ///
    /// # Errors
    ///
    /// [`RootingError::IndexOutOfRange`] if there is no such entry, and in
    /// debug builds [`RootingError::ContextMismatch`] if the entry was
    /// protected in another context.
    pub fn reprotect(&self, node: Option<NodeId>, index: usize) -> Result<(), RootingError> {
        let old = {
            let mut state = self.state.borrow_mut();
            let current = state.contexts.current();
            let size = state.roots.protect.len();
            let entry = state
                .roots
                .protect
                .entries
                .get_mut(index)
                .ok_or(RootingError::IndexOutOfRange { index, size })?;
            #[cfg(debug_assertions)]
            if entry.1 != current {
                return Err(RootingError::ContextMismatch {
                    index,
                    expected: entry.1,
                    found: current,
                });
            }
            let old = entry.0;
            *entry = (node, current);
            old
        };
        if let Some(id) = node {
            self.hold(id);
        }
        if let Some(id) = old {
            self.unhold(id);
        }
        Ok(())
    }

    /// Pop `count` entries off the protect stack.
    ///
    /// # Errors
    ///
    /// [`RootingError::CountExceedsSize`] if the stack is shorter than
    /// `count`; [`RootingError::BelowContextFloor`] if popping would remove
    /// entries made outside the current context. In debug builds,
    /// [`RootingError::ContextMismatch`] if an entry being popped was
    /// protected in another context, such as an inner one that returned
    /// without unprotecting. Nothing is popped on error.
    pub fn unprotect(&self, count: usize) -> Result<(), RootingError> {
        let remaining = {
            let state = self.state.borrow();
            let entries = &state.roots.protect.entries;
            let size = entries.len();
            let remaining = size
                .checked_sub(count)
                .ok_or(RootingError::CountExceedsSize { count, size })?;
            let floor = state.contexts.pps_floor();
            if remaining < floor {
                return Err(RootingError::BelowContextFloor {
                    floor,
                    requested: remaining,
                });
            }
            #[cfg(debug_assertions)]
            {
                let current = state.contexts.current();
                let stranger = entries[remaining..]
                    .iter()
                    .rposition(|&(_, context)| context != current);
                if let Some(offset) = stranger {
                    let index = remaining + offset;
                    return Err(RootingError::ContextMismatch {
                        index,
                        expected: entries[index].1,
                        found: current,
                    });
                }
            }
            remaining
        };
        self.pps_restore_size(remaining)
    }

    /// Remove the most recent protect-stack entry for `node`, wherever it
    /// sits in the stack.
    ///
    /// # Errors
    ///
    /// [`RootingError::NotProtected`] if no entry refers to `node`, and in
    /// debug builds [`RootingError::ContextMismatch`] if the entry found
    /// belongs to another context.
    pub fn unprotect_ptr(&self, node: NodeId) -> Result<(), RootingError> {
        {
            let mut state = self.state.borrow_mut();
            let current = state.contexts.current();
            let floor = state.contexts.pps_floor();
            let entries = &mut state.roots.protect.entries;
            let index = entries
                .iter()
                .rposition(|&(target, _)| target == Some(node))
                .ok_or(RootingError::NotProtected)?;
            if index < floor {
                return Err(RootingError::BelowContextFloor {
                    floor,
                    requested: index,
                });
            }
            #[cfg(debug_assertions)]
            if entries[index].1 != current {
                return Err(RootingError::ContextMismatch {
                    index,
                    expected: entries[index].1,
                    found: current,
                });
            }
            let _ = current;
            entries.remove(index);
        }
        self.unhold(node);
        Ok(())
    }

    /// Current number of protect-stack entries.
    #[must_use]
    pub fn pps_size(&self) -> usize {
        self.state.borrow().roots.protect.len()
    }

    /// Truncate the protect stack to `size` entries, releasing every entry
    /// above it.
    ///
    /// # Errors
    ///
    /// [`RootingError::RestoreAboveSize`] if `size` exceeds the current
    /// size; [`RootingError::BelowContextFloor`] if it is below the floor of
    /// the current context.
    pub fn pps_restore_size(&self, size: usize) -> Result<(), RootingError> {
        let released: Vec<_> = {
            let mut state = self.state.borrow_mut();
            let current = state.roots.protect.len();
            if size > current {
                return Err(RootingError::RestoreAboveSize {
                    requested: size,
                    size: current,
                });
            }
            let floor = state.contexts.pps_floor();
            if size < floor {
                return Err(RootingError::BelowContextFloor {
                    floor,
                    requested: size,
                });
            }
            state.roots.protect.entries.drain(size..).collect()
        };
        for id in released.into_iter().rev().filter_map(|(target, _)| target) {
            self.unhold(id);
        }
        Ok(())
    }

    /// Make `node` a global root. Calls nest: a node preserved twice needs
    /// two [`release`](Self::release)s.
    pub fn preserve(&self, node: NodeId) {
        if !self.contains(node) {
            return;
        }
        self.hold(node);
        *self
            .state
            .borrow_mut()
            .roots
            .global
            .counts
            .entry(node)
            .or_insert(0) += 1;
    }

    /// Undo one [`preserve`](Self::preserve). Returns `false` if `node` was
    /// not preserved.
    pub fn release(&self, node: NodeId) -> bool {
        {
            let mut state = self.state.borrow_mut();
            let counts = &mut state.roots.global.counts;
            match counts.get_mut(&node) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    counts.remove(&node);
                }
                None => return false,
            }
        }
        self.unhold(node);
        true
    }

    /// Number of live [`GcStackRoot`]s.
    #[must_use]
    pub fn stack_root_depth(&self) -> usize {
        self.state.borrow().roots.stack.len()
    }
}
