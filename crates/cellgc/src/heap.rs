//! The heap runtime.
//!
//! A [`Heap`] owns every piece of collector state: the node table, the cell
//! pools that back small nodes, the root set, the evaluation contexts, the
//! weak reference registry and the collection policy. Nothing is global, so
//! independent heaps (for example one per test) never interact.
//!
//! # Reclamation
//!
//! Each node carries two counts. *Holders* are roots of every kind plus
//! borrow guards; *edges* are counted references from other nodes. A node
//! whose counts both fall to zero (and which no weak reference is keyed on)
//! is reclaimed immediately. Cycles never reach zero and are left to the
//! mark-sweep collector in [`crate::gc`].

use std::alloc::{alloc, dealloc, Layout};
use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::cell_pool::CellPool;
use crate::config::HeapConfig;
use crate::context::ContextStack;
use crate::error::{fatal_error, AllocError};
use crate::gc::manager::GcManager;
use crate::metrics::GcMetrics;
use crate::node::{NodeEntry, NodeTable, Storage};
use crate::ptr::{Gc, NodeId, NodeRef};
use crate::roots::RootSet;
use crate::trace::{referents_of, Trace};
use crate::weak::{FinalizerHost, WeakRef, WeakRegistry};

// ============================================================================
// Size classes
// ============================================================================

/// Cell sizes of the node pools, in units of `size_of::<f64>()`.
pub const SIZE_CLASSES: [usize; 10] = [1, 2, 3, 4, 5, 6, 8, 10, 12, 16];

/// Largest node, in bytes, placed in a pool. Larger nodes, and nodes
/// aligned beyond 8 bytes, get a dedicated allocation.
pub const MAX_POOLED_BYTES: usize = 16 * std::mem::size_of::<f64>();

const POOL_ALIGN: usize = std::mem::align_of::<f64>();

/// Size class for `layout`, or `None` if it needs a dedicated allocation.
#[must_use]
pub const fn size_class(layout: Layout) -> Option<usize> {
    if layout.align() > POOL_ALIGN || layout.size() > MAX_POOLED_BYTES {
        return None;
    }
    let mut dbls = layout.size().div_ceil(std::mem::size_of::<f64>());
    if dbls == 0 {
        dbls = 1;
    }
    let mut class = 0;
    while class < SIZE_CLASSES.len() {
        if SIZE_CLASSES[class] >= dbls {
            return Some(class);
        }
        class += 1;
    }
    None
}

/// Bytes charged to the heap tallies for a node of `layout`: the whole cell
/// for pooled nodes, the exact size otherwise.
#[must_use]
pub const fn charged_bytes(layout: Layout) -> usize {
    match size_class(layout) {
        Some(class) => SIZE_CLASSES[class] * std::mem::size_of::<f64>(),
        None => layout.size(),
    }
}

/// One [`CellPool`] per size class.
pub(crate) struct PoolSet {
    pools: Vec<CellPool>,
}

impl PoolSet {
    fn new(superblock_bytes: usize) -> Self {
        let pools = SIZE_CLASSES
            .iter()
            .map(|&dbls| {
                let cell_size = dbls * std::mem::size_of::<f64>();
                CellPool::new(dbls, (superblock_bytes / cell_size).max(1))
            })
            .collect();
        Self { pools }
    }

    fn allocate(&mut self, class: usize) -> Result<NonNull<u8>, AllocError> {
        self.pools[class].allocate()
    }

    fn cell_size(&self, class: usize) -> usize {
        self.pools[class].cell_size()
    }

    /// # Safety
    ///
    /// `p` must be a live cell of pool `class`.
    unsafe fn deallocate(&mut self, class: usize, p: *mut u8) {
        // SAFETY: forwarded from the caller.
        unsafe { self.pools[class].deallocate(p) };
    }

    pub fn pools(&self) -> &[CellPool] {
        &self.pools
    }
}

// ============================================================================
// Heap
// ============================================================================

pub(crate) struct HeapState {
    pub nodes: NodeTable,
    pub pools: PoolSet,
    pub roots: RootSet,
    pub contexts: ContextStack,
    pub weak: WeakRegistry,
    pub manager: GcManager,
    /// Nodes whose counts reached zero while a collection was running.
    pub moribund: Vec<NodeId>,
    pub last_metrics: GcMetrics,
}

/// A garbage-collected heap.
///
/// `Heap` is neither `Send` nor `Sync`; all access is from one thread, and
/// methods take `&self` so that roots and borrow guards can coexist with
/// allocation.
///
/// ```
/// use cellgc::{GcEdge, GcStackRoot, Heap, Trace};
///
/// #[derive(Trace)]
/// struct Cons {
///     head: i64,
///     tail: GcEdge<Cons>,
/// }
///
/// let heap = Heap::new();
/// let first = heap.alloc(Cons { head: 1, tail: GcEdge::empty() }).unwrap();
/// let root = GcStackRoot::new(&heap, Some(first));
/// let second = heap.alloc(Cons { head: 2, tail: GcEdge::new(Some(first)) }).unwrap();
/// root.set(Some(second));
///
/// heap.collect_full();
/// let list = root.borrow().unwrap();
/// assert_eq!(list.head, 2);
/// assert_eq!(heap.get(list.tail.get().unwrap()).unwrap().head, 1);
/// ```
pub struct Heap {
    pub(crate) state: RefCell<HeapState>,
    pub(crate) collecting: Cell<bool>,
    pub(crate) finalizer_host: RefCell<Option<FinalizerHost>>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Create a heap with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    /// Create a heap with the given configuration.
    #[must_use]
    pub fn with_config(config: HeapConfig) -> Self {
        Self {
            state: RefCell::new(HeapState {
                nodes: NodeTable::default(),
                pools: PoolSet::new(config.superblock_bytes),
                roots: RootSet::default(),
                contexts: ContextStack::default(),
                weak: WeakRegistry::default(),
                manager: GcManager::new(&config),
                moribund: Vec::new(),
                last_metrics: GcMetrics::new(),
            }),
            collecting: Cell::new(false),
            finalizer_host: RefCell::new(None),
        }
    }

    /// Place `value` in the heap.
    ///
    /// This is the allocation point at which a collection may be cued. The
    /// nodes `value` refers to are kept alive across that collection and
    /// then counted as edges of the new node; the new node itself is not
    /// rooted, so root it before the next allocation if it must survive.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] if the system allocator fails. `value` is
    /// dropped in that case.
    pub fn alloc<T: Trace + 'static>(&self, value: T) -> Result<Gc<T>, AllocError> {
        if self.collecting.get() {
            fatal_error("allocation attempted during garbage collection");
        }
        let referents = referents_of(&value);
        for &id in &referents {
            self.hold(id);
        }

        let layout = Layout::new::<T>();
        let charge = charged_bytes(layout);
        let cued = self.state.borrow().manager.cue(charge);
        if cued {
            self.gc(charge, false);
        }

        let placed = self.place(value, layout);
        if placed.is_ok() {
            let mut state = self.state.borrow_mut();
            for &id in &referents {
                if let Some(entry) = state.nodes.get_mut(id) {
                    entry.edges += 1;
                }
            }
        }
        for id in referents {
            self.unhold(id);
        }
        placed
    }

    fn place<T: Trace + 'static>(&self, value: T, layout: Layout) -> Result<Gc<T>, AllocError> {
        let mut state = self.state.borrow_mut();
        let (raw, storage, bytes) = if let Some(class) = size_class(layout) {
            let cell = state.pools.allocate(class)?;
            (cell, Storage::Pool(class), state.pools.cell_size(class))
        } else {
            // SAFETY: only layouts wider than a pool cell get here, and
            // zero-sized layouts always have a size class.
            let raw = unsafe { alloc(layout) };
            let raw = NonNull::new(raw).ok_or(AllocError::OutOfMemory {
                bytes: layout.size(),
            })?;
            (raw, Storage::Large(layout), layout.size())
        };

        let typed = raw.cast::<T>();
        // SAFETY: `raw` is fresh memory sized and aligned for `T`.
        unsafe { typed.as_ptr().write(value) };
        let value: NonNull<dyn Trace> = typed;

        let id = state.nodes.insert(NodeEntry {
            value,
            type_id: TypeId::of::<T>(),
            storage,
            bytes,
            holders: 0,
            edges: 0,
            generation: 0,
            marked: false,
            weak_keys: 0,
            weak_active: false,
        });
        state.manager.record_alloc(bytes);
        Ok(Gc::from_id(id))
    }

    /// Borrow a node's contents. `None` if the node has been reclaimed.
    #[must_use]
    pub fn get<T: Trace + 'static>(&self, gc: Gc<T>) -> Option<NodeRef<'_, T>> {
        let value = {
            let mut state = self.state.borrow_mut();
            let entry = state.nodes.get_mut(gc.id())?;
            if entry.type_id != TypeId::of::<T>() {
                return None;
            }
            entry.holders += 1;
            entry.value.cast::<T>()
        };
        // SAFETY: the type matched and the guard was counted as a holder.
        Some(unsafe { NodeRef::new(self, gc.id(), value) })
    }

    /// Recover a typed handle from an id, if the node holds a `T`.
    #[must_use]
    pub fn downcast<T: Trace + 'static>(&self, id: NodeId) -> Option<Gc<T>> {
        let state = self.state.borrow();
        let entry = state.nodes.get(id)?;
        (entry.type_id == TypeId::of::<T>()).then(|| Gc::from_id(id))
    }

    /// Whether `id` names a live node.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.state.borrow().nodes.contains(id)
    }

    /// Number of holders (roots and borrow guards) of a node.
    #[must_use]
    pub fn ref_count(&self, id: NodeId) -> Option<usize> {
        self.state
            .borrow()
            .nodes
            .get(id)
            .map(|entry| entry.holders as usize)
    }

    /// Number of counted edges into a node.
    #[must_use]
    pub fn edge_count(&self, id: NodeId) -> Option<usize> {
        self.state
            .borrow()
            .nodes
            .get(id)
            .map(|entry| entry.edges as usize)
    }

    /// Generation of a node: 0 when new, rising as it survives collections.
    #[must_use]
    pub fn generation(&self, id: NodeId) -> Option<u8> {
        self.state.borrow().nodes.get(id).map(|entry| entry.generation)
    }

    /// Check the integrity of every node pool and of the weak reference
    /// registry. Inconsistencies are fatal.
    pub fn check(&self) -> bool {
        {
            let state = self.state.borrow();
            for pool in state.pools.pools() {
                pool.check();
            }
        }
        self.check_weak_refs()
    }

    // ------------------------------------------------------------------------
    // Counting
    // ------------------------------------------------------------------------

    pub(crate) fn hold(&self, id: NodeId) {
        if let Some(entry) = self.state.borrow_mut().nodes.get_mut(id) {
            entry.holders += 1;
        }
    }

    pub(crate) fn unhold(&self, id: NodeId) {
        let moribund = {
            let mut state = self.state.borrow_mut();
            let Some(entry) = state.nodes.get_mut(id) else {
                return;
            };
            entry.holders = entry
                .holders
                .checked_sub(1)
                .unwrap_or_else(|| fatal_error(format_args!("holder count underflow on {id:?}")));
            entry.is_moribund()
        };
        if moribund {
            self.reclaim(id);
        }
    }

    pub(crate) fn add_edge(&self, id: NodeId) {
        if let Some(entry) = self.state.borrow_mut().nodes.get_mut(id) {
            entry.edges += 1;
        }
    }

    pub(crate) fn remove_edge(&self, id: NodeId) {
        let moribund = {
            let mut state = self.state.borrow_mut();
            let Some(entry) = state.nodes.get_mut(id) else {
                return;
            };
            entry.edges = entry.edges.saturating_sub(1);
            entry.is_moribund()
        };
        if moribund {
            self.reclaim(id);
        }
    }

    /// Reclaim `start` if it is moribund, and then anything its destruction
    /// leaves moribund. During a collection the work is deferred.
    pub(crate) fn reclaim(&self, start: NodeId) {
        if self.collecting.get() {
            self.state.borrow_mut().moribund.push(start);
            return;
        }
        let mut worklist = vec![start];
        while let Some(id) = worklist.pop() {
            let entry = {
                let mut state = self.state.borrow_mut();
                match state.nodes.get(id) {
                    Some(entry) if entry.is_moribund() => {}
                    _ => continue,
                }
                match state.nodes.remove(id) {
                    Some(entry) => entry,
                    None => continue,
                }
            };
            // SAFETY: the entry was just removed from the table, so the value
            // is still intact and now exclusively ours.
            let value = unsafe { entry.value.as_ref() };
            let children = referents_of(value);
            value.detach();
            {
                let mut state = self.state.borrow_mut();
                for child in children {
                    if let Some(child_entry) = state.nodes.get_mut(child) {
                        child_entry.edges = child_entry.edges.saturating_sub(1);
                        if child_entry.is_moribund() {
                            worklist.push(child);
                        }
                    }
                }
            }
            self.destroy(id, entry);
        }
    }

    /// Process reclamations deferred during a collection.
    pub(crate) fn drain_moribund(&self) {
        let deferred = std::mem::take(&mut self.state.borrow_mut().moribund);
        for id in deferred {
            self.reclaim(id);
        }
    }

    /// Drop a node that has already left the table and release its storage.
    pub(crate) fn destroy(&self, id: NodeId, entry: NodeEntry) {
        if entry.type_id == TypeId::of::<WeakRef>() {
            self.state.borrow_mut().weak.forget(id);
        }
        // SAFETY: the node is out of the table; nothing else can reach the
        // value, which is dropped exactly once here.
        unsafe { std::ptr::drop_in_place(entry.value.as_ptr()) };
        let mut state = self.state.borrow_mut();
        // SAFETY: the storage was obtained as recorded in `entry.storage`.
        unsafe { free_storage(&mut state.pools, &entry) };
        state.manager.record_free(entry.bytes);
    }
}

/// # Safety
///
/// `entry.value` must have been placed as `entry.storage` records, and must
/// already have been dropped.
unsafe fn free_storage(pools: &mut PoolSet, entry: &NodeEntry) {
    let raw = entry.value.cast::<u8>().as_ptr();
    match entry.storage {
        // SAFETY: forwarded from the caller.
        Storage::Pool(class) => unsafe { pools.deallocate(class, raw) },
        // SAFETY: forwarded from the caller.
        Storage::Large(layout) => unsafe { dealloc(raw, layout) },
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let entries: Vec<NodeEntry> = state
            .nodes
            .ids()
            .into_iter()
            .filter_map(|id| state.nodes.remove(id))
            .collect();
        // Sever every edge before any destructor runs.
        for entry in &entries {
            // SAFETY: all values are still intact.
            unsafe { entry.value.as_ref() }.detach();
        }
        for entry in &entries {
            // SAFETY: each value is dropped exactly once, then its storage is
            // released back to its pool (the pools themselves drop last).
            unsafe {
                std::ptr::drop_in_place(entry.value.as_ptr());
                free_storage(&mut state.pools, entry);
            }
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state.try_borrow() {
            Ok(state) => f
                .debug_struct("Heap")
                .field("nodes", &state.nodes.len())
                .field("stats", &state.manager.stats(state.nodes.len()))
                .finish_non_exhaustive(),
            Err(_) => f.write_str("Heap { <borrowed> }"),
        }
    }
}
