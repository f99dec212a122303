//! Weak references and finalization.
//!
//! A [`WeakRef`] is itself a node. It refers weakly to a *key* and strongly
//! (but conditionally) to a *value* and an optional *finalizer*: the value
//! and finalizer are kept alive by the reference only while the key is
//! otherwise reachable.
//!
//! Every reference is in exactly one of three states:
//!
//! - **Live**: the key is alive. The reference keeps itself alive too, so a
//!   weak reference with a finalizer need not be rooted by anyone.
//! - **Pending finalization**: the key became unreachable and there is a
//!   finalizer to run. The key is held until [`Heap::run_finalizers`] runs
//!   the finalizer on it.
//! - **Tombstoned**: key, value and finalizer are all cleared. The
//!   reference is now an ordinary node and is reclaimed like one.
//!
//! After the strong mark of each collection reaches a fixed point, live
//! references are reconciled:
//!
//! 1. Any whose key survives has its value and managed finalizer marked,
//!    which may in turn make further keys survive; this repeats until no new
//!    marks appear.
//! 2. The rest have dead keys. Those with a finalizer have the key, the
//!    finalizer and the reference marked and held, and become pending.
//!    Those without are tombstoned.
//! 3. The references still live are marked.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::error::{fatal_error, AllocError, Condition};
use crate::heap::Heap;
use crate::ptr::{Gc, NodeId};
use crate::trace::{Trace, Visitor};

/// Finalizer implemented in Rust. Receives the heap and the key.
pub type NativeFinalizer = Box<dyn FnMut(&Heap, NodeId) -> Result<(), Condition>>;

/// Runs managed finalizers: receives the heap, the finalizer node and the
/// key. Installed with [`Heap::set_finalizer_host`] by the evaluator that
/// knows how to call its own callable nodes.
pub type FinalizerHost = Box<dyn FnMut(&Heap, NodeId, NodeId) -> Result<(), Condition>>;

/// What to run when a weak reference's key dies.
pub enum Finalizer {
    /// Nothing.
    None,
    /// A Rust closure.
    Native(NativeFinalizer),
    /// A callable node, invoked through the finalizer host.
    Managed(NodeId),
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Native(_) => f.write_str("Native(..)"),
            Self::Managed(id) => f.debug_tuple("Managed").field(id).finish(),
        }
    }
}

/// Lifecycle state of a [`WeakRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakRefState {
    /// Key alive.
    Live,
    /// Key dead; finalizer waiting to run.
    PendingFinalization,
    /// Cleared.
    Tombstoned,
}

/// A weak reference node. Create with [`Heap::new_weak_ref`].
pub struct WeakRef {
    key: Cell<Option<NodeId>>,
    value: Cell<Option<NodeId>>,
    managed_finalizer: Cell<Option<NodeId>>,
    native_finalizer: RefCell<Option<NativeFinalizer>>,
    finalize_on_exit: bool,
    state: Cell<WeakRefState>,
}

impl WeakRef {
    /// The key, unless tombstoned.
    #[must_use]
    pub fn key(&self) -> Option<NodeId> {
        self.key.get()
    }

    /// The value, unless tombstoned.
    #[must_use]
    pub fn value(&self) -> Option<NodeId> {
        self.value.get()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WeakRefState {
        self.state.get()
    }

    /// Whether the finalizer also runs at [`Heap::run_exit_finalizers`].
    #[must_use]
    pub const fn finalize_on_exit(&self) -> bool {
        self.finalize_on_exit
    }

    fn has_finalizer(&self) -> bool {
        self.managed_finalizer.get().is_some() || self.native_finalizer.borrow().is_some()
    }
}

impl std::fmt::Debug for WeakRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakRef")
            .field("key", &self.key.get())
            .field("value", &self.value.get())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

// SAFETY: the value and the managed finalizer are counted edges. The key is
// deliberately not reported.
unsafe impl Trace for WeakRef {
    fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(value) = self.value.get() {
            visitor.visit(value);
        }
        if let Some(finalizer) = self.managed_finalizer.get() {
            visitor.visit(finalizer);
        }
    }

    fn detach(&self) {
        self.value.set(None);
        self.managed_finalizer.set(None);
    }
}

/// The three state lists.
#[derive(Debug, Default)]
pub(crate) struct WeakRegistry {
    live: Vec<NodeId>,
    pending: Vec<NodeId>,
    tombstone: Vec<NodeId>,
    count: usize,
}

impl WeakRegistry {
    /// Drop a reclaimed reference from whichever list holds it.
    pub fn forget(&mut self, id: NodeId) {
        for list in [&mut self.live, &mut self.pending, &mut self.tombstone] {
            if let Some(pos) = list.iter().position(|&member| member == id) {
                list.remove(pos);
                self.count -= 1;
                return;
            }
        }
    }

    fn list_mut(&mut self, state: WeakRefState) -> &mut Vec<NodeId> {
        match state {
            WeakRefState::Live => &mut self.live,
            WeakRefState::PendingFinalization => &mut self.pending,
            WeakRefState::Tombstoned => &mut self.tombstone,
        }
    }

    fn transfer(&mut self, id: NodeId, from: WeakRefState, to: WeakRefState) {
        let source = self.list_mut(from);
        match source.iter().position(|&member| member == id) {
            Some(pos) => {
                source.remove(pos);
            }
            None => fatal_error(format_args!("weak reference {id:?} missing from {from:?} list")),
        }
        self.list_mut(to).push(id);
    }
}

impl Heap {
    /// Create a weak reference from `key` to `value`.
    ///
    /// The reference is live while `key` is alive. When the collector finds
    /// `key` unreachable, a reference with a finalizer moves to pending
    /// finalization (keeping `key` alive for the finalizer), and one without
    /// is tombstoned. A `None` key gives a reference that is tombstoned from
    /// the start; its finalizer never runs.
    ///
    /// The new reference keeps itself alive while live or pending, so the
    /// returned handle need not be rooted for the finalizer to run.
    ///
    /// # Errors
    ///
    /// [`AllocError`] if the reference cannot be placed.
    pub fn new_weak_ref(
        &self,
        key: Option<NodeId>,
        value: Option<NodeId>,
        finalizer: Finalizer,
        finalize_on_exit: bool,
    ) -> Result<Gc<WeakRef>, AllocError> {
        let (managed, native) = match finalizer {
            Finalizer::None => (None, None),
            Finalizer::Native(native) => (None, Some(native)),
            Finalizer::Managed(node) => (Some(node), None),
        };
        // The key is not an edge, so nothing else protects it while the
        // reference is being placed.
        if let Some(key) = key {
            self.hold(key);
        }
        let placed = self.alloc(WeakRef {
            key: Cell::new(key),
            value: Cell::new(value),
            managed_finalizer: Cell::new(managed),
            native_finalizer: RefCell::new(native),
            finalize_on_exit,
            state: Cell::new(WeakRefState::Live),
        });
        let weak_ref = match placed {
            Ok(weak_ref) => weak_ref,
            Err(err) => {
                if let Some(key) = key {
                    self.unhold(key);
                }
                return Err(err);
            }
        };

        let key_alive = {
            let mut state = self.state.borrow_mut();
            state.weak.live.push(weak_ref.id());
            state.weak.count += 1;
            match key.and_then(|key| state.nodes.get_mut(key)) {
                Some(entry) => {
                    entry.weak_keys += 1;
                    true
                }
                None => false,
            }
        };
        if let Some(entry) = self.state.borrow_mut().nodes.get_mut(weak_ref.id()) {
            entry.weak_active = true;
        }
        if !key_alive {
            self.weak_ref_at(weak_ref.id()).key.set(None);
            self.tombstone(weak_ref.id());
        }
        if let Some(key) = key {
            self.unhold(key);
        }
        Ok(weak_ref)
    }

    /// Install the callback that runs managed finalizers, returning the
    /// previous one.
    pub fn set_finalizer_host(&self, host: Option<FinalizerHost>) -> Option<FinalizerHost> {
        self.finalizer_host.replace(host)
    }

    /// Run every pending finalizer.
    ///
    /// Each reference is tombstoned before its finalizer is invoked, so no
    /// finalizer runs twice even if it re-enters this method. Each call runs
    /// in its own context. A [`Condition::Error`] from a finalizer is
    /// reported and contained, and the protect stack is restored.
    ///
    /// Returns whether any finalizer ran.
    ///
    /// # Errors
    ///
    /// A [`Condition::NonLocalExit`] raised by a finalizer and aimed at an
    /// enclosing context is propagated; finalizers still pending stay
    /// pending for the next call.
    pub fn run_finalizers(&self) -> Result<bool, Condition> {
        let mut any_run = false;
        loop {
            let next = self.state.borrow().weak.pending.first().copied();
            let Some(id) = next else {
                break;
            };
            any_run = true;

            let weak_ref = self.weak_ref_at(id);
            let Some(key) = weak_ref.key.get() else {
                fatal_error("pending weak reference without a key");
            };
            let managed = weak_ref.managed_finalizer.get();
            let native = weak_ref.native_finalizer.borrow_mut().take();
            if let Some(finalizer) = managed {
                self.hold(finalizer);
            }
            self.tombstone(id);

            let pps_size = self.pps_size();
            let outcome = self.with_context(|_| match (native, managed) {
                (Some(mut native), _) => native(self, key),
                (None, Some(finalizer)) => self.call_managed_finalizer(finalizer, key),
                (None, None) => Ok(()),
            });

            if let Some(finalizer) = managed {
                self.unhold(finalizer);
            }
            // Pending holds on the key and the reference, taken when the
            // key was found dead.
            self.unhold(key);
            self.unhold(id);

            match outcome {
                Ok(_) => {}
                Err(Condition::Error(message)) => {
                    crate::tracing::internal::log_finalizer_error(&message);
                    if self.pps_size() > pps_size {
                        if let Err(err) = self.pps_restore_size(pps_size) {
                            fatal_error(format_args!("restoring after finalizer error: {err}"));
                        }
                    }
                }
                Err(exit @ Condition::NonLocalExit { .. }) => return Err(exit),
            }
        }
        Ok(any_run)
    }

    /// Finalize every live reference marked finalize-on-exit (and having a
    /// finalizer), whatever the state of its key, then run all pending
    /// finalizers.
    ///
    /// # Errors
    ///
    /// As for [`run_finalizers`](Self::run_finalizers).
    pub fn run_exit_finalizers(&self) -> Result<bool, Condition> {
        let live = self.state.borrow().weak.live.clone();
        for id in live {
            let weak_ref = self.weak_ref_at(id);
            if weak_ref.finalize_on_exit && weak_ref.has_finalizer() {
                self.make_pending(id);
            }
        }
        self.run_finalizers()
    }

    /// Verify the registry invariants. Any violation is fatal.
    pub fn check_weak_refs(&self) -> bool {
        let state = self.state.borrow();
        let weak = &state.weak;
        if weak.live.len() + weak.pending.len() + weak.tombstone.len() != weak.count {
            fatal_error(format_args!(
                "WeakRef::check(): tally error: live {}, pending {}, tombstone {}, count {}",
                weak.live.len(),
                weak.pending.len(),
                weak.tombstone.len(),
                weak.count
            ));
        }
        let lists = [
            (&weak.live, WeakRefState::Live),
            (&weak.pending, WeakRefState::PendingFinalization),
            (&weak.tombstone, WeakRefState::Tombstoned),
        ];
        for (list, expected) in lists {
            for &id in list {
                let Some(entry) = state.nodes.get(id) else {
                    fatal_error(format_args!("registered weak reference {id:?} is not live"));
                };
                // SAFETY: registered nodes are `WeakRef`s.
                let weak_ref = unsafe { entry.value.cast::<WeakRef>().as_ref() };
                if weak_ref.state.get() != expected {
                    fatal_error(format_args!(
                        "weak reference on {expected:?} list is {:?}",
                        weak_ref.state.get()
                    ));
                }
                let has_key = weak_ref.key.get().is_some();
                match expected {
                    WeakRefState::Live if !has_key => {
                        fatal_error("node on live list with null key");
                    }
                    WeakRefState::PendingFinalization if !has_key => {
                        fatal_error("node on pending list with null key");
                    }
                    WeakRefState::PendingFinalization if !weak_ref.has_finalizer() => {
                        fatal_error("node on pending list without finalizer");
                    }
                    WeakRefState::Tombstoned if has_key => {
                        fatal_error("node on tombstone list with non-null key");
                    }
                    _ => {}
                }
            }
        }
        true
    }

    /// Number of weak references in existence.
    #[must_use]
    pub fn weak_ref_count(&self) -> usize {
        self.state.borrow().weak.count
    }

    /// Decide the fate of each live reference after the strong mark.
    /// Returns how many became pending and how many were tombstoned.
    pub(crate) fn reconcile_weak_refs(&self, max_gen: u8) -> (usize, usize) {
        let live = self.state.borrow().weak.live.clone();
        let mut unresolved = live.clone();

        loop {
            let mut new_marks = false;
            let mut still_unresolved = Vec::with_capacity(unresolved.len());
            for id in unresolved {
                let weak_ref = self.weak_ref_at(id);
                let key_survives = weak_ref
                    .key
                    .get()
                    .is_some_and(|key| self.survives(key, max_gen));
                if key_survives {
                    let conditional = [weak_ref.value.get(), weak_ref.managed_finalizer.get()];
                    if self.mark_from(conditional.into_iter().flatten(), max_gen) > 0 {
                        new_marks = true;
                    }
                } else {
                    still_unresolved.push(id);
                }
            }
            unresolved = still_unresolved;
            if !new_marks {
                break;
            }
        }

        let (mut pending, mut tombstoned) = (0, 0);
        for &id in &unresolved {
            let weak_ref = self.weak_ref_at(id);
            if weak_ref.has_finalizer() {
                let key = weak_ref.key.get();
                let finalizer = weak_ref.managed_finalizer.get();
                self.make_pending(id);
                self.mark_from([key, finalizer, Some(id)].into_iter().flatten(), max_gen);
                pending += 1;
            } else {
                self.tombstone(id);
                tombstoned += 1;
            }
        }

        let confirmed = live.into_iter().filter(|id| !unresolved.contains(id));
        self.mark_from(confirmed, max_gen);
        (pending, tombstoned)
    }

    /// Move a live reference to pending, holding its key and itself.
    fn make_pending(&self, id: NodeId) {
        let weak_ref = self.weak_ref_at(id);
        weak_ref.state.set(WeakRefState::PendingFinalization);
        self.state.borrow_mut().weak.transfer(
            id,
            WeakRefState::Live,
            WeakRefState::PendingFinalization,
        );
        if let Some(key) = weak_ref.key.get() {
            self.hold(key);
        }
        self.hold(id);
    }

    /// Clear a reference and move it to the tombstone list.
    ///
    /// Holds taken by [`make_pending`](Self::make_pending) are not released
    /// here.
    pub(crate) fn tombstone(&self, id: NodeId) {
        let weak_ref = self.weak_ref_at(id);
        let previous = weak_ref.state.replace(WeakRefState::Tombstoned);
        if previous == WeakRefState::Tombstoned {
            return;
        }
        let key = weak_ref.key.take();
        let value = weak_ref.value.take();
        let finalizer = weak_ref.managed_finalizer.take();
        let native = weak_ref.native_finalizer.borrow_mut().take();
        drop(native);

        {
            let mut state = self.state.borrow_mut();
            state
                .weak
                .transfer(id, previous, WeakRefState::Tombstoned);
            if let Some(entry) = state.nodes.get_mut(id) {
                entry.weak_active = false;
            }
            if let Some(entry) = key.and_then(|key| state.nodes.get_mut(key)) {
                entry.weak_keys = entry.weak_keys.saturating_sub(1);
            }
        }

        for child in [value, finalizer].into_iter().flatten() {
            self.remove_edge(child);
        }
        // The reference itself is left for its holders or the sweep, like
        // any newly unreferenced node.
        if let Some(key) = key {
            let moribund = self
                .state
                .borrow()
                .nodes
                .get(key)
                .is_some_and(crate::node::NodeEntry::is_moribund);
            if moribund {
                self.reclaim(key);
            }
        }
    }

    fn call_managed_finalizer(&self, finalizer: NodeId, key: NodeId) -> Result<(), Condition> {
        let Some(mut host) = self.finalizer_host.borrow_mut().take() else {
            return Err(Condition::error(
                "no finalizer host installed to run a managed finalizer",
            ));
        };
        let result = host(self, finalizer, key);
        let mut slot = self.finalizer_host.borrow_mut();
        // Keep a host installed by the finalizer itself.
        if slot.is_none() {
            *slot = Some(host);
        }
        result
    }

    /// The `WeakRef` behind a registered id.
    ///
    /// Registered references are live or pending (and so cannot be
    /// reclaimed) or are being handled by the caller, so the reference
    /// outlives any use the caller makes of it.
    fn weak_ref_at(&self, id: NodeId) -> &WeakRef {
        let value = {
            let state = self.state.borrow();
            match state.nodes.get(id) {
                Some(entry) if entry.type_id == TypeId::of::<WeakRef>() => entry.value,
                _ => fatal_error(format_args!("{id:?} is not a live weak reference")),
            }
        };
        let weak_ref: NonNull<WeakRef> = value.cast();
        // SAFETY: type checked above; see the method docs for lifetime.
        unsafe { weak_ref.as_ref() }
    }
}
