//! Evaluation contexts and non-local exits.
//!
//! An evaluator running on the heap brackets each native frame with
//! [`Heap::with_context`]. The context remembers the protect-stack size on
//! entry; protect-stack operations may not unwind below it, and a
//! [`Condition::NonLocalExit`] aimed at the context truncates the protect
//! stack back to it in one step, releasing everything protected since.

use std::fmt;

use crate::error::{fatal_error, Condition};
use crate::heap::Heap;

/// Identity of an evaluation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// The outermost context, current whenever no `with_context` is active.
    pub const TOP_LEVEL: Self = Self(0);
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::TOP_LEVEL {
            f.write_str("top level")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ContextFrame {
    pub id: ContextId,
    pub pps_floor: usize,
}

#[derive(Debug)]
pub(crate) struct ContextStack {
    frames: Vec<ContextFrame>,
    next_id: u64,
}

impl Default for ContextStack {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            next_id: 1,
        }
    }
}

impl ContextStack {
    pub fn current(&self) -> ContextId {
        self.frames.last().map_or(ContextId::TOP_LEVEL, |frame| frame.id)
    }

    /// Protect-stack size below which the current context may not unwind.
    pub fn pps_floor(&self) -> usize {
        self.frames.last().map_or(0, |frame| frame.pps_floor)
    }

    fn push(&mut self, pps_floor: usize) -> ContextFrame {
        let frame = ContextFrame {
            id: ContextId(self.next_id),
            pps_floor,
        };
        self.next_id += 1;
        self.frames.push(frame);
        frame
    }

    fn pop(&mut self, id: ContextId) {
        match self.frames.pop() {
            Some(frame) if frame.id == id => {}
            _ => fatal_error("evaluation contexts must be left in reverse order of entry"),
        }
    }
}

/// Pops the frame even when the body unwinds.
struct FrameGuard<'h> {
    heap: &'h Heap,
    id: ContextId,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.heap.state.borrow_mut().contexts.pop(self.id);
    }
}

impl Heap {
    /// Run `body` in a fresh evaluation context.
    ///
    /// Returns `Ok(Some(value))` when the body completes. A
    /// [`Condition::NonLocalExit`] targeting this context is caught: the
    /// protect stack is restored to its size on entry and `Ok(None)` is
    /// returned. Any other condition propagates unchanged.
    ///
    /// # Errors
    ///
    /// Returns whatever condition the body raised, other than a non-local
    /// exit to this context.
    ///
    /// ```
    /// use cellgc::{Condition, Heap};
    ///
    /// let heap = Heap::new();
    /// let caught = heap.with_context(|ctx| -> Result<(), Condition> {
    ///     heap.protect(None);
    ///     Err(Condition::NonLocalExit { target: ctx })
    /// });
    /// assert_eq!(caught, Ok(None));
    /// assert_eq!(heap.pps_size(), 0);
    /// ```
    pub fn with_context<R>(
        &self,
        body: impl FnOnce(ContextId) -> Result<R, Condition>,
    ) -> Result<Option<R>, Condition> {
        let frame = {
            let mut state = self.state.borrow_mut();
            let floor = state.roots.protect.len();
            state.contexts.push(floor)
        };
        let result = {
            let _guard = FrameGuard {
                heap: self,
                id: frame.id,
            };
            body(frame.id)
        };

        match result {
            Ok(value) => Ok(Some(value)),
            Err(Condition::NonLocalExit { target }) if target == frame.id => {
                if let Err(err) = self.pps_restore_size(frame.pps_floor) {
                    fatal_error(format_args!("unwinding context {}: {err}", frame.id));
                }
                Ok(None)
            }
            Err(condition) => Err(condition),
        }
    }

    /// The innermost active context.
    #[must_use]
    pub fn current_context(&self) -> ContextId {
        self.state.borrow().contexts.current()
    }
}
