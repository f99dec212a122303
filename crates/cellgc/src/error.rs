//! Error types for allocation, rooting discipline and evaluator conditions.

use std::fmt::Display;

use thiserror::Error;

use crate::context::ContextId;

/// Failure to obtain memory from the system allocator.
///
/// This is the one recoverable failure of the allocation path: the caller
/// may release roots and retry, or surface it as a language-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The backing allocator could not supply a superblock or large node.
    #[error("out of memory: could not obtain {bytes} bytes")]
    OutOfMemory {
        /// Size of the request that failed.
        bytes: usize,
    },
}

/// Misuse of the protect stack.
///
/// These indicate a rooting-discipline bug in the calling code rather than a
/// runtime condition, but they are reported as values so that the caller can
/// attach its own diagnostics before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RootingError {
    /// `reprotect` addressed an entry that does not exist.
    #[error("protect stack index {index} out of range (size {size})")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Protect stack size at the time of the call.
        size: usize,
    },
    /// The entry was protected in a different context from the current one.
    #[error("protect stack entry {index} belongs to context {expected}, not {found}")]
    ContextMismatch {
        /// Index of the offending entry.
        index: usize,
        /// Context that created the entry.
        expected: ContextId,
        /// Context attempting to modify it.
        found: ContextId,
    },
    /// `unprotect` asked for more entries than the stack holds.
    #[error("cannot unprotect {count} entries: stack size is {size}")]
    CountExceedsSize {
        /// Requested count.
        count: usize,
        /// Protect stack size at the time of the call.
        size: usize,
    },
    /// The operation would unwind below the floor of the current context.
    #[error("too many unprotects in this context: floor is {floor}, requested size {requested}")]
    BelowContextFloor {
        /// Protect stack size when the current context was entered.
        floor: usize,
        /// Size the operation would leave.
        requested: usize,
    },
    /// `unprotect_ptr` did not find the node.
    #[error("node not found on the protect stack")]
    NotProtected,
    /// `pps_restore_size` was asked to grow the stack.
    #[error("requested protect stack size {requested} is greater than current size {size}")]
    RestoreAboveSize {
        /// Requested size.
        requested: usize,
        /// Current size.
        size: usize,
    },
}

/// Signal raised by evaluator code running on top of the heap.
///
/// A `NonLocalExit` unwinds every intervening frame (by ordinary `?`
/// propagation) until the context it names catches it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Condition {
    /// An ordinary error with a message.
    #[error("{0}")]
    Error(String),
    /// A jump to the handler of the given context.
    #[error("non-local exit to context {target}")]
    NonLocalExit {
        /// Context that will handle the exit.
        target: ContextId,
    },
}

impl Condition {
    /// Convenience constructor for [`Condition::Error`].
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }
}

/// Report a broken heap or rooting invariant and stop.
///
/// The heap is in an unknown state after any of these, so there is no
/// recovery path. The diagnostic goes to stderr (and to the `tracing`
/// subscriber when that feature is enabled) before the panic; building with
/// `panic = "abort"` turns this into a process abort.
#[cold]
#[track_caller]
pub(crate) fn fatal_error(message: impl Display) -> ! {
    crate::tracing::internal::log_fatal(&message.to_string());
    eprintln!("Fatal error: {message}");
    panic!("fatal error: {message}");
}
