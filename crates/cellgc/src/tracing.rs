//! Structured events for collections.
//!
//! With the `tracing` feature every collection opens a `gc_collect` span
//! carrying its [`GcId`], and each phase opens a nested `gc_phase` span with
//! `phase_start`/`phase_end` events. Without the feature the same calls
//! compile to nothing, except that contained finalizer errors still reach
//! stderr.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one collection in the event stream.
///
/// Ids are process-wide and increase from 1, so two heaps never hand out
/// the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcId(pub u64);

static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

impl GcId {
    pub(crate) fn next() -> Self {
        Self(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Phases of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Mark,
    WeakReconcile,
    Sweep,
}

#[cfg(feature = "tracing")]
pub mod internal {
    use super::{GcId, GcPhase};
    use tracing::span::EnteredSpan;
    use tracing::{span, Level};

    /// Entered for the whole of one collection.
    pub struct CollectionSpan {
        _span: EnteredSpan,
    }

    pub fn collection_span(collection_type: &str, gc_id: GcId) -> CollectionSpan {
        CollectionSpan {
            _span: span!(
                Level::DEBUG,
                "gc_collect",
                collection_type = collection_type,
                gc_id = gc_id.0
            )
            .entered(),
        }
    }

    /// Entered for one phase; [`finish`](Self::finish) logs its result.
    pub struct PhaseSpan {
        phase: GcPhase,
        _span: EnteredSpan,
    }

    pub fn phase_span(phase: GcPhase, bytes_before: usize) -> PhaseSpan {
        let span = span!(Level::DEBUG, "gc_phase", phase = ?phase).entered();
        tracing::debug!(phase = ?phase, bytes_before, "phase_start");
        PhaseSpan { phase, _span: span }
    }

    impl PhaseSpan {
        pub fn finish(self, bytes_reclaimed: usize) {
            tracing::debug!(phase = ?self.phase, bytes_reclaimed, "phase_end");
        }
    }

    pub fn log_superblock(cell_size: usize, superblocks: usize) {
        tracing::trace!(cell_size, superblocks, "superblock_acquired");
    }

    pub fn log_threshold(threshold: usize, bytes_allocated: usize) {
        tracing::debug!(threshold, bytes_allocated, "threshold_adjusted");
    }

    pub fn log_finalizer_error(message: &str) {
        tracing::warn!(error = message, "finalizer_error");
    }

    pub fn log_fatal(message: &str) {
        tracing::error!(message, "fatal_error");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    use super::{GcId, GcPhase};

    pub struct CollectionSpan;

    pub const fn collection_span(_collection_type: &str, _gc_id: GcId) -> CollectionSpan {
        CollectionSpan
    }

    pub struct PhaseSpan;

    pub const fn phase_span(_phase: GcPhase, _bytes_before: usize) -> PhaseSpan {
        PhaseSpan
    }

    impl PhaseSpan {
        pub const fn finish(self, _bytes_reclaimed: usize) {}
    }

    pub const fn log_superblock(_cell_size: usize, _superblocks: usize) {}

    pub const fn log_threshold(_threshold: usize, _bytes_allocated: usize) {}

    pub fn log_finalizer_error(message: &str) {
        eprintln!("[GC] error while running finalizer: {message}");
    }

    pub const fn log_fatal(_message: &str) {}
}
