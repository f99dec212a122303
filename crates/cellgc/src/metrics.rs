//! Collection metrics and heap tallies.

use std::time::{Duration, Instant};

/// What the last collection did.
///
/// Byte and node counts cover the sweep only. Nodes reclaimed by counting
/// once the sweep has finished show up in the heap tallies, not here.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Wall time, all phases included.
    pub duration: Duration,
    /// Cell bytes freed by the sweep.
    pub bytes_reclaimed: usize,
    /// Bytes still charged to live nodes afterwards.
    pub bytes_surviving: usize,
    /// Nodes freed by the sweep.
    pub objects_reclaimed: usize,
    /// Nodes alive afterwards.
    pub objects_surviving: usize,
    /// Nodes reached while marking.
    pub objects_marked: usize,
    /// Generations covered.
    pub collection_type: CollectionType,
    /// Collections on this heap so far, this one included.
    pub total_collections: usize,
    /// Time spent marking.
    pub mark_duration: Duration,
    /// Time spent deciding the fate of weak references.
    pub weak_duration: Duration,
    /// Time spent sweeping.
    pub sweep_duration: Duration,
    /// Weak references whose key died and which await finalization.
    pub weak_refs_pending: usize,
    /// Weak references whose key died with no finalizer to run.
    pub weak_refs_tombstoned: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Metrics of a heap that has not collected yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            bytes_reclaimed: 0,
            bytes_surviving: 0,
            objects_reclaimed: 0,
            objects_surviving: 0,
            objects_marked: 0,
            collection_type: CollectionType::None,
            total_collections: 0,
            mark_duration: Duration::ZERO,
            weak_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            weak_refs_pending: 0,
            weak_refs_tombstoned: 0,
        }
    }
}

/// Which generations a collection covered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Generation 0 only.
    Minor = 1,
    /// Generations 0 and 1.
    Intermediate = 2,
    /// Every generation.
    Full = 3,
}

impl CollectionType {
    /// Collection type for a collection of generations `0..=max_gen`.
    #[must_use]
    pub const fn for_level(max_gen: u8) -> Self {
        match max_gen {
            0 => Self::Minor,
            1 => Self::Intermediate,
            _ => Self::Full,
        }
    }

    /// Lower-case label used in spans and reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Minor => "minor",
            Self::Intermediate => "intermediate",
            Self::Full => "full",
        }
    }
}

/// Stopwatch for the phases of one collection.
///
/// Each [`lap`](Self::lap) returns the time since the previous lap (or since
/// the timer was started) and restarts the clock.
///
/// ```
/// use cellgc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::start();
/// let mark = timer.lap();
/// let sweep = timer.lap();
/// assert!(timer.total() >= mark + sweep);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    began: Instant,
    lap_start: Instant,
}

impl PhaseTimer {
    /// Start the clock.
    #[must_use]
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            began: now,
            lap_start: now,
        }
    }

    /// Time since the last lap.
    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.lap_start);
        self.lap_start = now;
        elapsed
    }

    /// Time since [`start`](Self::start).
    #[must_use]
    pub fn total(&self) -> Duration {
        self.began.elapsed()
    }
}

/// Allocation tallies of a heap.
///
/// `max_bytes` and `max_nodes` are high-water marks sampled at each
/// collection, and can be reset with
/// [`Heap::reset_max_tallies`](crate::Heap::reset_max_tallies).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes currently charged to live nodes.
    pub bytes_allocated: usize,
    /// Live nodes.
    pub node_count: usize,
    /// Highest `bytes_allocated` seen.
    pub max_bytes: usize,
    /// Highest `node_count` seen.
    pub max_nodes: usize,
    /// Allocation level at which the next collection is cued.
    pub trigger_level: usize,
    /// Collections performed.
    pub collections: usize,
}
