//! Collection policy.
//!
//! The manager keeps the allocation tallies, decides when an allocation
//! should cue a collection, chooses how many generations each collection
//! covers, and moves the threshold afterwards.

use std::io::Write;

use crate::config::HeapConfig;
use crate::error::fatal_error;
use crate::heap::Heap;
use crate::metrics::{GcMetrics, HeapStats};
use crate::node::NUM_GENERATIONS;

/// Callback run immediately before or after a collection, e.g. for timing.
/// It runs with the heap marked as collecting, so it must not allocate.
pub type GcHook = fn();

/// Every this many collections, generation 1 is collected as well.
pub const LEVEL_1_INTERVAL: usize = 20;
/// Every this many generation-1 collections is a full collection instead.
pub const LEVEL_2_INTERVAL: usize = 5;

pub(crate) const MAX_LEVEL: u8 = (NUM_GENERATIONS - 1) as u8;

pub(crate) struct GcManager {
    threshold: usize,
    min_threshold: usize,
    max_threshold: usize,
    bytes_allocated: usize,
    max_bytes: usize,
    max_nodes: usize,
    torture: bool,
    reporting: Option<Box<dyn Write>>,
    pre_gc: Option<GcHook>,
    post_gc: Option<GcHook>,
    /// Level-0 collections since the last deeper one, and level-1
    /// collections since the last full one.
    since_deeper: [usize; 2],
    collections: usize,
}

impl GcManager {
    pub fn new(config: &HeapConfig) -> Self {
        let threshold = config.initial_threshold.min(config.max_threshold);
        Self {
            threshold,
            min_threshold: threshold,
            max_threshold: config.max_threshold,
            bytes_allocated: 0,
            max_bytes: 0,
            max_nodes: 0,
            torture: config.torture,
            reporting: None,
            pre_gc: None,
            post_gc: None,
            since_deeper: [0; 2],
            collections: 0,
        }
    }

    /// Whether an allocation of `bytes` should trigger a collection first.
    pub const fn cue(&self, bytes: usize) -> bool {
        self.torture || self.bytes_allocated.saturating_add(bytes) > self.threshold
    }

    pub const fn record_alloc(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    pub const fn record_free(&mut self, bytes: usize) {
        self.bytes_allocated = self.bytes_allocated.saturating_sub(bytes);
    }

    /// Oldest generation the next collection should include.
    pub const fn choose_level(&self, full: bool) -> u8 {
        if full || self.torture {
            return MAX_LEVEL;
        }
        if self.since_deeper[0] + 1 < LEVEL_1_INTERVAL {
            0
        } else if self.since_deeper[1] + 1 < LEVEL_2_INTERVAL {
            1
        } else {
            MAX_LEVEL
        }
    }

    pub const fn record_collection(&mut self, level: u8) {
        self.collections += 1;
        match level {
            0 => self.since_deeper[0] += 1,
            1 => {
                self.since_deeper[0] = 0;
                self.since_deeper[1] += 1;
            }
            _ => self.since_deeper = [0; 2],
        }
    }

    /// `threshold = clamp(max(min, 2 * allocated + bytes_needed), max)`.
    pub fn adjust_threshold(&mut self, bytes_needed: usize) {
        let wanted = self
            .bytes_allocated
            .saturating_mul(2)
            .saturating_add(bytes_needed);
        self.threshold = wanted.max(self.min_threshold).min(self.max_threshold);
        crate::tracing::internal::log_threshold(self.threshold, self.bytes_allocated);
    }

    pub fn sample_tallies(&mut self, node_count: usize) {
        self.max_bytes = self.max_bytes.max(self.bytes_allocated);
        self.max_nodes = self.max_nodes.max(node_count);
    }

    pub const fn collections(&self) -> usize {
        self.collections
    }

    pub const fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub const fn stats(&self, node_count: usize) -> HeapStats {
        HeapStats {
            bytes_allocated: self.bytes_allocated,
            node_count,
            max_bytes: self.max_bytes,
            max_nodes: self.max_nodes,
            trigger_level: self.threshold,
            collections: self.collections,
        }
    }

    fn report(&mut self, metrics: &GcMetrics) {
        let Some(sink) = self.reporting.as_mut() else {
            return;
        };
        let written = writeln!(
            sink,
            "GC ({}): reclaimed {} nodes ({} bytes); {} nodes ({} bytes) in use; threshold {}",
            metrics.collection_type.as_str(),
            metrics.objects_reclaimed,
            metrics.bytes_reclaimed,
            metrics.objects_surviving,
            metrics.bytes_surviving,
            self.threshold,
        );
        if written.is_err() {
            self.reporting = None;
        }
    }
}

impl Heap {
    /// Run a garbage collection.
    ///
    /// With `full` every generation is collected; otherwise the manager
    /// picks the generations, collecting deeper if a collection leaves the
    /// heap still above its threshold. `bytes_wanted` is the size of the
    /// allocation that prompted the collection (0 if none) and feeds the
    /// threshold adjustment that follows.
    ///
    /// Finalizers of weak references whose keys died are queued, not run;
    /// see [`Heap::run_finalizers`].
    pub fn gc(&self, bytes_wanted: usize, full: bool) {
        if self.collecting.get() {
            fatal_error("garbage collection requested during garbage collection");
        }
        let (pre_gc, post_gc) = {
            let state = self.state.borrow();
            (state.manager.pre_gc, state.manager.post_gc)
        };
        self.run_hook(pre_gc);

        let mut level = {
            let mut state = self.state.borrow_mut();
            let node_count = state.nodes.len();
            state.manager.sample_tallies(node_count);
            state.manager.choose_level(full)
        };
        loop {
            let metrics = self.collect_generations(level);
            let escalate = {
                let mut state = self.state.borrow_mut();
                state.manager.record_collection(level);
                state.manager.report(&metrics);
                level < MAX_LEVEL && state.manager.cue(bytes_wanted)
            };
            if !escalate {
                break;
            }
            level += 1;
        }

        self.state
            .borrow_mut()
            .manager
            .adjust_threshold(bytes_wanted);
        self.run_hook(post_gc);
    }

    /// Let the manager choose which generations to collect.
    pub fn collect(&self) {
        self.gc(0, false);
    }

    /// Collect every generation.
    pub fn collect_full(&self) {
        self.gc(0, true);
    }

    fn run_hook(&self, hook: Option<GcHook>) {
        if let Some(hook) = hook {
            self.collecting.set(true);
            hook();
            self.collecting.set(false);
        }
    }

    /// Recompute the collection threshold from the current allocation level
    /// and a pending demand of `bytes_needed`.
    pub fn adjust_threshold(&self, bytes_needed: usize) {
        self.state
            .borrow_mut()
            .manager
            .adjust_threshold(bytes_needed);
    }

    /// Current allocation tallies.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let state = self.state.borrow();
        state.manager.stats(state.nodes.len())
    }

    /// Metrics of the most recent collection.
    #[must_use]
    pub fn last_gc_metrics(&self) -> GcMetrics {
        self.state.borrow().last_metrics
    }

    /// Turn torture mode on or off. Under torture every allocation runs a
    /// full collection first.
    pub fn set_torture(&self, on: bool) {
        self.state.borrow_mut().manager.torture = on;
    }

    /// Whether torture mode is on.
    #[must_use]
    pub fn is_tortured(&self) -> bool {
        self.state.borrow().manager.torture
    }

    /// Direct a one-line report of each collection to `sink`, or stop
    /// reporting with `None`. Returns the previous sink. A sink that fails
    /// to accept a report is dropped.
    pub fn set_reporting(&self, sink: Option<Box<dyn Write>>) -> Option<Box<dyn Write>> {
        std::mem::replace(&mut self.state.borrow_mut().manager.reporting, sink)
    }

    /// Install callbacks to run before and after each collection.
    pub fn set_gc_hooks(&self, pre_gc: Option<GcHook>, post_gc: Option<GcHook>) {
        let mut state = self.state.borrow_mut();
        state.manager.pre_gc = pre_gc;
        state.manager.post_gc = post_gc;
    }

    /// Reset the high-water marks to the current tallies.
    pub fn reset_max_tallies(&self) {
        let mut state = self.state.borrow_mut();
        let node_count = state.nodes.len();
        let manager = &mut state.manager;
        manager.max_bytes = manager.bytes_allocated;
        manager.max_nodes = node_count;
    }
}
