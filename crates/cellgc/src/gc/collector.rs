//! One stop-the-world mark-sweep pass.
//!
//! A collection of level `max_gen` covers generations `0..=max_gen`. Nodes
//! in older generations are assumed live: they are never swept, and
//! everything they refer to is treated as a root. Older nodes are not
//! traced to find those referents; edge counts minus the references from
//! inside the collected generations reveal them.
//!
//! 1. **Mark** from the root set, from every held node and from the
//!    nodes referenced by uncollected ones, to a fixed point.
//! 2. **Reconcile** weak references (see [`crate::weak`]).
//! 3. **Sweep** the unmarked nodes of the collected generations: first
//!    their outgoing edge counts are released and their edges detached,
//!    then they are dropped and their cells returned to the pools.
//!    Survivors lose their mark and are promoted one generation.

use std::collections::HashMap;
use std::ptr::NonNull;

use crate::gc::manager::MAX_LEVEL;
use crate::heap::Heap;
use crate::metrics::{CollectionType, GcMetrics, PhaseTimer};
use crate::node::NodeEntry;
use crate::ptr::NodeId;
use crate::trace::{referents_of, Referents, Trace, Visitor};

use crate::tracing::internal::{collection_span, phase_span};
use crate::tracing::{GcId, GcPhase};

/// Nodes of a partial collection that something older refers to.
///
/// Edge counts are exact, so a node whose count exceeds the references it
/// receives from inside the collected generations must be referenced from
/// an uncollected one. Only the collected generations are traced.
fn referenced_from_older(collected: &[(NodeId, u32, NonNull<dyn Trace>)]) -> Vec<NodeId> {
    let mut outside: HashMap<NodeId, u32> = collected
        .iter()
        .map(|&(id, edges, _)| (id, edges))
        .collect();
    for &(_, _, value) in collected {
        // SAFETY: no node is freed while marking, and values never move.
        unsafe { value.as_ref() }.trace(&mut SubtractVisitor {
            outside: &mut outside,
        });
    }
    outside
        .into_iter()
        .filter(|&(_, remaining)| remaining > 0)
        .map(|(id, _)| id)
        .collect()
}

struct SubtractVisitor<'a> {
    outside: &'a mut HashMap<NodeId, u32>,
}

impl Visitor for SubtractVisitor<'_> {
    fn visit(&mut self, node: NodeId) {
        if let Some(remaining) = self.outside.get_mut(&node) {
            *remaining = remaining.saturating_sub(1);
        }
    }
}

/// Visitor that feeds the mark worklist.
struct MarkVisitor<'a> {
    worklist: &'a mut Vec<NodeId>,
}

impl Visitor for MarkVisitor<'_> {
    fn visit(&mut self, node: NodeId) {
        self.worklist.push(node);
    }
}

#[derive(Debug, Default)]
struct SweepOutcome {
    objects_reclaimed: usize,
    bytes_reclaimed: usize,
}

impl Heap {
    /// Collect generations `0..=max_gen`.
    pub(crate) fn collect_generations(&self, max_gen: u8) -> GcMetrics {
        let collection_type = CollectionType::for_level(max_gen);
        let _gc_span = collection_span(collection_type.as_str(), GcId::next());

        let mut timer = PhaseTimer::start();
        self.collecting.set(true);

        let phase = phase_span(GcPhase::Mark, self.bytes_in_use());
        let objects_marked = self.mark_roots(max_gen);
        phase.finish(0);
        let mark_duration = timer.lap();

        let phase = phase_span(GcPhase::WeakReconcile, self.bytes_in_use());
        let (weak_refs_pending, weak_refs_tombstoned) = self.reconcile_weak_refs(max_gen);
        phase.finish(0);
        let weak_duration = timer.lap();

        let phase = phase_span(GcPhase::Sweep, self.bytes_in_use());
        let swept = self.sweep(max_gen);
        phase.finish(swept.bytes_reclaimed);
        let sweep_duration = timer.lap();

        self.collecting.set(false);
        self.drain_moribund();

        let mut state = self.state.borrow_mut();
        let metrics = GcMetrics {
            duration: timer.total(),
            bytes_reclaimed: swept.bytes_reclaimed,
            bytes_surviving: state.manager.bytes_allocated(),
            objects_reclaimed: swept.objects_reclaimed,
            objects_surviving: state.nodes.len(),
            objects_marked,
            collection_type,
            total_collections: state.manager.collections() + 1,
            mark_duration,
            weak_duration,
            sweep_duration,
            weak_refs_pending,
            weak_refs_tombstoned,
        };
        state.last_metrics = metrics;
        metrics
    }

    fn bytes_in_use(&self) -> usize {
        self.state.borrow().manager.bytes_allocated()
    }

    /// Mark everything reachable from the roots. Returns the number of
    /// nodes marked.
    fn mark_roots(&self, max_gen: u8) -> usize {
        let (mut roots, collected) = {
            let state = self.state.borrow();
            let mut referents = Referents::default();
            state.roots.visit_roots(&mut referents);
            debug_assert!(
                referents
                    .0
                    .iter()
                    .all(|&id| state.nodes.get(id).is_none_or(|entry| entry.holders > 0)),
                "rooted node without a holder count"
            );

            let mut collected = Vec::new();
            for (id, entry) in state.nodes.iter() {
                if entry.holders > 0 {
                    referents.0.push(id);
                }
                if entry.generation <= max_gen && max_gen < MAX_LEVEL {
                    collected.push((id, entry.edges, entry.value));
                }
            }
            (referents.0, collected)
        };
        roots.extend(referenced_from_older(&collected));
        self.mark_from(roots, max_gen)
    }

    /// Mark `roots` and everything reachable from them within the
    /// collected generations. Returns the number of nodes newly marked.
    pub(crate) fn mark_from(&self, roots: impl IntoIterator<Item = NodeId>, max_gen: u8) -> usize {
        let mut worklist: Vec<NodeId> = roots.into_iter().collect();
        let mut newly_marked = 0;
        while let Some(id) = worklist.pop() {
            let value = {
                let mut state = self.state.borrow_mut();
                let Some(entry) = state.nodes.get_mut(id) else {
                    continue;
                };
                if entry.generation > max_gen || entry.marked {
                    continue;
                }
                entry.marked = true;
                entry.value
            };
            newly_marked += 1;
            // SAFETY: as in `mark_roots`.
            unsafe { value.as_ref() }.trace(&mut MarkVisitor {
                worklist: &mut worklist,
            });
        }
        newly_marked
    }

    /// Whether `id` survives the collection in progress: marked, or in a
    /// generation that is not being collected.
    pub(crate) fn survives(&self, id: NodeId, max_gen: u8) -> bool {
        self.state
            .borrow()
            .nodes
            .get(id)
            .is_some_and(|entry| entry.marked || entry.generation > max_gen)
    }

    fn sweep(&self, max_gen: u8) -> SweepOutcome {
        let dead: Vec<(NodeId, NodeEntry)> = {
            let mut state = self.state.borrow_mut();
            let dead_ids: Vec<NodeId> = state
                .nodes
                .iter()
                .filter(|(_, entry)| {
                    entry.generation <= max_gen && !entry.marked && entry.holders == 0
                })
                .map(|(id, _)| id)
                .collect();
            let dead = dead_ids
                .into_iter()
                .filter_map(|id| state.nodes.remove(id).map(|entry| (id, entry)))
                .collect();

            for (_, entry) in state.nodes.iter_mut() {
                if entry.generation <= max_gen && entry.generation < MAX_LEVEL {
                    entry.generation += 1;
                }
                entry.marked = false;
            }
            dead
        };

        // Release counts held by the dead and sever their edges before any
        // of them is dropped.
        for (_, entry) in &dead {
            // SAFETY: removed from the table but not yet dropped.
            let value = unsafe { entry.value.as_ref() };
            for child in referents_of(value) {
                self.remove_edge(child);
            }
            value.detach();
        }

        let mut outcome = SweepOutcome::default();
        for (id, entry) in dead {
            outcome.objects_reclaimed += 1;
            outcome.bytes_reclaimed += entry.bytes;
            self.destroy(id, entry);
        }
        outcome
    }
}
