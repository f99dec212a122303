//! Per-node metadata.
//!
//! The node table maps each [`NodeId`] to the location of the node's value
//! and the bookkeeping the collector and the counting layer need. Slots are
//! recycled; every reuse bumps the slot's stamp so that ids of reclaimed
//! nodes never resolve again.

use std::alloc::Layout;
use std::any::TypeId;
use std::ptr::NonNull;

use crate::ptr::NodeId;
use crate::trace::Trace;

/// Number of generations. Generation 0 holds new nodes; survivors of a
/// collection that includes their generation move up one, to at most
/// `NUM_GENERATIONS - 1`.
pub const NUM_GENERATIONS: usize = 3;

/// Where a node's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Storage {
    /// A cell of the pool for the given size class.
    Pool(usize),
    /// A dedicated allocation from the global allocator.
    Large(Layout),
}

/// Bookkeeping for one live node.
pub(crate) struct NodeEntry {
    pub value: NonNull<dyn Trace>,
    pub type_id: TypeId,
    pub storage: Storage,
    /// Bytes charged against the allocation tally.
    pub bytes: usize,
    /// Stack roots, protect-stack entries, global roots, borrow guards and
    /// pending-finalization holds.
    pub holders: u32,
    /// Incoming counted edges from other nodes.
    pub edges: u32,
    pub generation: u8,
    pub marked: bool,
    /// Live or pending weak references keyed on this node.
    pub weak_keys: u32,
    /// Set while this node is a weak reference that is live or pending.
    pub weak_active: bool,
}

impl NodeEntry {
    /// Whether nothing but the collector could still find this node.
    pub const fn is_moribund(&self) -> bool {
        self.holders == 0 && self.edges == 0 && self.weak_keys == 0 && !self.weak_active
    }
}

struct Slot {
    stamp: u32,
    entry: Option<NodeEntry>,
}

/// Slot table of live nodes.
#[derive(Default)]
pub(crate) struct NodeTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl NodeTable {
    pub fn insert(&mut self, entry: NodeEntry) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.entry.is_none());
            slot.entry = Some(entry);
            return NodeId::from_raw_parts(index, slot.stamp);
        }
        let index = u32::try_from(self.slots.len())
            .unwrap_or_else(|_| crate::error::fatal_error("node table exhausted"));
        self.slots.push(Slot {
            stamp: 0,
            entry: Some(entry),
        });
        NodeId::from_raw_parts(index, 0)
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeEntry> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.stamp == id.stamp())
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeEntry> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.stamp == id.stamp())
            .and_then(|slot| slot.entry.as_mut())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Remove a node, retiring its id.
    pub fn remove(&mut self, id: NodeId) -> Option<NodeEntry> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.stamp != id.stamp() {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.stamp = slot.stamp.wrapping_add(1);
        // A slot whose stamp has wrapped could resurrect an ancient id; retire it.
        if slot.stamp != 0 {
            self.free.push(id.slot());
        }
        self.live -= 1;
        Some(entry)
    }

    pub const fn len(&self) -> usize {
        self.live
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &NodeEntry)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let entry = slot.entry.as_ref()?;
            let index = u32::try_from(index).ok()?;
            Some((NodeId::from_raw_parts(index, slot.stamp), entry))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (NodeId, &mut NodeEntry)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let entry = slot.entry.as_mut()?;
            let index = u32::try_from(index).ok()?;
            Some((NodeId::from_raw_parts(index, slot.stamp), entry))
        })
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.iter().map(|(id, _)| id).collect()
    }
}
