//! Mark-sweep collection: reachability, cycles and the allocation cue.

use std::cell::Cell;
use std::rc::Rc;

use cellgc::{CollectionType, EdgeList, Gc, GcEdge, GcStackRoot, Heap, HeapConfig, Trace, Visitor};

#[derive(Trace)]
struct Node {
    name: &'static str,
    next: GcEdge<Node>,
}

fn node(heap: &Heap, name: &'static str, next: Option<Gc<Node>>) -> Gc<Node> {
    heap.alloc(Node {
        name,
        next: GcEdge::new(next),
    })
    .unwrap()
}

#[test]
fn test_reachable_survive_unreachable_reclaimed() {
    let heap = Heap::new();
    let b = node(&heap, "b", None);
    let a = node(&heap, "a", Some(b));
    let root = GcStackRoot::new(&heap, Some(a));
    let c = node(&heap, "c", None);

    heap.collect_full();
    assert!(heap.contains(a.id()));
    assert!(heap.contains(b.id()));
    assert!(!heap.contains(c.id()));

    let metrics = heap.last_gc_metrics();
    assert_eq!(metrics.objects_reclaimed, 1);
    assert_eq!(metrics.objects_surviving, 2);
    assert_eq!(metrics.collection_type, CollectionType::Full);
    assert_eq!(heap.get(b).unwrap().name, "b");
    drop(root);
}

#[test]
fn test_self_cycle() {
    let heap = Heap::new();
    let a = node(&heap, "a", None);
    {
        let a_ref = heap.get(a).unwrap();
        a_ref.next.set(&heap, Some(a));
    }
    // Its own edge keeps it from prompt reclamation.
    assert!(heap.contains(a.id()));
    heap.collect_full();
    assert!(!heap.contains(a.id()));
}

#[test]
fn test_long_cycle_with_rooted_entry() {
    let heap = Heap::new();
    let first = node(&heap, "0", None);
    let root = GcStackRoot::new(&heap, Some(first));
    let mut last = first;
    for _ in 0..50 {
        last = node(&heap, "n", Some(last));
        heap.protect(Some(last.id()));
    }
    heap.get(first).unwrap().next.set(&heap, Some(last));
    heap.unprotect(50).unwrap();

    heap.collect_full();
    assert_eq!(heap.stats().node_count, 51);
    drop(root);
    assert_eq!(heap.stats().node_count, 51);
    heap.collect_full();
    assert_eq!(heap.stats().node_count, 0);
}

#[test]
fn test_cycle_reachable_from_cycle_garbage() {
    #[derive(Trace)]
    struct Fan {
        children: EdgeList<Fan>,
    }

    let heap = Heap::new();
    let hub = heap.alloc(Fan { children: EdgeList::new() }).unwrap();
    let hub_root = GcStackRoot::new(&heap, Some(hub));
    let hub_ref = heap.get(hub).unwrap();
    for _ in 0..10 {
        let child = heap
            .alloc(Fan {
                children: EdgeList::from_targets([hub]),
            })
            .unwrap();
        hub_ref.children.push(&heap, child);
    }
    drop(hub_ref);
    assert_eq!(heap.edge_count(hub.id()), Some(10));

    drop(hub_root);
    heap.collect_full();
    assert_eq!(heap.stats().node_count, 0);
}

#[test]
fn test_dropped_and_detached_during_sweep() {
    struct Noisy {
        next: GcEdge<Noisy>,
        drops: Rc<Cell<usize>>,
    }
    unsafe impl Trace for Noisy {
        fn trace(&self, visitor: &mut dyn Visitor) {
            self.next.trace(visitor);
        }
        fn detach(&self) {
            self.next.detach();
        }
    }
    impl Drop for Noisy {
        fn drop(&mut self) {
            // Edges are severed before any destructor runs.
            assert!(self.next.get().is_none());
            self.drops.set(self.drops.get() + 1);
        }
    }

    let drops = Rc::new(Cell::new(0));
    let heap = Heap::new();
    let a = heap
        .alloc(Noisy {
            next: GcEdge::empty(),
            drops: Rc::clone(&drops),
        })
        .unwrap();
    let a_root = GcStackRoot::new(&heap, Some(a));
    let b = heap
        .alloc(Noisy {
            next: GcEdge::new(Some(a)),
            drops: Rc::clone(&drops),
        })
        .unwrap();
    heap.get(a).unwrap().next.set(&heap, Some(b));
    drop(a_root);

    heap.collect_full();
    assert_eq!(drops.get(), 2);
}

#[test]
fn test_allocation_cues_collection() {
    let heap = Heap::with_config(HeapConfig {
        initial_threshold: 1024,
        ..HeapConfig::default()
    });
    let keep = heap.alloc([0_u64; 4]).unwrap();
    let _root = GcStackRoot::new(&heap, Some(keep));

    for i in 0..200_u64 {
        heap.alloc(i).unwrap();
    }
    let stats = heap.stats();
    assert!(stats.collections > 0);
    assert!(stats.bytes_allocated <= stats.trigger_level);
    assert!(heap.contains(keep.id()));
}

#[test]
fn test_torture_collects_at_every_allocation() {
    let heap = Heap::with_config(HeapConfig {
        torture: true,
        ..HeapConfig::default()
    });
    assert!(heap.is_tortured());
    let a = node(&heap, "a", None);
    let root = GcStackRoot::new(&heap, Some(a));
    let garbage = node(&heap, "g", None);
    assert_eq!(heap.stats().collections, 2);
    node(&heap, "h", None);
    assert!(!heap.contains(garbage.id()));
    assert!(heap.contains(a.id()));
    assert_eq!(heap.last_gc_metrics().collection_type, CollectionType::Full);

    heap.set_torture(false);
    node(&heap, "i", None);
    assert_eq!(heap.stats().collections, 3);
    drop(root);
}

#[test]
fn test_referents_of_new_node_survive_cued_collection() {
    let heap = Heap::with_config(HeapConfig {
        torture: true,
        ..HeapConfig::default()
    });
    let child = node(&heap, "child", None);
    // `child` is unrooted; allocating its parent must still keep it.
    let parent = node(&heap, "parent", Some(child));
    let _root = GcStackRoot::new(&heap, Some(parent));
    assert!(heap.contains(child.id()));
    assert_eq!(heap.edge_count(child.id()), Some(1));
}

#[test]
#[should_panic(expected = "during garbage collection")]
fn test_allocating_from_a_hook_is_fatal() {
    thread_local! {
        static HEAP: Heap = Heap::new();
    }
    fn hook() {
        HEAP.with(|heap| {
            let _ = heap.alloc(1_u8);
        });
    }
    HEAP.with(|heap| {
        heap.set_gc_hooks(Some(hook), None);
        heap.collect();
    });
}
