//! Basic allocation, borrowing and prompt reclamation tests for cellgc.

use cellgc::{Gc, GcEdge, GcStackRoot, Heap, NodeRef, Trace};

#[derive(Trace)]
struct Pair {
    left: GcEdge<Pair>,
    right: GcEdge<Pair>,
    tag: u32,
}

impl Pair {
    fn leaf(tag: u32) -> Self {
        Self {
            left: GcEdge::empty(),
            right: GcEdge::empty(),
            tag,
        }
    }
}

#[test]
fn test_basic_allocation() {
    let heap = Heap::new();
    let x = heap.alloc(42_i32).unwrap();
    assert_eq!(*heap.get(x).unwrap(), 42);
}

#[test]
fn test_deref() {
    let heap = Heap::new();
    let x = heap.alloc(String::from("hello")).unwrap();
    let root = GcStackRoot::new(&heap, Some(x));
    let s = root.borrow().unwrap();
    assert_eq!(&*s, "hello");
    assert_eq!(s.len(), 5);
}

#[test]
fn test_handles_are_copy() {
    let heap = Heap::new();
    let x = heap.alloc(1_u64).unwrap();
    let y = x;
    assert_eq!(x, y);
    assert_eq!(x.id(), y.id());
}

#[test]
fn test_guard_counts_as_holder() {
    let heap = Heap::new();
    let x = heap.alloc(7_u32).unwrap();
    assert_eq!(heap.ref_count(x.id()), Some(0));

    let guard = heap.get(x).unwrap();
    assert_eq!(heap.ref_count(x.id()), Some(1));
    let second = guard.clone();
    assert_eq!(heap.ref_count(x.id()), Some(2));
    assert_eq!(NodeRef::gc(&second), x);

    drop(second);
    assert_eq!(heap.ref_count(x.id()), Some(1));
    drop(guard);
    // Last holder gone, no edges: reclaimed on the spot.
    assert!(!heap.contains(x.id()));
    assert!(heap.get(x).is_none());
}

#[test]
fn test_fresh_node_survives_until_decrement() {
    let heap = Heap::new();
    let x = heap.alloc(1_u8).unwrap();
    let y = heap.alloc(2_u8).unwrap();
    // Nothing has touched the counts of either node yet.
    assert!(heap.contains(x.id()));
    assert!(heap.contains(y.id()));
    assert_eq!(heap.stats().node_count, 2);
}

#[test]
fn test_unrooted_node_is_swept() {
    let heap = Heap::new();
    let x = heap.alloc(1_u8).unwrap();
    heap.collect_full();
    assert!(!heap.contains(x.id()));
    assert_eq!(heap.stats().bytes_allocated, 0);
}

#[test]
fn test_chain_cascades_on_last_release() {
    let heap = Heap::new();
    let c = heap.alloc(Pair::leaf(3)).unwrap();
    let b = heap
        .alloc(Pair {
            left: GcEdge::new(Some(c)),
            ..Pair::leaf(2)
        })
        .unwrap();
    let a = heap
        .alloc(Pair {
            left: GcEdge::new(Some(b)),
            right: GcEdge::new(Some(c)),
            tag: 1,
        })
        .unwrap();
    assert_eq!(heap.edge_count(c.id()), Some(2));

    let root = GcStackRoot::new(&heap, Some(a));
    assert_eq!(heap.stats().node_count, 3);
    drop(root);
    assert_eq!(heap.stats().node_count, 0);
    assert_eq!(heap.stats().bytes_allocated, 0);
}

#[test]
fn test_shared_child_outlives_one_parent() {
    let heap = Heap::new();
    let shared = heap.alloc(Pair::leaf(0)).unwrap();
    let p1 = heap
        .alloc(Pair {
            left: GcEdge::new(Some(shared)),
            ..Pair::leaf(1)
        })
        .unwrap();
    let r1 = GcStackRoot::new(&heap, Some(p1));
    let p2 = heap
        .alloc(Pair {
            left: GcEdge::new(Some(shared)),
            ..Pair::leaf(2)
        })
        .unwrap();
    let r2 = GcStackRoot::new(&heap, Some(p2));

    drop(r2);
    assert!(!heap.contains(p2.id()));
    assert!(heap.contains(shared.id()));
    assert_eq!(heap.edge_count(shared.id()), Some(1));
    assert_eq!(heap.get(shared).unwrap().tag, 0);
    drop(r1);
    assert!(!heap.contains(shared.id()));
}

#[test]
fn test_different_size_classes() {
    let heap = Heap::new();
    let small = heap.alloc(42_u64).unwrap();
    let medium = heap.alloc([1_u64; 6]).unwrap();
    let large = heap.alloc([2_u64; 16]).unwrap();
    let huge = heap.alloc([3_u64; 100]).unwrap();

    let _r1 = GcStackRoot::new(&heap, Some(small));
    let _r2 = GcStackRoot::new(&heap, Some(medium));
    let _r3 = GcStackRoot::new(&heap, Some(large));
    let _r4 = GcStackRoot::new(&heap, Some(huge));
    assert_eq!(heap.stats().bytes_allocated, 8 + 48 + 128 + 800);
    heap.collect_full();
    assert_eq!(heap.get(huge).unwrap()[99], 3);
    assert_eq!(heap.get(medium).unwrap()[5], 1);
}

#[test]
fn test_stale_handle_never_resolves() {
    let heap = Heap::new();
    let old = heap.alloc(1_u32).unwrap();
    drop(heap.get(old));
    assert!(!heap.contains(old.id()));

    // The slot is reused with a new stamp.
    let new = heap.alloc(2_u32).unwrap();
    assert_ne!(old.id(), new.id());
    assert!(heap.get(old).is_none());
    assert_eq!(*heap.get(new).unwrap(), 2);
}

#[test]
fn test_type_mismatch_returns_none() {
    let heap = Heap::new();
    let x = heap.alloc(5_i32).unwrap();
    let wrong: Option<Gc<i64>> = heap.downcast(x.id());
    assert!(wrong.is_none());
    assert_eq!(heap.downcast::<i32>(x.id()), Some(x));
}

#[test]
fn test_drop_runs_once() {
    use std::cell::Cell;
    use std::rc::Rc;

    struct Counted(Rc<Cell<usize>>);
    unsafe impl Trace for Counted {
        fn trace(&self, _visitor: &mut dyn cellgc::Visitor) {}
    }
    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    let drops = Rc::new(Cell::new(0));
    {
        let heap = Heap::new();
        let x = heap.alloc(Counted(Rc::clone(&drops))).unwrap();
        let root = GcStackRoot::new(&heap, Some(x));
        heap.collect_full();
        assert_eq!(drops.get(), 0);
        drop(root);
        assert_eq!(drops.get(), 1);

        // Nodes still present when the heap goes are dropped with it.
        heap.alloc(Counted(Rc::clone(&drops))).unwrap();
    }
    assert_eq!(drops.get(), 2);
}

#[test]
fn test_heap_check_passes() {
    let heap = Heap::new();
    let nodes: Vec<_> = (0..100_u64).map(|i| heap.alloc(i).unwrap()).collect();
    let root = GcStackRoot::new(&heap, Some(nodes[0]));
    heap.collect_full();
    assert!(heap.check());
    assert_eq!(heap.stats().node_count, 1);
    drop(root);
}
