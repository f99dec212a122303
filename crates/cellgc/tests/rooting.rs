//! Scoped roots and global roots.

use cellgc::{GcEdge, GcStackRoot, Heap, Trace};

#[derive(Trace)]
struct Node {
    value: i64,
    next: GcEdge<Node>,
}

fn node(heap: &Heap, value: i64) -> cellgc::Gc<Node> {
    heap.alloc(Node {
        value,
        next: GcEdge::empty(),
    })
    .unwrap()
}

#[test]
fn test_stack_root_keeps_node_across_collections() {
    let heap = Heap::new();
    let n = node(&heap, 1);
    let root = GcStackRoot::new(&heap, Some(n));
    for _ in 0..5 {
        heap.collect_full();
    }
    assert_eq!(root.borrow().unwrap().value, 1);
    assert_eq!(heap.stack_root_depth(), 1);
}

#[test]
fn test_nested_roots_release_in_order() {
    let heap = Heap::new();
    let outer = node(&heap, 1);
    let outer_root = GcStackRoot::new(&heap, Some(outer));
    {
        let inner = node(&heap, 2);
        let _inner_root = GcStackRoot::new(&heap, Some(inner));
        assert_eq!(heap.stack_root_depth(), 2);
        heap.collect_full();
        assert!(heap.contains(inner.id()));
    }
    assert_eq!(heap.stack_root_depth(), 1);
    heap.collect_full();
    assert_eq!(heap.stats().node_count, 1);
    drop(outer_root);
    assert_eq!(heap.stack_root_depth(), 0);
}

#[test]
fn test_empty_root_and_retarget() {
    let heap = Heap::new();
    let root: GcStackRoot<'_, Node> = GcStackRoot::new(&heap, None);
    assert!(root.get().is_none());
    assert!(root.borrow().is_none());

    let a = node(&heap, 1);
    root.set(Some(a));
    assert_eq!(heap.ref_count(a.id()), Some(1));

    let b = node(&heap, 2);
    root.set(Some(b));
    // `a` lost its only holder.
    assert!(!heap.contains(a.id()));
    assert_eq!(root.get(), Some(b));

    root.set(None);
    assert!(!heap.contains(b.id()));
}

#[test]
fn test_root_protects_whole_structure() {
    let heap = Heap::new();
    let tail = node(&heap, 3);
    let mid = heap
        .alloc(Node {
            value: 2,
            next: GcEdge::new(Some(tail)),
        })
        .unwrap();
    let head = heap
        .alloc(Node {
            value: 1,
            next: GcEdge::new(Some(mid)),
        })
        .unwrap();
    let root = GcStackRoot::new(&heap, Some(head));
    heap.collect_full();

    let mut values = Vec::new();
    let mut cursor = root.get();
    while let Some(gc) = cursor {
        let n = heap.get(gc).unwrap();
        values.push(n.value);
        cursor = n.next.get();
    }
    assert_eq!(values, vec![1, 2, 3]);
}

#[test]
#[should_panic(expected = "reverse order of creation")]
fn test_out_of_order_release_is_fatal() {
    let heap = Heap::new();
    let first = GcStackRoot::new(&heap, Some(node(&heap, 1)));
    let second = GcStackRoot::new(&heap, Some(node(&heap, 2)));
    drop(first);
    drop(second);
}

#[test]
fn test_preserve_survives_collection() {
    let heap = Heap::new();
    let n = node(&heap, 9);
    heap.preserve(n.id());
    heap.collect_full();
    assert!(heap.contains(n.id()));
    assert!(heap.release(n.id()));
    assert!(!heap.contains(n.id()));
}

#[test]
fn test_preserve_ignores_dead_nodes() {
    let heap = Heap::new();
    let n = node(&heap, 9);
    heap.collect_full();
    heap.preserve(n.id());
    assert!(!heap.release(n.id()));
}

#[test]
fn test_root_debug_shows_target() {
    let heap = Heap::new();
    let n = node(&heap, 1);
    let root = GcStackRoot::new(&heap, Some(n));
    let text = format!("{root:?}");
    assert!(text.starts_with("GcStackRoot"));
}
