//! Collection policy: thresholds, tallies, reporting and hooks.

use std::cell::{Cell, RefCell};
use std::io::{self, Write};
use std::rc::Rc;

use cellgc::{GcStackRoot, Heap, HeapConfig};

/// A reporting sink whose output the test can read back.
#[derive(Clone, Default)]
struct SharedSink(Rc<RefCell<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct BrokenSink;

impl Write for BrokenSink {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_initial_stats() {
    let heap = Heap::with_config(HeapConfig {
        initial_threshold: 4096,
        ..HeapConfig::default()
    });
    let stats = heap.stats();
    assert_eq!(stats.bytes_allocated, 0);
    assert_eq!(stats.node_count, 0);
    assert_eq!(stats.collections, 0);
    assert_eq!(stats.trigger_level, 4096);
}

#[test]
fn test_initial_threshold_clamped_to_max() {
    let heap = Heap::with_config(HeapConfig {
        initial_threshold: 10_000,
        max_threshold: 2_000,
        ..HeapConfig::default()
    });
    assert_eq!(heap.stats().trigger_level, 2_000);
}

#[test]
fn test_threshold_tracks_live_data() {
    let heap = Heap::with_config(HeapConfig {
        initial_threshold: 1024,
        ..HeapConfig::default()
    });
    let big = heap.alloc([0_u64; 100]).unwrap();
    let _root = GcStackRoot::new(&heap, Some(big));
    heap.adjust_threshold(50);
    assert_eq!(heap.stats().trigger_level, 2 * 800 + 50);

    heap.collect_full();
    assert_eq!(heap.stats().trigger_level, 2 * 800);
}

#[test]
fn test_allocation_cue_counts_whole_cells() {
    let heap = Heap::with_config(HeapConfig {
        initial_threshold: 20,
        ..HeapConfig::default()
    });
    let a = heap.alloc(1_u8).unwrap();
    heap.protect(Some(a.id()));
    let b = heap.alloc(2_u8).unwrap();
    heap.protect(Some(b.id()));
    assert_eq!(heap.stats().bytes_allocated, 16);
    assert_eq!(heap.stats().collections, 0);

    // One more byte would fit under the threshold, but the node costs a
    // whole 8-byte cell: 16 + 8 > 20.
    let c = heap.alloc(3_u8).unwrap();
    assert_eq!(heap.stats().collections, 1);
    assert_eq!(heap.stats().bytes_allocated, 24);
    assert!(heap.contains(c.id()));
    heap.unprotect(2).unwrap();
}

#[test]
fn test_high_water_marks() {
    let heap = Heap::new();
    let nodes: Vec<_> = (0..10_u64).map(|i| heap.alloc(i).unwrap()).collect();
    heap.collect_full();
    let stats = heap.stats();
    // Sampled at the start of the collection.
    assert_eq!(stats.max_nodes, 10);
    assert_eq!(stats.max_bytes, 80);
    assert_eq!(stats.node_count, 0);

    heap.reset_max_tallies();
    let stats = heap.stats();
    assert_eq!(stats.max_nodes, 0);
    assert_eq!(stats.max_bytes, 0);
    assert!(nodes.iter().all(|n| !heap.contains(n.id())));
}

#[test]
fn test_reporting_sink_receives_one_line_per_collection() {
    let heap = Heap::new();
    let sink = SharedSink::default();
    assert!(heap.set_reporting(Some(Box::new(sink.clone()))).is_none());

    heap.alloc(1_u8).unwrap();
    heap.collect_full();
    heap.collect();

    let text = String::from_utf8(sink.0.borrow().clone()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("GC (full): reclaimed 1 nodes (8 bytes)"));
    assert!(lines[1].starts_with("GC (minor)"));

    assert!(heap.set_reporting(None).is_some());
    heap.collect();
    assert_eq!(sink.0.borrow().len(), text.len());
}

#[test]
fn test_failing_sink_is_dropped() {
    let heap = Heap::new();
    heap.set_reporting(Some(Box::new(BrokenSink)));
    heap.collect();
    // The broken sink was discarded after its first failure.
    assert!(heap.set_reporting(None).is_none());
}

thread_local! {
    static EVENTS: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
    static PRE_RUNS: Cell<usize> = const { Cell::new(0) };
}

fn pre_gc() {
    EVENTS.with(|events| events.borrow_mut().push("pre"));
    PRE_RUNS.with(|runs| runs.set(runs.get() + 1));
}

fn post_gc() {
    EVENTS.with(|events| events.borrow_mut().push("post"));
}

#[test]
fn test_hooks_bracket_each_collection() {
    let heap = Heap::new();
    heap.set_gc_hooks(Some(pre_gc), Some(post_gc));
    heap.collect();
    heap.collect_full();
    EVENTS.with(|events| assert_eq!(*events.borrow(), vec!["pre", "post", "pre", "post"]));

    heap.set_gc_hooks(None, None);
    heap.collect();
    assert_eq!(PRE_RUNS.with(Cell::get), 2);
}

#[test]
fn test_heap_debug() {
    let heap = Heap::new();
    heap.alloc(1_u32).unwrap();
    let text = format!("{heap:?}");
    assert!(text.contains("nodes: 1"));
}
