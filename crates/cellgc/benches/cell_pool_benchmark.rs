//! Benchmark: cell pool fast path, prompt reclamation and collection pauses.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use cellgc::{CellPool, GcEdge, GcStackRoot, Heap, HeapConfig, Trace};

#[derive(Trace)]
struct Node {
    value: i64,
    next: GcEdge<Node>,
}

fn quiet_heap() -> Heap {
    Heap::with_config(HeapConfig {
        initial_threshold: usize::MAX,
        ..HeapConfig::default()
    })
}

fn bench_pool_allocate_deallocate(c: &mut Criterion) {
    c.bench_function("cell_pool_allocate_deallocate", |b| {
        let mut pool = CellPool::new(2, 512);
        // Warm the pool so the loop measures the free-list fast path.
        let warm = pool.allocate().unwrap();
        unsafe { pool.deallocate(warm.as_ptr()) };
        b.iter(|| {
            let cell = pool.allocate().unwrap();
            black_box(cell);
            unsafe { pool.deallocate(cell.as_ptr()) };
        });
    });
}

fn bench_pool_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("cell_pool_fill");
    for cells in [100_usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(cells), &cells, |b, &cells| {
            b.iter(|| {
                let mut pool = CellPool::new(4, 256);
                let mut live = Vec::with_capacity(cells);
                for _ in 0..cells {
                    live.push(pool.allocate().unwrap());
                }
                for cell in live.drain(..) {
                    unsafe { pool.deallocate(cell.as_ptr()) };
                }
                black_box(pool.superblock_count());
            });
        });
    }
    group.finish();
}

fn bench_prompt_reclamation(c: &mut Criterion) {
    c.bench_function("release_chain_1000", |b| {
        let heap = quiet_heap();
        b.iter(|| {
            let head = heap.alloc(Node { value: 0, next: GcEdge::empty() }).unwrap();
            let root = GcStackRoot::new(&heap, Some(head));
            for value in 1..1000 {
                let next = heap
                    .alloc(Node {
                        value,
                        next: GcEdge::new(root.get()),
                    })
                    .unwrap();
                root.set(Some(next));
            }
            // Releasing the root frees the whole chain by counting alone.
            drop(root);
            black_box(heap.stats().node_count);
        });
    });
}

fn bench_pause_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("pause_time_cycles");
    for nodes in [100_i64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |b, &nodes| {
            let heap = quiet_heap();
            b.iter(|| {
                // Two-node cycles survive counting and must be swept.
                for value in 0..nodes / 2 {
                    let a = heap.alloc(Node { value, next: GcEdge::empty() }).unwrap();
                    let root = GcStackRoot::new(&heap, Some(a));
                    let partner = heap
                        .alloc(Node {
                            value,
                            next: GcEdge::new(Some(a)),
                        })
                        .unwrap();
                    heap.get(a).unwrap().next.set(&heap, Some(partner));
                    drop(root);
                }
                heap.collect_full();
                black_box(heap.last_gc_metrics().duration);
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_pool_allocate_deallocate,
    bench_pool_fill,
    bench_prompt_reclamation,
    bench_pause_time
);
criterion_main!(benches);
