//! Allocator benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use quilt_core::{GlobalHeap, HeapConfig};

fn bench_heap() -> GlobalHeap {
    GlobalHeap::new(HeapConfig {
        arena_bytes: 64 << 20,
        ..HeapConfig::default()
    })
}

fn bench_fill_drain_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 16384];
    let heap = bench_heap();
    let mut group = c.benchmark_group("fill_drain_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("miniheap", size), &size, |b, &sz| {
            b.iter(|| {
                let mh = heap.acquire_miniheap(sz);
                let addrs: Vec<usize> = std::iter::from_fn(|| mh.alloc_slot()).collect();
                heap.release_miniheap(mh);
                for addr in addrs {
                    heap.free(addr);
                }
            });
        });
    }
    group.finish();
}

fn bench_compact_fragmented(c: &mut Criterion) {
    let mut group = c.benchmark_group("compact");
    group.sample_size(10);

    group.bench_function("64_fragmented_miniheaps", |b| {
        b.iter(|| {
            let heap = bench_heap();
            let filled: Vec<(usize, Vec<usize>)> = (0..64)
                .map(|_| {
                    let mh = heap.acquire_miniheap(256);
                    let base = mh.span_start();
                    let mut addrs: Vec<usize> = std::iter::from_fn(|| mh.alloc_slot()).collect();
                    addrs.sort_unstable();
                    heap.release_miniheap(mh);
                    (base, addrs)
                })
                .collect();
            for (k, (_, addrs)) in filled.iter().enumerate() {
                for (slot, &addr) in addrs.iter().enumerate() {
                    if slot % 2 != k % 2 {
                        heap.free(addr);
                    }
                }
            }
            heap.mallctl("mesh.compact", None, None).unwrap();
            criterion::black_box(heap.stats().mesh_count);
        });
    });
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let heap = bench_heap();
    let mh = heap.acquire_miniheap(64);
    let addr = mh.alloc_slot().unwrap();

    c.bench_function("lookup_small", |b| {
        b.iter(|| criterion::black_box(heap.get_size(addr)));
    });

    heap.release_miniheap(mh);
    heap.free(addr);
}

criterion_group!(
    benches,
    bench_fill_drain_cycle,
    bench_compact_fragmented,
    bench_lookup
);
criterion_main!(benches);
