//! Benchmark: full collection pause time
//!
//! Measures the pause of a full collection over a heap where half of the
//! objects are garbage, for the parallel collector at several worker counts
//! and for the serial collector.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use parcompact::{
    CompactConfig, GcCause, HeaderLayout, Heap, HeapLayout, HeapWord, MarkSweepCompact,
    ParallelCompact, RootSet, SpaceId,
};
use std::hint::black_box;
use std::time::{Duration, Instant};

const REGION_LOG: u32 = 9;
const BLOCK_LOG: u32 = 7;
const REGION_WORDS: usize = 1 << REGION_LOG;

fn layout() -> HeapLayout {
    HeapLayout::old_only(512 * REGION_WORDS).with_young(256 * REGION_WORDS, 32 * REGION_WORDS, 32 * REGION_WORDS)
}

/// Reset every space and fill old and eden with a linked list where every
/// other object is unreachable.
fn populate(heap: &Heap, objects: usize) -> RootSet {
    for space in heap.spaces() {
        space.set_top(space.bottom());
    }
    let roots = RootSet::new();
    let mut prev = HeapWord::NULL;
    for i in 0..objects {
        let space = if i < objects / 2 { SpaceId::Old } else { SpaceId::Eden };
        let data = 1 + i % 13;
        let Some(obj) = HeaderLayout::allocate(heap, space, 1, data) else {
            break;
        };
        if i % 2 == 0 {
            if prev.is_null() {
                roots.push(obj);
            } else {
                HeaderLayout::set_ref(heap, prev, 0, obj);
            }
            prev = obj;
        }
    }
    roots
}

fn bench_parallel(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_full_gc");
    for workers in [1, 2, 4, 8] {
        let config = CompactConfig::new(workers).with_region_size(REGION_LOG, BLOCK_LOG);
        let heap = Heap::new(layout(), REGION_WORDS).expect("heap reservation");
        let mut pc = ParallelCompact::new(heap, HeaderLayout, config).expect("collector setup");
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter_custom(|iterations| {
                let mut total = Duration::ZERO;
                for _ in 0..iterations {
                    let roots = populate(pc.heap(), 20_000);
                    let start = Instant::now();
                    black_box(pc.invoke(&roots, GcCause::Explicit, false));
                    total += start.elapsed();
                }
                total
            });
        });
    }
    group.finish();
}

fn bench_serial(c: &mut Criterion) {
    let heap = Heap::new(layout(), REGION_WORDS).expect("heap reservation");
    let mut msc = MarkSweepCompact::new(&heap, HeaderLayout).expect("collector setup");
    c.bench_function("serial_full_gc", |b| {
        b.iter_custom(|iterations| {
            let mut total = Duration::ZERO;
            for _ in 0..iterations {
                let roots = populate(&heap, 20_000);
                let start = Instant::now();
                black_box(msc.invoke(&heap, &roots, GcCause::Explicit));
                total += start.elapsed();
            }
            total
        });
    });
}

criterion_group!(benches, bench_parallel, bench_serial);
criterion_main!(benches);
