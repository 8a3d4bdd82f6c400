//! Allocation-path benchmarks.
//!
//! Measures the hot allocate/deallocate cycle at representative sizes and
//! the constant-time address queries.

use criterion::{criterion_group, criterion_main, Criterion};
use qmalloc_core::{HeapConfig, NativeAllocator};

fn bench_allocate_small(c: &mut Criterion) {
    let allocator = NativeAllocator::create(HeapConfig::default()).expect("create");
    c.bench_function("allocate_free_8", |b| {
        b.iter(|| {
            let address = allocator.allocate(8);
            criterion::black_box(address);
            allocator.deallocate(address);
        });
    });
}

fn bench_allocate_medium(c: &mut Criterion) {
    let allocator = NativeAllocator::create(HeapConfig::default()).expect("create");
    c.bench_function("allocate_free_4k", |b| {
        b.iter(|| {
            let address = allocator.allocate(4096);
            criterion::black_box(address);
            allocator.deallocate(address);
        });
    });
}

fn bench_allocate_shared(c: &mut Criterion) {
    let config = HeapConfig::default().with_shared(true);
    let allocator = NativeAllocator::create(config).expect("create");
    c.bench_function("allocate_free_8_shared", |b| {
        b.iter(|| {
            let address = allocator.allocate(8);
            criterion::black_box(address);
            allocator.deallocate(address);
        });
    });
}

fn bench_allocation_size(c: &mut Criterion) {
    let allocator = NativeAllocator::create(HeapConfig::default()).expect("create");
    let address = allocator.allocate(100);
    c.bench_function("allocation_size", |b| {
        b.iter(|| {
            criterion::black_box(allocator.allocation_size(address + 17));
        });
    });
}

criterion_group!(
    benches,
    bench_allocate_small,
    bench_allocate_medium,
    bench_allocate_shared,
    bench_allocation_size
);
criterion_main!(benches);
