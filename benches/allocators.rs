use criterion::{black_box, criterion_group, criterion_main, Criterion};

use carve::{BlockAlloc, Checked, NoConstruct, Region, RegionAlloc, SingleType, ThreadSafe};

fn bench_block_pairs(c: &mut Criterion) {
    type Bench = BlockAlloc<u64, 8192, ThreadSafe, NoConstruct, true, 9000>;

    let allocator = Bench::new();

    c.bench_function("block_alloc_dealloc_pair", |b| {
        b.iter(|| {
            let run = allocator.alloc(black_box(16)).unwrap();
            unsafe { allocator.dealloc(run, 16) };
        });
    });

    c.bench_function("block_oversize_pair", |b| {
        b.iter(|| {
            let run = allocator.alloc(black_box(10_000)).unwrap();
            unsafe { allocator.dealloc(run, 10_000) };
        });
    });
}

fn bench_region_bump(c: &mut Criterion) {
    let region = Region::new(64 * 1024 * 1024).unwrap();
    let allocator = RegionAlloc::<Checked, SingleType>::new(&region);

    c.bench_function("region_bump_16_u64", |b| {
        b.iter(|| {
            if allocator.alloc::<u64>(black_box(16)).is_none() {
                region.clear();
            }
        });
    });
}

criterion_group!(benches, bench_block_pairs, bench_region_bump);
criterion_main!(benches);
