//! Criterion benchmarks for the core tree operations.
//!
//! ```bash
//! cargo bench --bench tree
//! ```

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use blinktree::{BLinkTree, PayloadRef};

fn payload(raw: u64) -> PayloadRef {
    PayloadRef::new(raw).expect("non-zero payload")
}

fn prefilled(n: i64) -> BLinkTree {
    let tree = BLinkTree::new();
    for k in 0..n {
        tree.insert(k, payload(k as u64 + 1));
    }
    tree
}

fn bench_insert_sequential(c: &mut Criterion) {
    c.bench_function("insert_sequential_10k", |b| {
        b.iter_batched(
            BLinkTree::new,
            |tree| {
                for k in 0..10_000i64 {
                    tree.insert(k, payload(k as u64 + 1));
                }
                tree
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_insert_scrambled(c: &mut Criterion) {
    // Multiplicative scramble, same key set as the sequential run.
    let keys: Vec<i64> = (0..10_000i64).map(|k| (k * 7919) % 10_000).collect();
    c.bench_function("insert_scrambled_10k", |b| {
        b.iter_batched(
            BLinkTree::new,
            |tree| {
                for &k in &keys {
                    tree.insert(k, payload(k as u64 + 1));
                }
                tree
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_get_hit(c: &mut Criterion) {
    let tree = prefilled(100_000);
    let mut k: i64 = 0;
    c.bench_function("get_hit", |b| {
        b.iter(|| {
            k = (k + 7919) % 100_000;
            black_box(tree.get(black_box(k)))
        });
    });
}

fn bench_scan_range(c: &mut Criterion) {
    let tree = prefilled(100_000);
    let mut out = Vec::with_capacity(128);
    let mut lo: i64 = 0;
    c.bench_function("scan_range_100", |b| {
        b.iter(|| {
            lo = (lo + 997) % 99_000;
            out.clear();
            black_box(tree.scan_range(lo, lo + 101, &mut out))
        });
    });
}

fn bench_remove_insert_churn(c: &mut Criterion) {
    let tree = prefilled(10_000);
    let mut k: i64 = 0;
    c.bench_function("remove_insert_churn", |b| {
        b.iter(|| {
            k = (k + 37) % 10_000;
            tree.remove(black_box(k));
            tree.insert(k, payload(k as u64 + 1));
        });
    });
}

criterion_group!(
    benches,
    bench_insert_sequential,
    bench_insert_scrambled,
    bench_get_hit,
    bench_scan_range,
    bench_remove_insert_churn,
);
criterion_main!(benches);
