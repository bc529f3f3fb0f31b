//! Benchmarks for rangelock operations

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rangelock::{
    get_range_lock, Comparator, Key, KeyRange, LockMode, LockPolicy, Locktree, LocktreeManager,
    ManagerConfig, RangeBuffer, Transaction, TxnIdSet, TxnRegistry,
};

fn point(n: u64) -> KeyRange {
    KeyRange::point(Key::from(n))
}

fn locktree_benchmarks(c: &mut Criterion) {
    c.bench_function("acquire_release_1000_points", |b| {
        b.iter_batched(
            || Locktree::new(1, Comparator::bytewise()),
            |lt| {
                let mut conflicts = TxnIdSet::new();
                let mut ranges = RangeBuffer::new();
                for i in 0..1000u64 {
                    let range = point(i * 7919 % 1000);
                    lt.acquire_write_lock(1, &range, &mut conflicts, false)
                        .unwrap();
                    ranges.append(range);
                }
                lt.release_locks(1, &ranges);
                black_box(lt.is_empty())
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("conflict_probe_10000_locks", |b| {
        let lt = Locktree::new(1, Comparator::bytewise());
        let mut conflicts = TxnIdSet::new();
        for i in 0..10_000u64 {
            lt.acquire_write_lock(i, &point(i * 2), &mut conflicts, false)
                .unwrap();
        }
        let mut key = 0u64;
        b.iter(|| {
            key = (key + 7919) % 20_000;
            black_box(lt.get_conflicts(u64::MAX, &point(key), LockMode::Read))
        })
    });

    c.bench_function("escalate_10000_points", |b| {
        b.iter_batched(
            || {
                let lt = Locktree::new(1, Comparator::bytewise());
                let mut conflicts = TxnIdSet::new();
                for i in 0..10_000u64 {
                    lt.acquire_write_lock(i / 2500, &point(i * 2), &mut conflicts, false)
                        .unwrap();
                }
                lt
            },
            |lt| black_box(lt.escalate(None)),
            BatchSize::LargeInput,
        )
    });

    c.bench_function("transaction_get_range_lock", |b| {
        let registry = Arc::new(TxnRegistry::new());
        let policy = LockPolicy::new().with_range_set_listener(registry.clone());
        let manager = LocktreeManager::new(ManagerConfig::default(), policy).unwrap();
        let lt = manager.get_or_create(1, Comparator::bytewise(), |_| {});
        let mut key = 0u64;
        b.iter(|| {
            let txn = Transaction::begin(&manager, &registry);
            for _ in 0..8 {
                key = (key + 7919) % 100_000;
                get_range_lock(&txn, &lt, Key::from(key), Key::from(key + 4), LockMode::Write)
                    .unwrap();
            }
            txn.commit();
        });
        manager.release_lt(&lt);
    });
}

criterion_group!(benches, locktree_benchmarks);
criterion_main!(benches);
