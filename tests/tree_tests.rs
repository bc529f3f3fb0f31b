//! Concurrent Range Tree Tests
//!
//! Tests verify:
//! - Ordered storage of disjoint ranges
//! - Removal by identity, never by overlap
//! - remove_all always leaves an empty tree
//! - Shared holders leave a node one at a time
//! - Node limits fail an insert without touching the tree
//! - Disjoint handles working concurrently

use proptest::prelude::*;
use rangelock::tree::{ConcurrentTree, RowLock};
use rangelock::{Comparator, Key, KeyRange, LockError, LockMode, Result, TxnIdSet};

// =============================================================================
// Helper Functions
// =============================================================================

fn range(l: u64, r: u64) -> KeyRange {
    KeyRange::new(&Comparator::bytewise(), Key::from(l), Key::from(r)).unwrap()
}

fn write_lock(l: u64, r: u64, txnid: u64) -> RowLock {
    RowLock::single(range(l, r), txnid, LockMode::Write)
}

fn new_tree() -> ConcurrentTree {
    ConcurrentTree::new(Comparator::bytewise())
}

fn insert(tree: &ConcurrentTree, lock: RowLock) -> Result<()> {
    let mut lkr = tree.prepare();
    lkr.acquire(&lock.range)?;
    lkr.insert(lock)
}

fn remove(tree: &ConcurrentTree, r: &KeyRange) -> bool {
    let mut lkr = tree.prepare();
    lkr.acquire(r).unwrap();
    lkr.remove(r)
}

fn stored_ranges(tree: &ConcurrentTree) -> Vec<KeyRange> {
    tree.row_locks().into_iter().map(|l| l.range).collect()
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_new_tree_is_empty() {
    let tree = new_tree();
    assert!(tree.is_empty());
    assert_eq!(tree.node_count(), 0);
    assert!(tree.row_locks().is_empty());
}

#[test]
fn test_insert_keeps_key_order() {
    let tree = new_tree();
    for l in [50u64, 10, 90, 30, 70, 20, 80] {
        insert(&tree, write_lock(l, l + 5, 1)).unwrap();
    }

    let expected: Vec<KeyRange> = [10u64, 20, 30, 50, 70, 80, 90]
        .iter()
        .map(|&l| range(l, l + 5))
        .collect();
    assert_eq!(stored_ranges(&tree), expected);
    assert_eq!(tree.node_count(), 7);
}

#[test]
fn test_overlapping_insert_is_rejected() {
    let tree = new_tree();
    insert(&tree, write_lock(5, 10, 1)).unwrap();

    let err = insert(&tree, write_lock(8, 12, 2)).unwrap_err();
    assert!(matches!(err, LockError::InvalidRange(_)));
    assert_eq!(stored_ranges(&tree), vec![range(5, 10)]);
}

#[test]
fn test_overlapping_returns_only_overlaps() {
    let tree = new_tree();
    for i in 0..20u64 {
        insert(&tree, write_lock(i * 10, i * 10 + 4, i)).unwrap();
    }

    let found: Vec<KeyRange> = tree
        .overlapping(&range(33, 61))
        .into_iter()
        .map(|l| l.range)
        .collect();
    assert_eq!(found, vec![range(40, 44), range(50, 54), range(60, 64)]);
    assert!(tree.overlapping(&range(45, 49)).is_empty());
}

// =============================================================================
// Removal Tests
// =============================================================================

#[test]
fn test_remove_by_identity_not_overlap() {
    let tree = new_tree();
    insert(&tree, write_lock(5, 10, 1)).unwrap();

    assert!(!remove(&tree, &range(5, 9)));
    assert!(!remove(&tree, &range(6, 10)));
    assert_eq!(tree.node_count(), 1);

    assert!(remove(&tree, &range(5, 10)));
    assert!(tree.is_empty());
}

#[test]
fn test_remove_missing_is_noop() {
    let tree = new_tree();
    assert!(!remove(&tree, &range(1, 1)));

    insert(&tree, write_lock(1, 1, 1)).unwrap();
    assert!(!remove(&tree, &range(2, 2)));
    assert_eq!(stored_ranges(&tree), vec![range(1, 1)]);
}

#[test]
fn test_remove_inner_nodes() {
    let tree = new_tree();
    for i in 0..64u64 {
        insert(&tree, write_lock(i * 2, i * 2, 1)).unwrap();
    }
    // Drop every other lock, including whatever sits near the top
    for i in (0..64u64).step_by(2) {
        assert!(remove(&tree, &range(i * 2, i * 2)));
    }

    let expected: Vec<KeyRange> = (0..64u64)
        .filter(|i| i % 2 == 1)
        .map(|i| range(i * 2, i * 2))
        .collect();
    assert_eq!(stored_ranges(&tree), expected);
    assert_eq!(tree.node_count(), 32);
}

#[test]
fn test_remove_all_empties_tree() {
    let tree = new_tree();
    for i in 0..100u64 {
        insert(&tree, write_lock(i * 3, i * 3 + 1, i % 7)).unwrap();
    }

    let mut lkr = tree.prepare();
    assert_eq!(lkr.remove_all(), 100);
    drop(lkr);

    assert!(tree.is_empty());
    assert_eq!(tree.node_count(), 0);

    // The tree is usable again afterwards
    insert(&tree, write_lock(1, 2, 1)).unwrap();
    assert_eq!(tree.node_count(), 1);
}

#[test]
fn test_remove_holder_keeps_shared_node() {
    let tree = new_tree();
    let shared: TxnIdSet = [1u64, 2].into_iter().collect();
    insert(&tree, RowLock::new(range(1, 5), shared, LockMode::Read)).unwrap();

    let mut lkr = tree.prepare();
    lkr.acquire(&range(1, 5)).unwrap();
    assert!(!lkr.remove_holder(&range(1, 5), 3));
    assert!(lkr.remove_holder(&range(1, 5), 1));
    drop(lkr);

    let locks = tree.row_locks();
    assert_eq!(locks.len(), 1);
    assert!(locks[0].holders.is_only(2));

    let mut lkr = tree.prepare();
    lkr.acquire(&range(1, 5)).unwrap();
    assert!(lkr.remove_holder(&range(1, 5), 2));
    drop(lkr);
    assert!(tree.is_empty());
}

// =============================================================================
// Resource Limit Tests
// =============================================================================

#[test]
fn test_node_limit_fails_without_changes() {
    // The root holds one lock on top of the limit
    let tree = ConcurrentTree::with_node_limit(Comparator::bytewise(), Some(2));
    for i in 0..3u64 {
        insert(&tree, write_lock(i * 10, i * 10 + 1, 1)).unwrap();
    }

    let err = insert(&tree, write_lock(100, 101, 1)).unwrap_err();
    assert!(matches!(err, LockError::OutOfMemory(_)));
    assert_eq!(
        stored_ranges(&tree),
        vec![range(0, 1), range(10, 11), range(20, 21)]
    );

    // Freed nodes count against the limit again
    assert!(remove(&tree, &range(10, 11)));
    insert(&tree, write_lock(100, 101, 1)).unwrap();
    assert_eq!(tree.node_count(), 3);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_disjoint_inserts() {
    let tree = new_tree();
    let tree = &tree;

    crossbeam::scope(|s| {
        for t in 0..8u64 {
            s.spawn(move |_| {
                for i in 0..200u64 {
                    let l = t * 100_000 + i * 10;
                    insert(tree, write_lock(l, l + 5, t)).unwrap();
                }
            });
        }
    })
    .unwrap();

    let locks = tree.row_locks();
    assert_eq!(locks.len(), 1600);
    assert_eq!(tree.node_count(), 1600);
    let cmp = Comparator::bytewise();
    for pair in locks.windows(2) {
        assert!(cmp.compare(pair[0].range.right(), pair[1].range.left()).is_lt());
    }
}

#[test]
fn test_concurrent_insert_and_remove() {
    let tree = new_tree();
    let tree = &tree;

    crossbeam::scope(|s| {
        for t in 0..8u64 {
            s.spawn(move |_| {
                for round in 0..20u64 {
                    let base = t * 100_000 + round * 1000;
                    for i in 0..10u64 {
                        insert(tree, write_lock(base + i * 10, base + i * 10 + 1, t)).unwrap();
                    }
                    for i in 0..10u64 {
                        assert!(remove(tree, &range(base + i * 10, base + i * 10 + 1)));
                    }
                }
            });
        }
    })
    .unwrap();

    assert!(tree.is_empty());
    assert_eq!(tree.node_count(), 0);
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #[test]
    fn prop_disjoint_operations_are_order_independent(
        ops in proptest::collection::vec((0u64..64, any::<bool>()), 1..200)
    ) {
        let tree = new_tree();
        let mut live = std::collections::BTreeSet::new();
        for (key, is_insert) in ops {
            let r = range(key * 4, key * 4 + 2);
            if is_insert {
                if live.insert(key) {
                    insert(&tree, write_lock(key * 4, key * 4 + 2, key)).unwrap();
                }
            } else if live.remove(&key) {
                prop_assert!(remove(&tree, &r));
            } else {
                prop_assert!(!remove(&tree, &r));
            }
        }

        // Same survivors, inserted from scratch
        let fresh = new_tree();
        for &key in &live {
            insert(&fresh, write_lock(key * 4, key * 4 + 2, key)).unwrap();
        }
        prop_assert_eq!(tree.row_locks(), fresh.row_locks());
        prop_assert_eq!(tree.node_count(), live.len());
    }

    #[test]
    fn prop_remove_all_always_empties(
        keys in proptest::collection::btree_set(0u64..1000, 0..150),
        removed in proptest::collection::vec(0u64..1000, 0..50),
    ) {
        let tree = new_tree();
        for &key in &keys {
            insert(&tree, write_lock(key * 2, key * 2, 1)).unwrap();
        }
        for key in removed {
            remove(&tree, &range(key * 2, key * 2));
        }

        let mut lkr = tree.prepare();
        lkr.remove_all();
        drop(lkr);
        prop_assert!(tree.is_empty());
        prop_assert_eq!(tree.node_count(), 0);
    }
}
