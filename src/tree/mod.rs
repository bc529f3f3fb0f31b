//! Concurrent Range Tree
//!
//! Binary search tree of disjoint, granted ranges, locked node by node
//! instead of as a whole.
//!
//! ## Responsibilities
//! - Store row locks with expected logarithmic insert, remove and search
//! - Let operations on unrelated ranges run without blocking each other
//! - Keep itself balanced with rotations done during descent
//!
//! ## Locking
//! ```text
//!            [root]            prepare(): root guard
//!           /      \
//!        [A]        [B]        acquire(r): hand-over-hand to the parent
//!       /   \                  of the first node overlapping r
//!     [C]   [D]                (or stay at the root when it overlaps)
//! ```
//! Guards are only ever taken parent before child. A `LockedKeyrange`
//! keeps its subtree root locked, so two handles on disjoint parts of the
//! keyspace proceed in parallel once their paths split.

mod keyrange;
mod node;
mod ops;

pub use keyrange::LockedKeyrange;
pub use node::RowLock;

use crate::range::{Comparator, KeyRange};

use node::{NodeArena, ROOT};

pub struct ConcurrentTree {
    arena: NodeArena,
    cmp: Comparator,
}

impl ConcurrentTree {
    /// Empty tree ordered by `cmp`
    pub fn new(cmp: Comparator) -> Self {
        Self::with_node_limit(cmp, None)
    }

    /// Empty tree that refuses to grow past `limit` nodes
    pub fn with_node_limit(cmp: Comparator, limit: Option<usize>) -> Self {
        Self {
            arena: NodeArena::new(limit),
            cmp,
        }
    }

    pub fn comparator(&self) -> &Comparator {
        &self.cmp
    }

    /// A handle on the root, ready for `acquire`
    pub fn prepare(&self) -> LockedKeyrange<'_> {
        LockedKeyrange::prepare(self)
    }

    pub fn is_empty(&self) -> bool {
        self.arena.lock(ROOT).is_empty()
    }

    /// Number of stored locks
    pub fn node_count(&self) -> usize {
        let root_used = !self.arena.lock(ROOT).is_empty();
        self.arena.live_nodes() + usize::from(root_used)
    }

    /// In-order snapshot of every stored lock
    pub fn row_locks(&self) -> Vec<RowLock> {
        self.prepare().overlapping_row_locks()
    }

    /// Copies of the locks overlapping `range`
    pub fn overlapping(&self, range: &KeyRange) -> Vec<RowLock> {
        let mut lkr = self.prepare();
        match lkr.acquire(range) {
            Ok(()) => lkr.overlapping_row_locks(),
            Err(_) => Vec::new(),
        }
    }

    /// Bytes one stored lock costs beyond its range
    pub fn node_overhead() -> usize {
        NodeArena::node_overhead()
    }
}

impl std::fmt::Debug for ConcurrentTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentTree")
            .field("cmp", &self.cmp)
            .field("nodes", &self.node_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::Key;
    use crate::types::LockMode;

    fn range(l: u64, r: u64) -> KeyRange {
        KeyRange::new(&Comparator::bytewise(), Key::from(l), Key::from(r)).unwrap()
    }

    fn insert(tree: &ConcurrentTree, l: u64, r: u64, txnid: u64) {
        let mut lkr = tree.prepare();
        lkr.acquire(&range(l, r)).unwrap();
        lkr.insert(RowLock::single(range(l, r), txnid, LockMode::Write))
            .unwrap();
    }

    #[test]
    fn test_ascending_inserts_stay_balanced() {
        let tree = ConcurrentTree::new(Comparator::bytewise());
        for i in 0..256u64 {
            insert(&tree, i * 10, i * 10 + 5, 1);
        }
        assert_eq!(tree.node_count(), 256);

        let locks = tree.row_locks();
        assert_eq!(locks.len(), 256);
        assert!(locks
            .windows(2)
            .all(|w| w[0].range.compare(tree.comparator(), &w[1].range)
                == crate::range::RangeComparison::LessThan));

        // A degenerate chain would be 256 deep
        let root = tree.arena.lock(ROOT);
        assert!(root.depth_estimate() < 40, "depth {}", root.depth_estimate());
    }

    #[test]
    fn test_acquire_stops_above_overlap() {
        let tree = ConcurrentTree::new(Comparator::bytewise());
        for i in 0..32u64 {
            insert(&tree, i * 10, i * 10 + 5, i);
        }
        let mut lkr = tree.prepare();
        lkr.acquire(&range(103, 123)).unwrap();
        let found: Vec<u64> = lkr
            .overlapping_row_locks()
            .iter()
            .filter_map(|l| l.holders.first())
            .collect();
        assert_eq!(found, vec![10, 11, 12]);
    }

    #[test]
    fn test_acquire_outside_held_range_is_rejected() {
        let tree = ConcurrentTree::new(Comparator::bytewise());
        let mut lkr = tree.prepare();
        lkr.acquire(&range(10, 20)).unwrap();
        assert!(lkr.acquire(&range(12, 14)).is_ok());
        assert!(lkr.acquire(&range(0, 30)).is_err());
    }

    #[test]
    fn test_remove_keeps_root_sentinel() {
        let tree = ConcurrentTree::new(Comparator::bytewise());
        insert(&tree, 1, 1, 1);
        insert(&tree, 2, 2, 1);

        let mut lkr = tree.prepare();
        lkr.acquire(&range(1, 1)).unwrap();
        assert!(lkr.remove(&range(1, 1)));
        assert!(!lkr.remove(&range(1, 1)));
        drop(lkr);

        let mut lkr = tree.prepare();
        lkr.acquire(&range(2, 2)).unwrap();
        assert!(lkr.remove(&range(2, 2)));
        drop(lkr);

        assert!(tree.is_empty());
        assert_eq!(tree.arena.live_nodes(), 0);
    }
}
