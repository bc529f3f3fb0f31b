//! Locked keyrange handle
//!
//! A `LockedKeyrange` owns the guard on the one subtree root below which
//! every stored range overlapping its acquired range lives. Dropping the
//! handle releases that guard.

use std::fmt;

use crate::error::{LockError, Result};
use crate::range::KeyRange;
use crate::types::TxnId;

use super::node::{NodeGuard, RowLock, ROOT};
use super::ops::{Removal, RemoveOutcome};
use super::ConcurrentTree;

pub struct LockedKeyrange<'a> {
    tree: &'a ConcurrentTree,
    subtree: NodeGuard,
    range: KeyRange,
}

impl<'a> LockedKeyrange<'a> {
    /// Attach to the root; nothing is narrowed yet
    pub(super) fn prepare(tree: &'a ConcurrentTree) -> Self {
        Self {
            tree,
            subtree: tree.arena.lock(ROOT),
            range: KeyRange::infinite(),
        }
    }

    /// Narrow the claim to `range`, descending hand-over-hand
    ///
    /// `range` must lie inside the range already held; a fresh handle holds
    /// the whole keyspace.
    pub fn acquire(&mut self, range: &KeyRange) -> Result<()> {
        if !self.range.contains(&self.tree.cmp, range) {
            return Err(LockError::InvalidRange(format!(
                "{:?} is outside the held keyrange {:?}",
                range, self.range
            )));
        }
        let c = self.tree.compare_to_node(range, &self.subtree);
        if !c.overlaps() {
            self.tree
                .find_node_with_overlapping_child(&mut self.subtree, range, c);
        }
        self.range = range.clone();
        Ok(())
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    /// Visit stored locks overlapping the held range, in key order, until
    /// `f` returns false
    pub fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(&RowLock) -> bool,
    {
        self.tree
            .traverse_overlaps(&self.subtree, &self.range, &mut f);
    }

    /// Copies of every stored lock overlapping the held range
    pub fn overlapping_row_locks(&self) -> Vec<RowLock> {
        let mut locks = Vec::new();
        self.iterate(|lock| {
            locks.push(lock.clone());
            true
        });
        locks
    }

    /// Insert a lock disjoint from every stored range
    ///
    /// The lock may extend past the held range, as long as whatever it
    /// overlaps has already been removed through this handle.
    pub fn insert(&mut self, lock: RowLock) -> Result<()> {
        self.tree.insert_into(&mut self.subtree, lock)
    }

    /// Remove the node whose range equals `range`. Returns false when no
    /// such node exists.
    pub fn remove(&mut self, range: &KeyRange) -> bool {
        self.remove_matching(range, Removal::Node)
    }

    /// Take `txnid` off the holders of the node equal to `range`, deleting
    /// the node once nobody holds it
    pub fn remove_holder(&mut self, range: &KeyRange, txnid: TxnId) -> bool {
        self.remove_matching(range, Removal::Holder(txnid))
    }

    fn remove_matching(&mut self, range: &KeyRange, removal: Removal) -> bool {
        match self.tree.remove_from(&mut self.subtree, range, removal) {
            RemoveOutcome::Removed => true,
            RemoveOutcome::NotFound => false,
            RemoveOutcome::Unlink => {
                // Only reachable when removing a range outside the acquired one
                tracing::error!(?range, held = ?self.range, "remove outside the locked keyrange");
                false
            }
        }
    }

    /// Erase everything reachable from the handle. Returns the number of
    /// locks removed.
    pub fn remove_all(&mut self) -> usize {
        let mut removed = self.tree.remove_subtrees(&mut self.subtree);
        if self.subtree.is_root() && !self.subtree.is_empty() {
            self.subtree.clear();
            removed += 1;
        }
        removed
    }

    /// Give the claim up
    pub fn release(self) {}
}

impl fmt::Debug for LockedKeyrange<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedKeyrange")
            .field("range", &self.range)
            .field("subtree", &self.subtree.id())
            .finish()
    }
}
