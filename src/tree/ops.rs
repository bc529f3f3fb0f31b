//! Recursive tree algorithms
//!
//! Every function here runs with the caller already holding the guard on
//! `node`. Children are locked top-down only, which is the single lock
//! order of the whole tree.

use crate::error::{LockError, Result};
use crate::range::{KeyRange, RangeComparison};
use crate::types::TxnId;

use super::node::{ChildLink, NodeGuard, RowLock, Side, TreeNode};
use super::ConcurrentTree;

/// What to take away from the node whose range equals the target
#[derive(Debug, Clone, Copy)]
pub(super) enum Removal {
    Node,
    Holder(TxnId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RemoveOutcome {
    NotFound,
    Removed,
    /// The node is now an empty leaf; its parent must unlink and free it
    Unlink,
}

impl ConcurrentTree {
    /// Compare `range` with the payload of `node`. The empty root stands
    /// for the whole keyspace.
    pub(super) fn compare_to_node(&self, range: &KeyRange, node: &TreeNode) -> RangeComparison {
        match node.row_lock() {
            Some(lock) => range.compare(&self.cmp, &lock.range),
            None => RangeComparison::Overlaps,
        }
    }

    // -------------------------------------------------------------------------
    // Descent
    // -------------------------------------------------------------------------

    /// Walk down from `slot` toward `range`, swapping the guard in `slot`
    /// hand-over-hand, and stop at the parent of the first overlapping
    /// node or at a leaf.
    ///
    /// `c` is how `range` compares to the node currently in `slot`.
    pub(super) fn find_node_with_overlapping_child(
        &self,
        slot: &mut NodeGuard,
        range: &KeyRange,
        mut c: RangeComparison,
    ) {
        loop {
            let side = match c {
                RangeComparison::LessThan => Side::Left,
                RangeComparison::GreaterThan => Side::Right,
                _ => return,
            };
            let Some(child) = self.lock_and_rebalance(slot, side) else {
                return;
            };
            let child_c = self.compare_to_node(range, &child);
            if child_c.overlaps() {
                return;
            }
            *slot = child;
            c = child_c;
        }
    }

    /// Lock the child on `side`, rebalance the subtree under it and relink
    /// the (possibly new) subtree root. Returns that root still locked.
    pub(super) fn lock_and_rebalance(&self, node: &mut TreeNode, side: Side) -> Option<NodeGuard> {
        let id = node.child(side).id?;
        let child = self.maybe_rebalance(self.arena.lock(id));
        node.set_link(side, child.as_link());
        Some(child)
    }

    fn maybe_rebalance(&self, node: NodeGuard) -> NodeGuard {
        if node.imbalanced(Side::Left, 1) {
            self.rotate(node, Side::Left)
        } else if node.imbalanced(Side::Right, 1) {
            self.rotate(node, Side::Right)
        } else {
            node
        }
    }

    /// Lift the child on the `heavy` side above `node`, first lifting its
    /// inner grandchild when that one is the deeper. Only the new subtree
    /// root stays locked.
    fn rotate(&self, mut node: NodeGuard, heavy: Side) -> NodeGuard {
        let light = heavy.opposite();
        let Some(child_id) = node.child(heavy).id else {
            return node;
        };
        let mut child = self.arena.lock(child_id);

        if child.imbalanced(light, 0) {
            if let Some(grand_id) = child.child(light).id {
                let mut grandchild = self.arena.lock(grand_id);
                child.set_link(light, grandchild.child(heavy));
                grandchild.set_link(heavy, child.as_link());
                node.set_link(heavy, grandchild.as_link());
                child = grandchild;
            }
        }

        node.set_link(heavy, child.child(light));
        child.set_link(light, node.as_link());
        drop(node);
        child
    }

    // -------------------------------------------------------------------------
    // Search
    // -------------------------------------------------------------------------

    /// In-order visit of every payload overlapping `range`. Returns false
    /// once `f` asks to stop.
    pub(super) fn traverse_overlaps<F>(&self, node: &TreeNode, range: &KeyRange, f: &mut F) -> bool
    where
        F: FnMut(&RowLock) -> bool,
    {
        let Some(lock) = node.row_lock() else {
            return true;
        };
        let c = range.compare(&self.cmp, &lock.range);
        if c == RangeComparison::Equals {
            // Stored ranges are disjoint, nothing else can overlap
            return f(lock);
        }

        if c != RangeComparison::GreaterThan {
            if let Some(id) = node.child(Side::Left).id {
                let child = self.arena.lock(id);
                if !self.traverse_overlaps(&child, range, f) {
                    return false;
                }
            }
        }
        if c == RangeComparison::Overlaps && !f(lock) {
            return false;
        }
        if c != RangeComparison::LessThan {
            if let Some(id) = node.child(Side::Right).id {
                let child = self.arena.lock(id);
                if !self.traverse_overlaps(&child, range, f) {
                    return false;
                }
            }
        }
        true
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    pub(super) fn insert_into(&self, node: &mut TreeNode, lock: RowLock) -> Result<()> {
        let c = match node.row_lock() {
            Some(existing) => lock.range.compare(&self.cmp, &existing.range),
            None => {
                node.set_row_lock(lock);
                return Ok(());
            }
        };
        let side = match c {
            RangeComparison::LessThan => Side::Left,
            RangeComparison::GreaterThan => Side::Right,
            _ => {
                return Err(LockError::InvalidRange(format!(
                    "{:?} overlaps a stored range",
                    lock.range
                )))
            }
        };

        match self.lock_and_rebalance(node, side) {
            Some(mut child) => {
                self.insert_into(&mut child, lock)?;
                node.set_link(side, child.as_link());
            }
            None => {
                let id = self.arena.alloc(lock)?;
                node.set_child(side, id, 1);
            }
        }
        Ok(())
    }

    pub(super) fn remove_from(
        &self,
        node: &mut TreeNode,
        range: &KeyRange,
        removal: Removal,
    ) -> RemoveOutcome {
        let c = node
            .row_lock()
            .map(|lock| range.compare(&self.cmp, &lock.range));
        let side = match c {
            Some(RangeComparison::LessThan) => Side::Left,
            Some(RangeComparison::GreaterThan) => Side::Right,
            Some(RangeComparison::Equals) => return self.remove_here(node, removal),
            Some(RangeComparison::Overlaps) | None => return RemoveOutcome::NotFound,
        };

        let Some(child_id) = node.child(side).id else {
            return RemoveOutcome::NotFound;
        };
        let mut child = self.arena.lock(child_id);
        match self.remove_from(&mut child, range, removal) {
            RemoveOutcome::Unlink => {
                self.arena.release(child);
                node.unlink(side);
                RemoveOutcome::Removed
            }
            RemoveOutcome::Removed => {
                node.set_link(side, child.as_link());
                RemoveOutcome::Removed
            }
            RemoveOutcome::NotFound => RemoveOutcome::NotFound,
        }
    }

    fn remove_here(&self, node: &mut TreeNode, removal: Removal) -> RemoveOutcome {
        if let Removal::Holder(txnid) = removal {
            if let Some(lock) = node.row_lock_mut() {
                if !lock.holders.remove(txnid) {
                    return RemoveOutcome::NotFound;
                }
                if !lock.holders.is_empty() {
                    return RemoveOutcome::Removed;
                }
            }
        }
        self.remove_root_of_subtree(node)
    }

    /// Delete the payload of `node`, pulling up its in-order predecessor
    /// (or successor when there is no left subtree)
    fn remove_root_of_subtree(&self, node: &mut TreeNode) -> RemoveOutcome {
        let (side, child_id) = match (node.child(Side::Left).id, node.child(Side::Right).id) {
            (Some(id), _) => (Side::Left, id),
            (None, Some(id)) => (Side::Right, id),
            (None, None) if node.is_root() => {
                node.clear();
                return RemoveOutcome::Removed;
            }
            (None, None) => return RemoveOutcome::Unlink,
        };

        let child = self.arena.lock(child_id);
        let (link, replacement) = self.detach_extreme(child, side.opposite());
        node.set_link(side, link);
        if let Some(lock) = replacement {
            node.set_row_lock(lock);
        }
        RemoveOutcome::Removed
    }

    /// Cut the outermost node on the `toward` side out of the subtree
    /// rooted at `node`. Returns the subtree's new link and the payload of
    /// the node that was cut.
    fn detach_extreme(&self, mut node: NodeGuard, toward: Side) -> (ChildLink, Option<RowLock>) {
        match node.child(toward).id {
            Some(id) => {
                let child = self.arena.lock(id);
                let (link, lock) = self.detach_extreme(child, toward);
                node.set_link(toward, link);
                (node.as_link(), lock)
            }
            None => {
                let link = node.child(toward.opposite());
                let lock = node.take_row_lock();
                self.arena.release(node);
                (link, lock)
            }
        }
    }

    /// Free every node below `node`. Returns how many were freed.
    pub(super) fn remove_subtrees(&self, node: &mut TreeNode) -> usize {
        let mut freed = 0;
        for side in [Side::Left, Side::Right] {
            if let Some(id) = node.child(side).id {
                let mut child = self.arena.lock(id);
                freed += self.remove_subtrees(&mut child) + 1;
                self.arena.release(child);
                node.unlink(side);
            }
        }
        freed
    }
}
