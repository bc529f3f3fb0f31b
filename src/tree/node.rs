//! Tree nodes and the per-tree node arena
//!
//! Nodes never point at each other directly. Every link is a `NodeId`
//! into the owning tree's arena, and every node sits behind its own mutex
//! so a descent can hold a chain of guards while relinking children.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::error::{LockError, Result};
use crate::range::KeyRange;
use crate::types::{LockMode, TxnId, TxnIdSet};

/// Owned guard on one node; can be carried across a descent
pub(crate) type NodeGuard = ArcMutexGuard<RawMutex, TreeNode>;

/// Stable index of a node inside its tree's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(usize);

/// The sentinel root. It is never freed; an empty root stands for a tree
/// with no ranges at all.
pub(crate) const ROOT: NodeId = NodeId(0);

// =============================================================================
// Row Lock
// =============================================================================

/// A granted range: who holds it and how strongly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLock {
    pub range: KeyRange,
    pub holders: TxnIdSet,
    pub mode: LockMode,
}

impl RowLock {
    pub fn new(range: KeyRange, holders: TxnIdSet, mode: LockMode) -> Self {
        Self {
            range,
            holders,
            mode,
        }
    }

    /// A range held by a single transaction
    pub fn single(range: KeyRange, txnid: TxnId, mode: LockMode) -> Self {
        Self::new(range, TxnIdSet::single(txnid), mode)
    }

    /// Whether this lock blocks `txnid` from taking a `requested` lock
    pub fn blocks(&self, txnid: TxnId, requested: LockMode) -> bool {
        !self.holders.is_only(txnid) && self.mode.conflicts_with(requested)
    }
}

// =============================================================================
// Tree Node
// =============================================================================

/// Which child of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Left,
    Right,
}

impl Side {
    pub(crate) fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// A child pointer plus the depth estimate of the subtree behind it
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ChildLink {
    pub(crate) id: Option<NodeId>,
    pub(crate) depth_est: u32,
}

impl ChildLink {
    fn to(id: NodeId, depth_est: u32) -> Self {
        Self {
            id: Some(id),
            depth_est,
        }
    }
}

pub(crate) struct TreeNode {
    id: NodeId,
    lock: Option<RowLock>,
    left: ChildLink,
    right: ChildLink,
}

impl TreeNode {
    fn new(id: NodeId, lock: Option<RowLock>) -> Self {
        Self {
            id,
            lock,
            left: ChildLink::default(),
            right: ChildLink::default(),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn is_root(&self) -> bool {
        self.id == ROOT
    }

    /// Only the root is ever empty
    pub(crate) fn is_empty(&self) -> bool {
        self.lock.is_none()
    }

    pub(crate) fn row_lock(&self) -> Option<&RowLock> {
        self.lock.as_ref()
    }

    pub(crate) fn row_lock_mut(&mut self) -> Option<&mut RowLock> {
        self.lock.as_mut()
    }

    pub(crate) fn set_row_lock(&mut self, lock: RowLock) {
        self.lock = Some(lock);
    }

    pub(crate) fn take_row_lock(&mut self) -> Option<RowLock> {
        self.lock.take()
    }

    /// Drop the payload and both links
    pub(crate) fn clear(&mut self) {
        self.lock = None;
        self.left = ChildLink::default();
        self.right = ChildLink::default();
    }

    pub(crate) fn child(&self, side: Side) -> ChildLink {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    pub(crate) fn set_link(&mut self, side: Side, link: ChildLink) {
        match side {
            Side::Left => self.left = link,
            Side::Right => self.right = link,
        }
    }

    pub(crate) fn set_child(&mut self, side: Side, id: NodeId, depth_est: u32) {
        self.set_link(side, ChildLink::to(id, depth_est));
    }

    pub(crate) fn unlink(&mut self, side: Side) {
        self.set_link(side, ChildLink::default());
    }

    /// Link to this node as seen from its parent
    pub(crate) fn as_link(&self) -> ChildLink {
        ChildLink::to(self.id, self.depth_estimate())
    }

    pub(crate) fn depth_estimate(&self) -> u32 {
        self.left.depth_est.max(self.right.depth_est) + 1
    }

    /// `side` is deeper than the other side by more than `threshold`
    pub(crate) fn imbalanced(&self, side: Side, threshold: u32) -> bool {
        let heavy = self.child(side);
        let light = self.child(side.opposite());
        heavy.id.is_some() && heavy.depth_est > threshold + light.depth_est
    }
}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeNode")
            .field("id", &self.id)
            .field("lock", &self.lock)
            .field("left", &self.left.id)
            .field("right", &self.right.id)
            .finish()
    }
}

// =============================================================================
// Node Arena
// =============================================================================

/// Slot storage for one tree's nodes
///
/// The slot vector is only write-locked to append; lookups clone the slot's
/// `Arc` and release the vector before taking the node mutex, so no node
/// guard is ever held while waiting on the vector.
pub(crate) struct NodeArena {
    slots: RwLock<Vec<Arc<Mutex<TreeNode>>>>,
    free: Mutex<Vec<NodeId>>,
    live: AtomicUsize,
    limit: Option<usize>,
}

impl NodeArena {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        let root = Arc::new(Mutex::new(TreeNode::new(ROOT, None)));
        Self {
            slots: RwLock::new(vec![root]),
            free: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            limit,
        }
    }

    /// Block until `id` is locked
    pub(crate) fn lock(&self, id: NodeId) -> NodeGuard {
        let slot = Arc::clone(&self.slots.read()[id.0]);
        slot.lock_arc()
    }

    /// Allocate a detached node holding `lock`
    ///
    /// Fails before anything is linked, so the caller's tree is untouched.
    pub(crate) fn alloc(&self, lock: RowLock) -> Result<NodeId> {
        let live = self.live.fetch_add(1, Ordering::Relaxed);
        if let Some(limit) = self.limit {
            if live >= limit {
                self.live.fetch_sub(1, Ordering::Relaxed);
                return Err(LockError::OutOfMemory(format!(
                    "range tree is at its limit of {} nodes",
                    limit
                )));
            }
        }

        if let Some(id) = self.free.lock().pop() {
            // Freed slots are unreachable, so this never waits
            self.lock(id).set_row_lock(lock);
            return Ok(id);
        }

        let mut slots = self.slots.write();
        if let Err(e) = slots.try_reserve(1) {
            self.live.fetch_sub(1, Ordering::Relaxed);
            return Err(LockError::OutOfMemory(e.to_string()));
        }
        let id = NodeId(slots.len());
        slots.push(Arc::new(Mutex::new(TreeNode::new(id, Some(lock)))));
        Ok(id)
    }

    /// Return an unlinked node to the free list
    ///
    /// Takes the guard so the node is unlocked before anyone can reuse it.
    pub(crate) fn release(&self, mut guard: NodeGuard) {
        let id = guard.id;
        guard.clear();
        if id == ROOT {
            return;
        }
        drop(guard);
        self.free.lock().push(id);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Nodes currently allocated, not counting the sentinel root
    pub(crate) fn live_nodes(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Bytes one stored node costs beyond its range keys
    pub(crate) fn node_overhead() -> usize {
        mem::size_of::<TreeNode>() + mem::size_of::<Arc<Mutex<TreeNode>>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::Key;

    fn lock_on(n: u64) -> RowLock {
        RowLock::single(KeyRange::point(Key::from(n)), 1, LockMode::Write)
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let arena = NodeArena::new(None);
        let a = arena.alloc(lock_on(1)).unwrap();
        let b = arena.alloc(lock_on(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.live_nodes(), 2);

        arena.release(arena.lock(a));
        assert_eq!(arena.live_nodes(), 1);

        let c = arena.alloc(lock_on(3)).unwrap();
        assert_eq!(c, a);
        assert_eq!(arena.lock(c).row_lock(), Some(&lock_on(3)));
    }

    #[test]
    fn test_node_limit_reports_out_of_memory() {
        let arena = NodeArena::new(Some(1));
        arena.alloc(lock_on(1)).unwrap();
        let err = arena.alloc(lock_on(2)).unwrap_err();
        assert!(matches!(err, LockError::OutOfMemory(_)));
        assert_eq!(arena.live_nodes(), 1);
    }

    #[test]
    fn test_imbalance_uses_depth_estimates() {
        let mut node = TreeNode::new(NodeId(5), Some(lock_on(5)));
        node.set_child(Side::Left, NodeId(6), 3);
        assert!(node.imbalanced(Side::Left, 1));
        node.set_child(Side::Right, NodeId(7), 2);
        assert!(!node.imbalanced(Side::Left, 1));
        assert_eq!(node.depth_estimate(), 4);
    }

    #[test]
    fn test_blocking_rules() {
        let write = lock_on(1);
        assert!(!write.blocks(1, LockMode::Write));
        assert!(write.blocks(2, LockMode::Read));

        let mut read = RowLock::single(KeyRange::point(Key::from(1u64)), 1, LockMode::Read);
        read.holders.add(2);
        assert!(!read.blocks(3, LockMode::Read));
        assert!(read.blocks(1, LockMode::Write));
    }
}
