//! Locktree Module
//!
//! The row locks of one keyspace: a concurrent range tree plus the lock
//! requests waiting on it.
//!
//! ## Responsibilities
//! - Non-blocking acquisition with conflict reporting
//! - Exact bookkeeping: every stored range is held in full by each of its
//!   holders, so a transaction only ever blocks keys it asked for
//! - Release of everything a transaction recorded, then retry of waiters
//! - Escalation when the manager runs short of lock memory
//!
//! ## Conflict Rules
//! ```text
//!   held \ requested   READ     WRITE
//!   READ (others)      ok       conflict
//!   WRITE (others)     conflict conflict
//!   anything (self)    ok       ok
//! ```
//! A transaction never conflicts with itself.

mod escalation;

pub use escalation::{EscalationOutcome, RangeSetListener};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tracing::{trace, warn};

use crate::config::DEFAULT_DEADLOCK_CHECK_INTERVAL;
use crate::error::{LockError, Result};
use crate::manager::LocktreeManager;
use crate::range::{Comparator, KeyRange, RangeBuffer};
use crate::request::{LockRequest, LockRequestInfo, LockWaitStats, PendingLockInfo};
use crate::tree::{ConcurrentTree, LockedKeyrange, RowLock};
use crate::types::{DictionaryId, LockMode, TxnId, TxnIdSet};

pub struct Locktree {
    dict_id: DictionaryId,
    cmp: Comparator,
    tree: ConcurrentTree,
    manager: Weak<LocktreeManager>,

    /// Lock memory attributed to this locktree
    memory: AtomicU64,
    name: OnceLock<String>,
    request_info: LockRequestInfo,
}

impl Locktree {
    /// A locktree that answers to no manager; memory is tracked locally
    /// and no escalation is ever triggered
    pub fn new(dict_id: DictionaryId, cmp: Comparator) -> Self {
        Self::with_manager(dict_id, cmp, None, Weak::new())
    }

    pub(crate) fn with_manager(
        dict_id: DictionaryId,
        cmp: Comparator,
        node_limit: Option<usize>,
        manager: Weak<LocktreeManager>,
    ) -> Self {
        Self {
            dict_id,
            tree: ConcurrentTree::with_node_limit(cmp.clone(), node_limit),
            cmp,
            manager,
            memory: AtomicU64::new(0),
            name: OnceLock::new(),
            request_info: LockRequestInfo::new(),
        }
    }

    pub fn dict_id(&self) -> DictionaryId {
        self.dict_id
    }

    pub fn comparator(&self) -> &Comparator {
        &self.cmp
    }

    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    /// Name the locktree for diagnostics; only the first call sticks
    pub fn set_name(&self, name: impl Into<String>) -> bool {
        self.name.set(name.into()).is_ok()
    }

    pub(crate) fn manager(&self) -> Option<Arc<LocktreeManager>> {
        self.manager.upgrade()
    }

    pub(crate) fn request_info(&self) -> &LockRequestInfo {
        &self.request_info
    }

    pub(crate) fn deadlock_check_interval(&self) -> Duration {
        self.manager()
            .map(|mgr| mgr.config().deadlock_check_interval)
            .unwrap_or(DEFAULT_DEADLOCK_CHECK_INTERVAL)
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    pub fn acquire_read_lock(
        &self,
        txnid: TxnId,
        range: &KeyRange,
        conflicts: &mut TxnIdSet,
        big_txn: bool,
    ) -> Result<()> {
        self.acquire_lock(txnid, range, LockMode::Read, conflicts, big_txn)
    }

    pub fn acquire_write_lock(
        &self,
        txnid: TxnId,
        range: &KeyRange,
        conflicts: &mut TxnIdSet,
        big_txn: bool,
    ) -> Result<()> {
        self.acquire_lock(txnid, range, LockMode::Write, conflicts, big_txn)
    }

    /// Try once to grant `range` to `txnid`
    ///
    /// On `LockNotGranted` every blocking holder has been added to
    /// `conflicts`. Memory limits are enforced first and may run escalation.
    pub fn acquire_lock(
        &self,
        txnid: TxnId,
        range: &KeyRange,
        mode: LockMode,
        conflicts: &mut TxnIdSet,
        big_txn: bool,
    ) -> Result<()> {
        if let Some(mgr) = self.manager() {
            mgr.check_current_lock_constraints(big_txn)?;
        }
        self.try_acquire_lock(txnid, range, mode, conflicts)
    }

    fn try_acquire_lock(
        &self,
        txnid: TxnId,
        range: &KeyRange,
        mode: LockMode,
        conflicts: &mut TxnIdSet,
    ) -> Result<()> {
        let mut lkr = self.tree.prepare();
        lkr.acquire(range)?;
        let overlaps = lkr.overlapping_row_locks();

        if self.already_covered(txnid, range, mode, &overlaps) {
            trace!(dict_id = self.dict_id, txnid, ?range, %mode, "lock already held");
            return Ok(());
        }

        collect_conflicts(txnid, mode, &overlaps, conflicts);
        if !conflicts.is_empty() {
            return Err(LockError::LockNotGranted {
                blocking_txnid: conflicts.first(),
            });
        }

        self.consolidate(&mut lkr, txnid, range, mode, overlaps)?;
        trace!(dict_id = self.dict_id, txnid, ?range, %mode, "lock granted");
        Ok(())
    }

    /// One stored lock already grants what is asked
    fn already_covered(&self, txnid: TxnId, range: &KeyRange, mode: LockMode, overlaps: &[RowLock]) -> bool {
        match overlaps {
            [lock] => {
                lock.range.contains(&self.cmp, range)
                    && match mode {
                        LockMode::Read => lock.holders.contains(txnid),
                        LockMode::Write => {
                            lock.mode == LockMode::Write && lock.holders.is_only(txnid)
                        }
                    }
            }
            _ => false,
        }
    }

    /// Replace the request and everything it overlaps with exact pieces
    ///
    /// Stored ranges are cut at the request's boundaries: the part inside
    /// gains `txnid` as a holder, the parts outside keep their holders, and
    /// keys nobody held become the requester's alone. Touching pieces with
    /// the same holders and mode are joined again.
    fn consolidate(
        &self,
        lkr: &mut LockedKeyrange<'_>,
        txnid: TxnId,
        range: &KeyRange,
        mode: LockMode,
        overlaps: Vec<RowLock>,
    ) -> Result<()> {
        let pieces = self.cut_pieces(txnid, range, mode, &overlaps);
        for lock in &overlaps {
            lkr.remove(&lock.range);
        }

        let mut inserted = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let piece_range = piece.range.clone();
            if let Err(e) = lkr.insert(piece) {
                // Put back what was removed; the freed nodes are still there
                for r in &inserted {
                    lkr.remove(r);
                }
                for lock in overlaps {
                    if let Err(restore) = lkr.insert(lock) {
                        warn!(dict_id = self.dict_id, error = %restore, "failed to restore lock");
                    }
                }
                return Err(e);
            }
            inserted.push(piece_range);
        }
        Ok(())
    }

    /// In-order pieces covering the request and every overlapping lock
    fn cut_pieces(&self, txnid: TxnId, range: &KeyRange, mode: LockMode, overlaps: &[RowLock]) -> Vec<RowLock> {
        let mut pieces: Vec<RowLock> = Vec::with_capacity(overlaps.len() * 2 + 1);
        let mut push = |piece: RowLock| match pieces.last_mut() {
            Some(last)
                if last.holders == piece.holders
                    && last.mode == piece.mode
                    && last.range.touches(&self.cmp, &piece.range) =>
            {
                last.range.extend(&self.cmp, &piece.range);
            }
            _ => pieces.push(piece),
        };

        let mut rest = Some(range.clone());
        for lock in overlaps {
            if let Some(head) = lock.range.before(&self.cmp, range) {
                push(RowLock::new(head, lock.holders.clone(), lock.mode));
            }
            if let Some(gap) = rest.as_ref().and_then(|r| r.before(&self.cmp, &lock.range)) {
                push(RowLock::single(gap, txnid, mode));
            }
            if let Some(inside) = lock.range.intersect(&self.cmp, range) {
                let mut holders = lock.holders.clone();
                holders.add(txnid);
                push(RowLock::new(inside, holders, lock.mode.max(mode)));
            }
            if let Some(tail) = lock.range.after(&self.cmp, range) {
                push(RowLock::new(tail, lock.holders.clone(), lock.mode));
            }
            rest = rest.and_then(|r| r.after(&self.cmp, &lock.range));
        }
        if let Some(r) = rest {
            push(RowLock::single(r, txnid, mode));
        }
        pieces
    }

    /// Holders that would block `txnid` from taking `range` in `mode`,
    /// without changing anything
    pub fn get_conflicts(&self, txnid: TxnId, range: &KeyRange, mode: LockMode) -> TxnIdSet {
        let mut conflicts = TxnIdSet::new();
        let mut lkr = self.tree.prepare();
        if lkr.acquire(range).is_ok() {
            let overlaps = lkr.overlapping_row_locks();
            if !self.already_covered(txnid, range, mode, &overlaps) {
                collect_conflicts(txnid, mode, &overlaps, &mut conflicts);
            }
        }
        conflicts
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Drop `txnid` from every stored lock overlapping the given ranges,
    /// then retry whoever is waiting
    ///
    /// Stored locks may have been consolidated or escalated since the
    /// ranges were recorded, so removal goes by overlap.
    pub fn release_locks(&self, txnid: TxnId, ranges: &RangeBuffer) {
        for range in ranges {
            let mut lkr = self.tree.prepare();
            if let Err(e) = lkr.acquire(range) {
                warn!(dict_id = self.dict_id, ?range, error = %e, "cannot release range");
                continue;
            }
            let mut held = Vec::new();
            lkr.iterate(|lock| {
                if lock.holders.contains(txnid) {
                    held.push(lock.range.clone());
                }
                true
            });
            for r in &held {
                lkr.remove_holder(r, txnid);
            }
        }
        trace!(dict_id = self.dict_id, txnid, ranges = ranges.len(), "released locks");

        let mgr = self.manager();
        let wait_needed = mgr.as_ref().and_then(|m| m.policy().wait_needed());
        LockRequest::retry_all_lock_requests(self, wait_needed);
    }

    // =========================================================================
    // Memory
    // =========================================================================

    pub fn memory_used(&self) -> u64 {
        self.memory.load(Ordering::Relaxed)
    }

    pub fn note_mem_used(&self, bytes: u64) {
        self.memory.fetch_add(bytes, Ordering::Relaxed);
        if let Some(mgr) = self.manager() {
            mgr.note_mem_used(bytes);
        }
    }

    pub fn note_mem_released(&self, bytes: u64) {
        let _ = self
            .memory
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |m| {
                Some(m.saturating_sub(bytes))
            });
        if let Some(mgr) = self.manager() {
            mgr.note_mem_released(bytes);
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// In-order copy of every granted lock
    pub fn row_locks(&self) -> Vec<RowLock> {
        self.tree.row_locks()
    }

    pub fn lock_count(&self) -> usize {
        self.tree.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn pending_lock_requests(&self) -> Vec<PendingLockInfo> {
        self.request_info.pending_lock_requests(self.dict_id)
    }

    pub fn wait_stats(&self) -> LockWaitStats {
        self.request_info.counters.snapshot()
    }
}

impl fmt::Debug for Locktree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locktree")
            .field("dict_id", &self.dict_id)
            .field("name", &self.name())
            .field("cmp", &self.cmp)
            .field("memory", &self.memory_used())
            .finish()
    }
}

/// Add to `conflicts` every other holder that blocks a `mode` request by
/// `txnid` on a range overlapping `overlaps`
fn collect_conflicts(txnid: TxnId, mode: LockMode, overlaps: &[RowLock], conflicts: &mut TxnIdSet) {
    for lock in overlaps.iter().filter(|l| l.blocks(txnid, mode)) {
        for holder in lock.holders.iter().filter(|&h| h != txnid) {
            conflicts.add(holder);
        }
    }
}
