//! Transaction lock ledger
//!
//! Every range a root transaction was granted, per locktree, so that all
//! of it can be released in one go when the transaction ends.
//!
//! Lock order: the ledger mutex is taken after tree nodes, never before,
//! and no tree operation runs while it is held.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{LockError, Result};
use crate::locktree::Locktree;
use crate::manager::LocktreeManager;
use crate::range::{KeyRange, RangeBuffer};
use crate::types::{DictionaryId, TxnId};

struct LedgerEntry {
    locktree: Arc<Locktree>,
    ranges: RangeBuffer,
}

#[derive(Default)]
struct LedgerInner {
    entries: HashMap<DictionaryId, LedgerEntry>,
    finished: bool,
}

pub struct TxnLockLedger {
    txnid: TxnId,
    manager: Arc<LocktreeManager>,
    inner: Mutex<LedgerInner>,
}

impl TxnLockLedger {
    pub fn new(txnid: TxnId, manager: Arc<LocktreeManager>) -> Self {
        Self {
            txnid,
            manager,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    pub fn txnid(&self) -> TxnId {
        self.txnid
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Record a granted range, referencing the locktree on first use
    pub fn note_row_lock(&self, locktree: &Arc<Locktree>, range: KeyRange) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.finished {
            return Err(LockError::InvalidRequest(format!(
                "transaction {} already released its locks",
                self.txnid
            )));
        }

        let size = range.memory_size() as u64;
        let entry = inner
            .entries
            .entry(locktree.dict_id())
            .or_insert_with(|| {
                self.manager.reference_lt(locktree);
                LedgerEntry {
                    locktree: Arc::clone(locktree),
                    ranges: RangeBuffer::new(),
                }
            });
        entry.ranges.append(range);
        locktree.note_mem_used(size);
        Ok(())
    }

    /// Swap in the ranges a locktree now stores for this transaction
    pub(crate) fn replace_ranges(&self, locktree: &Locktree, ranges: RangeBuffer) {
        let mut inner = self.inner.lock();
        if inner.finished {
            return;
        }
        let Some(entry) = inner.entries.get_mut(&locktree.dict_id()) else {
            return;
        };

        let old = entry.ranges.total_memory_size() as u64;
        let new = ranges.total_memory_size() as u64;
        entry.ranges = ranges;
        if new > old {
            locktree.note_mem_used(new - old);
        } else {
            locktree.note_mem_released(old - new);
        }
        trace!(txnid = self.txnid, dict_id = locktree.dict_id(), old, new, "ledger rewritten");
    }

    /// Release every recorded range and drop the locktree references
    ///
    /// Idempotent: the first call empties the ledger for good.
    pub fn release_all(&self) {
        let entries = {
            let mut inner = self.inner.lock();
            inner.finished = true;
            mem::take(&mut inner.entries)
        };
        if entries.is_empty() {
            return;
        }

        let count = entries.len();
        for entry in entries.into_values() {
            entry.locktree.release_locks(self.txnid, &entry.ranges);
            entry
                .locktree
                .note_mem_released(entry.ranges.total_memory_size() as u64);
            self.manager.release_lt(&entry.locktree);
        }
        debug!(txnid = self.txnid, locktrees = count, "transaction locks released");
    }

    /// Recorded ranges for one locktree
    pub fn ranges(&self, dict_id: DictionaryId) -> Option<RangeBuffer> {
        self.inner
            .lock()
            .entries
            .get(&dict_id)
            .map(|entry| entry.ranges.clone())
    }

    /// Every recorded range, by locktree
    pub fn all_ranges(&self) -> Vec<(Arc<Locktree>, RangeBuffer)> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|entry| (Arc::clone(&entry.locktree), entry.ranges.clone()))
            .collect()
    }

    /// Bytes this ledger accounts against the lock memory budget
    pub fn memory_size(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .map(|entry| entry.ranges.total_memory_size())
            .sum()
    }
}

impl std::fmt::Debug for TxnLockLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TxnLockLedger")
            .field("txnid", &self.txnid)
            .field("locktrees", &inner.entries.len())
            .field("finished", &inner.finished)
            .finish()
    }
}
