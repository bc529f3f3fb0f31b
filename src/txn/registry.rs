//! Live transaction registry

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::locktree::{Locktree, RangeSetListener};
use crate::range::{KeyRange, RangeBuffer};
use crate::types::{DictionaryId, TxnId};

use super::TxnLockLedger;

/// One recorded range of a live transaction, as shown by the locks
/// diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldRange {
    pub txnid: TxnId,
    pub dict_id: DictionaryId,
    pub locktree_name: Option<String>,
    pub range: KeyRange,
}

/// Hands out transaction ids and finds a transaction's ledger by id
///
/// Installed as the manager's range-set listener, it routes escalation
/// results to the owning ledger. Transactions that already ended are
/// skipped; their locks are on their way out anyway.
#[derive(Debug)]
pub struct TxnRegistry {
    next_txnid: AtomicU64,
    live: Mutex<HashMap<TxnId, Weak<TxnLockLedger>>>,
}

impl Default for TxnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self {
            next_txnid: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn allocate_txnid(&self) -> TxnId {
        self.next_txnid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, ledger: &Arc<TxnLockLedger>) {
        self.live
            .lock()
            .insert(ledger.txnid(), Arc::downgrade(ledger));
    }

    pub(crate) fn unregister(&self, txnid: TxnId) {
        self.live.lock().remove(&txnid);
    }

    pub fn get(&self, txnid: TxnId) -> Option<Arc<TxnLockLedger>> {
        self.live.lock().get(&txnid).and_then(Weak::upgrade)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Every range recorded by every live transaction
    pub fn row_locks(&self) -> Vec<HeldRange> {
        let ledgers: Vec<Arc<TxnLockLedger>> = self
            .live
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        let mut held = Vec::new();
        for ledger in ledgers {
            for (locktree, ranges) in ledger.all_ranges() {
                for range in &ranges {
                    held.push(HeldRange {
                        txnid: ledger.txnid(),
                        dict_id: locktree.dict_id(),
                        locktree_name: locktree.name().map(str::to_string),
                        range: range.clone(),
                    });
                }
            }
        }
        held
    }
}

impl RangeSetListener for TxnRegistry {
    fn on_ranges_changed(&self, txnid: TxnId, locktree: &Locktree, ranges: RangeBuffer) {
        match self.get(txnid) {
            Some(ledger) => ledger.replace_ranges(locktree, ranges),
            None => trace!(txnid, dict_id = locktree.dict_id(), "escalated ranges of an ended transaction"),
        }
    }
}
