//! Lock escalation
//!
//! Coarsens one locktree by merging each run of in-order neighbours that
//! share a holder set and mode into a single range. Gaps between merged
//! neighbours become locked too, which is what frees memory.

use std::collections::BTreeMap;

use tracing::{debug, error};

use crate::range::RangeBuffer;
use crate::tree::RowLock;
use crate::types::{TxnId, TxnIdSet};

use super::Locktree;

/// Told about every transaction whose granted ranges an escalation
/// rewrote, so it can replace the ranges it keeps for that locktree.
/// Transactions whose ranges were left alone are not called.
pub trait RangeSetListener: Send + Sync {
    fn on_ranges_changed(&self, txnid: TxnId, locktree: &Locktree, ranges: RangeBuffer);
}

impl<F> RangeSetListener for F
where
    F: Fn(TxnId, &Locktree, RangeBuffer) + Send + Sync,
{
    fn on_ranges_changed(&self, txnid: TxnId, locktree: &Locktree, ranges: RangeBuffer) {
        self(txnid, locktree, ranges)
    }
}

/// What one escalation pass did to a locktree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EscalationOutcome {
    pub locks_before: usize,
    pub locks_after: usize,
}

impl EscalationOutcome {
    pub fn merged(&self) -> usize {
        self.locks_before - self.locks_after
    }
}

impl Locktree {
    /// Merge adjacent ranges with equal holders and mode
    ///
    /// The whole tree stays locked until every listener call returned, so
    /// a holder's rewritten range set is published before anyone can touch
    /// the tree again.
    pub fn escalate(&self, listener: Option<&dyn RangeSetListener>) -> EscalationOutcome {
        let mut lkr = self.tree.prepare();
        let before = lkr.overlapping_row_locks();

        let mut merged: Vec<RowLock> = Vec::with_capacity(before.len());
        let mut grew: Vec<bool> = Vec::with_capacity(before.len());
        for lock in &before {
            match merged.last_mut() {
                Some(last) if last.holders == lock.holders && last.mode == lock.mode => {
                    last.range.extend(&self.cmp, &lock.range);
                    if let Some(flag) = grew.last_mut() {
                        *flag = true;
                    }
                }
                _ => {
                    merged.push(lock.clone());
                    grew.push(false);
                }
            }
        }

        if merged.len() < before.len() {
            lkr.remove_all();
            for lock in &merged {
                // Nodes freed above are reused, so this cannot run out
                if let Err(e) = lkr.insert(lock.clone()) {
                    error!(dict_id = self.dict_id, range = ?lock.range, error = %e, "failed to reinsert escalated lock");
                }
            }

            if let Some(listener) = listener {
                // Holders of a merged run get their whole new range set
                let changed: TxnIdSet = merged
                    .iter()
                    .zip(&grew)
                    .filter(|(_, merged_run)| **merged_run)
                    .flat_map(|(lock, _)| lock.holders.iter())
                    .collect();
                let mut per_txn: BTreeMap<TxnId, RangeBuffer> = BTreeMap::new();
                for lock in &merged {
                    for txnid in lock.holders.iter().filter(|&t| changed.contains(t)) {
                        per_txn.entry(txnid).or_default().append(lock.range.clone());
                    }
                }
                for (txnid, ranges) in per_txn {
                    listener.on_ranges_changed(txnid, self, ranges);
                }
            }
        }
        drop(lkr);

        let outcome = EscalationOutcome {
            locks_before: before.len(),
            locks_after: merged.len(),
        };
        debug!(
            dict_id = self.dict_id,
            before = outcome.locks_before,
            after = outcome.locks_after,
            "escalated locktree"
        );
        outcome
    }
}
