//! Wait-for cycle detection
//!
//! There is no stored graph. An edge `A -> B` exists while one of A's
//! pending requests is blocked by a lock B holds; edges are recomputed from
//! the live tree on every inspection.
//!
//! The walk runs with the locktree's pending mutex held, so no request it
//! looks at can be granted or withdrawn underneath it and every cycle it
//! reports is real. Cycles through other locktrees are not followed; those
//! waiters end by timeout.

use std::collections::HashSet;

use crate::locktree::Locktree;
use crate::types::TxnId;

use super::info::PendingRequests;

/// Whether some transaction `origin` waits for, directly or transitively,
/// is itself waiting for `origin`
pub(crate) fn has_cycle(lt: &Locktree, pending: &PendingRequests, origin: TxnId) -> bool {
    let mut visited: HashSet<TxnId> = HashSet::new();
    let mut stack = vec![origin];
    visited.insert(origin);

    while let Some(txnid) = stack.pop() {
        let waiting = pending
            .iter()
            .filter(|r| r.txnid == txnid && r.is_pending());
        for record in waiting {
            let blockers = lt.get_conflicts(record.txnid, &record.range, record.mode);
            for blocker in blockers.iter() {
                if blocker == origin {
                    return true;
                }
                if visited.insert(blocker) {
                    stack.push(blocker);
                }
            }
        }
    }
    false
}
