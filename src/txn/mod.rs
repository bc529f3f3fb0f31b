//! Transaction Module
//!
//! Transactions as the lock manager sees them, and the entry points the
//! row-access layer calls before touching a row.
//!
//! ## Responsibilities
//! - Attribute every lock of a nested transaction to its root
//! - Record granted ranges in the root's ledger
//! - Release everything when the root commits or aborts
//! - Surface deadlocks and lock wait timeouts to the diagnostic callback
//!
//! ## Flow
//! ```text
//!   get_range_lock(txn, lt, left, right, mode)
//!     -> start_range_lock --granted--> ledger.note_row_lock
//!          | not granted
//!          v
//!        wait_range_lock --granted--> ledger.note_row_lock
//!          | deadlock / timeout / killed
//!          v
//!        lock_timeout callback, error to caller
//! ```

mod ledger;
mod registry;

pub use ledger::TxnLockLedger;
pub use registry::{HeldRange, TxnRegistry};

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{LockError, Result};
use crate::locktree::Locktree;
use crate::manager::{LockTimeoutInfo, LocktreeManager};
use crate::range::{Key, RangeBuffer};
use crate::request::{LockRequest, RequestContext};
use crate::types::{LockMode, TxnId};

// =============================================================================
// Transaction
// =============================================================================

/// A root or nested transaction
///
/// Nested handles share their root's id and ledger, so locking through
/// any of them is locking as the root. Only the root releases.
pub struct Transaction {
    txnid: TxnId,
    ledger: Arc<TxnLockLedger>,
    registry: Arc<TxnRegistry>,
    manager: Arc<LocktreeManager>,
    nested: bool,
    big_txn: bool,
    client_id: u64,
    finished: bool,
}

impl Transaction {
    pub fn begin(manager: &Arc<LocktreeManager>, registry: &Arc<TxnRegistry>) -> Self {
        let txnid = registry.allocate_txnid();
        let ledger = Arc::new(TxnLockLedger::new(txnid, Arc::clone(manager)));
        registry.register(&ledger);
        debug!(txnid, "transaction started");
        Self {
            txnid,
            ledger,
            registry: Arc::clone(registry),
            manager: Arc::clone(manager),
            nested: false,
            big_txn: false,
            client_id: 0,
            finished: false,
        }
    }

    /// A child transaction locking under this one's root
    pub fn begin_nested(&self) -> Self {
        Self {
            txnid: self.txnid,
            ledger: Arc::clone(&self.ledger),
            registry: Arc::clone(&self.registry),
            manager: Arc::clone(&self.manager),
            nested: true,
            big_txn: self.big_txn,
            client_id: self.client_id,
            finished: false,
        }
    }

    /// Id every lock of this transaction is held under: the root's
    pub fn id(&self) -> TxnId {
        self.txnid
    }

    pub fn is_nested(&self) -> bool {
        self.nested
    }

    pub fn ledger(&self) -> &Arc<TxnLockLedger> {
        &self.ledger
    }

    pub fn manager(&self) -> &Arc<LocktreeManager> {
        &self.manager
    }

    /// Mark the transaction as holding many locks, so the manager escalates
    /// earlier on its behalf
    pub fn set_big_txn(&mut self, big: bool) {
        self.big_txn = big;
    }

    pub fn is_big_txn(&self) -> bool {
        self.big_txn
    }

    pub fn set_client_id(&mut self, client_id: u64) {
        self.client_id = client_id;
    }

    pub fn commit(mut self) {
        self.finish("commit");
    }

    /// Locks are never speculative, so abort releases exactly like commit
    pub fn abort(mut self) {
        self.finish("abort");
    }

    fn finish(&mut self, how: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.nested {
            return;
        }
        self.ledger.release_all();
        self.registry.unregister(self.txnid);
        debug!(txnid = self.txnid, how, "transaction finished");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !self.nested {
            debug!(txnid = self.txnid, "aborting dropped transaction");
        }
        self.finish("drop");
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("txnid", &self.txnid)
            .field("nested", &self.nested)
            .field("finished", &self.finished)
            .finish()
    }
}

// =============================================================================
// Row Access Entry Points
// =============================================================================

/// Lock `[left, right]` for `txn`, waiting when needed
pub fn get_range_lock(
    txn: &Transaction,
    locktree: &Arc<Locktree>,
    left: Key,
    right: Key,
    mode: LockMode,
) -> Result<()> {
    let mut request = LockRequest::new();
    let result = match start_range_lock(txn, locktree, left, right, mode, &mut request) {
        Err(LockError::LockNotGranted { .. }) => wait_range_lock(txn, &mut request),
        other => other,
    };
    request.destroy()?;
    result
}

/// Set up `request` and try it once without blocking
///
/// `LockNotGranted` leaves the request pending; finish it with
/// `wait_range_lock`.
pub fn start_range_lock(
    txn: &Transaction,
    locktree: &Arc<Locktree>,
    left: Key,
    right: Key,
    mode: LockMode,
    request: &mut LockRequest,
) -> Result<()> {
    if txn.ledger.is_finished() {
        return Err(LockError::InvalidRequest(format!(
            "transaction {} has ended",
            txn.id()
        )));
    }
    request.set(
        Arc::clone(locktree),
        txn.id(),
        left,
        right,
        mode,
        txn.is_big_txn(),
        RequestContext {
            client_id: txn.client_id,
        },
    )?;

    match request.start() {
        Ok(()) => note_granted(txn, request),
        Err(e) => {
            if e.is_deadlock() {
                report_lock_timeout(txn, request, &e);
            }
            Err(e)
        }
    }
}

/// Block on a request left pending by `start_range_lock`
pub fn wait_range_lock(txn: &Transaction, request: &mut LockRequest) -> Result<()> {
    let manager = &txn.manager;
    let policy = manager.policy();
    let result = request.wait(
        manager.lock_wait_timeout(txn.id()),
        manager.config().kill_check_interval,
        policy.killed(),
        policy.wait_needed(),
    );

    match result {
        Ok(()) => note_granted(txn, request),
        Err(e) => {
            if matches!(
                e,
                LockError::Deadlock { .. } | LockError::LockWaitTimeout { .. } | LockError::Killed { .. }
            ) {
                report_lock_timeout(txn, request, &e);
            }
            Err(e)
        }
    }
}

fn note_granted(txn: &Transaction, request: &LockRequest) -> Result<()> {
    let (Some(locktree), Some(range)) = (request.locktree(), request.range()) else {
        return Err(LockError::InvalidRequest(
            "granted request lost its target".to_string(),
        ));
    };

    if let Err(e) = txn.ledger.note_row_lock(locktree, range.clone()) {
        // Nobody would ever release it otherwise
        warn!(txnid = txn.id(), ?range, "undoing lock granted to an ended transaction");
        let undo: RangeBuffer = std::iter::once(range.clone()).collect();
        locktree.release_locks(txn.id(), &undo);
        return Err(e);
    }
    Ok(())
}

fn report_lock_timeout(txn: &Transaction, request: &LockRequest, error: &LockError) {
    let Some(callback) = txn.manager.policy().lock_timeout() else {
        return;
    };
    let (Some(locktree), Some(range), Some(mode)) =
        (request.locktree(), request.range(), request.mode())
    else {
        return;
    };
    callback(&LockTimeoutInfo {
        dict_id: locktree.dict_id(),
        locktree_name: locktree.name().map(str::to_string),
        txnid: txn.id(),
        blocking_txnid: request.get_conflicting_txnid(),
        range: range.clone(),
        mode,
        deadlock: error.is_deadlock(),
    });
}
