//! Lock Request Module
//!
//! One attempt by one transaction to lock one range, blocking or not.
//!
//! ## Responsibilities
//! - Non-blocking `start` that registers the request when it conflicts
//! - Blocking `wait` with deadlock checks, timeout and kill checks
//! - Retrying every pending request after locks are released
//!
//! ## Lifecycle
//! ```text
//!   Initialized --start--> Success
//!        |
//!        +--------------> Pending --wait--> Success | Deadlock | TimedOut | Killed
//!        |                                                 (all leave Pending)
//!        +--------------> Deadlock | Failed
//!   any terminal state --destroy--> Destroyed
//! ```

mod deadlock;
mod info;

pub use info::{LockWaitStats, PendingLockInfo, LONG_WAIT_THRESHOLD};
pub(crate) use info::LockRequestInfo;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::error::{LockError, Result};
use crate::locktree::Locktree;
use crate::manager::{KilledCallback, WaitNeededCallback};
use crate::range::{Key, KeyRange};
use crate::types::{LockMode, TxnId, TxnIdSet};

use info::RequestRecord;

/// Longest wait a deadline is computed for; longer timeouts wait forever
/// in practice
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestState {
    Initialized = 0,
    Pending = 1,
    Success = 2,
    Deadlock = 3,
    TimedOut = 4,
    Killed = 5,
    Failed = 6,
    Destroyed = 7,
}

impl RequestState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RequestState::Initialized,
            1 => RequestState::Pending,
            2 => RequestState::Success,
            3 => RequestState::Deadlock,
            4 => RequestState::TimedOut,
            5 => RequestState::Killed,
            6 => RequestState::Failed,
            _ => RequestState::Destroyed,
        }
    }

    /// No further transition except `destroy`
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestState::Initialized | RequestState::Pending)
    }
}

/// Who is asking, for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub client_id: u64,
}

pub struct LockRequest {
    locktree: Option<Arc<Locktree>>,
    record: Option<Arc<RequestRecord>>,
    state: RequestState,
    conflicting_txnid: Option<TxnId>,
}

impl Default for LockRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRequest {
    pub fn new() -> Self {
        Self {
            locktree: None,
            record: None,
            state: RequestState::Initialized,
            conflicting_txnid: None,
        }
    }

    /// Describe the lock to ask for. Nothing is locked yet.
    ///
    /// `big_txn` marks a transaction already holding many locks; it makes
    /// the manager escalate earlier on its behalf.
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &mut self,
        locktree: Arc<Locktree>,
        txnid: TxnId,
        left: Key,
        right: Key,
        mode: LockMode,
        big_txn: bool,
        context: RequestContext,
    ) -> Result<()> {
        if self.state == RequestState::Pending {
            return Err(LockError::InvalidRequest(
                "cannot reset a pending lock request".to_string(),
            ));
        }
        let range = KeyRange::new(locktree.comparator(), left, right)?;
        self.record = Some(Arc::new(RequestRecord::new(
            txnid,
            range,
            mode,
            big_txn,
            context.client_id,
        )));
        self.locktree = Some(locktree);
        self.state = RequestState::Initialized;
        self.conflicting_txnid = None;
        Ok(())
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn txnid(&self) -> Option<TxnId> {
        self.record.as_ref().map(|r| r.txnid)
    }

    pub fn range(&self) -> Option<&KeyRange> {
        self.record.as_ref().map(|r| &r.range)
    }

    pub fn mode(&self) -> Option<LockMode> {
        self.record.as_ref().map(|r| r.mode)
    }

    pub fn locktree(&self) -> Option<&Arc<Locktree>> {
        self.locktree.as_ref()
    }

    /// One holder that kept this request from being granted
    pub fn get_conflicting_txnid(&self) -> Option<TxnId> {
        self.conflicting_txnid
    }

    fn parts(&self) -> Result<(Arc<Locktree>, Arc<RequestRecord>)> {
        match (&self.locktree, &self.record) {
            (Some(lt), Some(record)) => Ok((Arc::clone(lt), Arc::clone(record))),
            _ => Err(LockError::InvalidRequest(
                "lock request was never set".to_string(),
            )),
        }
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Try once without blocking
    ///
    /// Returns `LockNotGranted` after registering the request as pending,
    /// or `Deadlock` (unregistered) when waiting could never end.
    pub fn start(&mut self) -> Result<()> {
        let (lt, record) = self.parts()?;
        if self.state != RequestState::Initialized {
            return Err(LockError::InvalidRequest(format!(
                "cannot start a request in state {:?}",
                self.state
            )));
        }

        let mut conflicts = TxnIdSet::new();
        let result = lt.acquire_lock(
            record.txnid,
            &record.range,
            record.mode,
            &mut conflicts,
            record.big_txn,
        );
        match result {
            Ok(()) => {
                self.complete(&record, RequestState::Success);
                Ok(())
            }
            Err(LockError::LockNotGranted { .. }) => {
                let blocking = conflicts.first();
                self.conflicting_txnid = blocking;
                record.set_blockers(conflicts);

                let info = lt.request_info();
                let mut pending = info.pending.lock();
                record.set_state(RequestState::Pending);
                pending.push(Arc::clone(&record));

                if deadlock::has_cycle(&lt, &pending, record.txnid) {
                    pending.remove(&record);
                    drop(pending);
                    info.counters.record_deadlock();
                    self.complete(&record, RequestState::Deadlock);
                    warn!(dict_id = lt.dict_id(), txnid = record.txnid, blocking = ?blocking, range = ?record.range, "deadlock on lock request");
                    return Err(LockError::Deadlock {
                        txnid: record.txnid,
                        blocking_txnid: blocking,
                    });
                }
                drop(pending);

                self.state = RequestState::Pending;
                debug!(dict_id = lt.dict_id(), txnid = record.txnid, blocking = ?blocking, range = ?record.range, mode = %record.mode, "lock request pending");
                Err(LockError::LockNotGranted {
                    blocking_txnid: blocking,
                })
            }
            Err(e) => {
                self.complete(&record, RequestState::Failed);
                Err(e)
            }
        }
    }

    fn complete(&mut self, record: &RequestRecord, state: RequestState) {
        record.set_state(state);
        self.state = state;
    }

    // =========================================================================
    // Wait
    // =========================================================================

    /// Block until the pending request is granted, deadlocks, times out or
    /// its transaction is killed
    ///
    /// `killed` is polled every `kill_interval` (never when that is zero).
    /// `wait_needed` hears once about the holders this request waits on.
    /// Every unsuccessful exit withdraws the request.
    pub fn wait(
        &mut self,
        wait_timeout: Duration,
        kill_interval: Duration,
        killed: Option<&KilledCallback>,
        wait_needed: Option<&WaitNeededCallback>,
    ) -> Result<()> {
        let (lt, record) = self.parts()?;
        match self.state {
            RequestState::Success => return Ok(()),
            RequestState::Pending => {}
            other => {
                return Err(LockError::InvalidRequest(format!(
                    "cannot wait on a request in state {:?}",
                    other
                )))
            }
        }

        let info = lt.request_info();
        let killed = killed.filter(|_| !kill_interval.is_zero());
        let deadlock_interval = lt.deadlock_check_interval();
        let t_start = Instant::now();
        let t_end = t_start + wait_timeout.min(MAX_WAIT);
        let mut next_kill_check = t_start;

        let mut pending = info.pending.lock();

        // A release may have slipped in between start() and now
        if record.is_pending() {
            info.retry_request(&lt, &mut pending, &record);
        }
        if record.is_pending() {
            if let Some(callback) = wait_needed {
                let blockers = record.blockers();
                MutexGuard::unlocked(&mut pending, || {
                    callback(record.txnid, blockers.as_slice())
                });
            }
        }

        let outcome = loop {
            if !record.is_pending() {
                break record.state();
            }
            let now = Instant::now();

            if let Some(killed) = killed {
                if now >= next_kill_check {
                    if MutexGuard::unlocked(&mut pending, || killed(record.txnid)) {
                        if record.is_pending() {
                            pending.remove(&record);
                            record.set_state(RequestState::Killed);
                        }
                        break record.state();
                    }
                    next_kill_check = now + kill_interval;
                }
            }

            if now >= t_end {
                pending.remove(&record);
                record.set_state(RequestState::TimedOut);
                break RequestState::TimedOut;
            }

            let mut wake_at = t_end.min(now + deadlock_interval);
            if killed.is_some() {
                wake_at = wake_at.min(next_kill_check);
            }
            record.cv.wait_until(&mut pending, wake_at);

            if !record.is_pending() || info.retry_request(&lt, &mut pending, &record) {
                continue;
            }
            if deadlock::has_cycle(&lt, &pending, record.txnid) {
                pending.remove(&record);
                record.set_state(RequestState::Deadlock);
                break RequestState::Deadlock;
            }
        };
        drop(pending);

        info.counters.record_wait(t_start.elapsed());
        self.state = outcome;
        self.conflicting_txnid = record.blockers().first().or(self.conflicting_txnid);

        let txnid = record.txnid;
        let blocking_txnid = self.conflicting_txnid;
        match outcome {
            RequestState::Success => {
                debug!(dict_id = lt.dict_id(), txnid, waited = ?t_start.elapsed(), "lock granted after wait");
                Ok(())
            }
            RequestState::Deadlock => {
                info.counters.record_deadlock();
                warn!(dict_id = lt.dict_id(), txnid, blocking = ?blocking_txnid, range = ?record.range, "deadlock while waiting");
                Err(LockError::Deadlock {
                    txnid,
                    blocking_txnid,
                })
            }
            RequestState::TimedOut => {
                info.counters.record_timeout();
                warn!(dict_id = lt.dict_id(), txnid, blocking = ?blocking_txnid, range = ?record.range, "lock wait timeout");
                Err(LockError::LockWaitTimeout {
                    txnid,
                    blocking_txnid,
                })
            }
            RequestState::Killed => {
                info.counters.record_kill();
                debug!(dict_id = lt.dict_id(), txnid, "lock wait killed");
                Err(LockError::Killed { txnid })
            }
            other => Err(LockError::InvalidRequest(format!(
                "lock request ended in state {:?}",
                other
            ))),
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Retire a finished request
    pub fn destroy(&mut self) -> Result<()> {
        if !self.state.is_terminal() && self.state != RequestState::Initialized {
            return Err(LockError::InvalidRequest(
                "cannot destroy a pending lock request".to_string(),
            ));
        }
        if let Some(record) = self.record.take() {
            record.set_state(RequestState::Destroyed);
        }
        self.locktree = None;
        self.state = RequestState::Destroyed;
        Ok(())
    }

    /// Retry every pending request of `lt`, in registration order
    ///
    /// Called after locks on `lt` were released.
    pub fn retry_all_lock_requests(lt: &Locktree, wait_needed: Option<&WaitNeededCallback>) {
        lt.request_info().retry_all(lt, wait_needed);
    }
}

impl Drop for LockRequest {
    fn drop(&mut self) {
        if self.state != RequestState::Pending {
            return;
        }
        if let (Some(lt), Some(record)) = (&self.locktree, &self.record) {
            let mut pending = lt.request_info().pending.lock();
            if record.is_pending() {
                pending.remove(record);
                record.set_state(RequestState::Destroyed);
            } else if record.state() == RequestState::Success {
                warn!(dict_id = lt.dict_id(), txnid = record.txnid, range = ?record.range, "lock granted to an abandoned request");
            }
        }
    }
}

impl fmt::Debug for LockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRequest")
            .field("txnid", &self.txnid())
            .field("range", &self.range())
            .field("mode", &self.mode())
            .field("state", &self.state)
            .finish()
    }
}
