//! Per-locktree request bookkeeping
//!
//! Pending requests, the coalescing retry machinery and wait statistics.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use crate::error::LockError;
use crate::locktree::Locktree;
use crate::manager::WaitNeededCallback;
use crate::range::KeyRange;
use crate::types::{DictionaryId, LockMode, TxnId, TxnIdSet};

use super::RequestState;

/// Waits at least this long count as long waits
pub const LONG_WAIT_THRESHOLD: Duration = Duration::from_secs(1);

// =============================================================================
// Request Record
// =============================================================================

/// The shared half of a lock request, visible to retry passes and to
/// deadlock detection while the request is pending
pub(crate) struct RequestRecord {
    pub(crate) txnid: TxnId,
    pub(crate) range: KeyRange,
    pub(crate) mode: LockMode,
    pub(crate) big_txn: bool,
    pub(crate) client_id: u64,
    pub(crate) start_time: Instant,
    state: AtomicU8,
    blockers: Mutex<TxnIdSet>,

    /// Signalled with the pending mutex held when the request is granted
    pub(crate) cv: Condvar,
}

impl RequestRecord {
    pub(crate) fn new(txnid: TxnId, range: KeyRange, mode: LockMode, big_txn: bool, client_id: u64) -> Self {
        Self {
            txnid,
            range,
            mode,
            big_txn,
            client_id,
            start_time: Instant::now(),
            state: AtomicU8::new(RequestState::Initialized as u8),
            blockers: Mutex::new(TxnIdSet::new()),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state() == RequestState::Pending
    }

    pub(crate) fn blockers(&self) -> TxnIdSet {
        self.blockers.lock().clone()
    }

    pub(crate) fn set_blockers(&self, blockers: TxnIdSet) {
        *self.blockers.lock() = blockers;
    }
}

// =============================================================================
// Pending Set
// =============================================================================

/// Pending requests of one locktree, in registration order
#[derive(Default)]
pub(crate) struct PendingRequests {
    requests: Vec<Arc<RequestRecord>>,
}

impl PendingRequests {
    pub(crate) fn push(&mut self, record: Arc<RequestRecord>) {
        self.requests.push(record);
    }

    pub(crate) fn remove(&mut self, record: &Arc<RequestRecord>) {
        self.requests.retain(|r| !Arc::ptr_eq(r, record));
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<RequestRecord>> {
        self.requests.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}

// =============================================================================
// Wait Statistics
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct LockWaitCounters {
    waits: AtomicU64,
    wait_time_us: AtomicU64,
    long_waits: AtomicU64,
    long_wait_time_us: AtomicU64,
    timeouts: AtomicU64,
    deadlocks: AtomicU64,
    kills: AtomicU64,
}

impl LockWaitCounters {
    pub(crate) fn record_wait(&self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.wait_time_us.fetch_add(us, Ordering::Relaxed);
        if elapsed >= LONG_WAIT_THRESHOLD {
            self.long_waits.fetch_add(1, Ordering::Relaxed);
            self.long_wait_time_us.fetch_add(us, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deadlock(&self) {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_kill(&self) {
        self.kills.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LockWaitStats {
        LockWaitStats {
            waits: self.waits.load(Ordering::Relaxed),
            wait_time: Duration::from_micros(self.wait_time_us.load(Ordering::Relaxed)),
            long_waits: self.long_waits.load(Ordering::Relaxed),
            long_wait_time: Duration::from_micros(self.long_wait_time_us.load(Ordering::Relaxed)),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
            kills: self.kills.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a locktree's wait counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockWaitStats {
    /// Requests that blocked in `wait`
    pub waits: u64,
    pub wait_time: Duration,
    /// Waits that lasted at least one second
    pub long_waits: u64,
    pub long_wait_time: Duration,
    pub timeouts: u64,
    pub deadlocks: u64,
    pub kills: u64,
}

impl AddAssign for LockWaitStats {
    fn add_assign(&mut self, other: Self) {
        self.waits += other.waits;
        self.wait_time += other.wait_time;
        self.long_waits += other.long_waits;
        self.long_wait_time += other.long_wait_time;
        self.timeouts += other.timeouts;
        self.deadlocks += other.deadlocks;
        self.kills += other.kills;
    }
}

/// One blocked request, as shown by the lock-waits diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLockInfo {
    pub dict_id: DictionaryId,
    pub txnid: TxnId,
    pub blocking_txnid: Option<TxnId>,
    pub range: KeyRange,
    pub mode: LockMode,
    pub start_time: Instant,
    pub client_id: u64,
}

// =============================================================================
// Lock Request Info
// =============================================================================

#[derive(Default)]
struct RetryState {
    running: bool,
    done: u64,
}

/// Everything a locktree keeps about its lock requests
///
/// Lock order: `pending` before any tree node. The retry mutex is never
/// held while `pending` is taken.
pub(crate) struct LockRequestInfo {
    pub(crate) pending: Mutex<PendingRequests>,
    retry_want: AtomicU64,
    retry: Mutex<RetryState>,
    retry_cv: Condvar,
    pub(crate) counters: LockWaitCounters,
}

impl LockRequestInfo {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(PendingRequests::default()),
            retry_want: AtomicU64::new(0),
            retry: Mutex::new(RetryState::default()),
            retry_cv: Condvar::new(),
            counters: LockWaitCounters::default(),
        }
    }

    /// Try a registered request again. On success it leaves the pending
    /// set and its waiter is woken.
    pub(crate) fn retry_request(
        &self,
        lt: &Locktree,
        pending: &mut PendingRequests,
        record: &Arc<RequestRecord>,
    ) -> bool {
        let mut conflicts = TxnIdSet::new();
        match lt.acquire_lock(record.txnid, &record.range, record.mode, &mut conflicts, record.big_txn) {
            Ok(()) => {
                pending.remove(record);
                record.set_state(RequestState::Success);
                record.cv.notify_one();
                debug!(dict_id = lt.dict_id(), txnid = record.txnid, range = ?record.range, "pending lock granted");
                true
            }
            Err(LockError::LockNotGranted { .. }) => {
                record.set_blockers(conflicts);
                false
            }
            Err(e) => {
                // Stays pending; memory pressure may clear before the wait ends
                debug!(dict_id = lt.dict_id(), txnid = record.txnid, error = %e, "retry failed");
                false
            }
        }
    }

    /// Retry every pending request once, coalescing with concurrent callers
    ///
    /// A caller whose generation is already covered by a pass that started
    /// after it asked returns without running its own.
    pub(crate) fn retry_all(&self, lt: &Locktree, wait_needed: Option<&WaitNeededCallback>) {
        let my_gen = self.retry_want.fetch_add(1, Ordering::SeqCst) + 1;

        let mut state = self.retry.lock();
        let still_waiting = loop {
            if state.done >= my_gen {
                return;
            }
            if !state.running {
                state.running = true;
                state.done = self.retry_want.load(Ordering::SeqCst);
                let still_waiting = MutexGuard::unlocked(&mut state, || self.retry_pass(lt));
                state.running = false;
                self.retry_cv.notify_all();
                break still_waiting;
            }
            self.retry_cv.wait(&mut state);
        };
        drop(state);

        if let Some(callback) = wait_needed {
            for (txnid, blockers) in still_waiting {
                callback(txnid, blockers.as_slice());
            }
        }
    }

    /// Returns the requests still blocked afterwards, with their blockers
    fn retry_pass(&self, lt: &Locktree) -> Vec<(TxnId, TxnIdSet)> {
        let mut pending = self.pending.lock();
        let snapshot: Vec<Arc<RequestRecord>> = pending.iter().cloned().collect();
        let mut still_waiting = Vec::new();
        for record in snapshot.iter().filter(|r| r.is_pending()) {
            if !self.retry_request(lt, &mut pending, record) {
                still_waiting.push((record.txnid, record.blockers()));
            }
        }
        still_waiting
    }

    pub(crate) fn pending_lock_requests(&self, dict_id: DictionaryId) -> Vec<PendingLockInfo> {
        self.pending
            .lock()
            .iter()
            .map(|r| PendingLockInfo {
                dict_id,
                txnid: r.txnid,
                blocking_txnid: r.blockers().first(),
                range: r.range.clone(),
                mode: r.mode,
                start_time: r.start_time,
                client_id: r.client_id,
            })
            .collect()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_waits_are_counted_separately() {
        let counters = LockWaitCounters::default();
        counters.record_wait(Duration::from_millis(10));
        counters.record_wait(Duration::from_millis(1500));
        counters.record_deadlock();

        let stats = counters.snapshot();
        assert_eq!(stats.waits, 2);
        assert_eq!(stats.long_waits, 1);
        assert_eq!(stats.long_wait_time, Duration::from_millis(1500));
        assert_eq!(stats.deadlocks, 1);

        let mut total = LockWaitStats::default();
        total += stats;
        total += stats;
        assert_eq!(total.waits, 4);
    }
}
