//! Locktree Manager Module
//!
//! Process-wide registry of locktrees and owner of the lock memory budget.
//!
//! ## Responsibilities
//! - Create, share and destroy locktrees by keyspace identity
//! - Account lock memory and escalate when it runs high
//! - Hold the policy callbacks every lock request is mediated with
//! - Aggregate status and diagnostics over all locktrees
//!
//! ## Memory Budget
//! ```text
//!   0 ........ escalation threshold ........ max_lock_memory
//!              crossing it arms escalation   at or above it, escalate;
//!              (big transactions escalate    still above afterwards,
//!               on their own above max/2)    OutOfLocks
//! ```
//! The memory counter is advisory: it is updated with atomics and read
//! without any lock, so the limits are enforced approximately.

mod policy;
mod status;

pub use policy::{
    KilledCallback, LockPolicy, LockTimeoutCallback, LockTimeoutInfo, WaitNeededCallback,
    WaitTimeCallback,
};
pub use status::{EscalationStats, ManagerStatus};

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::{LockError, Result};
use crate::locktree::{EscalationOutcome, Locktree};
use crate::range::Comparator;
use crate::request::{LockWaitStats, PendingLockInfo};
use crate::types::{DictionaryId, TxnId};

use status::EscalationCounters;

struct LocktreeEntry {
    locktree: Arc<Locktree>,
    refs: usize,
}

pub struct LocktreeManager {
    config: ManagerConfig,
    policy: LockPolicy,
    locktrees: Mutex<HashMap<DictionaryId, LocktreeEntry>>,

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------
    mem_used: CachePadded<AtomicU64>,
    escalation_needed: AtomicBool,

    /// Serializes escalation runs
    escalation_lock: Mutex<()>,
    escalation: EscalationCounters,

    /// Wait counters of locktrees that were already destroyed
    retired_waits: Mutex<LockWaitStats>,

    self_ref: Weak<LocktreeManager>,
}

impl LocktreeManager {
    pub fn new(config: ManagerConfig, policy: LockPolicy) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            max_lock_memory = config.max_lock_memory,
            escalation_threshold = config.escalation_threshold(),
            "lock manager created"
        );
        Ok(Arc::new_cyclic(|self_ref| Self {
            config,
            policy,
            locktrees: Mutex::new(HashMap::new()),
            mem_used: CachePadded::new(AtomicU64::new(0)),
            escalation_needed: AtomicBool::new(false),
            escalation_lock: Mutex::new(()),
            escalation: EscalationCounters::default(),
            retired_waits: Mutex::new(LockWaitStats::default()),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Reference the locktree of `dict_id`, creating it on first use
    ///
    /// `on_create` runs once, for a fresh locktree only, before anyone else
    /// can see it. It must not call back into the manager's registry.
    pub fn get_or_create<F>(&self, dict_id: DictionaryId, cmp: Comparator, on_create: F) -> Arc<Locktree>
    where
        F: FnOnce(&Locktree),
    {
        let mut locktrees = self.locktrees.lock();
        if let Some(entry) = locktrees.get_mut(&dict_id) {
            entry.refs += 1;
            return Arc::clone(&entry.locktree);
        }

        let locktree = Arc::new(Locktree::with_manager(
            dict_id,
            cmp,
            self.config.tree_node_limit,
            self.self_ref.clone(),
        ));
        on_create(&locktree);
        locktrees.insert(
            dict_id,
            LocktreeEntry {
                locktree: Arc::clone(&locktree),
                refs: 1,
            },
        );
        debug!(dict_id, name = ?locktree.name(), "locktree created");
        locktree
    }

    /// The live locktree of `dict_id`, without taking a reference
    pub fn get(&self, dict_id: DictionaryId) -> Option<Arc<Locktree>> {
        self.locktrees
            .lock()
            .get(&dict_id)
            .map(|entry| Arc::clone(&entry.locktree))
    }

    pub fn reference_lt(&self, locktree: &Locktree) {
        let mut locktrees = self.locktrees.lock();
        match locktrees.get_mut(&locktree.dict_id()) {
            Some(entry) if std::ptr::eq(Arc::as_ptr(&entry.locktree), locktree) => {
                entry.refs += 1;
            }
            _ => warn!(dict_id = locktree.dict_id(), "reference to an unregistered locktree"),
        }
    }

    /// Drop one reference. Returns true when that destroyed the locktree.
    pub fn release_lt(&self, locktree: &Locktree) -> bool {
        let mut locktrees = self.locktrees.lock();
        let dict_id = locktree.dict_id();
        let Some(entry) = locktrees.get_mut(&dict_id) else {
            warn!(dict_id, "release of an unregistered locktree");
            return false;
        };
        if !std::ptr::eq(Arc::as_ptr(&entry.locktree), locktree) {
            warn!(dict_id, "release of a stale locktree");
            return false;
        }

        entry.refs -= 1;
        if entry.refs > 0 {
            return false;
        }
        let Some(entry) = locktrees.remove(&dict_id) else {
            return false;
        };
        drop(locktrees);

        if !entry.locktree.is_empty() {
            warn!(
                dict_id,
                locks = entry.locktree.lock_count(),
                "destroying locktree that still holds locks"
            );
        }
        *self.retired_waits.lock() += entry.locktree.wait_stats();
        debug!(dict_id, "locktree destroyed");
        true
    }

    pub fn locktree_count(&self) -> usize {
        self.locktrees.lock().len()
    }

    fn live_locktrees(&self) -> Vec<Arc<Locktree>> {
        self.locktrees
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.locktree))
            .collect()
    }

    // =========================================================================
    // Memory Accounting
    // =========================================================================

    pub fn memory_used(&self) -> u64 {
        self.mem_used.load(Ordering::Relaxed)
    }

    pub fn note_mem_used(&self, bytes: u64) {
        let before = self.mem_used.fetch_add(bytes, Ordering::Relaxed);
        let threshold = self.config.escalation_threshold();
        if before < threshold && before + bytes >= threshold {
            self.escalation_needed.store(true, Ordering::Release);
            debug!(memory = before + bytes, threshold, "lock memory crossed escalation threshold");
        }
    }

    pub fn note_mem_released(&self, bytes: u64) {
        let _ = self
            .mem_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |m| {
                Some(m.saturating_sub(bytes))
            });
    }

    pub fn out_of_locks(&self) -> bool {
        self.memory_used() >= self.config.max_lock_memory
    }

    /// Enforce the memory budget before an acquisition
    pub(crate) fn check_current_lock_constraints(&self, big_txn: bool) -> Result<()> {
        if self.out_of_locks() {
            self.run_escalation();
            if self.out_of_locks() {
                return Err(LockError::OutOfLocks {
                    used: self.memory_used(),
                    limit: self.config.max_lock_memory,
                });
            }
        } else if self.escalation_needed.load(Ordering::Acquire)
            || (big_txn && self.memory_used() > self.config.big_txn_threshold())
        {
            self.run_escalation();
        }
        Ok(())
    }

    // =========================================================================
    // Escalation
    // =========================================================================

    /// Escalate locktrees, largest first, until lock memory is back under
    /// the escalation threshold. The largest one is always escalated.
    pub fn run_escalation(&self) {
        let _serial = self.escalation_lock.lock();
        self.escalation_needed.store(false, Ordering::Release);

        let start = Instant::now();
        let memory_before = self.memory_used();
        let threshold = self.config.escalation_threshold();

        let mut locktrees = self.live_locktrees();
        locktrees.sort_by_key(|lt| Reverse(lt.memory_used()));

        let mut merged = 0;
        let mut escalated = 0;
        for lt in &locktrees {
            if escalated > 0 && self.memory_used() < threshold {
                break;
            }
            merged += self.escalate_one(lt).merged();
            escalated += 1;
        }

        let elapsed = start.elapsed();
        let reclaimed = memory_before.saturating_sub(self.memory_used());
        self.escalation
            .record(elapsed, reclaimed, merged as u64);
        info!(
            locktrees = escalated,
            locks_merged = merged,
            bytes_reclaimed = reclaimed,
            memory = self.memory_used(),
            elapsed_us = elapsed.as_micros() as u64,
            "lock escalation finished"
        );
    }

    /// Escalate a single locktree, notifying the installed listener
    pub fn escalate_locktree(&self, locktree: &Locktree) -> EscalationOutcome {
        let _serial = self.escalation_lock.lock();
        self.escalate_one(locktree)
    }

    fn escalate_one(&self, locktree: &Locktree) -> EscalationOutcome {
        locktree.escalate(self.policy.range_set_listener())
    }

    // =========================================================================
    // Policy
    // =========================================================================

    /// How long `txnid` may wait for a lock
    pub fn lock_wait_timeout(&self, txnid: TxnId) -> Duration {
        self.policy
            .wait_time()
            .and_then(|f| f(txnid))
            .unwrap_or(self.config.lock_wait_timeout)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub fn status(&self) -> ManagerStatus {
        let locktrees = self.live_locktrees();
        let mut waits = *self.retired_waits.lock();
        let mut pending_requests = 0;
        let mut lock_count = 0;
        for lt in &locktrees {
            waits += lt.wait_stats();
            pending_requests += lt.request_info().pending_count();
            lock_count += lt.lock_count();
        }

        ManagerStatus {
            memory_used: self.memory_used(),
            max_lock_memory: self.config.max_lock_memory,
            escalation_threshold: self.config.escalation_threshold(),
            locktree_count: locktrees.len(),
            lock_count,
            pending_requests,
            escalation: self.escalation.snapshot(),
            waits,
        }
    }

    /// Every blocked request in every locktree
    pub fn pending_lock_requests(&self) -> Vec<PendingLockInfo> {
        self.live_locktrees()
            .iter()
            .flat_map(|lt| lt.pending_lock_requests())
            .collect()
    }
}

impl Drop for LocktreeManager {
    fn drop(&mut self) {
        let live = self.locktrees.get_mut().len();
        if live > 0 {
            warn!(locktrees = live, "lock manager destroyed with locktrees still open");
        }
    }
}

impl std::fmt::Debug for LocktreeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocktreeManager")
            .field("config", &self.config)
            .field("memory_used", &self.memory_used())
            .field("locktrees", &self.locktree_count())
            .finish()
    }
}
