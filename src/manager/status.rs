//! Manager status counters

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::request::LockWaitStats;

#[derive(Debug, Default)]
pub(crate) struct EscalationCounters {
    count: AtomicU64,
    time_us: AtomicU64,
    bytes_reclaimed: AtomicU64,
    locks_merged: AtomicU64,
}

impl EscalationCounters {
    pub(crate) fn record(&self, elapsed: Duration, bytes_reclaimed: u64, locks_merged: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(bytes_reclaimed, Ordering::Relaxed);
        self.locks_merged.fetch_add(locks_merged, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> EscalationStats {
        EscalationStats {
            count: self.count.load(Ordering::Relaxed),
            time: Duration::from_micros(self.time_us.load(Ordering::Relaxed)),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            locks_merged: self.locks_merged.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EscalationStats {
    /// Completed escalation runs
    pub count: u64,
    pub time: Duration,
    pub bytes_reclaimed: u64,
    pub locks_merged: u64,
}

/// Snapshot of the whole lock manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStatus {
    pub memory_used: u64,
    pub max_lock_memory: u64,
    pub escalation_threshold: u64,
    pub locktree_count: usize,
    pub lock_count: usize,
    pub pending_requests: usize,
    pub escalation: EscalationStats,

    /// Summed over live and already destroyed locktrees
    pub waits: LockWaitStats,
}

impl fmt::Display for ManagerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "memory: {} / {} bytes (escalate at {})",
            self.memory_used, self.max_lock_memory, self.escalation_threshold
        )?;
        writeln!(
            f,
            "locktrees: {}, locks: {}, pending: {}",
            self.locktree_count, self.lock_count, self.pending_requests
        )?;
        writeln!(
            f,
            "escalations: {} ({:?}, {} bytes, {} locks merged)",
            self.escalation.count,
            self.escalation.time,
            self.escalation.bytes_reclaimed,
            self.escalation.locks_merged
        )?;
        write!(
            f,
            "waits: {} ({:?}), long: {}, timeouts: {}, deadlocks: {}, kills: {}",
            self.waits.waits,
            self.waits.wait_time,
            self.waits.long_waits,
            self.waits.timeouts,
            self.waits.deadlocks,
            self.waits.kills
        )
    }
}
