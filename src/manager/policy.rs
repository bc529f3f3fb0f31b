//! Policy callbacks shared by every request the manager mediates

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::locktree::RangeSetListener;
use crate::range::KeyRange;
use crate::types::{DictionaryId, LockMode, TxnId};

/// Has this transaction's session been killed?
pub type KilledCallback = dyn Fn(TxnId) -> bool + Send + Sync;

/// A transaction is about to block on these holders
pub type WaitNeededCallback = dyn Fn(TxnId, &[TxnId]) + Send + Sync;

/// A lock attempt ended in deadlock, timeout or kill
pub type LockTimeoutCallback = dyn Fn(&LockTimeoutInfo) + Send + Sync;

/// Per-transaction override of the lock wait timeout
pub type WaitTimeCallback = dyn Fn(TxnId) -> Option<Duration> + Send + Sync;

/// What the lock-timeout callback is told
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTimeoutInfo {
    pub dict_id: DictionaryId,
    pub locktree_name: Option<String>,
    pub txnid: TxnId,
    pub blocking_txnid: Option<TxnId>,
    pub range: KeyRange,
    pub mode: LockMode,
    pub deadlock: bool,
}

/// Callbacks installed into a manager at construction
#[derive(Clone, Default)]
pub struct LockPolicy {
    killed: Option<Arc<KilledCallback>>,
    wait_needed: Option<Arc<WaitNeededCallback>>,
    lock_timeout: Option<Arc<LockTimeoutCallback>>,
    wait_time: Option<Arc<WaitTimeCallback>>,
    range_set_listener: Option<Arc<dyn RangeSetListener>>,
}

impl LockPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_killed<F>(mut self, f: F) -> Self
    where
        F: Fn(TxnId) -> bool + Send + Sync + 'static,
    {
        self.killed = Some(Arc::new(f));
        self
    }

    pub fn with_wait_needed<F>(mut self, f: F) -> Self
    where
        F: Fn(TxnId, &[TxnId]) + Send + Sync + 'static,
    {
        self.wait_needed = Some(Arc::new(f));
        self
    }

    pub fn with_lock_timeout<F>(mut self, f: F) -> Self
    where
        F: Fn(&LockTimeoutInfo) + Send + Sync + 'static,
    {
        self.lock_timeout = Some(Arc::new(f));
        self
    }

    pub fn with_wait_time<F>(mut self, f: F) -> Self
    where
        F: Fn(TxnId) -> Option<Duration> + Send + Sync + 'static,
    {
        self.wait_time = Some(Arc::new(f));
        self
    }

    /// Who rewrites transaction ledgers after escalation
    pub fn with_range_set_listener(mut self, listener: Arc<dyn RangeSetListener>) -> Self {
        self.range_set_listener = Some(listener);
        self
    }

    pub fn killed(&self) -> Option<&KilledCallback> {
        self.killed.as_deref()
    }

    pub fn wait_needed(&self) -> Option<&WaitNeededCallback> {
        self.wait_needed.as_deref()
    }

    pub fn lock_timeout(&self) -> Option<&LockTimeoutCallback> {
        self.lock_timeout.as_deref()
    }

    pub fn wait_time(&self) -> Option<&WaitTimeCallback> {
        self.wait_time.as_deref()
    }

    pub fn range_set_listener(&self) -> Option<&dyn RangeSetListener> {
        self.range_set_listener.as_deref()
    }
}

impl fmt::Debug for LockPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockPolicy")
            .field("killed", &self.killed.is_some())
            .field("wait_needed", &self.wait_needed.is_some())
            .field("lock_timeout", &self.lock_timeout.is_some())
            .field("wait_time", &self.wait_time.is_some())
            .field("range_set_listener", &self.range_set_listener.is_some())
            .finish()
    }
}
