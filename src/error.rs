//! Error types for the range lock manager
//!
//! Every outcome of a lock attempt that is not a grant is an explicit
//! variant here; nothing is signalled through panics.

use thiserror::Error;

use crate::types::TxnId;

/// Result type alias using LockError
pub type Result<T> = std::result::Result<T, LockError>;

/// Unified error type for lock manager operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    // -------------------------------------------------------------------------
    // Lock Acquisition Outcomes
    // -------------------------------------------------------------------------
    /// The range is held by someone else; the request may wait or retry.
    #[error("lock not granted, blocked by txn {blocking_txnid:?}")]
    LockNotGranted { blocking_txnid: Option<TxnId> },

    /// Waiting would close a cycle in the wait-for graph. The caller must
    /// abort and release its own locks before retrying.
    #[error("deadlock found when trying to get lock (txn {txnid}, blocked by {blocking_txnid:?})")]
    Deadlock {
        txnid: TxnId,
        blocking_txnid: Option<TxnId>,
    },

    #[error("lock wait timeout exceeded (txn {txnid}, blocked by {blocking_txnid:?})")]
    LockWaitTimeout {
        txnid: TxnId,
        blocking_txnid: Option<TxnId>,
    },

    #[error("lock wait cancelled: txn {txnid} was killed")]
    Killed { txnid: TxnId },

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    /// Lock memory is above the hard limit even after escalation.
    #[error("out of locks: {used} bytes in use, limit {limit}")]
    OutOfLocks { used: u64, limit: u64 },

    /// A tree mutation could not allocate a node. The tree is unchanged.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    // -------------------------------------------------------------------------
    // Usage Errors
    // -------------------------------------------------------------------------
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid lock request: {0}")]
    InvalidRequest(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),
}

impl LockError {
    /// True for the transient outcome of a non-blocking attempt.
    pub fn is_not_granted(&self) -> bool {
        matches!(self, LockError::LockNotGranted { .. })
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, LockError::Deadlock { .. })
    }

    /// A lock wait that ran out of time. Unlike a deadlock, this is not
    /// retried automatically; see `is_retryable`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::LockWaitTimeout { .. })
    }

    /// Whether a client would normally retry the whole transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockError::Deadlock { .. } | LockError::LockNotGranted { .. }
        )
    }

    /// The holder reported as blocking this request, if any.
    pub fn blocking_txnid(&self) -> Option<TxnId> {
        match self {
            LockError::LockNotGranted { blocking_txnid }
            | LockError::Deadlock { blocking_txnid, .. }
            | LockError::LockWaitTimeout { blocking_txnid, .. } => *blocking_txnid,
            _ => None,
        }
    }
}
