//! # rangelock
//!
//! Row and range lock manager for a transactional storage engine:
//! - Concurrent range tree locked per subtree, not globally
//! - Shared (READ) and exclusive (WRITE) range locks with consolidation
//! - Blocking waits with live wait-for cycle detection, timeouts and kills
//! - Lock escalation under a global memory budget
//! - Nested transactions locking under their root
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Row Access / Transactions                   │
//! │      get_range_lock · start_range_lock · wait_range_lock    │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────┐    ┌──────────────────────────────┐
//! │       Lock Request       │    │     Transaction Ledger       │
//! │ start · wait · deadlock  │    │  granted ranges per locktree │
//! └──────────────┬───────────┘    └──────────────▲───────────────┘
//!                │                               │ escalation rewrites
//!                ▼                               │
//! ┌─────────────────────────────────────────────┴───────────────┐
//! │                  Locktree (one per keyspace)                │
//! │       acquire · release · pending requests · escalate       │
//! └──────────────┬──────────────────────────────────────────────┘
//!                │
//!                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Concurrent Range Tree                      │
//! │         hand-over-hand node locks · rotations               │
//! └─────────────────────────────────────────────────────────────┘
//!
//!   LocktreeManager: registry of locktrees, memory budget, policy
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use rangelock::{
//!     get_range_lock, Comparator, Key, LockMode, LockPolicy, LocktreeManager,
//!     ManagerConfig, Transaction, TxnRegistry,
//! };
//!
//! let registry = Arc::new(TxnRegistry::new());
//! let policy = LockPolicy::new().with_range_set_listener(registry.clone());
//! let manager = LocktreeManager::new(ManagerConfig::default(), policy).unwrap();
//! let lt = manager.get_or_create(1, Comparator::bytewise(), |_| {});
//!
//! let txn = Transaction::begin(&manager, &registry);
//! get_range_lock(&txn, &lt, Key::from("a"), Key::from("f"), LockMode::Write).unwrap();
//! txn.commit();
//!
//! assert!(lt.is_empty());
//! manager.release_lt(&lt);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod types;

pub mod range;
pub mod tree;
pub mod locktree;
pub mod request;
pub mod manager;
pub mod txn;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{LockError, Result};
pub use config::ManagerConfig;
pub use types::{DictionaryId, LockMode, TxnId, TxnIdSet};
pub use range::{Comparator, Key, KeyComparator, KeyRange, RangeBuffer};
pub use tree::{ConcurrentTree, RowLock};
pub use locktree::{Locktree, RangeSetListener};
pub use request::{LockRequest, RequestState};
pub use manager::{LockPolicy, LocktreeManager, ManagerStatus};
pub use txn::{get_range_lock, start_range_lock, wait_range_lock, Transaction, TxnRegistry};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of rangelock
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
