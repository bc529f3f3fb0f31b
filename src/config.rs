//! Configuration for the lock manager
//!
//! Centralized configuration with sensible defaults.

use std::time::Duration;

use crate::error::{LockError, Result};

/// Default hard limit on lock memory (64 MB)
pub const DEFAULT_MAX_LOCK_MEMORY: u64 = 64 * 1024 * 1024;

/// Default time a blocked request waits before giving up
pub const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_millis(4000);

/// Default interval between "was this session killed" checks
pub const DEFAULT_KILL_CHECK_INTERVAL: Duration = Duration::from_millis(4000);

/// Default interval between wait-for graph inspections of a blocked request
pub const DEFAULT_DEADLOCK_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Main configuration for a LocktreeManager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    // -------------------------------------------------------------------------
    // Memory Configuration
    // -------------------------------------------------------------------------
    /// Hard limit on lock memory (in bytes). Once usage is above it even
    /// after escalation, new lock attempts fail with `OutOfLocks`.
    pub max_lock_memory: u64,

    /// High-water mark (in bytes) whose crossing arms escalation.
    /// `None` means half of `max_lock_memory`.
    pub escalation_threshold: Option<u64>,

    /// Optional cap on the number of nodes one range tree may allocate
    pub tree_node_limit: Option<usize>,

    // -------------------------------------------------------------------------
    // Wait Policy
    // -------------------------------------------------------------------------
    /// How long a blocked request waits unless the policy overrides it
    pub lock_wait_timeout: Duration,

    /// How often a blocked request asks whether its session was killed.
    /// Zero disables the periodic kill check.
    pub kill_check_interval: Duration,

    /// How often a blocked request re-inspects the wait-for graph
    pub deadlock_check_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_lock_memory: DEFAULT_MAX_LOCK_MEMORY,
            escalation_threshold: None,
            tree_node_limit: None,
            lock_wait_timeout: DEFAULT_LOCK_WAIT_TIMEOUT,
            kill_check_interval: DEFAULT_KILL_CHECK_INTERVAL,
            deadlock_check_interval: DEFAULT_DEADLOCK_CHECK_INTERVAL,
        }
    }
}

impl ManagerConfig {
    /// Create a new config builder
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }

    /// The effective escalation high-water mark
    pub fn escalation_threshold(&self) -> u64 {
        self.escalation_threshold
            .unwrap_or(self.max_lock_memory / 2)
    }

    /// Memory level above which big transactions escalate eagerly
    pub fn big_txn_threshold(&self) -> u64 {
        self.max_lock_memory / 2
    }

    /// Check that the values are usable together
    pub fn validate(&self) -> Result<()> {
        if self.max_lock_memory == 0 {
            return Err(LockError::Config(
                "max_lock_memory must be greater than zero".to_string(),
            ));
        }
        if self.escalation_threshold() > self.max_lock_memory {
            return Err(LockError::Config(format!(
                "escalation threshold {} exceeds max_lock_memory {}",
                self.escalation_threshold(),
                self.max_lock_memory
            )));
        }
        if self.deadlock_check_interval.is_zero() {
            return Err(LockError::Config(
                "deadlock_check_interval must be non-zero".to_string(),
            ));
        }
        if self.tree_node_limit == Some(0) {
            return Err(LockError::Config(
                "tree_node_limit must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for ManagerConfig
#[derive(Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Set the hard lock memory limit (in bytes)
    pub fn max_lock_memory(mut self, bytes: u64) -> Self {
        self.config.max_lock_memory = bytes;
        self
    }

    /// Set the escalation high-water mark (in bytes)
    pub fn escalation_threshold(mut self, bytes: u64) -> Self {
        self.config.escalation_threshold = Some(bytes);
        self
    }

    /// Cap the number of nodes per range tree
    pub fn tree_node_limit(mut self, nodes: usize) -> Self {
        self.config.tree_node_limit = Some(nodes);
        self
    }

    /// Set the default lock wait timeout
    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_wait_timeout = timeout;
        self
    }

    /// Set the kill check interval
    pub fn kill_check_interval(mut self, interval: Duration) -> Self {
        self.config.kill_check_interval = interval;
        self
    }

    /// Set the deadlock check interval
    pub fn deadlock_check_interval(mut self, interval: Duration) -> Self {
        self.config.deadlock_check_interval = interval;
        self
    }

    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_threshold_is_half_of_max() {
        let config = ManagerConfig::builder().max_lock_memory(1000).build();
        assert_eq!(config.escalation_threshold(), 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_above_max_is_rejected() {
        let config = ManagerConfig::builder()
            .max_lock_memory(1000)
            .escalation_threshold(2000)
            .build();
        assert!(matches!(config.validate(), Err(LockError::Config(_))));
    }

    #[test]
    fn test_zero_deadlock_interval_is_rejected() {
        let config = ManagerConfig::builder()
            .deadlock_check_interval(Duration::ZERO)
            .build();
        assert!(config.validate().is_err());
    }
}
