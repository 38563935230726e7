//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default due-check poll interval (1 hour).
const DEFAULT_DUE_POLL_SECS: u64 = 3600;

/// Default reminder poll interval (6 hours).
const DEFAULT_REMINDER_POLL_SECS: u64 = 6 * 3600;

/// Default housekeeping interval (daily).
const DEFAULT_HOUSEKEEPING_SECS: u64 = 24 * 3600;

/// Default retention for completed/cancelled rules.
const DEFAULT_RETENTION_DAYS: u64 = 90;

/// Default per-tick parallelism.
const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// Default consecutive ledger failures before a rule is paused.
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Default execution claim lease (5 minutes).
const DEFAULT_CLAIM_LEASE_SECS: u64 = 300;

/// Default retries for lifecycle writes that hit a version conflict.
const DEFAULT_LIFECYCLE_RETRY_ATTEMPTS: u32 = 3;

/// Configuration for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval in seconds between due-rule scans.
    pub due_poll_interval_secs: u64,
    /// Interval in seconds between reminder scans.
    pub reminder_poll_interval_secs: u64,
    /// Interval in seconds between housekeeping sweeps.
    pub housekeeping_interval_secs: u64,
    /// Days a completed/cancelled rule is kept before deletion.
    pub retention_days: u64,
    /// Rules materialized concurrently within one tick.
    pub worker_pool_size: usize,
    /// Consecutive ledger failures before a rule is paused.
    pub max_consecutive_failures: u32,
    /// Seconds an execution claim is honoured before it counts as abandoned.
    pub claim_lease_secs: u64,
    /// Attempts for lifecycle writes that race another writer.
    pub lifecycle_retry_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            due_poll_interval_secs: DEFAULT_DUE_POLL_SECS,
            reminder_poll_interval_secs: DEFAULT_REMINDER_POLL_SECS,
            housekeeping_interval_secs: DEFAULT_HOUSEKEEPING_SECS,
            retention_days: DEFAULT_RETENTION_DAYS,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            claim_lease_secs: DEFAULT_CLAIM_LEASE_SECS,
            lifecycle_retry_attempts: DEFAULT_LIFECYCLE_RETRY_ATTEMPTS,
        }
    }
}

impl SchedulerConfig {
    pub fn due_poll_interval(&self) -> Duration {
        Duration::from_secs(self.due_poll_interval_secs.max(1))
    }

    pub fn reminder_poll_interval(&self) -> Duration {
        Duration::from_secs(self.reminder_poll_interval_secs.max(1))
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs.max(1))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_lease_secs as i64)
    }

    /// Worker pool size, never zero.
    pub fn workers(&self) -> usize {
        self.worker_pool_size.max(1)
    }
}
