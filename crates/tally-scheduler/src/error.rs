//! Error types for the scheduling engine.

use thiserror::Error;

use crate::lifecycle::LifecycleAction;
use crate::types::RuleStatus;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Requested lifecycle change is not legal from the rule's current status.
    #[error("cannot {action} a rule that is {from}")]
    InvalidStateTransition {
        from: RuleStatus,
        action: LifecycleAction,
    },

    /// The ledger failed to create the transaction for a due rule.
    #[error("materialization failed for rule {rule_id}: {source}")]
    Materialization {
        rule_id: String,
        #[source]
        source: LedgerError,
    },

    /// Another writer changed the rule since it was read.
    #[error("concurrent update on rule {rule_id}")]
    ConcurrencyConflict { rule_id: String },

    /// Malformed recurrence specification.
    #[error("invalid recurrence: {0}")]
    InvalidRecurrenceSpec(String),

    /// Rule not found.
    #[error("rule not found: {0}")]
    RuleNotFound(String),

    /// Rule store failure.
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { rule_id, .. } => SchedulerError::ConcurrencyConflict { rule_id },
            StoreError::NotFound(rule_id) => SchedulerError::RuleNotFound(rule_id),
            other => SchedulerError::Store(other),
        }
    }
}

/// Errors raised by a rule store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Version guard rejected the write.
    #[error("version conflict on {rule_id}: expected {expected}, found {actual}")]
    Conflict {
        rule_id: String,
        expected: u64,
        actual: u64,
    },

    /// Rule not found.
    #[error("rule not found: {0}")]
    NotFound(String),

    /// A rule with this id already exists.
    #[error("rule already exists: {0}")]
    Duplicate(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by the ledger collaborator.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// The ledger refused the transaction.
    #[error("ledger rejected transaction: {0}")]
    Rejected(String),

    /// The ledger could not be reached or answered garbage.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by the notification collaborator.
#[derive(Debug, Clone, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_conflict_maps_to_concurrency_conflict() {
        let err: SchedulerError = StoreError::Conflict {
            rule_id: "r1".to_string(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert!(matches!(err, SchedulerError::ConcurrencyConflict { rule_id } if rule_id == "r1"));
    }

    #[test]
    fn test_store_not_found_maps_to_rule_not_found() {
        let err: SchedulerError = StoreError::NotFound("r2".to_string()).into();
        assert!(matches!(err, SchedulerError::RuleNotFound(id) if id == "r2"));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = SchedulerError::InvalidStateTransition {
            from: RuleStatus::Cancelled,
            action: LifecycleAction::Pause,
        };
        assert_eq!(err.to_string(), "cannot pause a rule that is cancelled");
    }
}
