//! Rule persistence.

mod file;
mod memory;

pub use file::FileRuleStore;
pub use memory::MemoryRuleStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::RecurrenceRule;

/// Persistence for recurrence rules.
///
/// Every write goes through a version check: `update_if_unchanged` only
/// succeeds if the stored rule still carries `expected_version`, and bumps
/// the version by one when it does.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Persist a new rule.
    async fn insert(&self, rule: RecurrenceRule) -> Result<RecurrenceRule, StoreError>;

    /// Get a rule by id.
    async fn get(&self, rule_id: &str) -> Result<Option<RecurrenceRule>, StoreError>;

    /// All rules of one owner, oldest first.
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<RecurrenceRule>, StoreError>;

    /// Active rules whose next execution is at or before `before`.
    async fn find_due(&self, before: DateTime<Utc>) -> Result<Vec<RecurrenceRule>, StoreError>;

    /// Active rules owing a reminder at `now` for their current due instant.
    async fn find_reminder_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurrenceRule>, StoreError>;

    /// Replace the stored rule if its version still equals `expected_version`.
    async fn update_if_unchanged(
        &self,
        rule: &RecurrenceRule,
        expected_version: u64,
    ) -> Result<RecurrenceRule, StoreError>;

    /// Delete completed/cancelled rules last written before `cutoff`.
    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}
