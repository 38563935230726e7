//! In-memory rule store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::RuleStore;
use crate::error::StoreError;
use crate::types::{RecurrenceRule, RuleStatus};

/// Rule store backed by a map behind an async lock.
///
/// Compare-and-swap happens under the write lock, so concurrent writers on
/// the same rule are linearized.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: RwLock<HashMap<String, RecurrenceRule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with rules.
    pub fn with_rules(rules: impl IntoIterator<Item = RecurrenceRule>) -> Self {
        Self {
            rules: RwLock::new(rules.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }

    /// Every rule, sorted by id.
    pub async fn snapshot(&self) -> Vec<RecurrenceRule> {
        let mut rules: Vec<_> = self.rules.read().await.values().cloned().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// Replace every rule with `rules`.
    pub(crate) async fn restore(&self, rules: Vec<RecurrenceRule>) {
        *self.rules.write().await = rules.into_iter().map(|r| (r.id.clone(), r)).collect();
    }

    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn insert(&self, rule: RecurrenceRule) -> Result<RecurrenceRule, StoreError> {
        let mut rules = self.rules.write().await;
        if rules.contains_key(&rule.id) {
            return Err(StoreError::Duplicate(rule.id));
        }
        rules.insert(rule.id.clone(), rule.clone());
        Ok(rule)
    }

    async fn get(&self, rule_id: &str) -> Result<Option<RecurrenceRule>, StoreError> {
        Ok(self.rules.read().await.get(rule_id).cloned())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<RecurrenceRule>, StoreError> {
        let mut rules: Vec<_> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rules)
    }

    async fn find_due(&self, before: DateTime<Utc>) -> Result<Vec<RecurrenceRule>, StoreError> {
        Ok(self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.status == RuleStatus::Active && r.next_execution_date <= before)
            .cloned()
            .collect())
    }

    async fn find_reminder_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurrenceRule>, StoreError> {
        Ok(self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.needs_reminder(now))
            .cloned()
            .collect())
    }

    async fn update_if_unchanged(
        &self,
        rule: &RecurrenceRule,
        expected_version: u64,
    ) -> Result<RecurrenceRule, StoreError> {
        let mut rules = self.rules.write().await;
        let current = rules
            .get_mut(&rule.id)
            .ok_or_else(|| StoreError::NotFound(rule.id.clone()))?;

        if current.version != expected_version {
            return Err(StoreError::Conflict {
                rule_id: rule.id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut updated = rule.clone();
        updated.version = expected_version + 1;
        *current = updated.clone();
        Ok(updated)
    }

    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|_, r| !(r.status.is_terminal() && r.updated_at < cutoff));
        Ok(before - rules.len())
    }
}
