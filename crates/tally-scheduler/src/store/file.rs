//! JSON-file rule store.
//! Rules are kept in memory and written out as one pretty-printed snapshot
//! after every change. A change whose snapshot cannot be written is rolled
//! back in memory. Meant for a single scheduler process.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{MemoryRuleStore, RuleStore};
use crate::error::StoreError;
use crate::types::RecurrenceRule;

/// Rule store persisted to a JSON file.
#[derive(Debug)]
pub struct FileRuleStore {
    path: PathBuf,
    rules: MemoryRuleStore,
    /// Serializes write+flush so snapshots never interleave.
    write_lock: Mutex<()>,
}

impl FileRuleStore {
    /// Open the store at `path`, loading existing rules if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let rules = match tokio::fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str::<Vec<RecurrenceRule>>(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(count = rules.len(), path = %path.display(), "loaded rules");

        Ok(Self {
            path,
            rules: MemoryRuleStore::with_rules(rules),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current snapshot via a temp file and rename.
    async fn flush(&self) -> Result<(), StoreError> {
        let rules = self.rules.snapshot().await;
        let json = serde_json::to_string_pretty(&rules)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(count = rules.len(), path = %self.path.display(), "saved rules");
        Ok(())
    }

    /// Flush, or put the in-memory rules back to `previous` if that fails.
    async fn flush_or_restore(&self, previous: Vec<RecurrenceRule>) -> Result<(), StoreError> {
        if let Err(e) = self.flush().await {
            warn!(path = %self.path.display(), error = %e, "failed to save rules, change rolled back");
            self.rules.restore(previous).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl RuleStore for FileRuleStore {
    async fn insert(&self, rule: RecurrenceRule) -> Result<RecurrenceRule, StoreError> {
        let _guard = self.write_lock.lock().await;
        let previous = self.rules.snapshot().await;
        let rule = self.rules.insert(rule).await?;
        self.flush_or_restore(previous).await?;
        Ok(rule)
    }

    async fn get(&self, rule_id: &str) -> Result<Option<RecurrenceRule>, StoreError> {
        self.rules.get(rule_id).await
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<RecurrenceRule>, StoreError> {
        self.rules.list_by_owner(owner_id).await
    }

    async fn find_due(&self, before: DateTime<Utc>) -> Result<Vec<RecurrenceRule>, StoreError> {
        self.rules.find_due(before).await
    }

    async fn find_reminder_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurrenceRule>, StoreError> {
        self.rules.find_reminder_candidates(now).await
    }

    async fn update_if_unchanged(
        &self,
        rule: &RecurrenceRule,
        expected_version: u64,
    ) -> Result<RecurrenceRule, StoreError> {
        let _guard = self.write_lock.lock().await;
        let previous = self.rules.snapshot().await;
        let updated = self.rules.update_if_unchanged(rule, expected_version).await?;
        self.flush_or_restore(previous).await?;
        Ok(updated)
    }

    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let previous = self.rules.snapshot().await;
        let deleted = self.rules.delete_terminal_older_than(cutoff).await?;
        if deleted > 0 {
            self.flush_or_restore(previous).await?;
        }
        Ok(deleted)
    }
}
