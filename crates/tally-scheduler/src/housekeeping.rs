//! Retention sweep for terminated rules.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::error::SchedulerError;
use crate::store::RuleStore;

/// Deletes completed and cancelled rules once they are past retention.
pub struct Housekeeper {
    store: Arc<dyn RuleStore>,
    retention: Duration,
}

impl Housekeeper {
    pub fn new(store: Arc<dyn RuleStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// Returns how many rules were deleted.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let cutoff = now - self.retention;
        let deleted = self.store.delete_terminal_older_than(cutoff).await?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "removed terminated rules past retention");
        }
        Ok(deleted)
    }
}
