//! Pre-execution reminders.
//!
//! A reminder is owed once per due instant. The poller first records the
//! due instant in `last_notified_for` under the version guard and only then
//! dispatches, so overlapping ticks cannot both send it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Notifier, TemplateKind};
use crate::error::{SchedulerError, StoreError};
use crate::store::RuleStore;
use crate::types::RecurrenceRule;

/// Counts from one reminder tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReminderTickSummary {
    pub candidates: usize,
    pub sent: usize,
    pub failed: usize,
    /// Candidates another tick marked first.
    pub already_notified: usize,
}

pub struct ReminderPoller {
    store: Arc<dyn RuleStore>,
    notifier: Arc<dyn Notifier>,
}

impl ReminderPoller {
    pub fn new(store: Arc<dyn RuleStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Send the reminders owed at `now`.
    ///
    /// A rule that cannot be marked is counted as failed and the pass goes on;
    /// only a failing candidate query aborts it.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<ReminderTickSummary, SchedulerError> {
        let candidates = self.store.find_reminder_candidates(now).await?;
        let mut summary = ReminderTickSummary {
            candidates: candidates.len(),
            ..ReminderTickSummary::default()
        };

        for rule in candidates {
            if !rule.needs_reminder(now) {
                summary.already_notified += 1;
                continue;
            }

            let mut marked = rule.clone();
            marked.last_notified_for = Some(rule.next_execution_date);
            marked.updated_at = now;
            match self.store.update_if_unchanged(&marked, rule.version).await {
                Ok(_) => {}
                Err(StoreError::Conflict { .. }) => {
                    debug!(rule_id = %rule.id, "rule changed before reminder could be marked");
                    summary.already_notified += 1;
                    continue;
                }
                Err(e) => {
                    error!(rule_id = %rule.id, error = %e, "failed to mark reminder");
                    summary.failed += 1;
                    continue;
                }
            }

            match self
                .notifier
                .notify(&rule.owner_id, TemplateKind::UpcomingExecution, payload(&rule))
                .await
            {
                Ok(()) => summary.sent += 1,
                Err(e) => {
                    // Marked already: a lost reminder is preferred over a duplicate
                    warn!(rule_id = %rule.id, error = %e, "failed to send reminder");
                    summary.failed += 1;
                }
            }
        }

        if summary.candidates > 0 {
            info!(
                candidates = summary.candidates,
                sent = summary.sent,
                failed = summary.failed,
                already_notified = summary.already_notified,
                "reminder tick finished"
            );
        }
        Ok(summary)
    }
}

fn payload(rule: &RecurrenceRule) -> serde_json::Value {
    json!({
        "rule_id": rule.id,
        "description": rule.description,
        "amount": rule.adjusted_amount().to_string(),
        "kind": rule.kind,
        "due_at": rule.next_execution_date,
    })
}
