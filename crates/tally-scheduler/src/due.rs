//! Due-execution poller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream;
use tracing::{debug, error, info};

use crate::error::SchedulerError;
use crate::materializer::{ExecutionMode, MaterializeOutcome, Materializer};
use crate::store::RuleStore;

/// Counts from one due tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DueTickSummary {
    /// Active rules whose next execution was at or before the tick.
    pub selected: usize,
    pub executed: usize,
    pub failed: usize,
    /// Rules another executor got to first.
    pub conflicts: usize,
    /// Selected but held back (retry backoff, live claim, changed status).
    pub skipped: usize,
}

/// Selects due rules and materializes them with bounded parallelism.
pub struct DuePoller {
    store: Arc<dyn RuleStore>,
    materializer: Arc<Materializer>,
    workers: usize,
}

impl DuePoller {
    pub fn new(store: Arc<dyn RuleStore>, materializer: Arc<Materializer>, workers: usize) -> Self {
        Self {
            store,
            materializer,
            workers: workers.max(1),
        }
    }

    /// Run one selection pass at `now`.
    ///
    /// A failing rule never aborts the pass; only a failing store query does.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<DueTickSummary, SchedulerError> {
        let candidates = self.store.find_due(now).await?;
        let mut summary = DueTickSummary {
            selected: candidates.len(),
            ..DueTickSummary::default()
        };

        let (due, held): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|r| r.is_due(now));
        summary.skipped += held.len();
        for rule in &held {
            debug!(rule_id = %rule.id, retry_after = ?rule.retry_after, "rule held back");
        }

        let results: Vec<_> = stream::iter(due)
            .map(|rule| {
                let materializer = self.materializer.clone();
                async move {
                    let rule_id = rule.id.clone();
                    let result = materializer
                        .execute_rule(rule, ExecutionMode::Scheduled, now)
                        .await;
                    (rule_id, result)
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for (rule_id, result) in results {
            match result {
                Ok(MaterializeOutcome::Executed { .. }) => summary.executed += 1,
                Ok(MaterializeOutcome::Failed { .. }) => summary.failed += 1,
                Ok(MaterializeOutcome::Conflict) => summary.conflicts += 1,
                Ok(MaterializeOutcome::NotDue | MaterializeOutcome::Inactive(_)) => {
                    summary.skipped += 1
                }
                Err(e) => {
                    error!(rule_id = %rule_id, error = %e, "rule execution errored");
                    summary.failed += 1;
                }
            }
        }

        if summary.selected > 0 {
            info!(
                selected = summary.selected,
                executed = summary.executed,
                failed = summary.failed,
                conflicts = summary.conflicts,
                skipped = summary.skipped,
                "due tick finished"
            );
        } else {
            debug!("no rules due");
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::RecurrenceCalculator;
    use crate::config::SchedulerConfig;
    use crate::store::MemoryRuleStore;
    use crate::testing::{RecordingLedger, RecordingNotifier, active_rule, utc};
    use crate::types::{Frequency, RecurrenceRule, RuleStatus};
    use pretty_assertions::assert_eq;

    fn poller(
        rules: Vec<RecurrenceRule>,
        ledger: RecordingLedger,
    ) -> (DuePoller, Arc<MemoryRuleStore>, Arc<RecordingLedger>) {
        let store = Arc::new(MemoryRuleStore::with_rules(rules));
        let ledger = Arc::new(ledger);
        let materializer = Arc::new(Materializer::new(
            store.clone(),
            ledger.clone(),
            Arc::new(RecordingNotifier::new()),
            RecurrenceCalculator::default(),
            &SchedulerConfig::default(),
        ));
        (DuePoller::new(store.clone(), materializer, 4), store, ledger)
    }

    #[tokio::test]
    async fn test_paused_and_cancelled_rules_never_selected() {
        let mut paused = active_rule("paused", Frequency::Daily, utc(2025, 1, 1));
        paused.status = RuleStatus::Paused;
        let mut cancelled = active_rule("cancelled", Frequency::Daily, utc(2025, 1, 1));
        cancelled.status = RuleStatus::Cancelled;
        let (poller, _, ledger) = poller(
            vec![
                paused,
                cancelled,
                active_rule("active", Frequency::Daily, utc(2025, 1, 1)),
            ],
            RecordingLedger::new(),
        );

        let summary = poller.tick(utc(2025, 1, 10)).await.unwrap();

        assert_eq!(
            summary,
            DueTickSummary {
                selected: 1,
                executed: 1,
                ..DueTickSummary::default()
            }
        );
        assert_eq!(ledger.last().unwrap().source_rule_id, "active");
    }

    #[tokio::test]
    async fn test_one_execution_per_tick_even_when_far_behind() {
        let (poller, store, ledger) = poller(
            vec![active_rule("r1", Frequency::Daily, utc(2025, 1, 1))],
            RecordingLedger::new(),
        );

        poller.tick(utc(2025, 1, 10)).await.unwrap();

        assert_eq!(ledger.count(), 1);
        let rule = store.get("r1").await.unwrap().unwrap();
        assert_eq!(rule.next_execution_date, utc(2025, 1, 2));
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_tick() {
        let (poller, _, ledger) = poller(
            vec![
                active_rule("a", Frequency::Daily, utc(2025, 1, 1)),
                active_rule("b", Frequency::Daily, utc(2025, 1, 1)),
                active_rule("c", Frequency::Daily, utc(2025, 1, 1)),
            ],
            RecordingLedger::failing(1),
        );

        let summary = poller.tick(utc(2025, 1, 1)).await.unwrap();

        assert_eq!(summary.selected, 3);
        assert_eq!(summary.executed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(ledger.count(), 2);
    }

    #[tokio::test]
    async fn test_backed_off_rule_counted_as_skipped() {
        let mut rule = active_rule("r1", Frequency::Daily, utc(2025, 1, 1));
        rule.retry_after = Some(utc(2025, 1, 2));
        let (poller, _, ledger) = poller(vec![rule], RecordingLedger::new());

        let summary = poller.tick(utc(2025, 1, 1)).await.unwrap();

        assert_eq!(summary.selected, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(ledger.count(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_ticks_execute_once() {
        let (poller, _, ledger) = poller(
            vec![
                active_rule("a", Frequency::Monthly, utc(2025, 1, 1)),
                active_rule("b", Frequency::Monthly, utc(2025, 1, 1)),
            ],
            RecordingLedger::slow(std::time::Duration::from_millis(20)),
        );
        let now = utc(2025, 1, 1);

        let (first, second) = tokio::join!(poller.tick(now), poller.tick(now));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.executed + second.executed, 2);
        assert_eq!(ledger.count(), 2);
    }
}
