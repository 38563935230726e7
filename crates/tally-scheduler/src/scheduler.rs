//! Scheduler facade: rule management plus the three background loops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::calendar::{HolidayCalendar, RecurrenceCalculator};
use crate::collaborators::{Ledger, Notifier};
use crate::config::SchedulerConfig;
use crate::due::{DuePoller, DueTickSummary};
use crate::error::{SchedulerError, StoreError};
use crate::housekeeping::Housekeeper;
use crate::lifecycle;
use crate::materializer::{ExecutionMode, MaterializeOutcome, Materializer};
use crate::reminders::{ReminderPoller, ReminderTickSummary};
use crate::store::RuleStore;
use crate::types::{RecurrenceRule, RuleDraft};

/// The recurring transaction scheduler.
pub struct Scheduler {
    store: Arc<dyn RuleStore>,
    calculator: RecurrenceCalculator,
    config: SchedulerConfig,
    materializer: Arc<Materializer>,
    due: DuePoller,
    reminders: ReminderPoller,
    housekeeper: Housekeeper,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(
        store: Arc<dyn RuleStore>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
        holidays: Arc<dyn HolidayCalendar>,
        config: SchedulerConfig,
    ) -> Self {
        let calculator = RecurrenceCalculator::new(holidays);
        let materializer = Arc::new(Materializer::new(
            store.clone(),
            ledger,
            notifier.clone(),
            calculator.clone(),
            &config,
        ));
        Self {
            due: DuePoller::new(store.clone(), materializer.clone(), config.workers()),
            reminders: ReminderPoller::new(store.clone(), notifier),
            housekeeper: Housekeeper::new(store.clone(), config.retention()),
            store,
            calculator,
            config,
            materializer,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validate and persist a new rule with its first due instant.
    #[tracing::instrument(skip(self, draft), fields(owner_id = %draft.owner_id))]
    pub async fn create_rule(
        &self,
        draft: RuleDraft,
        now: DateTime<Utc>,
    ) -> Result<RecurrenceRule, SchedulerError> {
        let id = Uuid::new_v4().to_string();
        let rule = RecurrenceRule::from_draft(id, draft, &self.calculator, now)?;
        let rule = self.store.insert(rule).await?;
        info!(
            rule_id = %rule.id,
            frequency = %rule.recurrence.frequency,
            next_execution = %rule.next_execution_date,
            "created recurrence rule"
        );
        Ok(rule)
    }

    pub async fn get_rule(&self, rule_id: &str) -> Result<RecurrenceRule, SchedulerError> {
        self.store
            .get(rule_id)
            .await?
            .ok_or_else(|| SchedulerError::RuleNotFound(rule_id.to_string()))
    }

    pub async fn list_rules(&self, owner_id: &str) -> Result<Vec<RecurrenceRule>, SchedulerError> {
        Ok(self.store.list_by_owner(owner_id).await?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn pause_rule(
        &self,
        rule_id: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RecurrenceRule, SchedulerError> {
        let (rule, ()) = self
            .modify(rule_id, |rule| lifecycle::pause(rule, reason.clone(), now))
            .await?;
        info!(rule_id, "paused rule");
        Ok(rule)
    }

    /// Resume a paused rule; occurrences missed while paused are skipped.
    #[tracing::instrument(skip(self))]
    pub async fn resume_rule(
        &self,
        rule_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RecurrenceRule, SchedulerError> {
        let (rule, skipped) = self
            .modify(rule_id, |rule| lifecycle::resume(rule, &self.calculator, now))
            .await?;
        info!(
            rule_id,
            skipped,
            status = %rule.status,
            next_execution = %rule.next_execution_date,
            "resumed rule"
        );
        Ok(rule)
    }

    #[tracing::instrument(skip(self))]
    pub async fn cancel_rule(
        &self,
        rule_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RecurrenceRule, SchedulerError> {
        let (rule, ()) = self
            .modify(rule_id, |rule| lifecycle::cancel(rule, now))
            .await?;
        info!(rule_id, "cancelled rule");
        Ok(rule)
    }

    /// Next `count` due instants of a rule. Empty for terminated rules.
    pub async fn preview(
        &self,
        rule_id: &str,
        count: usize,
    ) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
        let rule = self.get_rule(rule_id).await?;
        if rule.status.is_terminal() {
            return Ok(Vec::new());
        }
        Ok(self.calculator.upcoming(&rule, count))
    }

    /// Run a rule's current occurrence immediately, bypassing only the due check.
    ///
    /// A ledger failure is recorded on the rule exactly as a scheduled failure
    /// would be, and then surfaced as [`SchedulerError::Materialization`].
    pub async fn execute_now(
        &self,
        rule_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MaterializeOutcome, SchedulerError> {
        match self
            .materializer
            .execute(rule_id, ExecutionMode::Manual, now)
            .await?
        {
            MaterializeOutcome::Failed { error, .. } => Err(SchedulerError::Materialization {
                rule_id: rule_id.to_string(),
                source: error,
            }),
            outcome => Ok(outcome),
        }
    }

    pub async fn run_due_tick(&self, now: DateTime<Utc>) -> Result<DueTickSummary, SchedulerError> {
        self.due.tick(now).await
    }

    pub async fn run_reminder_tick(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ReminderTickSummary, SchedulerError> {
        self.reminders.tick(now).await
    }

    pub async fn run_housekeeping(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        self.housekeeper.sweep(now).await
    }

    /// Run the due, reminder and housekeeping loops until shutdown.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, shutdown_rx: watch::Receiver<bool>) {
        info!(
            due_every = ?self.config.due_poll_interval(),
            reminders_every = ?self.config.reminder_poll_interval(),
            housekeeping_every = ?self.config.housekeeping_interval(),
            workers = self.config.workers(),
            "scheduler starting"
        );

        tokio::join!(
            timer_loop(
                "due",
                self.config.due_poll_interval(),
                shutdown_rx.clone(),
                || async move {
                    if let Err(e) = self.run_due_tick(Utc::now()).await {
                        error!(error = %e, "due tick failed");
                    }
                },
            ),
            timer_loop(
                "reminders",
                self.config.reminder_poll_interval(),
                shutdown_rx.clone(),
                || async move {
                    if let Err(e) = self.run_reminder_tick(Utc::now()).await {
                        error!(error = %e, "reminder tick failed");
                    }
                },
            ),
            timer_loop(
                "housekeeping",
                self.config.housekeeping_interval(),
                shutdown_rx,
                || async move {
                    if let Err(e) = self.run_housekeeping(Utc::now()).await {
                        error!(error = %e, "housekeeping failed");
                    }
                },
            ),
        );

        info!("scheduler shut down gracefully");
    }

    /// Read-modify-write with the version guard, retrying on conflicts.
    async fn modify<T>(
        &self,
        rule_id: &str,
        mut change: impl FnMut(&mut RecurrenceRule) -> Result<T, SchedulerError>,
    ) -> Result<(RecurrenceRule, T), SchedulerError> {
        let attempts = self.config.lifecycle_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            let current = self.get_rule(rule_id).await?;
            let mut updated = current.clone();
            let value = change(&mut updated)?;

            match self.store.update_if_unchanged(&updated, current.version).await {
                Ok(saved) => return Ok((saved, value)),
                Err(StoreError::Conflict { .. }) if attempt < attempts => {
                    debug!(rule_id, attempt, "rule changed underneath, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Call `tick` every `period` until shutdown is signalled.
async fn timer_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => tick().await,
        }
    }

    debug!(task = name, "timer loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::NoHolidays;
    use crate::store::MemoryRuleStore;
    use crate::testing::{RecordingLedger, RecordingNotifier, draft, utc};
    use crate::types::{ExecutionOutcome, Frequency, RuleStatus};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    struct Fixture {
        scheduler: Arc<Scheduler>,
        ledger: Arc<RecordingLedger>,
    }

    fn fixture(ledger: RecordingLedger, config: SchedulerConfig) -> Fixture {
        let ledger = Arc::new(ledger);
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(MemoryRuleStore::new()),
            ledger.clone(),
            Arc::new(RecordingNotifier::new()),
            Arc::new(NoHolidays),
            config,
        ));
        Fixture { scheduler, ledger }
    }

    fn default_fixture() -> Fixture {
        fixture(RecordingLedger::new(), SchedulerConfig::default())
    }

    #[tokio::test]
    async fn test_max_executions_scenario() {
        let f = default_fixture();
        let mut d = draft(Frequency::Monthly, utc(2025, 1, 15));
        d.recurrence.day_of_month = Some(15);
        d.max_executions = Some(3);
        let rule = f.scheduler.create_rule(d, utc(2025, 1, 1)).await.unwrap();

        for month in 1..=3 {
            let summary = f.scheduler.run_due_tick(utc(2025, month, 15)).await.unwrap();
            assert_eq!(summary.executed, 1);
        }

        let rule = f.scheduler.get_rule(&rule.id).await.unwrap();
        assert_eq!(rule.execution_count, 3);
        assert_eq!(rule.status, RuleStatus::Completed);

        let summary = f.scheduler.run_due_tick(utc(2025, 4, 15)).await.unwrap();
        assert_eq!(summary, DueTickSummary::default());
        assert_eq!(f.ledger.count(), 3);
    }

    #[tokio::test]
    async fn test_adjusted_amount_scenario() {
        let f = default_fixture();
        let mut d = draft(Frequency::Monthly, utc(2025, 1, 15));
        d.amount = dec!(100);
        d.auto_adjust_amount = true;
        d.adjustment_percentage = dec!(10);
        let rule = f.scheduler.create_rule(d, utc(2025, 1, 1)).await.unwrap();

        f.scheduler.run_due_tick(utc(2025, 1, 15)).await.unwrap();

        assert_eq!(f.ledger.last().unwrap().amount, dec!(110));
        let rule = f.scheduler.get_rule(&rule.id).await.unwrap();
        assert_eq!(rule.amount, dec!(100));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_recurrence() {
        let f = default_fixture();
        let mut d = draft(Frequency::Monthly, utc(2025, 1, 15));
        d.recurrence.day_of_month = Some(32);

        let result = f.scheduler.create_rule(d, utc(2025, 1, 1)).await;

        assert!(matches!(result, Err(SchedulerError::InvalidRecurrenceSpec(_))));
        assert!(f.scheduler.list_rules("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_through_facade() {
        let f = default_fixture();
        let mut d = draft(Frequency::Monthly, utc(2025, 1, 15));
        d.recurrence.day_of_month = Some(15);
        let rule = f.scheduler.create_rule(d, utc(2025, 1, 1)).await.unwrap();

        let paused = f
            .scheduler
            .pause_rule(&rule.id, Some("on holiday".into()), utc(2025, 1, 10))
            .await
            .unwrap();
        assert_eq!(paused.status, RuleStatus::Paused);

        // Paused rules are never selected, however late
        let summary = f.scheduler.run_due_tick(utc(2025, 3, 20)).await.unwrap();
        assert_eq!(summary.selected, 0);

        let resumed = f
            .scheduler
            .resume_rule(&rule.id, utc(2025, 3, 20))
            .await
            .unwrap();
        assert_eq!(resumed.status, RuleStatus::Active);
        assert_eq!(resumed.next_execution_date, utc(2025, 4, 15));
        assert_eq!(resumed.execution_history.len(), 3);
        assert!(
            resumed
                .execution_history
                .iter()
                .all(|r| r.outcome == ExecutionOutcome::Skipped)
        );

        let cancelled = f
            .scheduler
            .cancel_rule(&rule.id, utc(2025, 3, 21))
            .await
            .unwrap();
        assert_eq!(cancelled.status, RuleStatus::Cancelled);
        assert_eq!(f.ledger.count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_rule_unchanged() {
        let f = default_fixture();
        let rule = f
            .scheduler
            .create_rule(draft(Frequency::Weekly, utc(2025, 1, 15)), utc(2025, 1, 1))
            .await
            .unwrap();

        let result = f.scheduler.resume_rule(&rule.id, utc(2025, 1, 2)).await;

        assert!(matches!(
            result,
            Err(SchedulerError::InvalidStateTransition { .. })
        ));
        assert_eq!(f.scheduler.get_rule(&rule.id).await.unwrap(), rule);
    }

    #[tokio::test]
    async fn test_unknown_rule_is_reported() {
        let f = default_fixture();
        assert!(matches!(
            f.scheduler.pause_rule("nope", None, utc(2025, 1, 1)).await,
            Err(SchedulerError::RuleNotFound(_))
        ));
        assert!(matches!(
            f.scheduler.preview("nope", 3).await,
            Err(SchedulerError::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_now_surfaces_ledger_failure() {
        let f = fixture(RecordingLedger::failing(1), SchedulerConfig::default());
        let rule = f
            .scheduler
            .create_rule(draft(Frequency::Monthly, utc(2025, 2, 1)), utc(2025, 1, 1))
            .await
            .unwrap();

        let result = f.scheduler.execute_now(&rule.id, utc(2025, 1, 20)).await;

        assert!(matches!(result, Err(SchedulerError::Materialization { .. })));
        let rule = f.scheduler.get_rule(&rule.id).await.unwrap();
        assert_eq!(rule.execution_history.len(), 1);
        assert_eq!(rule.next_execution_date, utc(2025, 2, 1));
    }

    #[tokio::test]
    async fn test_execute_now_on_cancelled_rule_is_noop() {
        let f = default_fixture();
        let rule = f
            .scheduler
            .create_rule(draft(Frequency::Monthly, utc(2025, 2, 1)), utc(2025, 1, 1))
            .await
            .unwrap();
        f.scheduler.cancel_rule(&rule.id, utc(2025, 1, 2)).await.unwrap();

        let outcome = f.scheduler.execute_now(&rule.id, utc(2025, 1, 3)).await.unwrap();

        assert!(matches!(
            outcome,
            MaterializeOutcome::Inactive(RuleStatus::Cancelled)
        ));
        assert_eq!(f.ledger.count(), 0);
    }

    #[tokio::test]
    async fn test_preview_respects_cap() {
        let f = default_fixture();
        let mut d = draft(Frequency::Monthly, utc(2025, 1, 31));
        d.recurrence.day_of_month = Some(31);
        d.max_executions = Some(3);
        let rule = f.scheduler.create_rule(d, utc(2025, 1, 1)).await.unwrap();

        let dates = f.scheduler.preview(&rule.id, 10).await.unwrap();

        assert_eq!(
            dates,
            vec![utc(2025, 1, 31), utc(2025, 2, 28), utc(2025, 3, 31)]
        );
    }

    #[tokio::test]
    async fn test_housekeeping_through_facade() {
        let f = default_fixture();
        let rule = f
            .scheduler
            .create_rule(draft(Frequency::Daily, utc(2025, 1, 1)), utc(2025, 1, 1))
            .await
            .unwrap();
        f.scheduler.cancel_rule(&rule.id, utc(2025, 1, 2)).await.unwrap();

        assert_eq!(f.scheduler.run_housekeeping(utc(2025, 3, 1)).await.unwrap(), 0);
        assert_eq!(f.scheduler.run_housekeeping(utc(2025, 6, 1)).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let config = SchedulerConfig {
            due_poll_interval_secs: 1,
            reminder_poll_interval_secs: 1,
            housekeeping_interval_secs: 1,
            ..SchedulerConfig::default()
        };
        let f = fixture(RecordingLedger::new(), config);
        let start = Utc::now() - chrono::Duration::hours(1);
        f.scheduler
            .create_rule(draft(Frequency::Yearly, start), start)
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = f.scheduler.clone();
        let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.ledger.count(), 1);
    }
}
