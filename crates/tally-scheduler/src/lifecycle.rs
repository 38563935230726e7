//! Rule lifecycle state machine.
//!
//! ```text
//! active ──pause──▶ paused ──resume──▶ active
//!   │                 │
//!   ├──cancel─────────┴──cancel──▶ cancelled (terminal)
//!   └──(end date / cap reached)──▶ completed (terminal)
//! ```
//!
//! Completion is never requested from outside; it is evaluated after the
//! materializer advances a rule, and when resuming skips past the end date.
//! Every function here mutates a copy of the rule; persisting it is the
//! caller's job.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::calendar::RecurrenceCalculator;
use crate::error::SchedulerError;
use crate::types::{ExecutionOutcome, ExecutionRecord, RecurrenceRule, RuleStatus};

/// Skipped occurrences recorded one by one on resume; the rest share one record.
pub const MAX_SKIPPED_RECORDS: usize = 12;

/// Externally requested lifecycle changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Pause,
    Resume,
    Cancel,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleAction::Pause => "pause",
            LifecycleAction::Resume => "resume",
            LifecycleAction::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

fn invalid(rule: &RecurrenceRule, action: LifecycleAction) -> SchedulerError {
    SchedulerError::InvalidStateTransition {
        from: rule.status,
        action,
    }
}

/// `active → paused`. Dates are left alone.
pub fn pause(
    rule: &mut RecurrenceRule,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<(), SchedulerError> {
    if rule.status != RuleStatus::Active {
        return Err(invalid(rule, LifecycleAction::Pause));
    }
    rule.status = RuleStatus::Paused;
    rule.paused_reason = reason;
    rule.updated_at = now;
    Ok(())
}

/// `active → paused` once ledger failures hit the cap.
///
/// The failure counter is kept so the rule shows why it stopped; the pending
/// backoff is dropped since nothing will retry until the owner resumes.
pub fn suspend_after_failures(
    rule: &mut RecurrenceRule,
    reason: String,
    now: DateTime<Utc>,
) -> Result<(), SchedulerError> {
    pause(rule, Some(reason), now)?;
    rule.retry_after = None;
    Ok(())
}

/// `paused → active`.
///
/// Occurrences that fell due while paused are recorded as skipped, never
/// executed. Beyond `MAX_SKIPPED_RECORDS` the remainder is summarized in a
/// single record. Returns how many were skipped. The rule completes instead of
/// resuming if skipping runs past its end date.
pub fn resume(
    rule: &mut RecurrenceRule,
    calculator: &RecurrenceCalculator,
    now: DateTime<Utc>,
) -> Result<usize, SchedulerError> {
    if rule.status != RuleStatus::Paused {
        return Err(invalid(rule, LifecycleAction::Resume));
    }

    rule.status = RuleStatus::Active;
    rule.paused_reason = None;
    rule.consecutive_failures = 0;
    rule.retry_after = None;
    rule.updated_at = now;

    let mut skipped = 0;
    let mut last_skipped = None;
    let mut occurrence = rule.occurrence();
    while occurrence.due < now && !rule.end_date.is_some_and(|end| occurrence.due > end) {
        if skipped < MAX_SKIPPED_RECORDS {
            rule.execution_history
                .push(skipped_record(occurrence.due, now, "missed while paused".to_string()));
        }
        last_skipped = Some(occurrence.due);
        occurrence = calculator.next_occurrence(occurrence, &rule.recurrence);
        skipped += 1;
    }
    if let (true, Some(due_at)) = (skipped > MAX_SKIPPED_RECORDS, last_skipped) {
        let further = skipped - MAX_SKIPPED_RECORDS;
        rule.execution_history.push(skipped_record(
            due_at,
            now,
            format!("{further} further occurrences missed while paused"),
        ));
    }
    rule.next_execution_date = occurrence.due;
    rule.anchor_date = occurrence.anchor;

    evaluate_completion(rule, now);
    Ok(skipped)
}

fn skipped_record(due_at: DateTime<Utc>, now: DateTime<Utc>, detail: String) -> ExecutionRecord {
    ExecutionRecord {
        transaction_id: None,
        due_at,
        executed_at: now,
        outcome: ExecutionOutcome::Skipped,
        error: Some(detail),
    }
}

/// `{active, paused} → cancelled`.
pub fn cancel(rule: &mut RecurrenceRule, now: DateTime<Utc>) -> Result<(), SchedulerError> {
    if rule.status.is_terminal() {
        return Err(invalid(rule, LifecycleAction::Cancel));
    }
    rule.status = RuleStatus::Cancelled;
    rule.retry_after = None;
    rule.updated_at = now;
    Ok(())
}

/// `active → completed` once the end date has passed or the cap is reached.
/// Returns true if the rule was completed.
pub fn evaluate_completion(rule: &mut RecurrenceRule, now: DateTime<Utc>) -> bool {
    if rule.status != RuleStatus::Active {
        return false;
    }
    let past_end = rule
        .end_date
        .is_some_and(|end| rule.next_execution_date > end);
    let capped = rule
        .max_executions
        .is_some_and(|max| rule.execution_count >= max);

    if past_end || capped {
        rule.status = RuleStatus::Completed;
        rule.retry_after = None;
        rule.updated_at = now;
        return true;
    }
    false
}
