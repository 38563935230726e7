//! Recurrence rule types.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calendar::{Occurrence, RecurrenceCalculator};
use crate::collaborators::TransactionId;
use crate::error::SchedulerError;

/// A persisted recurrence rule owned by a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    /// Rule identifier.
    pub id: String,
    /// Owning user.
    pub owner_id: String,
    /// Category reference copied onto each transaction.
    pub category_id: String,
    /// Payment method label (e.g. "credit_card").
    #[serde(default)]
    pub payment_method: Option<String>,
    /// Description copied onto each transaction.
    pub description: String,
    /// Free-text notes.
    #[serde(default)]
    pub notes: Option<String>,
    /// Base amount. Adjustments are applied at materialization time only.
    pub amount: Decimal,
    /// Income or expense.
    pub kind: TransactionKind,
    /// How often the rule fires.
    #[serde(flatten)]
    pub recurrence: Recurrence,
    /// First instant the rule may fire.
    pub start_date: DateTime<Utc>,
    /// Last instant the rule may fire (open-ended if absent).
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// Due instant of the next occurrence, after weekend/holiday deferral.
    pub next_execution_date: DateTime<Utc>,
    /// Nominal instant of the next occurrence, before deferral.
    pub anchor_date: DateTime<Utc>,
    /// Due instant of the last successful occurrence.
    #[serde(default)]
    pub last_execution_date: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: RuleStatus,
    /// Number of successful materializations.
    pub execution_count: u32,
    /// Optional cap on successful materializations.
    #[serde(default)]
    pub max_executions: Option<u32>,
    /// Every execution attempt, oldest first.
    #[serde(default)]
    pub execution_history: Vec<ExecutionRecord>,
    /// Whether `adjustment_percentage` is applied to the amount.
    #[serde(default)]
    pub auto_adjust_amount: bool,
    /// Percentage added to the amount when `auto_adjust_amount` is set.
    #[serde(default)]
    pub adjustment_percentage: Decimal,
    /// Whether a reminder is sent ahead of execution.
    #[serde(default)]
    pub notify_before_execution: bool,
    /// How many days ahead of the due instant the reminder window opens.
    #[serde(default)]
    pub notification_days_before: u32,
    /// Due instant the last reminder was sent for.
    #[serde(default)]
    pub last_notified_for: Option<DateTime<Utc>>,
    /// Failed materializations since the last success.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Earliest instant a failed rule is retried.
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,
    /// In-flight execution marker.
    #[serde(default)]
    pub claim: Option<ExecutionClaim>,
    /// Why the rule was paused, when paused by the engine.
    #[serde(default)]
    pub paused_reason: Option<String>,
    /// Optimistic concurrency token, bumped on every store write.
    #[serde(default)]
    pub version: u64,
    /// When this rule was created.
    pub created_at: DateTime<Utc>,
    /// When this rule was last written.
    pub updated_at: DateTime<Utc>,
}

/// The recurrence part of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: Frequency,
    /// Day of month (1-31) for month-anchored frequencies.
    #[serde(default)]
    pub day_of_month: Option<u32>,
    /// Day of week (0 = Sunday .. 6 = Saturday) for weekly frequencies.
    #[serde(default)]
    pub day_of_week: Option<u32>,
    /// Push Saturday/Sunday occurrences to Monday.
    #[serde(default)]
    pub skip_weekends: bool,
    /// Push holiday occurrences to the next business day.
    #[serde(default)]
    pub skip_holidays: bool,
}

impl Recurrence {
    /// A plain recurrence with no anchors and no deferral.
    pub fn every(frequency: Frequency) -> Self {
        Self {
            frequency,
            day_of_month: None,
            day_of_week: None,
            skip_weekends: false,
            skip_holidays: false,
        }
    }

    /// Reject frequency/day combinations that make no sense.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if let Some(day) = self.day_of_month {
            if !(1..=31).contains(&day) {
                return Err(SchedulerError::InvalidRecurrenceSpec(format!(
                    "day_of_month must be between 1 and 31, got {day}"
                )));
            }
            if !self.frequency.is_month_based() {
                return Err(SchedulerError::InvalidRecurrenceSpec(format!(
                    "day_of_month cannot be used with {} frequency",
                    self.frequency
                )));
            }
        }
        if let Some(day) = self.day_of_week {
            if day > 6 {
                return Err(SchedulerError::InvalidRecurrenceSpec(format!(
                    "day_of_week must be between 0 and 6, got {day}"
                )));
            }
            if !self.frequency.is_week_based() {
                return Err(SchedulerError::InvalidRecurrenceSpec(format!(
                    "day_of_week cannot be used with {} frequency",
                    self.frequency
                )));
            }
        }
        Ok(())
    }
}

/// How often a rule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Bimonthly,
    Quarterly,
    Yearly,
}

impl Frequency {
    /// Step in days for day-based frequencies.
    pub fn day_step(self) -> Option<i64> {
        match self {
            Frequency::Daily => Some(1),
            Frequency::Weekly => Some(7),
            Frequency::Biweekly => Some(14),
            _ => None,
        }
    }

    /// Step in months for month-based frequencies.
    pub fn month_step(self) -> Option<u32> {
        match self {
            Frequency::Monthly => Some(1),
            Frequency::Bimonthly => Some(2),
            Frequency::Quarterly => Some(3),
            Frequency::Yearly => Some(12),
            _ => None,
        }
    }

    pub fn is_month_based(self) -> bool {
        self.month_step().is_some()
    }

    pub fn is_week_based(self) -> bool {
        matches!(self, Frequency::Weekly | Frequency::Biweekly)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Biweekly => "biweekly",
            Frequency::Monthly => "monthly",
            Frequency::Bimonthly => "bimonthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Yearly => "yearly",
        };
        f.write_str(name)
    }
}

/// Direction of the money flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Income,
    Expense,
}

/// Lifecycle status of a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    /// Rule fires on schedule.
    #[default]
    Active,
    /// Rule is on hold until resumed.
    Paused,
    /// Rule reached its end date or execution cap.
    Completed,
    /// Rule was cancelled by its owner.
    Cancelled,
}

impl RuleStatus {
    /// Completed and cancelled rules never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RuleStatus::Completed | RuleStatus::Cancelled)
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleStatus::Active => "active",
            RuleStatus::Paused => "paused",
            RuleStatus::Completed => "completed",
            RuleStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failed,
    /// Occurrence was passed over (missed while paused).
    Skipped,
}

/// One entry of a rule's execution history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Transaction created by this attempt, if any.
    pub transaction_id: Option<TransactionId>,
    /// Occurrence this attempt was for.
    pub due_at: DateTime<Utc>,
    /// When the attempt happened.
    pub executed_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    /// Error detail for failed attempts.
    #[serde(default)]
    pub error: Option<String>,
}

/// Marker written before the ledger is called so concurrent executors back off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionClaim {
    pub token: Uuid,
    /// Occurrence being materialized.
    pub due_at: DateTime<Utc>,
    /// After this instant the claim is considered abandoned.
    pub expires_at: DateTime<Utc>,
}

/// Request to create a new rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraft {
    pub owner_id: String,
    pub category_id: String,
    #[serde(default)]
    pub payment_method: Option<String>,
    pub description: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub amount: Decimal,
    pub kind: TransactionKind,
    #[serde(flatten)]
    pub recurrence: Recurrence,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_executions: Option<u32>,
    #[serde(default)]
    pub auto_adjust_amount: bool,
    #[serde(default)]
    pub adjustment_percentage: Decimal,
    #[serde(default)]
    pub notify_before_execution: bool,
    #[serde(default = "default_notification_days")]
    pub notification_days_before: u32,
}

fn default_notification_days() -> u32 {
    1
}

impl RuleDraft {
    /// Validate the draft before anything is persisted.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.amount <= Decimal::ZERO {
            return Err(SchedulerError::InvalidRecurrenceSpec(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        if self.description.trim().is_empty() {
            return Err(SchedulerError::InvalidRecurrenceSpec(
                "description must not be empty".to_string(),
            ));
        }
        self.recurrence.validate()?;
        if let Some(end) = self.end_date
            && end < self.start_date
        {
            return Err(SchedulerError::InvalidRecurrenceSpec(
                "end_date is before start_date".to_string(),
            ));
        }
        if self.max_executions == Some(0) {
            return Err(SchedulerError::InvalidRecurrenceSpec(
                "max_executions must be at least 1".to_string(),
            ));
        }
        if self.auto_adjust_amount && self.adjustment_percentage <= Decimal::from(-100) {
            return Err(SchedulerError::InvalidRecurrenceSpec(format!(
                "adjustment_percentage must be greater than -100, got {}",
                self.adjustment_percentage
            )));
        }
        Ok(())
    }
}

impl RecurrenceRule {
    /// Build an active rule from a validated draft, computing its first due instant.
    pub fn from_draft(
        id: String,
        draft: RuleDraft,
        calculator: &RecurrenceCalculator,
        now: DateTime<Utc>,
    ) -> Result<Self, SchedulerError> {
        draft.validate()?;

        let first = calculator.first_occurrence(draft.start_date, &draft.recurrence);
        if let Some(end) = draft.end_date
            && first.due > end
        {
            return Err(SchedulerError::InvalidRecurrenceSpec(format!(
                "first occurrence {} falls after end_date {}",
                first.due, end
            )));
        }

        Ok(Self {
            id,
            owner_id: draft.owner_id,
            category_id: draft.category_id,
            payment_method: draft.payment_method,
            description: draft.description,
            notes: draft.notes,
            amount: draft.amount.round_dp(2),
            kind: draft.kind,
            recurrence: draft.recurrence,
            start_date: draft.start_date,
            end_date: draft.end_date,
            next_execution_date: first.due,
            anchor_date: first.anchor,
            last_execution_date: None,
            status: RuleStatus::Active,
            execution_count: 0,
            max_executions: draft.max_executions,
            execution_history: Vec::new(),
            auto_adjust_amount: draft.auto_adjust_amount,
            adjustment_percentage: draft.adjustment_percentage,
            notify_before_execution: draft.notify_before_execution,
            notification_days_before: draft.notification_days_before,
            last_notified_for: None,
            consecutive_failures: 0,
            retry_after: None,
            claim: None,
            paused_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// The current occurrence (nominal anchor and deferred due instant).
    pub fn occurrence(&self) -> Occurrence {
        Occurrence {
            anchor: self.anchor_date,
            due: self.next_execution_date,
        }
    }

    /// Amount of the next transaction, with the adjustment policy applied.
    pub fn adjusted_amount(&self) -> Decimal {
        if !self.auto_adjust_amount {
            return self.amount;
        }
        let adjustment = self.amount * self.adjustment_percentage / Decimal::ONE_HUNDRED;
        (self.amount + adjustment).round_dp(2)
    }

    /// Whether another executor currently holds this rule.
    pub fn has_live_claim(&self, now: DateTime<Utc>) -> bool {
        self.claim.as_ref().is_some_and(|c| c.expires_at > now)
    }

    /// Check if this rule should be materialized at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RuleStatus::Active
            && self.next_execution_date <= now
            && self.retry_after.is_none_or(|retry| retry <= now)
            && !self.has_live_claim(now)
    }

    /// Check if a reminder for the current occurrence is owed at `now`.
    pub fn needs_reminder(&self, now: DateTime<Utc>) -> bool {
        if self.status != RuleStatus::Active || !self.notify_before_execution {
            return false;
        }
        let window_end = now + Duration::days(i64::from(self.notification_days_before));
        self.next_execution_date >= now
            && self.next_execution_date <= window_end
            && self.last_notified_for != Some(self.next_execution_date)
    }

    /// Calculate retry delay based on consecutive failures.
    pub fn calculate_retry_delay(&self) -> Duration {
        // Exponential backoff: 5min, 10min, 20min, 40min, max 1hr
        let base_secs = 300i64;
        let max_secs = 3600i64;
        let backoff = base_secs * (1 << self.consecutive_failures.min(4));
        Duration::seconds(backoff.min(max_secs))
    }

    /// Executions left before the cap is reached, if capped.
    pub fn remaining_executions(&self) -> Option<u32> {
        self.max_executions
            .map(|max| max.saturating_sub(self.execution_count))
    }
}
