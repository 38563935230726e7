//! Recurring transaction scheduling engine for Tally.
//!
//! This crate turns user-declared recurrence rules into ledger transactions:
//! - Computes due instants with month-length clamping and weekend/holiday deferral
//! - Gates execution through a small lifecycle state machine
//! - Materializes due rules at most once per due instant (optimistic concurrency)
//! - Sends one reminder per due instant ahead of execution
//! - Sweeps long-terminated rules out of the store

mod calendar;
mod collaborators;
mod config;
mod due;
mod error;
mod housekeeping;
pub mod lifecycle;
mod materializer;
mod reminders;
mod scheduler;
pub mod store;
mod types;

#[cfg(test)]
mod testing;

pub use calendar::{FixedHolidays, HolidayCalendar, NoHolidays, Occurrence, RecurrenceCalculator, next};
pub use collaborators::{Ledger, Notifier, TemplateKind, TransactionId, TransactionRequest};
pub use config::SchedulerConfig;
pub use due::{DuePoller, DueTickSummary};
pub use error::{LedgerError, NotifyError, SchedulerError, StoreError};
pub use housekeeping::Housekeeper;
pub use lifecycle::LifecycleAction;
pub use materializer::{ExecutionMode, MaterializeOutcome, Materializer};
pub use reminders::{ReminderPoller, ReminderTickSummary};
pub use scheduler::Scheduler;
pub use store::{FileRuleStore, MemoryRuleStore, RuleStore};
pub use types::{
    ExecutionClaim, ExecutionOutcome, ExecutionRecord, Frequency, Recurrence, RecurrenceRule,
    RuleDraft, RuleStatus, TransactionKind,
};
