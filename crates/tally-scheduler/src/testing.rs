//! Shared fixtures for unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal_macros::dec;

use crate::calendar::RecurrenceCalculator;
use crate::collaborators::{Ledger, Notifier, TemplateKind, TransactionId, TransactionRequest};
use crate::error::{LedgerError, NotifyError};
use crate::types::{Frequency, Recurrence, RecurrenceRule, RuleDraft, TransactionKind};

pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
        .and_utc()
}

pub fn utc(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    at(year, month, day, 0, 0)
}

pub fn draft(frequency: Frequency, start: DateTime<Utc>) -> RuleDraft {
    RuleDraft {
        owner_id: "user-1".to_string(),
        category_id: "subscriptions".to_string(),
        payment_method: Some("credit_card".to_string()),
        description: "Streaming".to_string(),
        notes: None,
        amount: dec!(49.90),
        kind: TransactionKind::Expense,
        recurrence: Recurrence::every(frequency),
        start_date: start,
        end_date: None,
        max_executions: None,
        auto_adjust_amount: false,
        adjustment_percentage: dec!(0),
        notify_before_execution: false,
        notification_days_before: 1,
    }
}

pub fn rule_from(id: &str, draft: RuleDraft) -> RecurrenceRule {
    let created = draft.start_date;
    RecurrenceRule::from_draft(id.to_string(), draft, &RecurrenceCalculator::default(), created)
        .unwrap()
}

pub fn active_rule(id: &str, frequency: Frequency, start: DateTime<Utc>) -> RecurrenceRule {
    rule_from(id, draft(frequency, start))
}

/// Ledger that records requests and can be told to fail.
#[derive(Default)]
pub struct RecordingLedger {
    pub requests: Mutex<Vec<TransactionRequest>>,
    failures_left: AtomicU32,
    delay: Option<StdDuration>,
}

impl RecordingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls.
    pub fn failing(n: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(n),
            ..Self::default()
        }
    }

    /// Sleep before answering, to widen race windows.
    pub fn slow(delay: StdDuration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<TransactionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Ledger for RecordingLedger {
    async fn create_transaction(
        &self,
        request: TransactionRequest,
    ) -> Result<TransactionId, LedgerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(LedgerError::Unavailable("ledger down".to_string()));
        }
        let mut requests = self.requests.lock().unwrap();
        requests.push(request);
        Ok(format!("tx-{}", requests.len()))
    }
}

/// Notifier that records every message.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, TemplateKind, serde_json::Value)>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn count(&self, template: TemplateKind) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t, _)| *t == template)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        owner_id: &str,
        template: TemplateKind,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((owner_id.to_string(), template, payload));
        if self.fail {
            return Err(NotifyError("smtp down".to_string()));
        }
        Ok(())
    }
}
