//! Turning one due rule into one ledger transaction.
//!
//! Execution is split around the ledger call:
//! 1. claim: write an [`ExecutionClaim`] under the version guard. Losing this
//!    race means another executor owns the occurrence, so we back off.
//! 2. call the ledger, dated at the occurrence's due instant.
//! 3. commit: record the outcome and advance (or not) the rule. If the rule
//!    was edited meanwhile (paused, cancelled) the outcome is re-applied on
//!    the fresh copy as long as our claim is still on it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::calendar::RecurrenceCalculator;
use crate::collaborators::{Ledger, Notifier, TemplateKind, TransactionId, TransactionRequest};
use crate::config::SchedulerConfig;
use crate::error::{LedgerError, SchedulerError, StoreError};
use crate::lifecycle;
use crate::store::RuleStore;
use crate::types::{
    ExecutionClaim, ExecutionOutcome, ExecutionRecord, RecurrenceRule, RuleStatus,
};

/// Attempts at writing an outcome when the rule keeps changing underneath.
const COMMIT_ATTEMPTS: u32 = 5;

/// Why an execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Poller run: the rule must be due.
    Scheduled,
    /// Operator/user "run now": the due check is skipped, every other guard applies.
    Manual,
}

/// Result of one execution attempt.
#[derive(Debug, Clone)]
pub enum MaterializeOutcome {
    /// A transaction was created and the rule advanced.
    Executed {
        transaction_id: TransactionId,
        rule: RecurrenceRule,
    },
    /// The ledger failed; the rule stays due and is retried after backoff.
    Failed {
        error: LedgerError,
        rule: RecurrenceRule,
    },
    /// Nothing to do yet.
    NotDue,
    /// The rule is not active.
    Inactive(RuleStatus),
    /// Another executor holds or already advanced this rule.
    Conflict,
}

/// Executes due rules against the ledger.
pub struct Materializer {
    store: Arc<dyn RuleStore>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    calculator: RecurrenceCalculator,
    claim_lease: Duration,
    max_consecutive_failures: u32,
}

impl Materializer {
    pub fn new(
        store: Arc<dyn RuleStore>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
        calculator: RecurrenceCalculator,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            notifier,
            calculator,
            claim_lease: config.claim_lease(),
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }

    /// Load a rule and execute it.
    pub async fn execute(
        &self,
        rule_id: &str,
        mode: ExecutionMode,
        now: DateTime<Utc>,
    ) -> Result<MaterializeOutcome, SchedulerError> {
        let rule = self
            .store
            .get(rule_id)
            .await?
            .ok_or_else(|| SchedulerError::RuleNotFound(rule_id.to_string()))?;
        self.execute_rule(rule, mode, now).await
    }

    /// Execute a rule as read by the caller.
    ///
    /// A stale copy is harmless: the claim write fails and the call no-ops.
    #[tracing::instrument(skip(self, rule), fields(rule_id = %rule.id, due_at = %rule.next_execution_date))]
    pub async fn execute_rule(
        &self,
        rule: RecurrenceRule,
        mode: ExecutionMode,
        now: DateTime<Utc>,
    ) -> Result<MaterializeOutcome, SchedulerError> {
        if rule.status != RuleStatus::Active {
            return Ok(MaterializeOutcome::Inactive(rule.status));
        }
        if rule.has_live_claim(now) {
            debug!("rule is claimed by another executor");
            return Ok(MaterializeOutcome::Conflict);
        }
        if mode == ExecutionMode::Scheduled && !rule.is_due(now) {
            return Ok(MaterializeOutcome::NotDue);
        }

        let token = Uuid::new_v4();
        let due_at = rule.next_execution_date;
        let mut claimed = rule.clone();
        claimed.claim = Some(ExecutionClaim {
            token,
            due_at,
            expires_at: now + self.claim_lease,
        });
        claimed.updated_at = now;

        let claimed = match self.store.update_if_unchanged(&claimed, rule.version).await {
            Ok(saved) => saved,
            Err(StoreError::Conflict { .. }) => {
                debug!("lost claim race, another executor owns this occurrence");
                return Ok(MaterializeOutcome::Conflict);
            }
            Err(e) => return Err(e.into()),
        };

        let request = TransactionRequest {
            owner_id: rule.owner_id.clone(),
            description: rule.description.clone(),
            amount: rule.adjusted_amount(),
            kind: rule.kind,
            category_id: rule.category_id.clone(),
            payment_method: rule.payment_method.clone(),
            date: due_at,
            source_rule_id: rule.id.clone(),
        };
        let amount = request.amount;
        let result = self.ledger.create_transaction(request).await;

        let (saved, suspended) = self.commit(claimed, token, due_at, &result, now).await?;

        match result {
            Ok(transaction_id) => {
                info!(
                    transaction_id = %transaction_id,
                    amount = %amount,
                    execution_count = saved.execution_count,
                    next_execution = %saved.next_execution_date,
                    status = %saved.status,
                    "materialized recurring transaction"
                );
                self.fan_out(
                    &saved.owner_id,
                    TemplateKind::TransactionCreated,
                    json!({
                        "rule_id": saved.id,
                        "transaction_id": transaction_id,
                        "description": saved.description,
                        "amount": amount.to_string(),
                        "kind": saved.kind,
                        "date": due_at,
                    }),
                )
                .await;
                Ok(MaterializeOutcome::Executed {
                    transaction_id,
                    rule: saved,
                })
            }
            Err(err) => {
                if suspended {
                    error!(
                        error = %err,
                        failures = saved.consecutive_failures,
                        "rule paused after repeated ledger failures"
                    );
                    self.fan_out(
                        &saved.owner_id,
                        TemplateKind::ExecutionFailed,
                        json!({
                            "rule_id": saved.id,
                            "description": saved.description,
                            "failures": saved.consecutive_failures,
                            "error": err.to_string(),
                        }),
                    )
                    .await;
                } else {
                    warn!(
                        error = %err,
                        failures = saved.consecutive_failures,
                        retry_after = ?saved.retry_after,
                        "ledger failed, rule left due for retry"
                    );
                }
                Ok(MaterializeOutcome::Failed {
                    error: err,
                    rule: saved,
                })
            }
        }
    }

    /// Write the outcome, re-reading and re-applying on version conflicts.
    async fn commit(
        &self,
        mut current: RecurrenceRule,
        token: Uuid,
        due_at: DateTime<Utc>,
        result: &Result<TransactionId, LedgerError>,
        now: DateTime<Utc>,
    ) -> Result<(RecurrenceRule, bool), SchedulerError> {
        for attempt in 0..COMMIT_ATTEMPTS {
            if current.claim.as_ref().map(|c| c.token) != Some(token) {
                error!(
                    outcome = ?result,
                    "execution claim was taken over before the outcome could be recorded"
                );
                return Err(SchedulerError::ConcurrencyConflict {
                    rule_id: current.id,
                });
            }

            let mut updated = current.clone();
            let suspended = match result {
                Ok(transaction_id) => {
                    self.apply_success(&mut updated, transaction_id, due_at, now);
                    false
                }
                Err(err) => self.apply_failure(&mut updated, err, due_at, now),
            };

            match self.store.update_if_unchanged(&updated, current.version).await {
                Ok(saved) => return Ok((saved, suspended)),
                Err(StoreError::Conflict { .. }) => {
                    debug!(attempt, "rule changed during execution, re-applying outcome");
                    current = self
                        .store
                        .get(&current.id)
                        .await?
                        .ok_or_else(|| SchedulerError::RuleNotFound(current.id.clone()))?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        error!(outcome = ?result, "gave up recording execution outcome");
        Err(SchedulerError::ConcurrencyConflict {
            rule_id: current.id,
        })
    }

    fn apply_success(
        &self,
        rule: &mut RecurrenceRule,
        transaction_id: &TransactionId,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        rule.claim = None;
        rule.execution_history.push(ExecutionRecord {
            transaction_id: Some(transaction_id.clone()),
            due_at,
            executed_at: now,
            outcome: ExecutionOutcome::Success,
            error: None,
        });
        rule.last_execution_date = Some(due_at);
        rule.execution_count += 1;
        rule.consecutive_failures = 0;
        rule.retry_after = None;
        rule.updated_at = now;

        // A resume while in flight may already have moved the rule on
        if rule.next_execution_date == due_at {
            let next = self
                .calculator
                .next_occurrence(rule.occurrence(), &rule.recurrence);
            rule.next_execution_date = next.due;
            rule.anchor_date = next.anchor;
        }

        lifecycle::evaluate_completion(rule, now);
    }

    /// Returns true if the failure pushed the rule over the failure cap.
    fn apply_failure(
        &self,
        rule: &mut RecurrenceRule,
        err: &LedgerError,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        rule.claim = None;
        rule.execution_history.push(ExecutionRecord {
            transaction_id: None,
            due_at,
            executed_at: now,
            outcome: ExecutionOutcome::Failed,
            error: Some(err.to_string()),
        });
        rule.consecutive_failures += 1;
        rule.retry_after = Some(now + rule.calculate_retry_delay());
        rule.updated_at = now;

        if self.max_consecutive_failures == 0
            || rule.consecutive_failures < self.max_consecutive_failures
        {
            return false;
        }
        let reason = format!(
            "paused after {} consecutive ledger failures: {}",
            rule.consecutive_failures, err
        );
        lifecycle::suspend_after_failures(rule, reason, now).is_ok()
    }

    async fn fan_out(&self, owner_id: &str, template: TemplateKind, payload: serde_json::Value) {
        if let Err(e) = self.notifier.notify(owner_id, template, payload).await {
            warn!(error = %e, owner_id, template = ?template, "notification fan-out failed");
        }
    }
}
