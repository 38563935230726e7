//! Narrow interfaces to the systems the scheduler drives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, NotifyError};
use crate::types::TransactionKind;

/// Identifier of a transaction created by the ledger.
pub type TransactionId = String;

/// A transaction the ledger is asked to create for one due occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub owner_id: String,
    pub description: String,
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub category_id: String,
    #[serde(default)]
    pub payment_method: Option<String>,
    /// Dated at the rule's due instant, not at execution time.
    pub date: DateTime<Utc>,
    /// Back-reference to the rule that produced this transaction.
    pub source_rule_id: String,
}

/// The canonical list of financial transactions.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Create one transaction. Success or failure must be known on return.
    async fn create_transaction(
        &self,
        request: TransactionRequest,
    ) -> Result<TransactionId, LedgerError>;
}

/// Kinds of messages the scheduler sends to rule owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// A rule is about to execute.
    UpcomingExecution,
    /// A rule produced a new transaction.
    TransactionCreated,
    /// A rule was paused after repeated ledger failures.
    ExecutionFailed,
}

/// Delivers messages to rule owners. Fire-and-forget from the scheduler's side.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        owner_id: &str,
        template: TemplateKind,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError>;
}
