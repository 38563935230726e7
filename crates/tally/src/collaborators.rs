//! HTTP and log-backed implementations of the scheduler's collaborators.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tally_scheduler::{
    Ledger, LedgerError, Notifier, NotifyError, TemplateKind, TransactionId, TransactionRequest,
};

fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
}

/// Ledger reached over HTTP: `POST <base>/transactions` answering `{"id": ...}`.
pub struct HttpLedger {
    http: Client,
    base_url: String,
}

impl HttpLedger {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: http_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CreatedTransaction {
    id: String,
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn create_transaction(
        &self,
        request: TransactionRequest,
    ) -> Result<TransactionId, LedgerError> {
        let url = format!("{}/transactions", self.base_url);

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|e| format!("failed to read response: {}", e));
            let detail = format!("({}) {}", status, text);
            // 4xx means the ledger looked at the request and said no
            return Err(if status.is_client_error() {
                LedgerError::Rejected(detail)
            } else {
                LedgerError::Unavailable(detail)
            });
        }

        let created: CreatedTransaction = response
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("invalid response: {}", e)))?;
        debug!(transaction_id = %created.id, source_rule_id = %request.source_rule_id, "ledger created transaction");
        Ok(created.id)
    }
}

/// Body posted to the notification webhook.
#[derive(Debug, Serialize)]
struct WebhookMessage<'a> {
    owner_id: &'a str,
    template: TemplateKind,
    payload: serde_json::Value,
}

/// Delivers notifications as JSON POSTs to a single webhook.
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: http_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        owner_id: &str,
        template: TemplateKind,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.url)
            .json(&WebhookMessage {
                owner_id,
                template,
                payload,
            })
            .send()
            .await
            .map_err(|e| NotifyError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError(format!("webhook answered {}", status)));
        }
        Ok(())
    }
}

/// Writes notifications to the log. Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        owner_id: &str,
        template: TemplateKind,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        info!(owner_id, template = ?template, payload = %payload, "notification");
        Ok(())
    }
}
