//! Command-line configuration and scheduler wiring.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use clap::Args;
use miette::{IntoDiagnostic, Result, WrapErr};
use tracing::info;

use tally_scheduler::{
    FileRuleStore, FixedHolidays, HolidayCalendar, NoHolidays, Notifier, Scheduler,
    SchedulerConfig,
};

use crate::collaborators::{HttpLedger, LogNotifier, WebhookNotifier};

/// Where rules live and which services the scheduler talks to.
#[derive(Debug, Clone, Args)]
pub struct ServiceArgs {
    /// Rule store file (default: <data dir>/tally/rules.json)
    #[arg(long, global = true, env = "TALLY_STORE_PATH")]
    pub store_path: Option<PathBuf>,

    /// Ledger service base URL
    #[arg(
        long,
        global = true,
        env = "TALLY_LEDGER_URL",
        default_value = "http://localhost:8080"
    )]
    pub ledger_url: String,

    /// Webhook receiving notifications (logged only if unset)
    #[arg(long, global = true, env = "TALLY_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// JSON file with a list of holiday dates (YYYY-MM-DD)
    #[arg(long, global = true, env = "TALLY_HOLIDAYS_FILE")]
    pub holidays_file: Option<PathBuf>,
}

/// Scheduler tuning. Unset flags keep the library defaults.
#[derive(Debug, Clone, Default, Args)]
pub struct SchedulerArgs {
    /// Seconds between due-rule scans
    #[arg(long, global = true, env = "TALLY_DUE_POLL_INTERVAL")]
    pub due_poll_interval: Option<u64>,

    /// Seconds between reminder scans
    #[arg(long, global = true, env = "TALLY_REMINDER_POLL_INTERVAL")]
    pub reminder_poll_interval: Option<u64>,

    /// Seconds between housekeeping sweeps
    #[arg(long, global = true, env = "TALLY_HOUSEKEEPING_INTERVAL")]
    pub housekeeping_interval: Option<u64>,

    /// Days completed/cancelled rules are kept
    #[arg(long, global = true, env = "TALLY_RETENTION_DAYS")]
    pub retention_days: Option<u64>,

    /// Rules materialized in parallel per tick
    #[arg(long, global = true, env = "TALLY_WORKER_POOL_SIZE")]
    pub worker_pool_size: Option<usize>,

    /// Consecutive ledger failures before a rule is paused (0 disables)
    #[arg(long, global = true, env = "TALLY_MAX_CONSECUTIVE_FAILURES")]
    pub max_consecutive_failures: Option<u32>,

    /// Seconds an execution claim is honoured
    #[arg(long, global = true, env = "TALLY_CLAIM_LEASE")]
    pub claim_lease: Option<u64>,

    /// Attempts for lifecycle writes that race another writer
    #[arg(long, global = true, env = "TALLY_LIFECYCLE_RETRY_ATTEMPTS")]
    pub lifecycle_retry_attempts: Option<u32>,
}

impl SchedulerArgs {
    pub fn to_config(&self) -> SchedulerConfig {
        let defaults = SchedulerConfig::default();
        SchedulerConfig {
            due_poll_interval_secs: self
                .due_poll_interval
                .unwrap_or(defaults.due_poll_interval_secs),
            reminder_poll_interval_secs: self
                .reminder_poll_interval
                .unwrap_or(defaults.reminder_poll_interval_secs),
            housekeeping_interval_secs: self
                .housekeeping_interval
                .unwrap_or(defaults.housekeeping_interval_secs),
            retention_days: self.retention_days.unwrap_or(defaults.retention_days),
            worker_pool_size: self.worker_pool_size.unwrap_or(defaults.worker_pool_size),
            max_consecutive_failures: self
                .max_consecutive_failures
                .unwrap_or(defaults.max_consecutive_failures),
            claim_lease_secs: self.claim_lease.unwrap_or(defaults.claim_lease_secs),
            lifecycle_retry_attempts: self
                .lifecycle_retry_attempts
                .unwrap_or(defaults.lifecycle_retry_attempts),
        }
    }
}

impl ServiceArgs {
    /// Resolve the store path, falling back to the platform data directory.
    pub fn store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tally")
                .join("rules.json")
        })
    }
}

/// Read a JSON array of dates into a holiday calendar.
pub async fn load_holidays(path: &Path) -> Result<FixedHolidays> {
    let json = tokio::fs::read_to_string(path)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read holidays file {}", path.display()))?;
    let dates: Vec<NaiveDate> = serde_json::from_str(&json)
        .into_diagnostic()
        .wrap_err("holidays file must be a JSON array of YYYY-MM-DD dates")?;
    Ok(FixedHolidays::new(dates))
}

/// Open the store and wire the scheduler to its collaborators.
pub async fn build_scheduler(services: &ServiceArgs, tuning: &SchedulerArgs) -> Result<Scheduler> {
    let store_path = services.store_path();
    let store = FileRuleStore::open(&store_path)
        .await
        .map_err(|e| miette::miette!("failed to open rule store {}: {}", store_path.display(), e))?;

    let ledger = HttpLedger::new(&services.ledger_url)
        .map_err(|e| miette::miette!("failed to build ledger client: {}", e))?;

    let notifier: Arc<dyn Notifier> = match &services.webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url)
                .map_err(|e| miette::miette!("failed to build webhook client: {}", e))?,
        ),
        None => Arc::new(LogNotifier),
    };

    let holidays: Arc<dyn HolidayCalendar> = match &services.holidays_file {
        Some(path) => {
            let holidays = load_holidays(path).await?;
            info!(count = holidays.len(), "loaded holiday calendar");
            Arc::new(holidays)
        }
        None => Arc::new(NoHolidays),
    };

    Ok(Scheduler::new(
        Arc::new(store),
        Arc::new(ledger),
        notifier,
        holidays,
        tuning.to_config(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tally_scheduler::{Frequency, Recurrence, RuleDraft, TransactionKind};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_unset_flags_keep_defaults() {
        assert_eq!(SchedulerArgs::default().to_config(), SchedulerConfig::default());
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = SchedulerArgs {
            due_poll_interval: Some(60),
            worker_pool_size: Some(16),
            ..SchedulerArgs::default()
        };
        let config = args.to_config();
        assert_eq!(config.due_poll_interval_secs, 60);
        assert_eq!(config.worker_pool_size, 16);
        assert_eq!(config.retention_days, SchedulerConfig::default().retention_days);
    }

    #[tokio::test]
    async fn test_load_holidays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holidays.json");
        tokio::fs::write(&path, r#"["2025-12-25", "2026-01-01"]"#)
            .await
            .unwrap();

        let holidays = load_holidays(&path).await.unwrap();
        assert_eq!(holidays.len(), 2);
        assert!(holidays.is_holiday(NaiveDate::from_ymd_opt(2025, 12, 25).unwrap()));
    }

    #[tokio::test]
    async fn test_load_holidays_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holidays.json");
        tokio::fs::write(&path, r#"{"christmas": true}"#).await.unwrap();

        assert!(load_holidays(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_wired_scheduler_posts_due_rule_to_ledger() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transactions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "tx-1"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let services = ServiceArgs {
            store_path: Some(dir.path().join("rules.json")),
            ledger_url: mock_server.uri(),
            webhook_url: None,
            holidays_file: None,
        };
        let scheduler = build_scheduler(&services, &SchedulerArgs::default())
            .await
            .unwrap();

        let now = Utc::now();
        let draft = RuleDraft {
            owner_id: "user-1".to_string(),
            category_id: "utilities".to_string(),
            payment_method: None,
            description: "Internet".to_string(),
            notes: None,
            amount: dec!(89.90),
            kind: TransactionKind::Expense,
            recurrence: Recurrence::every(Frequency::Monthly),
            start_date: now,
            end_date: None,
            max_executions: None,
            auto_adjust_amount: false,
            adjustment_percentage: dec!(0),
            notify_before_execution: false,
            notification_days_before: 1,
        };
        let rule = scheduler.create_rule(draft, now).await.unwrap();

        let summary = scheduler.run_due_tick(now).await.unwrap();
        assert_eq!(summary.executed, 1);

        // Reopening the store sees the advanced rule
        let reopened = build_scheduler(&services, &SchedulerArgs::default())
            .await
            .unwrap();
        let rule = reopened.get_rule(&rule.id).await.unwrap();
        assert_eq!(rule.execution_count, 1);
        assert!(rule.next_execution_date > now);
    }
}
