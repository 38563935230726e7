//! Rule management commands.

use std::path::Path;

use chrono::Utc;
use miette::{IntoDiagnostic, Result, WrapErr};

use tally_scheduler::{MaterializeOutcome, RecurrenceRule, RuleDraft, Scheduler, TransactionKind};

fn print_json(rule: &RecurrenceRule) -> Result<()> {
    let json = serde_json::to_string_pretty(rule).into_diagnostic()?;
    println!("{}", json);
    Ok(())
}

fn summary_line(rule: &RecurrenceRule) -> String {
    format!(
        "{}  {:<9}  {}  {:>10} {:<7}  {}",
        rule.id,
        rule.status.to_string(),
        rule.next_execution_date.format("%Y-%m-%d"),
        rule.amount,
        match rule.kind {
            TransactionKind::Income => "income",
            TransactionKind::Expense => "expense",
        },
        rule.description
    )
}

/// Create a rule from a JSON draft file.
pub async fn add(scheduler: &Scheduler, file: &Path) -> Result<()> {
    let json = tokio::fs::read_to_string(file)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", file.display()))?;
    let draft: RuleDraft = serde_json::from_str(&json)
        .into_diagnostic()
        .wrap_err("invalid rule draft")?;

    let rule = scheduler.create_rule(draft, Utc::now()).await.into_diagnostic()?;
    print_json(&rule)
}

pub async fn list(scheduler: &Scheduler, owner: &str) -> Result<()> {
    let rules = scheduler.list_rules(owner).await.into_diagnostic()?;
    if rules.is_empty() {
        println!("No rules for {}.", owner);
        return Ok(());
    }
    for rule in &rules {
        println!("{}", summary_line(rule));
    }
    Ok(())
}

pub async fn show(scheduler: &Scheduler, id: &str) -> Result<()> {
    let rule = scheduler.get_rule(id).await.into_diagnostic()?;
    print_json(&rule)
}

pub async fn pause(scheduler: &Scheduler, id: &str, reason: Option<String>) -> Result<()> {
    let rule = scheduler.pause_rule(id, reason, Utc::now()).await.into_diagnostic()?;
    println!("{}", summary_line(&rule));
    Ok(())
}

pub async fn resume(scheduler: &Scheduler, id: &str) -> Result<()> {
    let rule = scheduler.resume_rule(id, Utc::now()).await.into_diagnostic()?;
    println!("{}", summary_line(&rule));
    Ok(())
}

pub async fn cancel(scheduler: &Scheduler, id: &str) -> Result<()> {
    let rule = scheduler.cancel_rule(id, Utc::now()).await.into_diagnostic()?;
    println!("{}", summary_line(&rule));
    Ok(())
}

pub async fn run_now(scheduler: &Scheduler, id: &str) -> Result<()> {
    match scheduler.execute_now(id, Utc::now()).await.into_diagnostic()? {
        MaterializeOutcome::Executed {
            transaction_id,
            rule,
        } => {
            println!("Created transaction {}.", transaction_id);
            println!("{}", summary_line(&rule));
        }
        MaterializeOutcome::Inactive(status) => {
            return Err(miette::miette!("rule {} is {}, nothing to run", id, status));
        }
        MaterializeOutcome::Conflict => {
            return Err(miette::miette!(
                "rule {} is being executed by another process, try again shortly",
                id
            ));
        }
        // Manual runs skip the due check and failures come back as errors
        MaterializeOutcome::NotDue | MaterializeOutcome::Failed { .. } => {}
    }
    Ok(())
}

pub async fn preview(scheduler: &Scheduler, id: &str, count: usize) -> Result<()> {
    let dates = scheduler.preview(id, count).await.into_diagnostic()?;
    if dates.is_empty() {
        println!("Rule {} has no upcoming executions.", id);
    }
    for date in dates {
        println!("{}", date.format("%Y-%m-%d %H:%M UTC (%a)"));
    }
    Ok(())
}
