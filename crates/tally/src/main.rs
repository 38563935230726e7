//! Tally: recurring transaction scheduler
//!
//! Main binary with subcommands:
//! - `daemon`: Run the due, reminder and housekeeping loops
//! - `add`, `list`, `show`: Create and inspect rules
//! - `pause`, `resume`, `cancel`: Rule lifecycle
//! - `run-now`, `preview`: Manual execution and upcoming dates

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod collaborators;
mod config;
mod daemon;
mod rules;

use config::{SchedulerArgs, ServiceArgs, build_scheduler};

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Recurring transaction scheduler", long_about = None)]
struct Cli {
    #[command(flatten)]
    services: ServiceArgs,

    #[command(flatten)]
    tuning: SchedulerArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Daemon,

    /// Create a rule from a JSON draft file
    Add {
        /// Path to the rule draft
        #[arg(value_name = "RULE_JSON")]
        file: PathBuf,
    },

    /// List an owner's rules
    List {
        /// Owner id
        #[arg(long)]
        owner: String,
    },

    /// Show a rule with its execution history
    Show { id: String },

    /// Pause an active rule
    Pause {
        id: String,

        /// Why the rule is paused
        #[arg(long)]
        reason: Option<String>,
    },

    /// Resume a paused rule, skipping occurrences missed meanwhile
    Resume { id: String },

    /// Cancel a rule for good
    Cancel { id: String },

    /// Execute a rule's current occurrence now
    RunNow { id: String },

    /// Show the next due dates of a rule
    Preview {
        id: String,

        /// Number of dates to show
        #[arg(long, default_value = "5")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; stdout is reserved for command output
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tally=info,tally_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli {
        services,
        tuning,
        command,
    } = Cli::parse();

    match command {
        Commands::Daemon => daemon::run(&services, &tuning).await,
        Commands::Add { file } => {
            let scheduler = build_scheduler(&services, &tuning).await?;
            rules::add(&scheduler, &file).await
        }
        Commands::List { owner } => {
            let scheduler = build_scheduler(&services, &tuning).await?;
            rules::list(&scheduler, &owner).await
        }
        Commands::Show { id } => {
            let scheduler = build_scheduler(&services, &tuning).await?;
            rules::show(&scheduler, &id).await
        }
        Commands::Pause { id, reason } => {
            let scheduler = build_scheduler(&services, &tuning).await?;
            rules::pause(&scheduler, &id, reason).await
        }
        Commands::Resume { id } => {
            let scheduler = build_scheduler(&services, &tuning).await?;
            rules::resume(&scheduler, &id).await
        }
        Commands::Cancel { id } => {
            let scheduler = build_scheduler(&services, &tuning).await?;
            rules::cancel(&scheduler, &id).await
        }
        Commands::RunNow { id } => {
            let scheduler = build_scheduler(&services, &tuning).await?;
            rules::run_now(&scheduler, &id).await
        }
        Commands::Preview { id, count } => {
            let scheduler = build_scheduler(&services, &tuning).await?;
            rules::preview(&scheduler, &id, count).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_daemon_subcommand_parses() {
        let cli = Cli::try_parse_from(["tally", "daemon", "--claim-lease", "120"]).unwrap();
        assert!(matches!(cli.command, Commands::Daemon));
        assert_eq!(cli.tuning.to_config().claim_lease_secs, 120);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tally",
            "preview",
            "rule-1",
            "--count",
            "3",
            "--store-path",
            "/tmp/rules.json",
            "--due-poll-interval",
            "60",
        ])
        .unwrap();

        assert!(matches!(cli.command, Commands::Preview { count: 3, .. }));
        assert_eq!(
            cli.services.store_path,
            Some(PathBuf::from("/tmp/rules.json"))
        );
        assert_eq!(cli.tuning.to_config().due_poll_interval_secs, 60);
    }
}
