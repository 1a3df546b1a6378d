mod config;
mod status_cmd;
mod sync_cmd;
mod validate_cmd;

#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use pmac_core::plan::EntityKind;
use pmac_core::reconcile::InboundPolicy;
use pmac_core::resolve::Strategy;
use pmac_core::tracker::TrackerKind;

use config::{Overrides, ResolvedConfig};

#[derive(Parser)]
#[command(
    name = "pmac",
    about = "Keep a JSON project plan in sync with GitHub and Jira"
)]
struct Cli {
    /// Config file (overrides PMAC_CONFIG env var)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Plan file (overrides PMAC_PLAN env var and sync.plan_path)
    #[arg(long, global = true)]
    plan: Option<PathBuf>,

    /// Mapping file (overrides PMAC_MAPPING env var and sync.mapping_path)
    #[arg(long, global = true)]
    mapping: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the plan file and list every problem found
    Validate,
    /// Show what a sync would change, without touching anything
    Diff {
        /// Conflict strategy: source_priority, newest_wins, or manual
        #[arg(long)]
        strategy: Option<Strategy>,
    },
    /// Run one sync pass
    Sync {
        /// Conflict strategy: source_priority, newest_wins, or manual
        #[arg(long)]
        strategy: Option<Strategy>,
        /// Remote-only edits: pull_merge or conflict
        #[arg(long)]
        inbound_policy: Option<InboundPolicy>,
        /// Compute the change set only (same as `pmac diff`)
        #[arg(long)]
        dry_run: bool,
    },
    /// Forget the link between a plan entity and its remote record
    Unlink {
        /// Entity kind: epic, story, sprint, or view
        kind: EntityKind,
        /// Plan id of the entity
        id: String,
        /// Tracker to unlink from: github or jira
        #[arg(long)]
        tracker: TrackerKind,
    },
    /// Show per-pair sync state from the mapping table (no remote calls)
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let overrides = Overrides {
        config: cli.config,
        plan: cli.plan,
        mapping: cli.mapping,
    };

    match cli.command {
        Commands::Validate => {
            let resolved = ResolvedConfig::resolve(&overrides)?;
            validate_cmd::run_validate(&resolved)?;
        }
        Commands::Diff { strategy } => {
            let resolved = ResolvedConfig::resolve(&overrides)?;
            let options = sync_cmd::SyncArgs {
                strategy,
                inbound_policy: None,
                dry_run: true,
            };
            sync_cmd::run_sync(&resolved, options).await?;
        }
        Commands::Sync {
            strategy,
            inbound_policy,
            dry_run,
        } => {
            let resolved = ResolvedConfig::resolve(&overrides)?;
            let options = sync_cmd::SyncArgs {
                strategy,
                inbound_policy,
                dry_run,
            };
            sync_cmd::run_sync(&resolved, options).await?;
        }
        Commands::Unlink { kind, id, tracker } => {
            let resolved = ResolvedConfig::resolve(&overrides)?;
            sync_cmd::run_unlink(&resolved, kind, id, tracker).await?;
        }
        Commands::Status => {
            let resolved = ResolvedConfig::resolve(&overrides)?;
            status_cmd::run_status(&resolved)?;
        }
    }

    Ok(())
}
