//! Snapshot Agent - Main entry point

use anyhow::Result;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use snapshot_agent::{config::Config, daemon, path::DateRange, state::AgentState, utils};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scheduled snapshots, uploads, retention and verification
    Daemon,
    /// Take one snapshot and upload it
    Snapshot,
    /// Upload files left in snapshot directories
    Upload,
    /// Apply remote retention once
    Ttl,
    /// Verify the newest backup within the SLO window
    Verify,
    /// Print the backup status ledger as JSON
    Status,
    /// Download the newest valid backup in a window into a staging directory
    Restore {
        /// Window as yyyyMMddHHmm,yyyyMMddHHmm (default: the last day)
        #[arg(long)]
        range: Option<DateRange>,

        /// Directory receiving <keyspace>/<table>/<file>
        #[arg(long, value_name = "DIR")]
        target: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) if path.exists() => Config::from_file(path)?,
        Some(path) => {
            eprintln!("Config file {} not found, using defaults", path.display());
            Config::default()
        }
        None => Config::default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting snapshot-agent v{} (cluster: {}, token: {})",
        env!("CARGO_PKG_VERSION"),
        config.node.cluster_name,
        config.node.token
    );

    let state = AgentState::new(config).await?;

    match args.command.unwrap_or(Command::Daemon) {
        Command::Daemon => daemon::run(state).await?,
        Command::Snapshot => {
            let outcome = state.orchestrator.take_snapshot(Utc::now()).await?;
            let summary = state.orchestrator.queue().drain().await;
            tracing::info!(
                snapshot = %outcome.snapshot_name,
                manifest = %outcome.manifest_key,
                uploaded = summary.uploaded,
                failed = summary.failed,
                "Snapshot finished"
            );
        }
        Command::Upload => {
            let summary = state.orchestrator.upload_pending(None).await?;
            tracing::info!(uploaded = summary.uploaded, failed = summary.failed, "Upload finished");
        }
        Command::Ttl => {
            let summary = state.ttl.run(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Verify => {
            let result = state.verification.verify_latest(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.valid {
                anyhow::bail!("backup verification failed");
            }
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&state.status.all().await)?);
        }
        Command::Restore { range, target } => {
            let range = range.unwrap_or_else(|| DateRange::ending_at(Utc::now(), Duration::days(1)));
            let summary = state.restorer.restore(&range, &target).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
