use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use obsync_sync::RunStatus;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "obsync")]
#[command(about = "Delta sync of health observations from Firestore into the warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and write its report.
    Sync,
    /// Run syncs on OBSYNC_SYNC_CRON until interrupted.
    Schedule,
    /// Print the stored watermark.
    Watermark,
    /// Create warehouse tables.
    Migrate,
    /// Summarize recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long, env = "OBSYNC_REPORTS_DIR", default_value = "./reports")]
        dir: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let run = obsync_sync::run_sync_once_from_env().await?;
            let summary = &run.summary;
            println!(
                "sync {:?}: run_id={} users_added={} observations={} failed_groups={} report={}",
                summary.status(),
                summary.run_id,
                summary.users.added,
                summary.observations_uploaded,
                summary.failed_groups().count(),
                run.report_dir
                    .as_deref()
                    .map(|dir| dir.display().to_string())
                    .unwrap_or_else(|| "-".into()),
            );
            if summary.status() == RunStatus::Failed {
                bail!("sync run {} failed", summary.run_id);
            }
        }
        Commands::Schedule => obsync_sync::run_scheduler_from_env().await?,
        Commands::Watermark => match obsync_sync::show_watermark_from_env().await? {
            Some(watermark) => println!(
                "last sync: {} (updated {})",
                watermark.timestamp,
                watermark
                    .updated_at
                    .map(|ts| ts.to_string())
                    .unwrap_or_else(|| "unknown".into())
            ),
            None => println!("no previous sync recorded"),
        },
        Commands::Migrate => println!("{}", obsync_sync::migrate_from_env().await?),
        Commands::Report { runs, dir } => {
            println!("{}", obsync_sync::recent_runs_markdown(&dir, runs)?);
        }
    }

    Ok(())
}
