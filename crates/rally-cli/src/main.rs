use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rally_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "rally-cli")]
#[command(about = "Rally map enrichment command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the enrichment pipeline once over every enabled source.
    Sync,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// Rewrite the resolver caches to one line per key.
    CompactCaches {
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = rally_sync::run_sync_once(config).await?;
            println!(
                "sync complete: run_id={} processed={} added={} rejects={} duplicates={} \
                 suspicious={}",
                summary.run_id,
                summary.stats.rows_processed,
                summary.stats.added,
                summary.stats.rejects,
                summary.stats.duplicates,
                summary.suspicious
            );
        }
        Commands::Schedule => {
            let Some(mut sched) = rally_sync::maybe_build_scheduler(&config).await? else {
                eprintln!("scheduler disabled; set RALLY_SCHEDULER_ENABLED=true");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::CompactCaches { cache_dir } => {
            let cache_dir = cache_dir.unwrap_or_else(|| config.cache_dir.clone());
            let report = rally_sync::compact_caches(&cache_dir).await?;
            for (file, kept) in &report.kept {
                println!("{file}: {kept} entries");
            }
        }
    }

    Ok(())
}
