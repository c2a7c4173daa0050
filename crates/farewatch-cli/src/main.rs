use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use farewatch_storage::{top_cheapest, CheapestFlightRow};
use farewatch_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "farewatch")]
#[command(about = "One-way fare scraper and price history tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every configured route once.
    Sync,
    /// Create any missing relational tables.
    Migrate,
    /// Run syncs on the configured cron schedule until Ctrl-C.
    Schedule,
    /// Print the cheapest upcoming flights from the JSON store.
    Top {
        #[arg(short, long, default_value_t = 3)]
        n: usize,
        /// Defaults to FAREWATCH_DATA_PATH.
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = farewatch_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} routes={} dates={} observations={} json(created={} appended={} unchanged={}) db(created={} updated={} unchanged={}) skipped={} failed={}",
                summary.run_id,
                summary.routes,
                summary.dates_scanned,
                summary.observations,
                summary.json_created,
                summary.json_appended,
                summary.json_unchanged,
                summary.db_created,
                summary.db_updated,
                summary.db_unchanged,
                summary.skipped,
                summary.failed,
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            match farewatch_sync::migrate(&config).await? {
                Some(_) => println!("schema ready"),
                None => eprintln!("DATABASE_URL is not set; nothing to migrate"),
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(farewatch_sync::pipeline_from_env().await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                eprintln!("FAREWATCH_SCHEDULE_CRON is empty; nothing to schedule");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Top { n, path } => {
            let path = path.unwrap_or_else(|| SyncConfig::from_env().data_path);
            let documents = top_cheapest(&path, n).await;
            if documents.is_empty() {
                println!("no upcoming flights in {}", path.display());
            }
            for row in documents.iter().filter_map(CheapestFlightRow::from_document) {
                println!(
                    "{}  {}  {:>8.2} {}",
                    row.departure, row.direction, row.price, row.currency
                );
            }
        }
    }

    Ok(())
}
