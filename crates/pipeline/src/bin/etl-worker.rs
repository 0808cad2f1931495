//! etl-worker: runs the scheduled extraction and the transform consumer.
//!
//! Subcommands:
//! - `schedule`: fire an orchestration on every tick of `TRIGGER_SCHEDULE`
//! - `run-once`: a single orchestration attempt, then exit
//! - `transform`: consume the `extracted` change feed into `transformed`
//!
//! With `--store memory` nothing leaves the process, so `schedule` also runs
//! the transform consumer alongside the trigger.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::Notify;
use tracing::{info, warn};

use etl_core::config::{load_dotenv, Config};
use etl_core::SourceRecord;
use etl_pipeline::{Orchestrator, RunOutcome, ScheduleTrigger, TransformWorker};
use etl_store::{ChangeFeed, HttpDocumentStore, MemoryStore, RecordStore, StoredRecord};

// ── CLI ─────────────────────────────────────────────────────────────

/// Lease-coordinated extract/transform worker.
#[derive(Parser, Debug)]
#[command(name = "etl-worker", version, about)]
struct Cli {
    /// Config profile; `{PROFILE}_{KEY}` env vars override plain `{KEY}`.
    #[arg(long, env = "ETL_PROFILE", default_value = "")]
    profile: String,

    /// Document store backend.
    #[arg(long, env = "ETL_STORE", value_enum, default_value_t = StoreKind::Http)]
    store: StoreKind,

    /// Seconds to wait for running orchestrations and the transform
    /// consumer after a shutdown signal.
    #[arg(long, env = "ETL_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Trigger orchestrations on the configured cron schedule.
    Schedule,
    /// Run a single orchestration attempt and exit.
    RunOnce,
    /// Transform newly extracted records as they arrive.
    Transform,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum StoreKind {
    Http,
    Memory,
}

// ── helpers ─────────────────────────────────────────────────────────

/// A store handle plus a change feed over the `extracted` collection.
fn open_store(kind: StoreKind, config: &Config) -> anyhow::Result<(RecordStore, Arc<dyn ChangeFeed>)> {
    match kind {
        StoreKind::Http => {
            let http = HttpDocumentStore::new(&config.store)?;
            let feed: Arc<dyn ChangeFeed> = Arc::new(http.change_feed(SourceRecord::COLLECTION));
            Ok((RecordStore::new(Arc::new(http)), feed))
        }
        StoreKind::Memory => {
            let memory = Arc::new(MemoryStore::new());
            let feed: Arc<dyn ChangeFeed> = Arc::new(memory.change_feed(SourceRecord::COLLECTION));
            Ok((RecordStore::new(memory), feed))
        }
    }
}

/// Notify every listener once Ctrl-C arrives.
fn spawn_signal_handler(listeners: Vec<Arc<Notify>>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received");
        for listener in listeners {
            listener.notify_one();
        }
    });
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let config = Config::for_profile(&cli.profile)?;
    config.validate()?;
    config.log_summary();

    let location = config.worker.location().to_string();
    let (store, feed) = open_store(cli.store, &config)?;
    info!(store = ?cli.store, %location, "etl-worker starting");

    match cli.command {
        Command::RunOnce => {
            let orchestrator = Orchestrator::from_config(&config, store)?;
            match orchestrator.run().await? {
                RunOutcome::Skipped(acquisition) => info!(?acquisition, "run skipped"),
                RunOutcome::Completed { saved, run } => {
                    info!(saved, run_id = %run.id, "run completed")
                }
                RunOutcome::SourceUnavailable { reason, run } => {
                    anyhow::bail!("run {} failed: {reason}", run.id);
                }
            }
        }
        Command::Schedule => {
            let grace = Duration::from_secs(cli.shutdown_timeout);
            let orchestrator = Arc::new(Orchestrator::from_config(&config, store.clone())?);
            let trigger =
                ScheduleTrigger::new(&config.trigger.schedule)?.with_shutdown_grace(grace);
            let trigger_shutdown = Arc::new(Notify::new());

            if cli.store == StoreKind::Memory {
                let worker = Arc::new(TransformWorker::new(store, feed, &location, &config.transform));
                let worker_shutdown = Arc::new(Notify::new());
                spawn_signal_handler(vec![trigger_shutdown.clone(), worker_shutdown.clone()]);

                let transform = tokio::spawn({
                    let worker = Arc::clone(&worker);
                    async move { worker.run(worker_shutdown).await }
                });
                trigger.run(orchestrator, trigger_shutdown).await;

                if tokio::time::timeout(grace, transform).await.is_err() {
                    warn!("transform worker did not stop within {}s", grace.as_secs());
                }
            } else {
                spawn_signal_handler(vec![trigger_shutdown.clone()]);
                trigger.run(orchestrator, trigger_shutdown).await;
            }
        }
        Command::Transform => {
            let worker = TransformWorker::new(store, feed, &location, &config.transform);
            let shutdown = Arc::new(Notify::new());
            spawn_signal_handler(vec![shutdown.clone()]);
            worker.run(shutdown).await;
        }
    }

    info!("etl-worker exited cleanly");
    Ok(())
}
