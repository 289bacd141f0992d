// Worker commands

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use claimq_durable::config::QueueSettings;
use claimq_durable::strategy::ClaimStrategy;
use claimq_durable::worker::{
    PollerConfig, Reaper, ReaperConfig, ReaperStats, WorkerConfig, WorkerFactory, WorkerStats,
};
use serde::Serialize;

use super::{flush_reporter, open_store, seconds, shutdown_token, spawn_reporter};
use crate::executors::default_registry;
use crate::output::{print_field, OutputFormat};

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// Claim and execute tasks of one type until interrupted
    Run(WorkerRunArgs),
}

#[derive(Args, Debug)]
pub struct WorkerRunArgs {
    /// Task type to claim (echo, sleep, webhook)
    #[arg(long, env = "CLAIMQ_TASK_TYPE")]
    pub task_type: String,

    /// Claim strategy (fifo, lifo, priority, weighted)
    #[arg(long, env = "CLAIMQ_STRATEGY")]
    pub strategy: Option<ClaimStrategy>,

    /// Seconds between heartbeats of a claimed task
    #[arg(long, env = "CLAIMQ_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval: Option<u64>,

    /// Worker ID (generated if not provided)
    #[arg(long, env = "CLAIMQ_WORKER_ID")]
    pub worker_id: Option<String>,

    /// Seconds without a heartbeat before a claim is reaped
    #[arg(long, env = "CLAIMQ_REAP_TIMEOUT")]
    pub reap_timeout: Option<u64>,

    /// Do not run the embedded reaper
    #[arg(long)]
    pub no_reaper: bool,

    /// Give up after this many consecutive store failures (retry forever if unset)
    #[arg(long, env = "CLAIMQ_MAX_STORE_FAILURES")]
    pub max_store_failures: Option<u32>,

    /// Base URL of a remote task registry to mirror activity to
    #[arg(long, env = "CLAIMQ_REGISTRY_URL")]
    pub registry_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct WorkerSummary {
    worker_id: String,
    task_type: String,
    stats: WorkerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    reaper: Option<ReaperStats>,
}

pub async fn run(command: WorkerCommand, database_url: &str, output: OutputFormat) -> Result<()> {
    match command {
        WorkerCommand::Run(args) => run_worker(args, database_url, output).await,
    }
}

/// Overlay flags on the stored settings
fn resolve_settings(args: &WorkerRunArgs, stored: QueueSettings) -> Result<QueueSettings> {
    let mut settings = stored;
    if let Some(strategy) = &args.strategy {
        settings.strategy = strategy.clone();
    }
    if let Some(secs) = args.heartbeat_interval {
        settings.heartbeat_interval = seconds(secs);
    }
    if let Some(secs) = args.reap_timeout {
        settings.reap_timeout = seconds(secs);
    }
    settings
        .validate()
        .context("Invalid worker timing configuration")?;
    Ok(settings)
}

fn worker_config(args: &WorkerRunArgs, settings: &QueueSettings) -> WorkerConfig {
    let mut poller = PollerConfig::new();
    if let Some(max) = args.max_store_failures {
        poller = poller.with_max_store_failures(max);
    }

    let mut config = WorkerConfig::from_settings(settings).with_poller(poller);
    if let Some(id) = &args.worker_id {
        config = config.with_worker_id(id.clone());
    }
    config
}

async fn run_worker(args: WorkerRunArgs, database_url: &str, output: OutputFormat) -> Result<()> {
    let store = open_store(database_url).await?;
    let stored = QueueSettings::load(store.as_ref())
        .await
        .context("Failed to load queue settings")?;
    let settings = resolve_settings(&args, stored)?;
    let config = worker_config(&args, &settings);

    let mut factory = WorkerFactory::new(Arc::clone(&store), default_registry()?);
    let mut forwarder = None;
    if let Some(url) = &args.registry_url {
        let (reporter, handle) = spawn_reporter(url)?;
        factory = factory.with_reporter(reporter);
        forwarder = Some(handle);
    }

    let worker = factory
        .build(&args.task_type, config)
        .context("Failed to create worker")?;
    drop(factory);

    let shutdown = shutdown_token();

    let reaper = if args.no_reaper {
        None
    } else {
        let reaper = Reaper::new(Arc::clone(&store), ReaperConfig::from_settings(&settings))
            .context("Invalid reaper configuration")?;
        Some(reaper.spawn(shutdown.clone()))
    };

    tracing::info!(
        worker_id = %worker.worker_id(),
        task_type = %worker.task_type(),
        strategy = %settings.strategy,
        heartbeat_interval_ms = settings.heartbeat_interval.as_millis() as u64,
        reap_timeout_ms = settings.reap_timeout.as_millis() as u64,
        reaper = !args.no_reaper,
        "Starting worker"
    );

    let result = worker.run(shutdown.clone()).await;

    // Stop the embedded reaper whichever way the worker ended.
    shutdown.cancel();
    let reaper_stats = match reaper {
        Some(handle) => Some(handle.await.context("Reaper task failed")?),
        None => None,
    };

    let summary = WorkerSummary {
        worker_id: worker.worker_id().to_string(),
        task_type: worker.task_type().to_string(),
        stats: result.context("Worker stopped")?,
        reaper: reaper_stats,
    };

    drop(worker);
    if let Some(handle) = forwarder {
        flush_reporter(handle).await;
    }

    tracing::info!("Worker shutdown complete");
    print_summary(&summary, output)
}

fn print_summary(summary: &WorkerSummary, output: OutputFormat) -> Result<()> {
    if !output.is_text() {
        return output.print_value(summary);
    }

    let stats = &summary.stats;
    print_field("Worker", &summary.worker_id);
    print_field("Task Type", &summary.task_type);
    print_field("Completed", &stats.completed.to_string());
    print_field("Requeued", &stats.requeued.to_string());
    print_field("Terminated", &stats.terminated.to_string());
    print_field("Lost", &stats.ownership_lost.to_string());
    print_field("Unreported", &stats.unreported.to_string());
    print_field("Heartbeats", &stats.heartbeats_sent.to_string());
    if let Some(reaper) = &summary.reaper {
        print_field("Reaped", &reaper.requeued_total.to_string());
        print_field("Reap Failed", &reaper.failed_total.to_string());
    }
    Ok(())
}
