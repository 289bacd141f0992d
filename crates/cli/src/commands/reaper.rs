// Reaper commands

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use claimq_durable::config::QueueSettings;
use claimq_durable::worker::{Reaper, ReaperConfig, ReaperStats};

use super::{open_store, seconds, shutdown_token};
use crate::output::{print_field, OutputFormat};

#[derive(Subcommand)]
pub enum ReaperCommand {
    /// Requeue stale claims until interrupted
    Run(ReaperRunArgs),
}

#[derive(Args, Debug)]
pub struct ReaperRunArgs {
    /// Seconds between sweeps (default: a quarter of the timeout)
    #[arg(long)]
    pub interval: Option<u64>,

    /// Seconds without a heartbeat before a claim is stale (default: stored setting)
    #[arg(long, env = "CLAIMQ_REAP_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Run a single sweep and exit
    #[arg(long)]
    pub once: bool,
}

pub async fn run(command: ReaperCommand, database_url: &str, output: OutputFormat) -> Result<()> {
    match command {
        ReaperCommand::Run(args) => run_reaper(args, database_url, output).await,
    }
}

fn reaper_config(args: &ReaperRunArgs, settings: &QueueSettings) -> ReaperConfig {
    let mut settings = settings.clone();
    if let Some(secs) = args.timeout {
        settings.reap_timeout = seconds(secs);
    }

    let config = ReaperConfig::from_settings(&settings);
    match args.interval {
        Some(secs) => config.with_interval(seconds(secs)),
        None => config,
    }
}

async fn run_reaper(args: ReaperRunArgs, database_url: &str, output: OutputFormat) -> Result<()> {
    let store = open_store(database_url).await?;
    let settings = QueueSettings::load(store.as_ref())
        .await
        .context("Failed to load queue settings")?;
    let config = reaper_config(&args, &settings);
    let reaper = Reaper::new(store, config).context("Invalid reaper configuration")?;

    if args.once {
        let outcome = reaper.sweep().await.context("Sweep failed")?;
        if output.is_text() {
            print_field("Requeued", &outcome.requeued.len().to_string());
            print_field("Failed", &outcome.failed.len().to_string());
            return Ok(());
        }
        return output.print_value(&outcome);
    }

    tracing::info!(
        interval_ms = reaper.config().interval.as_millis() as u64,
        timeout_ms = reaper.config().timeout.as_millis() as u64,
        "Starting reaper"
    );
    let stats = reaper.run(shutdown_token()).await;
    tracing::info!("Reaper shutdown complete");

    print_stats(&stats, output)
}

fn print_stats(stats: &ReaperStats, output: OutputFormat) -> Result<()> {
    if !output.is_text() {
        return output.print_value(stats);
    }
    print_field("Sweeps", &stats.sweeps_total.to_string());
    print_field("Requeued", &stats.requeued_total.to_string());
    print_field("Failed", &stats.failed_total.to_string());
    print_field("Errors", &stats.errors_total.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn args(interval: Option<u64>, timeout: Option<u64>) -> ReaperRunArgs {
        ReaperRunArgs {
            interval,
            timeout,
            once: false,
        }
    }

    #[test]
    fn test_config_defaults_to_stored_timeout() {
        let settings = QueueSettings::default().with_reap_timeout(Duration::from_secs(40));
        let config = reaper_config(&args(None, None), &settings);
        assert_eq!(config.timeout, Duration::from_secs(40));
        assert_eq!(config.interval, Duration::from_secs(10));
    }

    #[test]
    fn test_flags_override() {
        let config = reaper_config(&args(Some(3), Some(90)), &QueueSettings::default());
        assert_eq!(config.timeout, Duration::from_secs(90));
        assert_eq!(config.interval, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_single_sweep_on_empty_queue() {
        let a = ReaperRunArgs {
            interval: None,
            timeout: None,
            once: true,
        };
        run_reaper(a, "memory:", OutputFormat::Json).await.unwrap();
    }
}
