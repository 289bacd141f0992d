// Queue settings commands

use anyhow::{Context, Result};
use clap::Subcommand;
use claimq_durable::config::QueueSettings;
use claimq_durable::persistence::TaskStore;
use claimq_durable::strategy::ClaimStrategy;

use super::{open_store, seconds};
use crate::output::{print_field, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the stored queue settings
    Show,

    /// Change stored queue settings; unset flags keep their current value
    Set {
        /// Claim strategy (fifo, lifo, priority, weighted)
        #[arg(long)]
        strategy: Option<ClaimStrategy>,

        /// Seconds between heartbeats
        #[arg(long)]
        heartbeat_interval: Option<u64>,

        /// Seconds without a heartbeat before a claim is reaped
        #[arg(long)]
        reap_timeout: Option<u64>,
    },
}

pub async fn run(command: ConfigCommand, database_url: &str, output: OutputFormat) -> Result<()> {
    let store = open_store(database_url).await?;

    let settings = match command {
        ConfigCommand::Show => load(store.as_ref()).await?,
        ConfigCommand::Set {
            strategy,
            heartbeat_interval,
            reap_timeout,
        } => set(store.as_ref(), strategy, heartbeat_interval, reap_timeout).await?,
    };

    print_settings(&settings, output)
}

async fn load(store: &dyn TaskStore) -> Result<QueueSettings> {
    QueueSettings::load(store)
        .await
        .context("Failed to load queue settings")
}

async fn set(
    store: &dyn TaskStore,
    strategy: Option<ClaimStrategy>,
    heartbeat_interval: Option<u64>,
    reap_timeout: Option<u64>,
) -> Result<QueueSettings> {
    let mut settings = load(store).await?;
    if let Some(strategy) = strategy {
        settings = settings.with_strategy(strategy);
    }
    if let Some(secs) = heartbeat_interval {
        settings = settings.with_heartbeat_interval(seconds(secs));
    }
    if let Some(secs) = reap_timeout {
        settings = settings.with_reap_timeout(seconds(secs));
    }

    settings
        .save(store)
        .await
        .context("Failed to save queue settings")?;
    tracing::info!(
        strategy = %settings.strategy,
        heartbeat_interval_ms = settings.heartbeat_interval.as_millis() as u64,
        reap_timeout_ms = settings.reap_timeout.as_millis() as u64,
        "Queue settings saved"
    );
    Ok(settings)
}

fn print_settings(settings: &QueueSettings, output: OutputFormat) -> Result<()> {
    if !output.is_text() {
        return output.print_value(settings);
    }
    print_field("Strategy", &settings.strategy.to_string());
    print_field(
        "Heartbeat",
        &format!("{}s", settings.heartbeat_interval.as_secs_f64()),
    );
    print_field("Reap Timeout", &format!("{}s", settings.reap_timeout.as_secs_f64()));
    Ok(())
}
