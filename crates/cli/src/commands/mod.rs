pub mod config;
pub mod enqueue;
pub mod migrate;
pub mod reaper;
pub mod status;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use claimq_durable::clock::system_clock;
use claimq_durable::persistence::{self, TaskStore};
use claimq_durable::remote::{HttpTaskRegistry, RemoteReporter, DEFAULT_REPORTER_CAPACITY};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long to wait for queued registry events on exit
const REPORTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the store named by `--database-url`, applying the schema
pub async fn open_store(database_url: &str) -> Result<Arc<dyn TaskStore>> {
    persistence::connect(database_url, system_clock())
        .await
        .with_context(|| format!("Failed to open store at {}", redact(database_url)))
}

/// Start forwarding queue events to the registry at `url`
pub fn spawn_reporter(url: &str) -> Result<(RemoteReporter, JoinHandle<()>)> {
    let registry =
        HttpTaskRegistry::new(url).with_context(|| format!("Invalid registry URL: {url}"))?;
    Ok(RemoteReporter::spawn(Arc::new(registry), DEFAULT_REPORTER_CAPACITY))
}

/// Wait for the forwarder to drain once every reporter handle is dropped
pub async fn flush_reporter(forwarder: JoinHandle<()>) {
    if tokio::time::timeout(REPORTER_DRAIN_TIMEOUT, forwarder).await.is_err() {
        tracing::warn!("Timed out flushing registry events");
    }
}

/// Parse a whole-second duration flag
pub fn seconds(value: u64) -> Duration {
    Duration::from_secs(value)
}

/// Token cancelled on Ctrl-C or SIGTERM
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Received shutdown signal");
        child.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Hide the password of a database URL before printing it
pub fn redact(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.split_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact() {
        assert_eq!(
            redact("postgres://claimq:secret@db:5432/queue"),
            "postgres://claimq:***@db:5432/queue"
        );
        assert_eq!(redact("postgres://claimq@db/queue"), "postgres://claimq@db/queue");
        assert_eq!(redact("sqlite://claimq.db"), "sqlite://claimq.db");
        assert_eq!(redact("memory:"), "memory:");
    }

    #[tokio::test]
    async fn test_open_store_reports_bad_url() {
        let err = open_store("mysql://nope").await.err().unwrap();
        assert!(format!("{err:#}").contains("Failed to open store at mysql://nope"));
    }
}
