// Built-in executors
//
// Design Decision: Ship a few generic executors so `claimq worker run` is useful without custom code.
// Design Decision: Webhook failures map to retryable/fatal by HTTP status (4xx fatal, except 408/429).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use claimq_durable::task::{ExecutionError, Task};
use claimq_durable::worker::{ExecutionResult, Executor, ExecutorRegistry};
use reqwest::StatusCode;
use serde_json::{json, Value};

/// Longest sleep the `sleep` executor accepts
const MAX_SLEEP_MS: u64 = 24 * 60 * 60 * 1000;

/// Registry with `echo`, `sleep` and `webhook`
pub fn default_registry() -> anyhow::Result<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::new();
    registry.register("echo", Arc::new(EchoExecutor))?;
    registry.register("sleep", Arc::new(SleepExecutor))?;
    registry.register("webhook", Arc::new(WebhookExecutor::new()?))?;
    Ok(registry)
}

/// Returns the payload unchanged
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, task: &Task) -> ExecutionResult {
        Ok(task.payload.clone())
    }
}

/// Sleeps `payload.ms` milliseconds
pub struct SleepExecutor;

#[async_trait]
impl Executor for SleepExecutor {
    async fn execute(&self, task: &Task) -> ExecutionResult {
        let ms = task
            .payload
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| ExecutionError::fatal("payload.ms must be a non-negative integer"))?;
        if ms > MAX_SLEEP_MS {
            return Err(ExecutionError::fatal(format!(
                "payload.ms {ms} exceeds the maximum of {MAX_SLEEP_MS}"
            )));
        }

        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}

/// POSTs `payload.body` to `payload.url`
pub struct WebhookExecutor {
    client: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

/// Whether a non-success status is worth retrying
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl Executor for WebhookExecutor {
    async fn execute(&self, task: &Task) -> ExecutionResult {
        let url = task
            .payload
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutionError::fatal("payload.url must be a string"))?;
        let body = task.payload.get("body").cloned().unwrap_or(Value::Null);

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    ExecutionError::fatal(format!("invalid webhook request: {e}"))
                } else {
                    ExecutionError::retryable(format!("webhook request failed: {e}"))
                }
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.is_success() {
            let response_body = serde_json::from_str(&text).unwrap_or(Value::String(text));
            return Ok(json!({ "status": status.as_u16(), "body": response_body }));
        }

        let message = format!("webhook returned {status}: {text}");
        if is_retryable_status(status) {
            Err(ExecutionError::retryable(message))
        } else {
            Err(ExecutionError::fatal(message))
        }
    }
}
