// Enqueue command

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use claimq_durable::persistence::TaskStore;
use claimq_durable::remote::MirroredTaskStore;
use claimq_durable::task::{NewTask, TaskId};
use serde::Serialize;
use serde_json::Value;

use super::{flush_reporter, open_store, spawn_reporter};
use crate::output::{print_field, OutputFormat};

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// Task type
    #[arg(long)]
    pub task_type: String,

    /// JSON payload (object or array)
    #[arg(long, default_value = "{}")]
    pub payload: String,

    /// Higher runs first under the priority and weighted strategies
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub priority: i32,

    /// Return the existing task instead of adding a duplicate while one is active
    #[arg(long)]
    pub dedup_key: Option<String>,

    /// Executions before the task is failed for good
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Base URL of a remote task registry to announce the task to
    #[arg(long, env = "CLAIMQ_REGISTRY_URL")]
    pub registry_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct Enqueued {
    task_id: TaskId,
}

pub async fn run(args: EnqueueArgs, database_url: &str, output: OutputFormat) -> Result<()> {
    let mut store = open_store(database_url).await?;
    let mut forwarder = None;
    if let Some(url) = &args.registry_url {
        let (reporter, handle) = spawn_reporter(url)?;
        store = Arc::new(MirroredTaskStore::new(store, reporter));
        forwarder = Some(handle);
    }

    let enqueued = enqueue(store.as_ref(), args).await;
    drop(store);
    if let Some(handle) = forwarder {
        flush_reporter(handle).await;
    }
    let task_id = enqueued?;

    if output.is_text() {
        print_field("Task ID", &task_id.to_string());
        return Ok(());
    }
    output.print_value(&Enqueued { task_id })
}

fn build_task(args: EnqueueArgs) -> Result<NewTask> {
    let payload: Value =
        serde_json::from_str(&args.payload).context("--payload is not valid JSON")?;

    let mut task = NewTask::new(args.task_type, payload).with_priority(args.priority);
    if let Some(key) = args.dedup_key {
        task = task.with_dedup_key(key);
    }
    if let Some(max) = args.max_attempts {
        task = task.with_max_attempts(max);
    }
    Ok(task)
}

async fn enqueue(store: &dyn TaskStore, args: EnqueueArgs) -> Result<TaskId> {
    let task = build_task(args)?;
    let task_type = task.task_type.clone();
    let task_id = store
        .enqueue(task)
        .await
        .context("Failed to enqueue task")?;

    tracing::info!(task_id = %task_id, task_type = %task_type, "Task enqueued");
    Ok(task_id)
}
