// Status command

use anyhow::{Context, Result};
use claimq_durable::task::TaskId;

use super::open_store;
use crate::output::{print_stats, print_task, OutputFormat};

pub async fn run(database_url: &str, output: OutputFormat, task: Option<i64>) -> Result<()> {
    let store = open_store(database_url).await?;

    match task {
        Some(id) => {
            let task = store
                .get(TaskId(id))
                .await
                .context("Failed to fetch task")?
                .with_context(|| format!("Task {id} not found"))?;
            if output.is_text() {
                print_task(&task);
                return Ok(());
            }
            output.print_value(&task)
        }
        None => {
            let stats = store.stats().await.context("Failed to read queue stats")?;
            if output.is_text() {
                print_stats(&stats);
                return Ok(());
            }
            output.print_value(&stats)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_task() {
        let err = run("memory:", OutputFormat::Json, Some(7)).await.unwrap_err();
        assert_eq!(err.to_string(), "Task 7 not found");
    }

    #[tokio::test]
    async fn test_stats_on_empty_queue() {
        run("memory:", OutputFormat::Yaml, None).await.unwrap();
    }
}
