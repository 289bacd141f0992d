//! Builds workers for registered task types

use std::sync::Arc;

use tracing::debug;

use super::config::WorkerConfig;
use super::executor::ExecutorRegistry;
use super::worker::{Worker, WorkerError};
use crate::config::ConfigError;
use crate::persistence::TaskStore;
use crate::remote::RemoteReporter;

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("no executor registered for task type '{task_type}' (known: {})", known.join(", "))]
    UnknownTaskType {
        task_type: String,
        known: Vec<String>,
    },

    #[error("invalid worker configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl From<WorkerError> for FactoryError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::Config(e) => Self::InvalidConfig(e),
            other => Self::InvalidConfig(ConfigError::invalid("worker", other.to_string())),
        }
    }
}

/// Creates a [`Worker`] for a task type from a shared executor registry
#[derive(Clone)]
pub struct WorkerFactory {
    store: Arc<dyn TaskStore>,
    registry: Arc<ExecutorRegistry>,
    reporter: Option<RemoteReporter>,
}

impl WorkerFactory {
    pub fn new(store: Arc<dyn TaskStore>, registry: ExecutorRegistry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            reporter: None,
        }
    }

    pub fn with_reporter(mut self, reporter: RemoteReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Build a worker; the task type must have a registered executor
    pub fn build(&self, task_type: &str, config: WorkerConfig) -> Result<Worker, FactoryError> {
        let executor = self
            .registry
            .get(task_type)
            .ok_or_else(|| FactoryError::UnknownTaskType {
                task_type: task_type.to_string(),
                known: self.registry.task_types(),
            })?;

        let mut worker = Worker::new(Arc::clone(&self.store), task_type, executor, config)?;
        if let Some(reporter) = &self.reporter {
            reporter.type_registered(task_type);
            worker = worker.with_reporter(reporter.clone());
        }

        debug!(task_type, worker_id = worker.worker_id(), "Built worker");
        Ok(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryTaskStore;
    use serde_json::json;

    fn factory() -> WorkerFactory {
        let mut registry = ExecutorRegistry::new();
        registry
            .register_fn("echo", |task| async move { Ok(task.payload) })
            .unwrap();
        registry
            .register_fn("sleep", |_| async { Ok(json!(null)) })
            .unwrap();
        WorkerFactory::new(Arc::new(InMemoryTaskStore::new()), registry)
    }

    #[test]
    fn test_build_known_type() {
        let worker = factory()
            .build("echo", WorkerConfig::new().with_worker_id("w1"))
            .unwrap();
        assert_eq!(worker.task_type(), "echo");
        assert_eq!(worker.worker_id(), "w1");
    }

    #[test]
    fn test_unknown_type_lists_known() {
        let err = factory()
            .build("webhook", WorkerConfig::new())
            .err()
            .unwrap();
        assert!(matches!(err, FactoryError::UnknownTaskType { .. }));
        assert_eq!(
            err.to_string(),
            "no executor registered for task type 'webhook' (known: echo, sleep)"
        );
    }

    #[test]
    fn test_invalid_config() {
        let err = factory()
            .build("echo", WorkerConfig::new().with_worker_id(""))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            FactoryError::InvalidConfig(ConfigError::EmptyWorkerId)
        ));
    }
}
