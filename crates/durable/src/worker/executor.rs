//! Task executors and the type → executor registry

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::task::{validate_task_type, ExecutionError, Task};

/// Result of running a task
pub type ExecutionResult = Result<serde_json::Value, ExecutionError>;

/// Runs the task-specific work for one task type
///
/// Errors are retryable unless constructed with [`ExecutionError::fatal`].
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, task: &Task) -> ExecutionResult;
}

type BoxedFn =
    Arc<dyn Fn(Task) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send>> + Send + Sync>;

/// Executor backed by an async closure
pub struct FnExecutor {
    f: BoxedFn,
}

#[async_trait]
impl Executor for FnExecutor {
    async fn execute(&self, task: &Task) -> ExecutionResult {
        (self.f)(task.clone()).await
    }
}

/// Wrap an async closure as an executor
///
/// # Example
///
/// ```
/// use claimq_durable::worker::executor_fn;
///
/// let echo = executor_fn(|task| async move { Ok(task.payload) });
/// ```
pub fn executor_fn<F, Fut>(f: F) -> Arc<dyn Executor>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutionResult> + Send + 'static,
{
    let f: BoxedFn = Arc::new(move |task| Box::pin(f(task)));
    Arc::new(FnExecutor { f })
}

/// Registration errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("executor already registered for task type: {0}")]
    Duplicate(String),

    #[error("invalid task type: {0}")]
    InvalidTaskType(String),
}

/// Maps task types to executors
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for a task type
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), RegistrationError> {
        let task_type = task_type.into();
        validate_task_type(&task_type).map_err(RegistrationError::InvalidTaskType)?;
        if self.executors.contains_key(&task_type) {
            return Err(RegistrationError::Duplicate(task_type));
        }
        self.executors.insert(task_type, executor);
        Ok(())
    }

    /// Register an async closure for a task type
    pub fn register_fn<F, Fut>(
        &mut self,
        task_type: impl Into<String>,
        f: F,
    ) -> Result<(), RegistrationError>
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecutionResult> + Send + 'static,
    {
        self.register(task_type, executor_fn(f))
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.executors.contains_key(task_type)
    }

    /// Registered task types, sorted
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}
