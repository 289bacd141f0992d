//! HTTP client for an external task registry

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::task::{Task, TaskId};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("not found")]
    NotFound,
}

/// Task as announced to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredTask {
    pub id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
}

impl From<&Task> for RegisteredTask {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            priority: task.priority,
        }
    }
}

/// External coordination service mirroring queue activity
#[async_trait]
pub trait TaskRegistry: Send + Sync + 'static {
    async fn register_type(&self, task_type: &str) -> Result<(), RegistryError>;

    async fn create_task(&self, task: &RegisteredTask) -> Result<(), RegistryError>;

    async fn claim_task(&self, task_id: TaskId, worker_id: &str) -> Result<(), RegistryError>;

    async fn complete_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        result: &serde_json::Value,
    ) -> Result<(), RegistryError>;
}

/// [`TaskRegistry`] over HTTP/JSON
///
/// - `POST /task-types` `{"name"}`
/// - `POST /tasks` `{"id", "task_type", "payload", "priority"}`
/// - `POST /tasks/{id}/claim` `{"worker_id"}`
/// - `POST /tasks/{id}/complete` `{"worker_id", "result"}`
pub struct HttpTaskRegistry {
    base_url: String,
    http: reqwest::Client,
}

impl HttpTaskRegistry {
    pub fn new(base_url: &str) -> Result<Self, RegistryError> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), RegistryError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).json(body).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound);
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RegistryError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl TaskRegistry for HttpTaskRegistry {
    async fn register_type(&self, task_type: &str) -> Result<(), RegistryError> {
        self.post("/task-types", &json!({ "name": task_type })).await
    }

    async fn create_task(&self, task: &RegisteredTask) -> Result<(), RegistryError> {
        self.post("/tasks", task).await
    }

    async fn claim_task(&self, task_id: TaskId, worker_id: &str) -> Result<(), RegistryError> {
        self.post(
            &format!("/tasks/{task_id}/claim"),
            &json!({ "worker_id": worker_id }),
        )
        .await
    }

    async fn complete_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        result: &serde_json::Value,
    ) -> Result<(), RegistryError> {
        self.post(
            &format!("/tasks/{task_id}/complete"),
            &json!({ "worker_id": worker_id, "result": result }),
        )
        .await
    }
}
