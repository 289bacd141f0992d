//! Fire-and-forget forwarding of queue events to a [`TaskRegistry`]
//!
//! Events go through a bounded channel to one background task. A full
//! channel drops the event, and a failing registry is logged and skipped.
//! The local queue never waits on the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::registry::{RegisteredTask, RegistryError, TaskRegistry};
use crate::task::{Task, TaskId};

/// Default channel capacity
pub const DEFAULT_REPORTER_CAPACITY: usize = 1024;

/// Queue event mirrored to the registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    TypeRegistered {
        task_type: String,
    },
    TaskCreated(RegisteredTask),
    TaskClaimed {
        task_id: TaskId,
        worker_id: String,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: String,
        result: serde_json::Value,
    },
}

impl RegistryEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::TypeRegistered { .. } => "type_registered",
            Self::TaskCreated(_) => "task_created",
            Self::TaskClaimed { .. } => "task_claimed",
            Self::TaskCompleted { .. } => "task_completed",
        }
    }

    async fn forward(&self, registry: &dyn TaskRegistry) -> Result<(), RegistryError> {
        match self {
            Self::TypeRegistered { task_type } => registry.register_type(task_type).await,
            Self::TaskCreated(task) => registry.create_task(task).await,
            Self::TaskClaimed { task_id, worker_id } => {
                registry.claim_task(*task_id, worker_id).await
            }
            Self::TaskCompleted {
                task_id,
                worker_id,
                result,
            } => registry.complete_task(*task_id, worker_id, result).await,
        }
    }
}

/// Forwarding counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReporterStats {
    pub forwarded: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Cloneable handle for submitting registry events
#[derive(Clone)]
pub struct RemoteReporter {
    tx: mpsc::Sender<RegistryEvent>,
    counters: Arc<Counters>,
}

impl RemoteReporter {
    /// Start the forwarding task
    ///
    /// The task ends once every handle has been dropped and the channel is
    /// drained; await the returned handle to flush.
    pub fn spawn(registry: Arc<dyn TaskRegistry>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RegistryEvent>(capacity.max(1));
        let counters = Arc::new(Counters::default());

        let task_counters = Arc::clone(&counters);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event.forward(registry.as_ref()).await {
                    Ok(()) => {
                        task_counters.forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        task_counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(event = event.kind(), error = %e, "registry call failed, dropping event");
                    }
                }
            }
            debug!("registry forwarder exited");
        });

        (Self { tx, counters }, handle)
    }

    /// Queue an event without waiting
    pub fn report(&self, event: RegistryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = event.kind(), "registry channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(event = event.kind(), "registry forwarder stopped, dropping event");
            }
        }
    }

    pub fn type_registered(&self, task_type: &str) {
        self.report(RegistryEvent::TypeRegistered {
            task_type: task_type.to_string(),
        });
    }

    pub fn task_created(&self, task: &Task) {
        self.report(RegistryEvent::TaskCreated(task.into()));
    }

    pub fn task_claimed(&self, task_id: TaskId, worker_id: &str) {
        self.report(RegistryEvent::TaskClaimed {
            task_id,
            worker_id: worker_id.to_string(),
        });
    }

    pub fn task_completed(&self, task_id: TaskId, worker_id: &str, result: &serde_json::Value) {
        self.report(RegistryEvent::TaskCompleted {
            task_id,
            worker_id: worker_id.to_string(),
            result: result.clone(),
        });
    }

    pub fn stats(&self) -> ReporterStats {
        ReporterStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingRegistry {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl TaskRegistry for RecordingRegistry {
        async fn register_type(&self, task_type: &str) -> Result<(), RegistryError> {
            self.calls.lock().push(format!("type:{task_type}"));
            if self.fail {
                return Err(RegistryError::NotFound);
            }
            Ok(())
        }

        async fn create_task(&self, task: &RegisteredTask) -> Result<(), RegistryError> {
            self.calls.lock().push(format!("create:{}", task.id));
            Ok(())
        }

        async fn claim_task(&self, task_id: TaskId, worker_id: &str) -> Result<(), RegistryError> {
            self.calls.lock().push(format!("claim:{task_id}:{worker_id}"));
            Ok(())
        }

        async fn complete_task(
            &self,
            task_id: TaskId,
            worker_id: &str,
            _result: &serde_json::Value,
        ) -> Result<(), RegistryError> {
            self.calls.lock().push(format!("complete:{task_id}:{worker_id}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_forwarded_in_order() {
        let registry = Arc::new(RecordingRegistry::default());
        let (reporter, handle) = RemoteReporter::spawn(registry.clone(), 16);

        reporter.type_registered("echo");
        reporter.task_claimed(TaskId(1), "w1");
        reporter.task_completed(TaskId(1), "w1", &serde_json::json!({}));

        // Dropping the last sender lets the forwarder drain and exit.
        drop(reporter);
        handle.await.unwrap();

        assert_eq!(
            *registry.calls.lock(),
            vec!["type:echo", "claim:1:w1", "complete:1:w1"]
        );
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_propagated() {
        let registry = Arc::new(RecordingRegistry {
            fail: true,
            ..Default::default()
        });
        let (reporter, handle) = RemoteReporter::spawn(registry, 4);
        reporter.type_registered("echo");
        reporter.type_registered("sleep");

        let observer = reporter.clone();
        drop(reporter);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while observer.stats().failed < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        drop(observer);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_channel_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let reporter = RemoteReporter {
            tx,
            counters: Arc::new(Counters::default()),
        };

        reporter.type_registered("a");
        reporter.type_registered("b");
        assert_eq!(reporter.stats().dropped, 1);
    }
}
