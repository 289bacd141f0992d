//! Behaviour every TaskStore backend must share
//!
//! Each backend test file builds a [`Harness`] and invokes these checks
//! through `store_conformance_tests!`.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use claimq_durable::clock::{Clock, ManualClock};
use claimq_durable::persistence::{Completion, FailureOutcome, StoreError, TaskStore};
use claimq_durable::strategy::{CandidateFilter, ClaimStrategy, WeightedRandom};
use claimq_durable::task::{
    ExecutionError, NewTask, Task, TaskId, TaskStatus, MAX_ATTEMPTS_LIMIT,
};
use claimq_durable::Backoff;
use futures::future::join_all;
use serde_json::json;

/// Retry delay every harness store is built with
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Backoff matching [`RETRY_DELAY`]
pub fn retry_backoff() -> Backoff {
    Backoff::fixed(RETRY_DELAY)
}

pub struct Harness {
    pub store: Arc<dyn TaskStore>,
    pub clock: Arc<ManualClock>,
    _dir: Option<tempfile::TempDir>,
}

impl Harness {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<ManualClock>) -> Self {
        Self {
            store,
            clock,
            _dir: None,
        }
    }

    /// Keep `dir` alive as long as the store uses it
    pub fn with_dir(mut self, dir: tempfile::TempDir) -> Self {
        self._dir = Some(dir);
        self
    }

    async fn enqueue(&self, task: NewTask) -> TaskId {
        self.store.enqueue(task).await.unwrap()
    }

    /// Enqueue with distinct creation times
    async fn enqueue_spaced(&self, tasks: Vec<NewTask>) -> Vec<TaskId> {
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(self.enqueue(task).await);
            self.clock.advance(Duration::from_millis(5));
        }
        ids
    }

    async fn claim(&self, filter: &CandidateFilter, worker: &str) -> Option<TaskId> {
        self.store
            .try_claim(filter, worker)
            .await
            .unwrap()
            .map(|t| t.id)
    }

    async fn drain(&self, filter: &CandidateFilter, worker: &str) -> Vec<TaskId> {
        let mut order = Vec::new();
        while let Some(id) = self.claim(filter, worker).await {
            order.push(id);
        }
        order
    }
}

fn echo(strategy: ClaimStrategy) -> CandidateFilter {
    CandidateFilter::for_type("echo", strategy)
}

fn task(payload: i64) -> NewTask {
    NewTask::new("echo", json!({ "n": payload }))
}

// ============================================
// Claiming
// ============================================

pub async fn claim_is_exclusive(h: Harness) {
    let id = h.enqueue(task(1)).await;

    let claimers = (0..16).map(|i| {
        let store = Arc::clone(&h.store);
        tokio::spawn(async move {
            store
                .try_claim(&echo(ClaimStrategy::Fifo), &format!("w{i}"))
                .await
                .unwrap()
        })
    });

    let winners: Vec<Task> = join_all(claimers)
        .await
        .into_iter()
        .filter_map(|claimed| claimed.unwrap())
        .collect();

    assert_eq!(winners.len(), 1, "exactly one claimer must win");
    let winner = &winners[0];
    assert_eq!(winner.id, id);
    assert_eq!(winner.attempts, 1);

    let stored = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Claimed);
    assert_eq!(stored.claimed_by, winner.claimed_by);
}

pub async fn concurrent_claimers_take_each_task_once(h: Harness, strategy: ClaimStrategy) {
    let mut expected = HashSet::new();
    for n in 0..40 {
        expected.insert(h.enqueue(task(n).with_priority((n % 5) as i32)).await);
    }

    let claimers = (0..8).map(|i| {
        let store = Arc::clone(&h.store);
        let filter = echo(strategy.clone());
        tokio::spawn(async move {
            let worker = format!("w{i}");
            let mut claimed = Vec::new();
            while let Some(task) = store.try_claim(&filter, &worker).await.unwrap() {
                claimed.push(task.id);
            }
            claimed
        })
    });

    let mut seen = HashSet::new();
    for claimed in join_all(claimers).await {
        for id in claimed.unwrap() {
            assert!(seen.insert(id), "task {id} claimed twice");
        }
    }
    assert_eq!(seen, expected);
    assert_eq!(h.store.stats().await.unwrap().claimed, 40);
}

pub async fn fifo_and_lifo_order(h: Harness) {
    let ids = h.enqueue_spaced(vec![task(1), task(2), task(3)]).await;
    let lifo_ids = h
        .enqueue_spaced(vec![
            NewTask::new("other", json!({ "n": 1 })),
            NewTask::new("other", json!({ "n": 2 })),
            NewTask::new("other", json!({ "n": 3 })),
        ])
        .await;

    assert_eq!(h.drain(&echo(ClaimStrategy::Fifo), "w1").await, ids);

    let lifo = CandidateFilter::for_type("other", ClaimStrategy::Lifo);
    let mut reversed = lifo_ids.clone();
    reversed.reverse();
    assert_eq!(h.drain(&lifo, "w1").await, reversed);
}

pub async fn priority_order(h: Harness) {
    let ids = h
        .enqueue_spaced(vec![
            task(1).with_priority(1),
            task(2).with_priority(5),
            task(3).with_priority(3),
            task(4).with_priority(5),
        ])
        .await;

    // Highest priority first, oldest first among equals.
    assert_eq!(
        h.drain(&echo(ClaimStrategy::Priority), "w1").await,
        vec![ids[1], ids[3], ids[2], ids[0]]
    );
}

pub async fn weighted_random_claims_everything(h: Harness) {
    let mut expected = HashSet::new();
    for n in 0..12 {
        expected.insert(h.enqueue(task(n).with_priority(n as i32)).await);
    }

    let strategy = ClaimStrategy::WeightedRandom(WeightedRandom::default().with_top_k(4));
    let claimed: HashSet<TaskId> = h.drain(&echo(strategy), "w1").await.into_iter().collect();
    assert_eq!(claimed, expected);
}

pub async fn type_filter(h: Harness) {
    let echo_id = h.enqueue(task(1)).await;
    let sleep_id = h.enqueue(NewTask::new("sleep", json!({"ms": 1}))).await;

    assert_eq!(
        h.claim(&CandidateFilter::for_type("sleep", ClaimStrategy::Fifo), "w1")
            .await,
        Some(sleep_id)
    );
    assert_eq!(
        h.claim(&CandidateFilter::for_type("sleep", ClaimStrategy::Fifo), "w1")
            .await,
        None
    );

    // An empty type list accepts every type.
    assert_eq!(
        h.claim(&CandidateFilter::new(ClaimStrategy::Fifo), "w1").await,
        Some(echo_id)
    );
}

// ============================================
// Completion and Failure
// ============================================

pub async fn complete_is_idempotent_for_holder(h: Harness) {
    let id = h.enqueue(task(1)).await;
    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();

    assert_eq!(
        h.store.complete(id, "w2", json!("stolen")).await.unwrap(),
        Completion::OwnershipLost
    );
    assert_eq!(
        h.store.complete(id, "w1", json!({"ok": true})).await.unwrap(),
        Completion::Completed
    );
    assert_eq!(
        h.store.complete(id, "w1", json!({"ok": true})).await.unwrap(),
        Completion::AlreadyCompleted
    );

    let task = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!({"ok": true})));
    assert!(!h.store.heartbeat(id, "w1").await.unwrap());
}

pub async fn retryable_failure_waits_for_backoff(h: Harness) {
    let id = h.enqueue(task(1)).await;
    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();

    let outcome = h
        .store
        .fail(id, "w1", &ExecutionError::retryable("connection reset"))
        .await
        .unwrap();
    let FailureOutcome::Requeued { attempts, retry_at } = outcome else {
        panic!("expected requeue, got {outcome:?}");
    };
    assert_eq!(attempts, 1);
    assert_eq!(retry_at, h.clock.now() + chrono::Duration::seconds(10));

    let task = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.claimed_by, None);
    assert_eq!(task.error.as_deref(), Some("connection reset"));

    assert_eq!(h.claim(&echo(ClaimStrategy::Fifo), "w2").await, None);
    h.clock.advance(RETRY_DELAY);
    let retried = h
        .store
        .try_claim(&echo(ClaimStrategy::Fifo), "w2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.id, id);
    assert_eq!(retried.attempts, 2);
}

pub async fn attempts_ceiling(h: Harness) {
    let id = h.enqueue(task(1).with_max_attempts(2)).await;
    let error = ExecutionError::retryable("flaky");

    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();
    assert!(matches!(
        h.store.fail(id, "w1", &error).await.unwrap(),
        FailureOutcome::Requeued { attempts: 1, .. }
    ));

    h.clock.advance(RETRY_DELAY);
    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();
    assert_eq!(
        h.store.fail(id, "w1", &error).await.unwrap(),
        FailureOutcome::Failed { attempts: 2 }
    );

    h.clock.advance(RETRY_DELAY * 10);
    assert_eq!(h.claim(&echo(ClaimStrategy::Fifo), "w1").await, None);

    let task = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 2);
}

pub async fn fatal_failure_is_terminal(h: Harness) {
    let id = h.enqueue(task(1).with_max_attempts(5)).await;
    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();

    assert_eq!(
        h.store
            .fail(id, "w1", &ExecutionError::fatal("malformed payload"))
            .await
            .unwrap(),
        FailureOutcome::Failed { attempts: 1 }
    );
    assert_eq!(
        h.store
            .fail(id, "w1", &ExecutionError::fatal("again"))
            .await
            .unwrap(),
        FailureOutcome::OwnershipLost
    );
    assert_eq!(
        h.store.get(id).await.unwrap().unwrap().status,
        TaskStatus::Failed
    );
}

pub async fn missing_task_is_not_found(h: Harness) {
    let missing = TaskId(999_999);
    assert!(matches!(
        h.store.heartbeat(missing, "w1").await,
        Err(StoreError::TaskNotFound(_))
    ));
    assert!(matches!(
        h.store.complete(missing, "w1", json!(null)).await,
        Err(StoreError::TaskNotFound(_))
    ));
    assert!(matches!(
        h.store
            .fail(missing, "w1", &ExecutionError::retryable("x"))
            .await,
        Err(StoreError::TaskNotFound(_))
    ));
    assert!(h.store.get(missing).await.unwrap().is_none());
}

// ============================================
// Heartbeats and Reaping
// ============================================

pub async fn heartbeat_keeps_claim_alive(h: Harness) {
    let id = h.enqueue(task(1)).await;
    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();

    assert!(!h.store.heartbeat(id, "w2").await.unwrap());

    h.clock.advance(Duration::from_secs(50));
    assert!(h.store.heartbeat(id, "w1").await.unwrap());
    h.clock.advance(Duration::from_secs(50));

    assert!(h
        .store
        .reap_stale(Duration::from_secs(60))
        .await
        .unwrap()
        .is_empty());
}

pub async fn reaper_requeues_crashed_claim(h: Harness) {
    let id = h.enqueue(task(1)).await;
    h.claim(&echo(ClaimStrategy::Fifo), "crashed").await.unwrap();

    h.clock.advance(Duration::from_secs(61));
    let outcome = h.store.reap_stale(Duration::from_secs(60)).await.unwrap();
    assert_eq!(outcome.requeued, vec![id]);
    assert!(outcome.failed.is_empty());

    let task = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.error.unwrap().contains("crashed"));

    // The old holder has lost the claim for good.
    assert!(!h.store.heartbeat(id, "crashed").await.unwrap());
    let next = h
        .store
        .try_claim(&echo(ClaimStrategy::Fifo), "w2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.attempts, 2);
    assert_eq!(
        h.store.complete(id, "crashed", json!(null)).await.unwrap(),
        Completion::OwnershipLost
    );
    assert_eq!(
        h.store.complete(id, "w2", json!(null)).await.unwrap(),
        Completion::Completed
    );

    // A second sweep finds nothing.
    assert!(h
        .store
        .reap_stale(Duration::from_secs(60))
        .await
        .unwrap()
        .is_empty());
}

pub async fn reaper_fails_exhausted_claim(h: Harness) {
    let id = h.enqueue(task(1).with_max_attempts(1)).await;
    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();

    h.clock.advance(Duration::from_secs(120));
    let outcome = h.store.reap_stale(Duration::from_secs(60)).await.unwrap();
    assert_eq!(outcome.failed, vec![id]);
    assert!(outcome.requeued.is_empty());
    assert_eq!(
        h.store.get(id).await.unwrap().unwrap().status,
        TaskStatus::Failed
    );
}

// ============================================
// Dedup, Validation, Stats, Settings
// ============================================

pub async fn dedup_key_returns_active_task(h: Harness) {
    let first = h.enqueue(task(1).with_dedup_key("order-7")).await;
    let again = h.enqueue(task(2).with_dedup_key("order-7")).await;
    assert_eq!(first, again);
    assert_eq!(h.store.stats().await.unwrap().pending, 1);

    // Still deduplicated while claimed.
    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();
    assert_eq!(h.enqueue(task(3).with_dedup_key("order-7")).await, first);

    h.store.complete(first, "w1", json!(null)).await.unwrap();
    let fresh = h.enqueue(task(4).with_dedup_key("order-7")).await;
    assert_ne!(fresh, first);
}

pub async fn dedup_key_released_after_terminal_failure(h: Harness) {
    let first = h.enqueue(task(1).with_dedup_key("invoice-9")).await;
    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();
    let outcome = h
        .store
        .fail(first, "w1", &ExecutionError::fatal("bad invoice"))
        .await
        .unwrap();
    assert_eq!(outcome, FailureOutcome::Failed { attempts: 1 });

    let fresh = h.enqueue(task(2).with_dedup_key("invoice-9")).await;
    assert_ne!(fresh, first);
    assert_eq!(
        h.store.get(fresh).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
    // A second enqueue is deduplicated against the new active task.
    assert_eq!(h.enqueue(task(3).with_dedup_key("invoice-9")).await, fresh);
}

pub async fn enqueue_validates(h: Harness) {
    for bad in [
        NewTask::new("", json!({})),
        NewTask::new("echo", json!({})).with_max_attempts(0),
        NewTask::new("echo", json!({})).with_max_attempts(MAX_ATTEMPTS_LIMIT + 1),
        NewTask::new("echo", json!({})).with_max_attempts(u32::MAX),
    ] {
        assert!(matches!(
            h.store.enqueue(bad).await,
            Err(StoreError::Validation(_))
        ));
    }
    assert_eq!(h.store.stats().await.unwrap().total(), 0);
}

pub async fn max_attempts_at_limit_retries(h: Harness) {
    let id = h
        .enqueue(task(1).with_max_attempts(MAX_ATTEMPTS_LIMIT))
        .await;
    assert_eq!(
        h.store.get(id).await.unwrap().unwrap().max_attempts,
        MAX_ATTEMPTS_LIMIT
    );

    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();
    let outcome = h
        .store
        .fail(id, "w1", &ExecutionError::retryable("try again"))
        .await
        .unwrap();
    assert!(matches!(outcome, FailureOutcome::Requeued { attempts: 1, .. }));

    // Still requeued by the reaper rather than failed as exhausted.
    h.clock.advance(RETRY_DELAY);
    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();
    h.clock.advance(Duration::from_secs(120));
    let reaped = h.store.reap_stale(Duration::from_secs(60)).await.unwrap();
    assert_eq!(reaped.requeued, vec![id]);
    assert!(reaped.failed.is_empty());
}

pub async fn stats_and_settings(h: Harness) {
    let a = h.enqueue(task(1)).await;
    let b = h.enqueue(task(2)).await;
    h.enqueue(task(3)).await;

    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();
    h.claim(&echo(ClaimStrategy::Fifo), "w1").await.unwrap();
    h.store.complete(a, "w1", json!(null)).await.unwrap();
    h.store
        .fail(b, "w1", &ExecutionError::fatal("nope"))
        .await
        .unwrap();

    let stats = h.store.stats().await.unwrap();
    assert_eq!(
        (stats.pending, stats.claimed, stats.completed, stats.failed),
        (1, 0, 1, 1)
    );

    assert_eq!(h.store.get_setting("queue").await.unwrap(), None);
    h.store
        .put_setting("queue", json!({"strategy": "lifo"}))
        .await
        .unwrap();
    h.store
        .put_setting("queue", json!({"strategy": "priority"}))
        .await
        .unwrap();
    assert_eq!(
        h.store.get_setting("queue").await.unwrap(),
        Some(json!({"strategy": "priority"}))
    );
}

/// Generate one `#[tokio::test]` per conformance check
///
/// `$make` is an async fn returning a fresh [`Harness`], or `None` to skip.
macro_rules! store_conformance_tests {
    ($make:path) => {
        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn claim_is_exclusive() {
            if let Some(h) = $make().await {
                common::claim_is_exclusive(h).await;
            }
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn concurrent_claimers_fifo() {
            if let Some(h) = $make().await {
                common::concurrent_claimers_take_each_task_once(
                    h,
                    claimq_durable::ClaimStrategy::Fifo,
                )
                .await;
            }
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn concurrent_claimers_weighted() {
            if let Some(h) = $make().await {
                common::concurrent_claimers_take_each_task_once(
                    h,
                    claimq_durable::ClaimStrategy::weighted(),
                )
                .await;
            }
        }

        #[tokio::test]
        async fn fifo_and_lifo_order() {
            if let Some(h) = $make().await {
                common::fifo_and_lifo_order(h).await;
            }
        }

        #[tokio::test]
        async fn priority_order() {
            if let Some(h) = $make().await {
                common::priority_order(h).await;
            }
        }

        #[tokio::test]
        async fn weighted_random_claims_everything() {
            if let Some(h) = $make().await {
                common::weighted_random_claims_everything(h).await;
            }
        }

        #[tokio::test]
        async fn type_filter() {
            if let Some(h) = $make().await {
                common::type_filter(h).await;
            }
        }

        #[tokio::test]
        async fn complete_is_idempotent_for_holder() {
            if let Some(h) = $make().await {
                common::complete_is_idempotent_for_holder(h).await;
            }
        }

        #[tokio::test]
        async fn retryable_failure_waits_for_backoff() {
            if let Some(h) = $make().await {
                common::retryable_failure_waits_for_backoff(h).await;
            }
        }

        #[tokio::test]
        async fn attempts_ceiling() {
            if let Some(h) = $make().await {
                common::attempts_ceiling(h).await;
            }
        }

        #[tokio::test]
        async fn fatal_failure_is_terminal() {
            if let Some(h) = $make().await {
                common::fatal_failure_is_terminal(h).await;
            }
        }

        #[tokio::test]
        async fn missing_task_is_not_found() {
            if let Some(h) = $make().await {
                common::missing_task_is_not_found(h).await;
            }
        }

        #[tokio::test]
        async fn heartbeat_keeps_claim_alive() {
            if let Some(h) = $make().await {
                common::heartbeat_keeps_claim_alive(h).await;
            }
        }

        #[tokio::test]
        async fn reaper_requeues_crashed_claim() {
            if let Some(h) = $make().await {
                common::reaper_requeues_crashed_claim(h).await;
            }
        }

        #[tokio::test]
        async fn reaper_fails_exhausted_claim() {
            if let Some(h) = $make().await {
                common::reaper_fails_exhausted_claim(h).await;
            }
        }

        #[tokio::test]
        async fn dedup_key_returns_active_task() {
            if let Some(h) = $make().await {
                common::dedup_key_returns_active_task(h).await;
            }
        }

        #[tokio::test]
        async fn dedup_key_released_after_terminal_failure() {
            if let Some(h) = $make().await {
                common::dedup_key_released_after_terminal_failure(h).await;
            }
        }

        #[tokio::test]
        async fn max_attempts_at_limit_retries() {
            if let Some(h) = $make().await {
                common::max_attempts_at_limit_retries(h).await;
            }
        }

        #[tokio::test]
        async fn enqueue_validates() {
            if let Some(h) = $make().await {
                common::enqueue_validates(h).await;
            }
        }

        #[tokio::test]
        async fn stats_and_settings() {
            if let Some(h) = $make().await {
                common::stats_and_settings(h).await;
            }
        }
    };
}
