//! Task Queue (C4): priority-ordered claim/ack/nack semantics layered over a
//! [`PersistenceBackend`], plus an optional soft-cap backpressure gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::engine::backpressure::{BackpressureConfig, BackpressureState};
use crate::model::{Priority, QueueEntry};
use crate::persistence::{PersistenceBackend, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is at capacity")]
    QueueFull,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration for [`TaskQueue`]'s backpressure gate.
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// `None` disables backpressure entirely (unbounded queue).
    pub soft_cap: Option<usize>,
    pub backpressure: BackpressureConfig,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            soft_cap: None,
            backpressure: BackpressureConfig::default(),
        }
    }
}

/// The priority queue as seen by the resolver (enqueue) and the worker pool
/// (claim/ack/nack), backed by any [`PersistenceBackend`].
pub struct TaskQueue {
    backend: Arc<dyn PersistenceBackend>,
    next_enqueue_seq: AtomicU64,
    backpressure: Option<Arc<BackpressureState>>,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn PersistenceBackend>, config: TaskQueueConfig) -> Self {
        Self {
            backend,
            next_enqueue_seq: AtomicU64::new(0),
            backpressure: config.soft_cap.map(|cap| Arc::new(BackpressureState::new(config.backpressure, cap))),
        }
    }

    /// Rebuild `next_enqueue_seq` and the backpressure counter from durable
    /// state. Call once at kernel start, after `load_pending`.
    pub fn resume_from(&self, max_observed_seq: u64, pending_depth: usize) {
        self.next_enqueue_seq.store(max_observed_seq + 1, Ordering::SeqCst);
        if let Some(bp) = &self.backpressure {
            for _ in 0..pending_depth {
                bp.task_enqueued();
            }
        }
    }

    /// Insert `task_id` at the tail of `priority`'s class. Idempotent; a
    /// no-op if the task is already queued. Rejects with `QueueFull` if a
    /// soft cap is configured and currently exceeded.
    #[instrument(skip(self))]
    pub async fn enqueue(&self, task_id: &str, priority: Priority) -> Result<(), QueueError> {
        if let Some(bp) = &self.backpressure {
            if !bp.should_accept() {
                return Err(QueueError::QueueFull);
            }
        }
        let seq = self.next_enqueue_seq.fetch_add(1, Ordering::SeqCst);
        let inserted = self.backend.enqueue(QueueEntry::new(task_id, priority, seq)).await?;
        if inserted {
            if let Some(bp) = &self.backpressure {
                bp.task_enqueued();
            }
        }
        debug!(task_id, seq, inserted, "enqueued");
        Ok(())
    }

    /// Atomically claim the queue head on behalf of `worker_id`.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<String>, QueueError> {
        let claimed = self.backend.claim_next(worker_id).await?;
        if claimed.is_some() {
            if let Some(bp) = &self.backpressure {
                bp.task_dequeued();
            }
        }
        Ok(claimed)
    }

    pub async fn ack(&self, task_id: &str) -> Result<(), QueueError> {
        Ok(self.backend.ack(task_id).await?)
    }

    /// Requeue with a delay (used for retry backoff); `delay == ZERO` is
    /// used for saturated-provider nacks that should re-enter immediately.
    pub async fn nack(&self, task_id: &str, delay: Duration) -> Result<(), QueueError> {
        self.backend.nack(task_id, delay).await?;
        if let Some(bp) = &self.backpressure {
            bp.task_enqueued();
        }
        Ok(())
    }

    pub fn queue_depth(&self) -> Option<usize> {
        self.backpressure.as_ref().map(|bp| bp.queue_depth())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Task, TaskSubmission};
    use crate::persistence::memory::InMemoryBackend;
    use uuid::Uuid;

    async fn seeded_queue() -> (TaskQueue, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        for id in ["t1", "t2"] {
            let task = Task::from_submission(
                Uuid::nil(),
                TaskSubmission {
                    id: id.to_string(),
                    method: "llm/generate".into(),
                    params: serde_json::json!({}),
                    dependencies: vec![],
                    priority: None,
                    timeout_seconds: None,
                    retry: None,
                },
            );
            backend.put_task(&task).await.unwrap();
        }
        let queue = TaskQueue::new(backend.clone(), TaskQueueConfig::default());
        (queue, backend)
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let (queue, _backend) = seeded_queue().await;
        queue.enqueue("t1", Priority::Normal).await.unwrap();
        queue.enqueue("t1", Priority::Normal).await.unwrap();

        let first = queue.claim_next("w1").await.unwrap();
        assert_eq!(first, Some("t1".to_string()));
        let second = queue.claim_next("w1").await.unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn backpressure_rejects_past_soft_cap() {
        let (_queue, backend) = seeded_queue().await;
        let queue = TaskQueue::new(
            backend,
            TaskQueueConfig {
                soft_cap: Some(1),
                backpressure: BackpressureConfig::new().with_high_watermark(0.99).with_low_watermark(0.5),
            },
        );
        queue.enqueue("t1", Priority::Normal).await.unwrap();
        let err = queue.enqueue("t2", Priority::Normal).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueFull));
    }
}
