//! In-memory persistence backend. Not durable across process restarts;
//! exists for tests and for scenario (P1-P10) conformance checks that don't
//! need to exercise a real file or network round-trip.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::model::{QueueEntry, Task, TaskStatus, Workflow};

use super::{InFlightEntry, PendingState, PersistenceBackend, StoreError, TaskOutcome, WorkflowFilter};

struct Inner {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    tasks: RwLock<HashMap<String, Task>>,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    queued_ids: Mutex<HashSet<String>>,
    in_flight: Mutex<HashMap<String, InFlightEntry>>,
    enqueue_seq: AtomicU64,
}

impl Inner {
    async fn update_task_status(&self, id: &str, status: TaskStatus, ts: chrono::DateTime<Utc>) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(id).ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;
        task.status = status;
        match status {
            TaskStatus::Queued => task.queued_at = Some(ts),
            TaskStatus::Running => task.started_at = Some(ts),
            _ if status.is_terminal() => task.finished_at = Some(ts),
            _ => {}
        }
        Ok(())
    }

    /// Reinsert an entry at the tail of its priority class under a freshly
    /// allocated `enqueue_seq` — a requeued task rejoins the back of the
    /// line rather than keeping its original position.
    async fn requeue_at_tail(&self, mut entry: QueueEntry) {
        let mut queued_ids = self.queued_ids.lock();
        if queued_ids.insert(entry.task_id.clone()) {
            entry.enqueue_seq = self.enqueue_seq.fetch_add(1, AtomicOrdering::SeqCst);
            self.queue.lock().push(entry.clone());
            drop(queued_ids);
            self.update_task_status(&entry.task_id, TaskStatus::Queued, Utc::now()).await.ok();
        }
    }
}

/// `parking_lot::RwLock<HashMap<...>>` per collection, matching the shape of
/// the teacher's in-memory event store but over direct-field task/workflow
/// records instead of an event log.
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                workflows: RwLock::new(HashMap::new()),
                tasks: RwLock::new(HashMap::new()),
                queue: Mutex::new(BinaryHeap::new()),
                queued_ids: Mutex::new(HashSet::new()),
                in_flight: Mutex::new(HashMap::new()),
                enqueue_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Next monotonic sequence number for a fresh enqueue.
    pub fn next_enqueue_seq(&self) -> u64 {
        self.inner.enqueue_seq.fetch_add(1, AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryBackend {
    async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.inner.workflows.write().insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        self.inner
            .workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn list_workflows(&self, filter: WorkflowFilter, limit: usize) -> Result<Vec<Workflow>, StoreError> {
        let mut out: Vec<Workflow> = self
            .inner
            .workflows
            .read()
            .values()
            .filter(|wf| filter.status.map(|s| s == wf.status).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|wf| wf.created_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        self.inner.tasks.write().insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        self.inner
            .tasks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus, ts: chrono::DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.update_task_status(id, status, ts).await
    }

    async fn set_task_result(&self, id: &str, outcome: TaskOutcome, final_status: TaskStatus) -> Result<(), StoreError> {
        {
            let mut tasks = self.inner.tasks.write();
            let task = tasks.get_mut(id).ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;
            match outcome {
                TaskOutcome::Success(value) => task.result = Some(value),
                TaskOutcome::Failure(err) => task.error = Some(err),
            }
            task.status = final_status;
            task.finished_at = Some(Utc::now());
        }
        self.inner.in_flight.lock().remove(id);
        Ok(())
    }

    async fn enqueue(&self, entry: QueueEntry) -> Result<bool, StoreError> {
        {
            let tasks = self.inner.tasks.read();
            if let Some(task) = tasks.get(&entry.task_id) {
                if task.status.is_terminal() {
                    return Err(StoreError::BackendCorrupted(format!(
                        "refusing to enqueue terminal task {}",
                        entry.task_id
                    )));
                }
            }
        }

        let inserted = {
            let mut queued_ids = self.inner.queued_ids.lock();
            queued_ids.insert(entry.task_id.clone())
        };
        if !inserted {
            return Ok(false); // idempotent no-op
        }
        self.inner.queue.lock().push(entry.clone());

        self.inner.update_task_status(&entry.task_id, TaskStatus::Queued, Utc::now()).await?;
        Ok(true)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<String>, StoreError> {
        let entry = {
            let mut queue = self.inner.queue.lock();
            match queue.pop() {
                Some(entry) => entry,
                None => return Ok(None),
            }
        };
        self.inner.queued_ids.lock().remove(&entry.task_id);

        let now = Utc::now();
        self.inner.in_flight.lock().insert(
            entry.task_id.clone(),
            InFlightEntry {
                entry: entry.clone(),
                worker_id: worker_id.to_string(),
                claimed_at: now,
            },
        );

        self.inner.update_task_status(&entry.task_id, TaskStatus::Running, now).await?;
        Ok(Some(entry.task_id))
    }

    async fn ack(&self, task_id: &str) -> Result<(), StoreError> {
        self.inner.in_flight.lock().remove(task_id);
        Ok(())
    }

    async fn nack(&self, task_id: &str, requeue_with_delay: Duration) -> Result<(), StoreError> {
        let entry = self
            .inner
            .in_flight
            .lock()
            .remove(task_id)
            .map(|in_flight| in_flight.entry)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        if requeue_with_delay.is_zero() {
            self.inner.requeue_at_tail(entry).await;
        } else {
            // Fire-and-forget: the delay is a scheduling hint, not something
            // the caller should block on (`nack` returns immediately so the
            // worker can keep draining the queue for other tasks).
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(requeue_with_delay).await;
                inner.requeue_at_tail(entry).await;
            });
        }
        Ok(())
    }

    async fn load_pending(&self) -> Result<PendingState, StoreError> {
        let tasks: Vec<Task> = self
            .inner
            .tasks
            .read()
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Queued | TaskStatus::Running))
            .cloned()
            .collect();
        let queue_entries: Vec<QueueEntry> = self.inner.queue.lock().iter().cloned().collect();
        let in_flight: Vec<InFlightEntry> = self.inner.in_flight.lock().values().cloned().collect();
        Ok(PendingState {
            tasks,
            queue_entries,
            in_flight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, TaskSubmission};

    fn sample_task(id: &str) -> Task {
        Task::from_submission(
            Uuid::nil(),
            TaskSubmission {
                id: id.to_string(),
                method: "llm/generate".into(),
                params: serde_json::json!({}),
                dependencies: vec![],
                priority: Some(Priority::Normal),
                timeout_seconds: None,
                retry: None,
            },
        )
    }

    #[tokio::test]
    async fn put_and_get_workflow_round_trips() {
        let backend = InMemoryBackend::new();
        let wf = Workflow::new("demo", None, Default::default(), vec![]);
        backend.put_workflow(&wf).await.unwrap();
        let fetched = backend.get_workflow(wf.id).await.unwrap();
        assert_eq!(fetched.id, wf.id);
    }

    #[tokio::test]
    async fn missing_workflow_is_not_found() {
        let backend = InMemoryBackend::new();
        let err = backend.get_workflow(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, StoreError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let backend = InMemoryBackend::new();
        let task = sample_task("t1");
        backend.put_task(&task).await.unwrap();

        let entry = QueueEntry::new("t1", Priority::Normal, backend.next_enqueue_seq());
        backend.enqueue(entry.clone()).await.unwrap();
        backend.enqueue(entry).await.unwrap();

        let claimed = backend.claim_next("w1").await.unwrap();
        assert_eq!(claimed, Some("t1".to_string()));
        assert_eq!(backend.claim_next("w1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn claim_next_respects_priority_order() {
        let backend = InMemoryBackend::new();
        for id in ["n1", "n2"] {
            backend.put_task(&sample_task(id)).await.unwrap();
            backend.enqueue(QueueEntry::new(id, Priority::Normal, backend.next_enqueue_seq())).await.unwrap();
        }
        let mut urgent = sample_task("u1");
        urgent.priority = Priority::Urgent;
        backend.put_task(&urgent).await.unwrap();
        backend.enqueue(QueueEntry::new("u1", Priority::Urgent, backend.next_enqueue_seq())).await.unwrap();

        assert_eq!(backend.claim_next("w1").await.unwrap(), Some("u1".to_string()));
        assert_eq!(backend.claim_next("w1").await.unwrap(), Some("n1".to_string()));
        assert_eq!(backend.claim_next("w1").await.unwrap(), Some("n2".to_string()));
    }

    #[tokio::test]
    async fn nack_with_zero_delay_requeues_immediately() {
        let backend = InMemoryBackend::new();
        backend.put_task(&sample_task("t1")).await.unwrap();
        backend.enqueue(QueueEntry::new("t1", Priority::Normal, backend.next_enqueue_seq())).await.unwrap();
        backend.claim_next("w1").await.unwrap();

        backend.nack("t1", Duration::ZERO).await.unwrap();
        assert_eq!(backend.claim_next("w1").await.unwrap(), Some("t1".to_string()));
    }

    #[tokio::test]
    async fn set_task_result_clears_in_flight() {
        let backend = InMemoryBackend::new();
        backend.put_task(&sample_task("t1")).await.unwrap();
        backend.enqueue(QueueEntry::new("t1", Priority::Normal, backend.next_enqueue_seq())).await.unwrap();
        backend.claim_next("w1").await.unwrap();

        backend
            .set_task_result("t1", TaskOutcome::Success(serde_json::json!({"ok": true})), TaskStatus::Completed)
            .await
            .unwrap();

        let task = backend.get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.result.is_some());

        let pending = backend.load_pending().await.unwrap();
        assert!(pending.in_flight.is_empty());
    }

    #[tokio::test]
    async fn load_pending_surfaces_queued_and_running_tasks() {
        let backend = InMemoryBackend::new();
        backend.put_task(&sample_task("t1")).await.unwrap();
        backend.enqueue(QueueEntry::new("t1", Priority::Normal, backend.next_enqueue_seq())).await.unwrap();

        let pending = backend.load_pending().await.unwrap();
        assert_eq!(pending.tasks.len(), 1);
        assert_eq!(pending.queue_entries.len(), 1);
    }
}
