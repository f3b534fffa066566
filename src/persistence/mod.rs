//! Persistence Backend (C1): durable storage for workflows, tasks, task
//! results, and queue membership.
//!
//! Three interchangeable implementations live behind the [`PersistenceBackend`]
//! trait: [`memory::InMemoryBackend`] (tests only), [`sql::SqlBackend`]
//! (embedded, file-backed SQLite — recommended for single-node deployments),
//! and [`kv::KvBackend`] (a remote key-value store, for sharing state across
//! restarts of the same owning process). The trait is described purely in
//! terms of workflows, tasks, and queue entries; no SQL or key-value
//! vocabulary leaks through it.

pub mod kv;
pub mod memory;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{QueueEntry, Task, TaskError, TaskStatus, Workflow, WorkflowStatus};

/// Errors a persistence backend can return.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend corrupted: {0}")]
    BackendCorrupted(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the operation against the same backend might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::BackendUnavailable(_))
    }
}

/// The outcome of a finished task invocation, to be written exactly once.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success(serde_json::Value),
    Failure(TaskError),
}

/// Filter applied by [`PersistenceBackend::list_workflows`].
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
}

/// An entry that has been claimed but not yet acked or nacked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightEntry {
    pub entry: QueueEntry,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// Snapshot used to rebuild in-memory structures after a restart.
#[derive(Debug, Clone, Default)]
pub struct PendingState {
    /// Every task whose status is `queued` or `running`.
    pub tasks: Vec<Task>,
    /// Every entry currently waiting to be claimed.
    pub queue_entries: Vec<QueueEntry>,
    /// Every entry claimed but not yet acked/nacked.
    pub in_flight: Vec<InFlightEntry>,
}

/// Durable storage for workflows, tasks, task results, and queue membership.
///
/// All operations are atomic at the operation level: `enqueue` and the
/// paired `put_task(status = queued)` write in one transaction;
/// `claim_next` atomically moves an entry from available to in-flight and
/// flips the task to `running`; `set_task_result` clears the in-flight
/// record and writes the immutable result in one transaction.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;
    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError>;
    async fn list_workflows(&self, filter: WorkflowFilter, limit: usize) -> Result<Vec<Workflow>, StoreError>;

    async fn put_task(&self, task: &Task) -> Result<(), StoreError>;
    async fn get_task(&self, id: &str) -> Result<Task, StoreError>;
    async fn update_task_status(&self, id: &str, status: TaskStatus, ts: DateTime<Utc>) -> Result<(), StoreError>;
    async fn set_task_result(&self, id: &str, outcome: TaskOutcome, final_status: TaskStatus) -> Result<(), StoreError>;

    /// Insert a queue entry and mark the underlying task `queued`, atomically.
    /// A no-op if the task is already present in the queue (returns `false`);
    /// rejected if the task is in a terminal status. Returns `true` only when
    /// a new queue entry was actually inserted, so callers can keep
    /// backpressure accounting in sync with the real queue depth.
    async fn enqueue(&self, entry: QueueEntry) -> Result<bool, StoreError>;

    /// Atomically move the head entry to in-flight and mark its task `running`.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<String>, StoreError>;

    /// Remove the in-flight record for `task_id` without requeueing.
    async fn ack(&self, task_id: &str) -> Result<(), StoreError>;

    /// Remove the in-flight record and, after `requeue_with_delay`, reinsert
    /// at the tail of the same priority class under a freshly allocated
    /// `enqueue_seq` — a nacked task rejoins the back of the line, it does
    /// not keep its original queue position.
    async fn nack(&self, task_id: &str, requeue_with_delay: std::time::Duration) -> Result<(), StoreError>;

    /// Rebuild in-memory structures from durable state on kernel start.
    async fn load_pending(&self) -> Result<PendingState, StoreError>;
}
