//! Embedded, file-backed SQL persistence backend (SQLite via `sqlx`).
//!
//! Recommended for single-node deployments. The table layout mirrors the
//! four logical collections from the abstract persisted-state layout:
//! `workflows`, `tasks`, `queue_entries` (pending), `queue_inflight`
//! (claimed but unacked). Grounded in the teacher's
//! `PostgresWorkflowEventStore` — `sqlx::query`, `.bind(...)`, and explicit
//! `pool.begin()` transactions for the operations that must be atomic — with
//! the driver swapped from Postgres to SQLite and the schema flattened from
//! an event log to direct-field task/workflow rows.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::model::{FailureStrategy, Priority, QueueEntry, Task, TaskStatus, Workflow, WorkflowStatus};

use super::{InFlightEntry, PendingState, PersistenceBackend, StoreError, TaskOutcome, WorkflowFilter};

/// SQLite-backed implementation of [`PersistenceBackend`].
#[derive(Clone)]
pub struct SqlBackend {
    pool: SqlitePool,
}

impl SqlBackend {
    /// Open (creating if absent) the SQLite file at `path` and apply schema.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // single-writer: SQLite serializes writes anyway
            .connect_with(options)
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;

        let backend = Self { pool };
        backend.apply_schema().await?;
        Ok(backend)
    }

    /// An in-memory SQLite database, useful for exercising the SQL code path
    /// in tests without touching the filesystem.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
        let backend = Self { pool };
        backend.apply_schema().await?;
        Ok(backend)
    }

    async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                failure_strategy TEXT NOT NULL,
                status TEXT NOT NULL,
                task_ids TEXT NOT NULL,
                counters TEXT NOT NULL,
                created_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                method TEXT NOT NULL,
                params TEXT NOT NULL,
                priority TEXT NOT NULL,
                dependencies TEXT NOT NULL,
                timeout_seconds INTEGER,
                retry_policy TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                result TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                queued_at TEXT,
                started_at TEXT,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_workflow_id ON tasks(workflow_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            CREATE TABLE IF NOT EXISTS queue_entries (
                task_id TEXT PRIMARY KEY,
                priority TEXT NOT NULL,
                priority_rank INTEGER NOT NULL,
                enqueue_seq INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_order ON queue_entries(priority_rank, enqueue_seq);

            CREATE TABLE IF NOT EXISTS queue_inflight (
                task_id TEXT PRIMARY KEY,
                priority TEXT NOT NULL,
                priority_rank INTEGER NOT NULL,
                enqueue_seq INTEGER NOT NULL,
                worker_id TEXT NOT NULL,
                claimed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS enqueue_seq_counter (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                next_seq INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO enqueue_seq_counter (id, next_seq) VALUES (0, 0);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::BackendCorrupted(e.to_string()))?;
        Ok(())
    }

    /// Allocate the next monotonically increasing `enqueue_seq`.
    pub async fn next_enqueue_seq(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        let row = sqlx::query("SELECT next_seq FROM enqueue_seq_counter WHERE id = 0")
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_err)?;
        let seq: i64 = row.get("next_seq");
        sqlx::query("UPDATE enqueue_seq_counter SET next_seq = next_seq + 1 WHERE id = 0")
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        tx.commit().await.map_err(map_db_err)?;
        Ok(seq as u64)
    }
}

fn map_db_err(e: sqlx::Error) -> StoreError {
    StoreError::BackendUnavailable(e.to_string())
}

fn priority_to_str(p: Priority) -> &'static str {
    match p {
        Priority::Urgent => "urgent",
        Priority::High => "high",
        Priority::Normal => "normal",
        Priority::Low => "low",
    }
}

fn priority_from_str(s: &str) -> Result<Priority, StoreError> {
    match s {
        "urgent" => Ok(Priority::Urgent),
        "high" => Ok(Priority::High),
        "normal" => Ok(Priority::Normal),
        "low" => Ok(Priority::Low),
        other => Err(StoreError::BackendCorrupted(format!("unknown priority {other}"))),
    }
}

fn status_to_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::Queued => "queued",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
        TaskStatus::Skipped => "skipped",
    }
}

fn status_from_str(s: &str) -> Result<TaskStatus, StoreError> {
    Ok(match s {
        "pending" => TaskStatus::Pending,
        "queued" => TaskStatus::Queued,
        "running" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        "skipped" => TaskStatus::Skipped,
        other => return Err(StoreError::BackendCorrupted(format!("unknown task status {other}"))),
    })
}

fn failure_strategy_to_str(s: FailureStrategy) -> &'static str {
    match s {
        FailureStrategy::StopOnFirstFailure => "stop_on_first_failure",
        FailureStrategy::ContinueOnError => "continue_on_error",
        FailureStrategy::SkipDependents => "skip_dependents",
    }
}

fn failure_strategy_from_str(s: &str) -> Result<FailureStrategy, StoreError> {
    Ok(match s {
        "stop_on_first_failure" => FailureStrategy::StopOnFirstFailure,
        "continue_on_error" => FailureStrategy::ContinueOnError,
        "skip_dependents" => FailureStrategy::SkipDependents,
        other => return Err(StoreError::BackendCorrupted(format!("unknown failure strategy {other}"))),
    })
}

fn workflow_status_to_str(s: WorkflowStatus) -> &'static str {
    match s {
        WorkflowStatus::Pending => "pending",
        WorkflowStatus::Running => "running",
        WorkflowStatus::Completed => "completed",
        WorkflowStatus::Failed => "failed",
        WorkflowStatus::Cancelled => "cancelled",
    }
}

fn workflow_status_from_str(s: &str) -> Result<WorkflowStatus, StoreError> {
    Ok(match s {
        "pending" => WorkflowStatus::Pending,
        "running" => WorkflowStatus::Running,
        "completed" => WorkflowStatus::Completed,
        "failed" => WorkflowStatus::Failed,
        "cancelled" => WorkflowStatus::Cancelled,
        other => return Err(StoreError::BackendCorrupted(format!("unknown workflow status {other}"))),
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::BackendCorrupted(e.to_string()))
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Task, StoreError> {
    let dependencies: Vec<String> =
        serde_json::from_str(row.get::<String, _>("dependencies").as_str()).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let result: Option<String> = row.get("result");
    let error: Option<String> = row.get("error");
    let queued_at: Option<String> = row.get("queued_at");
    let started_at: Option<String> = row.get("started_at");
    let finished_at: Option<String> = row.get("finished_at");

    Ok(Task {
        id: row.get("id"),
        workflow_id: Uuid::parse_str(row.get::<String, _>("workflow_id").as_str())
            .map_err(|e| StoreError::BackendCorrupted(e.to_string()))?,
        method: row.get("method"),
        params: serde_json::from_str(row.get::<String, _>("params").as_str()).map_err(|e| StoreError::Serialization(e.to_string()))?,
        priority: priority_from_str(row.get::<String, _>("priority").as_str())?,
        dependencies: dependencies.into_iter().collect::<HashSet<_>>(),
        timeout_seconds: row.get::<Option<i64>, _>("timeout_seconds").map(|v| v as u64),
        retry_policy: serde_json::from_str(row.get::<String, _>("retry_policy").as_str())
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        status: status_from_str(row.get::<String, _>("status").as_str())?,
        attempt_count: row.get::<i64, _>("attempt_count") as u32,
        result: result.map(|r| serde_json::from_str(&r)).transpose().map_err(|e| StoreError::Serialization(e.to_string()))?,
        error: error.map(|e| serde_json::from_str(&e)).transpose().map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: parse_timestamp(row.get::<String, _>("created_at").as_str())?,
        queued_at: queued_at.map(|s| parse_timestamp(&s)).transpose()?,
        started_at: started_at.map(|s| parse_timestamp(&s)).transpose()?,
        finished_at: finished_at.map(|s| parse_timestamp(&s)).transpose()?,
    })
}

#[async_trait]
impl PersistenceBackend for SqlBackend {
    #[instrument(skip(self, workflow))]
    async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let task_ids = serde_json::to_string(&workflow.task_ids).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let counters = serde_json::to_string(&workflow.counters).map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, description, failure_strategy, status, task_ids, counters, created_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, description = excluded.description,
                failure_strategy = excluded.failure_strategy, status = excluded.status,
                task_ids = excluded.task_ids, counters = excluded.counters,
                finished_at = excluded.finished_at
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(failure_strategy_to_str(workflow.failure_strategy))
        .bind(workflow_status_to_str(workflow.status))
        .bind(task_ids)
        .bind(counters)
        .bind(workflow.created_at.to_rfc3339())
        .bind(workflow.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to put workflow: {e}");
            map_db_err(e)
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?
            .ok_or(StoreError::WorkflowNotFound(id))?;

        Ok(Workflow {
            id,
            name: row.get("name"),
            description: row.get("description"),
            failure_strategy: failure_strategy_from_str(row.get::<String, _>("failure_strategy").as_str())?,
            status: workflow_status_from_str(row.get::<String, _>("status").as_str())?,
            task_ids: serde_json::from_str(row.get::<String, _>("task_ids").as_str()).map_err(|e| StoreError::Serialization(e.to_string()))?,
            counters: serde_json::from_str(row.get::<String, _>("counters").as_str()).map_err(|e| StoreError::Serialization(e.to_string()))?,
            created_at: parse_timestamp(row.get::<String, _>("created_at").as_str())?,
            finished_at: row
                .get::<Option<String>, _>("finished_at")
                .map(|s| parse_timestamp(&s))
                .transpose()?,
        })
    }

    async fn list_workflows(&self, filter: WorkflowFilter, limit: usize) -> Result<Vec<Workflow>, StoreError> {
        let rows = match filter.status {
            Some(status) => sqlx::query("SELECT id FROM workflows WHERE status = ?1 ORDER BY created_at LIMIT ?2")
                .bind(workflow_status_to_str(status))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query("SELECT id FROM workflows ORDER BY created_at LIMIT ?1")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(map_db_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id = Uuid::parse_str(row.get::<String, _>("id").as_str()).map_err(|e| StoreError::BackendCorrupted(e.to_string()))?;
            out.push(self.get_workflow(id).await?);
        }
        Ok(out)
    }

    #[instrument(skip(self, task))]
    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        let dependencies = serde_json::to_string(&task.dependencies.iter().collect::<Vec<_>>())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let params = serde_json::to_string(&task.params).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let retry_policy = serde_json::to_string(&task.retry_policy).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = task.result.as_ref().map(serde_json::to_string).transpose().map_err(|e| StoreError::Serialization(e.to_string()))?;
        let error = task.error.as_ref().map(serde_json::to_string).transpose().map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, workflow_id, method, params, priority, dependencies, timeout_seconds,
                                retry_policy, status, attempt_count, result, error, created_at, queued_at, started_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(id) DO UPDATE SET
                params = excluded.params, priority = excluded.priority, dependencies = excluded.dependencies,
                timeout_seconds = excluded.timeout_seconds, retry_policy = excluded.retry_policy,
                status = excluded.status, attempt_count = excluded.attempt_count,
                result = excluded.result, error = excluded.error,
                queued_at = excluded.queued_at, started_at = excluded.started_at, finished_at = excluded.finished_at
            "#,
        )
        .bind(&task.id)
        .bind(task.workflow_id.to_string())
        .bind(&task.method)
        .bind(params)
        .bind(priority_to_str(task.priority))
        .bind(dependencies)
        .bind(task.timeout_seconds.map(|v| v as i64))
        .bind(retry_policy)
        .bind(status_to_str(task.status))
        .bind(task.attempt_count as i64)
        .bind(result)
        .bind(error)
        .bind(task.created_at.to_rfc3339())
        .bind(task.queued_at.map(|t| t.to_rfc3339()))
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to put task: {e}");
            map_db_err(e)
        })?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;
        task_from_row(&row)
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus, ts: DateTime<Utc>) -> Result<(), StoreError> {
        let column = match status {
            TaskStatus::Queued => "queued_at",
            TaskStatus::Running => "started_at",
            s if s.is_terminal() => "finished_at",
            _ => return self.set_status_only(id, status).await,
        };
        let query = format!("UPDATE tasks SET status = ?1, {column} = ?2 WHERE id = ?3");
        let result = sqlx::query(&query)
            .bind(status_to_str(status))
            .bind(ts.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_task_result(&self, id: &str, outcome: TaskOutcome, final_status: TaskStatus) -> Result<(), StoreError> {
        let (result, error) = match outcome {
            TaskOutcome::Success(value) => (Some(serde_json::to_string(&value).map_err(|e| StoreError::Serialization(e.to_string()))?), None),
            TaskOutcome::Failure(err) => (None, Some(serde_json::to_string(&err).map_err(|e| StoreError::Serialization(e.to_string()))?)),
        };

        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        let updated = sqlx::query(
            "UPDATE tasks SET status = ?1, result = ?2, error = ?3, finished_at = ?4 WHERE id = ?5",
        )
        .bind(status_to_str(final_status))
        .bind(result)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        sqlx::query("DELETE FROM queue_inflight WHERE task_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        tx.commit().await.map_err(map_db_err)?;
        debug!(task_id = id, "persisted terminal result");
        Ok(())
    }

    async fn enqueue(&self, entry: QueueEntry) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        let status_row = sqlx::query("SELECT status FROM tasks WHERE id = ?1")
            .bind(&entry.task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_db_err)?;
        if let Some(row) = &status_row {
            if status_from_str(row.get::<String, _>("status").as_str())?.is_terminal() {
                return Err(StoreError::BackendCorrupted(format!("refusing to enqueue terminal task {}", entry.task_id)));
            }
        }

        let existing = sqlx::query("SELECT 1 FROM queue_entries WHERE task_id = ?1")
            .bind(&entry.task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_db_err)?;
        if existing.is_some() {
            return Ok(false); // idempotent no-op
        }

        sqlx::query("INSERT INTO queue_entries (task_id, priority, priority_rank, enqueue_seq) VALUES (?1, ?2, ?3, ?4)")
            .bind(&entry.task_id)
            .bind(priority_to_str(entry.priority))
            .bind(entry.priority.rank() as i64)
            .bind(entry.enqueue_seq as i64)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

        sqlx::query("UPDATE tasks SET status = 'queued', queued_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(&entry.task_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

        tx.commit().await.map_err(map_db_err)?;
        Ok(true)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        let head = sqlx::query("SELECT task_id, priority, priority_rank, enqueue_seq FROM queue_entries ORDER BY priority_rank ASC, enqueue_seq ASC LIMIT 1")
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_db_err)?;

        let Some(row) = head else {
            tx.commit().await.map_err(map_db_err)?;
            return Ok(None);
        };

        let task_id: String = row.get("task_id");
        let priority: String = row.get("priority");
        let priority_rank: i64 = row.get("priority_rank");
        let enqueue_seq: i64 = row.get("enqueue_seq");

        sqlx::query("DELETE FROM queue_entries WHERE task_id = ?1")
            .bind(&task_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO queue_inflight (task_id, priority, priority_rank, enqueue_seq, worker_id, claimed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&task_id)
        .bind(priority)
        .bind(priority_rank)
        .bind(enqueue_seq)
        .bind(worker_id)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        sqlx::query("UPDATE tasks SET status = 'running', started_at = ?1 WHERE id = ?2")
            .bind(now.to_rfc3339())
            .bind(&task_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

        tx.commit().await.map_err(map_db_err)?;
        Ok(Some(task_id))
    }

    async fn ack(&self, task_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue_inflight WHERE task_id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn nack(&self, task_id: &str, requeue_with_delay: Duration) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        let row = sqlx::query("SELECT priority, priority_rank FROM queue_inflight WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        sqlx::query("DELETE FROM queue_inflight WHERE task_id = ?1")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        tx.commit().await.map_err(map_db_err)?;

        let priority: String = row.get("priority");
        let priority_rank: i64 = row.get("priority_rank");
        let pool = self.pool.clone();
        let task_id = task_id.to_string();

        // A fresh `enqueue_seq` is allocated at reinsertion time, not preserved
        // from the original enqueue, so a nacked task rejoins the tail of its
        // priority class rather than cutting back in at its old position.
        let requeue = move || async move {
            let mut tx = pool.begin().await.map_err(map_db_err)?;
            let seq_row = sqlx::query("SELECT next_seq FROM enqueue_seq_counter WHERE id = 0").fetch_one(&mut *tx).await.map_err(map_db_err)?;
            let seq: i64 = seq_row.get("next_seq");
            sqlx::query("UPDATE enqueue_seq_counter SET next_seq = next_seq + 1 WHERE id = 0").execute(&mut *tx).await.map_err(map_db_err)?;

            sqlx::query("INSERT OR IGNORE INTO queue_entries (task_id, priority, priority_rank, enqueue_seq) VALUES (?1, ?2, ?3, ?4)")
                .bind(&task_id)
                .bind(priority)
                .bind(priority_rank)
                .bind(seq)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
            sqlx::query("UPDATE tasks SET status = 'queued', queued_at = ?1 WHERE id = ?2")
                .bind(Utc::now().to_rfc3339())
                .bind(&task_id)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
            tx.commit().await.map_err(map_db_err)
        };

        if requeue_with_delay.is_zero() {
            requeue().await?;
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(requeue_with_delay).await;
                if let Err(e) = requeue().await {
                    error!("failed to requeue after backoff: {e}");
                }
            });
        }
        Ok(())
    }

    async fn load_pending(&self) -> Result<PendingState, StoreError> {
        let task_rows = sqlx::query("SELECT * FROM tasks WHERE status IN ('queued', 'running')")
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err)?;
        let mut tasks = Vec::with_capacity(task_rows.len());
        for row in &task_rows {
            tasks.push(task_from_row(row)?);
        }

        let entry_rows = sqlx::query("SELECT task_id, priority, enqueue_seq FROM queue_entries")
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err)?;
        let mut queue_entries = Vec::with_capacity(entry_rows.len());
        for row in &entry_rows {
            queue_entries.push(QueueEntry::new(
                row.get::<String, _>("task_id"),
                priority_from_str(row.get::<String, _>("priority").as_str())?,
                row.get::<i64, _>("enqueue_seq") as u64,
            ));
        }

        let inflight_rows = sqlx::query("SELECT task_id, priority, enqueue_seq, worker_id, claimed_at FROM queue_inflight")
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err)?;
        let mut in_flight = Vec::with_capacity(inflight_rows.len());
        for row in &inflight_rows {
            in_flight.push(InFlightEntry {
                entry: QueueEntry::new(
                    row.get::<String, _>("task_id"),
                    priority_from_str(row.get::<String, _>("priority").as_str())?,
                    row.get::<i64, _>("enqueue_seq") as u64,
                ),
                worker_id: row.get("worker_id"),
                claimed_at: parse_timestamp(row.get::<String, _>("claimed_at").as_str())?,
            });
        }

        Ok(PendingState {
            tasks,
            queue_entries,
            in_flight,
        })
    }
}

impl SqlBackend {
    async fn set_status_only(&self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tasks SET status = ?1 WHERE id = ?2")
            .bind(status_to_str(status))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
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
                params: serde_json::json!({"prompt": "hi"}),
                dependencies: vec![],
                priority: Some(Priority::Normal),
                timeout_seconds: None,
                retry: None,
            },
        )
    }

    #[tokio::test]
    async fn put_and_get_task_round_trips() {
        let backend = SqlBackend::connect_in_memory().await.unwrap();
        let task = sample_task("t1");
        backend.put_task(&task).await.unwrap();
        let fetched = backend.get_task("t1").await.unwrap();
        assert_eq!(fetched.id, "t1");
        assert_eq!(fetched.params, serde_json::json!({"prompt": "hi"}));
    }

    #[tokio::test]
    async fn enqueue_claim_ack_round_trip() {
        let backend = SqlBackend::connect_in_memory().await.unwrap();
        backend.put_task(&sample_task("t1")).await.unwrap();
        let seq = backend.next_enqueue_seq().await.unwrap();
        backend.enqueue(QueueEntry::new("t1", Priority::Normal, seq)).await.unwrap();

        let claimed = backend.claim_next("w1").await.unwrap();
        assert_eq!(claimed, Some("t1".to_string()));

        let task = backend.get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        backend.ack("t1").await.unwrap();
        let pending = backend.load_pending().await.unwrap();
        assert!(pending.in_flight.is_empty());
    }

    #[tokio::test]
    async fn load_pending_recovers_queue_entries_after_restart() {
        let backend = SqlBackend::connect_in_memory().await.unwrap();
        backend.put_task(&sample_task("t1")).await.unwrap();
        let seq = backend.next_enqueue_seq().await.unwrap();
        backend.enqueue(QueueEntry::new("t1", Priority::Normal, seq)).await.unwrap();

        let pending = backend.load_pending().await.unwrap();
        assert_eq!(pending.tasks.len(), 1);
        assert_eq!(pending.queue_entries.len(), 1);
    }
}
