use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::reliability::RetryPolicy;

/// One of the four priority classes a task can be enqueued under.
///
/// Ordering is `Urgent > High > Normal > Low`; the derived `Ord` impl relies
/// on declaration order, which is why the highest priority is listed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    /// Numeric rank used as the primary sort key in the queue, lower sorts first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    /// Higher priority (e.g. `Urgent`) compares greater, so a max-heap
    /// naturally surfaces it first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.rank().cmp(&self.rank())
    }
}

/// A task's position in its per-task state machine (see engine module docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    /// Terminal statuses are never re-dispatched.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }
}

/// Structured, user-facing task failure. Mirrors the provider error shape
/// from the provider contract (`{code, message, retryable, data?}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TaskError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
            data: None,
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, false)
    }

    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, true)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A classification helper used by the engine when deciding whether a
/// provider-reported failure consumes a retry attempt or terminates the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableError {
    Retryable,
    Fatal,
}

/// One invocation of a `<protocol>/<verb>` method, scheduled as part of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub workflow_id: Uuid,
    pub method: String,
    pub params: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: HashSet<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a fresh, `pending` task from a wire-format submission.
    pub fn from_submission(workflow_id: Uuid, submission: TaskSubmission) -> Self {
        Self {
            id: submission.id,
            workflow_id,
            method: submission.method,
            params: submission.params,
            priority: submission.priority.unwrap_or_default(),
            dependencies: submission.dependencies.into_iter().collect(),
            timeout_seconds: submission.timeout_seconds,
            retry_policy: submission.retry.unwrap_or_default(),
            status: TaskStatus::Pending,
            attempt_count: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Wire-format task entry accepted in a workflow submission (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub id: String,
    pub method: String,
    #[serde(default = "default_params")]
    pub params: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

fn default_params() -> Value {
    Value::Object(Default::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_urgent_first() {
        let mut priorities = vec![Priority::Low, Priority::Urgent, Priority::Normal, Priority::High];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Urgent, Priority::High, Priority::Normal, Priority::Low]
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn task_from_submission_starts_pending() {
        let submission = TaskSubmission {
            id: "t1".into(),
            method: "llm/generate".into(),
            params: serde_json::json!({"prompt": "hi"}),
            dependencies: vec![],
            priority: None,
            timeout_seconds: None,
            retry: None,
        };
        let task = Task::from_submission(Uuid::nil(), submission);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::Normal);
        assert_eq!(task.attempt_count, 0);
    }
}
