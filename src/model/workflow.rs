use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::TaskSubmission;

/// What happens to the rest of a workflow when one of its tasks fails fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Cancel every other non-terminal task, fail the workflow immediately.
    StopOnFirstFailure,
    /// Only dependents whose params reference the failed task's result are skipped.
    ContinueOnError,
    /// Transitively skip every dependent of the failed task.
    SkipDependents,
}

impl Default for FailureStrategy {
    fn default() -> Self {
        FailureStrategy::StopOnFirstFailure
    }
}

/// A workflow's lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Running counters over a workflow's tasks, updated as tasks reach terminal states.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkflowCounters {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub cancelled: u32,
}

/// A DAG of tasks submitted and observed as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    pub status: WorkflowStatus,
    /// Advisory ordering only; execution order is derived from dependencies.
    pub task_ids: Vec<String>,
    pub counters: WorkflowCounters,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, description: Option<String>, failure_strategy: FailureStrategy, task_ids: Vec<String>) -> Self {
        let total = task_ids.len() as u32;
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description,
            failure_strategy,
            status: WorkflowStatus::Pending,
            task_ids,
            counters: WorkflowCounters {
                total,
                ..Default::default()
            },
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// True once every task has reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.counters.completed + self.counters.failed + self.counters.skipped + self.counters.cancelled
            >= self.counters.total
    }
}

/// Wire-format workflow submission (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSubmission {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    pub tasks: Vec<TaskSubmission>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_workflow_starts_pending_with_counters() {
        let wf = Workflow::new("demo", None, FailureStrategy::default(), vec!["a".into(), "b".into()]);
        assert_eq!(wf.status, WorkflowStatus::Pending);
        assert_eq!(wf.counters.total, 2);
        assert!(!wf.is_complete());
    }

    #[test]
    fn is_complete_once_counters_cover_total() {
        let mut wf = Workflow::new("demo", None, FailureStrategy::default(), vec!["a".into()]);
        wf.counters.completed = 1;
        assert!(wf.is_complete());
    }
}
