//! Observable Events (§6.5): a best-effort broadcast stream of kernel
//! activity, generalized from `everruns-core::events::LoopEvent`'s flat,
//! tagged-event shape to task/workflow lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{event, Level};
use uuid::Uuid;

use crate::model::TaskError;
use crate::protocol::HealthState;

/// One observable occurrence in the kernel's lifecycle.
///
/// Delivery is best-effort: a full subscriber channel drops the oldest
/// events rather than blocking execution. A full `tracing` event is emitted
/// alongside every broadcast send — the event channel is for observers, the
/// span/event is for operators, and neither is a substitute for the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelEvent {
    TaskQueued {
        task_id: String,
        workflow_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        task_id: String,
        workflow_id: Uuid,
        attempt: u32,
        provider_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: String,
        workflow_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        task_id: String,
        workflow_id: Uuid,
        error: TaskError,
        timestamp: DateTime<Utc>,
    },
    TaskRetried {
        task_id: String,
        workflow_id: Uuid,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        workflow_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    WorkflowFailed {
        workflow_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    WorkflowCancelled {
        workflow_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    ProviderHealthChanged {
        provider_id: String,
        health: HealthState,
        timestamp: DateTime<Utc>,
    },
}

impl KernelEvent {
    fn log(&self) {
        match self {
            KernelEvent::TaskQueued { task_id, workflow_id, .. } => {
                event!(Level::DEBUG, task_id, %workflow_id, "task queued")
            }
            KernelEvent::TaskStarted { task_id, workflow_id, attempt, provider_id, .. } => {
                event!(Level::INFO, task_id, %workflow_id, attempt, provider_id, "task started")
            }
            KernelEvent::TaskCompleted { task_id, workflow_id, .. } => {
                event!(Level::INFO, task_id, %workflow_id, "task completed")
            }
            KernelEvent::TaskFailed { task_id, workflow_id, error, .. } => {
                event!(Level::WARN, task_id, %workflow_id, code = %error.code, "task failed")
            }
            KernelEvent::TaskRetried { task_id, workflow_id, attempt, delay_ms, .. } => {
                event!(Level::INFO, task_id, %workflow_id, attempt, delay_ms, "task retried")
            }
            KernelEvent::WorkflowCompleted { workflow_id, .. } => {
                event!(Level::INFO, %workflow_id, "workflow completed")
            }
            KernelEvent::WorkflowFailed { workflow_id, .. } => {
                event!(Level::WARN, %workflow_id, "workflow failed")
            }
            KernelEvent::WorkflowCancelled { workflow_id, .. } => {
                event!(Level::INFO, %workflow_id, "workflow cancelled")
            }
            KernelEvent::ProviderHealthChanged { provider_id, health, .. } => {
                event!(Level::INFO, provider_id, ?health, "provider health changed")
            }
        }
    }
}

/// Broadcast sender the kernel holds; every subsystem gets a clone of the
/// `Sender`-derived [`EventBus::publish`] handle, never the raw channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<KernelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe for observation. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.tx.subscribe()
    }

    /// Emit `event`: logs it via `tracing` and broadcasts it to subscribers.
    /// A send with no subscribers, or a lagging subscriber, never errors
    /// back to the caller — delivery failures must never affect execution.
    pub fn publish(&self, event: KernelEvent) {
        event.log();
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(KernelEvent::WorkflowCompleted {
            workflow_id: Uuid::nil(),
            timestamp: Utc::now(),
        });
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, KernelEvent::WorkflowCompleted { .. }));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(KernelEvent::TaskQueued {
            task_id: "t1".into(),
            workflow_id: Uuid::nil(),
            timestamp: Utc::now(),
        });
    }
}
