//! The Kernel (§6.2): the top-level object owning every subsystem (C1-C7)
//! and exposing the public submit/query/cancel surface consumed by CLIs and
//! SDKs. Modeled on `everruns-durable::engine::executor::WorkflowExecutor` —
//! a single struct that owns a persistence handle plus a registry and drives
//! everything else through it — generalized from event-sourced workflow
//! replay to DAG-of-tasks dispatch.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::engine::worker::{TerminalHandler, WorkerPool, WorkerPoolConfig};
use crate::events::{EventBus, KernelEvent};
use crate::model::{
    FailureStrategy, Priority, Task, TaskStatus, TaskSubmission, Workflow, WorkflowStatus, WorkflowSubmission,
};
use crate::persistence::{PersistenceBackend, StoreError, WorkflowFilter};
use crate::protocol::{ProtocolRegistry, ProtocolSpec, Provider, ProviderLifecycleManager, RegistryError};
use crate::queue::{QueueError, TaskQueue, TaskQueueConfig};
use crate::resolver::{self, DependencyGraph, FailureCascade, ResolverError};

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("kernel is already running")]
    AlreadyRunning,

    #[error("timed out waiting for workflow {0} to finish")]
    WaitTimeout(Uuid),
}

/// Owns the persistence backend, queue, protocol registry, provider
/// lifecycle manager, event bus, and (once started) the worker pool. One
/// `Kernel` per running process; construction wires every subsystem, `start`
/// brings the worker pool up, `stop` quiesces it and releases providers.
pub struct Kernel {
    backend: Arc<dyn PersistenceBackend>,
    queue: Arc<TaskQueue>,
    registry: Arc<ProtocolRegistry>,
    lifecycle: Arc<ProviderLifecycleManager>,
    events: Arc<EventBus>,
    config: KernelConfig,
    /// Cached per-workflow dependency graphs, held only while the workflow
    /// has non-terminal tasks. Rebuilt from durable state on `start`.
    graphs: DashMap<Uuid, Arc<DependencyGraph>>,
    worker_pool: Mutex<Option<Arc<WorkerPool>>>,
}

impl Kernel {
    pub fn new(backend: Arc<dyn PersistenceBackend>, config: KernelConfig) -> Arc<Self> {
        let registry = Arc::new(ProtocolRegistry::new());
        let queue = Arc::new(TaskQueue::new(
            backend.clone(),
            TaskQueueConfig {
                soft_cap: config.queue_soft_cap,
                backpressure: config.queue_backpressure.clone(),
            },
        ));
        let events = Arc::new(EventBus::new(config.event_channel_capacity));
        let lifecycle = Arc::new(ProviderLifecycleManager::new(
            registry.clone(),
            events.clone(),
            config.health_probe_interval,
            config.provider_release_deadline,
        ));
        Arc::new(Self {
            backend,
            queue,
            registry,
            lifecycle,
            events,
            config,
            graphs: DashMap::new(),
            worker_pool: Mutex::new(None),
        })
    }

    /// Startup-time only: register a protocol surface.
    pub fn register_protocol(&self, spec: ProtocolSpec) -> Result<(), RegistryError> {
        self.registry.register_protocol(spec)
    }

    /// Startup-time only: bind a running provider handle to a protocol.
    pub fn register_provider(
        &self,
        provider_id: impl Into<String>,
        protocol_id: &str,
        handle: Arc<dyn Provider>,
        concurrency_cap: Option<usize>,
    ) -> Result<(), RegistryError> {
        self.registry.register_provider(provider_id, protocol_id, handle, concurrency_cap)
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Init providers, rebuild in-memory structures from durable state, and
    /// start the worker pool.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), KernelError> {
        {
            let guard = self.worker_pool.lock().unwrap();
            if guard.is_some() {
                return Err(KernelError::AlreadyRunning);
            }
        }

        self.lifecycle.init_all().await;

        let pending = self.backend.load_pending().await?;
        let max_seq = pending
            .queue_entries
            .iter()
            .map(|e| e.enqueue_seq)
            .chain(pending.in_flight.iter().map(|e| e.entry.enqueue_seq))
            .max()
            .unwrap_or(0);
        self.queue.resume_from(max_seq, pending.queue_entries.len() + pending.in_flight.len());

        let pending_workflows: HashSet<Uuid> = pending.tasks.iter().map(|t| t.workflow_id).collect();
        for workflow_id in pending_workflows {
            match self.full_task_set(workflow_id).await {
                Ok(all_tasks) => match DependencyGraph::build(&all_tasks) {
                    Ok(graph) => {
                        self.graphs.insert(workflow_id, Arc::new(graph));
                    }
                    Err(e) => error!(%workflow_id, error = %e, "failed to rebuild dependency graph on restart"),
                },
                Err(e) => error!(%workflow_id, error = %e, "failed to reload workflow tasks on restart"),
            }
        }

        let kernel = self.clone();
        let on_terminal: TerminalHandler = Arc::new(move |task_id| {
            let kernel = kernel.clone();
            Box::pin(async move {
                if let Err(e) = kernel.handle_task_terminal(&task_id).await {
                    error!(task_id, error = %e, "failed to process terminal task transition");
                }
            })
        });

        let mut pool_config = WorkerPoolConfig::new(self.config.worker_count).with_stale_threshold(self.config.visibility_timeout);
        pool_config.shutdown_timeout = self.config.shutdown_grace_period;
        pool_config.stale_reclaim_interval = self.config.visibility_timeout;

        let pool = WorkerPool::new(
            self.queue.clone(),
            self.backend.clone(),
            self.registry.clone(),
            self.events.clone(),
            pool_config,
            on_terminal,
        );
        pool.start().await.map_err(|e| {
            error!(error = %e, "worker pool failed to start");
            StoreError::BackendUnavailable(e.to_string())
        })?;
        *self.worker_pool.lock().unwrap() = Some(pool);
        Ok(())
    }

    /// Stop accepting new claims, let in-flight tasks drain to a bounded
    /// deadline, then release every provider exactly once.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), KernelError> {
        let pool = self.worker_pool.lock().unwrap().take();
        if let Some(pool) = pool {
            if let Err(e) = pool.shutdown().await {
                warn!(error = %e, "worker pool did not shut down within its deadline");
            }
        }
        if let Err(e) = self.lifecycle.shutdown_all().await {
            warn!(error = %e, "provider lifecycle shutdown left providers unreleased");
        }
        Ok(())
    }

    /// Validate the DAG, persist workflow and tasks, and enqueue the initial
    /// ready set. Rejects synchronously (persisting nothing) on a cycle or a
    /// dangling reference.
    #[instrument(skip(self, submission), fields(name = %submission.name))]
    pub async fn submit_workflow(self: &Arc<Self>, submission: WorkflowSubmission) -> Result<Uuid, KernelError> {
        let WorkflowSubmission {
            name,
            description,
            failure_strategy,
            tasks: task_submissions,
        } = submission;

        let task_ids: Vec<String> = task_submissions.iter().map(|t| t.id.clone()).collect();
        let workflow = Workflow::new(name, description, failure_strategy, task_ids);
        let workflow_id = workflow.id;
        let tasks: Vec<Task> = task_submissions.into_iter().map(|t| Task::from_submission(workflow_id, t)).collect();
        let graph = DependencyGraph::build(&tasks)?;

        self.backend.put_workflow(&workflow).await?;
        for task in &tasks {
            self.backend.put_task(task).await?;
        }

        let graph = Arc::new(graph);
        let ready = graph.initial_ready_set();
        self.graphs.insert(workflow_id, graph);

        let by_id: std::collections::HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        for ready_id in ready {
            let Some(task) = by_id.get(ready_id.as_str()) else { continue };
            self.queue.enqueue(&ready_id, task.priority).await?;
            self.events.publish(KernelEvent::TaskQueued {
                task_id: ready_id,
                workflow_id,
                timestamp: Utc::now(),
            });
        }

        Ok(workflow_id)
    }

    /// Convenience wrapper: submit a single-task workflow, return its task id.
    pub async fn submit_task(self: &Arc<Self>, mut task: TaskSubmission, priority: Priority) -> Result<String, KernelError> {
        task.priority = Some(priority);
        let task_id = task.id.clone();
        let submission = WorkflowSubmission {
            name: format!("task:{task_id}"),
            description: None,
            failure_strategy: FailureStrategy::default(),
            tasks: vec![task],
        };
        self.submit_workflow(submission).await?;
        Ok(task_id)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, KernelError> {
        Ok(self.backend.get_task(task_id).await?)
    }

    pub async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, KernelError> {
        Ok(self.backend.get_workflow(workflow_id).await?)
    }

    pub async fn list_workflows(&self, filter: WorkflowFilter, limit: usize) -> Result<Vec<Workflow>, KernelError> {
        Ok(self.backend.list_workflows(filter, limit).await?)
    }

    /// Block until `workflow_id` reaches a terminal status or `timeout` elapses.
    pub async fn wait_for_workflow(&self, workflow_id: Uuid, timeout: Duration) -> Result<Workflow, KernelError> {
        let mut events = self.events.subscribe();
        let workflow = self.backend.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Ok(workflow);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(KernelError::WaitTimeout(workflow_id));
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(event)) if event_concludes(&event, workflow_id) => {
                    return Ok(self.backend.get_workflow(workflow_id).await?);
                }
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => {
                    // Lagged or closed: fall back to a direct read.
                    let workflow = self.backend.get_workflow(workflow_id).await?;
                    if workflow.status.is_terminal() {
                        return Ok(workflow);
                    }
                }
                Err(_) => return Err(KernelError::WaitTimeout(workflow_id)),
            }
        }
    }

    /// Mark the workflow and every non-terminal task `cancelled`, requesting
    /// cooperative cancellation of any task currently running.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<(), KernelError> {
        let mut workflow = self.backend.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Ok(());
        }

        for task_id in workflow.task_ids.clone() {
            let task = self.backend.get_task(&task_id).await?;
            if task.status.is_terminal() {
                continue;
            }
            self.finalize_non_terminal_task(&task, TaskStatus::Cancelled).await?;
            workflow.counters.cancelled += 1;
        }

        workflow.status = WorkflowStatus::Cancelled;
        workflow.finished_at = Some(Utc::now());
        self.backend.put_workflow(&workflow).await?;
        self.graphs.remove(&workflow_id);
        self.events.publish(KernelEvent::WorkflowCancelled { workflow_id, timestamp: Utc::now() });
        Ok(())
    }

    /// Called by the worker pool once a task reaches `completed` or `failed`:
    /// recompute readiness, apply failure cascades, and finalize the
    /// workflow once no non-terminal task remains.
    async fn handle_task_terminal(self: &Arc<Self>, task_id: &str) -> Result<(), KernelError> {
        let task = self.backend.get_task(task_id).await?;
        let workflow_id = task.workflow_id;
        let mut workflow = self.backend.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Ok(());
        }

        let Some(graph) = self.graphs.get(&workflow_id).map(|g| g.clone()) else {
            warn!(%workflow_id, "no cached dependency graph for workflow; cannot cascade");
            return Ok(());
        };
        let all_tasks = self.full_task_set(workflow_id).await?;

        match task.status {
            TaskStatus::Completed => {
                workflow.counters.completed += 1;
                let completed: HashSet<String> = all_tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Completed)
                    .map(|t| t.id.clone())
                    .collect();
                for ready_id in graph.newly_ready(task_id, &completed) {
                    let Some(ready_task) = all_tasks.iter().find(|t| t.id == ready_id) else { continue };
                    self.queue.enqueue(&ready_id, ready_task.priority).await?;
                    self.events.publish(KernelEvent::TaskQueued {
                        task_id: ready_id,
                        workflow_id,
                        timestamp: Utc::now(),
                    });
                }
            }
            TaskStatus::Failed => {
                workflow.counters.failed += 1;
                match resolver::cascade_for_failure(workflow.failure_strategy, task_id, &graph, &all_tasks) {
                    FailureCascade::CancelAll => {
                        for t in &all_tasks {
                            if t.id == task_id || t.status.is_terminal() {
                                continue;
                            }
                            self.finalize_non_terminal_task(t, TaskStatus::Cancelled).await?;
                            workflow.counters.cancelled += 1;
                        }
                    }
                    FailureCascade::SkipDependents(ids) | FailureCascade::SkipReferencing(ids) => {
                        for id in ids {
                            let Some(t) = all_tasks.iter().find(|t| t.id == id) else { continue };
                            if t.status.is_terminal() {
                                continue;
                            }
                            self.finalize_non_terminal_task(t, TaskStatus::Skipped).await?;
                            workflow.counters.skipped += 1;
                        }
                    }
                }
            }
            _ => {}
        }

        if workflow.is_complete() {
            workflow.status = if workflow.counters.failed > 0 { WorkflowStatus::Failed } else { WorkflowStatus::Completed };
            workflow.finished_at = Some(Utc::now());
            self.graphs.remove(&workflow_id);
            let event = match workflow.status {
                WorkflowStatus::Failed => KernelEvent::WorkflowFailed { workflow_id, timestamp: Utc::now() },
                _ => KernelEvent::WorkflowCompleted { workflow_id, timestamp: Utc::now() },
            };
            self.backend.put_workflow(&workflow).await?;
            self.events.publish(event);
        } else {
            self.backend.put_workflow(&workflow).await?;
        }
        Ok(())
    }

    async fn finalize_non_terminal_task(&self, task: &Task, status: TaskStatus) -> Result<(), KernelError> {
        if status == TaskStatus::Cancelled {
            if let Some(pool) = self.worker_pool.lock().unwrap().clone() {
                pool.cancel_task(&task.id);
            }
        }
        let mut task = task.clone();
        task.status = status;
        task.finished_at = Some(Utc::now());
        self.backend.put_task(&task).await?;
        self.queue.ack(&task.id).await.ok();
        Ok(())
    }

    async fn full_task_set(&self, workflow_id: Uuid) -> Result<Vec<Task>, KernelError> {
        let workflow = self.backend.get_workflow(workflow_id).await?;
        let mut tasks = Vec::with_capacity(workflow.task_ids.len());
        for id in &workflow.task_ids {
            tasks.push(self.backend.get_task(id).await?);
        }
        Ok(tasks)
    }
}

fn event_concludes(event: &KernelEvent, workflow_id: Uuid) -> bool {
    matches!(
        event,
        KernelEvent::WorkflowCompleted { workflow_id: id, .. }
        | KernelEvent::WorkflowFailed { workflow_id: id, .. }
        | KernelEvent::WorkflowCancelled { workflow_id: id, .. }
        if *id == workflow_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryBackend;
    use crate::protocol::{HealthState, MethodSpec, ProtocolSpec};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    struct DoublingProvider;

    #[async_trait]
    impl Provider for DoublingProvider {
        async fn initialize(&self) -> Result<(), crate::protocol::ProviderError> {
            Ok(())
        }
        fn supported_methods(&self) -> HashSet<String> {
            ["math/double".to_string()].into_iter().collect()
        }
        async fn health_probe(&self) -> Result<HealthState, crate::protocol::ProviderError> {
            Ok(HealthState::Healthy)
        }
        async fn invoke(&self, _method: &str, params: Value, _token: CancellationToken) -> Result<Value, crate::model::TaskError> {
            let n = params.get("n").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!({ "n": n * 2 }))
        }
        async fn release(&self) -> Result<(), crate::protocol::ProviderError> {
            Ok(())
        }
    }

    async fn build_kernel() -> Arc<Kernel> {
        let backend = Arc::new(InMemoryBackend::new());
        let kernel = Kernel::new(backend, KernelConfig::new().with_worker_count(2));
        kernel
            .register_protocol(ProtocolSpec::new("math/v1", vec![MethodSpec::new("math/double")]))
            .unwrap();
        kernel.register_provider("p1", "math/v1", Arc::new(DoublingProvider), None).unwrap();
        kernel.registry.set_health("p1", HealthState::Healthy);
        kernel
    }

    fn task_submission(id: &str, deps: &[&str], params: Value) -> TaskSubmission {
        TaskSubmission {
            id: id.to_string(),
            method: "math/double".into(),
            params,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            priority: None,
            timeout_seconds: None,
            retry: None,
        }
    }

    #[tokio::test]
    async fn linear_chain_propagates_substituted_results() {
        let kernel = build_kernel().await;
        let submission = WorkflowSubmission {
            name: "chain".into(),
            description: None,
            failure_strategy: FailureStrategy::default(),
            tasks: vec![
                task_submission("t1", &[], json!({"n": 2})),
                task_submission("t2", &[], json!({"n": "${t1.n}"})),
            ],
        };
        let workflow_id = kernel.submit_workflow(submission).await.unwrap();
        kernel.start().await.unwrap();

        let finished = kernel.wait_for_workflow(workflow_id, Duration::from_secs(5)).await.unwrap();
        kernel.stop().await.unwrap();

        assert_eq!(finished.status, WorkflowStatus::Completed);
        let t2 = kernel.get_task("t2").await.unwrap();
        assert_eq!(t2.result, Some(json!({"n": 8})));
    }

    #[tokio::test]
    async fn cycle_is_rejected_and_persists_nothing() {
        let kernel = build_kernel().await;
        let submission = WorkflowSubmission {
            name: "cycle".into(),
            description: None,
            failure_strategy: FailureStrategy::default(),
            tasks: vec![task_submission("a", &["b"], Value::Null), task_submission("b", &["a"], Value::Null)],
        };
        let err = kernel.submit_workflow(submission).await.unwrap_err();
        assert!(matches!(err, KernelError::Resolver(ResolverError::CircularDependency(_))));
    }
}
