//! Execution Engine (C7): a pool of concurrent worker flows that claim
//! tasks from the queue, dispatch them through a resolved provider, and
//! report terminal transitions back to the caller.
//!
//! The poll loop, adaptive backoff, and graceful-shutdown handshake are
//! carried forward from `everruns-durable::worker::{pool, poller}`, with the
//! unit of work generalized from a statically-registered `Activity` to a
//! `Task` dispatched through a dynamically-resolved `Provider`. Stale-task
//! reclamation is adapted to poll `PersistenceBackend::load_pending`
//! directly rather than a dedicated worker-registry table — the persisted
//! state layout has no `workers` collection for `reclaim_stale_tasks` to
//! consult, only workflows/tasks/queue entries.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::events::{EventBus, KernelEvent};
use crate::model::{Task, TaskError, TaskStatus};
use crate::persistence::{PersistenceBackend, TaskOutcome};
use crate::protocol::{ProtocolRegistry, RegistryError};
use crate::queue::TaskQueue;
use crate::substitution::{self, SubstitutionError};

/// Poll-loop pacing, carried forward from
/// `everruns-durable::worker::poller::PollerConfig`, minus the
/// batch-size/multi-task knobs the teacher's `claim_task(..., batch_size)`
/// needed — this kernel's queue claims one task id at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(2),
            backoff_multiplier: 1.5,
        }
    }
}

/// Configuration for the worker pool driving C7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker flows (W in §5).
    pub worker_count: usize,
    pub poller: PollerConfig,
    /// Used when a task carries no `timeout_seconds` of its own.
    #[serde(with = "duration_millis")]
    pub default_task_timeout: Duration,
    /// How often the stale-task reclaimer scans `load_pending`.
    #[serde(with = "duration_millis")]
    pub stale_reclaim_interval: Duration,
    /// In-flight entries older than this are nacked back to the queue.
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,
    /// How long `shutdown` waits for in-flight dispatches to finish before
    /// requesting cooperative cancellation.
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            poller: PollerConfig::default(),
            default_task_timeout: Duration::from_secs(30),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            ..Default::default()
        }
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout = timeout;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool is not running")]
    NotRunning,

    #[error("graceful shutdown timed out with {0} dispatch(es) still in flight")]
    ShutdownTimeout(usize),
}

/// Called once a task reaches a terminal status, so the caller (the kernel,
/// via the resolver) can compute newly-ready dependents and finalize the
/// owning workflow. Modeled on `everruns-durable::worker::pool`'s
/// `ActivityHandler` — a boxed async closure held behind an `Arc` rather
/// than a trait object, since the pool needs one fixed callback, not a
/// per-method-name registry of them.
pub type TerminalHandler = Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

enum Outcome {
    Success(Value),
    Retryable(TaskError),
    Fatal(TaskError),
}

/// A pool of concurrent worker flows executing the per-task pipeline.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    backend: Arc<dyn PersistenceBackend>,
    registry: Arc<ProtocolRegistry>,
    events: Arc<EventBus>,
    config: WorkerPoolConfig,
    on_terminal: TerminalHandler,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    root_cancellation: CancellationToken,
    running_tokens: DashMap<String, CancellationToken>,
    active_dispatches: Arc<AtomicUsize>,
    status: RwLock<WorkerPoolStatus>,
    worker_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    reclaim_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        backend: Arc<dyn PersistenceBackend>,
        registry: Arc<ProtocolRegistry>,
        events: Arc<EventBus>,
        config: WorkerPoolConfig,
        on_terminal: TerminalHandler,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            queue,
            backend,
            registry,
            events,
            config,
            on_terminal,
            shutdown_tx,
            shutdown_rx,
            root_cancellation: CancellationToken::new(),
            running_tokens: DashMap::new(),
            active_dispatches: Arc::new(AtomicUsize::new(0)),
            status: RwLock::new(WorkerPoolStatus::Stopped),
            worker_handles: std::sync::Mutex::new(Vec::new()),
            reclaim_handle: std::sync::Mutex::new(None),
        })
    }

    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write().await;
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(worker_count = self.config.worker_count, "starting worker pool");
        let mut handles = self.worker_handles.lock().unwrap();
        for n in 0..self.config.worker_count {
            let pool = self.clone();
            let worker_id = format!("worker-{n}");
            handles.push(tokio::spawn(async move { pool.run_worker_loop(worker_id).await }));
        }
        drop(handles);
        self.start_reclaim_loop();
        Ok(())
    }

    /// Stop accepting new claims; let in-flight dispatches run to
    /// `shutdown_timeout`, then request cooperative cancellation.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write().await;
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.reclaim_handle.lock().unwrap().take() {
            handle.abort();
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.active_dispatches.load(Ordering::SeqCst) == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.active_dispatches.load(Ordering::SeqCst), "shutdown deadline reached, cancelling in-flight dispatches");
                self.root_cancellation.cancel();
                let handles: Vec<_> = self.worker_handles.lock().unwrap().drain(..).collect();
                for handle in handles {
                    let _ = handle.await;
                }
                *self.status.write().await = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout(self.active_dispatches.load(Ordering::SeqCst)));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let handles: Vec<_> = self.worker_handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        *self.status.write().await = WorkerPoolStatus::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    /// Request cooperative cancellation of a single running task, e.g. on
    /// workflow cancel. A no-op if the task isn't currently dispatched.
    pub fn cancel_task(&self, task_id: &str) {
        if let Some(token) = self.running_tokens.get(task_id) {
            token.cancel();
        }
    }

    pub async fn status(&self) -> WorkerPoolStatus {
        *self.status.read().await
    }

    async fn run_worker_loop(self: Arc<Self>, worker_id: String) {
        let mut interval = self.config.poller.min_interval;
        loop {
            if *self.shutdown_rx.borrow() {
                debug!(worker_id, "poll loop: shutdown requested");
                break;
            }

            match self.queue.claim_next(&worker_id).await {
                Ok(Some(task_id)) => {
                    interval = self.config.poller.min_interval;
                    self.dispatch(&task_id).await;
                }
                Ok(None) => {
                    interval = Duration::from_secs_f64((interval.as_secs_f64() * self.config.poller.backoff_multiplier).min(self.config.poller.max_interval.as_secs_f64()));
                    if self.wait_or_shutdown(interval).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id, error = %e, "claim failed");
                    if self.wait_or_shutdown(interval).await {
                        break;
                    }
                }
            }
        }
        debug!(worker_id, "poll loop exited");
    }

    async fn wait_or_shutdown(&self, interval: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    fn start_reclaim_loop(self: &Arc<Self>) {
        let pool = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.stale_reclaim_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.reclaim_stale().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reclaim loop: shutdown requested");
                        break;
                    }
                }
            }
        });
        *self.reclaim_handle.lock().unwrap() = Some(handle);
    }

    async fn reclaim_stale(&self) {
        let pending = match self.backend.load_pending().await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "stale-task scan failed");
                return;
            }
        };
        let now = chrono::Utc::now();
        let mut reclaimed = 0usize;
        for entry in pending.in_flight {
            let age = now.signed_duration_since(entry.claimed_at).to_std().unwrap_or(Duration::ZERO);
            if age >= self.config.stale_threshold {
                if let Err(e) = self.queue.nack(&entry.entry.task_id, Duration::ZERO).await {
                    error!(task_id = %entry.entry.task_id, error = %e, "failed to reclaim stale task");
                } else {
                    reclaimed += 1;
                }
            }
        }
        if reclaimed > 0 {
            info!(count = reclaimed, "reclaimed stale in-flight tasks");
        }
    }

    /// The per-task pipeline (§4.7): load, resolve, substitute, invoke,
    /// classify, persist, notify.
    async fn dispatch(self: &Arc<Self>, task_id: &str) {
        self.active_dispatches.fetch_add(1, Ordering::SeqCst);
        let result = self.dispatch_inner(task_id).await;
        self.active_dispatches.fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = result {
            error!(task_id, error = %e, "dispatch pipeline failed");
        }
    }

    async fn dispatch_inner(self: &Arc<Self>, task_id: &str) -> Result<(), crate::persistence::StoreError> {
        let mut task = self.backend.get_task(task_id).await?;
        if task.status.is_terminal() {
            // Recovery race: already finished by a previous run.
            self.queue.ack(task_id).await.ok();
            return Ok(());
        }

        let (provider_id, outcome) = self.resolve_and_invoke(&mut task).await;

        match outcome {
            Outcome::Success(value) => {
                self.backend.set_task_result(task_id, TaskOutcome::Success(value), TaskStatus::Completed).await?;
                self.queue.ack(task_id).await.ok();
                if let Some(id) = &provider_id {
                    self.registry.mark_dispatch_finished(id);
                }
                self.events.publish(KernelEvent::TaskCompleted {
                    task_id: task_id.to_string(),
                    workflow_id: task.workflow_id,
                    timestamp: chrono::Utc::now(),
                });
                (self.on_terminal)(task_id.to_string()).await;
            }
            Outcome::Retryable(err) => {
                if let Some(id) = &provider_id {
                    self.registry.mark_dispatch_finished(id);
                }
                if task.retry_policy.has_attempts_remaining(task.attempt_count) {
                    let delay = task.retry_policy.delay_for_attempt(task.attempt_count + 1);
                    task.error = Some(err);
                    self.backend.put_task(&task).await?;
                    self.queue.nack(task_id, delay).await.ok();
                    self.events.publish(KernelEvent::TaskRetried {
                        task_id: task_id.to_string(),
                        workflow_id: task.workflow_id,
                        attempt: task.attempt_count,
                        delay_ms: delay.as_millis() as u64,
                        timestamp: chrono::Utc::now(),
                    });
                } else {
                    self.fail_task(task_id, &task, err).await?;
                }
            }
            Outcome::Fatal(err) => {
                if let Some(id) = &provider_id {
                    self.registry.mark_dispatch_finished(id);
                }
                self.fail_task(task_id, &task, err).await?;
            }
        }
        Ok(())
    }

    async fn fail_task(&self, task_id: &str, task: &Task, err: TaskError) -> Result<(), crate::persistence::StoreError> {
        self.backend.set_task_result(task_id, TaskOutcome::Failure(err.clone()), TaskStatus::Failed).await?;
        self.queue.ack(task_id).await.ok();
        self.events.publish(KernelEvent::TaskFailed {
            task_id: task_id.to_string(),
            workflow_id: task.workflow_id,
            error: err,
            timestamp: chrono::Utc::now(),
        });
        (self.on_terminal)(task_id.to_string()).await;
        Ok(())
    }

    /// Resolve a provider, acquire its concurrency slot, substitute params,
    /// and invoke — returning the provider id (for in-flight bookkeeping)
    /// alongside the classified outcome. A saturated provider produces no
    /// outcome directly; the task is nacked with zero delay in place.
    async fn resolve_and_invoke(self: &Arc<Self>, task: &mut Task) -> (Option<String>, Outcome) {
        let (provider_id, provider) = match self.registry.resolve_id(&task.method) {
            Ok(found) => found,
            Err(RegistryError::MethodNotSupported(m)) => {
                return (None, Outcome::Fatal(TaskError::fatal("method_not_supported", format!("no protocol serves method {m}"))));
            }
            Err(RegistryError::NoProviderFound(m)) => {
                return if self.registry.has_unhealthy_candidate(&m) {
                    (None, Outcome::Retryable(TaskError::retryable("no_provider_available", format!("all providers for {m} are unhealthy"))))
                } else {
                    (None, Outcome::Fatal(TaskError::fatal("no_provider_found", format!("no provider registered for {m}"))))
                };
            }
            Err(e) => return (None, Outcome::Fatal(TaskError::fatal("protocol_unknown", e.to_string()))),
        };

        let permit = match self.registry.try_acquire_slot(&provider_id) {
            Ok(permit) => permit,
            Err(()) => {
                if let Err(e) = self.queue.nack(&task.id, Duration::ZERO).await {
                    error!(task_id = %task.id, error = %e, "failed to requeue saturated task");
                }
                return (None, Outcome::Retryable(TaskError::retryable("provider_saturated", "provider at concurrency cap")));
            }
        };

        let substituted = match self.resolve_params(task).await {
            Ok(v) => v,
            Err(SubstitutionError::UnresolvedReference { task_id, path }) => {
                return (
                    Some(provider_id),
                    Outcome::Fatal(TaskError::fatal("unresolved_reference", format!("${{{task_id}.{path}}} did not resolve"))),
                );
            }
        };

        task.attempt_count += 1;
        if let Err(e) = self.backend.put_task(task).await {
            error!(task_id = %task.id, error = %e, "failed to persist attempt count");
        }

        self.registry.mark_dispatch_started(&provider_id);
        let token = CancellationToken::new();
        let child = self.root_cancellation.child_token();
        self.running_tokens.insert(task.id.clone(), token.clone());

        self.events.publish(KernelEvent::TaskStarted {
            task_id: task.id.clone(),
            workflow_id: task.workflow_id,
            attempt: task.attempt_count,
            provider_id: provider_id.clone(),
            timestamp: chrono::Utc::now(),
        });

        let timeout = task.timeout_seconds.map(Duration::from_secs).unwrap_or(self.config.default_task_timeout);
        let invocation = provider.invoke(&task.method, substituted, token.clone());
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, invocation) => {
                match result {
                    Ok(Ok(value)) => Outcome::Success(value),
                    Ok(Err(err)) if err.retryable => Outcome::Retryable(err),
                    Ok(Err(err)) => Outcome::Fatal(err),
                    Err(_) => {
                        token.cancel();
                        Outcome::Retryable(TaskError::retryable("timeout", format!("task exceeded {}s timeout", timeout.as_secs())))
                    }
                }
            }
            _ = child.cancelled() => {
                token.cancel();
                Outcome::Retryable(TaskError::retryable("cancelled", "cooperative cancellation requested"))
            }
        };

        self.running_tokens.remove(&task.id);
        drop(permit);
        (Some(provider_id), outcome)
    }

    async fn resolve_params(&self, task: &Task) -> Result<Value, SubstitutionError> {
        let mut results = HashMap::new();
        for dep_id in crate::resolver::referenced_task_ids(&task.params) {
            if let Ok(dep_task) = self.backend.get_task(&dep_id).await {
                results.insert(dep_id, dep_task.result.unwrap_or(Value::Null));
            }
        }
        substitution::substitute(&task.params, |id| results.get(id))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
