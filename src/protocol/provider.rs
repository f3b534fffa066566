use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::model::TaskError;

/// A provider's self-reported health, updated by the lifecycle manager's
/// background probe loop and read by the registry at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl Default for HealthState {
    fn default() -> Self {
        HealthState::Unknown
    }
}

/// Errors a provider can report from its one-shot lifecycle hooks.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider initialization failed: {0}")]
    InitializationFailed(String),

    #[error("provider health probe failed: {0}")]
    HealthProbeFailed(String),

    #[error("provider release failed: {0}")]
    ReleaseFailed(String),
}

/// A running backend that implements one or more protocols.
///
/// Held polymorphically as `Arc<dyn Provider>` everywhere — the kernel never
/// downcasts, the same discipline `everruns-durable` uses for
/// `Arc<dyn WorkflowEventStore>` and `Box<dyn AnyWorkflow>`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// One-shot setup; may fail, in which case the provider is registered as
    /// `unhealthy` rather than aborting kernel startup.
    async fn initialize(&self) -> Result<(), ProviderError>;

    /// Pure; the method set this instance can serve right now.
    fn supported_methods(&self) -> HashSet<String>;

    /// Cheap liveness check. A probe that errors is treated as `unhealthy`,
    /// never propagated as a hard failure.
    async fn health_probe(&self) -> Result<HealthState, ProviderError>;

    /// The hot path: invoke `method` with already-substituted `params`,
    /// cooperatively cancellable via `cancellation_token`.
    async fn invoke(&self, method: &str, params: Value, cancellation_token: CancellationToken) -> Result<Value, TaskError>;

    /// One-shot, exactly-once teardown, enforced by the lifecycle manager
    /// rather than by this method itself.
    async fn release(&self) -> Result<(), ProviderError>;
}
