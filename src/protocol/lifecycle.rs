use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::provider::HealthState;
use super::registry::ProtocolRegistry;
use crate::events::{EventBus, KernelEvent};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("lifecycle manager already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out with {0} provider(s) still releasing")]
    ShutdownTimeout(usize),
}

struct ReleaseGuard {
    released: AtomicBool,
}

/// Owns init/shutdown of every provider handle registered in a
/// [`ProtocolRegistry`]; guarantees exactly-once cleanup on kernel stop.
///
/// The health loop and the shutdown quiescence handshake are built the same
/// way `everruns-durable::worker::pool::WorkerPool` runs its heartbeat and
/// reclaim loops: `tokio::select!` over an interval ticker and a
/// `tokio::sync::watch` shutdown receiver.
pub struct ProviderLifecycleManager {
    registry: Arc<ProtocolRegistry>,
    events: Arc<EventBus>,
    health_probe_interval: Duration,
    shutdown_deadline_per_provider: Duration,
    release_guards: dashmap::DashMap<String, Arc<ReleaseGuard>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    health_loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProviderLifecycleManager {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        events: Arc<EventBus>,
        health_probe_interval: Duration,
        shutdown_deadline_per_provider: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            registry,
            events,
            health_probe_interval,
            shutdown_deadline_per_provider,
            release_guards: dashmap::DashMap::new(),
            shutdown_tx,
            shutdown_rx,
            health_loop_handle: std::sync::Mutex::new(None),
        }
    }

    /// Called once at kernel start. Sequentially initializes every
    /// registered provider; a single failure is logged and the provider is
    /// marked `unhealthy` rather than aborting startup. Starts the
    /// background health loop afterward.
    #[instrument(skip(self))]
    pub async fn init_all(&self) {
        for provider_id in self.registry.provider_ids() {
            self.release_guards.insert(provider_id.clone(), Arc::new(ReleaseGuard { released: AtomicBool::new(false) }));

            let Some(handle) = self.registry.provider_handle(&provider_id) else { continue };
            match handle.initialize().await {
                Ok(()) => {
                    info!(provider_id = %provider_id, "provider initialized");
                    self.registry.set_health(&provider_id, HealthState::Unknown);
                }
                Err(e) => {
                    error!(provider_id = %provider_id, error = %e, "provider initialization failed");
                    self.registry.set_health(&provider_id, HealthState::Unhealthy);
                }
            }
        }
        self.start_health_loop();
    }

    fn start_health_loop(&self) {
        let registry = self.registry.clone();
        let events = self.events.clone();
        let interval = self.health_probe_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for provider_id in registry.provider_ids() {
                            let Some(handle) = registry.provider_handle(&provider_id) else { continue };
                            let health = match handle.health_probe().await {
                                Ok(h) => h,
                                Err(e) => {
                                    warn!(provider_id = %provider_id, error = %e, "health probe failed");
                                    HealthState::Unhealthy
                                }
                            };
                            let previous = registry.health_of(&provider_id);
                            if previous != Some(health) {
                                debug!(provider_id = %provider_id, ?health, "provider health changed");
                                events.publish(KernelEvent::ProviderHealthChanged {
                                    provider_id: provider_id.clone(),
                                    health,
                                    timestamp: Utc::now(),
                                });
                            }
                            registry.set_health(&provider_id, health);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("health loop: shutdown requested");
                            break;
                        }
                    }
                }
            }
        });
        *self.health_loop_handle.lock().unwrap() = Some(handle);
    }

    /// Invoked on kernel stop. Releases every provider, bounded by
    /// `shutdown_deadline_per_provider` each; failures are logged but don't
    /// stop other providers. A provider released once is never released
    /// twice, even if `shutdown_all` is called concurrently from two paths.
    #[instrument(skip(self))]
    pub async fn shutdown_all(&self) -> Result<(), LifecycleError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.health_loop_handle.lock().unwrap().take() {
            handle.abort();
        }

        let mut timed_out = 0usize;
        for provider_id in self.registry.provider_ids() {
            if !self.try_claim_release(&provider_id) {
                continue; // already released by a concurrent shutdown
            }
            let Some(handle) = self.registry.provider_handle(&provider_id) else { continue };
            match tokio::time::timeout(self.shutdown_deadline_per_provider, handle.release()).await {
                Ok(Ok(())) => info!(provider_id = %provider_id, "provider released"),
                Ok(Err(e)) => error!(provider_id = %provider_id, error = %e, "provider release failed"),
                Err(_) => {
                    timed_out += 1;
                    warn!(provider_id = %provider_id, "provider release timed out");
                }
            }
        }

        if timed_out > 0 {
            return Err(LifecycleError::ShutdownTimeout(timed_out));
        }
        Ok(())
    }

    /// Atomic compare-and-set guard so `release()` is invoked exactly once
    /// per provider even under concurrent shutdown calls.
    fn try_claim_release(&self, provider_id: &str) -> bool {
        let guard = self
            .release_guards
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(ReleaseGuard { released: AtomicBool::new(false) }))
            .clone();
        guard.released.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    /// Diagnostics: providers whose release has already completed.
    pub fn released_providers(&self) -> HashSet<String> {
        self.release_guards
            .iter()
            .filter(|e| e.released.load(Ordering::SeqCst))
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::provider::{Provider, ProviderError};
    use crate::protocol::spec::{MethodSpec, ProtocolSpec};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;
    use tokio_util::sync::CancellationToken;

    struct CountingProvider {
        release_count: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        async fn initialize(&self) -> Result<(), ProviderError> {
            Ok(())
        }
        fn supported_methods(&self) -> HashSet<String> {
            ["llm/generate".to_string()].into_iter().collect()
        }
        async fn health_probe(&self) -> Result<HealthState, ProviderError> {
            Ok(HealthState::Healthy)
        }
        async fn invoke(&self, _m: &str, p: Value, _t: CancellationToken) -> Result<Value, crate::model::TaskError> {
            Ok(p)
        }
        async fn release(&self) -> Result<(), ProviderError> {
            self.release_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_releases_each_provider_exactly_once() {
        let registry = Arc::new(ProtocolRegistry::new());
        registry
            .register_protocol(ProtocolSpec::new("llm/v1", vec![MethodSpec::new("llm/generate")]))
            .unwrap();
        let release_count = Arc::new(AtomicU32::new(0));
        registry
            .register_provider("p1", "llm/v1", Arc::new(CountingProvider { release_count: release_count.clone() }), None)
            .unwrap();

        let events = Arc::new(EventBus::new(16));
        let manager = ProviderLifecycleManager::new(registry, events, Duration::from_secs(60), Duration::from_secs(5));
        manager.init_all().await;
        manager.shutdown_all().await.unwrap();
        manager.shutdown_all().await.unwrap();

        assert_eq!(release_count.load(Ordering::SeqCst), 1);
    }
}
