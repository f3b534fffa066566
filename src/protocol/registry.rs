use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::provider::{HealthState, Provider};
use super::spec::ProtocolSpec;

/// Errors surfaced by the registry; all of them propagate to the caller of
/// the task that triggered them.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("protocol already registered: {0}")]
    DuplicateProtocol(String),

    #[error("unknown protocol: {0}")]
    ProtocolUnknown(String),

    #[error("provider's supported methods are not a subset of protocol {0}'s methods")]
    MethodsNotSubset(String),

    #[error("no provider found for method: {0}")]
    NoProviderFound(String),

    #[error("method not supported by any registered protocol: {0}")]
    MethodNotSupported(String),
}

struct ProviderEntry {
    protocol_id: String,
    supported_methods: HashSet<String>,
    handle: Arc<dyn Provider>,
    health: std::sync::atomic::AtomicU8,
    in_flight: AtomicU32,
    registration_order: u64,
    /// Enforces C3's per-provider concurrency cap; `None` means unbounded.
    concurrency: Option<Arc<Semaphore>>,
}

fn health_to_u8(h: HealthState) -> u8 {
    match h {
        HealthState::Healthy => 0,
        HealthState::Degraded => 1,
        HealthState::Unhealthy => 2,
        HealthState::Unknown => 3,
    }
}

fn u8_to_health(v: u8) -> HealthState {
    match v {
        0 => HealthState::Healthy,
        1 => HealthState::Degraded,
        2 => HealthState::Unhealthy,
        _ => HealthState::Unknown,
    }
}

/// Holds `protocol_id -> ProtocolSpec` and `provider_id -> ProviderEntry`.
///
/// Type-erased the way `everruns-durable::engine::registry::WorkflowRegistry`
/// type-erases workflow construction behind `AnyWorkflow`: a `dyn Provider`
/// trait object stands in for `AnyWorkflow` here. Backed by `DashMap` rather
/// than the teacher's `HashMap` because the registry is read from every
/// dispatch, by every worker, and needs concurrent reads without a global
/// lock.
pub struct ProtocolRegistry {
    protocols: DashMap<String, ProtocolSpec>,
    providers: DashMap<String, ProviderEntry>,
    next_registration_order: AtomicU64,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self {
            protocols: DashMap::new(),
            providers: DashMap::new(),
            next_registration_order: AtomicU64::new(0),
        }
    }

    /// Called once per protocol during init; rejects duplicates.
    pub fn register_protocol(&self, spec: ProtocolSpec) -> Result<(), RegistryError> {
        if self.protocols.contains_key(&spec.identifier) {
            return Err(RegistryError::DuplicateProtocol(spec.identifier));
        }
        self.protocols.insert(spec.identifier.clone(), spec);
        Ok(())
    }

    /// Binds a running handle to a protocol; rejects if the handle's
    /// declared supported-method set is not a subset of the protocol's
    /// methods. `concurrency_cap` of `None` means unbounded.
    pub fn register_provider(
        &self,
        provider_id: impl Into<String>,
        protocol_id: &str,
        handle: Arc<dyn Provider>,
        concurrency_cap: Option<usize>,
    ) -> Result<(), RegistryError> {
        let spec = self
            .protocols
            .get(protocol_id)
            .ok_or_else(|| RegistryError::ProtocolUnknown(protocol_id.to_string()))?;

        let supported_methods = handle.supported_methods();
        if !supported_methods.iter().all(|m| spec.has_method(m)) {
            return Err(RegistryError::MethodsNotSubset(protocol_id.to_string()));
        }
        drop(spec);

        let order = self.next_registration_order.fetch_add(1, Ordering::Relaxed);
        self.providers.insert(
            provider_id.into(),
            ProviderEntry {
                protocol_id: protocol_id.to_string(),
                supported_methods,
                handle,
                health: std::sync::atomic::AtomicU8::new(health_to_u8(HealthState::Unknown)),
                in_flight: AtomicU32::new(0),
                registration_order: order,
                concurrency: concurrency_cap.map(|cap| Arc::new(Semaphore::new(cap))),
            },
        );
        Ok(())
    }

    /// Try to acquire a concurrency slot for `provider_id`. Returns `Ok(None)`
    /// if the provider has no cap (always permitted), `Ok(Some(permit))` if a
    /// slot was free, `Err(())` if the provider is saturated — the caller
    /// (a worker) should nack the task with zero delay and continue.
    pub fn try_acquire_slot(&self, provider_id: &str) -> Result<Option<OwnedSemaphorePermit>, ()> {
        let Some(entry) = self.providers.get(provider_id) else {
            return Ok(None);
        };
        match &entry.concurrency {
            None => Ok(None),
            Some(semaphore) => semaphore.clone().try_acquire_owned().map(Some).map_err(|_| ()),
        }
    }

    /// Given a fully-qualified method name, pick a provider implementing it.
    /// Tie-break: (1) healthy before degraded, (2) lowest current in-flight
    /// count, (3) registration order. Unhealthy providers are excluded.
    pub fn resolve(&self, method: &str) -> Result<Arc<dyn Provider>, RegistryError> {
        let (provider_id, _) = self.resolve_id(method)?;
        Ok(self.providers.get(&provider_id).expect("resolved id must exist").handle.clone())
    }

    /// As [`Self::resolve`], but also returns the provider's id so the
    /// caller can record/release an in-flight slot.
    pub fn resolve_id(&self, method: &str) -> Result<(String, Arc<dyn Provider>), RegistryError> {
        let any_method_known = self.protocols.iter().any(|p| p.has_method(method));

        let mut best: Option<(String, u8, u32, u64)> = None;
        for entry in self.providers.iter() {
            if !entry.supported_methods.contains(method) {
                continue;
            }
            let health = u8_to_health(entry.health.load(Ordering::Relaxed));
            if health == HealthState::Unhealthy {
                continue;
            }
            let candidate = (
                entry.key().clone(),
                health_to_u8(health),
                entry.in_flight.load(Ordering::Relaxed),
                entry.registration_order,
            );
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    if (candidate.1, candidate.2, candidate.3) < (current.1, current.2, current.3) {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }

        match best {
            Some((provider_id, ..)) => {
                let handle = self.providers.get(&provider_id).expect("must exist").handle.clone();
                Ok((provider_id, handle))
            }
            None if any_method_known => Err(RegistryError::NoProviderFound(method.to_string())),
            None => Err(RegistryError::MethodNotSupported(method.to_string())),
        }
    }

    /// Whether any registered (non-unhealthy) provider could eventually
    /// serve `method` once it recovers — used by the engine to decide
    /// whether `NoProviderFound` should be treated as retryable.
    pub fn has_unhealthy_candidate(&self, method: &str) -> bool {
        self.providers.iter().any(|entry| {
            entry.supported_methods.contains(method) && u8_to_health(entry.health.load(Ordering::Relaxed)) == HealthState::Unhealthy
        })
    }

    pub fn set_health(&self, provider_id: &str, health: HealthState) {
        if let Some(entry) = self.providers.get(provider_id) {
            entry.health.store(health_to_u8(health), Ordering::Relaxed);
        }
    }

    pub fn health_of(&self, provider_id: &str) -> Option<HealthState> {
        self.providers.get(provider_id).map(|e| u8_to_health(e.health.load(Ordering::Relaxed)))
    }

    pub fn mark_dispatch_started(&self, provider_id: &str) {
        if let Some(entry) = self.providers.get(provider_id) {
            entry.in_flight.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn mark_dispatch_finished(&self, provider_id: &str) {
        if let Some(entry) = self.providers.get(provider_id) {
            entry.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Diagnostics: provider ids bound to a given protocol.
    pub fn list_providers_for(&self, protocol_id: &str) -> Vec<String> {
        self.providers
            .iter()
            .filter(|e| e.protocol_id == protocol_id)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Every registered provider id, for the lifecycle manager to iterate.
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn provider_handle(&self, provider_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(provider_id).map(|e| e.handle.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::spec::MethodSpec;
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    struct StubProvider {
        methods: HashSet<String>,
    }

    #[async_trait]
    impl Provider for StubProvider {
        async fn initialize(&self) -> Result<(), super::super::provider::ProviderError> {
            Ok(())
        }
        fn supported_methods(&self) -> HashSet<String> {
            self.methods.clone()
        }
        async fn health_probe(&self) -> Result<HealthState, super::super::provider::ProviderError> {
            Ok(HealthState::Healthy)
        }
        async fn invoke(&self, _method: &str, params: Value, _token: CancellationToken) -> Result<Value, crate::model::TaskError> {
            Ok(params)
        }
        async fn release(&self) -> Result<(), super::super::provider::ProviderError> {
            Ok(())
        }
    }

    fn stub(methods: &[&str]) -> Arc<dyn Provider> {
        Arc::new(StubProvider {
            methods: methods.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn register_provider_rejects_methods_outside_protocol() {
        let registry = ProtocolRegistry::new();
        registry
            .register_protocol(ProtocolSpec::new("llm/v1", vec![MethodSpec::new("llm/generate")]))
            .unwrap();
        let err = registry.register_provider("p1", "llm/v1", stub(&["llm/generate", "llm/complete"]), None).unwrap_err();
        assert!(matches!(err, RegistryError::MethodsNotSubset(_)));
    }

    #[test]
    fn resolve_excludes_unhealthy_providers() {
        let registry = ProtocolRegistry::new();
        registry
            .register_protocol(ProtocolSpec::new("llm/v1", vec![MethodSpec::new("llm/generate")]))
            .unwrap();
        registry.register_provider("p1", "llm/v1", stub(&["llm/generate"]), None).unwrap();
        registry.set_health("p1", HealthState::Unhealthy);

        let err = registry.resolve("llm/generate").unwrap_err();
        assert!(matches!(err, RegistryError::NoProviderFound(_)));
    }

    #[test]
    fn resolve_prefers_healthy_over_degraded() {
        let registry = ProtocolRegistry::new();
        registry
            .register_protocol(ProtocolSpec::new("llm/v1", vec![MethodSpec::new("llm/generate")]))
            .unwrap();
        registry.register_provider("degraded", "llm/v1", stub(&["llm/generate"]), None).unwrap();
        registry.set_health("degraded", HealthState::Degraded);
        registry.register_provider("healthy", "llm/v1", stub(&["llm/generate"]), None).unwrap();
        registry.set_health("healthy", HealthState::Healthy);

        let (id, _) = registry.resolve_id("llm/generate").unwrap();
        assert_eq!(id, "healthy");
    }

    #[test]
    fn resolve_breaks_remaining_ties_by_registration_order() {
        let registry = ProtocolRegistry::new();
        registry
            .register_protocol(ProtocolSpec::new("llm/v1", vec![MethodSpec::new("llm/generate")]))
            .unwrap();
        registry.register_provider("first", "llm/v1", stub(&["llm/generate"]), None).unwrap();
        registry.register_provider("second", "llm/v1", stub(&["llm/generate"]), None).unwrap();
        registry.set_health("first", HealthState::Healthy);
        registry.set_health("second", HealthState::Healthy);

        let (id, _) = registry.resolve_id("llm/generate").unwrap();
        assert_eq!(id, "first");
    }

    #[test]
    fn unknown_method_across_all_protocols_is_method_not_supported() {
        let registry = ProtocolRegistry::new();
        registry
            .register_protocol(ProtocolSpec::new("llm/v1", vec![MethodSpec::new("llm/generate")]))
            .unwrap();
        let err = registry.resolve("code/execute").unwrap_err();
        assert!(matches!(err, RegistryError::MethodNotSupported(_)));
    }
}
