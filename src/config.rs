//! Kernel configuration, in the style of `everruns-durable`'s
//! `WorkerPoolConfig` / `ExecutorConfig`: a serde-derived struct with a
//! `Default` impl and `with_*` builder methods, plus a `duration_millis`
//! serde helper for human-readable duration fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::backpressure::BackpressureConfig;

/// Top-level kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Total concurrent worker flows (C7).
    pub worker_count: usize,

    /// Soft cap on queue depth; `None` disables backpressure.
    pub queue_soft_cap: Option<usize>,
    pub queue_backpressure: BackpressureConfig,

    /// How often the lifecycle manager probes provider health.
    #[serde(with = "duration_millis")]
    pub health_probe_interval: Duration,

    /// Per-provider deadline for `release()` during shutdown.
    #[serde(with = "duration_millis")]
    pub provider_release_deadline: Duration,

    /// In-flight entries older than this are considered abandoned and
    /// re-queued on kernel start.
    #[serde(with = "duration_millis")]
    pub visibility_timeout: Duration,

    /// How long `stop()` waits for in-flight tasks to ack before requesting
    /// cooperative cancellation.
    #[serde(with = "duration_millis")]
    pub shutdown_grace_period: Duration,

    /// Broadcast channel capacity for [`crate::events::EventBus`].
    pub event_channel_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            queue_soft_cap: None,
            queue_backpressure: BackpressureConfig::default(),
            health_probe_interval: Duration::from_secs(15),
            provider_release_deadline: Duration::from_secs(10),
            visibility_timeout: Duration::from_secs(60),
            shutdown_grace_period: Duration::from_secs(30),
            event_channel_capacity: 1024,
        }
    }
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_queue_soft_cap(mut self, cap: usize) -> Self {
        self.queue_soft_cap = Some(cap);
        self
    }

    pub fn with_health_probe_interval(mut self, interval: Duration) -> Self {
        self.health_probe_interval = interval;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace_period(mut self, period: Duration) -> Self {
        self.shutdown_grace_period = period;
        self
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = KernelConfig::default();
        assert_eq!(config.worker_count, 10);
        assert!(config.queue_soft_cap.is_none());
    }

    #[test]
    fn round_trips_through_json() {
        let config = KernelConfig::new().with_worker_count(4).with_queue_soft_cap(500);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: KernelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.worker_count, 4);
        assert_eq!(parsed.queue_soft_cap, Some(500));
    }
}
