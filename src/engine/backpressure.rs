//! Backpressure for the task queue (C4).
//!
//! Generalized from `everruns-durable::worker::backpressure::BackpressureState`,
//! which tracked worker-slot occupancy (how many of N concurrency permits are
//! in use); here the same high/low watermark hysteresis tracks queue depth
//! against a soft cap instead.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Controls when the queue starts rejecting new enqueues based on depth.
///
/// # Example
///
/// ```
/// use gleitzeit_kernel::engine::backpressure::BackpressureConfig;
///
/// let config = BackpressureConfig::default()
///     .with_high_watermark(0.85)
///     .with_low_watermark(0.65);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Stop accepting enqueues once depth exceeds this ratio of the soft cap.
    pub high_watermark: f64,
    /// Resume accepting enqueues once depth drops below this ratio.
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(
                "low_watermark must be less than high_watermark".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// Tracks queue depth and decides when `enqueue` should accept or reject
/// with `QueueFull`. Uses atomics so every worker and submitter can read
/// current state without a lock.
pub struct BackpressureState {
    config: BackpressureConfig,
    queue_depth: AtomicUsize,
    soft_cap: usize,
    accepting: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig, soft_cap: usize) -> Self {
        Self {
            config,
            queue_depth: AtomicUsize::new(0),
            soft_cap,
            accepting: AtomicBool::new(true),
            reason: RwLock::new(None),
        }
    }

    /// Whether a new enqueue should be accepted right now.
    ///
    /// Implements hysteresis via high/low watermarks so depth oscillating
    /// around one threshold doesn't flap accept/reject on every call.
    pub fn should_accept(&self) -> bool {
        let currently_accepting = self.accepting.load(Ordering::Relaxed);
        let ratio = self.depth_ratio();

        if currently_accepting {
            if ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                *self.reason.write().unwrap() = Some(format!("queue depth ratio {:.1}% exceeds high watermark", ratio * 100.0));
                return false;
            }
            true
        } else if ratio <= self.config.low_watermark {
            self.accepting.store(true, Ordering::Relaxed);
            *self.reason.write().unwrap() = None;
            true
        } else {
            false
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn soft_cap(&self) -> usize {
        self.soft_cap
    }

    pub fn depth_ratio(&self) -> f64 {
        self.queue_depth.load(Ordering::Relaxed) as f64 / self.soft_cap.max(1) as f64
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().unwrap().clone()
    }

    /// Record a successful enqueue.
    pub fn task_enqueued(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a claim, ack of a terminal task, or any other depth decrease.
    pub fn task_dequeued(&self) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = BackpressureConfig::default();
        assert_eq!(config.high_watermark, 0.9);
        assert_eq!(config.low_watermark, 0.7);
    }

    #[test]
    fn config_validation_rejects_inverted_watermarks() {
        let invalid = BackpressureConfig::new().with_high_watermark(0.5).with_low_watermark(0.8);
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn accepts_initially() {
        let state = BackpressureState::new(BackpressureConfig::default(), 10);
        assert!(state.should_accept());
        assert!(state.is_accepting());
    }

    #[test]
    fn stops_at_high_watermark() {
        let config = BackpressureConfig::new().with_high_watermark(0.8).with_low_watermark(0.5);
        let state = BackpressureState::new(config, 10);
        for _ in 0..8 {
            state.task_enqueued();
        }
        assert!(!state.should_accept());
        assert!(state.reason().is_some());
    }

    #[test]
    fn hysteresis_prevents_oscillation() {
        let config = BackpressureConfig::new().with_high_watermark(0.8).with_low_watermark(0.5);
        let state = BackpressureState::new(config, 10);
        for _ in 0..8 {
            state.task_enqueued();
        }
        assert!(!state.should_accept());

        state.task_dequeued(); // 70% - between watermarks
        assert!(!state.should_accept());

        for _ in 0..2 {
            state.task_dequeued();
        } // 50%
        assert!(state.should_accept());
    }
}
