//! Reliability primitives shared by the execution engine.
//!
//! - [`RetryPolicy`] — jittered exponential backoff for retryable task failures.

mod retry;

pub use retry::RetryPolicy;
