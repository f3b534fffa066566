//! Execution engine: backpressure gating for the queue (C4) and the worker
//! pool that claims, dispatches, and resolves tasks (C7).

pub mod backpressure;
pub mod worker;

pub use backpressure::{BackpressureConfig, BackpressureState};
pub use worker::{PollerConfig, TerminalHandler, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
