//! # Gleitzeit workflow execution kernel
//!
//! A task-and-workflow orchestration engine for coordinating heterogeneous
//! remote work — LLM calls, sandboxed code execution, tool invocations —
//! behind a uniform provider contract.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Kernel                              │
//! │  (owns every subsystem; submit/query/cancel surface)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!            ┌─────────────────┼─────────────────┐
//!            ▼                 ▼                 ▼
//! ┌────────────────────┐ ┌─────────────┐ ┌────────────────────┐
//! │  DependencyResolver │ │  TaskQueue  │ │  ProtocolRegistry   │
//! │  (C5)               │ │  (C4)       │ │  + LifecycleMgr     │
//! └────────────────────┘ └─────────────┘ │  (C2/C3)            │
//!                              │         └────────────────────┘
//!                              ▼                 │
//!                       ┌─────────────┐          │
//!                       │ WorkerPool  │◀─────────┘
//!                       │ (C7)        │
//!                       └─────────────┘
//!                              │
//!                              ▼
//!                    ┌──────────────────┐
//!                    │ PersistenceBackend│
//!                    │ (C1)              │
//!                    └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use gleitzeit_kernel::prelude::*;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(gleitzeit_kernel::persistence::memory::InMemoryBackend::new());
//! let kernel = Kernel::new(backend, KernelConfig::default());
//! kernel.register_protocol(ProtocolSpec::new("llm/v1", vec![MethodSpec::new("llm/generate")]))?;
//! kernel.register_provider("openai", "llm/v1", my_provider, Some(8))?;
//! kernel.start().await?;
//!
//! let workflow_id = kernel.submit_workflow(submission).await?;
//! let finished = kernel.wait_for_workflow(workflow_id, std::time::Duration::from_secs(60)).await?;
//! ```

pub mod config;
pub mod engine;
pub mod events;
pub mod kernel;
pub mod model;
pub mod persistence;
pub mod protocol;
pub mod queue;
pub mod reliability;
pub mod resolver;
pub mod substitution;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::KernelConfig;
    pub use crate::engine::{TerminalHandler, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
    pub use crate::events::{EventBus, KernelEvent};
    pub use crate::kernel::{Kernel, KernelError};
    pub use crate::model::{
        FailureStrategy, Priority, Task, TaskError, TaskStatus, TaskSubmission, Workflow, WorkflowStatus, WorkflowSubmission,
    };
    pub use crate::persistence::{PersistenceBackend, StoreError, TaskOutcome, WorkflowFilter};
    pub use crate::protocol::{HealthState, MethodSpec, ProtocolRegistry, ProtocolSpec, Provider, ProviderError};
    pub use crate::queue::{TaskQueue, TaskQueueConfig};
    pub use crate::reliability::RetryPolicy;
}

pub use config::KernelConfig;
pub use kernel::{Kernel, KernelError};
