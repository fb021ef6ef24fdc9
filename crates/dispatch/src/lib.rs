//! # Pool Dispatch Engine
//!
//! Admission control and task dispatch for a batch execution pool.
//!
//! ## Features
//!
//! - **Closed-loop admission**: each control cycle estimates how many tasks the pool can absorb
//! - **Request selection**: work requests are routed to process, delete or skip by run state,
//!   retry count and age
//! - **Chunked dispatch**: tasks are submitted in parallel chunks with per-task outcomes
//! - **At-least-once draining**: queue messages are deleted only once their task is queued
//! - **Reconciliation**: abnormally terminated tasks are written back to their work requests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                              │
//! │  (sampling -> admitting -> draining, drain-wait, terminate)  │
//! └─────────────────────────────────────────────────────────────┘
//!        │                 │                    │
//!        ▼                 ▼                    ▼
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────────────────┐
//! │ PoolLoad     │  │  WorkQueue   │  │     TaskDispatcher       │
//! │ Generator    │  │ (visibility, │  │ (job lifecycle, chunked  │
//! │ (admission)  │  │  dead-letter)│  │  submission, metrics)    │
//! └──────────────┘  └──────────────┘  └──────────────────────────┘
//!                          │                    │
//!                          ▼                    ▼
//!                   ┌──────────────┐  ┌──────────────────────────┐
//!                   │ WorkItemStore│  │      BatchBackend        │
//!                   └──────────────┘  └──────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use scanfleet_dispatch::prelude::*;
//!
//! let dispatcher = TaskDispatcher::new(backend, config.dispatcher.clone());
//! let mut worker = Worker::new(config, store, queue, dispatcher);
//!
//! let shutdown = worker.shutdown_handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown.shutdown();
//! });
//!
//! let report = worker.run().await?;
//! ```

pub mod batch;
pub mod load;
pub mod persistence;
pub mod reliability;
pub mod selection;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::batch::{
        BackendError, BatchBackend, DispatchError, DispatcherConfig, InMemoryBatchBackend,
        JobTask, JobTaskState, TaskDispatcher,
    };
    pub use crate::load::{LoadConfig, PoolLoadGenerator, PoolLoadSnapshot, PoolMetrics};
    pub use crate::persistence::{
        InMemoryWorkItemStore, InMemoryWorkQueue, QueueConfig, QueueError, QueueMessage,
        RunState, StoreError, WorkItemStore, WorkQueue, WorkRequest,
    };
    pub use crate::reliability::{update_with_retry, RetryPolicy};
    pub use crate::selection::{classify, Condition, Disposition, RequestSelector};
    pub use crate::worker::{
        ExitReason, ShutdownHandle, Worker, WorkerConfig, WorkerError, WorkerReport, WorkerState,
    };
}

// Re-export key types at crate root
pub use batch::{BatchBackend, DispatchError, TaskDispatcher};
pub use load::{PoolLoadGenerator, PoolLoadSnapshot, PoolMetrics};
pub use persistence::{StoreError, WorkItemStore, WorkQueue, WorkRequest};
pub use reliability::RetryPolicy;
pub use selection::RequestSelector;
pub use worker::{Worker, WorkerConfig, WorkerError, WorkerReport};
