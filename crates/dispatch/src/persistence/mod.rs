//! Persistence layer for dispatch
//!
//! This module provides:
//! - [`WorkItemStore`] trait for work request records with optimistic concurrency
//! - [`WorkQueue`] trait for a visibility-timeout message queue with dead-lettering
//! - [`InMemoryWorkItemStore`] and [`InMemoryWorkQueue`] for testing and local runs

mod memory;
mod memory_queue;
mod queue;
mod store;

pub use memory::InMemoryWorkItemStore;
pub use memory_queue::InMemoryWorkQueue;
pub use queue::{QueueConfig, QueueError, QueueMessage, RequestMessage, WorkQueue};
pub use store::{RequestPage, RunState, StoreError, WorkItemStore, WorkRequest};

pub(crate) use queue::duration_millis;
