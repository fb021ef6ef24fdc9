//! Dispatch worker
//!
//! This module provides:
//! - [`Worker`] - the control loop driving one job on one pool
//! - [`WorkerConfig`] - environment-driven configuration
//! - [`ShutdownHandle`] - graceful stop from another task

mod config;
mod runner;

pub use config::{ConfigError, WorkerConfig};
pub use runner::{ExitReason, ShutdownHandle, Worker, WorkerError, WorkerReport, WorkerState};
