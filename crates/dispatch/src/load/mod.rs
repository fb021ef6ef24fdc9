//! Pool admission control
//!
//! This module provides:
//! - [`PoolLoadGenerator`] - per-cycle estimate of how many tasks the pool can absorb
//! - [`PoolLoadState`] - the controller state, advanced by a pure transition function
//! - [`PoolMetrics`] / [`PoolLoadSnapshot`] - the controller's input and output

mod generator;

pub use generator::{LoadConfig, PoolLoadGenerator, PoolLoadSnapshot, PoolLoadState, PoolMetrics};
