//! Reliability patterns for dispatch
//!
//! This module provides:
//! - [`RetryPolicy`] - Exponential backoff with jitter
//! - [`update_with_retry`] - Bounded retry-on-conflict for work request updates

mod conflict;
mod retry;

pub use conflict::update_with_retry;
pub use retry::RetryPolicy;
