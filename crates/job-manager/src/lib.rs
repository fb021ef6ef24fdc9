//! Scanfleet job manager
//!
//! Process-level pieces around the dispatch worker: telemetry bootstrap and
//! the local in-memory environment.

pub mod local;
pub mod telemetry;

pub use local::{LocalConfig, LocalEnvironment};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
