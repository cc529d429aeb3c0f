//! Lockstep common library
//!
//! Configuration, errors and metrics shared by the coordinator and workers.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::LockstepConfig;
pub use error::{LockstepError, Result};
pub use metrics::{MetricsRegistry, METRICS};
