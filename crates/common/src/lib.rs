//! SwapServe common library
//!
//! Shared code used across the coordinator, shard workers, and the
//! trainer client: configuration, errors, metrics, tensor byte codecs,
//! and the collective process group.

pub mod collective;
pub mod config;
pub mod error;
pub mod metrics;
pub mod tensor;

// Re-export commonly used types
pub use config::ServeConfig;
pub use error::{Result, SwapServeError};
pub use metrics::{MetricsRegistry, METRICS};
