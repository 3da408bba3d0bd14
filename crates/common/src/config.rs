//! Configuration for the SwapServe fleet
//!
//! Launch parameters are loaded once at startup from a YAML file (or a
//! serialized copy passed to spawned shard processes) and are read-only
//! thereafter.

use crate::error::{Result, SwapServeError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Immutable launch parameters for the coordinator and its shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Model identifier handed to the inference engine
    pub model: String,

    /// Optional model revision
    #[serde(default)]
    pub revision: Option<String>,

    /// Cooperating processes per model replica
    #[serde(default = "default_parallel_size")]
    pub tensor_parallel_size: usize,

    /// Independent shard replicas requests are fanned out across
    #[serde(default = "default_parallel_size")]
    pub data_parallel_size: usize,

    /// HTTP bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Fraction of device memory the engine may claim
    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f64,

    /// Engine compute dtype ("auto" lets the engine decide)
    #[serde(default = "default_dtype")]
    pub dtype: String,

    /// Maximum sequence length (prompt + completion)
    #[serde(default)]
    pub max_model_len: Option<usize>,

    /// Whether the engine caches prompt prefixes
    #[serde(default)]
    pub enable_prefix_caching: Option<bool>,

    /// Disable graph capture inside the engine
    #[serde(default)]
    pub enforce_eager: Option<bool>,

    /// KV-cache dtype
    #[serde(default = "default_dtype")]
    pub kv_cache_dtype: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional bound on the shard readiness barrier. `None` preserves
    /// the unbounded wait: serving must not start with a partial fleet.
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,

    /// Grace period for joining shard processes at shutdown before
    /// they are force-terminated.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_parallel_size() -> usize {
    1
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_gpu_memory_utilization() -> f64 {
    0.9
}

fn default_dtype() -> String {
    "auto".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_grace() -> u64 {
    10
}

impl ServeConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            SwapServeError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: ServeConfig = serde_yaml::from_str(&content).map_err(|e| {
            SwapServeError::config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a serialized configuration, as handed to spawned shard
    /// processes via `SWAPSERVE_CONFIG_JSON`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: ServeConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(SwapServeError::config("model identifier must not be empty"));
        }
        if self.tensor_parallel_size == 0 {
            return Err(SwapServeError::config("tensor_parallel_size must be >= 1"));
        }
        if self.data_parallel_size == 0 {
            return Err(SwapServeError::config("data_parallel_size must be >= 1"));
        }
        if !(self.gpu_memory_utilization > 0.0 && self.gpu_memory_utilization <= 1.0) {
            return Err(SwapServeError::config(
                "gpu_memory_utilization must be in (0, 1]",
            ));
        }
        Ok(())
    }

    /// Collective world size across all shard ranks, excluding the
    /// external client.
    pub fn fleet_world_size(&self) -> usize {
        self.tensor_parallel_size * self.data_parallel_size
    }

    /// Get the readiness-barrier bound, if one is configured
    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_secs.map(Duration::from_secs)
    }

    /// Get the shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
