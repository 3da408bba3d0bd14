//! Metrics collection for SwapServe
//!
//! Prometheus metrics for the coordinator, the shard workers, and the
//! weight-sync path. Kept off the hot path: counters and gauges only,
//! with histograms for request and broadcast latency.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for SwapServe
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub coordinator: CoordinatorMetrics,
    pub worker: WorkerMetrics,
    pub sync: SyncMetrics,
}

/// Coordinator-side metrics
#[derive(Clone)]
pub struct CoordinatorMetrics {
    /// Total HTTP requests handled
    pub requests_total: IntCounter,

    /// Requests that ended in an error response
    pub requests_failed: IntCounter,

    /// End-to-end request duration
    pub request_duration: Histogram,

    /// Shards that have reported ready
    pub ready_workers: IntGauge,

    /// Prompt/conversation chunks dispatched to shards
    pub chunks_dispatched_total: IntCounter,
}

/// Shard worker metrics
#[derive(Clone)]
pub struct WorkerMetrics {
    /// Commands processed by the shard loop
    pub commands_total: IntCounter,

    /// Command processing duration
    pub command_duration: Histogram,

    /// Prompts generated by this shard
    pub prompts_total: IntCounter,

    /// Named parameters currently loaded
    pub params_loaded: IntGauge,
}

/// Weight-sync metrics
#[derive(Clone)]
pub struct SyncMetrics {
    /// Communicator group initializations
    pub communicator_inits_total: IntCounter,

    /// Named-parameter updates applied
    pub weight_updates_total: IntCounter,

    /// Bytes received over the collective broadcast
    pub weight_update_bytes_total: IntCounter,

    /// Broadcast + barrier duration per update
    pub broadcast_duration: Histogram,
}

impl MetricsRegistry {
    /// Create and register all metrics
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let coordinator = CoordinatorMetrics {
            requests_total: IntCounter::new(
                "swapserve_requests_total",
                "Total HTTP requests handled by the coordinator",
            )?,
            requests_failed: IntCounter::new(
                "swapserve_requests_failed_total",
                "HTTP requests that ended in an error response",
            )?,
            request_duration: Histogram::with_opts(HistogramOpts::new(
                "swapserve_request_duration_seconds",
                "End-to-end HTTP request duration",
            ))?,
            ready_workers: IntGauge::new(
                "swapserve_ready_workers",
                "Shard processes that have reported ready",
            )?,
            chunks_dispatched_total: IntCounter::new(
                "swapserve_chunks_dispatched_total",
                "Prompt/conversation chunks dispatched to shards",
            )?,
        };

        let worker = WorkerMetrics {
            commands_total: IntCounter::new(
                "swapserve_worker_commands_total",
                "Commands processed by the shard loop",
            )?,
            command_duration: Histogram::with_opts(HistogramOpts::new(
                "swapserve_worker_command_duration_seconds",
                "Shard command processing duration",
            ))?,
            prompts_total: IntCounter::new(
                "swapserve_worker_prompts_total",
                "Prompts generated by this shard",
            )?,
            params_loaded: IntGauge::new(
                "swapserve_worker_params_loaded",
                "Named parameters currently loaded in the engine",
            )?,
        };

        let sync = SyncMetrics {
            communicator_inits_total: IntCounter::new(
                "swapserve_communicator_inits_total",
                "Collective group initializations",
            )?,
            weight_updates_total: IntCounter::new(
                "swapserve_weight_updates_total",
                "Named-parameter updates applied",
            )?,
            weight_update_bytes_total: IntCounter::new(
                "swapserve_weight_update_bytes_total",
                "Bytes received over the collective broadcast",
            )?,
            broadcast_duration: Histogram::with_opts(HistogramOpts::new(
                "swapserve_broadcast_duration_seconds",
                "Broadcast plus barrier duration per weight update",
            ))?,
        };

        registry.register(Box::new(coordinator.requests_total.clone()))?;
        registry.register(Box::new(coordinator.requests_failed.clone()))?;
        registry.register(Box::new(coordinator.request_duration.clone()))?;
        registry.register(Box::new(coordinator.ready_workers.clone()))?;
        registry.register(Box::new(coordinator.chunks_dispatched_total.clone()))?;
        registry.register(Box::new(worker.commands_total.clone()))?;
        registry.register(Box::new(worker.command_duration.clone()))?;
        registry.register(Box::new(worker.prompts_total.clone()))?;
        registry.register(Box::new(worker.params_loaded.clone()))?;
        registry.register(Box::new(sync.communicator_inits_total.clone()))?;
        registry.register(Box::new(sync.weight_updates_total.clone()))?;
        registry.register(Box::new(sync.weight_update_bytes_total.clone()))?;
        registry.register(Box::new(sync.broadcast_duration.clone()))?;

        Ok(Self {
            registry,
            coordinator,
            worker,
            sync,
        })
    }
}

lazy_static! {
    /// Process-wide metrics registry
    pub static ref METRICS: MetricsRegistry =
        MetricsRegistry::new().expect("failed to build metrics registry");
}
