//! SwapServe Coordinator - Main Entry Point
//!
//! Spawns the shard fleet, blocks HTTP serving behind the readiness
//! barrier, then serves the control-plane API until interrupted.

use std::sync::Arc;
use swapserve_common::{Result, ServeConfig};
use swapserve_coordinator::api::{self, AppState};
use swapserve_coordinator::WorkerPool;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path =
        std::env::var("SWAPSERVE_CONFIG").unwrap_or_else(|_| "configs/serve.yaml".to_string());
    let config = ServeConfig::from_file(&config_path)?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("swapserve_coordinator={},axum=info", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting SwapServe coordinator: model={}, dp={}, tp={}, bind={}:{}",
        config.model,
        config.data_parallel_size,
        config.tensor_parallel_size,
        config.host,
        config.port
    );

    let pool = Arc::new(WorkerPool::spawn(&config).await?);

    // Readiness barrier: no traffic until the whole fleet is up.
    info!(
        "waiting for {} shard(s) to report ready",
        config.data_parallel_size
    );
    pool.await_ready(config.startup_timeout()).await?;

    let state = AppState {
        pool: pool.clone(),
        config: Arc::new(config.clone()),
    };
    let app = api::router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("SwapServe coordinator listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    pool.shutdown(config.shutdown_grace()).await;
    info!("SwapServe coordinator shutdown complete");
    Ok(())
}
