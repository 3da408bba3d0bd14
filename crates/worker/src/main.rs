//! SwapServe Worker - shard process entry point
//!
//! Spawned by the coordinator, one process per data-parallel rank. The
//! rank, fleet size, master rendezvous port, and serialized launch
//! configuration arrive through the environment before the engine
//! starts; readiness is reported back over the control channel only
//! once the engine is constructed.

use anyhow::Context;
use swapserve_common::ServeConfig;
use swapserve_proto::channel::{DuplexChannel, ShardChannel};
use swapserve_proto::WorkerReply;
use swapserve_worker::{LocalEngine, ShardSession};
use tokio::net::TcpStream;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn env_var(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{} not set", name))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dp_rank: usize = env_var("SWAPSERVE_DP_RANK")?
        .parse()
        .context("invalid SWAPSERVE_DP_RANK")?;
    let dp_size: usize = env_var("SWAPSERVE_DP_SIZE")?
        .parse()
        .context("invalid SWAPSERVE_DP_SIZE")?;
    let master_port: u16 = env_var("SWAPSERVE_MASTER_PORT")?
        .parse()
        .context("invalid SWAPSERVE_MASTER_PORT")?;
    let control_addr = env_var("SWAPSERVE_CONTROL_ADDR")?;
    let config = ServeConfig::from_json(&env_var("SWAPSERVE_CONFIG_JSON")?)?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("swapserve_worker={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting SwapServe worker: dp_rank={}/{}, master_port={}",
        dp_rank, dp_size, master_port
    );

    let stream = TcpStream::connect(&control_addr)
        .await
        .with_context(|| format!("failed to reach coordinator at {}", control_addr))?;
    stream.set_nodelay(true)?;
    let mut chan: ShardChannel = DuplexChannel::socket(stream);
    chan.send(WorkerReply::Hello { dp_rank }).await?;

    // Engine construction can be slow; readiness is only reported once
    // the shard can actually serve.
    let engine = LocalEngine::new(&config, dp_rank);
    chan.send(WorkerReply::Ready).await?;

    let mut session = ShardSession::new(dp_rank, config.tensor_parallel_size, engine);
    session.run(&mut chan).await?;

    info!("SwapServe worker {} shutdown complete", dp_rank);
    Ok(())
}
