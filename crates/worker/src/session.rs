//! Shard command loop
//!
//! Commands arrive on the duplex channel and are serviced strictly in
//! send order. `Call` commands produce exactly one reply; fire-and-
//! forget commands produce none, and a failure in one is fatal to the
//! shard: there is no reply path to report it on, and continuing in an
//! unknown group state would mask a partial fleet as healthy.

use crate::engine::ShardEngine;
use crate::sync::CommunicatorState;
use std::time::Instant;
use swapserve_common::{Result, SwapServeError, METRICS};
use swapserve_proto::channel::{ChannelError, ShardChannel};
use swapserve_proto::{DeliveryMode, WorkerCommand, WorkerReply};
use tracing::{error, info, warn};

pub struct ShardSession<E: ShardEngine> {
    dp_rank: usize,
    engine: E,
    comm: CommunicatorState,
}

impl<E: ShardEngine> ShardSession<E> {
    pub fn new(dp_rank: usize, tp_size: usize, engine: E) -> Self {
        Self {
            dp_rank,
            engine,
            comm: CommunicatorState::new(dp_rank, tp_size),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Service commands until shutdown or channel loss. The group
    /// membership is always released on the way out; teardown races
    /// against the coordinator are expected.
    pub async fn run(&mut self, chan: &mut ShardChannel) -> Result<()> {
        let result = self.serve(chan).await;
        self.comm.close();
        result
    }

    async fn serve(&mut self, chan: &mut ShardChannel) -> Result<()> {
        loop {
            let frame = match chan.recv().await {
                Ok(frame) => frame,
                Err(ChannelError::Closed) => {
                    info!(dp_rank = self.dp_rank, "control channel closed, exiting");
                    return Ok(());
                }
                Err(err) => return Err(SwapServeError::channel(err.to_string())),
            };

            if matches!(frame.command, WorkerCommand::Shutdown) {
                info!(dp_rank = self.dp_rank, "shutdown requested");
                return Ok(());
            }

            let mode = frame.mode;
            let started = Instant::now();
            let result = self.execute(frame.command);
            METRICS.worker.commands_total.inc();
            METRICS
                .worker
                .command_duration
                .observe(started.elapsed().as_secs_f64());

            match mode {
                DeliveryMode::Call => {
                    let reply = match result {
                        Ok(reply) => reply,
                        Err(err) => {
                            warn!(dp_rank = self.dp_rank, error = %err, "command failed");
                            WorkerReply::Error {
                                message: err.to_string(),
                            }
                        }
                    };
                    chan.send(reply)
                        .await
                        .map_err(|e| SwapServeError::channel(e.to_string()))?;
                }
                DeliveryMode::FireAndForget => {
                    if let Err(err) = result {
                        error!(
                            dp_rank = self.dp_rank,
                            error = %err,
                            "fire-and-forget command failed, shard state is unknown"
                        );
                        return Err(err);
                    }
                }
            }
        }
    }

    fn execute(&mut self, command: WorkerCommand) -> Result<WorkerReply> {
        match command {
            WorkerCommand::Generate { prompts, sampling } => Ok(WorkerReply::Generated {
                completions: self.engine.generate(&prompts, &sampling)?,
            }),
            WorkerCommand::Chat {
                conversations,
                sampling,
            } => Ok(WorkerReply::ChatCompleted {
                responses: self.engine.chat(&conversations, &sampling)?,
            }),
            WorkerCommand::ResetPrefixCache => Ok(WorkerReply::CacheReset {
                ok: self.engine.reset_prefix_cache()?,
            }),
            WorkerCommand::InitCommunicator {
                host,
                port,
                world_size,
            } => {
                let comm = &mut self.comm;
                tokio::task::block_in_place(|| comm.init(&host, port, world_size))?;
                Ok(WorkerReply::Ack)
            }
            WorkerCommand::UpdateNamedParam { meta } => {
                let comm = &mut self.comm;
                let engine = &self.engine;
                tokio::task::block_in_place(|| comm.update(&meta, engine))?;
                Ok(WorkerReply::Ack)
            }
            WorkerCommand::CloseCommunicator => {
                self.comm.close();
                Ok(WorkerReply::Ack)
            }
            WorkerCommand::Shutdown => Ok(WorkerReply::Ack),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use swapserve_common::ServeConfig;
    use swapserve_proto::channel::{DuplexChannel, ManagerChannel};
    use swapserve_proto::{CommandFrame, SamplingOptions};

    fn test_config() -> ServeConfig {
        ServeConfig {
            model: "test-model".to_string(),
            revision: None,
            tensor_parallel_size: 1,
            data_parallel_size: 1,
            host: "0.0.0.0".to_string(),
            port: 8000,
            gpu_memory_utilization: 0.9,
            dtype: "auto".to_string(),
            max_model_len: None,
            enable_prefix_caching: None,
            enforce_eager: None,
            kv_cache_dtype: "auto".to_string(),
            log_level: "info".to_string(),
            startup_timeout_secs: None,
            shutdown_grace_secs: 10,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fire_and_forget_produces_no_reply() {
        let (mut manager, mut shard): (ManagerChannel, _) = DuplexChannel::local_pair();
        let engine = LocalEngine::new(&test_config(), 0);
        let mut session = ShardSession::new(0, 1, engine);

        let task = tokio::spawn(async move {
            session.run(&mut shard).await.unwrap();
        });

        // Fire first, then a call: if the fire had produced a reply the
        // call's reply would arrive out of order.
        manager
            .send(CommandFrame::fire(WorkerCommand::CloseCommunicator))
            .await
            .unwrap();
        manager
            .send(CommandFrame::call(WorkerCommand::ResetPrefixCache))
            .await
            .unwrap();

        let reply = manager.recv().await.unwrap();
        assert!(matches!(reply, WorkerReply::CacheReset { ok: true }));

        manager
            .send(CommandFrame::fire(WorkerCommand::Shutdown))
            .await
            .unwrap();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn generate_call_replies_in_chunk_order() {
        let (mut manager, mut shard): (ManagerChannel, _) = DuplexChannel::local_pair();
        let engine = LocalEngine::new(&test_config(), 0);
        let mut session = ShardSession::new(0, 1, engine);

        let task = tokio::spawn(async move {
            session.run(&mut shard).await.unwrap();
        });

        manager
            .send(CommandFrame::call(WorkerCommand::Generate {
                prompts: vec!["a".to_string(), "b".to_string()],
                sampling: SamplingOptions::default(),
            }))
            .await
            .unwrap();

        match manager.recv().await.unwrap() {
            WorkerReply::Generated { completions } => {
                assert_eq!(completions.len(), 2);
            }
            other => panic!("expected Generated, got {:?}", other),
        }

        manager
            .send(CommandFrame::fire(WorkerCommand::Shutdown))
            .await
            .unwrap();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn call_errors_are_reported_as_error_replies() {
        let (mut manager, mut shard): (ManagerChannel, _) = DuplexChannel::local_pair();
        let engine = LocalEngine::new(&test_config(), 0);
        let mut session = ShardSession::new(0, 1, engine);

        let task = tokio::spawn(async move {
            session.run(&mut shard).await.unwrap();
        });

        manager
            .send(CommandFrame::call(WorkerCommand::Generate {
                prompts: vec!["a".to_string()],
                sampling: SamplingOptions {
                    guided_decoding_regex: Some("(".to_string()),
                    ..SamplingOptions::default()
                },
            }))
            .await
            .unwrap();

        match manager.recv().await.unwrap() {
            WorkerReply::Error { message } => {
                assert!(message.contains("guided decoding regex"));
            }
            other => panic!("expected Error, got {:?}", other),
        }

        manager
            .send(CommandFrame::fire(WorkerCommand::Shutdown))
            .await
            .unwrap();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_exits_when_manager_disconnects() {
        let (manager, mut shard): (ManagerChannel, _) = DuplexChannel::local_pair();
        let engine = LocalEngine::new(&test_config(), 0);
        let mut session = ShardSession::new(0, 1, engine);

        drop(manager);
        session.run(&mut shard).await.unwrap();
    }
}
