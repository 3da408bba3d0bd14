//! Worker pool: spawning and supervising the shard fleet
//!
//! One shard process per data-parallel rank. Each handle owns the
//! child process and its duplex control channel; the pool is the sole
//! owner of both. Call-type operations hold the pool lock across
//! send-all + recv-all, so one aggregate operation is in flight at a
//! time; this is the intended backpressure.
//!
//! A shard that dies while a call is outstanding surfaces as a worker
//! error (or a wait that never completes, if the transport cannot tell);
//! the fleet is never silently treated as partially healthy.

use std::path::PathBuf;
use std::time::Duration;
use swapserve_common::{Result, ServeConfig, SwapServeError, METRICS};
use swapserve_proto::channel::{DuplexChannel, ManagerChannel};
use swapserve_proto::{CommandFrame, WorkerCommand, WorkerReply};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One data-parallel rank: its process and its control channel.
struct WorkerHandle {
    rank: usize,
    child: Option<Child>,
    chan: ManagerChannel,
}

/// The shard fleet.
pub struct WorkerPool {
    handles: Mutex<Vec<WorkerHandle>>,
    data_parallel_size: usize,
}

impl WorkerPool {
    /// Spawn one shard process per data-parallel rank and complete the
    /// connection handshake with each.
    ///
    /// Every shard receives its rank, the fleet size, a shared master
    /// rendezvous port for tensor-parallel sub-groups, the control
    /// channel address, and the serialized launch configuration
    /// through the environment, before its engine starts.
    pub async fn spawn(config: &ServeConfig) -> Result<Self> {
        let dp = config.data_parallel_size;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let control_addr = listener.local_addr()?.to_string();
        let master_port = reserve_port()?;
        let worker_bin = worker_binary();
        let config_json = serde_json::to_string(config)?;

        info!(
            workers = dp,
            control_addr = %control_addr,
            master_port,
            worker_bin = %worker_bin.display(),
            "spawning shard processes"
        );

        let mut children: Vec<Option<Child>> = Vec::with_capacity(dp);
        for rank in 0..dp {
            let child = Command::new(&worker_bin)
                .env("SWAPSERVE_DP_RANK", rank.to_string())
                .env("SWAPSERVE_DP_SIZE", dp.to_string())
                .env("SWAPSERVE_MASTER_PORT", master_port.to_string())
                .env("SWAPSERVE_CONTROL_ADDR", &control_addr)
                .env("SWAPSERVE_CONFIG_JSON", &config_json)
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    SwapServeError::worker(format!("failed to spawn shard {}: {}", rank, e))
                })?;
            children.push(Some(child));
        }

        // Each shard dials back and identifies itself before anything else.
        let mut chans: Vec<Option<ManagerChannel>> = (0..dp).map(|_| None).collect();
        for _ in 0..dp {
            let (stream, _) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let mut chan: ManagerChannel = DuplexChannel::socket(stream);
            match chan
                .recv()
                .await
                .map_err(|e| SwapServeError::channel(e.to_string()))?
            {
                WorkerReply::Hello { dp_rank } if dp_rank < dp => {
                    if chans[dp_rank].is_some() {
                        return Err(SwapServeError::channel(format!(
                            "duplicate handshake for shard {}",
                            dp_rank
                        )));
                    }
                    debug!(rank = dp_rank, "shard connected");
                    chans[dp_rank] = Some(chan);
                }
                other => {
                    return Err(SwapServeError::channel(format!(
                        "unexpected handshake frame: {:?}",
                        other
                    )))
                }
            }
        }

        let mut handles = Vec::with_capacity(dp);
        for (rank, slot) in chans.into_iter().enumerate() {
            let chan = slot.ok_or_else(|| {
                SwapServeError::channel(format!("shard {} never connected", rank))
            })?;
            handles.push(WorkerHandle {
                rank,
                child: children[rank].take(),
                chan,
            });
        }

        Ok(Self {
            handles: Mutex::new(handles),
            data_parallel_size: dp,
        })
    }

    /// Number of data-parallel ranks in the pool.
    pub fn size(&self) -> usize {
        self.data_parallel_size
    }

    /// Readiness barrier: block until every shard has reported ready.
    ///
    /// Unbounded when `timeout` is `None`: if a shard never reports,
    /// the fleet is in an unknown state and serving must not start.
    /// A configured bound turns that into a timeout error instead.
    pub async fn await_ready(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            Some(bound) => tokio::time::timeout(bound, self.collect_ready())
                .await
                .map_err(|_| {
                    SwapServeError::timeout(format!("fleet not ready within {:?}", bound))
                })?,
            None => self.collect_ready().await,
        }
    }

    async fn collect_ready(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        for handle in handles.iter_mut() {
            match handle.chan.recv().await.map_err(|e| {
                SwapServeError::worker(format!("shard {} failed before ready: {}", handle.rank, e))
            })? {
                WorkerReply::Ready => debug!(rank = handle.rank, "shard ready"),
                other => {
                    return Err(SwapServeError::channel(format!(
                        "expected ready from shard {}, got {:?}",
                        handle.rank, other
                    )))
                }
            }
        }
        METRICS
            .coordinator
            .ready_workers
            .set(handles.len() as i64);
        info!(workers = handles.len(), "all shards ready");
        Ok(())
    }

    /// Send the same call to every shard and collect one reply from
    /// each, in handle order.
    pub async fn broadcast_call(&self, command: WorkerCommand) -> Result<Vec<WorkerReply>> {
        let commands = vec![command; self.data_parallel_size];
        self.scatter_call(commands).await
    }

    /// Send the i-th call to the i-th shard and collect one reply from
    /// each, in handle order. Sends complete before any reply is
    /// awaited, so the shards run their chunks concurrently.
    pub async fn scatter_call(&self, commands: Vec<WorkerCommand>) -> Result<Vec<WorkerReply>> {
        let mut handles = self.handles.lock().await;
        if commands.len() != handles.len() {
            return Err(SwapServeError::internal(format!(
                "{} commands for {} shards",
                commands.len(),
                handles.len()
            )));
        }

        for (handle, command) in handles.iter_mut().zip(commands) {
            handle
                .chan
                .send(CommandFrame::call(command))
                .await
                .map_err(|e| {
                    SwapServeError::worker(format!(
                        "failed to send to shard {}: {}",
                        handle.rank, e
                    ))
                })?;
        }

        let mut replies = Vec::with_capacity(handles.len());
        for handle in handles.iter_mut() {
            let reply = handle.chan.recv().await.map_err(|e| {
                SwapServeError::worker(format!(
                    "shard {} died while a call was outstanding: {}",
                    handle.rank, e
                ))
            })?;
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Send the same fire-and-forget command to every shard. Returns
    /// as soon as the frames are written; no replies exist.
    pub async fn broadcast_fire(&self, command: WorkerCommand) -> Result<()> {
        let mut handles = self.handles.lock().await;
        for handle in handles.iter_mut() {
            handle
                .chan
                .send(CommandFrame::fire(command.clone()))
                .await
                .map_err(|e| {
                    SwapServeError::worker(format!(
                        "failed to send to shard {}: {}",
                        handle.rank, e
                    ))
                })?;
        }
        Ok(())
    }

    /// Graceful shutdown: ask every shard to exit, join each process
    /// within the grace period, force-terminate stragglers.
    pub async fn shutdown(&self, grace: Duration) {
        let mut handles = self.handles.lock().await;

        for handle in handles.iter_mut() {
            if let Err(err) = handle
                .chan
                .send(CommandFrame::fire(WorkerCommand::Shutdown))
                .await
            {
                warn!(rank = handle.rank, error = %err, "failed to send shutdown command");
            }
        }

        for handle in handles.iter_mut() {
            let Some(mut child) = handle.child.take() else {
                continue;
            };
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => info!(rank = handle.rank, %status, "shard exited"),
                Ok(Err(err)) => warn!(rank = handle.rank, error = %err, "failed to join shard"),
                Err(_) => {
                    warn!(rank = handle.rank, "shard did not exit in time, terminating");
                    if let Err(err) = child.kill().await {
                        warn!(rank = handle.rank, error = %err, "failed to terminate shard");
                    }
                }
            }
        }
        METRICS.coordinator.ready_workers.set(0);
    }

    /// Build a pool over pre-established channels. Test seam: the
    /// transport is swappable, so orchestration logic is exercised
    /// against in-process shards.
    #[cfg(test)]
    pub(crate) fn from_channels(chans: Vec<ManagerChannel>) -> Self {
        let data_parallel_size = chans.len();
        let handles = chans
            .into_iter()
            .enumerate()
            .map(|(rank, chan)| WorkerHandle {
                rank,
                child: None,
                chan,
            })
            .collect();
        Self {
            handles: Mutex::new(handles),
            data_parallel_size,
        }
    }
}

fn reserve_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn worker_binary() -> PathBuf {
    if let Ok(path) = std::env::var("SWAPSERVE_WORKER_BIN") {
        return PathBuf::from(path);
    }
    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name("swapserve-worker");
        if sibling.exists() {
            return sibling;
        }
    }
    PathBuf::from("swapserve-worker")
}

#[cfg(test)]
mod tests {
    use super::*;
    use swapserve_proto::channel::ShardChannel;
    use swapserve_proto::{PromptCompletions, SamplingOptions};

    /// In-process stand-in for a shard: replies to calls, stays silent
    /// on fire-and-forget frames.
    fn fake_shard(
        mut chan: ShardChannel,
        send_ready: bool,
        cache_ok: bool,
        tag: u32,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if send_ready {
                chan.send(WorkerReply::Ready).await.unwrap();
            }
            loop {
                let frame = match chan.recv().await {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                match frame.command {
                    WorkerCommand::Shutdown => break,
                    WorkerCommand::Generate { prompts, sampling } => {
                        let completions = prompts
                            .iter()
                            .map(|p| PromptCompletions {
                                completion_ids: (0..sampling.n.max(1))
                                    .map(|_| vec![tag, p.len() as u32])
                                    .collect(),
                            })
                            .collect();
                        chan.send(WorkerReply::Generated { completions })
                            .await
                            .unwrap();
                    }
                    WorkerCommand::ResetPrefixCache => {
                        chan.send(WorkerReply::CacheReset { ok: cache_ok })
                            .await
                            .unwrap();
                    }
                    _ => {}
                }
            }
        })
    }

    fn pool_with_fakes(
        specs: &[(bool, u32)],
    ) -> (WorkerPool, Vec<tokio::task::JoinHandle<()>>) {
        let mut chans = Vec::new();
        let mut tasks = Vec::new();
        for (cache_ok, tag) in specs {
            let (manager, shard) = DuplexChannel::local_pair();
            tasks.push(fake_shard(shard, true, *cache_ok, *tag));
            chans.push(manager);
        }
        (WorkerPool::from_channels(chans), tasks)
    }

    #[tokio::test]
    async fn ready_barrier_completes_when_all_shards_report() {
        let (pool, _tasks) = pool_with_fakes(&[(true, 1), (true, 2)]);
        pool.await_ready(None).await.unwrap();
    }

    #[tokio::test]
    async fn ready_barrier_times_out_on_silent_shard() {
        let (manager, shard) = DuplexChannel::local_pair();
        let _task = fake_shard(shard, false, true, 0);
        let pool = WorkerPool::from_channels(vec![manager]);

        let err = pool
            .await_ready(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, SwapServeError::Timeout(_)));
    }

    #[tokio::test]
    async fn scatter_call_collects_replies_in_handle_order() {
        let (pool, _tasks) = pool_with_fakes(&[(true, 10), (true, 20), (true, 30)]);
        pool.await_ready(None).await.unwrap();

        let commands = (0..3)
            .map(|i| WorkerCommand::Generate {
                prompts: vec!["x".repeat(i + 1)],
                sampling: SamplingOptions::default(),
            })
            .collect();
        let replies = pool.scatter_call(commands).await.unwrap();

        let tags: Vec<u32> = replies
            .iter()
            .map(|reply| match reply {
                WorkerReply::Generated { completions } => completions[0].completion_ids[0][0],
                other => panic!("unexpected reply: {:?}", other),
            })
            .collect();
        assert_eq!(tags, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn fire_and_forget_leaves_channels_aligned() {
        let (pool, _tasks) = pool_with_fakes(&[(true, 1), (true, 2)]);
        pool.await_ready(None).await.unwrap();

        pool.broadcast_fire(WorkerCommand::CloseCommunicator)
            .await
            .unwrap();

        // The next call still pairs with the right replies.
        let replies = pool
            .broadcast_call(WorkerCommand::ResetPrefixCache)
            .await
            .unwrap();
        assert_eq!(replies.len(), 2);
        assert!(replies
            .iter()
            .all(|r| matches!(r, WorkerReply::CacheReset { ok: true })));
    }

    #[tokio::test]
    async fn dead_shard_surfaces_as_worker_error() {
        let (manager, shard) = DuplexChannel::local_pair();
        let pool = WorkerPool::from_channels(vec![manager]);
        drop(shard);

        let err = pool
            .broadcast_call(WorkerCommand::ResetPrefixCache)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapServeError::Worker(_)));
    }

    #[tokio::test]
    async fn shutdown_delivers_shutdown_command() {
        let (pool, tasks) = pool_with_fakes(&[(true, 1)]);
        pool.await_ready(None).await.unwrap();

        pool.shutdown(Duration::from_millis(200)).await;
        for task in tasks {
            task.await.unwrap();
        }
    }
}
