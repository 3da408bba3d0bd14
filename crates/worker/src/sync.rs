//! Weight-sync state machine
//!
//! Each shard owns one `CommunicatorState`: its membership in the
//! collective group spanning every shard rank plus the external
//! trainer. The state machine is UNINITIALIZED → ACTIVE → CLOSED;
//! re-initializing while ACTIVE is a fatal configuration error, and
//! closing is idempotent because shutdown races against fleet teardown.
//!
//! A shard process covers all of its tensor-parallel ranks, so it holds
//! one group membership per local rank, with global rank
//! `dp_rank × tp_size + local`. The trainer is always the highest rank
//! and the source of every broadcast.

use crate::engine::ShardEngine;
use std::time::Instant;
use swapserve_common::collective::CollectiveGroup;
use swapserve_common::tensor::{self, ParamDType};
use swapserve_common::{Result, SwapServeError, METRICS};
use swapserve_proto::TensorMeta;
use tracing::{debug, info};

pub struct CommunicatorState {
    dp_rank: usize,
    tp_size: usize,
    memberships: Vec<CollectiveGroup>,
    client_rank: Option<usize>,
}

impl CommunicatorState {
    pub fn new(dp_rank: usize, tp_size: usize) -> Self {
        Self {
            dp_rank,
            tp_size: tp_size.max(1),
            memberships: Vec::new(),
            client_rank: None,
        }
    }

    /// Whether a group membership is currently ACTIVE.
    pub fn is_active(&self) -> bool {
        !self.memberships.is_empty()
    }

    /// Join the collective group at `(host, port)`.
    ///
    /// Blocks until all `world_size` members have connected. Joining
    /// while already ACTIVE is an error: the caller must close the
    /// previous group first.
    pub fn init(&mut self, host: &str, port: u16, world_size: usize) -> Result<()> {
        if self.is_active() {
            return Err(SwapServeError::group_state(
                "weight update group already initialized; call close_communicator first",
            ));
        }

        let base = self.dp_rank * self.tp_size;
        if base + self.tp_size > world_size.saturating_sub(1) {
            return Err(SwapServeError::invalid_input(format!(
                "world size {} cannot hold shard ranks {}..{} plus the client",
                world_size,
                base,
                base + self.tp_size
            )));
        }

        // All local ranks must rendezvous together; formation blocks
        // until the whole group is connected.
        let joined: Vec<Result<CollectiveGroup>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.tp_size)
                .map(|local| {
                    scope.spawn(move || CollectiveGroup::join(host, port, base + local, world_size))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(SwapServeError::collective("rendezvous thread panicked"))
                    })
                })
                .collect()
        });

        let mut memberships = Vec::with_capacity(self.tp_size);
        for result in joined {
            memberships.push(result?);
        }
        self.memberships = memberships;
        self.client_rank = Some(world_size - 1);

        METRICS.sync.communicator_inits_total.inc();
        info!(
            dp_rank = self.dp_rank,
            world_size,
            ranks = self.tp_size,
            "communicator initialized"
        );
        Ok(())
    }

    /// Receive one named tensor broadcast by the trainer and hot-swap
    /// it into the engine.
    ///
    /// Every membership allocates a receive buffer of the declared
    /// shape/dtype, takes the broadcast from the client rank, and
    /// passes the barrier before the swap is applied.
    pub fn update<E: ShardEngine + ?Sized>(&mut self, meta: &TensorMeta, engine: &E) -> Result<()> {
        if !self.is_active() {
            return Err(SwapServeError::group_state(
                "communicator not initialized; call init_communicator first",
            ));
        }

        let dtype = ParamDType::parse(&meta.dtype)?;
        let nbytes = tensor::byte_len(dtype, &meta.shape);
        let client_rank = self.client_rank.ok_or_else(|| {
            SwapServeError::group_state("communicator is active but has no client rank")
        })?;

        let started = Instant::now();
        let received: Vec<Result<Vec<u8>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .memberships
                .iter_mut()
                .map(|group| {
                    scope.spawn(move || -> Result<Vec<u8>> {
                        let mut buf = vec![0u8; nbytes];
                        group.broadcast(&mut buf, client_rank)?;
                        group.barrier()?;
                        Ok(buf)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(SwapServeError::collective("broadcast thread panicked"))
                    })
                })
                .collect()
        });

        let mut payload: Option<Vec<u8>> = None;
        for result in received {
            let buf = result?;
            if payload.is_none() {
                payload = Some(buf);
            }
        }
        let bytes = payload
            .ok_or_else(|| SwapServeError::collective("no membership received the broadcast"))?;

        let tensor = tensor::tensor_from_bytes(dtype, &meta.shape, &bytes)?;
        engine.load_named_param(&meta.name, tensor)?;

        METRICS.sync.weight_updates_total.inc();
        METRICS.sync.weight_update_bytes_total.inc_by(nbytes as u64);
        METRICS
            .sync
            .broadcast_duration
            .observe(started.elapsed().as_secs_f64());
        debug!(name = %meta.name, bytes = nbytes, "named parameter hot-swapped");
        Ok(())
    }

    /// Release the group membership. Safe to call any number of times,
    /// including when no group was ever initialized.
    pub fn close(&mut self) {
        if self.is_active() {
            debug!(dp_rank = self.dp_rank, "closing communicator");
        }
        self.memberships.clear();
        self.client_rank = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use swapserve_common::ServeConfig;

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

    fn reserve_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn update_requires_an_active_group() {
        let mut comm = CommunicatorState::new(0, 1);
        let engine = LocalEngine::new(&test_config(), 0);
        let meta = TensorMeta {
            name: "w".to_string(),
            dtype: "float32".to_string(),
            shape: vec![2, 2],
        };

        let err = comm.update(&meta, &engine).unwrap_err();
        assert!(matches!(err, SwapServeError::GroupState(_)));
    }

    #[test]
    fn init_rejects_world_size_too_small_for_shard_ranks() {
        // dp_rank 1 with tp 2 needs global ranks 2..4 plus the client
        let mut comm = CommunicatorState::new(1, 2);
        let err = comm.init("127.0.0.1", 1, 3).unwrap_err();
        assert!(matches!(err, SwapServeError::InvalidInput(_)));
        assert!(!comm.is_active());
    }

    #[test]
    fn double_init_is_rejected_and_close_is_idempotent() {
        let port = reserve_port();

        std::thread::scope(|scope| {
            scope.spawn(move || {
                let mut comm = CommunicatorState::new(0, 1);
                comm.init("127.0.0.1", port, 2).unwrap();

                let err = comm.init("127.0.0.1", port, 2).unwrap_err();
                assert!(matches!(err, SwapServeError::GroupState(_)));

                comm.close();
                comm.close();
                assert!(!comm.is_active());
            });

            scope.spawn(move || {
                // the trainer side of the rendezvous
                let _client = CollectiveGroup::join("127.0.0.1", port, 1, 2).unwrap();
            });
        });
    }
}
