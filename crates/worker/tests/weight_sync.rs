//! End-to-end weight synchronization across a simulated fleet.
//!
//! Shard sessions and the trainer run as threads of one process, but
//! every byte still crosses real TCP sockets through the collective
//! group, so rendezvous, broadcast, barrier, and the hot-swap are all
//! exercised for real.

use candle_core::{Device, Tensor};
use swapserve_common::collective::CollectiveGroup;
use swapserve_common::tensor::tensor_to_bytes;
use swapserve_common::ServeConfig;
use swapserve_proto::TensorMeta;
use swapserve_worker::{CommunicatorState, LocalEngine, ShardEngine};

fn test_config(tensor_parallel_size: usize, data_parallel_size: usize) -> ServeConfig {
    ServeConfig {
        model: "test-model".to_string(),
        revision: None,
        tensor_parallel_size,
        data_parallel_size,
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

fn source_tensor() -> (Tensor, Vec<f32>) {
    let data: Vec<f32> = (0..16).map(|v| v as f32 * 1.5 - 3.0).collect();
    let tensor = Tensor::from_vec(data.clone(), &[4, 4][..], &Device::Cpu).unwrap();
    (tensor, data)
}

#[test]
fn broadcast_lands_bit_for_bit_in_every_shard() {
    let port = reserve_port();
    let data_parallel_size = 2;
    let world_size = data_parallel_size + 1;
    let client_rank = world_size - 1;
    let (source, expected) = source_tensor();

    std::thread::scope(|scope| {
        for dp_rank in 0..data_parallel_size {
            let expected = expected.clone();
            scope.spawn(move || {
                let engine = LocalEngine::new(&test_config(1, data_parallel_size), dp_rank);
                let mut comm = CommunicatorState::new(dp_rank, 1);
                comm.init("127.0.0.1", port, world_size).unwrap();

                let meta = TensorMeta {
                    name: "w".to_string(),
                    dtype: "torch.float32".to_string(),
                    shape: vec![4, 4],
                };
                comm.update(&meta, &engine).unwrap();

                let landed = engine.named_param("w").unwrap();
                assert_eq!(landed.dims(), &[4, 4]);
                assert_eq!(
                    landed.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                    expected
                );
                comm.close();
            });
        }

        let source = source.clone();
        scope.spawn(move || {
            let mut group =
                CollectiveGroup::join("127.0.0.1", port, client_rank, world_size).unwrap();
            let mut bytes = tensor_to_bytes(&source).unwrap();
            group.broadcast(&mut bytes, client_rank).unwrap();
            group.barrier().unwrap();
        });
    });
}

#[test]
fn tensor_parallel_shard_holds_one_membership_per_local_rank() {
    let port = reserve_port();
    // one DP shard spanning two TP ranks, plus the trainer
    let world_size = 3;
    let client_rank = 2;
    let (source, expected) = source_tensor();

    std::thread::scope(|scope| {
        let expected = expected.clone();
        scope.spawn(move || {
            let engine = LocalEngine::new(&test_config(2, 1), 0);
            let mut comm = CommunicatorState::new(0, 2);
            comm.init("127.0.0.1", port, world_size).unwrap();

            let meta = TensorMeta {
                name: "layers.0.weight".to_string(),
                dtype: "float32".to_string(),
                shape: vec![4, 4],
            };
            comm.update(&meta, &engine).unwrap();

            let landed = engine.named_param("layers.0.weight").unwrap();
            assert_eq!(
                landed.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                expected
            );
            comm.close();
        });

        let source = source.clone();
        scope.spawn(move || {
            let mut group =
                CollectiveGroup::join("127.0.0.1", port, client_rank, world_size).unwrap();
            let mut bytes = tensor_to_bytes(&source).unwrap();
            group.broadcast(&mut bytes, client_rank).unwrap();
            group.barrier().unwrap();
        });
    });
}

#[test]
fn consecutive_updates_overwrite_in_place() {
    let port = reserve_port();
    let world_size = 2;
    let client_rank = 1;

    std::thread::scope(|scope| {
        scope.spawn(move || {
            let engine = LocalEngine::new(&test_config(1, 1), 0);
            let mut comm = CommunicatorState::new(0, 1);
            comm.init("127.0.0.1", port, world_size).unwrap();

            let meta = TensorMeta {
                name: "w".to_string(),
                dtype: "float32".to_string(),
                shape: vec![2],
            };
            comm.update(&meta, &engine).unwrap();
            comm.update(&meta, &engine).unwrap();

            let landed = engine.named_param("w").unwrap();
            assert_eq!(
                landed.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                vec![2.0, 3.0]
            );
            comm.close();
        });

        scope.spawn(move || {
            let mut group =
                CollectiveGroup::join("127.0.0.1", port, client_rank, world_size).unwrap();
            for base in [0.0f32, 2.0] {
                let tensor =
                    Tensor::from_vec(vec![base, base + 1.0], &[2][..], &Device::Cpu).unwrap();
                let mut bytes = tensor_to_bytes(&tensor).unwrap();
                group.broadcast(&mut bytes, client_rank).unwrap();
                group.barrier().unwrap();
            }
        });
    });
}
