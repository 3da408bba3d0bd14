//! SwapServe trainer client
//!
//! The trainer-side mirror of the control-plane protocol. HTTP calls
//! go through the coordinator; weight payloads do not. The client
//! participates in the collective group directly as the highest rank
//! and broadcasts tensors straight to every shard. The HTTP round-trip
//! of `update_named_param` only arms the shards for the broadcast.

pub mod error;

pub use error::{ClientError, Result};

use candle_core::Tensor;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use swapserve_common::collective::CollectiveGroup;
use swapserve_common::tensor::{dtype_string, tensor_to_bytes};
use swapserve_proto::{ChatCompletion, ChatMessage, SamplingOptions};
use tracing::{debug, info};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const INIT_ARM_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
struct WorldSizeBody {
    world_size: usize,
}

#[derive(Debug, Deserialize)]
struct GenerateBody {
    completion_ids: Vec<Vec<u32>>,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    responses: Vec<ChatCompletion>,
}

#[derive(Debug, Deserialize)]
struct ResetBody {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct AckBody {
    #[allow(dead_code)]
    message: String,
}

/// Blocking client for the SwapServe control plane.
pub struct TrainerClient {
    http: reqwest::blocking::Client,
    host: String,
    server_port: u16,
    group_port: u16,
    rank: Option<usize>,
    comm: Option<CollectiveGroup>,
}

impl TrainerClient {
    /// Build a client without probing the server.
    pub fn new(host: impl Into<String>, server_port: u16, group_port: u16) -> Self {
        Self {
            http: reqwest::blocking::Client::new(),
            host: host.into(),
            server_port,
            group_port,
            rank: None,
            comm: None,
        }
    }

    /// Build a client and wait until the coordinator answers its
    /// health check, up to `connection_timeout`.
    pub fn connect(
        host: impl Into<String>,
        server_port: u16,
        group_port: u16,
        connection_timeout: Duration,
    ) -> Result<Self> {
        let client = Self::new(host, server_port, group_port);
        client.check_server(connection_timeout, DEFAULT_RETRY_INTERVAL)?;
        Ok(client)
    }

    /// Poll the health endpoint until it answers or `total_timeout`
    /// elapses; each failed attempt waits `retry_interval`.
    pub fn check_server(&self, total_timeout: Duration, retry_interval: Duration) -> Result<()> {
        let url = self.url("/health/");
        let start = Instant::now();
        loop {
            match self.http.get(&url).send() {
                Ok(response) if response.status().is_success() => {
                    info!("coordinator is up");
                    return Ok(());
                }
                Ok(_) | Err(_) if start.elapsed() >= total_timeout => {
                    return Err(ClientError::Connectivity {
                        host: self.host.clone(),
                        port: self.server_port,
                        message: format!(
                            "no healthy response after {:.1}s",
                            total_timeout.as_secs_f64()
                        ),
                    });
                }
                _ => {}
            }
            debug!(
                "waiting for coordinator, retrying in {:.1}s",
                retry_interval.as_secs_f64()
            );
            std::thread::sleep(retry_interval);
        }
    }

    /// Request completions for a batch of prompts. Returns token-id
    /// lists grouped `prompt × n`, in prompt order.
    pub fn generate(&self, prompts: &[String], sampling: &SamplingOptions) -> Result<Vec<Vec<u32>>> {
        let body: GenerateBody = self.post_json(
            "/generate/",
            &json!({
                "prompts": prompts,
                "n": sampling.n,
                "repetition_penalty": sampling.repetition_penalty,
                "temperature": sampling.temperature,
                "top_p": sampling.top_p,
                "top_k": sampling.top_k,
                "min_p": sampling.min_p,
                "max_tokens": sampling.max_tokens,
                "guided_decoding_regex": sampling.guided_decoding_regex,
            }),
        )?;
        Ok(body.completion_ids)
    }

    /// Request chat completions for a batch of conversations.
    pub fn chat(
        &self,
        messages: &[Vec<ChatMessage>],
        sampling: &SamplingOptions,
    ) -> Result<Vec<ChatCompletion>> {
        let body: ChatBody = self.post_json(
            "/chat/",
            &json!({
                "messages": messages,
                "n": sampling.n,
                "repetition_penalty": sampling.repetition_penalty,
                "temperature": sampling.temperature,
                "top_p": sampling.top_p,
                "top_k": sampling.top_k,
                "min_p": sampling.min_p,
                "max_tokens": sampling.max_tokens,
                "guided_decoding_regex": sampling.guided_decoding_regex,
                "stop": sampling.stop,
                "include_stop_str_in_output": sampling.include_stop_str_in_output,
                "skip_special_tokens": sampling.skip_special_tokens,
                "spaces_between_special_tokens": sampling.spaces_between_special_tokens,
            }),
        )?;
        Ok(body.responses)
    }

    /// Join the weight-update group as the highest rank.
    ///
    /// Queries the fleet world size, arms every shard to rendezvous,
    /// then joins the group itself. One active membership at a time.
    pub fn init_communicator(&mut self) -> Result<()> {
        if self.comm.is_some() {
            return Err(ClientError::GroupState(
                "communicator already initialized; call close_communicator first".to_string(),
            ));
        }

        let fleet: WorldSizeBody = self.get_json("/get_world_size/")?;
        let world_size = fleet.world_size + 1;
        let rank = fleet.world_size;

        // Shards and the rank-0 hub are colocated with the coordinator;
        // they rendezvous locally while this process dials the host.
        let _ack: AckBody = self.post_json(
            "/init_communicator/",
            &json!({
                "host": "0.0.0.0",
                "port": self.group_port,
                "world_size": world_size,
            }),
        )?;

        // The arm command is fire-and-forget; give the fan-out a moment.
        std::thread::sleep(INIT_ARM_GRACE);

        let group = CollectiveGroup::join(&self.host, self.group_port, rank, world_size)
            .map_err(|e| ClientError::Collective(e.to_string()))?;
        info!(rank, world_size, "joined weight-update group");

        self.rank = Some(rank);
        self.comm = Some(group);
        Ok(())
    }

    /// Push one named tensor into every shard: arm over HTTP, then
    /// broadcast the payload and pass the barrier.
    pub fn update_named_param(&mut self, name: &str, weights: &Tensor) -> Result<()> {
        let rank = match (self.rank, self.comm.is_some()) {
            (Some(rank), true) => rank,
            _ => {
                return Err(ClientError::GroupState(
                    "communicator not initialized; call init_communicator first".to_string(),
                ))
            }
        };

        let dtype = dtype_string(weights).map_err(|e| ClientError::Tensor(e.to_string()))?;
        let shape: Vec<usize> = weights.dims().to_vec();
        let _ack: AckBody = self.post_json(
            "/update_named_param/",
            &json!({
                "name": name,
                "dtype": dtype,
                "shape": shape,
            }),
        )?;

        let mut payload =
            tensor_to_bytes(weights).map_err(|e| ClientError::Tensor(e.to_string()))?;
        let comm = self
            .comm
            .as_mut()
            .ok_or_else(|| ClientError::GroupState("communicator went away".to_string()))?;
        comm.broadcast(&mut payload, rank)
            .map_err(|e| ClientError::Collective(e.to_string()))?;
        comm.barrier()
            .map_err(|e| ClientError::Collective(e.to_string()))?;

        debug!(name, "named parameter pushed");
        Ok(())
    }

    /// Push every named parameter in sequence.
    pub fn update_named_params<'a, I>(&mut self, params: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a Tensor)>,
    {
        for (name, weights) in params {
            self.update_named_param(name, weights)?;
        }
        Ok(())
    }

    /// Ask every shard to clear its prefix cache; true only if all
    /// shards succeeded.
    pub fn reset_prefix_cache(&self) -> Result<bool> {
        let body: ResetBody = self.post_json("/reset_prefix_cache/", &json!({}))?;
        Ok(body.success)
    }

    /// Leave the weight-update group and tell the fleet to do the same.
    ///
    /// Connectivity errors are swallowed: teardown races against fleet
    /// shutdown are expected, and an unreachable coordinator means the
    /// group is already gone.
    pub fn close_communicator(&mut self) -> Result<()> {
        self.comm = None;
        self.rank = None;

        match self.post_json::<serde_json::Value, AckBody>("/close_communicator/", &json!({})) {
            Ok(_) => Ok(()),
            Err(ClientError::Connectivity { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.server_port, path)
    }

    fn connectivity(&self, err: reqwest::Error) -> ClientError {
        ClientError::Connectivity {
            host: self.host.clone(),
            port: self.server_port,
            message: err.to_string(),
        }
    }

    fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .map_err(|e| self.connectivity(e))?;
        Self::parse(response)
    }

    fn post_json<B: serde::Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .map_err(|e| self.connectivity(e))?;
        Self::parse(response)
    }

    fn parse<R: DeserializeOwned>(response: reqwest::blocking::Response) -> Result<R> {
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Protocol {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        response.json().map_err(|e| ClientError::Protocol {
            status: status.as_u16(),
            body: format!("invalid response body: {}", e),
        })
    }
}

impl Drop for TrainerClient {
    fn drop(&mut self) {
        if self.comm.is_some() {
            let _ = self.close_communicator();
        }
    }
}
