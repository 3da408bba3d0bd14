//! HTTP control-plane surface
//!
//! Translates trainer requests into worker-pool commands and
//! reassembles per-shard results into one ordered response. Weight-sync
//! endpoints only arm the shards; the tensor payload crosses the
//! collective group directly between the trainer and the fleet.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use swapserve_common::tensor::ParamDType;
use swapserve_common::{ServeConfig, SwapServeError, METRICS};
use swapserve_proto::{
    ChatCompletion, ChatMessage, SamplingOptions, TensorMeta, WorkerCommand, WorkerReply,
};
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use crate::dispatch::{self, PLACEHOLDER_PROMPT};
use crate::pool::WorkerPool;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<WorkerPool>,
    pub config: Arc<ServeConfig>,
}

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Worker failure: {0}")]
    Worker(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<SwapServeError> for ApiError {
    fn from(err: SwapServeError) -> Self {
        match err {
            SwapServeError::InvalidInput(msg) => ApiError::BadRequest(msg),
            SwapServeError::Worker(msg) | SwapServeError::Channel(msg) => ApiError::Worker(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Convert ApiError into HTTP response
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        METRICS.coordinator.requests_failed.inc();
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Worker(msg) => {
                error!(error = %msg, "worker failure");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(json!({
            "success": false,
            "message": message,
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

fn default_n() -> usize {
    1
}

fn default_one() -> f32 {
    1.0
}

fn default_top_k() -> i64 {
    -1
}

fn default_max_tokens() -> usize {
    16
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompts: Vec<String>,
    #[serde(default = "default_n")]
    pub n: usize,
    #[serde(default = "default_one")]
    pub repetition_penalty: f32,
    #[serde(default = "default_one")]
    pub temperature: f32,
    #[serde(default = "default_one")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default)]
    pub min_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub guided_decoding_regex: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub completion_ids: Vec<Vec<u32>>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Vec<ChatMessage>>,
    #[serde(default = "default_n")]
    pub n: usize,
    #[serde(default = "default_one")]
    pub repetition_penalty: f32,
    #[serde(default = "default_one")]
    pub temperature: f32,
    #[serde(default = "default_one")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default)]
    pub min_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub guided_decoding_regex: Option<String>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub include_stop_str_in_output: bool,
    #[serde(default = "default_true")]
    pub skip_special_tokens: bool,
    #[serde(default = "default_true")]
    pub spaces_between_special_tokens: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub responses: Vec<ChatCompletion>,
}

#[derive(Debug, Deserialize)]
pub struct InitCommunicatorRequest {
    pub host: String,
    pub port: u16,
    pub world_size: usize,
}

#[derive(Debug, Deserialize)]
pub struct UpdateWeightsRequest {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct WorldSizeResponse {
    pub world_size: usize,
}

/// Build the control-plane router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/", get(health))
        .route("/get_world_size/", get(get_world_size))
        .route("/generate/", post(generate))
        .route("/chat/", post(chat))
        .route("/init_communicator/", post(init_communicator))
        .route("/update_named_param/", post(update_named_param))
        .route("/reset_prefix_cache/", post(reset_prefix_cache))
        .route("/close_communicator/", post(close_communicator))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_world_size(State(state): State<AppState>) -> Json<WorldSizeResponse> {
    Json(WorldSizeResponse {
        world_size: state.config.fleet_world_size(),
    })
}

async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> ApiResult<Json<GenerateResponse>> {
    let request_id = Uuid::new_v4();
    let started = Instant::now();
    METRICS.coordinator.requests_total.inc();
    debug!(%request_id, prompts = req.prompts.len(), "generate request");

    let sampling = SamplingOptions {
        n: req.n,
        repetition_penalty: req.repetition_penalty,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        min_p: req.min_p,
        max_tokens: req.max_tokens,
        guided_decoding_regex: req.guided_decoding_regex,
        ..SamplingOptions::default()
    };

    let commands = dispatch::chunk_evenly(&req.prompts, state.pool.size())
        .into_iter()
        .map(|chunk| {
            let prompts = if chunk.is_empty() {
                vec![PLACEHOLDER_PROMPT.to_string()]
            } else {
                chunk
            };
            WorkerCommand::Generate {
                prompts,
                sampling: sampling.clone(),
            }
        })
        .collect();
    METRICS
        .coordinator
        .chunks_dispatched_total
        .inc_by(state.pool.size() as u64);

    let replies = state.pool.scatter_call(commands).await?;
    let completion_ids = collect_generated(replies)?;

    METRICS
        .coordinator
        .request_duration
        .observe(started.elapsed().as_secs_f64());
    Ok(Json(GenerateResponse { completion_ids }))
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Json<ChatResponse>> {
    let request_id = Uuid::new_v4();
    let started = Instant::now();
    METRICS.coordinator.requests_total.inc();
    debug!(%request_id, conversations = req.messages.len(), "chat request");

    let sampling = SamplingOptions {
        n: req.n,
        repetition_penalty: req.repetition_penalty,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        min_p: req.min_p,
        max_tokens: req.max_tokens,
        guided_decoding_regex: req.guided_decoding_regex,
        stop: req.stop,
        include_stop_str_in_output: req.include_stop_str_in_output,
        skip_special_tokens: req.skip_special_tokens,
        spaces_between_special_tokens: req.spaces_between_special_tokens,
    };

    let commands = dispatch::chunk_evenly(&req.messages, state.pool.size())
        .into_iter()
        .map(|chunk| {
            let conversations = if chunk.is_empty() {
                vec![dispatch::placeholder_conversation()]
            } else {
                chunk
            };
            WorkerCommand::Chat {
                conversations,
                sampling: sampling.clone(),
            }
        })
        .collect();
    METRICS
        .coordinator
        .chunks_dispatched_total
        .inc_by(state.pool.size() as u64);

    let replies = state.pool.scatter_call(commands).await?;
    let responses = collect_chat(replies)?;

    METRICS
        .coordinator
        .request_duration
        .observe(started.elapsed().as_secs_f64());
    Ok(Json(ChatResponse { responses }))
}

async fn init_communicator(
    State(state): State<AppState>,
    Json(req): Json<InitCommunicatorRequest>,
) -> ApiResult<Json<AckResponse>> {
    METRICS.coordinator.requests_total.inc();
    state
        .pool
        .broadcast_fire(WorkerCommand::InitCommunicator {
            host: req.host,
            port: req.port,
            world_size: req.world_size,
        })
        .await?;
    Ok(Json(AckResponse {
        message: "Request received, initializing communicator".to_string(),
    }))
}

async fn update_named_param(
    State(state): State<AppState>,
    Json(req): Json<UpdateWeightsRequest>,
) -> ApiResult<Json<AckResponse>> {
    METRICS.coordinator.requests_total.inc();
    let dtype = ParamDType::parse(&req.dtype).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state
        .pool
        .broadcast_fire(WorkerCommand::UpdateNamedParam {
            meta: TensorMeta {
                name: req.name,
                dtype: dtype.as_str().to_string(),
                shape: req.shape,
            },
        })
        .await?;
    Ok(Json(AckResponse {
        message: "Request received, updating named parameter".to_string(),
    }))
}

async fn reset_prefix_cache(State(state): State<AppState>) -> ApiResult<Json<ResetResponse>> {
    METRICS.coordinator.requests_total.inc();
    let replies = state
        .pool
        .broadcast_call(WorkerCommand::ResetPrefixCache)
        .await?;
    Ok(Json(ResetResponse {
        success: all_cache_reset(&replies),
    }))
}

async fn close_communicator(State(state): State<AppState>) -> ApiResult<Json<AckResponse>> {
    METRICS.coordinator.requests_total.inc();
    state
        .pool
        .broadcast_fire(WorkerCommand::CloseCommunicator)
        .await?;
    Ok(Json(AckResponse {
        message: "Request received, closing communicator".to_string(),
    }))
}

/// Flatten per-shard generate replies, in dispatch order, into one
/// `prompt × n` sequence of completions.
fn collect_generated(replies: Vec<WorkerReply>) -> ApiResult<Vec<Vec<u32>>> {
    let mut completion_ids = Vec::new();
    for reply in replies {
        match reply {
            WorkerReply::Generated { completions } => {
                for prompt in completions {
                    completion_ids.extend(prompt.completion_ids);
                }
            }
            WorkerReply::Error { message } => return Err(ApiError::Worker(message)),
            other => {
                return Err(ApiError::Internal(format!(
                    "unexpected shard reply: {:?}",
                    other
                )))
            }
        }
    }
    Ok(completion_ids)
}

/// Flatten per-shard chat replies in dispatch order.
fn collect_chat(replies: Vec<WorkerReply>) -> ApiResult<Vec<ChatCompletion>> {
    let mut responses = Vec::new();
    for reply in replies {
        match reply {
            WorkerReply::ChatCompleted {
                responses: mut chunk,
            } => responses.append(&mut chunk),
            WorkerReply::Error { message } => return Err(ApiError::Worker(message)),
            other => {
                return Err(ApiError::Internal(format!(
                    "unexpected shard reply: {:?}",
                    other
                )))
            }
        }
    }
    Ok(responses)
}

/// Logical AND over every shard's cache-reset result; any failure or
/// unexpected reply makes the summary false.
fn all_cache_reset(replies: &[WorkerReply]) -> bool {
    replies
        .iter()
        .all(|reply| matches!(reply, WorkerReply::CacheReset { ok: true }))
}
