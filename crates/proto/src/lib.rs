//! SwapServe control-channel protocol
//!
//! Message types exchanged between the coordinator and its shard
//! processes. Large tensor payloads never travel on this channel; they
//! are delivered out-of-band over the collective group, and only the
//! `(name, dtype, shape)` descriptor is carried here.

pub mod channel;

use serde::{Deserialize, Serialize};

/// How a command is delivered to a shard.
///
/// `Call` commands block the sender until the shard replies;
/// `FireAndForget` commands never produce a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Call,
    FireAndForget,
}

/// A single unit of work sent over a shard's duplex channel.
///
/// Frames on one channel are consumed strictly in send order; no
/// ordering is guaranteed across shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    pub mode: DeliveryMode,
    pub command: WorkerCommand,
}

impl CommandFrame {
    /// Build a call-type frame (the sender will wait for one reply).
    pub fn call(command: WorkerCommand) -> Self {
        Self {
            mode: DeliveryMode::Call,
            command,
        }
    }

    /// Build a fire-and-forget frame (no reply will be produced).
    pub fn fire(command: WorkerCommand) -> Self {
        Self {
            mode: DeliveryMode::FireAndForget,
            command,
        }
    }
}

/// Commands understood by a shard process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Run generation over a chunk of prompts.
    Generate {
        prompts: Vec<String>,
        sampling: SamplingOptions,
    },

    /// Run chat completion over a chunk of conversations.
    Chat {
        conversations: Vec<Vec<ChatMessage>>,
        sampling: SamplingOptions,
    },

    /// Clear the shard's prefix cache.
    ResetPrefixCache,

    /// Join the weight-update collective group at `(host, port)`.
    InitCommunicator {
        host: String,
        port: u16,
        world_size: usize,
    },

    /// Arm the shard to receive one named tensor over the collective
    /// group and hot-swap it into the live model.
    UpdateNamedParam { meta: TensorMeta },

    /// Leave the collective group. Idempotent.
    CloseCommunicator,

    /// Exit the command loop.
    Shutdown,
}

/// Replies sent from a shard back to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    /// First frame after connecting: identifies the shard's rank.
    Hello { dp_rank: usize },

    /// The shard's engine is constructed and it can accept commands.
    Ready,

    /// Result of a `Generate` call, one entry per prompt in chunk order.
    Generated { completions: Vec<PromptCompletions> },

    /// Result of a `Chat` call, one entry per conversation.
    ChatCompleted { responses: Vec<ChatCompletion> },

    /// Result of a `ResetPrefixCache` call.
    CacheReset { ok: bool },

    /// Generic acknowledgement for call-mode delivery of commands that
    /// carry no payload in their result.
    Ack,

    /// The command failed on the shard.
    Error { message: String },
}

/// Sampling parameters forwarded verbatim to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingOptions {
    pub n: usize,
    pub repetition_penalty: f32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i64,
    pub min_p: f32,
    pub max_tokens: usize,
    /// Raw regular-expression constraint; the shard translates it into
    /// a structured decoding constraint.
    pub guided_decoding_regex: Option<String>,
    pub stop: Option<Vec<String>>,
    pub include_stop_str_in_output: bool,
    pub skip_special_tokens: bool,
    pub spaces_between_special_tokens: bool,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            n: 1,
            repetition_penalty: 1.0,
            temperature: 1.0,
            top_p: 1.0,
            top_k: -1,
            min_p: 0.0,
            max_tokens: 16,
            guided_decoding_regex: None,
            stop: None,
            include_stop_str_in_output: false,
            skip_special_tokens: true,
            spaces_between_special_tokens: true,
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Completions for a single prompt: `n` token-id sequences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptCompletions {
    pub completion_ids: Vec<Vec<u32>>,
}

/// One chat choice: generated token ids plus decoded text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub token_ids: Vec<u32>,
    pub text: String,
}

/// Chat result for a single conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub prompt_token_ids: Vec<u32>,
    pub outputs: Vec<ChatChoice>,
}

/// Descriptor of a named parameter whose payload arrives via the
/// collective broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorMeta {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
}

impl TensorMeta {
    /// Number of scalar elements described by `shape`.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_round_trips_through_json() {
        let frame = CommandFrame::call(WorkerCommand::Generate {
            prompts: vec!["hello".to_string()],
            sampling: SamplingOptions::default(),
        });

        let encoded = serde_json::to_string(&frame).unwrap();
        let decoded: CommandFrame = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.mode, DeliveryMode::Call);
        match decoded.command {
            WorkerCommand::Generate { prompts, sampling } => {
                assert_eq!(prompts, vec!["hello".to_string()]);
                assert_eq!(sampling.max_tokens, 16);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn fire_frames_are_tagged() {
        let frame = CommandFrame::fire(WorkerCommand::CloseCommunicator);
        assert_eq!(frame.mode, DeliveryMode::FireAndForget);
    }

    #[test]
    fn tensor_meta_element_count() {
        let meta = TensorMeta {
            name: "w".to_string(),
            dtype: "float32".to_string(),
            shape: vec![4, 4],
        };
        assert_eq!(meta.element_count(), 16);
    }

    #[test]
    fn sampling_defaults_match_contract() {
        let s = SamplingOptions::default();
        assert_eq!(s.n, 1);
        assert_eq!(s.top_k, -1);
        assert!(s.skip_special_tokens);
        assert!(!s.include_stop_str_in_output);
    }
}
