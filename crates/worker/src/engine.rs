//! Shard engine capability set
//!
//! The forward pass itself is an external concern; what the fleet
//! requires of an engine is the capability set below: generation, chat,
//! prefix-cache reset, and in-place named-parameter replacement. The
//! shard *has* an engine (and separately a weight-sync component),
//! not an inheritance relationship with one.
//!
//! `LocalEngine` is the in-process implementation: byte-level
//! tokenization and deterministic hash-chain sampling, so routing,
//! ordering, and hot-swap behavior are fully observable in tests. Its
//! outputs change whenever a parameter is swapped, which is what makes
//! weight updates visible end to end.

use candle_core::Tensor;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use swapserve_common::{Result, ServeConfig, SwapServeError, METRICS};
use swapserve_proto::{ChatChoice, ChatCompletion, ChatMessage, PromptCompletions, SamplingOptions};
use tracing::{debug, info};

const VOCAB_SIZE: u32 = 32_000;
const DEFAULT_MAX_MODEL_LEN: usize = 4096;

/// Capability set every inference shard must expose.
pub trait ShardEngine: Send + Sync {
    /// Generate `sampling.n` completions for each prompt, in prompt order.
    fn generate(
        &self,
        prompts: &[String],
        sampling: &SamplingOptions,
    ) -> Result<Vec<PromptCompletions>>;

    /// Run chat completion for each conversation, in conversation order.
    fn chat(
        &self,
        conversations: &[Vec<ChatMessage>],
        sampling: &SamplingOptions,
    ) -> Result<Vec<ChatCompletion>>;

    /// Clear locally cached prefix state.
    fn reset_prefix_cache(&self) -> Result<bool>;

    /// Replace the live parameter `name` in place.
    fn load_named_param(&self, name: &str, tensor: Tensor) -> Result<()>;

    /// Look up a live parameter by name.
    fn named_param(&self, name: &str) -> Option<Tensor>;
}

/// Structured decoding constraint translated from a raw regex string.
///
/// The control plane forwards the string untouched; translation happens
/// here: the pattern is compiled, and a token mask is derived from the
/// characters the pattern can produce.
pub struct GuidedSpec {
    pattern: Regex,
    allowed: Vec<u32>,
}

impl GuidedSpec {
    pub fn from_regex(raw: &str) -> Result<Self> {
        let pattern = Regex::new(raw).map_err(|e| {
            SwapServeError::invalid_input(format!("invalid guided decoding regex: {}", e))
        })?;

        let literal: HashSet<char> = raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        let allowed = (0..VOCAB_SIZE)
            .filter(|t| literal.contains(&decode_token(*t)))
            .collect();

        Ok(Self { pattern, allowed })
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }
}

/// Deterministic in-process engine holding live named parameters.
pub struct LocalEngine {
    model_id: String,
    dp_rank: usize,
    max_model_len: usize,
    prefix_caching: bool,
    params: RwLock<HashMap<String, Tensor>>,
    prefix_cache: Mutex<HashSet<u64>>,
    /// Bumped on every hot-swap; seeds sampling so updated weights
    /// produce visibly different completions.
    version: AtomicU64,
}

impl LocalEngine {
    pub fn new(config: &ServeConfig, dp_rank: usize) -> Self {
        info!(
            model = %config.model,
            dp_rank,
            tensor_parallel_size = config.tensor_parallel_size,
            dtype = %config.dtype,
            "local engine initialized"
        );
        Self {
            model_id: config.model.clone(),
            dp_rank,
            max_model_len: config.max_model_len.unwrap_or(DEFAULT_MAX_MODEL_LEN),
            prefix_caching: config.enable_prefix_caching.unwrap_or(true),
            params: RwLock::new(HashMap::new()),
            prefix_cache: Mutex::new(HashSet::new()),
            version: AtomicU64::new(0),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    fn completion_budget(&self, prompt_len: usize, max_tokens: usize) -> usize {
        self.max_model_len.saturating_sub(prompt_len).min(max_tokens)
    }

    fn sample(&self, prompt: &str, sample_idx: usize, budget: usize, guided: Option<&GuidedSpec>) -> Vec<u32> {
        let version = self.version.load(Ordering::Relaxed);
        let seed = mix_seed(fnv1a(prompt.as_bytes()), sample_idx as u64, version);
        sample_tokens(seed, budget, guided)
    }
}

impl ShardEngine for LocalEngine {
    fn generate(
        &self,
        prompts: &[String],
        sampling: &SamplingOptions,
    ) -> Result<Vec<PromptCompletions>> {
        let guided = sampling
            .guided_decoding_regex
            .as_deref()
            .map(GuidedSpec::from_regex)
            .transpose()?;
        let n = sampling.n.max(1);

        let mut results = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            if self.prefix_caching {
                self.prefix_cache.lock().insert(fnv1a(prompt.as_bytes()));
            }
            let budget = self.completion_budget(prompt.len(), sampling.max_tokens);
            let completion_ids = (0..n)
                .map(|idx| self.sample(prompt, idx, budget, guided.as_ref()))
                .collect();
            results.push(PromptCompletions { completion_ids });
        }

        METRICS.worker.prompts_total.inc_by(prompts.len() as u64);
        debug!(dp_rank = self.dp_rank, prompts = prompts.len(), "generate chunk complete");
        Ok(results)
    }

    fn chat(
        &self,
        conversations: &[Vec<ChatMessage>],
        sampling: &SamplingOptions,
    ) -> Result<Vec<ChatCompletion>> {
        let guided = sampling
            .guided_decoding_regex
            .as_deref()
            .map(GuidedSpec::from_regex)
            .transpose()?;
        let n = sampling.n.max(1);

        let mut results = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let rendered = render_conversation(conversation);
            if self.prefix_caching {
                self.prefix_cache.lock().insert(fnv1a(rendered.as_bytes()));
            }
            let prompt_token_ids = byte_tokens(&rendered);
            let budget = self.completion_budget(prompt_token_ids.len(), sampling.max_tokens);

            let mut outputs = Vec::with_capacity(n);
            for idx in 0..n {
                let mut token_ids = self.sample(&rendered, idx, budget, guided.as_ref());
                let mut text = decode_tokens(&token_ids);

                if let Some(stops) = &sampling.stop {
                    if let Some((at, stop_len)) = earliest_stop(&text, stops) {
                        let end = if sampling.include_stop_str_in_output {
                            at + stop_len
                        } else {
                            at
                        };
                        // one decoded character per token
                        text.truncate(end);
                        token_ids.truncate(end);
                    }
                }

                outputs.push(ChatChoice { token_ids, text });
            }
            results.push(ChatCompletion {
                prompt_token_ids,
                outputs,
            });
        }

        METRICS.worker.prompts_total.inc_by(conversations.len() as u64);
        debug!(dp_rank = self.dp_rank, conversations = conversations.len(), "chat chunk complete");
        Ok(results)
    }

    fn reset_prefix_cache(&self) -> Result<bool> {
        let mut cache = self.prefix_cache.lock();
        let entries = cache.len();
        cache.clear();
        debug!(dp_rank = self.dp_rank, entries, "prefix cache cleared");
        Ok(true)
    }

    fn load_named_param(&self, name: &str, tensor: Tensor) -> Result<()> {
        if name.is_empty() {
            return Err(SwapServeError::invalid_input(
                "parameter name must not be empty",
            ));
        }
        let mut params = self.params.write();
        params.insert(name.to_string(), tensor);
        METRICS.worker.params_loaded.set(params.len() as i64);
        self.version.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn named_param(&self, name: &str) -> Option<Tensor> {
        self.params.read().get(name).cloned()
    }
}

/// Byte-level tokenization: one token per input byte.
fn byte_tokens(text: &str) -> Vec<u32> {
    text.bytes().map(u32::from).collect()
}

/// Decode a token id to one printable ASCII character.
fn decode_token(token: u32) -> char {
    char::from(33 + (token % 94) as u8)
}

fn decode_tokens(tokens: &[u32]) -> String {
    tokens.iter().map(|t| decode_token(*t)).collect()
}

fn render_conversation(conversation: &[ChatMessage]) -> String {
    let mut rendered = conversation
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    rendered.push_str("\nassistant:");
    rendered
}

fn earliest_stop(text: &str, stops: &[String]) -> Option<(usize, usize)> {
    let mut found: Option<(usize, usize)> = None;
    for stop in stops {
        if stop.is_empty() {
            continue;
        }
        if let Some(at) = text.find(stop.as_str()) {
            if found.map_or(true, |(best, _)| at < best) {
                found = Some((at, stop.len()));
            }
        }
    }
    found
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn mix_seed(prompt_hash: u64, sample_idx: u64, version: u64) -> u64 {
    prompt_hash ^ sample_idx.rotate_left(17) ^ version.rotate_left(41)
}

fn sample_tokens(seed: u64, budget: usize, guided: Option<&GuidedSpec>) -> Vec<u32> {
    let mut state = seed | 1;
    let mut tokens = Vec::with_capacity(budget);
    for _ in 0..budget {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let raw = state >> 33;
        let token = match guided {
            Some(spec) if !spec.allowed.is_empty() => {
                spec.allowed[(raw % spec.allowed.len() as u64) as usize]
            }
            _ => (raw % u64::from(VOCAB_SIZE)) as u32,
        };
        tokens.push(token);
    }
    tokens
}
