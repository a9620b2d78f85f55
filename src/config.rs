//! Configuration types for nano-vllm-sched.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of sequences in the running queue.
    pub max_num_seqs: usize,
    /// Token budget of a single `schedule` call.
    pub max_num_batched_tokens: usize,
    /// Hard ceiling on sequence length (prompt + generated).
    pub max_model_len: usize,
    /// Split long prefills across iterations to fit the token budget.
    pub enable_chunked_prefill: bool,
    /// Number of tokens per KV cache block.
    pub block_size: usize,
    /// Total number of blocks for KV cache.
    pub num_blocks: usize,
    /// End-of-sequence token ID.
    pub eos_token_id: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_num_batched_tokens: 4096,
            max_model_len: 4096,
            enable_chunked_prefill: true,
            block_size: 16,
            num_blocks: 1024,
            eos_token_id: 151643, // Qwen3 <|endoftext|>
        }
    }
}

impl SchedulerConfig {
    /// Load a configuration from a JSON file.
    ///
    /// Missing fields fall back to [`SchedulerConfig::default`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Largest sequence length a non-finished sequence may have.
    pub fn max_sequence_len(&self) -> usize {
        self.max_model_len.saturating_sub(1)
    }

    /// Check the configuration for values the scheduler cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when:
    /// - any size or budget is zero, or `max_model_len < 2`
    /// - the block pool cannot hold one maximum-length sequence
    /// - chunked prefill is disabled and the token budget is smaller than
    ///   the longest admissible sequence, which would starve that sequence
    ///   forever since its prefill can never be split
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.num_blocks == 0 {
            return Err(Error::Config(
                "block_size and num_blocks must be positive".to_string(),
            ));
        }
        if self.max_num_seqs == 0 || self.max_num_batched_tokens == 0 {
            return Err(Error::Config(
                "max_num_seqs and max_num_batched_tokens must be positive".to_string(),
            ));
        }
        if self.max_model_len < 2 {
            return Err(Error::Config(format!(
                "max_model_len must be at least 2, got {}",
                self.max_model_len
            )));
        }
        let capacity = self.block_size * self.num_blocks;
        if capacity < self.max_sequence_len() {
            return Err(Error::Config(format!(
                "KV cache holds {capacity} tokens, fewer than max_model_len - 1 = {}",
                self.max_sequence_len()
            )));
        }
        if !self.enable_chunked_prefill && self.max_num_batched_tokens < self.max_sequence_len() {
            return Err(Error::Config(format!(
                "max_num_batched_tokens ({}) < max_model_len - 1 ({}) with chunked prefill \
                 disabled; long prompts could never be scheduled",
                self.max_num_batched_tokens,
                self.max_sequence_len()
            )));
        }
        Ok(())
    }
}

/// Per-request sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (1.0 = no change).
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Keep generating after the end-of-sequence token.
    pub ignore_eos: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_tokens: 256,
            ignore_eos: false,
        }
    }
}
