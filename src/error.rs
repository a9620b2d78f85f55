//! Error types for nano-vllm-sched.

use thiserror::Error;

/// Result type alias for nano-vllm-sched operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-vllm-sched.
#[derive(Error, Debug)]
pub enum Error {
    /// Sequence is longer than the model can ever extend.
    #[error("sequence {seq_id} too long: {len} tokens exceeds limit of {max_len}")]
    SequenceTooLong {
        seq_id: u64,
        len: usize,
        max_len: usize,
    },

    /// Sequence has no tokens to compute.
    #[error("sequence {0} is empty")]
    EmptySequence(u64),

    /// A sequence with this id is already tracked by the scheduler.
    #[error("sequence {0} already added")]
    DuplicateSequence(u64),

    /// Sequence not found in scheduler.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),

    /// Block allocation failed - no free blocks available.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// Nothing could be scheduled although requests are pending.
    #[error("scheduler produced an empty batch ({num_waiting} waiting, {num_running} running)")]
    EmptySchedule {
        num_waiting: usize,
        num_running: usize,
    },

    /// Sampled tokens and their batch indices disagree in length.
    #[error("got {num_tokens} sampled tokens for {num_indices} batch indices")]
    OutputMismatch {
        num_tokens: usize,
        num_indices: usize,
    },

    /// A sampled token refers to a position outside the scheduled batch.
    #[error("batch index {index} out of bounds (batch has {batch_size} entries)")]
    BatchIndexOutOfBounds { index: usize, batch_size: usize },

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Forward pass failed.
    #[error("model runner error: {0}")]
    ModelRunner(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
