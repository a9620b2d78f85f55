//! nano-vllm-sched: the continuous-batching core of an LLM inference server.
//!
//! This crate implements iteration-level scheduling over a paged KV cache:
//! - Continuous batching with a per-iteration token budget
//! - Chunked prefill for long prompts
//! - Preemption under KV cache pressure
//! - Prefix caching for shared prompts

pub mod config;
pub mod error;
pub mod logging;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::{SamplingConfig, SchedulerConfig};
pub use crate::core::block_manager::{BlockAllocator, BlockManager, TokenLayout};
pub use crate::core::sequence::{FinishReason, Sequence, SequenceId, SequenceStatus};
pub use engine::{GenerationOutput, GenerationRequest, LLMEngine, ModelRunner, SyntheticRunner};
pub use error::{Error, Result};
pub use scheduler::{Scheduler, SchedulerOutputs};
