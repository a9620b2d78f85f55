//! Inference engine.
//!
//! This module contains:
//! - LLMEngine: Driver loop around the scheduler
//! - ModelRunner: Forward-pass interface, with a synthetic implementation

pub mod llm;
pub mod runner;

pub use llm::{EngineStats, GenerationOutput, GenerationRequest, LLMEngine};
pub use runner::{ModelRunner, SyntheticRunner};
