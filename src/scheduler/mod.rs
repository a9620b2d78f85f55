//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - Admission of waiting sequences under a token budget
//! - Iteration-level continuation of running sequences
//! - Preemption when the KV cache runs out of blocks

pub mod batch;

pub use batch::{Scheduler, SchedulerOutputs};
