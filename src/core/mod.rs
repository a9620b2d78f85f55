//! Core infrastructure for nano-vllm-sched.
//!
//! This module contains the fundamental building blocks:
//! - Block and BlockTable for the paged KV cache
//! - BlockAllocator / BlockManager for memory allocation
//! - Sequence for request tracking

pub mod block;
pub mod block_manager;
pub mod sequence;
