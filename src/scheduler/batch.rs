//! Continuous batching scheduler.
//!
//! Every iteration the scheduler picks which sequences get a slice of the
//! forward pass, under a per-call token budget and a fixed pool of KV cache
//! blocks.
//!
//! ## Scheduling Flow
//!
//! ```text
//!   add()                                              schedule()
//!     │                                                    │
//!     ▼                                                    ▼
//!   ┌─────────┐   phase B: admit head while it fits   ┌─────────┐
//!   │ Waiting │ ────────────────────────────────────► │ Running │
//!   │  Queue  │                                       │  Queue  │
//!   └─────────┘ ◄──────────────────────────────────── └─────────┘
//!     ▲  front     phase A: evict from running tail        │
//!     │            when a continuing sequence can't grow   │ postprocess()
//!                                                          ▼
//!                                                      Finished
//! ```
//!
//! Phase A continues running sequences in order. When one cannot grow, the
//! most recently admitted sequences are preempted from the tail until it
//! fits; if the candidate itself has to go, phase A stops for this call.
//! Preempted sequences are pushed to the front of the waiting queue so the
//! work they already made progress on is retried before requests that never
//! started. Phase B only runs when phase A preempted nothing, and stops at
//! the first waiting sequence that does not fit.
//!
//! ## Example
//!
//! ```
//! use nano_vllm_sched::core::sequence::Sequence;
//! use nano_vllm_sched::{Scheduler, SchedulerConfig};
//!
//! let mut scheduler = Scheduler::new(SchedulerConfig::default());
//! scheduler.add(Sequence::new(1, vec![1, 2, 3, 4])).unwrap();
//!
//! let outputs = scheduler.schedule().unwrap();
//! assert_eq!(outputs.all_sequence_ids(), vec![1]);
//! assert_eq!(outputs.sample_indices, vec![0]);
//!
//! let finished = scheduler.postprocess(&outputs, &[7], &outputs.sample_indices).unwrap();
//! assert!(finished.is_empty());
//! assert_eq!(scheduler.get_sequence(1).unwrap().num_cached_tokens(), 4);
//! ```

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::core::block::compute_num_blocks;
use crate::core::block_manager::{BlockAllocator, BlockManager};
use crate::core::sequence::{FinishReason, Sequence, SequenceId};
use crate::error::{Error, Result};

/// Output of a scheduling step.
///
/// The batch is the continuing sequences followed by the newly admitted
/// ones; positions in [`all_sequence_ids`](Self::all_sequence_ids) are the
/// indices `postprocess` expects.
#[derive(Debug, Default, Clone)]
pub struct SchedulerOutputs {
    /// Running sequences continued this iteration, in running-queue order.
    pub running_sequences: Vec<SequenceId>,
    /// Waiting sequences admitted this iteration.
    pub new_sequences: Vec<SequenceId>,
    /// Sequences evicted back to the waiting queue this iteration.
    pub preempted_sequences: Vec<SequenceId>,
    /// Batch positions that complete their sequence and need a sampled token.
    pub sample_indices: Vec<usize>,
    /// Total number of tokens to compute this iteration.
    pub num_batched_tokens: usize,
}

impl SchedulerOutputs {
    /// Create empty scheduler outputs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if there are any sequences to process.
    pub fn is_empty(&self) -> bool {
        self.running_sequences.is_empty() && self.new_sequences.is_empty()
    }

    /// Total number of sequences to process.
    pub fn num_sequences(&self) -> usize {
        self.running_sequences.len() + self.new_sequences.len()
    }

    /// The ordered batch: continuing sequences, then admitted ones.
    pub fn all_sequence_ids(&self) -> Vec<SequenceId> {
        let mut ids = self.running_sequences.clone();
        ids.extend(&self.new_sequences);
        ids
    }
}

/// Continuous batching scheduler.
///
/// Owns every unfinished sequence. Sequences move between the waiting and
/// running queues and leave the scheduler when `postprocess` finishes them.
/// All mutating operations take `&mut self`; concurrent drivers must
/// serialize access to the scheduler as a whole.
pub struct Scheduler<A: BlockAllocator = BlockManager> {
    config: SchedulerConfig,
    block_manager: A,
    sequences: HashMap<SequenceId, Sequence>,
    /// FIFO of waiting sequences; preempted sequences re-enter at the front.
    waiting: VecDeque<SequenceId>,
    /// Running sequences in admission order.
    running: VecDeque<SequenceId>,
}

impl Scheduler<BlockManager> {
    /// Create a scheduler backed by an in-process [`BlockManager`] sized from
    /// the configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        let block_manager = BlockManager::new(config.num_blocks, config.block_size);
        Self::with_allocator(config, block_manager)
    }
}

impl<A: BlockAllocator> Scheduler<A> {
    /// Create a scheduler over an arbitrary allocator.
    ///
    /// `config.block_size` must match the allocator's block size; it is used
    /// to turn admission token counts into block counts.
    pub fn with_allocator(config: SchedulerConfig, block_manager: A) -> Self {
        Self {
            config,
            block_manager,
            sequences: HashMap::new(),
            waiting: VecDeque::new(),
            running: VecDeque::new(),
        }
    }

    /// Register a new request at the tail of the waiting queue.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptySequence`] if the sequence has no tokens
    /// - [`Error::SequenceTooLong`] if the sequence exceeds `max_model_len - 1`
    /// - [`Error::DuplicateSequence`] if the id is already tracked
    pub fn add(&mut self, seq: Sequence) -> Result<()> {
        let seq_id = seq.seq_id();
        let max_len = self.config.max_sequence_len();

        if seq.total_len() == 0 {
            return Err(Error::EmptySequence(seq_id));
        }
        if seq.total_len() > max_len {
            return Err(Error::SequenceTooLong {
                seq_id,
                len: seq.total_len(),
                max_len,
            });
        }
        if self.sequences.contains_key(&seq_id) {
            return Err(Error::DuplicateSequence(seq_id));
        }

        debug!(seq_id, num_tokens = seq.total_len(), "sequence added");
        self.sequences.insert(seq_id, seq);
        self.waiting.push_back(seq_id);
        Ok(())
    }

    /// True when neither queue holds a sequence.
    pub fn is_finished(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }

    /// Schedule the next iteration.
    ///
    /// Every returned sequence has `num_new_tokens` set to the number of
    /// positions the forward pass must compute for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptySchedule`] if sequences are pending but none
    /// could be scheduled. With chunked prefill disabled this happens when
    /// the waiting head needs more tokens than the whole budget; see
    /// [`SchedulerConfig::validate`].
    pub fn schedule(&mut self) -> Result<SchedulerOutputs> {
        let mut outputs = SchedulerOutputs::new();
        if self.is_finished() {
            return Ok(outputs);
        }

        let token_budget = self.config.max_num_batched_tokens;
        let token_budget = self.schedule_running(&mut outputs, token_budget)?;
        if outputs.preempted_sequences.is_empty() {
            self.schedule_waiting(&mut outputs, token_budget)?;
        }

        if outputs.is_empty() {
            return Err(Error::EmptySchedule {
                num_waiting: self.waiting.len(),
                num_running: self.running.len(),
            });
        }

        for (index, seq_id) in outputs.all_sequence_ids().into_iter().enumerate() {
            let seq = self.get(seq_id)?;
            outputs.num_batched_tokens += seq.num_new_tokens();
            if seq.num_cached_tokens() + seq.num_new_tokens() == seq.total_len() {
                outputs.sample_indices.push(index);
            }
        }

        debug!(
            num_running = outputs.running_sequences.len(),
            num_new = outputs.new_sequences.len(),
            num_preempted = outputs.preempted_sequences.len(),
            num_batched_tokens = outputs.num_batched_tokens,
            "scheduled batch"
        );
        Ok(outputs)
    }

    /// Phase A: continue running sequences, preempting from the tail.
    ///
    /// Returns the remaining token budget.
    fn schedule_running(
        &mut self,
        outputs: &mut SchedulerOutputs,
        mut token_budget: usize,
    ) -> Result<usize> {
        let max_len = self.config.max_sequence_len();
        let mut req_index = 0;

        while req_index < self.running.len() && token_budget > 0 {
            let seq_id = self.running[req_index];
            let seq = self.get(seq_id)?;

            let mut num_new_tokens = seq.total_len() - seq.num_cached_tokens();
            if self.config.enable_chunked_prefill {
                num_new_tokens = num_new_tokens.min(token_budget);
            }
            num_new_tokens = num_new_tokens.min(max_len.saturating_sub(seq.num_cached_tokens()));
            assert!(
                num_new_tokens > 0,
                "running sequence {seq_id} has no tokens to compute"
            );

            let fits = loop {
                let seq = self.get(seq_id)?;
                if self.block_manager.can_append(seq, num_new_tokens) {
                    break true;
                }
                let Some(victim) = self.running.pop_back() else {
                    break false;
                };
                self.preempt(victim)?;
                outputs.preempted_sequences.push(victim);
                if self.running.len() == req_index {
                    break false;
                }
            };
            if !fits {
                break;
            }

            let seq = self
                .sequences
                .get_mut(&seq_id)
                .ok_or(Error::SequenceNotFound(seq_id))?;
            seq.set_num_new_tokens(num_new_tokens);
            self.block_manager.may_append(seq)?;

            outputs.running_sequences.push(seq_id);
            token_budget = token_budget.saturating_sub(num_new_tokens);
            req_index += 1;
        }

        Ok(token_budget)
    }

    /// Phase B: admit waiting sequences from the head of the queue.
    ///
    /// Returns the remaining token budget.
    fn schedule_waiting(
        &mut self,
        outputs: &mut SchedulerOutputs,
        mut token_budget: usize,
    ) -> Result<usize> {
        while let Some(&seq_id) = self.waiting.front() {
            if token_budget == 0 || self.running.len() >= self.config.max_num_seqs {
                break;
            }

            let seq = self
                .sequences
                .get_mut(&seq_id)
                .ok_or(Error::SequenceNotFound(seq_id))?;
            assert!(
                seq.block_table().is_empty(),
                "waiting sequence {seq_id} still holds blocks"
            );

            let layout = self.block_manager.get_token_layout(seq);
            let mut num_new_tokens = layout.fresh_tokens;
            if self.config.enable_chunked_prefill {
                num_new_tokens = num_new_tokens.min(token_budget);
            }
            assert!(
                num_new_tokens > 0,
                "waiting sequence {seq_id} has no tokens to compute"
            );

            let num_blocks = compute_num_blocks(
                layout.reusable_free_tokens + num_new_tokens,
                self.config.block_size,
            );
            if num_new_tokens > token_budget || !self.block_manager.can_allocate(num_blocks) {
                break;
            }

            seq.set_num_new_tokens(num_new_tokens);
            self.block_manager.allocate(seq)?;
            assert_eq!(
                seq.num_cached_tokens(),
                layout.num_cached_tokens(),
                "allocator cached-token count disagrees with its layout for sequence {seq_id}"
            );
            seq.set_running()?;

            debug!(
                seq_id,
                num_new_tokens,
                num_cached_tokens = seq.num_cached_tokens(),
                "admitted sequence"
            );
            token_budget -= num_new_tokens;
            self.waiting.pop_front();
            self.running.push_back(seq_id);
            outputs.new_sequences.push(seq_id);
        }

        Ok(token_budget)
    }

    /// Evict a running sequence back to the front of the waiting queue.
    fn preempt(&mut self, seq_id: SequenceId) -> Result<()> {
        let seq = self
            .sequences
            .get_mut(&seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        seq.set_waiting()?;
        seq.set_num_new_tokens(0);
        self.block_manager.deallocate(seq);
        self.waiting.push_front(seq_id);

        debug!(seq_id, num_tokens = seq.total_len(), "preempted sequence");
        Ok(())
    }

    /// Fold the results of a forward pass back into sequence state.
    ///
    /// `token_ids[i]` is the token sampled for batch position
    /// `sample_indices[i]`. Entries still mid-prefill produce no token and
    /// are left out of both lists.
    ///
    /// Returns the sequences that finished, in sampling order. They are no
    /// longer tracked by the scheduler.
    ///
    /// # Errors
    ///
    /// - [`Error::OutputMismatch`] if the two lists differ in length
    /// - [`Error::BatchIndexOutOfBounds`] if an index is outside the batch
    pub fn postprocess(
        &mut self,
        outputs: &SchedulerOutputs,
        token_ids: &[u32],
        sample_indices: &[usize],
    ) -> Result<Vec<Sequence>> {
        if token_ids.len() != sample_indices.len() {
            return Err(Error::OutputMismatch {
                num_tokens: token_ids.len(),
                num_indices: sample_indices.len(),
            });
        }

        let batch = outputs.all_sequence_ids();
        let mut finished_ids = Vec::new();

        for (&index, &token_id) in sample_indices.iter().zip(token_ids) {
            let seq_id = *batch.get(index).ok_or(Error::BatchIndexOutOfBounds {
                index,
                batch_size: batch.len(),
            })?;
            let seq = self
                .sequences
                .get_mut(&seq_id)
                .ok_or(Error::SequenceNotFound(seq_id))?;
            seq.append_token(token_id);

            let hit_max_model_len = seq.total_len() >= self.config.max_model_len;
            if hit_max_model_len {
                warn!(
                    seq_id,
                    max_model_len = self.config.max_model_len,
                    "sequence reached max_model_len"
                );
            }

            let reason = if !seq.ignore_eos() && token_id == self.config.eos_token_id {
                Some(FinishReason::EndOfSequence)
            } else if seq.num_completion_tokens() >= seq.max_tokens() {
                Some(FinishReason::MaxTokens)
            } else if hit_max_model_len {
                Some(FinishReason::MaxModelLen)
            } else {
                None
            };

            if let Some(reason) = reason {
                seq.set_finished(reason);
                self.block_manager.deallocate(seq);
                self.running.retain(|&id| id != seq_id);
                finished_ids.push(seq_id);
                debug!(seq_id, ?reason, "sequence finished");
            }
        }

        for seq_id in &batch {
            if let Some(seq) = self.sequences.get_mut(seq_id) {
                if !seq.status().is_finished() {
                    seq.commit_new_tokens();
                }
            }
        }

        Ok(finished_ids
            .iter()
            .filter_map(|seq_id| self.sequences.remove(seq_id))
            .collect())
    }

    fn get(&self, seq_id: SequenceId) -> Result<&Sequence> {
        self.sequences
            .get(&seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))
    }

    /// Get a reference to a tracked sequence.
    pub fn get_sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.sequences.get(&seq_id)
    }

    /// Resolve a scheduled batch into its sequences, in batch order.
    pub fn batch_sequences(&self, outputs: &SchedulerOutputs) -> Result<Vec<&Sequence>> {
        outputs
            .all_sequence_ids()
            .into_iter()
            .map(|seq_id| self.get(seq_id))
            .collect()
    }

    /// Get number of waiting sequences.
    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Get number of running sequences.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Waiting sequence IDs, head first.
    pub fn waiting_sequence_ids(&self) -> Vec<SequenceId> {
        self.waiting.iter().copied().collect()
    }

    /// Running sequence IDs in admission order.
    pub fn running_sequence_ids(&self) -> Vec<SequenceId> {
        self.running.iter().copied().collect()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get block manager reference.
    pub fn block_manager(&self) -> &A {
        &self.block_manager
    }

    /// Get mutable block manager reference.
    pub fn block_manager_mut(&mut self) -> &mut A {
        &mut self.block_manager
    }
}
