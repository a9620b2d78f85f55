//! Per-request state owned by the scheduler.
//!
//! Besides the tokens themselves, a [`Sequence`] records how far its KV
//! cache has been computed and which physical blocks hold it.

use crate::config::SamplingConfig;
use crate::core::block::BlockTable;
use crate::error::{Error, Result};

/// Request identifier, unique among live sequences.
pub type SequenceId = u64;

/// Lifecycle state.
///
/// `Waiting -> Running` on admission, `Running -> Waiting` on preemption,
/// and any state to `Finished` once a stop condition is met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Queued for admission, holding no blocks. Fresh or preempted.
    Waiting,
    /// Admitted and holding blocks.
    Running,
    Finished,
}

impl SequenceStatus {
    pub fn is_finished(&self) -> bool {
        *self == Self::Finished
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Finished => "Finished",
        }
    }
}

/// Why a sequence stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Sampled the end-of-sequence token.
    EndOfSequence,
    /// Generated `max_tokens` tokens.
    MaxTokens,
    /// Reached `max_model_len` total tokens.
    MaxModelLen,
}

/// A sequence represents a single inference request.
///
/// Cache progress is tracked with two counters:
/// - `num_cached_tokens`: positions whose KV is already computed
/// - `num_new_tokens`: positions scheduled for computation in the current
///   iteration, folded into `num_cached_tokens` by the scheduler's
///   postprocess step
///
/// # Example
///
/// ```
/// use nano_vllm_sched::core::sequence::{Sequence, SequenceStatus};
///
/// let mut seq = Sequence::new(1, vec![1, 2, 3, 4]);
/// assert_eq!(seq.status(), SequenceStatus::Waiting);
/// assert_eq!(seq.prompt_len(), 4);
///
/// seq.append_token(5);
/// assert_eq!(seq.num_completion_tokens(), 1);
/// assert_eq!(seq.total_len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    seq_id: SequenceId,
    /// Prompt followed by generated tokens.
    token_ids: Vec<u32>,
    num_prompt_tokens: usize,
    status: SequenceStatus,
    block_table: BlockTable,
    num_cached_tokens: usize,
    num_new_tokens: usize,
    max_tokens: usize,
    ignore_eos: bool,
    temperature: f32,
    finish_reason: Option<FinishReason>,
}

impl Sequence {
    /// Create a new sequence with default sampling settings.
    pub fn new(seq_id: SequenceId, prompt_token_ids: Vec<u32>) -> Self {
        Self::with_sampling(seq_id, prompt_token_ids, &SamplingConfig::default())
    }

    /// Create a new sequence with explicit sampling settings.
    pub fn with_sampling(
        seq_id: SequenceId,
        prompt_token_ids: Vec<u32>,
        sampling: &SamplingConfig,
    ) -> Self {
        let num_prompt_tokens = prompt_token_ids.len();
        Self {
            seq_id,
            token_ids: prompt_token_ids,
            num_prompt_tokens,
            status: SequenceStatus::Waiting,
            block_table: BlockTable::with_default_size(),
            num_cached_tokens: 0,
            num_new_tokens: 0,
            max_tokens: sampling.max_tokens,
            ignore_eos: sampling.ignore_eos,
            temperature: sampling.temperature,
            finish_reason: None,
        }
    }

    // ========== Getters ==========

    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// All token IDs (prompt + generated).
    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.token_ids[..self.num_prompt_tokens]
    }

    /// Get the generated token IDs.
    pub fn completion_token_ids(&self) -> &[u32] {
        &self.token_ids[self.num_prompt_tokens..]
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.token_ids.last().copied()
    }

    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    /// Allocators install and grow the table through this.
    pub fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    pub fn num_cached_tokens(&self) -> usize {
        self.num_cached_tokens
    }

    pub fn set_num_cached_tokens(&mut self, num_cached_tokens: usize) {
        self.num_cached_tokens = num_cached_tokens;
    }

    pub fn num_new_tokens(&self) -> usize {
        self.num_new_tokens
    }

    pub fn set_num_new_tokens(&mut self, num_new_tokens: usize) {
        self.num_new_tokens = num_new_tokens;
    }

    /// Generation budget.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Whether end-of-sequence tokens are ignored as a stop condition.
    pub fn ignore_eos(&self) -> bool {
        self.ignore_eos
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Set once the sequence finishes.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    // ========== Length queries ==========

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.num_prompt_tokens
    }

    /// Number of generated tokens.
    pub fn num_completion_tokens(&self) -> usize {
        self.token_ids.len() - self.num_prompt_tokens
    }

    /// Get the total length (prompt + generated).
    pub fn total_len(&self) -> usize {
        self.token_ids.len()
    }

    /// Tokens stored in logical block `index`, at most `block_size` of them.
    pub fn block_tokens(&self, index: usize, block_size: usize) -> &[u32] {
        let start = (index * block_size).min(self.token_ids.len());
        let end = (start + block_size).min(self.token_ids.len());
        &self.token_ids[start..end]
    }

    /// Check if the whole prompt has been computed.
    pub fn is_prefill_complete(&self) -> bool {
        self.num_cached_tokens >= self.num_prompt_tokens
    }

    // ========== Token operations ==========

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.token_ids.push(token_id);
    }

    /// Fold this iteration's computed tokens into the cached count.
    pub fn commit_new_tokens(&mut self) {
        self.num_cached_tokens += self.num_new_tokens;
        self.num_new_tokens = 0;
    }

    // ========== State transitions ==========

    fn transition(&mut self, from: SequenceStatus, to: SequenceStatus) -> Result<()> {
        if self.status != from {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Admit the sequence.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidStateTransition`] unless the sequence is waiting.
    pub fn set_running(&mut self) -> Result<()> {
        self.transition(SequenceStatus::Waiting, SequenceStatus::Running)
    }

    /// Return a preempted sequence to the waiting state.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidStateTransition`] unless the sequence is running.
    pub fn set_waiting(&mut self) -> Result<()> {
        self.transition(SequenceStatus::Running, SequenceStatus::Waiting)
    }

    pub fn set_finished(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Finished;
        self.finish_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_new_tokens() {
        let mut seq = Sequence::new(1, (0..10).collect());
        seq.set_num_new_tokens(6);
        seq.commit_new_tokens();
        assert_eq!(seq.num_cached_tokens(), 6);
        assert_eq!(seq.num_new_tokens(), 0);
        assert!(!seq.is_prefill_complete());

        seq.set_num_new_tokens(4);
        seq.commit_new_tokens();
        assert_eq!(seq.num_cached_tokens(), 10);
        assert!(seq.is_prefill_complete());

        // Committing with nothing scheduled changes nothing
        seq.commit_new_tokens();
        assert_eq!(seq.num_cached_tokens(), 10);
    }

    #[test]
    fn test_invalid_state_transitions() {
        let mut seq = Sequence::new(1, vec![1, 2, 3]);
        assert!(seq.set_waiting().is_err());

        seq.set_running().unwrap();
        assert!(seq.set_running().is_err());

        seq.set_finished(FinishReason::MaxTokens);
        assert!(seq.set_running().is_err());
        assert!(seq.set_waiting().is_err());
    }
}
