//! Inference engine driver loop.
//!
//! The LLMEngine owns the scheduler and a [`ModelRunner`] and drives them:
//!
//! ```text
//!   add_request()             step()
//!        │                      │
//!        ▼                      ▼
//!   ┌──────────┐         ┌──────────────┐
//!   │ Scheduler│         │  Scheduler   │
//!   │   add    │         │  schedule    │
//!   └──────────┘         └──────────────┘
//!                               │
//!                               ▼
//!                        ┌──────────────┐
//!                        │ ModelRunner  │
//!                        │     run      │
//!                        └──────────────┘
//!                               │
//!                               ▼
//!                        ┌──────────────┐
//!                        │  Scheduler   │
//!                        │ postprocess  │
//!                        └──────────────┘
//! ```

use tracing::{debug, info};

use super::runner::ModelRunner;
use crate::config::{SamplingConfig, SchedulerConfig};
use crate::core::block_manager::{BlockAllocator, BlockManager};
use crate::core::sequence::{FinishReason, Sequence, SequenceId};
use crate::error::Result;
use crate::scheduler::Scheduler;

/// Output from a finished generation request.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// ID the request was submitted under.
    pub request_id: SequenceId,
    /// Input prompt tokens.
    pub prompt_token_ids: Vec<u32>,
    /// Tokens sampled after the prompt.
    pub output_token_ids: Vec<u32>,
    /// Stop condition that ended generation.
    pub finish_reason: Option<FinishReason>,
    /// Prompt plus generated length.
    pub total_tokens: usize,
}

impl From<Sequence> for GenerationOutput {
    fn from(seq: Sequence) -> Self {
        Self {
            request_id: seq.seq_id(),
            prompt_token_ids: seq.prompt_token_ids().to_vec(),
            output_token_ids: seq.completion_token_ids().to_vec(),
            finish_reason: seq.finish_reason(),
            total_tokens: seq.total_len(),
        }
    }
}

/// Request for generation from an already tokenized prompt.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Caller-chosen ID; the engine assigns the next free one when `None`.
    pub request_id: Option<SequenceId>,
    /// Prompt token IDs.
    pub prompt_token_ids: Vec<u32>,
    /// Stop conditions for this request.
    pub sampling_config: SamplingConfig,
}

impl GenerationRequest {
    /// Request with default sampling settings.
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            request_id: None,
            prompt_token_ids,
            sampling_config: SamplingConfig::default(),
        }
    }

    /// Use a caller-chosen request ID.
    pub fn request_id(mut self, request_id: SequenceId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Cap on generated tokens.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.sampling_config.max_tokens = max_tokens;
        self
    }

    /// Sampling temperature, passed through to the runner.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.sampling_config.temperature = temperature;
        self
    }

    /// Keep generating past the end-of-sequence token.
    pub fn ignore_eos(mut self, ignore_eos: bool) -> Self {
        self.sampling_config.ignore_eos = ignore_eos;
        self
    }
}

/// Aggregate counters over the engine's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of `step` calls that ran a forward pass.
    pub num_steps: usize,
    /// Tokens computed across all forward passes.
    pub num_batched_tokens: usize,
    /// Tokens sampled across all forward passes.
    pub num_sampled_tokens: usize,
    /// Preemptions performed by the scheduler.
    pub num_preemptions: usize,
}

/// Inference engine: drives the scheduler and model runner.
pub struct LLMEngine<R: ModelRunner, A: BlockAllocator = BlockManager> {
    scheduler: Scheduler<A>,
    runner: R,
    next_request_id: SequenceId,
    stats: EngineStats,
}

impl<R: ModelRunner> LLMEngine<R> {
    /// Create an engine with an in-process block manager.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the configuration is rejected by
    /// [`SchedulerConfig::validate`].
    pub fn new(config: SchedulerConfig, runner: R) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_scheduler(Scheduler::new(config), runner))
    }
}

impl<R: ModelRunner, A: BlockAllocator> LLMEngine<R, A> {
    /// Create an engine around an existing scheduler.
    pub fn with_scheduler(scheduler: Scheduler<A>, runner: R) -> Self {
        Self {
            scheduler,
            runner,
            next_request_id: 1,
            stats: EngineStats::default(),
        }
    }

    /// Queue a request behind everything already waiting.
    ///
    /// Returns the assigned request ID.
    pub fn add_request(&mut self, request: GenerationRequest) -> Result<SequenceId> {
        let request_id = match request.request_id {
            Some(id) => id,
            None => {
                // Skip IDs a caller already claimed explicitly
                while self.scheduler.get_sequence(self.next_request_id).is_some() {
                    self.next_request_id += 1;
                }
                let id = self.next_request_id;
                self.next_request_id += 1;
                id
            }
        };

        let sequence = Sequence::with_sampling(
            request_id,
            request.prompt_token_ids,
            &request.sampling_config,
        );
        self.scheduler.add(sequence)?;

        Ok(request_id)
    }

    /// Run a single iteration: schedule, forward, postprocess.
    ///
    /// Returns the outputs of sequences that finished in this iteration.
    pub fn step(&mut self) -> Result<Vec<GenerationOutput>> {
        let outputs = self.scheduler.schedule()?;
        if outputs.is_empty() {
            return Ok(vec![]);
        }

        let token_ids = {
            let batch = self.scheduler.batch_sequences(&outputs)?;
            self.runner.run(&batch, &outputs.sample_indices)?
        };
        let finished = self
            .scheduler
            .postprocess(&outputs, &token_ids, &outputs.sample_indices)?;

        self.stats.num_steps += 1;
        self.stats.num_batched_tokens += outputs.num_batched_tokens;
        self.stats.num_sampled_tokens += token_ids.len();
        self.stats.num_preemptions += outputs.preempted_sequences.len();

        for seq in &finished {
            debug!(
                request_id = seq.seq_id(),
                num_output_tokens = seq.num_completion_tokens(),
                finish_reason = ?seq.finish_reason(),
                "request finished"
            );
        }

        Ok(finished.into_iter().map(GenerationOutput::from).collect())
    }

    /// Run until every request has finished.
    ///
    /// Returns outputs in completion order.
    pub fn generate(&mut self) -> Result<Vec<GenerationOutput>> {
        let mut all_outputs = Vec::new();

        while self.has_pending_requests() {
            all_outputs.extend(self.step()?);
        }

        info!(
            num_requests = all_outputs.len(),
            num_steps = self.stats.num_steps,
            num_preemptions = self.stats.num_preemptions,
            "generation complete"
        );
        Ok(all_outputs)
    }

    /// Whether any request is still waiting or running.
    pub fn has_pending_requests(&self) -> bool {
        !self.scheduler.is_finished()
    }

    pub fn num_pending_requests(&self) -> usize {
        self.scheduler.num_waiting() + self.scheduler.num_running()
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn scheduler(&self) -> &Scheduler<A> {
        &self.scheduler
    }
}
