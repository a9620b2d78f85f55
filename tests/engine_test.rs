//! Integration tests for LLMEngine.

use std::collections::HashSet;
use std::io::Write;

use nano_vllm_sched::core::sequence::Sequence;
use nano_vllm_sched::{
    Error, FinishReason, GenerationRequest, LLMEngine, ModelRunner, Result, SchedulerConfig,
    SyntheticRunner,
};

const EOS: u32 = 0;

fn engine_config() -> SchedulerConfig {
    SchedulerConfig {
        max_num_seqs: 8,
        max_num_batched_tokens: 128,
        max_model_len: 256,
        enable_chunked_prefill: true,
        block_size: 16,
        num_blocks: 64,
        eos_token_id: EOS,
    }
}

/// Runner that always samples the same token.
#[derive(Default)]
struct ConstantRunner {
    token: u32,
}

impl ModelRunner for ConstantRunner {
    fn run(&mut self, batch: &[&Sequence], sample_indices: &[usize]) -> Result<Vec<u32>> {
        assert!(batch.iter().all(|seq| seq.num_new_tokens() > 0));
        Ok(vec![self.token; sample_indices.len()])
    }
}

/// Runner that returns one token too many.
struct BrokenRunner;

impl ModelRunner for BrokenRunner {
    fn run(&mut self, _batch: &[&Sequence], sample_indices: &[usize]) -> Result<Vec<u32>> {
        Ok(vec![1; sample_indices.len() + 1])
    }
}

#[test]
fn test_generation_request_builder() {
    let request = GenerationRequest::new(vec![1, 2, 3])
        .request_id(42)
        .max_tokens(100)
        .temperature(0.7)
        .ignore_eos(true);

    assert_eq!(request.request_id, Some(42));
    assert_eq!(request.prompt_token_ids, vec![1, 2, 3]);
    assert_eq!(request.sampling_config.max_tokens, 100);
    assert_eq!(request.sampling_config.temperature, 0.7);
    assert!(request.sampling_config.ignore_eos);
}

#[test]
fn test_generation_request_defaults() {
    let request = GenerationRequest::new(vec![5]);

    assert_eq!(request.request_id, None);
    assert_eq!(request.sampling_config.temperature, 1.0);
    assert_eq!(request.sampling_config.max_tokens, 256);
    assert!(!request.sampling_config.ignore_eos);
}

#[test]
fn test_engine_rejects_invalid_config() {
    let config = SchedulerConfig {
        enable_chunked_prefill: false,
        max_num_batched_tokens: 16,
        ..engine_config()
    };
    let result = LLMEngine::new(config, ConstantRunner::default());
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_add_request_assigns_ids() {
    let mut engine = LLMEngine::new(engine_config(), ConstantRunner::default()).unwrap();

    assert_eq!(engine.add_request(GenerationRequest::new(vec![1])).unwrap(), 1);
    assert_eq!(engine.add_request(GenerationRequest::new(vec![2])).unwrap(), 2);
    assert_eq!(
        engine
            .add_request(GenerationRequest::new(vec![3]).request_id(10))
            .unwrap(),
        10
    );
    assert_eq!(engine.num_pending_requests(), 3);

    assert!(matches!(
        engine.add_request(GenerationRequest::new(vec![4]).request_id(10)),
        Err(Error::DuplicateSequence(10))
    ));
    assert!(matches!(
        engine.add_request(GenerationRequest::new(vec![0; 256])),
        Err(Error::SequenceTooLong { .. })
    ));
    assert_eq!(engine.num_pending_requests(), 3);
}

#[test]
fn test_empty_prompt_is_rejected_before_scheduling() {
    let runner = SyntheticRunner::new(1000, EOS, 0.0, 1);
    let mut engine = LLMEngine::new(SchedulerConfig::default(), runner).unwrap();

    assert!(matches!(
        engine.add_request(GenerationRequest::new(vec![])),
        Err(Error::EmptySequence(_))
    ));
    assert!(!engine.has_pending_requests());
    assert!(engine.step().unwrap().is_empty());
}

#[test]
fn test_auto_ids_skip_explicit_ones() {
    let mut engine = LLMEngine::new(engine_config(), ConstantRunner::default()).unwrap();

    engine
        .add_request(GenerationRequest::new(vec![1]).request_id(1))
        .unwrap();
    assert_eq!(engine.add_request(GenerationRequest::new(vec![2])).unwrap(), 2);
}

#[test]
fn test_step_on_idle_engine() {
    let mut engine = LLMEngine::new(engine_config(), ConstantRunner::default()).unwrap();

    assert!(!engine.has_pending_requests());
    assert!(engine.step().unwrap().is_empty());
    assert_eq!(engine.stats().num_steps, 0);
}

#[test]
fn test_generate_runs_to_max_tokens() {
    let runner = ConstantRunner { token: 1 };
    let mut engine = LLMEngine::new(engine_config(), runner).unwrap();
    let a = engine
        .add_request(GenerationRequest::new((1..=200).collect()).max_tokens(3))
        .unwrap();
    let b = engine
        .add_request(GenerationRequest::new(vec![7, 8, 9]).max_tokens(3))
        .unwrap();

    let outputs = engine.generate().unwrap();

    assert_eq!(outputs.len(), 2);
    // The short request is admitted alongside the long one's last prefill
    // chunk, so both finish in the same step and come back in batch order
    assert_eq!(outputs[0].request_id, a);
    assert_eq!(outputs[1].request_id, b);
    for output in &outputs {
        assert_eq!(output.output_token_ids, vec![1, 1, 1]);
        assert_eq!(output.finish_reason, Some(FinishReason::MaxTokens));
        assert_eq!(
            output.total_tokens,
            output.prompt_token_ids.len() + output.output_token_ids.len()
        );
    }

    let stats = engine.stats();
    assert_eq!(stats.num_sampled_tokens, 6);
    assert_eq!(stats.num_preemptions, 0);
    assert!(!engine.has_pending_requests());
    assert_eq!(engine.scheduler().block_manager().num_free_blocks(), 64);
}

#[test]
fn test_runner_sees_chunked_prefill() {
    let runner = ConstantRunner { token: 1 };
    let mut engine = LLMEngine::new(engine_config(), runner).unwrap();
    engine
        .add_request(GenerationRequest::new((1..=200).collect()).max_tokens(1))
        .unwrap();

    let outputs = engine.generate().unwrap();
    assert_eq!(outputs.len(), 1);

    // 200 prompt tokens with a budget of 128: two chunks, sampled after the second
    assert_eq!(engine.stats().num_steps, 2);
    assert_eq!(engine.stats().num_batched_tokens, 200);
}

#[test]
fn test_step_propagates_output_mismatch() {
    let mut engine = LLMEngine::new(engine_config(), BrokenRunner).unwrap();
    engine.add_request(GenerationRequest::new(vec![1, 2, 3])).unwrap();

    assert!(matches!(
        engine.step(),
        Err(Error::OutputMismatch {
            num_tokens: 2,
            num_indices: 1
        })
    ));
}

#[test]
fn test_synthetic_workload_drains() {
    let config = engine_config();
    let runner = SyntheticRunner::new(1000, EOS, 0.05, 3);
    let mut engine = LLMEngine::new(config, runner).unwrap();

    let mut ids = HashSet::new();
    for i in 0..16u32 {
        let prompt_len = 10 + (i as usize * 37) % 190;
        let prompt: Vec<u32> = (0..prompt_len as u32).map(|t| 1 + (t + i) % 500).collect();
        ids.insert(
            engine
                .add_request(GenerationRequest::new(prompt).max_tokens(32))
                .unwrap(),
        );
    }

    let outputs = engine.generate().unwrap();

    assert_eq!(outputs.len(), 16);
    let finished: HashSet<u64> = outputs.iter().map(|o| o.request_id).collect();
    assert_eq!(finished, ids);

    let mut num_generated = 0;
    for output in &outputs {
        assert!(!output.output_token_ids.is_empty());
        assert!(output.output_token_ids.len() <= 32);
        match output.finish_reason {
            Some(FinishReason::EndOfSequence) => {
                assert_eq!(output.output_token_ids.last(), Some(&EOS));
            }
            Some(FinishReason::MaxTokens) => assert_eq!(output.output_token_ids.len(), 32),
            other => panic!("unexpected finish reason {other:?}"),
        }
        num_generated += output.output_token_ids.len();
    }

    let stats = engine.stats();
    assert_eq!(stats.num_sampled_tokens, num_generated);
    assert!(!engine.has_pending_requests());
    assert_eq!(engine.scheduler().block_manager().num_free_blocks(), 64);
}

#[test]
fn test_config_from_json_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"max_num_seqs": 4, "block_size": 32, "enable_chunked_prefill": false}}"#
    )
    .unwrap();

    let config = SchedulerConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.max_num_seqs, 4);
    assert_eq!(config.block_size, 32);
    assert!(!config.enable_chunked_prefill);
    // Unset fields keep their defaults
    assert_eq!(config.num_blocks, SchedulerConfig::default().num_blocks);
}

#[test]
fn test_config_from_json_file_errors() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "not json").unwrap();
    assert!(matches!(
        SchedulerConfig::from_json_file(file.path()),
        Err(Error::Json(_))
    ));

    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        SchedulerConfig::from_json_file(dir.path().join("missing.json")),
        Err(Error::Io(_))
    ));
}
