use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info};

use nano_vllm_sched::logging::{self, LogFormat};
use nano_vllm_sched::{GenerationRequest, LLMEngine, Result, SchedulerConfig, SyntheticRunner};

#[derive(Parser, Debug)]
#[command(name = "nano-vllm-sched")]
#[command(about = "Run a synthetic workload through the continuous-batching scheduler")]
struct Args {
    /// Scheduler configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of requests to submit
    #[arg(short, long, default_value = "64")]
    num_requests: usize,

    /// Shortest prompt length
    #[arg(long, default_value = "16")]
    min_prompt_len: usize,

    /// Longest prompt length
    #[arg(long, default_value = "512")]
    max_prompt_len: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "128")]
    max_tokens: usize,

    /// Probability of sampling the end-of-sequence token at each step
    #[arg(long, default_value = "0.01")]
    eos_probability: f64,

    /// Vocabulary size of the synthetic model
    #[arg(long, default_value = "32000")]
    vocab_size: u32,

    /// Random seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Disable chunked prefill
    #[arg(long)]
    no_chunked_prefill: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn run(args: &Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SchedulerConfig::from_json_file(path)?,
        None => SchedulerConfig::default(),
    };
    if args.no_chunked_prefill {
        config.enable_chunked_prefill = false;
    }
    info!(?config, "starting simulation");

    let runner = SyntheticRunner::new(
        args.vocab_size,
        config.eos_token_id,
        args.eos_probability,
        args.seed,
    );
    let max_prompt_len = args
        .max_prompt_len
        .min(config.max_sequence_len())
        .max(args.min_prompt_len.max(1));
    let min_prompt_len = args.min_prompt_len.clamp(1, max_prompt_len);
    let mut engine = LLMEngine::new(config, runner)?;

    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(1));
    for _ in 0..args.num_requests {
        let prompt_len = rng.gen_range(min_prompt_len..=max_prompt_len);
        let prompt: Vec<u32> = (0..prompt_len)
            .map(|_| rng.gen_range(0..args.vocab_size.max(1)))
            .collect();
        engine.add_request(GenerationRequest::new(prompt).max_tokens(args.max_tokens))?;
    }

    let outputs = engine.generate()?;
    let stats = engine.stats();
    let num_generated: usize = outputs.iter().map(|o| o.output_token_ids.len()).sum();

    info!(
        num_requests = outputs.len(),
        num_generated,
        num_steps = stats.num_steps,
        num_batched_tokens = stats.num_batched_tokens,
        num_preemptions = stats.num_preemptions,
        "simulation finished"
    );
    println!(
        "{} requests, {} generated tokens, {} steps, {} preemptions",
        outputs.len(),
        num_generated,
        stats.num_steps,
        stats.num_preemptions
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(&args.log_level, LogFormat::from_env());

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "simulation failed");
            ExitCode::FAILURE
        }
    }
}
