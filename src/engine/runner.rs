//! Forward-pass interface used by the engine.
//!
//! The model itself lives outside this crate. [`ModelRunner`] is the seam:
//! given a scheduled batch it computes each sequence's `num_new_tokens`
//! positions and samples one token per requested batch index.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::sequence::Sequence;
use crate::error::{Error, Result};

/// Executes one forward pass over a scheduled batch.
pub trait ModelRunner {
    /// Run the batch and sample one token for each entry of
    /// `sample_indices`, in the same order.
    fn run(&mut self, batch: &[&Sequence], sample_indices: &[usize]) -> Result<Vec<u32>>;
}

/// Stand-in model that samples uniformly random tokens.
///
/// Useful for load simulation: the scheduler only cares about lengths and
/// stop tokens, not about what the tokens are.
#[derive(Debug, Clone)]
pub struct SyntheticRunner {
    vocab_size: u32,
    eos_token_id: u32,
    /// Chance of emitting the end-of-sequence token at each sampling step.
    eos_probability: f64,
    rng: StdRng,
}

impl SyntheticRunner {
    /// Create a runner with a fixed seed for reproducible runs.
    pub fn new(vocab_size: u32, eos_token_id: u32, eos_probability: f64, seed: u64) -> Self {
        Self {
            // At least one non-eos token must exist
            vocab_size: vocab_size.max(2),
            eos_token_id,
            // NaN would make every sample panic
            eos_probability: if eos_probability.is_finite() {
                eos_probability.clamp(0.0, 1.0)
            } else {
                0.0
            },
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn sample(&mut self) -> u32 {
        if self.rng.gen_bool(self.eos_probability) {
            return self.eos_token_id;
        }
        loop {
            let token = self.rng.gen_range(0..self.vocab_size);
            if token != self.eos_token_id {
                return token;
            }
        }
    }
}

impl ModelRunner for SyntheticRunner {
    fn run(&mut self, batch: &[&Sequence], sample_indices: &[usize]) -> Result<Vec<u32>> {
        if let Some(&index) = sample_indices.iter().find(|&&index| index >= batch.len()) {
            return Err(Error::ModelRunner(format!(
                "sample index {index} outside batch of {}",
                batch.len()
            )));
        }
        Ok(sample_indices.iter().map(|_| self.sample()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_token_per_sample_index() {
        let mut runner = SyntheticRunner::new(100, 0, 0.0, 7);
        let a = Sequence::new(1, vec![1, 2]);
        let b = Sequence::new(2, vec![3]);

        let tokens = runner.run(&[&a, &b], &[1]).unwrap();
        assert_eq!(tokens.len(), 1);
        assert_ne!(tokens[0], 0);

        assert!(runner.run(&[&a, &b], &[]).unwrap().is_empty());
        assert!(runner.run(&[&a], &[1]).is_err());
    }

    #[test]
    fn test_eos_probability_one_always_stops() {
        let mut runner = SyntheticRunner::new(100, 42, 1.0, 7);
        let seq = Sequence::new(1, vec![1]);
        assert_eq!(runner.run(&[&seq], &[0]).unwrap(), vec![42]);
    }

    #[test]
    fn test_nan_eos_probability_never_stops() {
        let mut runner = SyntheticRunner::new(100, 42, f64::NAN, 7);
        let seq = Sequence::new(1, vec![1]);
        for _ in 0..20 {
            assert_ne!(runner.run(&[&seq], &[0]).unwrap(), vec![42]);
        }
    }

    #[test]
    fn test_seeded_runs_repeat() {
        let seq = Sequence::new(1, vec![1]);
        let mut a = SyntheticRunner::new(1000, 0, 0.1, 3);
        let mut b = SyntheticRunner::new(1000, 0, 0.1, 3);
        for _ in 0..10 {
            assert_eq!(
                a.run(&[&seq], &[0]).unwrap(),
                b.run(&[&seq], &[0]).unwrap()
            );
        }
    }
}
