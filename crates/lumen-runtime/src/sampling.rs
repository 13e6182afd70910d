//! Logit processing and token sampling
//!
//! Greedy decoding, temperature sampling, top-k and nucleus (top-p)
//! filtering, driven by a seeded `StdRng` so runs are reproducible.

use crate::config::GenerationConfig;
use lumen_core::error::{Error, Result};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::SeedableRng;

/// Sampling strategy
#[derive(Clone, PartialEq, Debug)]
pub enum Sampling {
    /// Highest logit; ties go to the lowest token id
    ArgMax,
    /// Sample from every token with temperature scaling
    All { temperature: f64 },
    TopK { k: usize, temperature: f64 },
    TopP { p: f64, temperature: f64 },
    TopKThenTopP { k: usize, p: f64, temperature: f64 },
}

impl Sampling {
    /// Strategy implied by temperature, top-k and top-p settings
    pub fn from_params(temperature: f64, top_k: usize, top_p: f64) -> Self {
        let nucleus = top_p > 0.0 && top_p < 1.0;
        if temperature < 1e-7 {
            Sampling::ArgMax
        } else if top_k > 0 && nucleus {
            Sampling::TopKThenTopP { k: top_k, p: top_p, temperature }
        } else if top_k > 0 {
            Sampling::TopK { k: top_k, temperature }
        } else if nucleus {
            Sampling::TopP { p: top_p, temperature }
        } else {
            Sampling::All { temperature }
        }
    }
}

pub struct LogitsProcessor {
    rng: rand::rngs::StdRng,
    sampling: Sampling,
    repetition_penalty: f32,
    previous_tokens: Vec<u32>,
}

impl LogitsProcessor {
    pub fn from_sampling(seed: u64, sampling: Sampling) -> Self {
        let rng = rand::rngs::StdRng::seed_from_u64(seed);
        Self { rng, sampling, repetition_penalty: 1.0, previous_tokens: Vec::new() }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        let sampling = Sampling::from_params(
            config.temperature as f64,
            config.top_k,
            config.top_p as f64,
        );
        let mut processor = Self::from_sampling(config.seed, sampling);
        processor.repetition_penalty = config.repetition_penalty;
        processor
    }

    pub fn set_repetition_penalty(&mut self, penalty: f32) {
        self.repetition_penalty = penalty;
    }

    pub fn sampling_strategy(&self) -> &Sampling {
        &self.sampling
    }

    /// Penalize every previously sampled token once
    fn apply_repetition_penalty(&self, logits: &mut [f32]) {
        if self.repetition_penalty == 1.0 {
            return;
        }
        let mut seen = self.previous_tokens.clone();
        seen.sort_unstable();
        seen.dedup();
        for idx in seen.into_iter().map(|t| t as usize) {
            if let Some(l) = logits.get_mut(idx) {
                if *l > 0.0 {
                    *l /= self.repetition_penalty;
                } else {
                    *l *= self.repetition_penalty;
                }
            }
        }
    }

    /// Temperature-scaled softmax
    fn probabilities(logits: &[f32], temperature: f64) -> Vec<f32> {
        let t = temperature as f32;
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|&x| ((x - max) / t).exp()).collect();
        let sum: f32 = exps.iter().sum();
        exps.into_iter().map(|e| e / sum).collect()
    }

    fn renormalize(probs: &mut [f32]) {
        let sum: f32 = probs.iter().sum();
        if sum > 0.0 {
            for p in probs.iter_mut() {
                *p /= sum;
            }
        }
    }

    fn multinomial(&mut self, probs: &[f32]) -> Result<u32> {
        let dist = WeightedIndex::new(probs)
            .map_err(|e| Error::Runtime(format!("Cannot sample from distribution: {}", e)))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }

    /// Zero everything outside the `k` most probable tokens
    fn keep_top_k(probs: &mut [f32], k: usize) {
        if k == 0 || k >= probs.len() {
            return;
        }
        let mut indices: Vec<usize> = (0..probs.len()).collect();
        indices.select_nth_unstable_by(k, |&i, &j| probs[j].total_cmp(&probs[i]));
        for &i in &indices[k..] {
            probs[i] = 0.0;
        }
        Self::renormalize(probs);
    }

    /// Keep the smallest prefix of tokens, by descending probability, whose mass reaches `p`
    fn keep_top_p(probs: &mut [f32], p: f32) {
        if p <= 0.0 || p >= 1.0 {
            return;
        }
        let mut indices: Vec<usize> = (0..probs.len()).collect();
        indices.sort_by(|&i, &j| probs[j].total_cmp(&probs[i]));
        let mut cumsum = 0.0;
        for &i in &indices {
            if cumsum >= p {
                probs[i] = 0.0;
            } else {
                cumsum += probs[i];
            }
        }
        Self::renormalize(probs);
    }

    /// Pick the next token; `logits` may be modified by the repetition penalty
    pub fn sample(&mut self, logits: &mut [f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(Error::InvalidArgument("Cannot sample from empty logits".into()));
        }
        self.apply_repetition_penalty(logits);

        let next = match self.sampling.clone() {
            Sampling::ArgMax => argmax(logits),
            Sampling::All { temperature } => {
                let probs = Self::probabilities(logits, temperature);
                self.multinomial(&probs)?
            }
            Sampling::TopK { k, temperature } => {
                let mut probs = Self::probabilities(logits, temperature);
                Self::keep_top_k(&mut probs, k);
                self.multinomial(&probs)?
            }
            Sampling::TopP { p, temperature } => {
                let mut probs = Self::probabilities(logits, temperature);
                Self::keep_top_p(&mut probs, p as f32);
                self.multinomial(&probs)?
            }
            Sampling::TopKThenTopP { k, p, temperature } => {
                let mut probs = Self::probabilities(logits, temperature);
                Self::keep_top_k(&mut probs, k);
                Self::keep_top_p(&mut probs, p as f32);
                self.multinomial(&probs)?
            }
        };

        self.previous_tokens.push(next);
        Ok(next)
    }

    /// Count `tokens` as already seen by the repetition penalty
    pub fn extend_history(&mut self, tokens: &[u32]) {
        self.previous_tokens.extend_from_slice(tokens);
    }

    pub fn clear_history(&mut self) {
        self.previous_tokens.clear();
    }
}

/// Index of the largest value, the first one on ties
pub fn argmax(values: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax_sampling() {
        let mut processor = LogitsProcessor::from_sampling(42, Sampling::ArgMax);
        let mut logits = vec![1.0, 3.0, 2.0, 5.0, 1.5];
        assert_eq!(processor.sample(&mut logits).unwrap(), 3);
    }

    #[test]
    fn test_argmax_ties_pick_lowest_index() {
        assert_eq!(argmax(&[0.5, 2.0, 2.0, 1.0]), 1);
        assert_eq!(argmax(&[7.0, 7.0]), 0);
    }

    #[test]
    fn test_strategy_from_params() {
        assert_eq!(Sampling::from_params(0.0, 40, 0.9), Sampling::ArgMax);
        assert_eq!(
            Sampling::from_params(0.7, 40, 0.9),
            Sampling::TopKThenTopP { k: 40, p: 0.9, temperature: 0.7 }
        );
        assert_eq!(Sampling::from_params(0.7, 0, 1.0), Sampling::All { temperature: 0.7 });
        assert_eq!(Sampling::from_params(0.7, 5, 1.0), Sampling::TopK { k: 5, temperature: 0.7 });
    }

    #[test]
    fn test_temperature_sampling() {
        let mut processor = LogitsProcessor::from_sampling(42, Sampling::All { temperature: 1.0 });
        let mut logits = vec![1.0, 2.0, 3.0];
        assert!(processor.sample(&mut logits).unwrap() < 3);
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let draw = || {
            let mut p = LogitsProcessor::from_sampling(7, Sampling::All { temperature: 1.0 });
            (0..20).map(|_| p.sample(&mut vec![0.1, 0.2, 0.3, 0.4]).unwrap()).collect::<Vec<_>>()
        };
        assert_eq!(draw(), draw());
    }

    #[test]
    fn test_repetition_penalty() {
        let mut processor = LogitsProcessor::from_sampling(42, Sampling::ArgMax);
        processor.set_repetition_penalty(1.5);

        let mut logits = vec![5.0, 3.0, 2.0];
        assert_eq!(processor.sample(&mut logits).unwrap(), 0);

        let mut logits = vec![5.0, 3.0, 2.0];
        processor.apply_repetition_penalty(&mut logits);
        assert!((logits[0] - 5.0 / 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_repetition_penalty_covers_extended_history() {
        let mut processor = LogitsProcessor::from_sampling(42, Sampling::ArgMax);
        processor.set_repetition_penalty(2.0);
        processor.extend_history(&[0, 0, 2]);

        // 0 drops to 2.5 and 2 to 0.5, so 1 wins
        let mut logits = vec![5.0, 3.0, 1.0];
        assert_eq!(processor.sample(&mut logits).unwrap(), 1);
        assert_eq!(logits, vec![2.5, 3.0, 0.5]);

        processor.clear_history();
        let mut logits = vec![5.0, 3.0, 1.0];
        assert_eq!(processor.sample(&mut logits).unwrap(), 0);
    }

    #[test]
    fn test_topk_sampling() {
        let mut processor =
            LogitsProcessor::from_sampling(42, Sampling::TopK { k: 2, temperature: 1.0 });
        for _ in 0..20 {
            let mut logits = vec![1.0, 5.0, 3.0, 2.0, 4.0];
            let token = processor.sample(&mut logits).unwrap();
            assert!(token == 1 || token == 4);
        }
    }

    #[test]
    fn test_topp_keeps_dominant_token() {
        let mut processor =
            LogitsProcessor::from_sampling(42, Sampling::TopP { p: 0.5, temperature: 1.0 });
        for _ in 0..20 {
            let mut logits = vec![1.0, 10.0, 2.0, 1.0, 1.0];
            assert_eq!(processor.sample(&mut logits).unwrap(), 1);
        }
    }

    #[test]
    fn test_empty_logits_rejected() {
        let mut processor = LogitsProcessor::from_sampling(42, Sampling::ArgMax);
        assert!(processor.sample(&mut Vec::new()).is_err());
    }
}
