//! Sampling parameters and the token-selection pipeline
//!
//! Transform order is fixed: nucleus (top-p) masking over the raw logits
//! first, temperature scaling second, the final draw last. The two orders are
//! not equivalent; this one is chosen and documented so that a fixed seed
//! reproduces a run exactly. Temperature 0 short-circuits the whole pipeline
//! to an argmax over the raw logits.

use crate::engine::TokenId;
use crate::error::{EngineError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Sampling parameters for one generation call.
///
/// Value object: re-specified per call, never persisted across calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Maximum number of tokens to generate
    pub max_tokens: usize,
    /// Temperature (0.0 = greedy argmax, higher = more random)
    pub temperature: f32,
    /// Nucleus sampling threshold, in (0, 1]
    pub top_p: f32,
    /// Stop strings; generation halts when one appears in the output
    pub stop_sequences: Vec<String>,
    /// Seed for reproducible non-greedy sampling
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            stop_sequences: vec![],
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Deterministic greedy parameters
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            ..Default::default()
        }
    }

    /// Validate parameter ranges before a session starts
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(EngineError::invalid_request(
                "max_tokens must be greater than 0",
            ));
        }
        if self.temperature < 0.0 {
            return Err(EngineError::invalid_request(
                "temperature must be non-negative",
            ));
        }
        if self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(EngineError::invalid_request("top_p must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Mask logits outside the smallest set whose cumulative probability reaches
/// `p` to negative infinity.
pub fn apply_top_p(logits: &mut [f32], p: f32) {
    if p >= 1.0 || p <= 0.0 || logits.is_empty() {
        return;
    }

    let mut indexed: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    // Stable softmax over the sorted logits.
    let max_logit = indexed[0].1;
    let exp: Vec<f32> = indexed.iter().map(|(_, l)| (l - max_logit).exp()).collect();
    let sum: f32 = exp.iter().sum();
    if sum <= 0.0 {
        return;
    }

    let mut cumulative = 0.0;
    let mut cutoff = indexed.len();
    for (rank, e) in exp.iter().enumerate() {
        cumulative += e / sum;
        if cumulative >= p {
            cutoff = rank + 1;
            break;
        }
    }

    let keep: std::collections::HashSet<usize> =
        indexed.iter().take(cutoff).map(|(i, _)| *i).collect();
    for (i, logit) in logits.iter_mut().enumerate() {
        if !keep.contains(&i) {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Scale logits by the inverse temperature. No-op at 1.0.
pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    if temperature > 0.0 && temperature != 1.0 {
        for logit in logits.iter_mut() {
            *logit /= temperature;
        }
    }
}

/// Argmax over raw logits; ties resolve to the lowest index.
pub fn argmax(logits: &[f32]) -> TokenId {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as TokenId)
        .unwrap_or(0)
}

/// Per-session token sampler. Owns the RNG so that a seeded session replays
/// identically.
pub struct TokenSampler {
    temperature: f32,
    top_p: f32,
    rng: StdRng,
}

impl TokenSampler {
    pub fn new(params: &SamplingParams) -> Self {
        Self {
            temperature: params.temperature,
            top_p: params.top_p,
            rng: StdRng::seed_from_u64(params.seed.unwrap_or(42)),
        }
    }

    /// Select the next token from a logits vector.
    pub fn sample(&mut self, logits: &mut Vec<f32>) -> TokenId {
        if self.temperature <= 0.0 {
            return argmax(logits);
        }

        apply_top_p(logits, self.top_p);
        apply_temperature(logits, self.temperature);

        // Stable softmax over the surviving candidates, then one draw.
        let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if max_logit == f32::NEG_INFINITY {
            return 0;
        }
        let exp: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
        let sum: f32 = exp.iter().sum();
        if sum <= 0.0 {
            return argmax(logits);
        }

        let draw: f32 = self.rng.gen_range(0.0..1.0);
        let mut cumulative = 0.0;
        for (i, e) in exp.iter().enumerate() {
            cumulative += e / sum;
            if draw <= cumulative {
                return i as TokenId;
            }
        }
        (logits.len() - 1) as TokenId
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_validation() {
        assert!(SamplingParams::default().validate().is_ok());
        assert!(SamplingParams::greedy().validate().is_ok());

        let mut params = SamplingParams::default();
        params.temperature = -0.1;
        assert!(params.validate().is_err());

        let mut params = SamplingParams::default();
        params.top_p = 0.0;
        assert!(params.validate().is_err());

        let mut params = SamplingParams::default();
        params.top_p = 1.5;
        assert!(params.validate().is_err());

        let mut params = SamplingParams::default();
        params.max_tokens = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[1.0, 3.0, 2.0, 0.5]), 1);
        assert_eq!(argmax(&[5.0]), 0);
    }

    #[test]
    fn test_temperature_scaling() {
        let mut logits = vec![1.0, 2.0, 4.0];
        apply_temperature(&mut logits, 2.0);
        assert_eq!(logits, vec![0.5, 1.0, 2.0]);

        let mut unchanged = vec![1.0, 2.0];
        apply_temperature(&mut unchanged, 1.0);
        assert_eq!(unchanged, vec![1.0, 2.0]);
    }

    #[test]
    fn test_top_p_masks_tail() {
        // Token 2 carries nearly all probability mass; a tight nucleus keeps
        // only it.
        let mut logits = vec![0.0, 0.1, 10.0, 0.2];
        apply_top_p(&mut logits, 0.5);
        assert_eq!(logits[2], 10.0);
        assert_eq!(logits[0], f32::NEG_INFINITY);
        assert_eq!(logits[1], f32::NEG_INFINITY);
        assert_eq!(logits[3], f32::NEG_INFINITY);
    }

    #[test]
    fn test_top_p_one_is_noop() {
        let mut logits = vec![1.0, 2.0, 3.0];
        apply_top_p(&mut logits, 1.0);
        assert_eq!(logits, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_greedy_sampler_is_argmax() {
        let mut sampler = TokenSampler::new(&SamplingParams::greedy());
        let mut logits = vec![0.5, 4.0, 1.0];
        assert_eq!(sampler.sample(&mut logits), 1);
    }

    #[test]
    fn test_seeded_sampling_reproducible() {
        let params = SamplingParams {
            temperature: 0.8,
            top_p: 0.95,
            seed: Some(7),
            ..Default::default()
        };
        let mut a = TokenSampler::new(&params);
        let mut b = TokenSampler::new(&params);

        for step in 0..16 {
            let base: Vec<f32> = (0..64).map(|i| ((i * 13 + step) % 17) as f32 * 0.3).collect();
            assert_eq!(a.sample(&mut base.clone()), b.sample(&mut base.clone()));
        }
    }

    #[test]
    fn test_nucleus_constrains_draws() {
        // With one dominant logit and a tight nucleus, every draw must land
        // on that token regardless of temperature.
        let params = SamplingParams {
            temperature: 1.2,
            top_p: 0.3,
            seed: Some(99),
            ..Default::default()
        };
        let mut sampler = TokenSampler::new(&params);
        for _ in 0..32 {
            let mut logits = vec![0.0, 0.0, 9.0, 0.1, 0.2];
            assert_eq!(sampler.sample(&mut logits), 2);
        }
    }

    #[test]
    fn test_order_top_p_before_temperature() {
        // A hot temperature flattens the distribution. Applied before top-p
        // it would widen the nucleus; applied after (our order) the nucleus
        // is fixed by the raw logits, so the tail stays masked.
        let mut logits = vec![8.0, 7.9, -2.0, -2.0];
        apply_top_p(&mut logits, 0.6);
        apply_temperature(&mut logits, 10.0);
        assert_eq!(logits[2], f32::NEG_INFINITY);
        assert_eq!(logits[3], f32::NEG_INFINITY);
        assert!(logits[0].is_finite() && logits[1].is_finite());
    }
}
