//! Token samplers.
//!
//! One known set of strategies, selected from [`SamplingParams`] at sample
//! time: greedy argmax when the temperature is zero, otherwise categorical
//! over the softmax with optional top-k / top-p / min-p truncation.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use thiserror::Error;

use pageflow_core::{SamplingParams, TokenId};

/// Sampling failures; these indicate a malformed logit row, not bad user
/// input.
#[derive(Error, Debug)]
pub enum SampleError {
    /// The logit row was empty.
    #[error("empty logits")]
    EmptyLogits,

    /// The truncated distribution had no usable mass.
    #[error("degenerate distribution: {0}")]
    Degenerate(String),
}

/// Which strategy a parameter set selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    /// Deterministic argmax.
    Greedy,
    /// Categorical over the (possibly truncated) softmax.
    Categorical,
}

impl SamplerKind {
    /// Select the strategy for `params`.
    pub fn for_params(params: &SamplingParams) -> Self {
        if params.is_greedy() {
            Self::Greedy
        } else {
            Self::Categorical
        }
    }
}

/// Draw the next token from one logit row.
pub fn sample(
    logits: &[f32],
    params: &SamplingParams,
    rng: &mut StdRng,
) -> Result<TokenId, SampleError> {
    match SamplerKind::for_params(params) {
        SamplerKind::Greedy => sample_greedy(logits),
        SamplerKind::Categorical => sample_categorical(logits, params, rng),
    }
}

fn sample_greedy(logits: &[f32]) -> Result<TokenId, SampleError> {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as TokenId)
        .ok_or(SampleError::EmptyLogits)
}

fn sample_categorical(
    logits: &[f32],
    params: &SamplingParams,
    rng: &mut StdRng,
) -> Result<TokenId, SampleError> {
    if logits.is_empty() {
        return Err(SampleError::EmptyLogits);
    }

    // Temperature scaling, then sort descending by logit.
    let mut scaled: Vec<(usize, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &l)| (i, l / params.temperature))
        .collect();
    scaled.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    // Top-k truncation.
    let top_k = params.top_k;
    if top_k > 0 && (top_k as usize) < scaled.len() {
        scaled.truncate(top_k as usize);
    }

    // Softmax over the survivors.
    let max_logit = scaled.first().map(|x| x.1).unwrap_or(0.0);
    let mut probs: Vec<(usize, f32)> = scaled
        .iter()
        .map(|&(i, l)| (i, (l - max_logit).exp()))
        .collect();
    let sum: f32 = probs.iter().map(|x| x.1).sum();
    if sum <= 0.0 || !sum.is_finite() {
        return Err(SampleError::Degenerate(format!("softmax sum {sum}")));
    }
    for p in &mut probs {
        p.1 /= sum;
    }

    // Min-p: drop tokens far below the mode.
    if params.min_p > 0.0 {
        let max_prob = probs.first().map(|x| x.1).unwrap_or(1.0);
        let threshold = max_prob * params.min_p;
        probs.retain(|&(_, p)| p >= threshold);
    }

    // Top-p: keep the smallest prefix whose mass exceeds the threshold.
    if params.top_p < 1.0 {
        let mut cumulative = 0.0;
        let mut cutoff = probs.len();
        for (i, &(_, p)) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative > params.top_p {
                cutoff = i + 1;
                break;
            }
        }
        probs.truncate(cutoff);
    }

    let weights: Vec<f32> = probs.iter().map(|x| x.1).collect();
    let dist = WeightedIndex::new(&weights)
        .map_err(|e| SampleError::Degenerate(e.to_string()))?;
    let picked = dist.sample(rng);
    Ok(probs[picked].0 as TokenId)
}
