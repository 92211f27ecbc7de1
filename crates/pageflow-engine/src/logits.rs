//! Logit processors.
//!
//! Applied to a sequence's next-token logit row in a fixed order
//! (repetition, frequency penalty, presence penalty, logit bias) with each
//! processor skipped when its parameter sits at the identity value.

use std::collections::HashMap;

use pageflow_core::{LogitsParams, TokenId};

/// Apply every configured processor to `logits` in place.
///
/// `tokens` is the sequence's full token history (prompt plus generated);
/// `prompt_len` marks where the generated suffix begins.
pub fn apply_processors(
    logits: &mut [f32],
    params: &LogitsParams,
    tokens: &[TokenId],
    prompt_len: usize,
) {
    if params.is_identity() {
        return;
    }
    apply_repetition_penalty(logits, params, tokens);
    apply_frequency_presence(logits, params, &tokens[prompt_len.min(tokens.len())..]);
    apply_logit_bias(logits, &params.logit_bias);
}

/// Multiplicative penalty over the trailing repetition window.
fn apply_repetition_penalty(logits: &mut [f32], params: &LogitsParams, tokens: &[TokenId]) {
    let penalty = params.repetition_penalty;
    if penalty == 1.0 || tokens.is_empty() {
        return;
    }
    let window_start = tokens.len().saturating_sub(params.repetition_context_size);
    for &token in &tokens[window_start..] {
        let Some(logit) = logits.get_mut(token as usize) else {
            continue;
        };
        // Positive logits shrink, negative logits grow more negative.
        if *logit > 0.0 {
            *logit /= penalty;
        } else {
            *logit *= penalty;
        }
    }
}

/// Subtractive frequency and presence penalties over generated tokens.
fn apply_frequency_presence(logits: &mut [f32], params: &LogitsParams, generated: &[TokenId]) {
    if params.frequency_penalty == 0.0 && params.presence_penalty == 0.0 {
        return;
    }
    let mut counts: HashMap<TokenId, u32> = HashMap::new();
    for &token in generated {
        *counts.entry(token).or_insert(0) += 1;
    }
    for (&token, &count) in &counts {
        let Some(logit) = logits.get_mut(token as usize) else {
            continue;
        };
        *logit -= count as f32 * params.frequency_penalty;
        *logit -= params.presence_penalty;
    }
}

/// Additive per-token bias.
fn apply_logit_bias(logits: &mut [f32], bias: &HashMap<TokenId, f32>) {
    for (&token, &value) in bias {
        if let Some(logit) = logits.get_mut(token as usize) {
            *logit += value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_params_leave_logits_alone() {
        let mut logits = vec![1.0, -2.0, 3.0];
        let original = logits.clone();
        apply_processors(&mut logits, &LogitsParams::identity(), &[0, 1, 2], 0);
        assert_eq!(logits, original);
    }

    #[test]
    fn test_repetition_penalty_direction() {
        let mut params = LogitsParams::identity();
        params.repetition_penalty = 2.0;

        let mut logits = vec![4.0, -4.0, 1.0];
        apply_processors(&mut logits, &params, &[0, 1], 0);
        assert_eq!(logits[0], 2.0); // positive shrinks
        assert_eq!(logits[1], -8.0); // negative grows more negative
        assert_eq!(logits[2], 1.0); // unseen token untouched
    }

    #[test]
    fn test_repetition_window_bounds_history() {
        let mut params = LogitsParams::identity();
        params.repetition_penalty = 2.0;
        params.repetition_context_size = 2;

        // Token 0 fell out of the window; only 1 and 2 are penalized.
        let mut logits = vec![4.0, 4.0, 4.0];
        apply_processors(&mut logits, &params, &[0, 1, 2], 0);
        assert_eq!(logits, vec![4.0, 2.0, 2.0]);
    }

    #[test]
    fn test_frequency_penalty_scales_with_count() {
        let mut params = LogitsParams::identity();
        params.frequency_penalty = 0.5;

        let mut logits = vec![1.0, 1.0];
        // Prompt [0]; generated [1, 1, 1]. Prompt tokens are exempt.
        apply_processors(&mut logits, &params, &[0, 1, 1, 1], 1);
        assert_eq!(logits[0], 1.0);
        assert_eq!(logits[1], 1.0 - 3.0 * 0.5);
    }

    #[test]
    fn test_presence_penalty_flat() {
        let mut params = LogitsParams::identity();
        params.presence_penalty = 0.25;

        let mut logits = vec![1.0, 1.0, 1.0];
        apply_processors(&mut logits, &params, &[1, 1, 2], 0);
        assert_eq!(logits[0], 1.0);
        assert_eq!(logits[1], 0.75);
        assert_eq!(logits[2], 0.75);
    }

    #[test]
    fn test_logit_bias_applied_last() {
        let mut params = LogitsParams::identity();
        params.logit_bias.insert(2, -100.0);

        let mut logits = vec![0.0, 0.0, 50.0];
        apply_processors(&mut logits, &params, &[], 0);
        assert_eq!(logits[2], -50.0);
    }

    #[test]
    fn test_out_of_vocab_ids_ignored() {
        let mut params = LogitsParams::identity();
        params.repetition_penalty = 2.0;
        params.logit_bias.insert(999, 5.0);

        let mut logits = vec![1.0, 1.0];
        apply_processors(&mut logits, &params, &[999], 0);
        assert_eq!(logits, vec![1.0, 1.0]);
    }
}
