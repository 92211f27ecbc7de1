//! Generation parameters carried by every request.
//!
//! `SamplingParams` is plain-old-data and embedded directly in request slots;
//! `LogitsParams` and `StopCriteria` have bounded wire encodings in the IPC
//! crate and are converted to these richer forms at ingest.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::types::TokenId;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 1.0;
/// Default nucleus threshold (disabled).
pub const DEFAULT_TOP_P: f32 = 1.0;
/// Default top-k (disabled).
pub const DEFAULT_TOP_K: i32 = -1;
/// Default repetition penalty (identity).
pub const DEFAULT_REPETITION_PENALTY: f32 = 1.0;
/// Default number of recent tokens the repetition penalty looks at.
pub const DEFAULT_REPETITION_CONTEXT: usize = 60;
/// Default generation cap.
pub const DEFAULT_MAX_GENERATED_TOKENS: usize = 1024;

/// How the next token is drawn from the logit distribution.
///
/// Plain-old-data by design: this struct is copied byte-for-byte into and out
/// of shared-memory request slots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[repr(C)]
pub struct SamplingParams {
    /// Temperature; `0.0` selects greedy decoding.
    pub temperature: f32,
    /// Nucleus (top-p) threshold in `(0, 1]`; `1.0` disables it.
    pub top_p: f32,
    /// Top-k truncation; non-positive disables it.
    pub top_k: i32,
    /// Min-p threshold relative to the most likely token; `0.0` disables it.
    pub min_p: f32,
    /// Seed for the per-sequence RNG, so identical requests replay.
    pub rng_seed: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_TOP_K,
            min_p: 0.0,
            rng_seed: 0,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding (temperature zero).
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    /// True when decoding is deterministic.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Validate ranges. Rejected requests never reach the scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.temperature < 0.0 || !self.temperature.is_finite() {
            return Err(Error::validation_field(
                format!("temperature must be a finite value >= 0, got {}", self.temperature),
                "temperature",
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::validation_field(
                format!("top_p must be in [0, 1], got {}", self.top_p),
                "top_p",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return Err(Error::validation_field(
                format!("min_p must be in [0, 1], got {}", self.min_p),
                "min_p",
            ));
        }
        Ok(())
    }
}

/// Per-request logit adjustments, applied before sampling.
///
/// Each field has an identity value at which its processor is skipped
/// entirely; the defaults are all identities.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogitsParams {
    /// Subtractive penalty scaled by how often a token has been generated.
    pub frequency_penalty: f32,
    /// Subtractive penalty for any token that has been generated at all.
    pub presence_penalty: f32,
    /// Multiplicative penalty for recently seen tokens; `1.0` is identity.
    pub repetition_penalty: f32,
    /// How many trailing tokens the repetition penalty considers.
    pub repetition_context_size: usize,
    /// Additive per-token bias.
    pub logit_bias: HashMap<TokenId, f32>,
}

impl LogitsParams {
    /// Construct with identity penalties and the default repetition window.
    pub fn identity() -> Self {
        Self {
            repetition_penalty: DEFAULT_REPETITION_PENALTY,
            repetition_context_size: DEFAULT_REPETITION_CONTEXT,
            ..Default::default()
        }
    }

    /// True when no processor would change the logits.
    pub fn is_identity(&self) -> bool {
        self.frequency_penalty == 0.0
            && self.presence_penalty == 0.0
            && self.repetition_penalty == DEFAULT_REPETITION_PENALTY
            && self.logit_bias.is_empty()
    }
}

/// When a sequence stops generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopCriteria {
    /// Hard cap on generated (non-prompt) tokens.
    pub max_generated_tokens: usize,
    /// Token ids that end the generation when sampled.
    pub stop_token_ids: SmallVec<[TokenId; 8]>,
}

impl Default for StopCriteria {
    fn default() -> Self {
        Self {
            max_generated_tokens: DEFAULT_MAX_GENERATED_TOKENS,
            stop_token_ids: SmallVec::new(),
        }
    }
}

impl StopCriteria {
    /// True when `token` is one of the configured stop ids.
    pub fn is_stop_token(&self, token: TokenId) -> bool {
        self.stop_token_ids.contains(&token)
    }
}

/// Opaque channel identifiers a client uses to correlate its rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(C)]
pub struct IpcHandles {
    /// The client's request channel.
    pub request_channel_id: u64,
    /// The client's response channel.
    pub response_channel_id: u64,
}
