//! Engine configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which attention mechanism the model backend should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionKind {
    /// Contiguous-cache attention.
    #[default]
    Standard,
    /// Paged attention over the block table.
    Paged,
}

impl FromStr for AttentionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "paged" => Ok(Self::Paged),
            other => Err(Error::config(format!(
                "unknown attention kind '{other}' (expected 'standard' or 'paged')"
            ))),
        }
    }
}

impl fmt::Display for AttentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttentionKind::Standard => write!(f, "standard"),
            AttentionKind::Paged => write!(f, "paged"),
        }
    }
}

/// Runtime knobs for the serving core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model directory (weights, tokenizer.json).
    pub model_path: PathBuf,

    /// Attention mechanism selector forwarded to the model backend.
    pub attention: AttentionKind,

    /// KV-cache pages in the pool.
    pub num_kv_pages: usize,

    /// Maximum concurrently running sequences.
    pub max_num_seqs: usize,

    /// Maximum total tokens per forward step.
    pub max_tokens_in_batch: usize,

    /// Evict the newest decode sequence when the pool is exhausted and a
    /// prefill is holding pages. Off by default.
    pub preempt_decodes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            attention: AttentionKind::Standard,
            num_kv_pages: 8192,
            max_num_seqs: 256,
            max_tokens_in_batch: 4096,
            preempt_decodes: false,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration. Called once at startup; failures are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.model_path.as_os_str().is_empty() {
            return Err(Error::config("model path is required"));
        }
        if self.num_kv_pages == 0 {
            return Err(Error::config("num_kv_pages must be positive"));
        }
        if self.max_num_seqs == 0 {
            return Err(Error::config("max_num_seqs must be positive"));
        }
        if self.max_tokens_in_batch == 0 {
            return Err(Error::config("max_tokens_in_batch must be positive"));
        }
        Ok(())
    }
}
