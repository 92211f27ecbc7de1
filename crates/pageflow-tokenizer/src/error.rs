//! Tokenizer error types.

use thiserror::Error;

/// Tokenizer failures.
#[derive(Debug, Error)]
pub enum TokenizerError {
    /// Failed to load the tokenizer definition.
    #[error("failed to load tokenizer: {0}")]
    Load(String),

    /// Failed to encode text.
    #[error("failed to encode text: {0}")]
    Encode(String),

    /// Failed to decode tokens.
    #[error("failed to decode tokens: {0}")]
    Decode(String),

    /// IO error while reading tokenizer files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
