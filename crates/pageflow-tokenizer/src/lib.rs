//! # Pageflow Tokenizer
//!
//! The serving core consumes tokenization through the [`TextCodec`] trait;
//! [`HfTokenizer`] implements it over the HuggingFace `tokenizers` crate.

#![warn(missing_docs)]

pub mod chat_template;
pub mod error;
pub mod hf;

pub use error::TokenizerError;
pub use hf::HfTokenizer;

use pageflow_core::TokenId;

/// The encode/decode interface the pipeline workers consume.
pub trait TextCodec: Send + Sync {
    /// Tokenize a prompt.
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, TokenizerError>;

    /// Render token ids back to UTF-8.
    fn decode(&self, tokens: &[TokenId]) -> Result<String, TokenizerError>;
}
