//! HuggingFace tokenizer wrapper.

use std::path::Path;

use tokenizers::Tokenizer as Inner;
use tracing::{debug, info};

use pageflow_core::TokenId;

use crate::error::TokenizerError;
use crate::TextCodec;

/// [`TextCodec`] backed by a `tokenizer.json` definition.
pub struct HfTokenizer {
    inner: Inner,
}

impl HfTokenizer {
    /// Load `tokenizer.json` from a model directory.
    pub fn from_pretrained<P: AsRef<Path>>(model_dir: P) -> Result<Self, TokenizerError> {
        let path = model_dir.as_ref().join("tokenizer.json");
        if !path.exists() {
            return Err(TokenizerError::Load(format!(
                "no tokenizer.json in {}",
                model_dir.as_ref().display()
            )));
        }
        Self::from_file(&path)
    }

    /// Load a tokenizer definition file directly.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TokenizerError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading tokenizer");
        let inner =
            Inner::from_file(path).map_err(|e| TokenizerError::Load(e.to_string()))?;
        debug!(vocab = inner.get_vocab_size(true), "tokenizer loaded");
        Ok(Self { inner })
    }

    /// Vocabulary size, including added tokens.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TextCodec for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, TokenizerError> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| TokenizerError::Encode(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| id as TokenId).collect())
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String, TokenizerError> {
        let ids: Vec<u32> = tokens
            .iter()
            .map(|&t| {
                u32::try_from(t)
                    .map_err(|_| TokenizerError::Decode(format!("negative token id {t}")))
            })
            .collect::<Result<_, _>>()?;
        self.inner
            .decode(&ids, true)
            .map_err(|e| TokenizerError::Decode(e.to_string()))
    }
}
