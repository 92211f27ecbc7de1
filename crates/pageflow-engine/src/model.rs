//! The model-forward contract.
//!
//! The forward pass (tensor ops, attention kernels, weight handling) is an
//! external collaborator. The core hands it a [`BatchDescriptor`] and gets
//! back one logit row per input token.

use thiserror::Error;

use crate::batch::BatchDescriptor;

/// Model errors surfaced to the scheduler.
#[derive(Error, Debug)]
pub enum ModelError {
    /// The forward pass failed. The scheduler fails all in-flight sequences
    /// and keeps serving.
    #[error("forward pass failed: {0}")]
    Forward(String),

    /// The returned logits had the wrong shape.
    #[error("bad logits shape: expected {expected} rows, got {actual}")]
    Shape {
        /// Rows the batch demanded.
        expected: usize,
        /// Rows the backend produced.
        actual: usize,
    },
}

/// Row-major `[total_tokens, vocab]` logits.
#[derive(Debug, Clone)]
pub struct Logits {
    data: Vec<f32>,
    vocab: usize,
}

impl Logits {
    /// Wrap backend output, checking the shape divides evenly.
    pub fn new(data: Vec<f32>, vocab: usize) -> Result<Self, ModelError> {
        if vocab == 0 || data.len() % vocab != 0 {
            return Err(ModelError::Shape {
                expected: vocab.max(1),
                actual: data.len(),
            });
        }
        Ok(Self { data, vocab })
    }

    /// Number of token rows.
    pub fn num_rows(&self) -> usize {
        self.data.len() / self.vocab
    }

    /// Vocabulary size.
    pub fn vocab(&self) -> usize {
        self.vocab
    }

    /// Immutable view of row `i`.
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.vocab..(i + 1) * self.vocab]
    }

    /// Owned copy of row `i`, for in-place logit processing.
    pub fn row_to_vec(&self, i: usize) -> Vec<f32> {
        self.row(i).to_vec()
    }
}

/// The forward contract plus structural metadata the core needs for pool
/// sizing and batch packing.
pub trait Model: Send {
    /// Run one forward step over the batch. Must honor
    /// [`BatchDescriptor::attention`].
    fn forward(&mut self, batch: &BatchDescriptor) -> Result<Logits, ModelError>;

    /// Transformer layer count.
    fn num_layers(&self) -> usize;

    /// KV heads per layer.
    fn num_kv_heads(&self) -> usize;

    /// Dimension of each head.
    fn head_dim(&self) -> usize;

    /// Vocabulary size; every logit row has this many entries.
    fn vocab_size(&self) -> usize;
}

/// Placeholder backend producing uniform logits.
///
/// Stands in until a tensor backend is wired into the binary: greedy
/// decoding degenerates to token zero, categorical to a uniform draw. The
/// structural metadata is real and sizes the page pool.
pub struct UniformModel {
    num_layers: usize,
    num_kv_heads: usize,
    head_dim: usize,
    vocab_size: usize,
}

impl UniformModel {
    /// Build from structural metadata.
    pub fn new(num_layers: usize, num_kv_heads: usize, head_dim: usize, vocab_size: usize) -> Self {
        Self {
            num_layers,
            num_kv_heads,
            head_dim,
            vocab_size,
        }
    }
}

impl Model for UniformModel {
    fn forward(&mut self, batch: &BatchDescriptor) -> Result<Logits, ModelError> {
        Logits::new(vec![0.0; batch.total_tokens * self.vocab_size], self.vocab_size)
    }

    fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    fn head_dim(&self) -> usize {
        self.head_dim
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}
