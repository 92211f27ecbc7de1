//! Per-step batch descriptor.
//!
//! The scheduler flattens every admitted sequence's new tokens into one
//! descriptor; the model backend consumes it as-is. The block table is
//! packed dense: row `i` holds sequence `i`'s page-table prefix, padded to
//! `max_blocks_per_seq` with [`NO_PAGE`]. That packing is a private contract
//! with the backend.

use pageflow_core::{AttentionKind, Sequence, TokenId, TOKENS_PER_PAGE};

/// Padding value for unused block-table cells.
pub const NO_PAGE: u32 = u32::MAX;

/// Everything the model backend needs for one forward step.
#[derive(Debug, Clone, Default)]
pub struct BatchDescriptor {
    /// New tokens for every sequence, concatenated in admission order.
    pub token_ids: Vec<TokenId>,
    /// Position of each token within its own sequence, parallel to
    /// `token_ids`.
    pub positions: Vec<u32>,
    /// Admitted sequence ids, in packing order.
    pub sequence_ids: Vec<u64>,
    /// New tokens this step, per sequence.
    pub input_lengths: Vec<usize>,
    /// Tokens already resident in the cache, per sequence.
    pub context_lengths: Vec<usize>,
    /// Dense `[num_seqs, max_blocks_per_seq]` page-id matrix, row-major.
    pub block_table: Vec<u32>,
    /// Stride of `block_table` rows.
    pub max_blocks_per_seq: usize,
    /// Sequences in prefill this step.
    pub num_prefill: usize,
    /// Sequences in decode this step.
    pub num_decode: usize,
    /// Total tokens in the step (`token_ids.len()`).
    pub total_tokens: usize,
    /// Attention mechanism the backend must run.
    pub attention: AttentionKind,
}

impl BatchDescriptor {
    /// Start building a descriptor for one step.
    pub fn builder(attention: AttentionKind) -> BatchBuilder {
        BatchBuilder {
            batch: BatchDescriptor {
                attention,
                ..Default::default()
            },
            block_rows: Vec::new(),
        }
    }

    /// Number of sequences in the batch.
    pub fn num_seqs(&self) -> usize {
        self.sequence_ids.len()
    }

    /// True when nothing was admitted.
    pub fn is_empty(&self) -> bool {
        self.sequence_ids.is_empty()
    }

    /// Page ids of sequence `i`'s row, without padding.
    pub fn blocks_of(&self, i: usize) -> &[u32] {
        let row = &self.block_table[i * self.max_blocks_per_seq..(i + 1) * self.max_blocks_per_seq];
        let used = row.iter().take_while(|&&p| p != NO_PAGE).count();
        &row[..used]
    }

    /// Row index (into the logits) of sequence `i`'s final input position.
    ///
    /// A prefill chunk yields one next-token logit at its last position;
    /// decode contributes exactly one row.
    pub fn last_row_of(&self, i: usize) -> usize {
        self.input_lengths[..=i].iter().sum::<usize>() - 1
    }
}

/// Accumulates admitted sequences into a [`BatchDescriptor`].
pub struct BatchBuilder {
    batch: BatchDescriptor,
    block_rows: Vec<Vec<u32>>,
}

impl BatchBuilder {
    /// Add a sequence contributing `chunk` new tokens starting at its
    /// current cache length.
    pub fn add(&mut self, seq: &Sequence, chunk: usize, is_prefill: bool) {
        debug_assert!(chunk > 0);
        let context = seq.prefilled;
        let new_tokens = &seq.tokens[context..context + chunk];

        self.batch.token_ids.extend_from_slice(new_tokens);
        self.batch
            .positions
            .extend((context..context + chunk).map(|p| p as u32));
        self.batch.sequence_ids.push(seq.sequence_id);
        self.batch.input_lengths.push(chunk);
        self.batch.context_lengths.push(context);
        if is_prefill {
            self.batch.num_prefill += 1;
        } else {
            self.batch.num_decode += 1;
        }

        // The backend needs the page-table prefix covering the step's final
        // logical length.
        let blocks = (context + chunk).div_ceil(TOKENS_PER_PAGE);
        self.block_rows.push(seq.page_table[..blocks].to_vec());
    }

    /// Sequences added so far.
    pub fn num_seqs(&self) -> usize {
        self.batch.sequence_ids.len()
    }

    /// Finish packing.
    pub fn build(mut self) -> BatchDescriptor {
        let stride = self
            .block_rows
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
            .max(1);
        self.batch.max_blocks_per_seq = stride;
        self.batch.block_table = Vec::with_capacity(stride * self.block_rows.len());
        for row in &self.block_rows {
            self.batch.block_table.extend_from_slice(row);
            self.batch
                .block_table
                .extend(std::iter::repeat(NO_PAGE).take(stride - row.len()));
        }
        self.batch.total_tokens = self.batch.token_ids.len();
        self.batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageflow_core::{IpcHandles, LogitsParams, PromptKind, SamplingParams, StopCriteria};

    fn sequence(id: u64, prompt: Vec<TokenId>, pages: Vec<u32>) -> Sequence {
        let mut seq = Sequence::new(
            id,
            0,
            prompt,
            PromptKind::Completion,
            SamplingParams::default(),
            LogitsParams::identity(),
            StopCriteria::default(),
            IpcHandles::default(),
        );
        for page in pages {
            seq.append_page(page);
        }
        seq
    }

    #[test]
    fn test_prefill_and_decode_packing() {
        let prefill = sequence(1, vec![10, 11, 12], vec![4]);

        let mut decode = sequence(2, vec![20, 21], vec![7]);
        decode.prefilled = 2;
        decode.append_token(22);

        let mut builder = BatchDescriptor::builder(AttentionKind::Paged);
        builder.add(&prefill, 3, true);
        builder.add(&decode, 1, false);
        let batch = builder.build();

        assert_eq!(batch.token_ids, vec![10, 11, 12, 22]);
        assert_eq!(batch.positions, vec![0, 1, 2, 2]);
        assert_eq!(batch.input_lengths, vec![3, 1]);
        assert_eq!(batch.context_lengths, vec![0, 2]);
        assert_eq!(batch.num_prefill, 1);
        assert_eq!(batch.num_decode, 1);
        assert_eq!(batch.total_tokens, 4);
        assert_eq!(batch.blocks_of(0), &[4]);
        assert_eq!(batch.blocks_of(1), &[7]);
    }

    #[test]
    fn test_last_row_mapping() {
        let a = sequence(1, vec![1, 2, 3], vec![0]);
        let mut b = sequence(2, vec![4], vec![1]);
        b.prefilled = 1;
        b.append_token(5);

        let mut builder = BatchDescriptor::builder(AttentionKind::Standard);
        builder.add(&a, 3, true);
        builder.add(&b, 1, false);
        let batch = builder.build();

        assert_eq!(batch.last_row_of(0), 2);
        assert_eq!(batch.last_row_of(1), 3);
    }

    #[test]
    fn test_block_rows_padded_to_stride() {
        let mut long = sequence(1, vec![0; TOKENS_PER_PAGE * 2], vec![3, 9]);
        long.prefilled = 0;
        let short = sequence(2, vec![1, 2], vec![5]);

        let mut builder = BatchDescriptor::builder(AttentionKind::Paged);
        builder.add(&long, TOKENS_PER_PAGE * 2, true);
        builder.add(&short, 2, true);
        let batch = builder.build();

        assert_eq!(batch.max_blocks_per_seq, 2);
        assert_eq!(batch.blocks_of(0), &[3, 9]);
        assert_eq!(batch.blocks_of(1), &[5]);
        assert_eq!(batch.block_table, vec![3, 9, 5, NO_PAGE]);
    }
}
