//! Sequences: the unit of scheduling.
//!
//! A [`Sequence`] is created by the preprocessor in `Waiting` state, mutated
//! exclusively by the scheduler thread thereafter, and destroyed by the
//! scheduler once its pages are returned to the pool. The SPSC hand-off from
//! preprocessor to scheduler is the synchronization edge, so no field other
//! than the cancellation flag needs to be atomic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::params::{IpcHandles, LogitsParams, SamplingParams, StopCriteria};
use crate::types::{PromptKind, RequestId, TokenId};

/// Tokens held by one KV-cache page. Power of two so block math is a shift.
pub const TOKENS_PER_PAGE: usize = 64;

const _: () = assert!(TOKENS_PER_PAGE.is_power_of_two());

/// Scheduling state of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Received and tokenized, awaiting admission.
    Waiting,
    /// Prompt tokens are being pushed through the model.
    Prefilling,
    /// Generating one token per step.
    Decoding,
    /// Finished normally. Terminal.
    Completed,
    /// Finished because something went wrong. Terminal.
    Error,
}

impl SequenceStatus {
    /// True for the two terminal states.
    pub fn is_finished(&self) -> bool {
        matches!(self, SequenceStatus::Completed | SequenceStatus::Error)
    }
}

/// A single generation task, from tokenized prompt to final token.
#[derive(Debug)]
pub struct Sequence {
    /// Identifier, equal to the originating request id.
    pub sequence_id: RequestId,
    /// Nanosecond arrival timestamp, used for FCFS tie-breaking.
    pub arrival_timestamp_ns: u64,
    /// Number of prompt tokens at the head of `tokens`.
    pub prompt_len: usize,
    /// How the prompt payload was interpreted.
    pub prompt_kind: PromptKind,

    /// Current scheduling state.
    pub status: SequenceStatus,
    /// Prompt prefix plus generated suffix.
    pub tokens: Vec<TokenId>,
    /// Physical page ids backing this sequence, in logical-block order.
    pub page_table: Vec<u32>,
    /// Tokens already resident in the KV cache (advanced by chunked prefill).
    pub prefilled: usize,

    /// Sampling configuration, fixed at ingest.
    pub sampling_params: SamplingParams,
    /// Logit-processing configuration, fixed at ingest.
    pub logits_params: LogitsParams,
    /// Stop conditions, fixed at ingest.
    pub stop_criteria: StopCriteria,
    /// Client channel handles, passed through to responses.
    pub ipc_handles: IpcHandles,

    /// Flipped by an external control path; observed by the scheduler.
    pub cancelled: Arc<AtomicBool>,
}

impl Sequence {
    /// Create a new sequence in `Waiting` state.
    pub fn new(
        sequence_id: RequestId,
        arrival_timestamp_ns: u64,
        prompt_tokens: Vec<TokenId>,
        prompt_kind: PromptKind,
        sampling_params: SamplingParams,
        logits_params: LogitsParams,
        stop_criteria: StopCriteria,
        ipc_handles: IpcHandles,
    ) -> Self {
        let prompt_len = prompt_tokens.len();
        Self {
            sequence_id,
            arrival_timestamp_ns,
            prompt_len,
            prompt_kind,
            status: SequenceStatus::Waiting,
            tokens: prompt_tokens,
            page_table: Vec::new(),
            prefilled: 0,
            sampling_params,
            logits_params,
            stop_criteria,
            ipc_handles,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of generated (non-prompt) tokens.
    pub fn generation_len(&self) -> usize {
        self.tokens.len() - self.prompt_len
    }

    /// Total logical length: prompt plus generated.
    pub fn logical_len(&self) -> usize {
        self.tokens.len()
    }

    /// True once the sequence has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// True if the cancellation flag has been flipped.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Append a generated token.
    pub fn append_token(&mut self, token: TokenId) {
        self.tokens.push(token);
    }

    /// Append a page to the block table.
    pub fn append_page(&mut self, page_id: u32) {
        self.page_table.push(page_id);
    }

    /// Physical page backing the given logical block, if mapped.
    pub fn physical_page(&self, logical_block: usize) -> Option<u32> {
        self.page_table.get(logical_block).copied()
    }

    /// Pages required to hold the current tokens plus `extra` more.
    pub fn pages_needed_for(&self, extra: usize) -> usize {
        (self.prefilled + extra).div_ceil(TOKENS_PER_PAGE)
    }

    /// Additional pages the next step of `extra` tokens would allocate.
    pub fn new_pages_for(&self, extra: usize) -> usize {
        self.pages_needed_for(extra).saturating_sub(self.page_table.len())
    }

    /// Remaining prompt tokens not yet pushed through the model.
    pub fn prompt_remaining(&self) -> usize {
        self.prompt_len.saturating_sub(self.prefilled)
    }
}
