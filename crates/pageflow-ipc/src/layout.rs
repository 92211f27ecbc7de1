//! Wire layout of the shared-memory rings.
//!
//! Everything in this module is `repr(C)`, cache-line aligned, and position
//! independent: slots carry offsets and integer tags, never pointers. The
//! layout is a wire contract with out-of-process clients; fields are only
//! ever appended, never reordered.
//!
//! A queue segment is a [`QueueControl`] block followed by [`NUM_SLOTS`]
//! slot records. Each slot's `state` word is the synchronization point
//! between its producer and its consumer:
//!
//! ```text
//! request slot:  FREE -> WRITING -> READY -> READING -> FREE
//! response slot: FREE_FOR_WRITER -> WRITER_WRITING
//!                 -> READY_FOR_READER -> READER_READING -> FREE_FOR_WRITER
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64};

use pageflow_core::{IpcHandles, LogitsParams, SamplingParams, StopCriteria};

use crate::error::{IpcError, Result};

/// Slots per ring. Power of two so the ring index is a mask.
pub const NUM_SLOTS: usize = 1024;

const _: () = assert!(NUM_SLOTS.is_power_of_two());

/// Mask applied to monotonic indices to obtain a slot index.
pub const SLOT_MASK: u64 = (NUM_SLOTS as u64) - 1;

/// Maximum tokens one response delta carries.
pub const MAX_TOKENS_PER_DELTA: usize = 16;

/// Logprob alternatives recorded per token (when populated).
pub const MAX_LOGPROBS_PER_TOKEN: usize = 20;

/// Decoded-content capacity of a response delta, including the NUL spare.
pub const MAX_CONTENT_BYTES: usize = 256;

/// Stop-token capacity of the wire stop criteria.
pub const MAX_STOP_TOKEN_IDS: usize = 16;

/// Logit-bias entries the wire encoding can carry.
pub const MAX_LOGIT_BIAS: usize = 16;

/// Capacity of the fixed tool-schema / response-format strings.
pub const MAX_SCHEMA_BYTES: usize = 2048;

/// Request-slot states.
pub mod request_state {
    /// Slot is available to a producer.
    pub const FREE: u32 = 0;
    /// A producer claimed the slot and is copying the payload in.
    pub const WRITING: u32 = 1;
    /// Payload is published; the consumer may claim it.
    pub const READY: u32 = 2;
    /// The consumer is copying the payload out.
    pub const READING: u32 = 3;
}

/// Response-slot states.
pub mod response_state {
    /// Slot is available to the engine-side writer.
    pub const FREE_FOR_WRITER: u32 = 0;
    /// The writer claimed the slot and is filling it.
    pub const WRITER_WRITING: u32 = 1;
    /// Delta is published; the client may claim it.
    pub const READY_FOR_READER: u32 = 2;
    /// The client is copying the delta out.
    pub const READER_READING: u32 = 3;
}

/// Per-queue control block. Both indices are monotonic; each lives on its
/// own cache line so producers and the consumer do not false-share.
#[repr(C, align(64))]
pub struct QueueControl {
    /// Next ticket to hand to a producer.
    pub producer_idx: AtomicU64,
    _pad0: [u8; 56],
    /// Next slot the consumer will examine.
    pub consumer_idx: AtomicU64,
    _pad1: [u8; 56],
}

/// A length-prefixed fixed-capacity byte string.
#[repr(C)]
pub struct WireString {
    len: u32,
    bytes: [u8; MAX_SCHEMA_BYTES],
}

impl WireString {
    /// Copy `value` in, rejecting oversized input.
    pub fn set(&mut self, value: &str, field: &'static str) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > MAX_SCHEMA_BYTES {
            return Err(IpcError::FieldTooLarge {
                field,
                len: bytes.len(),
                max: MAX_SCHEMA_BYTES,
            });
        }
        self.bytes[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len() as u32;
        Ok(())
    }

    /// Copy a pre-validated string in. The caller has already checked the
    /// length against [`MAX_SCHEMA_BYTES`]; anything longer is truncated.
    pub(crate) fn put(&mut self, value: &str) {
        let n = value.len().min(MAX_SCHEMA_BYTES);
        self.bytes[..n].copy_from_slice(&value.as_bytes()[..n]);
        self.len = n as u32;
    }

    /// Copy the string out. Invalid UTF-8 (a misbehaving producer) is
    /// replaced rather than trusted.
    pub fn get(&self) -> String {
        let len = (self.len as usize).min(MAX_SCHEMA_BYTES);
        String::from_utf8_lossy(&self.bytes[..len]).into_owned()
    }
}

/// Bounded wire form of [`LogitsParams`].
#[repr(C)]
pub struct WireLogitsParams {
    /// See [`LogitsParams::frequency_penalty`].
    pub frequency_penalty: f32,
    /// See [`LogitsParams::presence_penalty`].
    pub presence_penalty: f32,
    /// See [`LogitsParams::repetition_penalty`].
    pub repetition_penalty: f32,
    /// See [`LogitsParams::repetition_context_size`].
    pub repetition_context_size: u32,
    /// Number of valid bias entries.
    pub num_bias: u32,
    /// Bias token ids.
    pub bias_ids: [i32; MAX_LOGIT_BIAS],
    /// Bias values, parallel to `bias_ids`.
    pub bias_values: [f32; MAX_LOGIT_BIAS],
}

impl WireLogitsParams {
    /// Encode, rejecting a bias map larger than the wire capacity.
    pub fn encode(params: &LogitsParams) -> Result<Self> {
        if params.logit_bias.len() > MAX_LOGIT_BIAS {
            return Err(IpcError::FieldTooLarge {
                field: "logit_bias",
                len: params.logit_bias.len(),
                max: MAX_LOGIT_BIAS,
            });
        }
        let mut bias_ids = [0i32; MAX_LOGIT_BIAS];
        let mut bias_values = [0f32; MAX_LOGIT_BIAS];
        for (i, (&token, &bias)) in params.logit_bias.iter().enumerate() {
            bias_ids[i] = token;
            bias_values[i] = bias;
        }
        Ok(Self {
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            repetition_penalty: params.repetition_penalty,
            repetition_context_size: params.repetition_context_size as u32,
            num_bias: params.logit_bias.len() as u32,
            bias_ids,
            bias_values,
        })
    }

    /// Decode into the owned core form.
    pub fn decode(&self) -> LogitsParams {
        let n = (self.num_bias as usize).min(MAX_LOGIT_BIAS);
        let mut logit_bias = HashMap::with_capacity(n);
        for i in 0..n {
            logit_bias.insert(self.bias_ids[i], self.bias_values[i]);
        }
        LogitsParams {
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            repetition_penalty: self.repetition_penalty,
            repetition_context_size: self.repetition_context_size as usize,
            logit_bias,
        }
    }
}

/// Bounded wire form of [`StopCriteria`].
#[repr(C)]
pub struct WireStopCriteria {
    /// See [`StopCriteria::max_generated_tokens`].
    pub max_generated_tokens: u32,
    /// Number of valid stop ids.
    pub num_stop: u32,
    /// Stop token ids.
    pub stop_ids: [i32; MAX_STOP_TOKEN_IDS],
}

impl WireStopCriteria {
    /// Encode, rejecting a stop list larger than the wire capacity.
    pub fn encode(criteria: &StopCriteria) -> Result<Self> {
        if criteria.stop_token_ids.len() > MAX_STOP_TOKEN_IDS {
            return Err(IpcError::FieldTooLarge {
                field: "stop_token_ids",
                len: criteria.stop_token_ids.len(),
                max: MAX_STOP_TOKEN_IDS,
            });
        }
        let mut stop_ids = [0i32; MAX_STOP_TOKEN_IDS];
        stop_ids[..criteria.stop_token_ids.len()].copy_from_slice(&criteria.stop_token_ids);
        Ok(Self {
            max_generated_tokens: criteria.max_generated_tokens as u32,
            num_stop: criteria.stop_token_ids.len() as u32,
            stop_ids,
        })
    }

    /// Decode into the owned core form.
    pub fn decode(&self) -> StopCriteria {
        let n = (self.num_stop as usize).min(MAX_STOP_TOKEN_IDS);
        StopCriteria {
            max_generated_tokens: self.max_generated_tokens as usize,
            stop_token_ids: self.stop_ids[..n].iter().copied().collect(),
        }
    }
}

/// One request ring entry.
#[repr(C, align(64))]
pub struct RequestSlot {
    /// Slot state word; see [`request_state`].
    pub state: AtomicU32,
    /// Wire tag of [`pageflow_core::PromptKind`].
    pub prompt_kind: u32,
    /// Client-assigned request id.
    pub request_id: u64,
    /// Prompt byte offset in the bulk segment.
    pub prompt_offset: u64,
    /// Prompt byte length.
    pub prompt_len: u64,
    /// Sampling configuration, embedded verbatim.
    pub sampling: SamplingParams,
    /// Logit-processing configuration.
    pub logits: WireLogitsParams,
    /// Stop criteria.
    pub stop: WireStopCriteria,
    /// Client channel handles.
    pub handles: IpcHandles,
    /// Serialized tool schemas, when the client supplies tools.
    pub tool_schemas: WireString,
    /// Serialized response-format constraint.
    pub response_format: WireString,
}

/// One response ring entry.
#[repr(C, align(64))]
pub struct ResponseDeltaSlot {
    /// Slot state word; see [`response_state`].
    pub state: AtomicU32,
    /// Valid entries in `tokens`.
    pub num_tokens: u32,
    /// Request this delta belongs to.
    pub request_id: u64,
    /// Token ids in generation order.
    pub tokens: [i32; MAX_TOKENS_PER_DELTA],
    /// Optional logprob matrix; rows beyond `num_tokens` are undefined.
    pub logprobs: [[f32; MAX_LOGPROBS_PER_TOKEN]; MAX_TOKENS_PER_DELTA],
    /// Nonzero when this is the request's last delta.
    pub is_final: u32,
    /// Wire tag of [`pageflow_core::FinishReason`]; valid when final.
    pub finish_reason: u32,
    /// Valid bytes in `content`.
    pub content_len: u32,
    /// Decoded UTF-8 content for the tokens in this delta.
    pub content: [u8; MAX_CONTENT_BYTES],
}

/// Byte size of a queue segment: control block plus slot array.
pub const fn queue_segment_size(slot_size: usize) -> usize {
    std::mem::size_of::<QueueControl>() + NUM_SLOTS * slot_size
}

/// Request queue segment size.
pub const REQUEST_SEGMENT_SIZE: usize = queue_segment_size(std::mem::size_of::<RequestSlot>());

/// Response queue segment size.
pub const RESPONSE_SEGMENT_SIZE: usize = queue_segment_size(std::mem::size_of::<ResponseDeltaSlot>());
