//! Request preprocessor.
//!
//! Tokenizes raw requests, returns their prompt bytes to the bulk segment,
//! and hands `Waiting` sequences to the scheduler. Failures here are
//! per-request: the client gets a terminal delta and the loop keeps going.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use pageflow_core::{FinishReason, PromptKind, Sequence};
use pageflow_ipc::{BulkSegment, RawRequest, ResponseDelta, ResponseWriter};
use pageflow_tokenizer::{chat_template, TextCodec};

use crate::engine::CancelRegistry;
use crate::queue::SpscQueue;

/// Sleep when the input queue is empty.
const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// The preprocessing worker (C4).
pub struct Preprocessor {
    input: Arc<SpscQueue<RawRequest>>,
    output: Arc<SpscQueue<Sequence>>,
    bulk: Arc<BulkSegment>,
    codec: Arc<dyn TextCodec>,
    response_writer: Arc<ResponseWriter>,
    cancels: CancelRegistry,
    shutdown: Arc<AtomicBool>,
}

impl Preprocessor {
    /// Wire the preprocessor between the ingestor and the scheduler.
    pub fn new(
        input: Arc<SpscQueue<RawRequest>>,
        output: Arc<SpscQueue<Sequence>>,
        bulk: Arc<BulkSegment>,
        codec: Arc<dyn TextCodec>,
        response_writer: Arc<ResponseWriter>,
        cancels: CancelRegistry,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            input,
            output,
            bulk,
            codec,
            response_writer,
            cancels,
            shutdown,
        }
    }

    /// Worker loop; returns when the shutdown flag is set.
    pub fn run_loop(&self) {
        info!("preprocessor running");
        while !self.shutdown.load(Ordering::Acquire) {
            match self.input.pop() {
                Some(raw) => self.process(raw),
                None => std::thread::sleep(IDLE_SLEEP),
            }
        }
        info!("preprocessor stopped");
    }

    fn process(&self, raw: RawRequest) {
        let request_id = raw.request_id;

        let prompt = match raw.prompt_kind {
            PromptKind::Completion => raw.prompt.clone(),
            PromptKind::ChatHistory => chat_template::apply_chat_template(&raw.prompt),
        };

        let tokens = match self.codec.encode(&prompt) {
            Ok(tokens) if !tokens.is_empty() => tokens,
            Ok(_) => {
                error!(request_id, "prompt tokenized to nothing; rejecting");
                self.reject(&raw);
                return;
            }
            Err(err) => {
                error!(request_id, %err, "tokenization failed; rejecting");
                self.reject(&raw);
                return;
            }
        };
        debug!(request_id, num_tokens = tokens.len(), "prompt tokenized");

        // The prompt now lives as token ids; the bulk bytes go back.
        if raw.bulk_len > 0 {
            self.bulk.free(raw.bulk_offset);
        }

        let seq = Sequence::new(
            request_id,
            raw.arrival_timestamp_ns,
            tokens,
            raw.prompt_kind,
            raw.sampling_params,
            raw.logits_params,
            raw.stop_criteria,
            raw.ipc_handles,
        );
        self.cancels.register(request_id, Arc::clone(&seq.cancelled));

        if let Err(seq) = self.output.push(seq) {
            error!(request_id, "sequence queue full; dropping request");
            self.cancels.remove(seq.sequence_id);
            self.emit_rejection(request_id);
            if let Some(m) = pageflow_metrics::metrics() {
                m.requests_dropped.inc();
            }
        }
    }

    /// Drop a request before a sequence existed: free its bulk block and
    /// tell the client.
    fn reject(&self, raw: &RawRequest) {
        if raw.bulk_len > 0 {
            self.bulk.free(raw.bulk_offset);
        }
        self.emit_rejection(raw.request_id);
        if let Some(m) = pageflow_metrics::metrics() {
            m.requests_dropped.inc();
        }
    }

    fn emit_rejection(&self, request_id: u64) {
        let delta = ResponseDelta::terminal(request_id, FinishReason::Injection);
        if let Err(err) = self.response_writer.write_delta(&delta) {
            warn!(request_id, %err, "failed to emit rejection delta");
        }
    }
}
