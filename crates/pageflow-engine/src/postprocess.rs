//! Response postprocessor and emitter.
//!
//! Detokenizes sampled tokens and publishes response deltas. Decode failures
//! substitute placeholder content and keep going; a full response ring is
//! logged and the delta dropped, never blocking the scheduler's queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace};

use pageflow_ipc::{ResponseDelta, ResponseWriter};
use pageflow_tokenizer::TextCodec;

use crate::queue::SpscQueue;
use crate::scheduler::PostprocessingData;

/// Sleep when the input queue is empty.
const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// Placeholder for tokens the codec cannot render.
const DECODE_FALLBACK: &str = "<?>";

/// The postprocessing worker (C6).
pub struct Postprocessor {
    input: Arc<SpscQueue<PostprocessingData>>,
    writer: Arc<ResponseWriter>,
    codec: Arc<dyn TextCodec>,
    shutdown: Arc<AtomicBool>,
}

impl Postprocessor {
    /// Wire the postprocessor between the scheduler and the response ring.
    pub fn new(
        input: Arc<SpscQueue<PostprocessingData>>,
        writer: Arc<ResponseWriter>,
        codec: Arc<dyn TextCodec>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            input,
            writer,
            codec,
            shutdown,
        }
    }

    /// Worker loop; drains the queue after shutdown so no sampled token is
    /// silently lost, then returns.
    pub fn run_loop(&self) {
        info!("postprocessor running");
        let mut processed: u64 = 0;

        loop {
            match self.input.pop() {
                Some(data) => {
                    self.emit(data);
                    processed += 1;
                    if processed % 1000 == 0 {
                        trace!(processed, "postprocessor progress");
                    }
                }
                None => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    std::thread::sleep(IDLE_SLEEP);
                }
            }
        }
        info!(processed, "postprocessor stopped");
    }

    fn emit(&self, data: PostprocessingData) {
        let content = match data.token_id {
            Some(token) => match self.codec.decode(&[token]) {
                Ok(text) => text,
                Err(err) => {
                    error!(
                        request_id = data.request_id,
                        token,
                        %err,
                        "decode failed; substituting placeholder"
                    );
                    DECODE_FALLBACK.to_string()
                }
            },
            None => String::new(),
        };

        let delta = ResponseDelta {
            request_id: data.request_id,
            tokens: data.token_id.into_iter().collect(),
            content,
            is_final: data.is_final,
            finish_reason: data.finish_reason,
        };

        match self.writer.write_delta(&delta) {
            Ok(()) => {
                debug!(
                    request_id = data.request_id,
                    is_final = data.is_final,
                    "delta emitted"
                );
                if let Some(m) = pageflow_metrics::metrics() {
                    m.deltas_emitted.inc();
                }
            }
            Err(err) => {
                // The client stopped consuming; dropping is the only option
                // that keeps the scheduler's queue draining.
                error!(request_id = data.request_id, %err, "failed to write delta");
            }
        }
    }
}
