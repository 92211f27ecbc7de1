//! Request ingestor.
//!
//! Reader thread for the request ring: block on the kernel event with a
//! short timeout, drain every READY slot into owned [`RawRequest`] values,
//! and hand them to the preprocessor over a bounded SPSC queue. A full queue
//! drops the request rather than blocking the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use pageflow_ipc::{RawRequest, RequestReader};

use crate::queue::SpscQueue;

/// How long one event wait blocks before re-checking the shutdown flag.
const WAIT_TIMEOUT: Duration = Duration::from_millis(10);

/// The ingest worker (C3).
pub struct Ingestor {
    reader: RequestReader,
    output: Arc<SpscQueue<RawRequest>>,
    shutdown: Arc<AtomicBool>,
}

impl Ingestor {
    /// Wire the ingestor between the request ring and the preprocessor
    /// queue.
    pub fn new(
        reader: RequestReader,
        output: Arc<SpscQueue<RawRequest>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            reader,
            output,
            shutdown,
        }
    }

    /// Worker loop; returns when the shutdown flag is set.
    pub fn run_loop(&self) {
        info!("ingestor running");
        let mut backoff = Duration::from_millis(1);

        while !self.shutdown.load(Ordering::Acquire) {
            match self.reader.wait(WAIT_TIMEOUT) {
                Ok(_signaled) => {
                    backoff = Duration::from_millis(1);
                }
                Err(err) => {
                    // Event errors are retried with backoff; the poll
                    // timeout keeps requests flowing meanwhile.
                    warn!(%err, "kernel event wait failed; backing off");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(500));
                }
            }

            let (accepted, dropped) = self.reader.drain(|raw| self.output.push(raw).is_ok());
            if accepted > 0 {
                debug!(accepted, "ingested requests");
                if let Some(m) = pageflow_metrics::metrics() {
                    m.requests_ingested.inc_by(accepted as u64);
                }
            }
            if dropped > 0 {
                warn!(dropped, "request queue full; requests dropped");
                if let Some(m) = pageflow_metrics::metrics() {
                    m.requests_dropped.inc_by(dropped as u64);
                }
            }
        }
        info!("ingestor stopped");
    }
}
