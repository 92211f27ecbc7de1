//! Engine orchestration.
//!
//! Wires the transport, pool, queues, and workers together, then runs the
//! scheduler on the calling thread while the ingestor, preprocessor, and
//! postprocessor run on their own threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};

use pageflow_core::{EngineConfig, RequestId};
use pageflow_ipc::{
    IpcConfig, IpcError, IpcManager, RequestReader, ResponseWriter,
};
use pageflow_tokenizer::TextCodec;

use crate::ingest::Ingestor;
use crate::model::Model;
use crate::pool::{PagePool, PoolError};
use crate::postprocess::Postprocessor;
use crate::preprocess::Preprocessor;
use crate::queue::SpscQueue;
use crate::scheduler::{PostprocessingData, Scheduler, SchedulerConfig};

/// Capacity of each inter-stage queue.
const STAGE_QUEUE_CAPACITY: usize = 1024;

/// Engine-level errors. Only initialization is fatal.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration rejected at startup.
    #[error(transparent)]
    Config(#[from] pageflow_core::Error),

    /// Transport setup failed.
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// Pool construction failed.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A worker thread could not be spawned.
    #[error("failed to spawn {worker} thread: {source}")]
    Spawn {
        /// Worker name.
        worker: &'static str,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Shared map from request id to its cancellation flag.
///
/// The preprocessor registers a flag when it builds a sequence; an external
/// control path flips it through [`CancelRegistry::cancel`]; the scheduler
/// observes the flag and removes the entry when the sequence retires.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<RequestId, Arc<AtomicBool>>>>,
}

impl CancelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a sequence's cancellation flag.
    pub fn register(&self, request_id: RequestId, flag: Arc<AtomicBool>) {
        self.inner.lock().insert(request_id, flag);
    }

    /// Flip a sequence's flag. Returns false for unknown (or already
    /// retired) requests.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        match self.inner.lock().get(&request_id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Stop tracking a retired sequence.
    pub fn remove(&self, request_id: RequestId) {
        self.inner.lock().remove(&request_id);
    }

    /// Tracked sequences. Observability only.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// The serving core: one process, five workers, two shared structures.
pub struct Engine {
    ipc: IpcManager,
    pool: Arc<PagePool>,
    codec: Arc<dyn TextCodec>,
    model: Box<dyn Model>,
    config: EngineConfig,
    cancels: CancelRegistry,
    shutdown: Arc<AtomicBool>,
    postproc_stop: Arc<AtomicBool>,
}

impl Engine {
    /// Construct the engine: transport segments, page pool, registries.
    /// Fatal on any failure.
    pub fn new(
        config: EngineConfig,
        ipc_config: IpcConfig,
        model: Box<dyn Model>,
        codec: Arc<dyn TextCodec>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let ipc = IpcManager::new(ipc_config)?;
        let pool = Arc::new(PagePool::new(
            config.num_kv_pages,
            model.num_kv_heads(),
            model.head_dim(),
        )?);

        info!(
            num_kv_pages = config.num_kv_pages,
            max_num_seqs = config.max_num_seqs,
            max_tokens_in_batch = config.max_tokens_in_batch,
            attention = %config.attention,
            "engine initialized"
        );

        Ok(Self {
            ipc,
            pool,
            codec,
            model,
            config,
            cancels: CancelRegistry::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            postproc_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The flag a signal handler flips to stop the engine.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Cancel a request by id.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        self.cancels.cancel(request_id)
    }

    /// The cancel registry, for external control paths.
    pub fn cancels(&self) -> CancelRegistry {
        self.cancels.clone()
    }

    /// The page pool. Observability only.
    pub fn pool(&self) -> Arc<PagePool> {
        Arc::clone(&self.pool)
    }

    /// Run until the shutdown flag is set, consuming the engine.
    ///
    /// Spawns the ingestor, preprocessor, and postprocessor threads and
    /// runs the scheduler here. On shutdown, workers are joined in reverse
    /// dependency order: scheduler (this thread), preprocessor, ingestor,
    /// then postprocessor after the remaining deltas drain.
    pub fn run_blocking(self) -> Result<(), EngineError> {
        let raw_queue = Arc::new(SpscQueue::new(STAGE_QUEUE_CAPACITY));
        let seq_queue = Arc::new(SpscQueue::new(STAGE_QUEUE_CAPACITY));
        let postproc_queue: Arc<SpscQueue<PostprocessingData>> =
            Arc::new(SpscQueue::new(STAGE_QUEUE_CAPACITY));

        let response_writer = Arc::new(ResponseWriter::open(self.ipc.config())?);

        let reader =
            RequestReader::open(self.ipc.config(), self.ipc.bulk(), self.ipc.event())?;
        let ingestor = Ingestor::new(reader, Arc::clone(&raw_queue), Arc::clone(&self.shutdown));

        let preprocessor = Preprocessor::new(
            Arc::clone(&raw_queue),
            Arc::clone(&seq_queue),
            self.ipc.bulk(),
            Arc::clone(&self.codec),
            Arc::clone(&response_writer),
            self.cancels.clone(),
            Arc::clone(&self.shutdown),
        );

        let postprocessor = Postprocessor::new(
            Arc::clone(&postproc_queue),
            Arc::clone(&response_writer),
            Arc::clone(&self.codec),
            Arc::clone(&self.postproc_stop),
        );

        let mut scheduler = Scheduler::new(
            SchedulerConfig {
                max_num_seqs: self.config.max_num_seqs,
                max_tokens_in_batch: self.config.max_tokens_in_batch,
                attention: self.config.attention,
                preempt_decodes: self.config.preempt_decodes,
            },
            Arc::clone(&self.pool),
            self.model,
            seq_queue,
            postproc_queue,
            response_writer,
            self.cancels.clone(),
            Arc::clone(&self.shutdown),
        );

        let ingest_handle = spawn_worker("pageflow-ingest", move || ingestor.run_loop())?;
        let preproc_handle = spawn_worker("pageflow-preproc", move || preprocessor.run_loop())?;
        let postproc_handle = spawn_worker("pageflow-postproc", move || postprocessor.run_loop())?;

        // C5 runs here until the shutdown flag flips.
        scheduler.run_loop();

        // Wake the ingestor out of its event wait, then join.
        if let Err(err) = self.ipc.trigger_event() {
            warn!(%err, "failed to trigger event during shutdown");
        }
        join_worker("pageflow-preproc", preproc_handle);
        join_worker("pageflow-ingest", ingest_handle);

        // The scheduler has pushed its last delta; let the postprocessor
        // drain the queue and stop.
        self.postproc_stop.store(true, Ordering::Release);
        join_worker("pageflow-postproc", postproc_handle);

        info!("engine stopped");
        Ok(())
    }
}

fn spawn_worker(
    name: &'static str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, EngineError> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|source| EngineError::Spawn {
            worker: name,
            source,
        })
}

fn join_worker(name: &str, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!(worker = name, "worker thread panicked");
    }
}
