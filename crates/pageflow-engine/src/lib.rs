//! # Pageflow Engine
//!
//! The serving core: a lock-free KV-cache page pool, a pipelined worker
//! topology (ingest → tokenize → schedule → detokenize → emit) over bounded
//! SPSC queues, and the batching scheduler that drives the model forward
//! pass.
//!
//! The model itself is an external collaborator behind the [`model::Model`]
//! trait; tokenization sits behind [`pageflow_tokenizer::TextCodec`].

#![warn(missing_docs)]

pub mod batch;
pub mod engine;
pub mod ingest;
pub mod logits;
pub mod model;
pub mod pool;
pub mod postprocess;
pub mod preprocess;
pub mod queue;
pub mod sampler;
pub mod scheduler;

pub use batch::BatchDescriptor;
pub use engine::{CancelRegistry, Engine, EngineError};
pub use model::{Logits, Model, ModelError};
pub use pool::{KvPage, PagePool, PoolError};
pub use queue::SpscQueue;
pub use scheduler::{PostprocessingData, Scheduler, SchedulerConfig};
