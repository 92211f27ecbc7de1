//! # Pageflow IPC
//!
//! Cross-process request/response transport built on POSIX shared memory and
//! kernel event notification.
//!
//! Two fixed-capacity slot rings live in named shared-memory segments: the
//! request ring (client → engine) and the response ring (engine → client).
//! Variable-length prompt bytes travel through a third, bulk segment managed
//! by an in-segment allocator; slots carry offsets into it, never pointers.
//!
//! Every slot is cache-line aligned and owns an atomic state word; the state
//! machine on that word is the only synchronization between the slot's
//! producer and consumer. Control blocks carry monotonic 64-bit producer and
//! consumer indices; slot index is `index & (NUM_SLOTS - 1)`.
//!
//! All cross-process reads and writes go through atomics or happen strictly
//! between the acquire that claimed the slot and the release that published
//! it.

#![warn(missing_docs)]

pub mod bulk;
pub mod client;
pub mod error;
pub mod event;
pub mod layout;
pub mod manager;
pub mod request;
pub mod response;
mod ring;
pub mod shm;

pub use bulk::BulkSegment;
pub use error::{IpcError, Result};
pub use event::KernelEvent;
pub use layout::{
    RequestSlot, ResponseDeltaSlot, MAX_CONTENT_BYTES, MAX_LOGIT_BIAS, MAX_LOGPROBS_PER_TOKEN,
    MAX_SCHEMA_BYTES, MAX_STOP_TOKEN_IDS, MAX_TOKENS_PER_DELTA, NUM_SLOTS,
};
pub use manager::{IpcConfig, IpcManager};
pub use request::{RawRequest, RequestReader, RequestWriter, SubmitRequest};
pub use response::{ResponseDelta, ResponseReader, ResponseWriter};
