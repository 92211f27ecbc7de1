//! # Pageflow Core
//!
//! Core types and configuration for the Pageflow serving core.
//!
//! This crate provides the foundational abstractions shared by every other
//! Pageflow crate:
//!
//! - **Error handling**: typed errors with context
//! - **Identifiers and finish reasons**: wire-stable tags shared with clients
//! - **Generation parameters**: sampling, logit-processing, and stop criteria
//! - **Sequences**: the unit of scheduling, from prompt to final token
//! - **Configuration**: the engine's validated runtime knobs

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod params;
pub mod sequence;
pub mod types;

pub use config::{AttentionKind, EngineConfig};
pub use error::{Error, Result};
pub use params::{IpcHandles, LogitsParams, SamplingParams, StopCriteria};
pub use sequence::{Sequence, SequenceStatus, TOKENS_PER_PAGE};
pub use types::{FinishReason, PromptKind, RequestId, TokenId};
