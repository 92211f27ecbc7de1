//! Fundamental identifiers and wire-stable tags.
//!
//! These types cross the process boundary, so their integer encodings are
//! part of the wire contract and must never be renumbered.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A request identifier, assigned by the client and carried end to end.
pub type RequestId = u64;

/// A vocabulary token id. Signed to match the transport layout.
pub type TokenId = i32;

/// Why a generation finished.
///
/// The integer tags are written verbatim into response slots; clients on the
/// other side of the shared-memory boundary decode them by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum FinishReason {
    /// A stop token was sampled.
    Stop = 0,
    /// The generation limit was reached.
    Length = 1,
    /// The request was cancelled by the client.
    User = 2,
    /// The KV-cache pool could not supply another page.
    Memory = 3,
    /// A tool call was produced.
    ToolUse = 4,
    /// The engine rejected or aborted the request.
    Injection = 5,
}

impl FinishReason {
    /// Wire encoding of this reason.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decode a wire tag. Unknown tags map to `Injection`.
    pub const fn from_u32(tag: u32) -> Self {
        match tag {
            0 => Self::Stop,
            1 => Self::Length,
            2 => Self::User,
            3 => Self::Memory,
            4 => Self::ToolUse,
            _ => Self::Injection,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::Stop => write!(f, "stop"),
            FinishReason::Length => write!(f, "length"),
            FinishReason::User => write!(f, "user"),
            FinishReason::Memory => write!(f, "memory"),
            FinishReason::ToolUse => write!(f, "tool_use"),
            FinishReason::Injection => write!(f, "injection"),
        }
    }
}

/// How the prompt payload should be interpreted before tokenization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum PromptKind {
    /// A single prompt string, tokenized as-is.
    Completion = 0,
    /// A serialized chat history; the chat template is applied first.
    ChatHistory = 1,
}

impl PromptKind {
    /// Decode a wire tag. Unknown tags fall back to `Completion`.
    pub const fn from_u32(tag: u32) -> Self {
        match tag {
            1 => Self::ChatHistory,
            _ => Self::Completion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_round_trip() {
        for reason in [
            FinishReason::Stop,
            FinishReason::Length,
            FinishReason::User,
            FinishReason::Memory,
            FinishReason::ToolUse,
            FinishReason::Injection,
        ] {
            assert_eq!(FinishReason::from_u32(reason.as_u32()), reason);
        }
    }

    #[test]
    fn test_unknown_tag_maps_to_injection() {
        assert_eq!(FinishReason::from_u32(99), FinishReason::Injection);
    }

    #[test]
    fn test_wire_tags_are_stable() {
        assert_eq!(FinishReason::Stop.as_u32(), 0);
        assert_eq!(FinishReason::Length.as_u32(), 1);
        assert_eq!(FinishReason::User.as_u32(), 2);
        assert_eq!(FinishReason::Memory.as_u32(), 3);
        assert_eq!(FinishReason::ToolUse.as_u32(), 4);
        assert_eq!(FinishReason::Injection.as_u32(), 5);
    }
}
