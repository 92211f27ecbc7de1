//! Response ring: engine-side writer and client-side reader.
//!
//! The writer follows the same claim/spin/publish protocol as the request
//! producer; the reader mirrors the request consumer but polls, since the
//! kernel event lives in the engine process.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use pageflow_core::{FinishReason, RequestId, TokenId};

use crate::error::{IpcError, Result};
use crate::layout::{
    response_state, ResponseDeltaSlot, MAX_CONTENT_BYTES, MAX_TOKENS_PER_DELTA,
};
use crate::manager::IpcConfig;
use crate::ring::{RingView, MAX_SLOT_SPINS, SPIN_SLEEP};

/// One increment of response, in owned form.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDelta {
    /// Request this delta belongs to.
    pub request_id: RequestId,
    /// Token ids in generation order; at most [`MAX_TOKENS_PER_DELTA`].
    pub tokens: Vec<TokenId>,
    /// Decoded UTF-8 for the tokens in this delta.
    pub content: String,
    /// True on the request's last delta.
    pub is_final: bool,
    /// Valid when `is_final`.
    pub finish_reason: FinishReason,
}

impl ResponseDelta {
    /// A single-token delta.
    pub fn token(request_id: RequestId, token: TokenId, content: impl Into<String>) -> Self {
        Self {
            request_id,
            tokens: vec![token],
            content: content.into(),
            is_final: false,
            finish_reason: FinishReason::Stop,
        }
    }

    /// Mark this delta final with the given reason.
    pub fn finishing(mut self, reason: FinishReason) -> Self {
        self.is_final = true;
        self.finish_reason = reason;
        self
    }

    /// A final delta carrying no tokens, used on error paths.
    pub fn terminal(request_id: RequestId, reason: FinishReason) -> Self {
        Self {
            request_id,
            tokens: Vec::new(),
            content: String::new(),
            is_final: true,
            finish_reason: reason,
        }
    }
}

/// Engine-side producer for the response ring.
pub struct ResponseWriter {
    ring: RingView<ResponseDeltaSlot>,
}

impl ResponseWriter {
    /// Map the response ring created by the [`crate::IpcManager`].
    pub fn open(config: &IpcConfig) -> Result<Self> {
        let ring = RingView::open(&config.response_shm)?;
        Ok(Self { ring })
    }

    /// Publish one delta. [`IpcError::SlotTimeout`] means the client stopped
    /// consuming and the ring filled; the caller logs and drops.
    pub fn write_delta(&self, delta: &ResponseDelta) -> Result<()> {
        let num_tokens = delta.tokens.len();
        if num_tokens > MAX_TOKENS_PER_DELTA {
            return Err(IpcError::FieldTooLarge {
                field: "tokens",
                len: num_tokens,
                max: MAX_TOKENS_PER_DELTA,
            });
        }

        let control = self.ring.control();
        let ticket = control.producer_idx.fetch_add(1, Ordering::AcqRel);
        let slot = self.ring.slot_ptr(ticket);

        // SAFETY: only the state atomic is referenced; payload writes happen
        // inside the WRITER_WRITING window this CAS opens.
        let state = unsafe { &(*slot).state };
        let mut spins: u32 = 0;
        while state
            .compare_exchange_weak(
                response_state::FREE_FOR_WRITER,
                response_state::WRITER_WRITING,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            spins += 1;
            if spins > MAX_SLOT_SPINS {
                control.producer_idx.fetch_sub(1, Ordering::AcqRel);
                return Err(IpcError::SlotTimeout {
                    request_id: delta.request_id,
                });
            }
            if spins % 64 == 0 {
                std::thread::sleep(SPIN_SLEEP);
            } else {
                std::hint::spin_loop();
            }
        }

        let mut content = delta.content.as_bytes();
        if content.len() > MAX_CONTENT_BYTES - 1 {
            warn!(
                request_id = delta.request_id,
                len = content.len(),
                "delta content exceeds slot capacity; truncating"
            );
            let mut cut = MAX_CONTENT_BYTES - 1;
            while cut > 0 && !delta.content.is_char_boundary(cut) {
                cut -= 1;
            }
            content = &delta.content.as_bytes()[..cut];
        }

        // SAFETY: exclusive access per the protocol; disjoint-field writes
        // only.
        unsafe {
            std::ptr::addr_of_mut!((*slot).request_id).write(delta.request_id);
            std::ptr::addr_of_mut!((*slot).num_tokens).write(num_tokens as u32);
            let tokens = std::ptr::addr_of_mut!((*slot).tokens);
            for (i, &token) in delta.tokens.iter().enumerate() {
                (*tokens)[i] = token;
            }
            // The logprob matrix is an extension point; zero the rows this
            // delta claims so readers never see stale values.
            let logprobs = std::ptr::addr_of_mut!((*slot).logprobs);
            for row in (*logprobs).iter_mut().take(num_tokens) {
                row.fill(0.0);
            }
            std::ptr::addr_of_mut!((*slot).is_final).write(u32::from(delta.is_final));
            std::ptr::addr_of_mut!((*slot).finish_reason).write(delta.finish_reason.as_u32());
            std::ptr::addr_of_mut!((*slot).content_len).write(content.len() as u32);
            std::ptr::copy_nonoverlapping(
                content.as_ptr(),
                std::ptr::addr_of_mut!((*slot).content).cast::<u8>(),
                content.len(),
            );
        }

        state.store(response_state::READY_FOR_READER, Ordering::Release);
        trace!(request_id = delta.request_id, ticket, "delta written");
        Ok(())
    }
}

/// Client-side consumer for the response ring.
pub struct ResponseReader {
    ring: RingView<ResponseDeltaSlot>,
}

impl ResponseReader {
    /// Map the response ring of a running engine.
    pub fn open(config: &IpcConfig) -> Result<Self> {
        let ring = RingView::open(&config.response_shm)?;
        Ok(Self { ring })
    }

    /// Claim the next READY delta, if any.
    pub fn try_next(&self) -> Option<ResponseDelta> {
        let control = self.ring.control();
        let produced = control.producer_idx.load(Ordering::Acquire);
        let cursor = control.consumer_idx.load(Ordering::Relaxed);
        if cursor == produced {
            return None;
        }

        let slot = self.ring.slot_ptr(cursor);
        // SAFETY: only the state atomic is referenced; payload reads happen
        // inside the READER_READING window.
        let state = unsafe { &(*slot).state };
        state
            .compare_exchange(
                response_state::READY_FOR_READER,
                response_state::READER_READING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;

        // SAFETY: slot held in READER_READING; disjoint-field reads only.
        let delta = unsafe {
            let num_tokens =
                (std::ptr::addr_of!((*slot).num_tokens).read() as usize).min(MAX_TOKENS_PER_DELTA);
            let content_len =
                (std::ptr::addr_of!((*slot).content_len).read() as usize).min(MAX_CONTENT_BYTES);
            let tokens_ptr = std::ptr::addr_of!((*slot).tokens);
            let content_ptr = std::ptr::addr_of!((*slot).content);
            ResponseDelta {
                request_id: std::ptr::addr_of!((*slot).request_id).read(),
                tokens: (&(*tokens_ptr))[..num_tokens].to_vec(),
                content: String::from_utf8_lossy(&(&(*content_ptr))[..content_len]).into_owned(),
                is_final: std::ptr::addr_of!((*slot).is_final).read() != 0,
                finish_reason: FinishReason::from_u32(
                    std::ptr::addr_of!((*slot).finish_reason).read(),
                ),
            }
        };

        state.store(response_state::FREE_FOR_WRITER, Ordering::Release);
        control.consumer_idx.store(cursor + 1, Ordering::Release);
        Some(delta)
    }

    /// Poll for the next delta until `timeout` elapses.
    pub fn next_delta(&self, timeout: Duration) -> Option<ResponseDelta> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delta) = self.try_next() {
                return Some(delta);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{IpcConfig, IpcManager};

    fn test_setup(tag: &str) -> (IpcManager, ResponseWriter, ResponseReader) {
        let config = IpcConfig::with_suffix(&format!("resp_{}_{}", tag, std::process::id()));
        let manager = IpcManager::new(config.clone()).unwrap();
        let writer = ResponseWriter::open(&config).unwrap();
        let reader = ResponseReader::open(&config).unwrap();
        (manager, writer, reader)
    }

    #[test]
    fn test_delta_round_trip() {
        let (_manager, writer, reader) = test_setup("rt");

        let delta = ResponseDelta::token(5, 42, "hi").finishing(FinishReason::Stop);
        writer.write_delta(&delta).unwrap();

        let received = reader.next_delta(Duration::from_millis(200)).unwrap();
        assert_eq!(received, delta);
    }

    #[test]
    fn test_deltas_preserve_order() {
        let (_manager, writer, reader) = test_setup("order");

        for i in 0..20 {
            writer.write_delta(&ResponseDelta::token(1, i, "t")).unwrap();
        }
        for i in 0..20 {
            let delta = reader.try_next().unwrap();
            assert_eq!(delta.tokens, vec![i]);
        }
        assert!(reader.try_next().is_none());
    }

    #[test]
    fn test_oversized_content_truncated_on_char_boundary() {
        let (_manager, writer, reader) = test_setup("trunc");

        // 300 bytes of multi-byte characters.
        let content = "é".repeat(150);
        let delta = ResponseDelta {
            request_id: 9,
            tokens: vec![1],
            content,
            is_final: false,
            finish_reason: FinishReason::Stop,
        };
        writer.write_delta(&delta).unwrap();

        let received = reader.next_delta(Duration::from_millis(200)).unwrap();
        assert!(received.content.len() <= MAX_CONTENT_BYTES - 1);
        assert!(received.content.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_too_many_tokens_rejected() {
        let (_manager, writer, _reader) = test_setup("overflow");
        let delta = ResponseDelta {
            request_id: 1,
            tokens: vec![0; MAX_TOKENS_PER_DELTA + 1],
            content: String::new(),
            is_final: false,
            finish_reason: FinishReason::Stop,
        };
        assert!(matches!(
            writer.write_delta(&delta),
            Err(IpcError::FieldTooLarge { .. })
        ));
    }
}
