//! Request ring: producer and consumer sides.
//!
//! Producers (clients) claim a ticket from the control block, spin briefly
//! for their slot to come FREE, copy the payload in, and publish with a
//! release store of READY. The consumer (the engine's ingestor) drains READY
//! slots in ticket order, materializes owned [`RawRequest`] values, and
//! returns each slot to FREE.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use pageflow_core::{IpcHandles, LogitsParams, PromptKind, RequestId, SamplingParams, StopCriteria};

use crate::bulk::BulkSegment;
use crate::error::{IpcError, Result};
use crate::event::KernelEvent;
use crate::layout::{request_state, RequestSlot, WireLogitsParams, WireStopCriteria};
use crate::manager::IpcConfig;
use crate::ring::{RingView, MAX_SLOT_SPINS, SPIN_SLEEP};

/// A request as submitted by a client, before it enters the ring.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Client-assigned request id.
    pub request_id: RequestId,
    /// Prompt payload.
    pub prompt: String,
    /// How the prompt should be interpreted.
    pub prompt_kind: PromptKind,
    /// Sampling configuration.
    pub sampling_params: SamplingParams,
    /// Logit-processing configuration.
    pub logits_params: LogitsParams,
    /// Stop conditions.
    pub stop_criteria: StopCriteria,
    /// Client channel handles.
    pub ipc_handles: IpcHandles,
    /// Serialized tool schemas, empty when unused.
    pub tool_schemas: String,
    /// Serialized response-format constraint, empty when unused.
    pub response_format: String,
}

impl SubmitRequest {
    /// A plain completion request with default parameters.
    pub fn completion(request_id: RequestId, prompt: impl Into<String>) -> Self {
        Self {
            request_id,
            prompt: prompt.into(),
            prompt_kind: PromptKind::Completion,
            sampling_params: SamplingParams::default(),
            logits_params: LogitsParams::identity(),
            stop_criteria: StopCriteria::default(),
            ipc_handles: IpcHandles::default(),
            tool_schemas: String::new(),
            response_format: String::new(),
        }
    }
}

/// A request after the ingestor copied it out of shared memory.
#[derive(Debug)]
pub struct RawRequest {
    /// Client-assigned request id.
    pub request_id: RequestId,
    /// Stamped when the ingestor drained the slot.
    pub arrival_timestamp_ns: u64,
    /// Prompt payload, resolved from the bulk segment.
    pub prompt: String,
    /// How the prompt should be interpreted.
    pub prompt_kind: PromptKind,
    /// Prompt location in the bulk segment; freed by the preprocessor.
    pub bulk_offset: u64,
    /// Prompt length in the bulk segment.
    pub bulk_len: u64,
    /// Sampling configuration.
    pub sampling_params: SamplingParams,
    /// Logit-processing configuration.
    pub logits_params: LogitsParams,
    /// Stop conditions.
    pub stop_criteria: StopCriteria,
    /// Client channel handles.
    pub ipc_handles: IpcHandles,
    /// Serialized tool schemas.
    pub tool_schemas: String,
    /// Serialized response-format constraint.
    pub response_format: String,
}

/// Client-side producer for the request ring.
pub struct RequestWriter {
    ring: RingView<RequestSlot>,
    bulk: Arc<BulkSegment>,
    event: Option<Arc<KernelEvent>>,
}

impl RequestWriter {
    /// Map the request ring and bulk segment of an already running engine.
    ///
    /// `event` wakes the engine's ingestor immediately when available (same
    /// process); without it the ingestor's poll timeout bounds the latency.
    pub fn open(config: &IpcConfig, event: Option<Arc<KernelEvent>>) -> Result<Self> {
        let ring = RingView::open(&config.request_shm)?;
        let bulk = Arc::new(BulkSegment::open(&config.bulk_shm, config.bulk_bytes)?);
        Ok(Self { ring, bulk, event })
    }

    /// As [`open`](Self::open), but sharing an existing bulk mapping.
    pub fn with_bulk(
        config: &IpcConfig,
        bulk: Arc<BulkSegment>,
        event: Option<Arc<KernelEvent>>,
    ) -> Result<Self> {
        let ring = RingView::open(&config.request_shm)?;
        Ok(Self { ring, bulk, event })
    }

    /// Publish one request. Returns [`IpcError::SlotTimeout`] when the ring
    /// stayed full for the whole bounded spin; the request was not submitted
    /// and the producer index has been rolled back.
    pub fn submit(&self, request: &SubmitRequest) -> Result<()> {
        request.sampling_params.validate()?;
        let wire_logits = WireLogitsParams::encode(&request.logits_params)?;
        let wire_stop = WireStopCriteria::encode(&request.stop_criteria)?;
        for (field, value) in [
            ("tool_schemas", &request.tool_schemas),
            ("response_format", &request.response_format),
        ] {
            if value.len() > crate::layout::MAX_SCHEMA_BYTES {
                return Err(IpcError::FieldTooLarge {
                    field,
                    len: value.len(),
                    max: crate::layout::MAX_SCHEMA_BYTES,
                });
            }
        }

        let prompt_bytes = request.prompt.as_bytes();
        let prompt_offset = if prompt_bytes.is_empty() {
            0
        } else {
            let offset = self.bulk.alloc(prompt_bytes.len())?;
            self.bulk.write(offset, prompt_bytes);
            offset
        };

        let control = self.ring.control();
        let ticket = control.producer_idx.fetch_add(1, Ordering::AcqRel);
        let slot = self.ring.slot_ptr(ticket);

        // SAFETY: only the slot's state atomic is referenced here; payload
        // fields are written through raw pointers strictly between winning
        // the FREE -> WRITING CAS and the READY release below, during which
        // the protocol gives this producer exclusive slot access.
        let state = unsafe { &(*slot).state };
        let mut spins: u32 = 0;
        while state
            .compare_exchange_weak(
                request_state::FREE,
                request_state::WRITING,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            spins += 1;
            if spins > MAX_SLOT_SPINS {
                control.producer_idx.fetch_sub(1, Ordering::AcqRel);
                if !prompt_bytes.is_empty() {
                    self.bulk.free(prompt_offset);
                }
                return Err(IpcError::SlotTimeout {
                    request_id: request.request_id,
                });
            }
            // Mostly busy-spin; yield to the OS only occasionally so the
            // bounded spin stays near its intended wall-clock budget.
            if spins % 64 == 0 {
                std::thread::sleep(SPIN_SLEEP);
            } else {
                std::hint::spin_loop();
            }
        }

        // SAFETY: exclusive access per the protocol argument above; every
        // write targets a disjoint field, never the whole record.
        unsafe {
            std::ptr::addr_of_mut!((*slot).request_id).write(request.request_id);
            std::ptr::addr_of_mut!((*slot).prompt_kind).write(request.prompt_kind as u32);
            std::ptr::addr_of_mut!((*slot).prompt_offset).write(prompt_offset);
            std::ptr::addr_of_mut!((*slot).prompt_len).write(prompt_bytes.len() as u64);
            std::ptr::addr_of_mut!((*slot).sampling).write(request.sampling_params);
            std::ptr::addr_of_mut!((*slot).logits).write(wire_logits);
            std::ptr::addr_of_mut!((*slot).stop).write(wire_stop);
            std::ptr::addr_of_mut!((*slot).handles).write(request.ipc_handles);
            (*std::ptr::addr_of_mut!((*slot).tool_schemas)).put(&request.tool_schemas);
            (*std::ptr::addr_of_mut!((*slot).response_format)).put(&request.response_format);
        }

        state.store(request_state::READY, Ordering::Release);

        if let Some(event) = &self.event {
            event.trigger()?;
        }
        debug!(request_id = request.request_id, ticket, "request submitted");
        Ok(())
    }
}

/// Engine-side consumer for the request ring.
pub struct RequestReader {
    ring: RingView<RequestSlot>,
    bulk: Arc<BulkSegment>,
    event: Arc<KernelEvent>,
}

impl RequestReader {
    /// Map the request ring created by the [`crate::IpcManager`].
    pub fn open(config: &IpcConfig, bulk: Arc<BulkSegment>, event: Arc<KernelEvent>) -> Result<Self> {
        let ring = RingView::open(&config.request_shm)?;
        Ok(Self { ring, bulk, event })
    }

    /// Block until a producer signals, or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        self.event.wait(timeout)
    }

    /// Drain every READY slot in ticket order.
    ///
    /// `sink` receives each materialized request and returns whether it was
    /// accepted downstream. Rejected requests are dropped here (bulk block
    /// freed, slot returned to FREE) so a stalled pipeline never
    /// blocks the transport. Returns `(accepted, dropped)` counts.
    pub fn drain(&self, mut sink: impl FnMut(RawRequest) -> bool) -> (usize, usize) {
        let control = self.ring.control();
        let mut accepted = 0;
        let mut dropped = 0;

        loop {
            let produced = control.producer_idx.load(Ordering::Acquire);
            let cursor = control.consumer_idx.load(Ordering::Relaxed);
            if cursor == produced {
                break;
            }

            let slot = self.ring.slot_ptr(cursor);
            // SAFETY: only the state atomic is referenced; payload reads
            // happen strictly inside the READY -> READING window.
            let state = unsafe { &(*slot).state };
            if state
                .compare_exchange(
                    request_state::READY,
                    request_state::READING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                // The next slot in order is still being written; its
                // producer will signal again once it is READY.
                break;
            }

            let raw = unsafe { self.read_slot(slot) };
            let request_id = raw.request_id;
            let bulk_offset = raw.bulk_offset;
            let bulk_len = raw.bulk_len;

            if sink(raw) {
                accepted += 1;
            } else {
                warn!(request_id, "pipeline full; dropping request");
                if bulk_len > 0 {
                    self.bulk.free(bulk_offset);
                }
                dropped += 1;
            }

            state.store(request_state::FREE, Ordering::Release);
            control.consumer_idx.store(cursor + 1, Ordering::Release);
        }

        (accepted, dropped)
    }

    /// Copy one claimed slot into an owned request.
    ///
    /// # Safety
    /// The caller must hold the slot in READING state.
    unsafe fn read_slot(&self, slot: *mut RequestSlot) -> RawRequest {
        let prompt_offset = std::ptr::addr_of!((*slot).prompt_offset).read();
        let prompt_len = std::ptr::addr_of!((*slot).prompt_len).read();
        let prompt = self.bulk.read_string(prompt_offset, prompt_len as usize);

        RawRequest {
            request_id: std::ptr::addr_of!((*slot).request_id).read(),
            arrival_timestamp_ns: now_ns(),
            prompt,
            prompt_kind: PromptKind::from_u32(std::ptr::addr_of!((*slot).prompt_kind).read()),
            bulk_offset: prompt_offset,
            bulk_len: prompt_len,
            sampling_params: std::ptr::addr_of!((*slot).sampling).read(),
            logits_params: (*std::ptr::addr_of!((*slot).logits)).decode(),
            stop_criteria: (*std::ptr::addr_of!((*slot).stop)).decode(),
            ipc_handles: std::ptr::addr_of!((*slot).handles).read(),
            tool_schemas: (*std::ptr::addr_of!((*slot).tool_schemas)).get(),
            response_format: (*std::ptr::addr_of!((*slot).response_format)).get(),
        }
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::IpcManager;
    use crate::layout::NUM_SLOTS;

    fn test_setup(tag: &str) -> (IpcManager, RequestWriter, RequestReader) {
        let config = IpcConfig::with_suffix(&format!("req_{}_{}", tag, std::process::id()));
        let manager = IpcManager::new(config.clone()).unwrap();
        let writer =
            RequestWriter::with_bulk(&config, manager.bulk(), Some(manager.event())).unwrap();
        let reader = RequestReader::open(&config, manager.bulk(), manager.event()).unwrap();
        (manager, writer, reader)
    }

    #[test]
    fn test_submit_and_drain_round_trip() {
        let (_manager, writer, reader) = test_setup("rt");

        let mut request = SubmitRequest::completion(7, "hello world");
        request.stop_criteria.stop_token_ids.push(42);
        writer.submit(&request).unwrap();

        assert!(reader.wait(Duration::from_millis(200)).unwrap());
        let mut seen = Vec::new();
        let (accepted, dropped) = reader.drain(|raw| {
            seen.push(raw);
            true
        });
        assert_eq!((accepted, dropped), (1, 0));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].request_id, 7);
        assert_eq!(seen[0].prompt, "hello world");
        assert!(seen[0].stop_criteria.is_stop_token(42));
    }

    #[test]
    fn test_rejected_requests_are_dropped_not_blocked() {
        let (_manager, writer, reader) = test_setup("drop");

        for id in 0..4 {
            writer.submit(&SubmitRequest::completion(id, "p")).unwrap();
        }
        let (accepted, dropped) = reader.drain(|raw| raw.request_id % 2 == 0);
        assert_eq!((accepted, dropped), (2, 2));

        // All slots came back to FREE: the ring accepts more work.
        writer.submit(&SubmitRequest::completion(99, "p")).unwrap();
    }

    #[test]
    fn test_full_ring_times_out() {
        let (_manager, writer, _reader) = test_setup("full");

        for id in 0..NUM_SLOTS as u64 {
            writer.submit(&SubmitRequest::completion(id, "x")).unwrap();
        }
        // With no consumer, the next submission must fail in bounded time
        // rather than corrupt an unconsumed slot.
        let err = writer
            .submit(&SubmitRequest::completion(9999, "x"))
            .unwrap_err();
        assert!(matches!(err, IpcError::SlotTimeout { request_id: 9999 }));
    }

    #[test]
    fn test_concurrent_producers() {
        use std::sync::Arc as StdArc;

        let (manager, _writer, reader) = test_setup("mt");
        let config = manager.config().clone();
        let bulk = manager.bulk();

        const PRODUCERS: u64 = 8;
        const PER_PRODUCER: u64 = 50;

        let mut handles = Vec::new();
        let event = manager.event();
        for t in 0..PRODUCERS {
            let config = config.clone();
            let bulk = StdArc::clone(&bulk);
            let event = StdArc::clone(&event);
            handles.push(std::thread::spawn(move || {
                let writer = RequestWriter::with_bulk(&config, bulk, Some(event)).unwrap();
                for i in 0..PER_PRODUCER {
                    let id = t * PER_PRODUCER + i;
                    writer
                        .submit(&SubmitRequest::completion(id, "concurrent"))
                        .unwrap();
                }
            }));
        }

        let mut seen = std::collections::HashSet::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while seen.len() < (PRODUCERS * PER_PRODUCER) as usize {
            assert!(std::time::Instant::now() < deadline, "drain stalled");
            let _ = reader.wait(Duration::from_millis(10));
            reader.drain(|raw| {
                assert!(seen.insert(raw.request_id), "duplicate request");
                true
            });
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
