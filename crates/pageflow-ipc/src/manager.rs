//! Transport lifecycle.
//!
//! The [`IpcManager`] is constructed once at engine start. It creates and
//! zero-initializes the two queue segments and the bulk segment, explicitly
//! seeds every slot state and both ring indices, and creates the kernel
//! event. Dropping it unlinks the segments and closes the event descriptor.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::info;

use crate::bulk::BulkSegment;
use crate::error::Result;
use crate::event::KernelEvent;
use crate::layout::{
    request_state, response_state, QueueControl, RequestSlot, ResponseDeltaSlot, NUM_SLOTS,
    REQUEST_SEGMENT_SIZE, RESPONSE_SEGMENT_SIZE,
};
use crate::shm::SharedMemorySegment;

/// Default request ring segment name.
pub const DEFAULT_REQUEST_SHM: &str = "/pie_request_slots";
/// Default response ring segment name.
pub const DEFAULT_RESPONSE_SHM: &str = "/pie_response_slots";
/// Default bulk prompt segment name.
pub const DEFAULT_BULK_SHM: &str = "/pie_bulk_data";
/// Default bulk segment capacity.
pub const DEFAULT_BULK_BYTES: usize = 256 * 1024 * 1024;

/// Names and sizes of the transport's shared resources.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Request ring segment name.
    pub request_shm: String,
    /// Response ring segment name.
    pub response_shm: String,
    /// Bulk prompt segment name.
    pub bulk_shm: String,
    /// Bulk segment capacity in bytes.
    pub bulk_bytes: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            request_shm: DEFAULT_REQUEST_SHM.to_string(),
            response_shm: DEFAULT_RESPONSE_SHM.to_string(),
            bulk_shm: DEFAULT_BULK_SHM.to_string(),
            bulk_bytes: DEFAULT_BULK_BYTES,
        }
    }
}

impl IpcConfig {
    /// A config whose segment names carry a unique suffix and whose bulk
    /// segment is small. Tests use this so concurrent test processes never
    /// collide on segment names.
    pub fn with_suffix(suffix: &str) -> Self {
        Self {
            request_shm: format!("{DEFAULT_REQUEST_SHM}_{suffix}"),
            response_shm: format!("{DEFAULT_RESPONSE_SHM}_{suffix}"),
            bulk_shm: format!("{DEFAULT_BULK_SHM}_{suffix}"),
            bulk_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Owns the transport's shared resources for the engine process.
pub struct IpcManager {
    config: IpcConfig,
    // Segment handles are held only for ownership: creation zero-filled and
    // seeded them, drop unlinks them. Readers and writers map by name.
    _request_segment: SharedMemorySegment,
    _response_segment: SharedMemorySegment,
    bulk: Arc<BulkSegment>,
    event: Arc<KernelEvent>,
}

impl IpcManager {
    /// Create every shared resource. Fatal on any failure; partially created
    /// segments are unlinked by the drop of what was already constructed.
    pub fn new(config: IpcConfig) -> Result<Self> {
        let request_segment = SharedMemorySegment::create(&config.request_shm, REQUEST_SEGMENT_SIZE)?;
        Self::seed_queue::<RequestSlot>(&request_segment, request_state::FREE);

        let response_segment =
            SharedMemorySegment::create(&config.response_shm, RESPONSE_SEGMENT_SIZE)?;
        Self::seed_queue::<ResponseDeltaSlot>(&response_segment, response_state::FREE_FOR_WRITER);

        let bulk = Arc::new(BulkSegment::create(&config.bulk_shm, config.bulk_bytes)?);
        let event = Arc::new(KernelEvent::new()?);

        info!(
            request = %config.request_shm,
            response = %config.response_shm,
            slots = NUM_SLOTS,
            "ipc transport initialized"
        );

        Ok(Self {
            config,
            _request_segment: request_segment,
            _response_segment: response_segment,
            bulk,
            event,
        })
    }

    /// Zero-fill already happened at creation; seed the atomics explicitly so
    /// the protocol never depends on FREE being encoded as zero.
    fn seed_queue<S>(segment: &SharedMemorySegment, free_state: u32) {
        let control_size = std::mem::size_of::<QueueControl>();
        // SAFETY: the layout places the control block at offset 0 and slots
        // right after; the segment was sized for exactly this.
        let control = unsafe { &*segment.typed_ptr::<QueueControl>(0) };
        control.producer_idx.store(0, Ordering::Relaxed);
        control.consumer_idx.store(0, Ordering::Relaxed);
        for i in 0..NUM_SLOTS {
            let offset = control_size + i * std::mem::size_of::<S>();
            // SAFETY: in-bounds by construction; only the leading state
            // atomic is touched. Slot types lead with their AtomicU32 state.
            let state = unsafe { &*segment.typed_ptr::<std::sync::atomic::AtomicU32>(offset) };
            state.store(free_state, Ordering::Relaxed);
        }
    }

    /// The bulk prompt segment.
    pub fn bulk(&self) -> Arc<BulkSegment> {
        Arc::clone(&self.bulk)
    }

    /// The shared kernel event.
    pub fn event(&self) -> Arc<KernelEvent> {
        Arc::clone(&self.event)
    }

    /// Raw event descriptor.
    pub fn event_fd(&self) -> libc::c_int {
        self.event.raw_fd()
    }

    /// Wake the ingestor.
    pub fn trigger_event(&self) -> Result<()> {
        self.event.trigger()
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &IpcConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::SharedMemorySegment;

    #[test]
    fn test_manager_creates_and_unlinks_segments() {
        let config = IpcConfig::with_suffix(&format!("mgr_{}", std::process::id()));
        let request_name = config.request_shm.clone();
        {
            let manager = IpcManager::new(config).unwrap();
            // The segments exist while the manager lives.
            assert!(
                SharedMemorySegment::open(&request_name, REQUEST_SEGMENT_SIZE).is_ok()
            );
            manager.trigger_event().unwrap();
        }
        // Unlinked on drop.
        assert!(SharedMemorySegment::open(&request_name, REQUEST_SEGMENT_SIZE).is_err());
    }
}
