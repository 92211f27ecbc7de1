//! Shared view over one slot ring.

use std::marker::PhantomData;

use crate::error::Result;
use crate::layout::{QueueControl, NUM_SLOTS, SLOT_MASK};
use crate::shm::SharedMemorySegment;

/// Producer bounded-spin limit; with the micro-sleep this is roughly one
/// second before a full ring is reported as a timeout.
pub(crate) const MAX_SLOT_SPINS: u32 = 1_000_000;

/// Sleep between producer spin iterations.
pub(crate) const SPIN_SLEEP: std::time::Duration = std::time::Duration::from_micros(1);

/// A typed mapping of a queue segment: control block plus slot array.
///
/// The view hands out raw slot pointers on purpose. A slot is shared with
/// other processes, so no Rust reference to the whole record may ever exist;
/// callers touch the state atomic through a field reference and copy the
/// payload field by field while they hold the slot's exclusive protocol
/// state.
pub(crate) struct RingView<S> {
    seg: SharedMemorySegment,
    _slots: PhantomData<S>,
}

impl<S> RingView<S> {
    /// Map an existing queue segment by name.
    pub(crate) fn open(name: &str) -> Result<Self> {
        let len = std::mem::size_of::<QueueControl>() + NUM_SLOTS * std::mem::size_of::<S>();
        let seg = SharedMemorySegment::open(name, len)?;
        Ok(Self {
            seg,
            _slots: PhantomData,
        })
    }

    /// The ring's control block.
    pub(crate) fn control(&self) -> &QueueControl {
        // SAFETY: offset 0 is in bounds and aligned; the control block is
        // mutated only through its atomics.
        unsafe { &*self.seg.typed_ptr::<QueueControl>(0) }
    }

    /// Pointer to the slot a monotonic ticket maps to.
    pub(crate) fn slot_ptr(&self, ticket: u64) -> *mut S {
        let index = (ticket & SLOT_MASK) as usize;
        let offset = std::mem::size_of::<QueueControl>() + index * std::mem::size_of::<S>();
        self.seg.typed_ptr::<S>(offset)
    }
}
