//! Bulk prompt storage.
//!
//! Variable-length prompt bytes do not fit in fixed slots, so they travel
//! through a separate shared segment with its own allocator. Slots publish
//! `(offset, len)` pairs into this segment; offsets are relative to the
//! segment base, so every process's mapping resolves them independently.
//!
//! The allocator is a first-fit free list kept entirely inside the segment:
//! a header word spin-locks the metadata, every block carries its payload
//! size in the eight bytes before the payload, and a free block reuses its
//! first eight payload bytes as the next-free link. Any mapping of the
//! segment, engine or client on either side of the process boundary, can
//! allocate and free.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::trace;

use crate::error::{IpcError, Result};
use crate::shm::SharedMemorySegment;

/// Offset of the first block header; keeps the header on its own lines.
const DATA_START: u64 = 64;

/// Per-block size prefix.
const BLOCK_HEADER: u64 = 8;

/// Allocation granularity; also the minimum payload (a free-list link fits).
const GRANULE: u64 = 8;

/// Minimum payload worth splitting off as a remainder block.
const MIN_SPLIT: u64 = 64;

/// Sentinel for "no free block".
const NIL: u64 = 0;

#[repr(C, align(64))]
struct BulkHeader {
    lock: AtomicU32,
    _pad: u32,
    free_head: AtomicU64,
    brk: AtomicU64,
    capacity: AtomicU64,
}

/// A shared bulk-data segment with an in-segment allocator.
pub struct BulkSegment {
    seg: SharedMemorySegment,
}

impl BulkSegment {
    /// Create a fresh segment of `capacity` bytes and initialize the
    /// allocator header.
    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        let seg = SharedMemorySegment::create(name, capacity)?;
        let bulk = Self { seg };
        let header = bulk.header();
        header.free_head.store(NIL, Ordering::Relaxed);
        header.brk.store(DATA_START, Ordering::Relaxed);
        header.capacity.store(capacity as u64, Ordering::Release);
        Ok(bulk)
    }

    /// Map an existing segment created elsewhere.
    pub fn open(name: &str, capacity: usize) -> Result<Self> {
        let seg = SharedMemorySegment::open(name, capacity)?;
        Ok(Self { seg })
    }

    fn header(&self) -> &BulkHeader {
        // SAFETY: offset 0 is in bounds and 64-byte aligned; the header is
        // only ever mutated through its atomics.
        unsafe { &*self.seg.typed_ptr::<BulkHeader>(0) }
    }

    fn lock(&self) {
        let header = self.header();
        while header
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.header().lock.store(0, Ordering::Release);
    }

    fn read_u64(&self, offset: u64) -> u64 {
        // SAFETY: callers hold the allocator lock and pass offsets inside
        // the segment.
        unsafe { self.seg.typed_ptr::<u64>(offset as usize).read() }
    }

    fn write_u64(&self, offset: u64, value: u64) {
        // SAFETY: as `read_u64`.
        unsafe { self.seg.typed_ptr::<u64>(offset as usize).write(value) }
    }

    /// Allocate `len` bytes, returning the payload offset.
    pub fn alloc(&self, len: usize) -> Result<u64> {
        if len == 0 {
            return Err(IpcError::BulkExhausted { requested: 0 });
        }
        let need = (len as u64).max(GRANULE).next_multiple_of(GRANULE);
        self.lock();

        // First fit over the free list.
        let mut prev = NIL;
        let mut cursor = self.header().free_head.load(Ordering::Relaxed);
        while cursor != NIL {
            let size = self.read_u64(cursor - BLOCK_HEADER);
            let next = self.read_u64(cursor);
            if size >= need {
                self.unlink(prev, next);
                self.maybe_split(cursor, size, need);
                self.unlock();
                trace!(offset = cursor, len, "bulk alloc (reused)");
                return Ok(cursor);
            }
            prev = cursor;
            cursor = next;
        }

        // Nothing fits; extend the high-water mark.
        let header = self.header();
        let brk = header.brk.load(Ordering::Relaxed);
        let capacity = header.capacity.load(Ordering::Relaxed);
        let end = brk + BLOCK_HEADER + need;
        if end > capacity {
            self.unlock();
            return Err(IpcError::BulkExhausted { requested: len });
        }
        self.write_u64(brk, need);
        header.brk.store(end, Ordering::Relaxed);
        self.unlock();

        let payload = brk + BLOCK_HEADER;
        trace!(offset = payload, len, "bulk alloc (fresh)");
        Ok(payload)
    }

    /// Return a previously allocated block to the free list.
    pub fn free(&self, offset: u64) {
        self.lock();
        let header = self.header();
        let head = header.free_head.load(Ordering::Relaxed);
        self.write_u64(offset, head);
        header.free_head.store(offset, Ordering::Relaxed);
        self.unlock();
        trace!(offset, "bulk free");
    }

    /// Copy `bytes` into the block at `offset`.
    pub fn write(&self, offset: u64, bytes: &[u8]) {
        // SAFETY: the offset came from `alloc`, whose size covers `bytes`;
        // the block is exclusively owned by the caller until it is published.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.seg.base_ptr().add(offset as usize),
                bytes.len(),
            );
        }
    }

    /// Copy `len` bytes out of the block at `offset`.
    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        // SAFETY: the (offset, len) pair was published through a slot whose
        // release/acquire edge ordered the producer's writes before us.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.seg.base_ptr().add(offset as usize),
                out.as_mut_ptr(),
                len,
            );
        }
        out
    }

    /// Read a block as UTF-8, replacing invalid bytes.
    pub fn read_string(&self, offset: u64, len: usize) -> String {
        String::from_utf8_lossy(&self.read(offset, len)).into_owned()
    }

    fn unlink(&self, prev: u64, next: u64) {
        if prev == NIL {
            self.header().free_head.store(next, Ordering::Relaxed);
        } else {
            self.write_u64(prev, next);
        }
    }

    fn maybe_split(&self, payload: u64, size: u64, need: u64) {
        let remainder = size - need;
        if remainder < BLOCK_HEADER + MIN_SPLIT {
            return;
        }
        // Shrink the block in place and push the tail as a new free block.
        self.write_u64(payload - BLOCK_HEADER, need);
        let tail_payload = payload + need + BLOCK_HEADER;
        self.write_u64(tail_payload - BLOCK_HEADER, remainder - BLOCK_HEADER);
        let header = self.header();
        let head = header.free_head.load(Ordering::Relaxed);
        self.write_u64(tail_payload, head);
        header.free_head.store(tail_payload, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/pageflow_test_bulk_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_alloc_write_read_round_trip() {
        let bulk = BulkSegment::create(&unique_name("rw"), 64 * 1024).unwrap();
        let offset = bulk.alloc(11).unwrap();
        bulk.write(offset, b"hello pages");
        assert_eq!(bulk.read_string(offset, 11), "hello pages");
    }

    #[test]
    fn test_free_then_reuse() {
        let bulk = BulkSegment::create(&unique_name("reuse"), 64 * 1024).unwrap();
        let a = bulk.alloc(100).unwrap();
        bulk.free(a);
        let b = bulk.alloc(100).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let bulk = BulkSegment::create(&unique_name("oom"), 4 * 1024).unwrap();
        assert!(bulk.alloc(16 * 1024).is_err());
    }

    #[test]
    fn test_split_leaves_usable_remainder() {
        let bulk = BulkSegment::create(&unique_name("split"), 64 * 1024).unwrap();
        let big = bulk.alloc(1024).unwrap();
        bulk.free(big);
        let small = bulk.alloc(64).unwrap();
        assert_eq!(small, big);
        // The tail of the split block satisfies another allocation without
        // touching the high-water mark.
        let brk_before = bulk.header().brk.load(Ordering::Relaxed);
        let tail = bulk.alloc(128).unwrap();
        assert_ne!(tail, small);
        assert_eq!(bulk.header().brk.load(Ordering::Relaxed), brk_before);
    }

    #[test]
    fn test_concurrent_alloc_free() {
        use std::sync::Arc;

        let bulk = Arc::new(BulkSegment::create(&unique_name("mt"), 1024 * 1024).unwrap());
        let mut handles = Vec::new();
        for t in 0..4 {
            let bulk = Arc::clone(&bulk);
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let len = 16 + ((t * 37 + i) % 100);
                    let offset = bulk.alloc(len).unwrap();
                    bulk.write(offset, &vec![t as u8; len]);
                    let back = bulk.read(offset, len);
                    assert!(back.iter().all(|&b| b == t as u8));
                    bulk.free(offset);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
