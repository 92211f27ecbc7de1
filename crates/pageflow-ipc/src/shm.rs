//! Named POSIX shared-memory segments.
//!
//! Thin wrapper over `shm_open`/`ftruncate` plus a `memmap2` mapping. The
//! creating side zero-fills and later unlinks the name; openers map an
//! existing segment and never unlink.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::FromRawFd;

use memmap2::MmapMut;
use tracing::{debug, warn};

use crate::error::{IpcError, Result};

/// A mapped named shared-memory segment.
pub struct SharedMemorySegment {
    name: String,
    // Held for the lifetime of the mapping; all access goes through `ptr`.
    _map: MmapMut,
    ptr: *mut u8,
    len: usize,
    owner: bool,
}

// SAFETY: the raw pointer targets a shared mapping that outlives the struct,
// and every mutation made through it is either an atomic operation or is
// ordered by an acquire/release pair on a slot-state atomic.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl SharedMemorySegment {
    /// Create (or replace) a named segment of `len` bytes, zero-filled.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        // A stale segment from a crashed run would otherwise be reused with
        // old contents; unlink first so creation starts from zeroes.
        let c_name = Self::c_name(name)?;
        unsafe { libc::shm_unlink(c_name.as_ptr()) };

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o666 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(IpcError::last_os_error(name));
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = IpcError::last_os_error(name);
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(err);
        }

        let segment = Self::map(name.to_string(), fd, len, true)?;
        debug!(name, len, "created shared-memory segment");
        Ok(segment)
    }

    /// Map an existing named segment of `len` bytes.
    pub fn open(name: &str, len: usize) -> Result<Self> {
        let c_name = Self::c_name(name)?;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(IpcError::last_os_error(name));
        }
        let segment = Self::map(name.to_string(), fd, len, false)?;
        debug!(name, len, "opened shared-memory segment");
        Ok(segment)
    }

    fn map(name: String, fd: libc::c_int, len: usize, owner: bool) -> Result<Self> {
        // SAFETY: `fd` is a live descriptor we own; `File` takes it over and
        // closes it after the mapping is established (mappings survive close).
        let file = unsafe { File::from_raw_fd(fd) };
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| IpcError::init(&name, e))?;
        let ptr = map.as_mut_ptr();
        Ok(Self {
            name,
            _map: map,
            ptr,
            len,
            owner,
        })
    }

    /// Base address of the mapping in this process.
    pub fn base_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Segment length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for zero-length segments (never the case in practice).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A typed pointer at `offset`, bounds- and alignment-checked.
    ///
    /// # Panics
    /// Panics if `offset + size_of::<T>()` exceeds the segment or the offset
    /// is misaligned for `T`; both are construction-time layout bugs, not
    /// runtime conditions.
    pub fn typed_ptr<T>(&self, offset: usize) -> *mut T {
        assert!(offset + std::mem::size_of::<T>() <= self.len);
        let ptr = unsafe { self.ptr.add(offset) };
        assert_eq!(ptr as usize % std::mem::align_of::<T>(), 0);
        ptr.cast()
    }

    fn c_name(name: &str) -> Result<CString> {
        CString::new(name).map_err(|_| {
            IpcError::init(
                name,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "name contains NUL"),
            )
        })
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        if self.owner {
            if let Ok(c_name) = Self::c_name(&self.name) {
                if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(name = %self.name, %err, "shm_unlink failed");
                    }
                }
            }
        }
    }
}
