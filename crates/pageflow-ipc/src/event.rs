//! Kernel event wakeup.
//!
//! One event object per process: producers trigger it after publishing a
//! slot, the ingestor blocks on it with a short timeout. The timeout doubles
//! as a poll interval, so the ingestor still drains slots published by a
//! producer that cannot reach this process's event object, and still notices
//! the shutdown flag promptly.
//!
//! Linux uses an `eventfd`; Darwin uses a `kqueue` user event.

use std::time::Duration;

use crate::error::{IpcError, Result};

#[cfg(target_os = "macos")]
const USER_EVENT_IDENT: libc::uintptr_t = 1;

/// A process-local kernel wakeup primitive.
pub struct KernelEvent {
    fd: libc::c_int,
}

// SAFETY: the fd is only ever passed to thread-safe syscalls.
unsafe impl Send for KernelEvent {}
unsafe impl Sync for KernelEvent {}

impl KernelEvent {
    /// Create the event object.
    #[cfg(target_os = "linux")]
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(IpcError::last_os_error("eventfd"));
        }
        Ok(Self { fd })
    }

    /// Create the event object.
    #[cfg(target_os = "macos")]
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(IpcError::last_os_error("kqueue"));
        }
        let change = libc::kevent {
            ident: USER_EVENT_IDENT,
            filter: libc::EVFILT_USER,
            flags: libc::EV_ADD | libc::EV_CLEAR,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        let rc = unsafe {
            libc::kevent(fd, &change, 1, std::ptr::null_mut(), 0, std::ptr::null())
        };
        if rc < 0 {
            let err = IpcError::last_os_error("kevent register");
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self { fd })
    }

    /// Raw descriptor, for callers that integrate their own poll loop.
    pub fn raw_fd(&self) -> libc::c_int {
        self.fd
    }

    /// Wake one waiter.
    #[cfg(target_os = "linux")]
    pub fn trigger(&self) -> Result<()> {
        let value: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd,
                std::ptr::addr_of!(value).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated, which still wakes waiters.
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                return Err(IpcError::Io(err));
            }
        }
        Ok(())
    }

    /// Wake one waiter.
    #[cfg(target_os = "macos")]
    pub fn trigger(&self) -> Result<()> {
        let change = libc::kevent {
            ident: USER_EVENT_IDENT,
            filter: libc::EVFILT_USER,
            flags: 0,
            fflags: libc::NOTE_TRIGGER,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        let rc = unsafe {
            libc::kevent(self.fd, &change, 1, std::ptr::null_mut(), 0, std::ptr::null())
        };
        if rc < 0 {
            return Err(IpcError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Block until triggered or `timeout` elapses. Returns `true` when the
    /// event fired.
    #[cfg(target_os = "linux")]
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }
            return Err(IpcError::Io(err));
        }
        if rc == 0 {
            return Ok(false);
        }
        // Drain the counter so the next wait blocks again.
        let mut value: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                std::ptr::addr_of_mut!(value).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        Ok(true)
    }

    /// Block until triggered or `timeout` elapses. Returns `true` when the
    /// event fired.
    #[cfg(target_os = "macos")]
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let mut out: libc::kevent = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::kevent(self.fd, std::ptr::null(), 0, &mut out, 1, &ts) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }
            return Err(IpcError::Io(err));
        }
        Ok(rc > 0)
    }
}

impl Drop for KernelEvent {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_times_out_when_untriggered() {
        let event = KernelEvent::new().unwrap();
        assert!(!event.wait(Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn test_trigger_wakes_waiter() {
        let event = KernelEvent::new().unwrap();
        event.trigger().unwrap();
        assert!(event.wait(Duration::from_millis(100)).unwrap());
        // Drained: a second wait must time out.
        assert!(!event.wait(Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn test_trigger_from_other_thread() {
        use std::sync::Arc;

        let event = Arc::new(KernelEvent::new().unwrap());
        let trigger_side = Arc::clone(&event);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            trigger_side.trigger().unwrap();
        });
        assert!(event.wait(Duration::from_millis(500)).unwrap());
        handle.join().unwrap();
    }
}
