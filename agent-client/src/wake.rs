//! A wake-up handle lets any thread interrupt the worker's blocking `epoll_wait`. It wraps a
//! Linux `eventfd`: writing any non-zero value wakes a reader blocked in epoll on that fd, and
//! the reader drains the accumulated counter with a single read.

use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd::{close, read, write};
use snafu::ResultExt;
use std::os::unix::io::RawFd;

use crate::error::{self, Result};

/// An eventfd-backed wake-up handle. Many threads may write to it; exactly one (the worker)
/// reads from it.
#[derive(Debug)]
pub(crate) struct WakeHandle {
    fd: RawFd,
}

impl WakeHandle {
    pub(crate) fn new() -> Result<Self> {
        // Non-blocking so a burst of writers never has to wait on us, and so the worker's drain
        // read can't block if it races a writer.
        let fd = eventfd(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .context(error::CreateEventFdSnafu)?;
        Ok(Self { fd })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Wakes the worker. Safe to call from any thread, any number of times; multiple pending
    /// wakes coalesce into the eventfd's internal counter.
    pub(crate) fn notify(&self) {
        let value: u64 = 1;
        // best effort: if this fails the worker is already gone or the fd is full past u64::MAX,
        // neither of which we can usefully recover from here.
        let _ = write(self.fd, &value.to_ne_bytes());
    }

    /// Drains the counter so the fd stops being readable until the next `notify`.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 8];
        let _ = read(self.fd, &mut buf);
    }
}

impl Drop for WakeHandle {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn notify_then_drain_is_idempotent() {
        let wake = WakeHandle::new().unwrap();
        wake.notify();
        wake.notify();
        wake.drain();

        // A second drain with nothing pending should not block or panic; the underlying read
        // simply returns EAGAIN on a non-blocking, empty eventfd.
        wake.drain();
    }

    #[test]
    fn raw_fd_is_stable_across_calls() {
        let wake = WakeHandle::new().unwrap();
        assert_eq!(wake.raw_fd(), wake.raw_fd());
    }

    #[test]
    fn fd_is_nonblocking() {
        let wake = WakeHandle::new().unwrap();
        let mut buf = [0u8; 8];
        let err = nix::unistd::read(wake.raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err, Errno::EAGAIN);
    }
}
