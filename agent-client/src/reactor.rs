//! The readiness reactor: a single worker thread that owns both pipe file descriptors, the
//! wake-up handle, and the epoll instance multiplexing them. No other thread ever touches these
//! handles; callers only ever talk to the outbound queue and the registry.

use log::{debug, error, warn};
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
use nix::unistd::{close, read, write, Pid};
use snafu::ResultExt;
use std::convert::TryFrom;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::buffer::InboundBuffer;
use crate::error::{self, Result};
use crate::process::kill_and_reap;
use crate::queue::{OutboundQueue, WriteState};
use crate::waiter::{Outcome, Registry};
use crate::wake::WakeHandle;

const MAX_EVENTS: usize = 16;

/// Shared lifecycle state between the client's `close()` and the worker thread: `stop_request`
/// is written once by `close()` and polled by the worker; `is_stopped` goes the other way,
/// written once by the worker on exit and awaited by `close()`.
pub(crate) struct SharedStop {
    pub(crate) stop_request: AtomicBool,
    is_stopped: Mutex<bool>,
    condvar: Condvar,
}

impl SharedStop {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            stop_request: AtomicBool::new(false),
            is_stopped: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    /// Requests shutdown and wakes the worker so it notices promptly. Idempotent.
    pub(crate) fn request_stop(&self, wake: &WakeHandle) {
        self.stop_request.store(true, Ordering::Release);
        wake.notify();
    }

    pub(crate) fn wait_until_stopped(&self) {
        let mut stopped = self.is_stopped.lock().unwrap();
        while !*stopped {
            stopped = self.condvar.wait(stopped).unwrap();
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.is_stopped.lock().unwrap()
    }

    fn mark_stopped(&self) {
        let mut stopped = self.is_stopped.lock().unwrap();
        *stopped = true;
        self.condvar.notify_all();
    }
}

struct Reactor {
    epoll_fd: RawFd,
    wake: Arc<WakeHandle>,
    read_fd: RawFd,
    write_fd: RawFd,
    pid: Pid,
    outbound: Arc<OutboundQueue>,
    registry: Arc<Registry>,
    stop: Arc<SharedStop>,
    inbound: InboundBuffer,
    write_state: WriteState,
    write_interest_armed: bool,
    need_cleanup: bool,
}

/// Registers the always-on interests and starts the worker thread. On success the returned
/// thread owns `read_fd`/`write_fd`/`pid`/the epoll instance and is solely responsible for
/// tearing them down when it exits. On failure, only the epoll instance this call created has
/// been cleaned up - the caller still owns `read_fd`, `write_fd`, and `pid`.
pub(crate) fn spawn_worker(
    pid: Pid,
    read_fd: RawFd,
    write_fd: RawFd,
    wake: Arc<WakeHandle>,
    outbound: Arc<OutboundQueue>,
    registry: Arc<Registry>,
    stop: Arc<SharedStop>,
) -> Result<JoinHandle<()>> {
    let epoll_fd = epoll_create1(EpollCreateFlags::empty()).context(error::CreateEpollSnafu)?;

    if let Err(e) = arm_always_on_interests(epoll_fd, wake.raw_fd(), read_fd) {
        let _ = close(epoll_fd);
        return Err(e);
    }

    let reactor = Reactor {
        epoll_fd,
        wake,
        read_fd,
        write_fd,
        pid,
        outbound,
        registry,
        stop,
        inbound: InboundBuffer::new(),
        write_state: WriteState::Idle,
        write_interest_armed: false,
        need_cleanup: false,
    };

    thread::Builder::new()
        .name("agent-client-worker".to_string())
        .spawn(move || reactor.run())
        .context(error::SpawnWorkerSnafu)
}

fn arm_always_on_interests(epoll_fd: RawFd, wake_fd: RawFd, read_fd: RawFd) -> Result<()> {
    let mut wake_ev = EpollEvent::new(EpollFlags::EPOLLIN, wake_fd as u64);
    epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, wake_fd, Some(&mut wake_ev)).context(error::EpollCtlSnafu)?;

    let mut read_ev = EpollEvent::new(EpollFlags::EPOLLIN, read_fd as u64);
    epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, read_fd, Some(&mut read_ev)).context(error::EpollCtlSnafu)?;

    Ok(())
}

impl Reactor {
    fn run(mut self) {
        block_all_signals();

        loop {
            let mut events = [EpollEvent::empty(); MAX_EVENTS];
            let n = match epoll_wait(self.epoll_fd, &mut events, -1) {
                Ok(n) => n,
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    error!("epoll_wait failed: {}", e);
                    break;
                }
            };
            if n == 0 {
                error!("epoll_wait returned zero events while blocking indefinitely");
                break;
            }

            let mut wake_ready = false;
            let mut inbound_ready = false;
            let mut outbound_ready = false;
            for ev in &events[..n] {
                let fd = ev.data() as RawFd;
                let flags = ev.events();
                if fd == self.wake.raw_fd() {
                    wake_ready = true;
                } else if fd == self.read_fd {
                    if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP) {
                        inbound_ready = true;
                    } else {
                        warn!("spurious wake-up on inbound pipe");
                    }
                } else if fd == self.write_fd {
                    if flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLERR) {
                        outbound_ready = true;
                    } else {
                        warn!("spurious wake-up on outbound pipe");
                    }
                }
            }

            if wake_ready {
                self.handle_wake();
            }
            if inbound_ready {
                self.handle_inbound_readable();
            }
            if outbound_ready {
                self.handle_outbound_writable();
            }

            if self.stop.stop_request.load(Ordering::Acquire) {
                self.force_close_write_side();
            }
            if self.need_cleanup {
                break;
            }

            self.dispatch_inbound_frames();
        }

        self.shut_down();
    }

    /// Drains the wake-up counter and, absent a pending stop request, arms write interest if
    /// there's now something queued to send.
    fn handle_wake(&mut self) {
        self.wake.drain();
        if self.stop.stop_request.load(Ordering::Acquire) {
            return;
        }
        if !self.write_state.is_draining() {
            if let Some(chunk) = self.outbound.pop() {
                self.arm_write_interest();
                self.write_state = WriteState::Draining { active: chunk, pos: 0 };
            }
        }
    }

    fn arm_write_interest(&mut self) {
        if self.write_interest_armed {
            return;
        }
        let mut ev = EpollEvent::new(EpollFlags::EPOLLOUT, self.write_fd as u64);
        if let Err(e) = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, self.write_fd, Some(&mut ev)) {
            warn!("failed to arm write interest: {}", e);
            return;
        }
        self.write_interest_armed = true;
    }

    fn disarm_write_interest(&mut self) {
        if !self.write_interest_armed {
            return;
        }
        if let Err(e) = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, self.write_fd, None) {
            warn!("failed to disarm write interest: {}", e);
        }
        self.write_interest_armed = false;
    }

    /// Reads until the pipe would block or is closed. A single non-blocking `read` on a pipe
    /// already returns everything currently buffered, so a plain EINTR-retrying loop (matching
    /// the original C source) is used here rather than the vendored `retry_read` helper: that
    /// helper keeps filling a buffer across multiple underlying reads and, on hitting
    /// `WouldBlock` partway through, discards the count of bytes it already read - fine for a
    /// blocking source, wrong for a non-blocking one.
    fn handle_inbound_readable(&mut self) {
        let mut buf = [0u8; constants::READ_CHUNK_SIZE];
        loop {
            match read(self.read_fd, &mut buf) {
                Ok(0) => {
                    self.need_cleanup = true;
                    return;
                }
                Ok(n) => {
                    self.inbound.extend(&buf[..n]);
                }
                Err(nix::Error::EINTR) => continue,
                Err(nix::Error::EAGAIN) => return,
                Err(e) => {
                    error!("inbound pipe read failed: {}", e);
                    self.need_cleanup = true;
                    return;
                }
            }
        }
    }

    fn handle_outbound_writable(&mut self) {
        loop {
            let (active, pos) = match &mut self.write_state {
                WriteState::Draining { active, pos } => (active, pos),
                WriteState::Idle => {
                    self.disarm_write_interest();
                    return;
                }
            };

            match write(self.write_fd, &active[*pos..]) {
                Ok(0) => {
                    error!("outbound pipe write returned 0");
                    self.need_cleanup = true;
                    return;
                }
                Ok(n) => {
                    *pos += n;
                    if *pos == active.len() {
                        match self.outbound.pop() {
                            Some(next) => {
                                self.write_state = WriteState::Draining { active: next, pos: 0 };
                            }
                            None => {
                                self.write_state = WriteState::Idle;
                                self.disarm_write_interest();
                                return;
                            }
                        }
                    }
                }
                Err(nix::Error::EINTR) => continue,
                Err(nix::Error::EAGAIN) => return,
                Err(e) => {
                    error!("outbound pipe write failed: {}", e);
                    self.need_cleanup = true;
                    return;
                }
            }
        }
    }

    /// Forcefully closes the write side once a stop has been requested, matching the original
    /// source's shutdown path: further enqueues are pointless once the client has asked to
    /// close, so the write fd is torn down eagerly rather than waiting for the queue to drain.
    fn force_close_write_side(&mut self) {
        self.disarm_write_interest();
        if self.write_fd >= 0 {
            let _ = close(self.write_fd);
            self.write_fd = -1;
        }
    }

    fn dispatch_inbound_frames(&mut self) {
        for frame in self.inbound.take_frames() {
            let value: serde_json::Value = match serde_json::from_slice(&frame) {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to parse inbound frame: {}", e);
                    continue;
                }
            };
            let serial = match value.get("s").and_then(|s| s.as_u64()).and_then(|s| u32::try_from(s).ok()) {
                Some(s) => s,
                None => {
                    warn!("inbound frame missing a numeric 's' field");
                    continue;
                }
            };
            match self.registry.take(serial) {
                Some(waiter) => waiter.signal(Outcome::Reply(value)),
                None => debug!("late reply for serial {}, no waiter registered", serial),
            }
        }
    }

    fn shut_down(self) {
        kill_and_reap(self.pid);
        self.registry.drain_with_stopped();
        if self.write_fd >= 0 {
            let _ = close(self.write_fd);
        }
        let _ = close(self.read_fd);
        let _ = close(self.epoll_fd);
        self.stop.mark_stopped();
    }
}

/// Blocks all signals on the calling thread so their delivery to this process is deterministic;
/// the reactor only cares about fd readiness, never signal interruption semantics.
fn block_all_signals() {
    let all = SigSet::all();
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&all), None) {
        warn!("failed to block signals on worker thread: {}", e);
    }
}
