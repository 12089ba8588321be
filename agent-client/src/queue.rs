//! Outbound queue: a mutex-guarded FIFO of already-framed byte chunks waiting to be written to
//! the agent's stdin pipe, plus the write-side state machine that drains it.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::wake::WakeHandle;

/// Chunks enqueued here must already end in the frame terminator; callers don't get a chance to
/// add it later.
#[derive(Default)]
pub(crate) struct OutboundQueue {
    chunks: Mutex<VecDeque<Vec<u8>>>,
}

impl OutboundQueue {
    pub(crate) fn new() -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends `chunk` to the queue and wakes the reactor so it notices the new write work.
    pub(crate) fn push(&self, chunk: Vec<u8>, wake: &WakeHandle) {
        self.chunks.lock().unwrap().push_back(chunk);
        wake.notify();
    }

    /// Pulls the next chunk off the front, if any.
    pub(crate) fn pop(&self) -> Option<Vec<u8>> {
        self.chunks.lock().unwrap().pop_front()
    }
}

/// The write side of the event loop, tracked as an explicit state machine so the reactor always
/// knows whether `EPOLLOUT` interest is currently registered for the outbound pipe.
///
/// Invariant: write-interest is registered if and only if `self` is `Draining`.
#[derive(Debug)]
pub(crate) enum WriteState {
    /// No active chunk; write-interest is unregistered.
    Idle,
    /// `active[pos..]` remains to be written; write-interest is registered.
    Draining { active: Vec<u8>, pos: usize },
}

impl WriteState {
    pub(crate) fn is_draining(&self) -> bool {
        matches!(self, WriteState::Draining { .. })
    }
}

impl Default for WriteState {
    fn default() -> Self {
        WriteState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_preserves_order() {
        let wake = WakeHandle::new().unwrap();
        let q = OutboundQueue::new();
        q.push(b"one".to_vec(), &wake);
        q.push(b"two".to_vec(), &wake);
        assert_eq!(q.pop(), Some(b"one".to_vec()));
        assert_eq!(q.pop(), Some(b"two".to_vec()));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn idle_is_not_draining() {
        assert!(!WriteState::Idle.is_draining());
        let draining = WriteState::Draining {
            active: vec![1, 2, 3],
            pos: 0,
        };
        assert!(draining.is_draining());
    }
}
