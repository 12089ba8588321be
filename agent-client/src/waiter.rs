//! Request/reply correlation: a `Waiter` is created per outstanding request and shared between
//! the calling thread and the registry via `Arc`, so it can outlive a timed-out caller without
//! ever being referenced by a dangling pointer. The `Registry` maps serials to waiters and
//! dispatches parsed replies (or the shutdown sentinel) to them.
//!
//! The original C implementation allocated its `struct Future` on the caller's stack and handed
//! a raw pointer to the worker thread; a caller that gave up early (timeout) left that pointer
//! dangling if the worker later tried to signal it. Heap-allocating the waiter behind an `Arc`
//! closes that hole: the registry's reference and the caller's reference each keep it alive
//! independently, and whichever side finishes last frees it.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// Outcome delivered to a waiting caller.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    /// The agent replied with this parsed JSON value.
    Reply(serde_json::Value),
    /// The client is shutting down; no reply will ever arrive for this serial.
    Stopped,
}

#[derive(Debug, Default)]
struct WaiterState {
    outcome: Option<Outcome>,
}

/// One outstanding request's synchronization point.
#[derive(Debug)]
pub(crate) struct Waiter {
    serial: u32,
    state: Mutex<WaiterState>,
    condvar: Condvar,
}

impl Waiter {
    pub(crate) fn new(serial: u32) -> Arc<Self> {
        Arc::new(Self {
            serial,
            state: Mutex::new(WaiterState::default()),
            condvar: Condvar::new(),
        })
    }

    pub(crate) fn serial(&self) -> u32 {
        self.serial
    }

    /// Delivers `outcome` and wakes whoever is blocked in `wait`/`wait_timeout`. Idempotent only
    /// in the sense that a second call overwrites the first; callers are expected to deliver at
    /// most once, since the registry removes a waiter from its map before signalling it.
    pub(crate) fn signal(&self, outcome: Outcome) {
        let mut state = self.state.lock().unwrap();
        state.outcome = Some(outcome);
        self.condvar.notify_all();
    }

    /// Blocks until an outcome is delivered.
    pub(crate) fn wait(&self) -> Outcome {
        let mut state = self.state.lock().unwrap();
        while state.outcome.is_none() {
            state = self.condvar.wait(state).unwrap();
        }
        state.outcome.clone().unwrap()
    }

    /// Blocks until an outcome is delivered or `timeout` elapses, returning `None` on timeout.
    pub(crate) fn wait_timeout(&self, timeout: std::time::Duration) -> Option<Outcome> {
        let (mut state, result) = self
            .condvar
            .wait_timeout_while(self.state.lock().unwrap(), timeout, |s| s.outcome.is_none())
            .unwrap();
        if result.timed_out() {
            None
        } else {
            state.outcome.take()
        }
    }
}

/// Tracks outstanding requests by serial. A request is present from the moment it's `insert`ed
/// until the first of: a matching reply arrives, the registry is drained at shutdown, or the
/// caller cancels via `take` after giving up on a timeout.
#[derive(Default)]
pub(crate) struct Registry {
    waiters: Mutex<HashMap<u32, Arc<Waiter>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, waiter: Arc<Waiter>) {
        self.waiters.lock().unwrap().insert(waiter.serial(), waiter);
    }

    /// Removes and returns the waiter for `serial`, if still present. Called both by the reactor
    /// when a reply arrives and by a caller racing a timeout against a late reply; whichever side
    /// calls first wins, and the loser sees `None`.
    pub(crate) fn take(&self, serial: u32) -> Option<Arc<Waiter>> {
        self.waiters.lock().unwrap().remove(&serial)
    }

    /// Drains every remaining waiter and signals each with `Outcome::Stopped`. Used once, on the
    /// reactor's shutdown path, so no caller is left blocked forever on a connection that will
    /// never produce another reply.
    pub(crate) fn drain_with_stopped(&self) {
        let drained: Vec<Arc<Waiter>> = self.waiters.lock().unwrap().drain().map(|(_, w)| w).collect();
        for waiter in drained {
            waiter.signal(Outcome::Stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn signal_then_wait_returns_reply() {
        let waiter = Waiter::new(1);
        waiter.signal(Outcome::Reply(serde_json::json!({"s": 1})));
        match waiter.wait() {
            Outcome::Reply(v) => assert_eq!(v["s"], 1),
            Outcome::Stopped => panic!("expected reply"),
        }
    }

    #[test]
    fn wait_blocks_until_signalled_from_another_thread() {
        let waiter = Waiter::new(2);
        let barrier = Arc::new(Barrier::new(2));

        let waiter2 = waiter.clone();
        let barrier2 = barrier.clone();
        let handle = thread::spawn(move || {
            barrier2.wait();
            thread::sleep(Duration::from_millis(20));
            waiter2.signal(Outcome::Reply(serde_json::json!(null)));
        });

        barrier.wait();
        let outcome = waiter.wait();
        assert!(matches!(outcome, Outcome::Reply(_)));
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_returns_none_when_nothing_arrives() {
        let waiter = Waiter::new(3);
        assert!(waiter.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn registry_take_is_idempotent_under_race() {
        let registry = Registry::new();
        let waiter = Waiter::new(4);
        registry.insert(waiter.clone());

        assert!(registry.take(4).is_some());
        assert!(registry.take(4).is_none());
    }

    #[test]
    fn drain_with_stopped_signals_every_remaining_waiter() {
        let registry = Registry::new();
        let a = Waiter::new(10);
        let b = Waiter::new(11);
        registry.insert(a.clone());
        registry.insert(b.clone());

        registry.drain_with_stopped();

        assert!(matches!(a.wait(), Outcome::Stopped));
        assert!(matches!(b.wait(), Outcome::Stopped));
        assert!(registry.take(10).is_none());
    }
}
