//! The public client handle: a lifecycle state machine wrapping a connection to the remote
//! agent, plus the request/reply API built on top of it.

use log::debug;
use nix::unistd::close;
use serde_json::{json, Map, Value};
use snafu::ResultExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{self, Result};
use crate::mode::Mode;
use crate::process::{self, kill_and_reap};
use crate::queue::OutboundQueue;
use crate::reactor::{self, SharedStop};
use crate::waiter::{Outcome, Registry, Waiter};
use crate::wake::WakeHandle;

enum State {
    New,
    Initialised {
        id: Option<String>,
        name: Option<String>,
        mode: Mode,
    },
    Connected(Connection),
    Stopped,
}

struct Connection {
    wake: Arc<WakeHandle>,
    outbound: Arc<OutboundQueue>,
    registry: Arc<Registry>,
    stop: Arc<SharedStop>,
    worker: Option<JoinHandle<()>>,
}

struct ConnHandles {
    wake: Arc<WakeHandle>,
    outbound: Arc<OutboundQueue>,
    registry: Arc<Registry>,
}

/// A long-lived handle to one remote agent session. Cheap to share: `request`, `poll_queue`, and
/// `ping` may be called concurrently from any number of threads once `connect` has succeeded.
/// Exactly one worker thread performs all I/O; callers only ever touch the outbound queue and the
/// request registry.
pub struct AgentClient {
    state: Mutex<State>,
    next_serial: AtomicU32,
}

impl AgentClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::New),
            next_serial: AtomicU32::new(1),
        }
    }

    /// Records the identity used to build the remote agent's command line. Must be called
    /// exactly once, before `connect`.
    pub fn init(&self, id: Option<&str>, name: Option<&str>, mode: Mode) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            State::New => {
                *state = State::Initialised {
                    id: id.map(String::from),
                    name: name.map(String::from),
                    mode,
                };
                Ok(())
            }
            _ => error::WrongStateSnafu { expected: "New" }.fail(),
        }
    }

    /// Spawns the remote agent over `ssh endpoint` and starts the reactor. On any failure the
    /// client falls back to `Initialised` so a caller may retry `connect` with a different
    /// endpoint.
    pub fn connect(&self, endpoint: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let (id, name, mode) = match &*state {
            State::Initialised { id, name, mode } => (id.clone(), name.clone(), *mode),
            _ => return error::WrongStateSnafu { expected: "Initialised" }.fail(),
        };

        let spawned = process::spawn(
            endpoint,
            id.as_deref(),
            name.as_deref(),
            mode,
            constants::AGENT_BIN_PATH,
            constants::AGENT_LOG_PATH,
        )?;

        let wake = match WakeHandle::new() {
            Ok(w) => Arc::new(w),
            Err(e) => {
                kill_and_reap(spawned.pid);
                let _ = close(spawned.read_fd);
                let _ = close(spawned.write_fd);
                return Err(e);
            }
        };
        let outbound = Arc::new(OutboundQueue::new());
        let registry = Arc::new(Registry::new());
        let stop = SharedStop::new();

        match reactor::spawn_worker(
            spawned.pid,
            spawned.read_fd,
            spawned.write_fd,
            wake.clone(),
            outbound.clone(),
            registry.clone(),
            stop.clone(),
        ) {
            Ok(worker) => {
                *state = State::Connected(Connection {
                    wake,
                    outbound,
                    registry,
                    stop,
                    worker: Some(worker),
                });
                Ok(())
            }
            Err(e) => {
                kill_and_reap(spawned.pid);
                let _ = close(spawned.read_fd);
                let _ = close(spawned.write_fd);
                *state = State::Initialised { id, name, mode };
                Err(e)
            }
        }
    }

    fn connected_handles(&self) -> Result<ConnHandles> {
        let state = self.state.lock().unwrap();
        match &*state {
            State::Connected(conn) => Ok(ConnHandles {
                wake: conn.wake.clone(),
                outbound: conn.outbound.clone(),
                registry: conn.registry.clone(),
            }),
            _ => error::WrongStateSnafu { expected: "Connected" }.fail(),
        }
    }

    /// Sends `verb` with `payload` merged into the request envelope and blocks until a reply
    /// arrives. `payload` must serialize to a JSON object (or `Value::Null`, treated as empty).
    pub fn request(&self, verb: &str, payload: Value) -> Result<Value> {
        self.request_inner(verb, payload, None)
    }

    /// Like `request`, but gives up after `timeout` and races the reactor for ownership of the
    /// waiter: whichever side reaches the registry first wins, the other is a no-op.
    pub fn request_with_deadline(&self, verb: &str, payload: Value, timeout: Duration) -> Result<Value> {
        self.request_inner(verb, payload, Some(timeout))
    }

    /// The canonical request from the original protocol: asks the agent what's next in its work
    /// queue.
    pub fn poll_queue(&self) -> Result<Value> {
        self.request("poll", json!({}))
    }

    /// A liveness check sent the same way as any other request.
    pub fn ping(&self) -> Result<Value> {
        self.request("ping", json!({}))
    }

    fn request_inner(&self, verb: &str, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        let conn = self.connected_handles()?;
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        let mut envelope = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        // True milliseconds since the epoch; the original source computed this as
        // `sec * 1000 + usec / 1000`, which truncates toward zero and is off by up to a
        // millisecond. `Duration::as_millis` doesn't have that problem.
        let t = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        envelope.insert("t".to_string(), json!(t));
        envelope.insert("s".to_string(), json!(serial));
        envelope.insert("q".to_string(), json!(verb));

        let mut bytes = serde_json::to_vec(&Value::Object(envelope)).context(error::SerializeSnafu)?;
        bytes.extend_from_slice(b"\n\n");

        let waiter = Waiter::new(serial);
        conn.registry.insert(waiter.clone());
        conn.outbound.push(bytes, &conn.wake);

        let outcome = match timeout {
            None => waiter.wait(),
            Some(d) => match waiter.wait_timeout(d) {
                Some(outcome) => outcome,
                None => match conn.registry.take(serial) {
                    // We beat the reactor to it: no reply is coming.
                    Some(_) => return error::TimeoutSnafu.fail(),
                    // The reactor already took it; a reply is in flight or already delivered.
                    None => waiter.wait(),
                },
            },
        };

        match outcome {
            Outcome::Reply(value) => Ok(value),
            Outcome::Stopped => error::StoppedSnafu.fail(),
        }
    }

    /// Requests shutdown and blocks until the worker has exited. Idempotent; safe to call from
    /// any thread, any number of times.
    pub fn close(&self) {
        let (stop, wake) = {
            let mut state = self.state.lock().unwrap();
            match &*state {
                State::Connected(conn) => (conn.stop.clone(), conn.wake.clone()),
                State::Stopped => return,
                _ => {
                    *state = State::Stopped;
                    return;
                }
            }
        };

        stop.request_stop(&wake);
        stop.wait_until_stopped();

        let mut state = self.state.lock().unwrap();
        if let State::Connected(mut conn) = std::mem::replace(&mut *state, State::Stopped) {
            if let Some(worker) = conn.worker.take() {
                if worker.join().is_err() {
                    debug!("worker thread panicked during shutdown");
                }
            }
        }
    }

    /// Reports shutdown without blocking. Reflects the worker's own exit, not just a prior call
    /// to `close()` - if the agent dies on its own, this becomes true once the worker has torn
    /// down, with no need for the caller to have requested the stop itself.
    pub fn is_closed(&self) -> bool {
        match &*self.state.lock().unwrap() {
            State::Stopped => true,
            State::Connected(conn) => conn.stop.is_stopped(),
            _ => false,
        }
    }
}

impl Default for AgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        self.close();
    }
}
