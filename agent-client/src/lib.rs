//! A long-lived client for an agent process run over an SSH-launched remote shell.
//!
//! The agent's stdin and stdout are wired to a pair of pipes; requests and replies are
//! newline-terminated JSON objects correlated by a monotonic serial number, so many requests may
//! be outstanding at once and may complete out of order. A single worker thread multiplexes all
//! I/O with `epoll`; callers only ever touch a request queue and a condition variable.

mod buffer;
mod client;
mod error;
mod mode;
mod process;
mod queue;
mod reactor;
mod waiter;
mod wake;

pub use client::AgentClient;
pub use error::{Error, Result};
pub use mode::Mode;
