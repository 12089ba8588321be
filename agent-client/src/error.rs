//! The top-level error type for the crate, aggregating the module-specific errors raised while
//! spawning the agent, running the reactor, and serving requests.

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to create pipe: {}", source))]
    CreatePipe { source: nix::Error },

    #[snafu(display("Failed to fork agent process: {}", source))]
    Fork { source: nix::Error },

    #[snafu(display("Failed to set non-blocking mode on pipe: {}", source))]
    SetNonBlocking { source: nix::Error },

    #[snafu(display("Failed to create eventfd: {}", source))]
    CreateEventFd { source: nix::Error },

    #[snafu(display("Failed to create epoll instance: {}", source))]
    CreateEpoll { source: nix::Error },

    #[snafu(display("epoll_ctl failed: {}", source))]
    EpollCtl { source: nix::Error },

    #[snafu(display("Failed to spawn worker thread: {}", source))]
    SpawnWorker { source: std::io::Error },

    #[snafu(display("Failed to serialize request envelope: {}", source))]
    Serialize { source: serde_json::Error },

    #[snafu(display("Client is not in state '{}', required for this call", expected))]
    WrongState { expected: &'static str },

    #[snafu(display("Client is closed"))]
    Stopped,

    #[snafu(display("Request timed out waiting for a reply"))]
    Timeout,
}

pub type Result<T> = std::result::Result<T, Error>;
