/*!
  This crate contains constants shared across the agent-client crates.
*/

// The remote shell binary used to launch the agent; looked up on PATH.
pub const SSH_BIN: &str = "ssh";

// Flags passed to the remote shell so it allocates no TTY and does strict host checking the way
// a background service expects: -a disables agent forwarding, -T disables pty allocation, -x
// disables X11 forwarding.
pub const SSH_FLAGS: &str = "-aTx";

// Default path to the remote agent binary, invoked through the remote shell.
pub const AGENT_BIN_PATH: &str = "/usr/libexec/agent-client/ej-agent";

// Default path (on the remote host) that the agent's stderr is appended to.
pub const AGENT_LOG_PATH: &str = "/var/log/agent-client/ej-agent.log";

// Size of the fixed stack buffer used to drain each readable pipe in one reactor pass.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;
