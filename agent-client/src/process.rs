//! Subprocess supervisor: spawns the remote agent through a remote-shell wrapper, wires its
//! stdin/stdout to a pair of pipes, and owns its PID for the rest of the client's lifetime.

use log::{debug, warn};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, pipe2, ForkResult, Pid};
use snafu::ResultExt;
use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::error::{self, Result};
use crate::mode::Mode;

/// The two pipe endpoints and PID left in the parent after a successful spawn.
pub(crate) struct SpawnedChild {
    pub(crate) pid: Pid,
    /// Read from this to get bytes the agent wrote to its stdout.
    pub(crate) read_fd: RawFd,
    /// Write to this to send bytes to the agent's stdin.
    pub(crate) write_fd: RawFd,
}

/// Builds the single argument string passed to `ssh`, invoking the remote agent binary with
/// flags derived from `id`, `name`, and `mode`.
fn remote_command(id: Option<&str>, name: Option<&str>, mode: Mode, agent_bin: &str, log_path: &str) -> String {
    let mut cmd = format!("exec {}", agent_bin);
    if let Some(id) = id {
        if !id.is_empty() {
            cmd.push_str(&format!(" -i '{}'", id));
        }
    }
    if let Some(name) = name {
        cmd.push_str(&format!(" -n '{}'", name));
    }
    cmd.push_str(&format!(" -m {}", mode.as_flag()));
    cmd.push_str(&format!(" 2>>{}", log_path));
    cmd
}

/// Spawns the agent over a remote shell session, wiring the child's stdin/stdout to the two
/// pipes given back in [`SpawnedChild`]. On any failure after `fork()`, both pipes are closed
/// before returning.
pub(crate) fn spawn(
    endpoint: &str,
    id: Option<&str>,
    name: Option<&str>,
    mode: Mode,
    agent_bin: &str,
    log_path: &str,
) -> Result<SpawnedChild> {
    let (to_agent_read, to_agent_write) =
        pipe2(OFlag::O_CLOEXEC).context(error::CreatePipeSnafu)?;
    let (from_agent_read, from_agent_write) =
        pipe2(OFlag::O_CLOEXEC).context(error::CreatePipeSnafu)?;

    // Built before fork() since none of it depends on the child: argv assembly needs a heap
    // allocator, which is not safe to rely on between fork() and exec() in a process that may
    // have other threads running.
    let command = remote_command(id, name, mode, agent_bin, log_path);
    let ssh = CString::new(constants::SSH_BIN).unwrap();
    let args = [
        ssh.clone(),
        CString::new(constants::SSH_FLAGS).unwrap(),
        CString::new(endpoint).unwrap(),
        CString::new(command).unwrap(),
    ];

    // SAFETY: the only work done in the child before exec is closing fds and dup2'ing pipe
    // ends onto 0/1, which are async-signal-safe.
    let fork_result = unsafe { fork() }.context(error::ForkSnafu)?;

    match fork_result {
        ForkResult::Child => {
            // Child: stdin <- to_agent_read, stdout -> from_agent_write.
            let _ = dup2(to_agent_read, 0);
            let _ = close(to_agent_read);
            let _ = close(to_agent_write);
            let _ = dup2(from_agent_write, 1);
            let _ = close(from_agent_read);
            let _ = close(from_agent_write);

            // execvp only returns on failure; there is no useful way to report the error back to
            // the parent from here, so we exit immediately.
            let _ = execvp(&ssh, &args);
            std::process::exit(1);
        }
        ForkResult::Parent { child } => {
            // Parent keeps from_agent_read and to_agent_write; the other two ends belong to the
            // child now.
            let _ = close(to_agent_read);
            let _ = close(from_agent_write);

            if let Err(e) = set_nonblocking(from_agent_read).and_then(|_| set_nonblocking(to_agent_write)) {
                let _ = close(from_agent_read);
                let _ = close(to_agent_write);
                kill_and_reap(child);
                return Err(e);
            }

            debug!("spawned agent pid {} for endpoint {}", child, endpoint);
            Ok(SpawnedChild {
                pid: child,
                read_fd: from_agent_read,
                write_fd: to_agent_write,
            })
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).context(error::SetNonBlockingSnafu)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).context(error::SetNonBlockingSnafu)?;
    Ok(())
}

/// Sends `SIGKILL` to the child and reaps it. If the child has already exited and been reaped
/// (or never existed), that's not an error - it's the expected outcome of a race with the
/// child's own natural exit.
pub(crate) fn kill_and_reap(pid: Pid) {
    match kill(pid, Signal::SIGKILL) {
        Ok(()) => {}
        Err(nix::Error::ESRCH) => {
            // Already gone; nothing to reap either.
            return;
        }
        Err(e) => warn!("failed to signal agent pid {}: {}", pid, e),
    }

    match waitpid(pid, None) {
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {}
        Ok(other) => debug!("unexpected wait status for agent pid {}: {:?}", pid, other),
        Err(nix::Error::ECHILD) => {
            // Someone else already reaped it.
        }
        Err(e) => warn!("failed to reap agent pid {}: {}", pid, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_command_includes_id_name_and_mode() {
        let cmd = remote_command(
            Some("42"),
            Some("alice"),
            Mode::Compile,
            "/usr/libexec/agent-client/ej-agent",
            "/var/log/agent-client/ej-agent.log",
        );
        assert_eq!(
            cmd,
            "exec /usr/libexec/agent-client/ej-agent -i '42' -n 'alice' -m compile 2>>/var/log/agent-client/ej-agent.log"
        );
    }

    #[test]
    fn remote_command_omits_blank_id() {
        let cmd = remote_command(Some(""), None, Mode::Run, "/bin/agent", "/tmp/agent.log");
        assert_eq!(cmd, "exec /bin/agent -m run 2>>/tmp/agent.log");
    }

    #[test]
    fn remote_command_omits_absent_id_and_name() {
        let cmd = remote_command(None, None, Mode::Run, "/bin/agent", "/tmp/agent.log");
        assert_eq!(cmd, "exec /bin/agent -m run 2>>/tmp/agent.log");
    }
}
