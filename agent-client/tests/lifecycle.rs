//! Exercises the full connect -> request -> close lifecycle against a stand-in for `ssh`: a
//! small shell script, placed ahead of the real `ssh` on `PATH`, that skips the network
//! entirely and just runs a fake agent that echoes replies keyed by serial. This drives the real
//! fork/pipe/epoll/framing stack in `agent-client` without requiring an actual SSH server.

use agent_client::{AgentClient, Mode};
use pretty_assertions::assert_eq;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

// `PATH` is process-global, so tests that install a fake `ssh` on it must not run concurrently
// with each other.
static PATH_GUARD: Mutex<()> = Mutex::new(());

/// A fake agent that answers every request with `{"s": <serial>, "ok": true}`, regardless of
/// which verb was sent, matching just enough of the wire protocol to validate correlation.
const ECHO_AGENT: &str = r#"#!/bin/sh
while IFS= read -r line; do
    [ -z "$line" ] && continue
    serial=$(printf '%s' "$line" | sed -n 's/.*"s":\([0-9]*\).*/\1/p')
    printf '{"s":%s,"ok":true}\n\n' "$serial"
done
"#;

fn install_fake_ssh(dir: &Path, agent_script: &str) {
    let path = dir.join("ssh");
    let mut f = fs::File::create(&path).unwrap();
    // Ignore every argument ssh would normally care about (flags, endpoint, remote command) and
    // just run the fake agent directly; the remote-command string itself is covered separately
    // by a unit test on `remote_command`.
    writeln!(f, "#!/bin/sh").unwrap();
    writeln!(f, "{}", agent_script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
}

/// Runs `body` with a directory containing a fake `ssh` prepended to `PATH`, restoring `PATH`
/// afterward even if `body` panics.
fn with_fake_ssh(agent_script: &str, body: impl FnOnce()) {
    let _guard = PATH_GUARD.lock().unwrap_or_else(|e| e.into_inner());

    let dir = std::env::temp_dir().join(format!("agent-client-test-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    install_fake_ssh(&dir, agent_script);

    let old_path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{}", dir.display(), old_path));

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));

    std::env::set_var("PATH", old_path);
    let _ = fs::remove_dir_all(&dir);

    if let Err(e) = result {
        std::panic::resume_unwind(e);
    }
}

fn connected_client() -> AgentClient {
    let client = AgentClient::new();
    client.init(Some("test-id"), Some("test-name"), Mode::Run).unwrap();
    client.connect("fake-endpoint").unwrap();
    client
}

#[test]
fn connect_poll_close_round_trip() {
    with_fake_ssh(ECHO_AGENT, || {
        let client = connected_client();

        let reply = client.poll_queue().unwrap();
        assert_eq!(reply["ok"], true);

        client.close();
        assert!(client.is_closed());
    });
}

#[test]
fn concurrent_requests_are_correlated_by_serial() {
    with_fake_ssh(ECHO_AGENT, || {
        let client = std::sync::Arc::new(connected_client());

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let client = client.clone();
                thread::spawn(move || client.ping().unwrap())
            })
            .collect();

        for h in handles {
            let reply = h.join().unwrap();
            assert_eq!(reply["ok"], true);
        }

        client.close();
    });
}

#[test]
fn close_is_idempotent_and_blocks_future_requests() {
    with_fake_ssh(ECHO_AGENT, || {
        let client = connected_client();
        client.close();
        client.close(); // must not block or panic the second time

        assert!(client.is_closed());
        assert!(client.poll_queue().is_err());
    });
}

#[test]
fn dead_agent_surfaces_as_stopped_rather_than_hanging() {
    // The fake agent exits immediately instead of serving requests; the reactor's read side
    // sees EOF, tears the connection down, and any caller already waiting is woken with a
    // "stopped" outcome instead of blocking forever.
    const EXIT_IMMEDIATELY: &str = "#!/bin/sh\nexit 0\n";

    with_fake_ssh(EXIT_IMMEDIATELY, || {
        let client = connected_client();
        let result = client.request_with_deadline("poll", serde_json::json!({}), Duration::from_secs(5));
        assert!(result.is_err());

        // The worker already exited on its own; close() just reconciles client-visible state.
        client.close();
        assert!(client.is_closed());
    });
}
