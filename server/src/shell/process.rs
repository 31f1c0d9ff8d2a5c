//! Low-level process spawning, signalling, and output capture.
//!
//! Port-forward processes go through [`piped_command`]: every child gets its
//! own process group so signals can be delivered to the whole tree via
//! [`signal_group`], and `kill_on_drop(true)` so orphaned processes are cleaned
//! up if the owning task is cancelled. Relay backends run on a PTY instead
//! (see [`super::pty`]) and are signalled the same way.

use std::collections::HashMap;
use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::warn;

use crate::config::KubeConfig;

/// Shell run inside the container: bash when present, else POSIX sh.
const REMOTE_SHELL: &str = "command -v bash >/dev/null 2>&1 && exec bash -i || exec sh -i";

/// A program invocation. Environment entries are merged into (not replacing)
/// the inherited environment.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Build a [`Command`] for `spec` with piped stdout/stderr and no stdin, in a
/// new process group.
pub fn piped_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    cmd
}

/// `kubectl exec` into a container with a remote TTY.
///
/// Must run on a local PTY: kubectl only allocates the remote terminal when
/// its own stdin is one, and it relays local `SIGWINCH` as remote resizes.
pub fn kubectl_exec(
    kube: &KubeConfig,
    context: &str,
    namespace: &str,
    pod: &str,
    container: &str,
) -> CommandSpec {
    CommandSpec {
        program: kube.kubectl.clone(),
        args: [
            "--context",
            context,
            "--namespace",
            namespace,
            "exec",
            "-i",
            "-t",
            pod,
            "-c",
            container,
            "--",
            "sh",
            "-c",
            REMOTE_SHELL,
        ]
        .iter()
        .map(ToString::to_string)
        .collect(),
        env: kube.child_env(),
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// A group that no longer exists is not an error: the process may have exited
/// between the caller's check and the signal.
pub fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else { return };
    if raw <= 0 {
        return;
    }
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("killpg({raw}, {signal}) failed: {e}"),
    }
}

/// Read to EOF, keeping the first `max_bytes` (trimmed, lossy UTF-8).
///
/// Keeps draining past the cap instead of closing the pipe early, so the child
/// never blocks or takes SIGPIPE on a full pipe.
pub async fn read_capped(reader: &mut (impl AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(8192));
    let mut tmp = [0u8; 4096];
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}
