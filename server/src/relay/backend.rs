//! Relay backends.
//!
//! A backend is a child process on its own PTY, exposed as byte channels:
//!
//! - **Local shell** — the user's login shell, optionally pre-seeded with
//!   `kubectl config use-context <ctx>`.
//! - **Exec** — any [`CommandSpec`], used for `kubectl exec -it`. kubectl sees
//!   a terminal, so it requests a remote TTY and turns local `SIGWINCH` into
//!   remote resizes.
//!
//! Output is the single merged PTY stream (stdout and stderr alike); resize
//! applies `TIOCSWINSZ` to the master. I/O is handled by background tasks: one
//! input writer, one output reader, and an exit watcher. The relay only sees
//! [`BackendIo`].

use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{expand_tilde, KubeConfig, ShellConfig};
use crate::error::RelayError;
use crate::shell::process::{signal_group, CommandSpec};
use crate::shell::{context_switch_line, pty};

/// Max bytes per output chunk handed to the relay.
const OUTPUT_CHUNK: usize = 4096;
const QUEUE_DEPTH: usize = 64;
/// Time between SIGHUP and SIGKILL on terminate.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How a backend process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl BackendExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("Process exited with code {code}"),
            (None, Some(signal)) => format!("Process killed by signal {signal}"),
            (None, None) => "Process ended without an exit status".to_string(),
        }
    }
}

/// Out-of-band operations on a running backend.
pub trait BackendControl: Send + Sync {
    fn resize(&self, cols: u16, rows: u16) -> Result<(), RelayError>;
    /// Ask the backend to end. Safe to call any number of times.
    fn terminate(&self);
}

/// Channels connecting a relay to its backend.
///
/// `output` closes once every backend output stream has reached EOF; `exit`
/// resolves when the process has been reaped.
pub struct BackendIo {
    pub input: mpsc::Sender<Vec<u8>>,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub exit: oneshot::Receiver<BackendExit>,
    pub control: Arc<dyn BackendControl>,
}

/// Control handle for a backend's PTY and process group.
struct ProcessControl {
    pgid: u32,
    /// Kept open for resizes.
    pty_master: OwnedFd,
    exited: Arc<AtomicBool>,
    terminated: AtomicBool,
}

impl BackendControl for ProcessControl {
    fn resize(&self, cols: u16, rows: u16) -> Result<(), RelayError> {
        pty::resize_pty(&self.pty_master, rows, cols).map_err(RelayError::Pty)
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        signal_group(self.pgid, Signal::SIGHUP);
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        let pgid = self.pgid;
        let exited = Arc::clone(&self.exited);
        tokio::spawn(async move {
            tokio::time::sleep(TERMINATE_GRACE).await;
            if !exited.load(Ordering::SeqCst) {
                warn!("Relay backend {pgid} still running, sending SIGKILL");
                signal_group(pgid, Signal::SIGKILL);
            }
        });
    }
}

/// Start the local shell on a fresh PTY.
///
/// When `seed_context` is set the first input line switches kubectl to
/// `context`.
pub fn spawn_local_shell(
    shell: &ShellConfig,
    kube: &KubeConfig,
    context: &str,
) -> Result<BackendIo, RelayError> {
    let spec = CommandSpec {
        program: shell.default_shell.clone(),
        // Login shell so rc files are sourced, as a terminal emulator would.
        args: vec!["-l".to_string()],
        env: kube.child_env(),
    };
    let seed = shell
        .seed_context
        .then(|| context_switch_line(&kube.kubectl, context).into_bytes());
    spawn_on_terminal(&spec, shell, seed)
}

/// Start `spec` on a fresh PTY sized from `shell`.
pub fn spawn_exec(spec: &CommandSpec, shell: &ShellConfig) -> Result<BackendIo, RelayError> {
    spawn_on_terminal(spec, shell, None)
}

fn spawn_on_terminal(
    spec: &CommandSpec,
    shell: &ShellConfig,
    seed: Option<Vec<u8>>,
) -> Result<BackendIo, RelayError> {
    let pty = pty::allocate_pty(shell.rows, shell.cols)?;
    let working_dir = expand_tilde(&shell.working_dir);
    let child = pty::spawn_on_pty(&pty, spec, &working_dir).map_err(|source| {
        RelayError::Spawn {
            program: spec.program.clone(),
            source,
        }
    })?;
    let pty::PtyPair { master, slave } = pty;
    drop(slave);

    let reader = tokio::fs::File::from_std(std::fs::File::from(master.try_clone()?));
    let writer = tokio::fs::File::from_std(std::fs::File::from(master.try_clone()?));

    let (input, input_rx) = mpsc::channel(QUEUE_DEPTH);
    if let Some(seed) = seed {
        // Freshly created channel: there is room for one message.
        let _ = input.try_send(seed);
    }
    let (output_tx, output) = mpsc::channel(QUEUE_DEPTH);
    tokio::spawn(write_input(writer, input_rx));
    tokio::spawn(read_output(reader, output_tx));

    // setsid() makes the child its own process group leader.
    let pgid = child.id().unwrap_or(0);
    let exited = Arc::new(AtomicBool::new(false));
    let exit = watch_exit(child, Arc::clone(&exited));
    debug!("Relay backend {} started on PTY (pid {pgid})", spec.program);

    Ok(BackendIo {
        input,
        output,
        exit,
        control: Arc::new(ProcessControl {
            pgid,
            pty_master: master,
            exited,
            terminated: AtomicBool::new(false),
        }),
    })
}

async fn write_input(mut writer: impl AsyncWrite + Unpin, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if writer.write_all(&data).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}

/// Forward chunks until EOF. A PTY master reports the end of the session as
/// `EIO`, which ends the loop like EOF.
async fn read_output(mut reader: impl AsyncRead + Unpin, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; OUTPUT_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn watch_exit(mut child: Child, exited: Arc<AtomicBool>) -> oneshot::Receiver<BackendExit> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => BackendExit {
                code: status.code(),
                signal: status.signal(),
            },
            Err(e) => {
                warn!("Relay backend wait error: {e}");
                BackendExit {
                    code: None,
                    signal: None,
                }
            }
        };
        exited.store(true, Ordering::SeqCst);
        let _ = tx.send(exit);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    async fn read_until(io: &mut BackendIo, needle: &str) -> String {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !String::from_utf8_lossy(&seen).contains(needle) {
            let chunk = tokio::time::timeout_at(deadline, io.output.recv())
                .await
                .expect("timed out waiting for output")
                .expect("output closed early");
            seen.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    fn sh_config() -> ShellConfig {
        ShellConfig {
            default_shell: "/bin/sh".to_string(),
            working_dir: "/".to_string(),
            seed_context: false,
            rows: 24,
            cols: 80,
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_exec_runs_on_a_terminal() {
        let mut io = spawn_exec(&sh("tty; stty size; echo err-out >&2; exit 4"), &sh_config())
            .unwrap();
        let out = read_until(&mut io, "err-out").await;
        assert!(out.contains("/dev/"), "{out}");
        assert!(!out.contains("not a tty"), "{out}");
        assert!(out.contains("24 80"), "{out}");
        let exit = io.exit.await.unwrap();
        assert_eq!(exit.code, Some(4));
        assert_eq!(exit.describe(), "Process exited with code 4");
    }

    #[tokio::test]
    async fn test_exec_resize_reaches_the_terminal() {
        let mut io = spawn_exec(&sh("read line; stty size; echo got-$line"), &sh_config())
            .unwrap();
        io.control.resize(120, 33).unwrap();
        io.input.send(b"go\n".to_vec()).await.unwrap();
        let out = read_until(&mut io, "got-go").await;
        assert!(out.contains("33 120"), "{out}");
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let io = spawn_exec(&sh("sleep 30"), &sh_config()).unwrap();
        io.control.terminate();
        io.control.terminate();
        let exit = io.exit.await.unwrap();
        assert_eq!(exit.signal, Some(libc::SIGHUP));
        io.control.terminate();
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let spec = CommandSpec {
            program: "/nonexistent/kubectl".to_string(),
            ..CommandSpec::default()
        };
        assert!(matches!(
            spawn_exec(&spec, &sh_config()),
            Err(RelayError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_shell_runs_on_pty() {
        let mut io = spawn_local_shell(&sh_config(), &KubeConfig::default(), "prod").unwrap();
        io.input.send(b"stty size; echo done-$((40+2))\n".to_vec()).await.unwrap();
        let out = read_until(&mut io, "done-42").await;
        assert!(out.contains("24 80"), "{out}");

        io.control.resize(132, 50).unwrap();
        io.input.send(b"stty size; echo again-$((1+1))\n".to_vec()).await.unwrap();
        let out = read_until(&mut io, "again-2").await;
        assert!(out.contains("50 132"), "{out}");

        io.input.send(b"exit 3\n".to_vec()).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(10), io.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, Some(3));
    }

    #[tokio::test]
    async fn test_local_shell_seeds_context() {
        let shell = ShellConfig {
            seed_context: true,
            ..sh_config()
        };
        let kube = KubeConfig {
            kubectl: "echo".to_string(),
            kubeconfig: None,
        };
        let mut io = spawn_local_shell(&shell, &kube, "staging").unwrap();
        let out = read_until(&mut io, "use-context staging").await;
        assert!(out.contains("config use-context staging"));
        io.control.terminate();
    }
}
