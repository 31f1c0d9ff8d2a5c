//! Spawning, monitoring, and terminating forwarder subprocesses.
//!
//! [`ProcessSupervisor`] owns the only map of live processes. Callers reach it
//! exclusively through `reserve`/`spawn`/`terminate`; each process's exit
//! watcher removes its own entry as soon as the process is reaped, before its
//! pipes are drained and [`ProcessEvent::Exited`] is reported, so "in the map"
//! and "alive" mean the same thing.
//!
//! ## Process groups
//!
//! Each forwarder is started as its own process group leader. Termination
//! signals go to `-pgid` so helper processes spawned by the forwarder die with
//! it, and a Ctrl-C on the host terminal does not reach the forwarders before
//! the orderly shutdown path does.

use std::collections::{HashMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub use crate::shell::process::CommandSpec;
use crate::shell::process::{piped_command, read_capped, signal_group};

/// Max stderr kept per process for diagnostics.
const MAX_STDERR: usize = 64 * 1024;

/// How long the exit watcher waits for the output pipes to drain after the
/// process itself has exited. Grandchildren can hold them open indefinitely.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle events reported for one supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A stdout line contained the success marker. Sent at most once.
    Ready,
    /// The process is gone and no longer in the live map.
    Exited {
        /// `None` when killed by a signal.
        code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
        /// The exit followed a `terminate` call.
        requested: bool,
    },
}

/// A freshly spawned process: its pid and its event stream.
pub struct SpawnedProcess {
    pub pid: u32,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

enum Slot {
    /// Id claimed, process not started yet.
    Reserved { cancelled: bool },
    Running {
        pid: u32,
        terminating: Arc<AtomicBool>,
    },
}

/// Supervises one OS process per session id.
///
/// Cloneable; all clones share the same live map.
#[derive(Clone, Default)]
pub struct ProcessSupervisor {
    live: Arc<Mutex<HashMap<String, Slot>>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` before spawning. A reserved id counts as alive. An id that
    /// is already reserved or running is left as it is.
    pub async fn reserve(&self, id: &str) {
        self.live
            .lock()
            .await
            .entry(id.to_string())
            .or_insert(Slot::Reserved { cancelled: false });
    }

    /// Drop a reservation that will never be spawned.
    pub async fn release(&self, id: &str) {
        let mut live = self.live.lock().await;
        if matches!(live.get(id), Some(Slot::Reserved { .. })) {
            live.remove(id);
        }
    }

    /// Spawn `spec` for session `id`, scanning stdout for `marker`.
    ///
    /// The id must have been reserved (or be unused). If `terminate` was called
    /// on the reservation in the meantime, nothing is spawned and an
    /// `Interrupted` error is returned.
    pub async fn spawn(
        &self,
        id: &str,
        spec: &CommandSpec,
        marker: &str,
    ) -> std::io::Result<SpawnedProcess> {
        let mut live = self.live.lock().await;
        match live.get(id) {
            Some(Slot::Running { .. }) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("a process is already running for session {id}"),
                ));
            }
            Some(Slot::Reserved { cancelled: true }) => {
                live.remove(id);
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "stopped before the process was started",
                ));
            }
            Some(Slot::Reserved { cancelled: false }) | None => {}
        }

        let mut child = match piped_command(spec).spawn() {
            Ok(child) => child,
            Err(e) => {
                live.remove(id);
                return Err(e);
            }
        };
        let pid = child.id().unwrap_or(0);
        let terminating = Arc::new(AtomicBool::new(false));
        live.insert(
            id.to_string(),
            Slot::Running {
                pid,
                terminating: Arc::clone(&terminating),
            },
        );
        drop(live);

        let (tx, events) = mpsc::unbounded_channel();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let sid_out = id.to_string();
        let marker = marker.to_string();
        let tx_out = tx.clone();
        let stdout_task = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            let mut ready = false;
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("Forward {sid_out} stdout: {line}");
                if !ready && is_success_line(&line, &marker) {
                    ready = true;
                    let _ = tx_out.send(ProcessEvent::Ready);
                }
            }
        });

        let stderr_task = tokio::spawn(async move {
            match stderr {
                Some(mut stderr) => read_capped(&mut stderr, MAX_STDERR).await,
                None => String::new(),
            }
        });

        let sid_exit = id.to_string();
        let live_map = Arc::clone(&self.live);
        tokio::spawn(async move {
            let (code, signal) = match child.wait().await {
                Ok(status) => (status.code(), status.signal()),
                Err(e) => {
                    warn!("Forward {sid_exit} wait error: {e}");
                    (None, None)
                }
            };
            // Reaped: the pid may be reused from here on.
            live_map.lock().await.remove(&sid_exit);
            let _ = tokio::time::timeout(PIPE_DRAIN_TIMEOUT, stdout_task).await;
            let stderr = match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, stderr_task).await {
                Ok(Ok(s)) => s,
                _ => String::new(),
            };
            let requested = terminating.load(Ordering::SeqCst);
            info!(
                "Forward {sid_exit} process {pid} exited (code {code:?}, signal {signal:?}, requested={requested})"
            );
            let _ = tx.send(ProcessEvent::Exited {
                code,
                signal,
                stderr,
                requested,
            });
        });

        info!(
            "Forward {id} spawned {} (pid {pid})",
            spec.program
        );
        Ok(SpawnedProcess { pid, events })
    }

    /// Whether `id` has a reserved or running process.
    pub async fn is_alive(&self, id: &str) -> bool {
        self.live.lock().await.contains_key(id)
    }

    /// Ids of every reserved or running process.
    pub async fn live_ids(&self) -> HashSet<String> {
        self.live.lock().await.keys().cloned().collect()
    }

    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    /// Ask the process for `id` to exit (SIGTERM to its group).
    ///
    /// Returns `false` if nothing is known for `id`. A process that is already
    /// exiting, or a reservation not yet spawned, is handled without error.
    pub async fn terminate(&self, id: &str) -> bool {
        let mut live = self.live.lock().await;
        match live.get_mut(id) {
            Some(Slot::Reserved { cancelled }) => {
                *cancelled = true;
                true
            }
            Some(Slot::Running { pid, terminating }) => {
                terminating.store(true, Ordering::SeqCst);
                signal_group(*pid, Signal::SIGTERM);
                true
            }
            None => false,
        }
    }

    /// Terminate every process: SIGTERM all, wait up to `grace` for them to
    /// exit, then SIGKILL survivors. Returns the number of processes signalled.
    pub async fn terminate_all(&self, grace: Duration) -> usize {
        let count = {
            let mut live = self.live.lock().await;
            for slot in live.values_mut() {
                match slot {
                    Slot::Reserved { cancelled } => *cancelled = true,
                    Slot::Running { pid, terminating } => {
                        terminating.store(true, Ordering::SeqCst);
                        signal_group(*pid, Signal::SIGTERM);
                    }
                }
            }
            live.len()
        };
        if count == 0 {
            return 0;
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self
                .live
                .lock()
                .await
                .values()
                .filter(|s| matches!(s, Slot::Running { .. }))
                .count();
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let live = self.live.lock().await;
        for (id, slot) in live.iter() {
            if let Slot::Running { pid, .. } = slot {
                warn!("Forward {id} (pid {pid}) ignored SIGTERM, sending SIGKILL");
                signal_group(*pid, Signal::SIGKILL);
            }
        }
        count
    }
}

/// Whether a forwarder stdout line reports the tunnel is live.
pub fn is_success_line(line: &str, marker: &str) -> bool {
    !marker.is_empty() && line.contains(marker)
}
