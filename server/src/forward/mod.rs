//! Port-forward lifecycle management.
//!
//! [`PortForwardManager`] is the single authority for starting, stopping, and
//! listing forwards. It ties together the port probe ([`registry`]), the
//! durable rows ([`store`]), and the live processes ([`supervisor`]).
//!
//! ## State machine
//!
//! ```text
//! starting ──► active ──► stopped
//!     │           │
//!     └──► error ◄┘
//! ```
//!
//! `start` races the forwarder's success marker against
//! `forward.startup_timeout_ms`. A forwarder that is still alive when the
//! timer fires is assumed to be working: `kubectl port-forward` prints nothing
//! further until a connection arrives, so silence is not failure.
//!
//! ## Reconciliation
//!
//! A row may only read `starting`/`active` while the supervisor knows a
//! process for it. `list` downgrades rows that fail this check, and
//! [`PortForwardManager::recover`] downgrades all of them at startup since no
//! process survives a restart of this service.

pub mod registry;
pub mod session;
pub mod store;
pub mod supervisor;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{ForwardConfig, KubeConfig};
use crate::error::ForwardError;
use session::{ForwardParams, ForwardSession, ForwardStatus, SessionUpdate};
use store::SessionStore;
use supervisor::{CommandSpec, ProcessEvent, ProcessSupervisor};

/// Builds the forwarder invocation for a set of parameters.
pub trait ForwardCommand: Send + Sync {
    fn command(&self, params: &ForwardParams) -> CommandSpec;
}

/// `kubectl port-forward`, bound to loopback only.
pub struct KubectlPortForward {
    kubectl: String,
    env: HashMap<String, String>,
}

impl KubectlPortForward {
    pub fn new(kube: &KubeConfig) -> Self {
        Self {
            kubectl: kube.kubectl.clone(),
            env: kube.child_env(),
        }
    }
}

impl ForwardCommand for KubectlPortForward {
    fn command(&self, params: &ForwardParams) -> CommandSpec {
        CommandSpec {
            program: self.kubectl.clone(),
            args: vec![
                "--context".to_string(),
                params.context.clone(),
                "--namespace".to_string(),
                params.namespace.clone(),
                "port-forward".to_string(),
                "--address".to_string(),
                "127.0.0.1".to_string(),
                params.target(),
                format!("{}:{}", params.local_port, params.remote_port),
            ],
            env: self.env.clone(),
        }
    }
}

/// Start/stop/list API over port-forward sessions.
///
/// Cloneable; all clones share the same store and supervisor.
#[derive(Clone)]
pub struct PortForwardManager {
    store: Arc<SessionStore>,
    supervisor: ProcessSupervisor,
    command: Arc<dyn ForwardCommand>,
    config: Arc<ForwardConfig>,
    /// Ids whose final outcome has not been written yet. Reconciliation leaves
    /// these rows alone so an exit diagnostic is never overwritten.
    pending: Arc<Mutex<HashSet<String>>>,
}

impl PortForwardManager {
    pub fn new(
        store: Arc<SessionStore>,
        command: Arc<dyn ForwardCommand>,
        config: ForwardConfig,
    ) -> Self {
        Self {
            store,
            supervisor: ProcessSupervisor::new(),
            command,
            config: Arc::new(config),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start a forward.
    ///
    /// Port conflicts are rejected before any row is created. Every later
    /// failure (spawn error, premature exit) is recorded on the returned row
    /// with status `error`.
    pub async fn start(&self, params: ForwardParams) -> Result<ForwardSession, ForwardError> {
        validate(&params)?;
        let port = params.local_port;
        if !registry::is_available(port) || self.port_held(port).await {
            return Err(ForwardError::PortInUse(port));
        }

        let session = ForwardSession::starting(params);
        let id = session.id.clone();
        let spec = self.command.command(&session.params);

        self.pending.lock().await.insert(id.clone());
        self.supervisor.reserve(&id).await;
        if let Err(e) = self.store.insert(session).await {
            self.supervisor.release(&id).await;
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }
        info!("Forward {id} starting on port {port}");

        let spawned = match self
            .supervisor
            .spawn(&id, &spec, &self.config.success_marker)
            .await
        {
            Ok(spawned) => spawned,
            Err(e) => {
                let message = format!("Failed to start {}: {e}", spec.program);
                warn!("Forward {id}: {message}");
                let row = self.store.update(&id, &SessionUpdate::failed(message)).await;
                self.pending.lock().await.remove(&id);
                return Ok(row?);
            }
        };

        // Events are buffered until the monitor runs, so a failed pid write
        // must not keep it from being spawned.
        if let Err(e) = self.store.update(&id, &SessionUpdate::pid(spawned.pid)).await {
            error!("Forward {id}: failed to record pid {}: {e}", spawned.pid);
        }

        let (outcome_tx, mut outcome_rx) = oneshot::channel();
        tokio::spawn(monitor(
            Arc::clone(&self.store),
            Arc::clone(&self.pending),
            id.clone(),
            port,
            spawned.events,
            outcome_tx,
        ));

        if tokio::time::timeout(self.config.startup_timeout(), &mut outcome_rx)
            .await
            .is_err()
        {
            if self.supervisor.is_alive(&id).await {
                let row = self
                    .store
                    .update(&id, &SessionUpdate::status(ForwardStatus::Active))
                    .await?;
                if row.status == ForwardStatus::Active {
                    info!(
                        "Forward {id}: no success marker within {} ms, assuming active",
                        self.config.startup_timeout_ms
                    );
                }
            } else {
                // Already reaped; the exit report follows once its pipes drain.
                let _ = outcome_rx.await;
            }
        }

        self.store
            .get(&id)
            .await
            .ok_or(ForwardError::NotFound(id))
    }

    /// Stop a forward. Stopping a session that is already `stopped` or
    /// `error` succeeds without changing it.
    pub async fn stop(&self, id: &str) -> Result<ForwardSession, ForwardError> {
        let row = self
            .store
            .get(id)
            .await
            .ok_or_else(|| ForwardError::NotFound(id.to_string()))?;
        if row.status.is_terminal() {
            self.supervisor.terminate(id).await;
            return Ok(row);
        }

        // Record the stop before signalling so the exit that follows cannot
        // be recorded as a failure.
        let row = self
            .store
            .update(id, &SessionUpdate::status(ForwardStatus::Stopped))
            .await?;
        if self.supervisor.terminate(id).await {
            info!("Forward {id} stopped");
        } else {
            info!("Forward {id} stopped (no live process)");
        }
        Ok(row)
    }

    /// Live forwards, optionally for one context, after reconciling rows
    /// against the supervisor.
    pub async fn list(&self, context: Option<&str>) -> Result<Vec<ForwardSession>, ForwardError> {
        let rows = self.store.find_active_by_context(context).await;
        let live = self.supervisor.live_ids().await;
        let pending = self.pending.lock().await.clone();

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if live.contains(&row.id) {
                out.push(row);
            } else if !pending.contains(&row.id) {
                debug!("Forward {} has no live process, marking stopped", row.id);
                self.store
                    .update(&row.id, &SessionUpdate::status(ForwardStatus::Stopped))
                    .await?;
            }
        }
        Ok(out)
    }

    /// Every row ever recorded, newest first.
    pub async fn history(&self, context: Option<&str>) -> Vec<ForwardSession> {
        self.store.history(context).await
    }

    pub async fn get(&self, id: &str) -> Option<ForwardSession> {
        self.store.get(id).await
    }

    /// Number of forwarder processes currently supervised.
    pub async fn live_count(&self) -> usize {
        self.supervisor.live_count().await
    }

    /// Startup reconciliation: nothing can be running for rows left
    /// `starting`/`active` by a previous run. Returns how many were fixed.
    pub async fn recover(&self) -> Result<usize, ForwardError> {
        let stale = self.store.mark_all_active_stopped(None).await?;
        if !stale.is_empty() {
            info!("Marked {} stale forward(s) stopped", stale.len());
        }
        Ok(stale.len())
    }

    /// Stop everything before the host process exits.
    ///
    /// Rows are marked `stopped` first, then every process is terminated
    /// (SIGKILL after `forward.stop_grace_ms`).
    pub async fn shutdown(&self) {
        match self.store.mark_all_active_stopped(None).await {
            Ok(ids) => info!("Marked {} forward(s) stopped for shutdown", ids.len()),
            Err(e) => error!("Failed to mark forwards stopped during shutdown: {e}"),
        }
        let count = self.supervisor.terminate_all(self.config.stop_grace()).await;
        if count > 0 {
            info!("Terminated {count} forward process(es)");
        }
    }

    /// Whether another live session already owns `port`.
    async fn port_held(&self, port: u16) -> bool {
        let live = self.supervisor.live_ids().await;
        self.store
            .find_active_by_context(None)
            .await
            .iter()
            .any(|s| s.params.local_port == port && live.contains(&s.id))
    }
}

fn validate(params: &ForwardParams) -> Result<(), ForwardError> {
    let missing = [
        ("context", params.context.as_str()),
        ("namespace", params.namespace.as_str()),
        ("resource_type", params.resource_type.as_str()),
        ("resource_name", params.resource_name.as_str()),
    ]
    .into_iter()
    .find(|(_, v)| v.trim().is_empty());
    if let Some((field, _)) = missing {
        return Err(ForwardError::Invalid(format!("{field} is required")));
    }
    if params.local_port == 0 || params.remote_port == 0 {
        return Err(ForwardError::Invalid(
            "local_port and remote_port must be non-zero".to_string(),
        ));
    }
    Ok(())
}

/// Drive one session's row from its process events until the process exits.
async fn monitor(
    store: Arc<SessionStore>,
    pending: Arc<Mutex<HashSet<String>>>,
    id: String,
    local_port: u16,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    outcome_tx: oneshot::Sender<()>,
) {
    let mut outcome_tx = Some(outcome_tx);
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Ready => {
                match store
                    .update(&id, &SessionUpdate::status(ForwardStatus::Active))
                    .await
                {
                    Ok(row) if row.status == ForwardStatus::Active => {
                        info!("Forward {id} active on port {local_port}");
                    }
                    Ok(_) => {}
                    Err(e) => error!("Forward {id}: failed to record active: {e}"),
                }
                if let Some(tx) = outcome_tx.take() {
                    let _ = tx.send(());
                }
            }
            ProcessEvent::Exited {
                code,
                signal,
                stderr,
                requested,
            } => {
                let was_starting = store
                    .get(&id)
                    .await
                    .is_some_and(|s| s.status == ForwardStatus::Starting);
                let exit = ExitReport {
                    code,
                    signal,
                    stderr: &stderr,
                    requested,
                    was_starting,
                };
                let update = exit_update(&exit, local_port);
                match store.update(&id, &update).await {
                    Ok(row) if row.status == ForwardStatus::Error => {
                        warn!(
                            "Forward {id} failed: {}",
                            row.error.as_deref().unwrap_or("")
                        );
                    }
                    Ok(row) => info!("Forward {id} ended ({})", row.status),
                    Err(e) => error!("Forward {id}: failed to record exit: {e}"),
                }
                pending.lock().await.remove(&id);
                if let Some(tx) = outcome_tx.take() {
                    let _ = tx.send(());
                }
                return;
            }
        }
    }
    pending.lock().await.remove(&id);
}

struct ExitReport<'a> {
    code: Option<i32>,
    signal: Option<i32>,
    stderr: &'a str,
    requested: bool,
    was_starting: bool,
}

/// Map a process exit to the row update it implies.
fn exit_update(exit: &ExitReport<'_>, local_port: u16) -> SessionUpdate {
    if exit.requested || (exit.code == Some(0) && !exit.was_starting) {
        return SessionUpdate::status(ForwardStatus::Stopped);
    }

    let detail = if !exit.stderr.is_empty() {
        exit.stderr.to_string()
    } else if let Some(code) = exit.code {
        format!("Port-forward exited with code {code}")
    } else if let Some(signal) = exit.signal {
        format!("Port-forward killed by signal {signal}")
    } else {
        "Port-forward exited unexpectedly".to_string()
    };

    let message = if exit.stderr.contains("address already in use") {
        format!("Port {local_port} is already in use: {detail}")
    } else if exit.was_starting && exit.stderr.is_empty() {
        format!("{detail} before forwarding was established")
    } else {
        detail
    };
    SessionUpdate::failed(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::session::sample_params;
    use std::net::TcpListener;
    use std::time::Duration;

    /// Runs a shell script in place of kubectl; `$1`/`$2` are the ports.
    struct Script(&'static str);

    impl ForwardCommand for Script {
        fn command(&self, params: &ForwardParams) -> CommandSpec {
            CommandSpec {
                program: "/bin/sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    self.0.to_string(),
                    "sh".to_string(),
                    params.local_port.to_string(),
                    params.remote_port.to_string(),
                ],
                env: HashMap::new(),
            }
        }
    }

    const FORWARDS: &str = "echo \"Forwarding from 127.0.0.1:$1 -> $2\"; exec sleep 30";

    fn manager(script: &'static str, startup_timeout_ms: u64) -> PortForwardManager {
        manager_with(Arc::new(SessionStore::in_memory()), Arc::new(Script(script)), startup_timeout_ms)
    }

    fn manager_with(
        store: Arc<SessionStore>,
        command: Arc<dyn ForwardCommand>,
        startup_timeout_ms: u64,
    ) -> PortForwardManager {
        let config = ForwardConfig {
            startup_timeout_ms,
            stop_grace_ms: 500,
            ..ForwardConfig::default()
        };
        PortForwardManager::new(store, command, config)
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_for_status(mgr: &PortForwardManager, id: &str, status: ForwardStatus) -> ForwardSession {
        for _ in 0..100 {
            let row = mgr.get(id).await.unwrap();
            if row.status == status {
                return row;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("session {id} never reached {status}");
    }

    #[test]
    fn test_kubectl_arguments() {
        let cmd = KubectlPortForward::new(&KubeConfig::default());
        let spec = cmd.command(&sample_params("prod", 8080));
        assert_eq!(spec.program, "kubectl");
        assert_eq!(
            spec.args,
            [
                "--context", "prod", "--namespace", "default", "port-forward", "--address",
                "127.0.0.1", "svc/web", "8080:80"
            ]
        );
    }

    #[tokio::test]
    async fn test_start_list_stop_scenario() {
        let mgr = manager(FORWARDS, 5000);
        let port = free_port();
        let session = mgr.start(sample_params("prod", port)).await.unwrap();
        assert_eq!(session.status, ForwardStatus::Active);
        assert!(session.pid.is_some());

        let listed = mgr.list(Some("prod")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, session.id);
        assert!(mgr.list(Some("dev")).await.unwrap().is_empty());

        let stopped = mgr.stop(&session.id).await.unwrap();
        assert_eq!(stopped.status, ForwardStatus::Stopped);
        assert!(stopped.stopped_at.is_some());

        for _ in 0..100 {
            if mgr.live_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(mgr.live_count().await, 0);

        let again = mgr.stop(&session.id).await.unwrap();
        assert_eq!(again.status, ForwardStatus::Stopped);
        assert_eq!(again.stopped_at, stopped.stopped_at);
        // The requested exit must not turn into an error.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mgr.get(&session.id).await.unwrap().status, ForwardStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_unknown_is_not_found() {
        let mgr = manager(FORWARDS, 5000);
        assert!(matches!(
            mgr.stop("missing").await,
            Err(ForwardError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_port_held_by_live_session_is_rejected() {
        let mgr = manager(FORWARDS, 5000);
        let port = free_port();
        let first = mgr.start(sample_params("prod", port)).await.unwrap();
        assert_eq!(first.status, ForwardStatus::Active);

        let err = mgr.start(sample_params("prod", port)).await.unwrap_err();
        assert!(matches!(err, ForwardError::PortInUse(p) if p == port));
        let history = mgr.history(None).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ForwardStatus::Active);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_os_bound_port_is_rejected_without_row() {
        let mgr = manager(FORWARDS, 5000);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = mgr.start(sample_params("prod", port)).await.unwrap_err();
        assert!(matches!(err, ForwardError::PortInUse(_)));
        assert!(err.to_string().contains(&port.to_string()));
        assert!(mgr.history(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_params_rejected() {
        let mgr = manager(FORWARDS, 5000);
        let mut params = sample_params("prod", free_port());
        params.namespace = String::new();
        assert!(matches!(
            mgr.start(params).await,
            Err(ForwardError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_list_reconciles_orphaned_rows() {
        let store = Arc::new(SessionStore::in_memory());
        let mut ids = Vec::new();
        for (i, status) in [ForwardStatus::Active, ForwardStatus::Starting].into_iter().enumerate() {
            let mut row = ForwardSession::starting(sample_params("prod", 9000 + i as u16));
            row.status = status;
            row.pid = Some(99_999);
            ids.push(store.insert(row).await.unwrap().id);
        }
        let mgr = manager_with(Arc::clone(&store), Arc::new(Script(FORWARDS)), 5000);

        assert!(mgr.list(Some("prod")).await.unwrap().is_empty());
        assert!(mgr.list(None).await.unwrap().is_empty());
        for id in ids {
            let row = store.get(&id).await.unwrap();
            assert_eq!(row.status, ForwardStatus::Stopped);
            assert!(row.pid.is_none());
        }
    }

    #[tokio::test]
    async fn test_recover_stops_everything_left_live() {
        let store = Arc::new(SessionStore::in_memory());
        let a = store.create(sample_params("prod", 9100)).await.unwrap();
        let b = store.create(sample_params("dev", 9101)).await.unwrap();
        store
            .update(&b.id, &SessionUpdate::status(ForwardStatus::Active))
            .await
            .unwrap();
        let mgr = manager_with(Arc::clone(&store), Arc::new(Script(FORWARDS)), 5000);
        assert_eq!(mgr.recover().await.unwrap(), 2);
        assert_eq!(store.get(&a.id).await.unwrap().status, ForwardStatus::Stopped);
        assert_eq!(store.get(&b.id).await.unwrap().status, ForwardStatus::Stopped);
    }

    #[tokio::test]
    async fn test_nonzero_exit_after_active_is_error() {
        let mgr = manager(
            "echo \"Forwarding from 127.0.0.1:$1 -> $2\"; sleep 0.3; exit 1",
            5000,
        );
        let session = mgr.start(sample_params("prod", free_port())).await.unwrap();
        assert_eq!(session.status, ForwardStatus::Active);
        let row = wait_for_status(&mgr, &session.id, ForwardStatus::Error).await;
        assert!(!row.error.unwrap_or_default().is_empty());
        assert_eq!(mgr.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_clean_exit_after_active_is_stopped() {
        let mgr = manager(
            "echo \"Forwarding from 127.0.0.1:$1 -> $2\"; sleep 0.3; exit 0",
            5000,
        );
        let session = mgr.start(sample_params("prod", free_port())).await.unwrap();
        let row = wait_for_status(&mgr, &session.id, ForwardStatus::Stopped).await;
        assert!(row.error.is_none());
    }

    #[tokio::test]
    async fn test_premature_exit_reports_stderr() {
        let mgr = manager("echo 'error: services \"web\" not found' >&2; exit 1", 5000);
        let session = mgr.start(sample_params("prod", free_port())).await.unwrap();
        assert_eq!(session.status, ForwardStatus::Error);
        assert_eq!(
            session.error.as_deref(),
            Some("error: services \"web\" not found")
        );
        assert!(mgr.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error_row() {
        struct Missing;
        impl ForwardCommand for Missing {
            fn command(&self, _: &ForwardParams) -> CommandSpec {
                CommandSpec {
                    program: "/nonexistent/kubectl".to_string(),
                    ..CommandSpec::default()
                }
            }
        }
        let mgr = manager_with(Arc::new(SessionStore::in_memory()), Arc::new(Missing), 5000);
        let session = mgr.start(sample_params("prod", free_port())).await.unwrap();
        assert_eq!(session.status, ForwardStatus::Error);
        assert!(session
            .error
            .unwrap()
            .starts_with("Failed to start /nonexistent/kubectl"));
    }

    #[tokio::test]
    async fn test_silent_forwarder_is_optimistically_active() {
        let mgr = manager("exec sleep 30", 200);
        let session = mgr.start(sample_params("prod", free_port())).await.unwrap();
        assert_eq!(session.status, ForwardStatus::Active);
        mgr.shutdown().await;
        assert_eq!(mgr.get(&session.id).await.unwrap().status, ForwardStatus::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_stops_all() {
        let mgr = manager(FORWARDS, 5000);
        let a = mgr.start(sample_params("prod", free_port())).await.unwrap();
        let b = mgr.start(sample_params("dev", free_port())).await.unwrap();
        assert_eq!(mgr.live_count().await, 2);
        mgr.shutdown().await;
        assert_eq!(mgr.live_count().await, 0);
        for id in [a.id, b.id] {
            assert_eq!(mgr.get(&id).await.unwrap().status, ForwardStatus::Stopped);
        }
    }

    #[tokio::test]
    async fn test_stop_during_start_wins() {
        let mgr = manager("exec sleep 30", 1500);
        let starting = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.start(sample_params("prod", free_port())).await })
        };

        let mut id = None;
        for _ in 0..100 {
            if let Some(row) = mgr.history(None).await.into_iter().next() {
                id = Some(row.id);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let id = id.expect("start never created a row");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stopped = mgr.stop(&id).await.unwrap();
        assert_eq!(stopped.status, ForwardStatus::Stopped);

        let started = starting.await.unwrap().unwrap();
        assert_eq!(started.id, id);
        assert_eq!(started.status, ForwardStatus::Stopped);

        for _ in 0..100 {
            if mgr.live_count().await == 0 && mgr.pending.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(mgr.live_count().await, 0);
        assert!(mgr.pending.lock().await.is_empty());
        let row = mgr.get(&id).await.unwrap();
        assert_eq!(row.status, ForwardStatus::Stopped);
        assert!(row.error.is_none());
    }

    #[tokio::test]
    async fn test_failed_pid_write_still_tracks_exit() {
        // The row insert is the only write that succeeds.
        let store = Arc::new(SessionStore::failing_after(1).await);
        let mgr = manager_with(
            store,
            Arc::new(Script("echo 'lost connection to pod' >&2; sleep 0.3; exit 1")),
            5000,
        );
        let session = mgr.start(sample_params("prod", free_port())).await.unwrap();
        assert_eq!(session.status, ForwardStatus::Error);
        assert_eq!(session.error.as_deref(), Some("lost connection to pod"));
        assert!(mgr.pending.lock().await.is_empty());
        assert_eq!(mgr.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_exit_while_pipes_held_waits_for_outcome() {
        // The shell is reaped at once, but the backgrounded sleep holds its
        // pipes open past the startup timeout.
        let mgr = manager("sleep 2 & echo 'no endpoints' >&2; exit 1", 200);
        let session = mgr.start(sample_params("prod", free_port())).await.unwrap();
        assert_eq!(session.status, ForwardStatus::Error);
        assert!(mgr.pending.lock().await.is_empty());
    }

    fn report(code: Option<i32>, stderr: &str, requested: bool, was_starting: bool) -> ExitReport<'_> {
        ExitReport {
            code,
            signal: None,
            stderr,
            requested,
            was_starting,
        }
    }

    #[test]
    fn test_exit_update_mapping() {
        let u = exit_update(&report(Some(0), "", false, false), 8080);
        assert_eq!(u.status, Some(ForwardStatus::Stopped));

        let u = exit_update(&report(None, "", true, false), 8080);
        assert_eq!(u.status, Some(ForwardStatus::Stopped));

        let u = exit_update(&report(Some(0), "", false, true), 8080);
        assert_eq!(u.status, Some(ForwardStatus::Error));
        assert_eq!(
            u.error.as_deref(),
            Some("Port-forward exited with code 0 before forwarding was established")
        );

        let u = exit_update(
            &report(Some(1), "Unable to listen on port 8080: address already in use", false, true),
            8080,
        );
        assert!(u.error.unwrap().starts_with("Port 8080 is already in use"));
    }
}
