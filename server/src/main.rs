#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # kubedeck
//!
//! Local companion service for a Kubernetes dashboard: supervises
//! `kubectl port-forward` processes and relays browser terminals to a local
//! shell or into containers.
//!
//! ## Subcommands
//!
//! - `kubedeck serve` (default) — run the HTTP/WS server
//! - `kubedeck forwards` — print recorded port-forwards from the store
//!
//! ## API surface
//!
//! | Method | Path                                          | Auth | Description                 |
//! |--------|-----------------------------------------------|------|-----------------------------|
//! | GET    | `/api/health`                                 | No   | Liveness probe              |
//! | POST   | `/api/forwards`                               | Yes  | Start a port-forward        |
//! | GET    | `/api/forwards`                               | Yes  | Live forwards (`?context=`) |
//! | GET    | `/api/forwards/history`                       | Yes  | All forwards, newest first  |
//! | GET    | `/api/forwards/{id}`                          | Yes  | One forward                 |
//! | DELETE | `/api/forwards/{id}`                          | Yes  | Stop a forward              |
//! | GET    | `/ws/shell/{context}`                         | Yes* | Local shell relay           |
//! | GET    | `/ws/terminal/{ctx}/{ns}/{pod}/{container}`   | Yes* | Container shell relay       |
//!
//! Auth applies only when `auth.api_key` is set. *WebSocket auth is via
//! `?token=<key>`.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, startup recovery, graceful shutdown
//! auth.rs          — optional Bearer token middleware, constant-time comparison
//! config.rs        — TOML + env-var configuration
//! error.rs         — thiserror types, JSON error responses
//! forward/
//!   registry.rs    — local port availability probe
//!   session.rs     — ForwardSession rows and the status state machine
//!   store.rs       — in-memory rows + append-only JSONL log
//!   supervisor.rs  — live process map, success-marker scan, termination
//!   mod.rs         — PortForwardManager (start/stop/list, reconciliation)
//! relay/
//!   control.rs     — resize envelope vs data classification
//!   backend.rs     — local shell and kubectl exec backends, each on a PTY
//!   mod.rs         — RelaySession (bidirectional pump, teardown, close codes)
//! shell/
//!   process.rs     — piped spawn in a process group, killpg, kubectl exec args
//!   pty.rs         — PTY allocation, spawn, resize
//! ws/
//!   route.rs       — relay path parsing
//!   mod.rs         — WebSocket upgrade and relay construction
//! routes/          — REST handlers and router
//! ```

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};

use kubedeck::config::Config;
use kubedeck::forward::store::SessionStore;
use kubedeck::forward::{KubectlPortForward, PortForwardManager};
use kubedeck::AppState;

#[derive(Parser)]
#[command(name = "kubedeck", version)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket server (default).
    Serve,
    /// Print port-forwards recorded in the session store.
    Forwards {
        /// Only show forwards for this kubeconfig context.
        #[arg(long)]
        context: Option<String>,
        /// Include stopped and failed forwards.
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("kubedeck: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let result = match cli.command {
        Some(Commands::Forwards { context, all }) => {
            print_forwards(&config, context.as_deref(), all).await
        }
        Some(Commands::Serve) | None => run_server(config).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> Result<(), Box<dyn Error>> {
    info!("kubedeck v{} starting", env!("CARGO_PKG_VERSION"));

    let data_dir = config.data_dir();
    info!("Session store: {}", data_dir.display());
    let store = Arc::new(SessionStore::open(&data_dir, config.forward.fsync).await?);

    let forwards = PortForwardManager::new(
        store,
        Arc::new(KubectlPortForward::new(&config.kube)),
        config.forward.clone(),
    );
    forwards.recover().await?;

    if config.auth.api_key.is_none() {
        info!("No API key configured; accepting unauthenticated requests");
    }

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .map_err(|e| format!("Failed to bind {}: {e}", config.server.listen))?;
    info!("Listening on {}", config.server.listen);

    let state = AppState::new(config, forwards.clone());
    let app = kubedeck::routes::router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    forwards.shutdown().await;
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {e}");
            let _ = ctrl_c.await;
            info!("Received SIGINT");
        }
    }
}

async fn print_forwards(
    config: &Config,
    context: Option<&str>,
    all: bool,
) -> Result<(), Box<dyn Error>> {
    let store = SessionStore::read_only(&config.data_dir()).await?;
    let rows = if all {
        store.history(context).await
    } else {
        store.find_active_by_context(context).await
    };
    if rows.is_empty() {
        println!("No forwards");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<16}  {:<28}  {:>11}  {:<8}  ERROR",
        "ID", "CONTEXT", "NAMESPACE", "TARGET", "PORTS", "STATUS"
    );
    for row in rows {
        let p = &row.params;
        println!(
            "{:<8}  {:<20}  {:<16}  {:<28}  {:>11}  {:<8}  {}",
            row.id.get(..8).unwrap_or(&row.id),
            p.context,
            p.namespace,
            p.target(),
            format!("{}:{}", p.local_port, p.remote_port),
            row.status.as_str(),
            row.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
