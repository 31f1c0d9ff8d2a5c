#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! kubedeck library: the session orchestration core behind the dashboard.
//!
//! - `forward` — port registry, session store, process supervisor, and the
//!   port-forward manager state machine
//! - `relay` — byte relays between a client connection and a local shell or a
//!   `kubectl exec` stream
//! - `ws` — WebSocket gateway: route validation and relay construction
//! - `routes` — REST API handlers and the router
//! - `shell` — process spawning, group signalling, and PTY management
//! - `auth` — optional API key middleware
//! - `config` — configuration loading

pub mod auth;
pub mod config;
pub mod error;
pub mod forward;
pub mod relay;
pub mod routes;
pub mod shell;
pub mod state;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use forward::PortForwardManager;
pub use state::AppState;
