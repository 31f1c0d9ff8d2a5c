//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::forward::PortForwardManager;

/// Shared application state for the kubedeck server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Owner of every port-forward session.
    pub forwards: PortForwardManager,
    pub relay_stats: Arc<RelayStats>,
}

impl AppState {
    pub fn new(config: Config, forwards: PortForwardManager) -> Self {
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            forwards,
            relay_stats: Arc::new(RelayStats::default()),
        }
    }
}

/// Relay counters, updated lock-free on the connection hot path.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Relays currently streaming.
    pub active: AtomicU64,
    /// Relays ever started (backend constructed).
    pub created: AtomicU64,
    /// Upgrades closed with 1008 because the route was malformed.
    pub rejected: AtomicU64,
}

impl RelayStats {
    /// Count a new relay as created and active until the guard drops.
    pub fn track(self: &Arc<Self>) -> ActiveRelay {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveRelay(Arc::clone(self))
    }
}

/// Decrements [`RelayStats::active`] on drop.
pub struct ActiveRelay(Arc<RelayStats>);

impl Drop for ActiveRelay {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}
