//! Unauthenticated health-check endpoint.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, and forward/relay counts. No
/// authentication required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let forwards = state.forwards.live_count().await;
    let relays = &state.relay_stats;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "forwards": forwards,
        "relays": {
            "active": relays.active.load(Ordering::Relaxed),
            "created": relays.created.load(Ordering::Relaxed),
            "rejected": relays.rejected.load(Ordering::Relaxed),
        },
    }))
}
