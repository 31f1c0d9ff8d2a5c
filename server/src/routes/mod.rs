//! HTTP route handlers and the router that mounts them.
//!
//! All REST handlers except [`health`] sit behind the
//! [`crate::auth::require_api_key`] middleware, which is a pass-through when
//! no key is configured. The WebSocket gateway checks `?token=` itself.

pub mod forwards;
pub mod health;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::ws;
use crate::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/forwards", post(forwards::start).get(forwards::list))
        .route("/api/forwards/history", get(forwards::history))
        .route(
            "/api/forwards/{id}",
            get(forwards::get).delete(forwards::stop),
        )
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_routes = Router::new().route("/ws/{*path}", get(ws::ws_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
