//! WebSocket gateway for terminal relays.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws/shell/<context>` or
//!    `GET /ws/terminal/<context>/<namespace>/<pod>/<container>`, with
//!    `?token=<api_key>` when a key is configured.
//! 2. Paths outside those two shapes get a plain 404 and no upgrade.
//! 3. A malformed relay path is upgraded and immediately closed with 1008 and
//!    a reason; no backend is started.
//! 4. Otherwise the backend is constructed (a failure closes with 1011) and a
//!    [`RelaySession`] owns the socket until either side ends.

pub mod route;

use std::sync::atomic::Ordering;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::auth::ApiKey;
use crate::error::RelayError;
use crate::relay::backend::{spawn_exec, spawn_local_shell, BackendIo};
use crate::relay::{close_message, RelaySession, CLOSE_ERROR, CLOSE_POLICY};
use crate::shell::process::kubectl_exec;
use crate::state::AppState;
use route::{parse_route, RelayRoute, RouteError};

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// `GET /ws/{*path}` — validate the route and auth, then upgrade.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKey>,
    Query(query): Query<WsQuery>,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let route = match parse_route(uri.path()) {
        Ok(route) => Ok(route),
        Err(RouteError::Rejected(reason)) => Err(reason),
        Err(RouteError::NotFound) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Not found", "code": "NOT_FOUND"})),
            )
                .into_response();
        }
    };

    if !key.permits(query.token.as_deref()) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, route))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    route: Result<RelayRoute, &'static str>,
) {
    let (mut sink, stream) = socket.split();

    let route = match route {
        Ok(route) => route,
        Err(reason) => {
            state.relay_stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Rejected relay connection: {reason}");
            let _ = sink.send(close_message(CLOSE_POLICY, reason)).await;
            let _ = sink.close().await;
            return;
        }
    };

    let label = route.label();
    let backend = match open_backend(&state, &route) {
        Ok(backend) => backend,
        Err(e) => {
            warn!("Relay {label} failed to start: {e}");
            let _ = sink.send(close_message(CLOSE_ERROR, &e.to_string())).await;
            let _ = sink.close().await;
            return;
        }
    };

    let _active = state.relay_stats.track();
    info!("Relay {label} connected");
    RelaySession::new(label).run(backend, sink, stream).await;
}

fn open_backend(state: &AppState, route: &RelayRoute) -> Result<BackendIo, RelayError> {
    let config = &state.config;
    match route {
        RelayRoute::Shell { context } => spawn_local_shell(&config.shell, &config.kube, context),
        RelayRoute::Terminal {
            context,
            namespace,
            pod,
            container,
        } => spawn_exec(
            &kubectl_exec(&config.kube, context, namespace, pod, container),
            &config.shell,
        ),
    }
}
