//! Optional pre-shared API key authentication.
//!
//! kubedeck normally listens on loopback for a local dashboard and runs
//! without a key. When `auth.api_key` is set, REST endpoints other than
//! `/api/health` require `Authorization: Bearer <key>`, and WebSocket upgrades
//! require a `?token=` query parameter (browsers can't set headers on
//! WebSocket upgrades).

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;

/// Extension type carrying the expected API key (if any), injected into the
/// router layer so [`require_api_key`] can access it without touching
/// `AppState`.
#[derive(Clone, Default)]
pub struct ApiKey(pub Option<String>);

impl ApiKey {
    /// Whether `provided` grants access. Always true when no key is set.
    pub fn permits(&self, provided: Option<&str>) -> bool {
        match (&self.0, provided) {
            (None, _) => true,
            (Some(expected), Some(provided)) => {
                constant_time_eq(expected.as_bytes(), provided.as_bytes())
            }
            (Some(_), None) => false,
        }
    }
}

/// Axum middleware enforcing `Authorization: Bearer` when a key is configured.
///
/// # Error responses
///
/// - `401 Unauthorized` — header missing or malformed
/// - `403 Forbidden` — key present but invalid
pub async fn require_api_key(
    Extension(key): Extension<ApiKey>,
    request: Request,
    next: Next,
) -> Response {
    if key.0.is_none() {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(provided) = provided else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header", "code": "UNAUTHORIZED"})),
        )
            .into_response();
    };

    if !key.permits(Some(provided)) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid API key", "code": "FORBIDDEN"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}
