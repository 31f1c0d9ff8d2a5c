//! Port-forward endpoints.
//!
//! - `POST /api/forwards` — start a forward
//! - `GET /api/forwards?context=` — live forwards (reconciled)
//! - `GET /api/forwards/history?context=` — every recorded forward, newest first
//! - `GET /api/forwards/{id}` — one forward
//! - `DELETE /api/forwards/{id}` — stop a forward (idempotent)
//!
//! A failed start (spawn error, forwarder exiting early) is still `201`: the
//! returned row carries `status: "error"` and the diagnostic.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::error::ForwardError;
use crate::forward::session::{ForwardParams, ForwardSession};
use crate::AppState;

#[derive(Deserialize)]
pub struct ContextQuery {
    /// Restrict results to one kubeconfig context. Empty means all.
    pub context: Option<String>,
}

impl ContextQuery {
    fn context(&self) -> Option<&str> {
        self.context.as_deref().filter(|c| !c.is_empty())
    }
}

/// `POST /api/forwards` — body is a [`ForwardParams`].
///
/// # Errors
///
/// - `409` `PORT_IN_USE` — local port bound or held by a live forward
/// - `400` `INVALID_REQUEST` — malformed body or empty fields
pub async fn start(
    State(state): State<AppState>,
    payload: Result<Json<ForwardParams>, JsonRejection>,
) -> Result<(StatusCode, Json<ForwardSession>), ForwardError> {
    let Json(params) = payload.map_err(|e| ForwardError::Invalid(e.body_text()))?;
    let session = state.forwards.start(params).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// `GET /api/forwards`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ContextQuery>,
) -> Result<Json<Vec<ForwardSession>>, ForwardError> {
    Ok(Json(state.forwards.list(query.context()).await?))
}

/// `GET /api/forwards/history`
pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<ContextQuery>,
) -> Json<Vec<ForwardSession>> {
    Json(state.forwards.history(query.context()).await)
}

/// `GET /api/forwards/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ForwardSession>, ForwardError> {
    state
        .forwards
        .get(&id)
        .await
        .map(Json)
        .ok_or(ForwardError::NotFound(id))
}

/// `DELETE /api/forwards/{id}` — returns the stopped row.
///
/// # Errors
///
/// - `404` `SESSION_NOT_FOUND` — no such id
pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ForwardSession>, ForwardError> {
    Ok(Json(state.forwards.stop(&id).await?))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::TcpListener;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use axum::Router;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::forward::store::SessionStore;
    use crate::forward::supervisor::CommandSpec;
    use crate::forward::{ForwardCommand, PortForwardManager};
    use crate::forward::session::ForwardParams;
    use crate::AppState;

    /// Prints the success marker and idles, like a healthy `kubectl port-forward`.
    struct Healthy;

    impl ForwardCommand for Healthy {
        fn command(&self, params: &ForwardParams) -> CommandSpec {
            CommandSpec {
                program: "/bin/sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    format!(
                        "echo 'Forwarding from 127.0.0.1:{} -> {}'; exec sleep 30",
                        params.local_port, params.remote_port
                    ),
                ],
                env: HashMap::new(),
            }
        }
    }

    fn app(api_key: Option<&str>) -> (Router, AppState) {
        let mut config = Config::default();
        config.auth.api_key = api_key.map(ToString::to_string);
        let forwards = PortForwardManager::new(
            Arc::new(SessionStore::in_memory()),
            Arc::new(Healthy),
            config.forward.clone(),
        );
        let state = AppState::new(config, forwards);
        (crate::routes::router(state.clone()), state)
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (u16, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status().as_u16();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn params(context: &str, port: u16) -> Value {
        json!({
            "context": context,
            "namespace": "default",
            "resource_type": "svc",
            "resource_name": "web",
            "local_port": port,
            "remote_port": 80,
        })
    }

    #[tokio::test]
    async fn test_forward_lifecycle_over_http() {
        let (app, state) = app(None);
        let port = free_port();

        let (status, body) = call(&app, Method::POST, "/api/forwards", Some(params("prod", port))).await;
        assert_eq!(status, 201);
        assert_eq!(body["status"], "active");
        assert_eq!(body["local_port"], port);
        let id = body["id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, Method::GET, "/api/forwards?context=prod", None).await;
        assert_eq!(status, 200);
        assert_eq!(body.as_array().unwrap().len(), 1);
        let (_, body) = call(&app, Method::GET, "/api/forwards?context=dev", None).await;
        assert!(body.as_array().unwrap().is_empty());

        let (status, body) = call(&app, Method::POST, "/api/forwards", Some(params("prod", port))).await;
        assert_eq!(status, 409);
        assert_eq!(body["code"], "PORT_IN_USE");

        let (status, body) = call(&app, Method::DELETE, &format!("/api/forwards/{id}"), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "stopped");
        let (status, _) = call(&app, Method::DELETE, &format!("/api/forwards/{id}"), None).await;
        assert_eq!(status, 200);

        let (_, body) = call(&app, Method::GET, "/api/forwards/history?context=prod", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        let (status, body) = call(&app, Method::GET, &format!("/api/forwards/{id}"), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "stopped");

        state.forwards.shutdown().await;
    }

    #[tokio::test]
    async fn test_error_shapes() {
        let (app, _) = app(None);
        let (status, body) = call(&app, Method::DELETE, "/api/forwards/nope", None).await;
        assert_eq!(status, 404);
        assert_eq!(body["code"], "SESSION_NOT_FOUND");

        let (status, body) = call(&app, Method::GET, "/api/forwards/nope", None).await;
        assert_eq!(status, 404);
        assert_eq!(body["code"], "SESSION_NOT_FOUND");

        let (status, body) =
            call(&app, Method::POST, "/api/forwards", Some(json!({"context": "prod"}))).await;
        assert_eq!(status, 400);
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_api_key_enforced_except_health() {
        let (app, _) = app(Some("s3cret"));
        let (status, _) = call(&app, Method::GET, "/api/forwards", None).await;
        assert_eq!(status, 401);
        let (status, body) = call(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");

        let req = Request::builder()
            .uri("/api/forwards")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), 200);

        let req = Request::builder()
            .uri("/api/forwards")
            .header("authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), 403);
    }
}
