//! Error types shared across the forward, relay, and config modules.
//!
//! Per-session failures (spawn errors, premature exits) are *not* represented
//! here: they are recorded on the session row and returned as data. These
//! types cover what the caller must handle synchronously.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Errors raised by [`crate::forward::store::SessionStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Session {0} not found")]
    NotFound(String),
}

/// Errors returned synchronously by [`crate::forward::PortForwardManager`].
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The local port is bound by another process or held by a live session.
    #[error("Port {0} is already in use")]
    PortInUse(u16),
    #[error("Session {0} not found")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ForwardError {
    /// Machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ForwardError::PortInUse(_) => "PORT_IN_USE",
            ForwardError::NotFound(_) | ForwardError::Store(StoreError::NotFound(_)) => {
                "SESSION_NOT_FOUND"
            }
            ForwardError::Invalid(_) => "INVALID_REQUEST",
            ForwardError::Store(_) => "STORE_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ForwardError::PortInUse(_) => StatusCode::CONFLICT,
            ForwardError::NotFound(_) | ForwardError::Store(StoreError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ForwardError::Invalid(_) => StatusCode::BAD_REQUEST,
            ForwardError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}

/// Failures while constructing or driving a relay backend.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to allocate PTY: {0}")]
    Pty(#[from] nix::Error),
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to set up backend I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
