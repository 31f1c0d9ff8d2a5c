//! Relay sessions: one client connection bridged to one backend process.
//!
//! ## Framing
//!
//! | Direction        | Frame                | Handling                               |
//! |------------------|----------------------|----------------------------------------|
//! | client → backend | text, resize control | `BackendControl::resize`, not written  |
//! | client → backend | any other text       | UTF-8 bytes written verbatim           |
//! | client → backend | binary               | written verbatim                       |
//! | backend → client | output chunk         | binary frame, bytes untouched          |
//!
//! ## Teardown
//!
//! Whichever direction finishes first decides the ending. Client gone: the
//! backend is terminated. Backend gone: the client receives a close frame
//! (1000 for exit code 0, 1011 otherwise) and the backend's process group is
//! cleaned up. Either way teardown runs once.

pub mod backend;
pub mod control;

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use backend::{BackendExit, BackendIo};
use control::{classify_text, ClientFrame, ControlMessage};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Policy violation; used for malformed routes.
pub const CLOSE_POLICY: u16 = 1008;
/// Unexpected condition; backend failed or ended abnormally.
pub const CLOSE_ERROR: u16 = 1011;

/// Close reasons are limited to 123 bytes by the WebSocket framing.
const MAX_CLOSE_REASON: usize = 123;

/// How long to wait for the exit status once backend output has ended.
const EXIT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Streaming,
    Closed,
}

/// Which side ended the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    /// The client closed or dropped the connection.
    Client,
    /// The backend ended; carries the close code sent to the client.
    Backend { exit: BackendExit, close_code: u16 },
}

/// A single client-to-backend bridge.
pub struct RelaySession {
    label: String,
    state: RelayState,
}

impl RelaySession {
    /// `label` names the target in logs (e.g. `shell:prod`).
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: RelayState::Connecting,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Pump frames until either side ends, then tear down.
    pub async fn run<S, R, E>(&mut self, backend: BackendIo, mut sink: S, mut stream: R) -> RelayEnd
    where
        S: Sink<Message> + Unpin,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        self.state = RelayState::Streaming;
        let label = self.label.as_str();
        let BackendIo {
            input,
            mut output,
            exit,
            control,
        } = backend;
        info!("Relay {label} streaming");

        let client_to_backend = async {
            while let Some(msg) = stream.next().await {
                let bytes = match msg {
                    Ok(Message::Text(text)) => match classify_text(text.as_str()) {
                        ClientFrame::Control(ControlMessage::Resize { cols, rows }) => {
                            if cols == 0 || rows == 0 {
                                debug!("Relay {label}: ignoring empty resize {cols}x{rows}");
                            } else if let Err(e) = control.resize(cols, rows) {
                                warn!("Relay {label}: resize to {cols}x{rows} failed: {e}");
                            }
                            continue;
                        }
                        ClientFrame::Data(bytes) => bytes.to_vec(),
                    },
                    Ok(Message::Binary(bytes)) => bytes.to_vec(),
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                    Err(e) => {
                        debug!("Relay {label}: client read error: {e}");
                        break;
                    }
                };
                if bytes.is_empty() {
                    continue;
                }
                // A closed input means the backend is exiting; its output side
                // will end the relay.
                if input.send(bytes).await.is_err() {
                    debug!("Relay {label}: backend input closed");
                }
            }
        };

        let backend_to_client = async {
            while let Some(chunk) = output.recv().await {
                if sink.send(Message::Binary(chunk.into())).await.is_err() {
                    return false;
                }
            }
            true
        };

        let backend_ended = tokio::select! {
            () = client_to_backend => false,
            ended = backend_to_client => ended,
        };
        drop(input);

        let end = if backend_ended {
            let exit = match tokio::time::timeout(EXIT_WAIT, exit).await {
                Ok(Ok(exit)) => exit,
                _ => BackendExit {
                    code: None,
                    signal: None,
                },
            };
            let close_code = if exit.success() {
                CLOSE_NORMAL
            } else {
                CLOSE_ERROR
            };
            let reason = if exit.success() {
                String::new()
            } else {
                exit.describe()
            };
            let _ = sink.send(close_message(close_code, &reason)).await;
            let _ = sink.close().await;
            info!("Relay {label} backend ended: {}", exit.describe());
            RelayEnd::Backend { exit, close_code }
        } else {
            info!("Relay {label} client disconnected");
            RelayEnd::Client
        };

        control.terminate();
        self.state = RelayState::Closed;
        end
    }
}

/// A close frame with `reason` cut to the protocol limit on a char boundary.
pub fn close_message(code: u16, reason: &str) -> Message {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    Message::Close(Some(CloseFrame {
        code,
        reason: reason[..end].into(),
    }))
}
