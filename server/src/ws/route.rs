//! Relay route parsing.
//!
//! ```text
//! /ws/shell/<context>                                   local shell
//! /ws/terminal/<context>/<namespace>/<pod>/<container>  remote exec
//! ```
//!
//! Segments are percent-decoded individually so names containing `/` (such as
//! EKS context ARNs) survive when encoded. Empty segments are ignored, and
//! segments beyond the required count are ignored too.

/// A validated relay target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayRoute {
    Shell {
        context: String,
    },
    Terminal {
        context: String,
        namespace: String,
        pod: String,
        container: String,
    },
}

impl RelayRoute {
    /// Short description for logs.
    pub fn label(&self) -> String {
        match self {
            Self::Shell { context } => format!("shell:{context}"),
            Self::Terminal {
                context,
                namespace,
                pod,
                container,
            } => format!("terminal:{context}/{namespace}/{pod}/{container}"),
        }
    }
}

/// Why a path does not name a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// A relay prefix with the wrong shape: upgrade, then close 1008 with this
    /// reason.
    Rejected(&'static str),
    /// Not a relay path at all: no upgrade.
    NotFound,
}

pub const INVALID_SHELL_PATH: &str = "Invalid shell path";
pub const INVALID_TERMINAL_PATH: &str = "Invalid terminal path";

/// Parse a request path into a [`RelayRoute`].
pub fn parse_route(path: &str) -> Result<RelayRoute, RouteError> {
    let mut parts = path.split('/').filter(|s| !s.is_empty());
    if parts.next() != Some("ws") {
        return Err(RouteError::NotFound);
    }
    match parts.next() {
        Some("shell") => {
            let segs = decode_all(parts, INVALID_SHELL_PATH)?;
            match segs.as_slice() {
                [context, ..] => Ok(RelayRoute::Shell {
                    context: context.clone(),
                }),
                [] => Err(RouteError::Rejected(INVALID_SHELL_PATH)),
            }
        }
        Some("terminal") => {
            let segs = decode_all(parts, INVALID_TERMINAL_PATH)?;
            match segs.as_slice() {
                [context, namespace, pod, container, ..] => Ok(RelayRoute::Terminal {
                    context: context.clone(),
                    namespace: namespace.clone(),
                    pod: pod.clone(),
                    container: container.clone(),
                }),
                _ => Err(RouteError::Rejected(INVALID_TERMINAL_PATH)),
            }
        }
        _ => Err(RouteError::NotFound),
    }
}

fn decode_all<'a>(
    parts: impl Iterator<Item = &'a str>,
    reason: &'static str,
) -> Result<Vec<String>, RouteError> {
    parts
        .map(|seg| match urlencoding::decode(seg) {
            Ok(s) if !s.is_empty() => Ok(s.into_owned()),
            _ => Err(RouteError::Rejected(reason)),
        })
        .collect()
}
