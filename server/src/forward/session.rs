//! Port-forward session records.
//!
//! A [`ForwardSession`] is the durable projection of one forward: its
//! immutable parameters plus status and diagnostics. Rows are never deleted,
//! only updated through [`SessionUpdate`].

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a forward.
///
/// `Stopped` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Starting,
    Active,
    Stopped,
    Error,
}

impl ForwardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// `starting` or `active`.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Re-asserting the current status is allowed so repeated updates stay
    /// idempotent.
    pub fn can_transition_to(self, next: ForwardStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            Self::Starting => true,
            Self::Active => matches!(next, Self::Stopped | Self::Error),
            Self::Stopped | Self::Error => false,
        }
    }
}

impl std::fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a forward targets. Immutable once the session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardParams {
    /// kubeconfig context name.
    pub context: String,
    pub namespace: String,
    /// Resource kind as kubectl spells it (`pod`, `svc`, `deployment`, ...).
    pub resource_type: String,
    pub resource_name: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ForwardParams {
    /// `kind/name` as accepted by `kubectl port-forward`.
    pub fn target(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_name)
    }
}

/// One row of the session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSession {
    pub id: String,
    #[serde(flatten)]
    pub params: ForwardParams,
    pub status: ForwardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Epoch milliseconds.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<u64>,
}

impl ForwardSession {
    /// A fresh row in `starting` with a new id.
    pub fn starting(params: ForwardParams) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            params,
            status: ForwardStatus::Starting,
            error: None,
            pid: None,
            created_at: now_ms(),
            stopped_at: None,
        }
    }

    /// Apply an update, honouring the state machine.
    ///
    /// Returns `false` (and leaves the row untouched) when the update asks for
    /// a status transition the state machine forbids.
    pub fn apply(&mut self, update: &SessionUpdate) -> bool {
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return false;
            }
            self.status = next;
            if next.is_terminal() {
                self.pid = None;
                if self.stopped_at.is_none() {
                    self.stopped_at = Some(update.stopped_at.unwrap_or_else(now_ms));
                }
            }
        }
        if let Some(ref error) = update.error {
            self.error = Some(error.clone());
        }
        if let Some(pid) = update.pid {
            if self.status.is_live() {
                self.pid = Some(pid);
            }
        }
        true
    }
}

/// Partial update applied by [`crate::forward::store::SessionStore::update`].
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<ForwardStatus>,
    pub error: Option<String>,
    pub pid: Option<u32>,
    pub stopped_at: Option<u64>,
}

impl SessionUpdate {
    pub fn status(status: ForwardStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(ForwardStatus::Error),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            ..Self::default()
        }
    }
}

/// Current timestamp in milliseconds.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
pub(crate) fn sample_params(context: &str, local_port: u16) -> ForwardParams {
    ForwardParams {
        context: context.to_string(),
        namespace: "default".to_string(),
        resource_type: "svc".to_string(),
        resource_name: "web".to_string(),
        local_port,
        remote_port: 80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(context: &str, local_port: u16) -> ForwardParams {
        sample_params(context, local_port)
    }

    #[test]
    fn test_transitions_are_monotonic() {
        use ForwardStatus::*;
        assert!(Starting.can_transition_to(Active));
        assert!(Starting.can_transition_to(Error));
        assert!(Active.can_transition_to(Stopped));
        assert!(!Active.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Active));
        assert!(!Error.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn test_terminal_update_clears_pid_and_stamps() {
        let mut s = ForwardSession::starting(params("prod", 8080));
        assert!(s.apply(&SessionUpdate::pid(42)));
        assert_eq!(s.pid, Some(42));
        assert!(s.apply(&SessionUpdate::status(ForwardStatus::Stopped)));
        assert_eq!(s.pid, None);
        assert!(s.stopped_at.is_some());
    }

    #[test]
    fn test_rejected_update_leaves_row_untouched() {
        let mut s = ForwardSession::starting(params("prod", 8080));
        s.apply(&SessionUpdate::status(ForwardStatus::Stopped));
        let before = s.clone();
        assert!(!s.apply(&SessionUpdate::failed("late exit")));
        assert_eq!(s, before);
    }

    #[test]
    fn test_serialized_shape_is_flat() {
        let s = ForwardSession::starting(params("prod", 8080));
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["status"], "starting");
        assert_eq!(v["context"], "prod");
        assert_eq!(v["local_port"], 8080);
        assert!(v.get("error").is_none());
    }
}
