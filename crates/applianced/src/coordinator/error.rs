use super::registry::ListenerId;
use super::snapshot::ApplianceId;

/// Errors returned to callers of [`super::Bridge`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The coordinator behind the bridge has been torn down.
    #[error("bridge closed: the coordinator has been torn down")]
    Closed,

    /// The hand-off queue is saturated.
    #[error("bridge queue full ({capacity} calls pending)")]
    Full { capacity: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("coordinator is closed")]
    Closed,

    #[error("appliance '{0}' is closed")]
    ApplianceClosed(ApplianceId),

    #[error("entity '{0}' is already registered")]
    DuplicateEntity(String),
}

/// Error raised by a listener's update hook.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ListenerError {
    #[error("attribute '{key}' is missing from the snapshot")]
    MissingAttribute { key: String },

    #[error("cannot render attribute '{key}': {reason}")]
    Render { key: String, reason: String },

    #[error("{0}")]
    Other(String),
}

/// Rejection from the host rendering API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("write rejected for {entity_id}: {reason}")]
pub struct WriteError {
    pub entity_id: String,
    pub reason: String,
}

/// How a listener failed during a notification pass.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    Error(ListenerError),
    Panicked(String),
}

/// A single listener's failure, isolated from the rest of the pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerFailure {
    pub listener_id: ListenerId,
    pub entity_id: String,
    pub kind: FailureKind,
}

impl std::fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FailureKind::Error(e) => write!(f, "{} ({}): {}", self.entity_id, self.listener_id, e),
            FailureKind::Panicked(msg) => {
                write!(f, "{} ({}) panicked: {}", self.entity_id, self.listener_id, msg)
            }
        }
    }
}
