//! Update coordination: bridging push notifications onto the coordinator's
//! task and fanning snapshots out to listeners.

mod bridge;
#[allow(clippy::module_inception)]
mod coordinator;
mod error;
mod message;
mod registry;
mod snapshot;

pub use bridge::channel;
pub use bridge::Bridge;
pub use bridge::BridgeReceiver;
pub use bridge::Job;
pub use coordinator::ApplianceOverview;
pub use coordinator::IngestReport;
pub use coordinator::Lifecycle;
pub use coordinator::NotifyReport;
pub use coordinator::UpdateCoordinator;
pub use error::BridgeError;
pub use error::CoordinatorError;
pub use error::FailureKind;
pub use error::ListenerError;
pub use error::ListenerFailure;
pub use error::WriteError;
pub use message::PushMessage;
pub use message::CONNECTION_STATUS_FIELD;
pub use message::LAST_CONN_EVENT_FIELD;
pub use message::REMOTE_CONTROL_FIELD;
pub use message::REMOTE_CTR_VALID_FIELD;
pub use registry::Listener;
pub use registry::ListenerId;
pub use registry::UpdateContext;
pub use snapshot::ApplianceId;
pub use snapshot::ApplianceSnapshot;
pub use snapshot::AttributeValue;
pub use snapshot::ConnectionStatus;
