//! Push sources: producer threads feeding appliance updates into the
//! coordinator through a [`Bridge`].

#[cfg(feature = "source_mqtt")]
mod mqtt;
#[cfg(feature = "source_replay")]
mod replay;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use linkme::distributed_slice;
#[cfg(feature = "source_mqtt")]
pub use mqtt::MqttSource;
#[cfg(feature = "source_replay")]
pub use replay::ReplaySource;
use serde::Deserialize;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::coordinator::Bridge;
use crate::coordinator::PushMessage;
use crate::coordinator::UpdateCoordinator;

/// Result type for source factory functions
pub type SourceFactoryResult = anyhow::Result<Option<Box<dyn PushSource>>>;

pub struct SourceContext<'a> {
    pub config: &'a Config,
}

/// Source factories. Each returns `Ok(None)` when its source is not
/// configured.
#[distributed_slice]
pub static REGISTRY: [fn(&SourceContext) -> SourceFactoryResult];

/// A producer of appliance updates.
pub trait PushSource: Send {
    fn name(&self) -> &str;

    /// Start producing on a dedicated thread.
    fn start(self: Box<Self>, bridge: Bridge<UpdateCoordinator>) -> anyhow::Result<SourceHandle>;
}

/// A running source.
pub struct SourceHandle {
    name: String,
    stop: Arc<AtomicBool>,
    /// Unblocks the thread if it is parked in I/O.
    wake: Option<Box<dyn FnOnce() + Send>>,
    thread: Option<JoinHandle<()>>,
}

impl SourceHandle {
    /// Spawn `run` on a named thread. `run` should return soon after the
    /// stop flag is set.
    pub fn spawn<F>(name: impl Into<String>, run: F) -> std::io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name(format!("source-{}", name))
            .spawn(move || run(thread_stop))?;

        Ok(Self {
            name,
            stop,
            wake: None,
            thread: Some(thread),
        })
    }

    pub fn with_wake(mut self, wake: impl FnOnce() + Send + 'static) -> Self {
        self.wake = Some(Box::new(wake));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Stop the source and wait for its thread.
    pub fn shutdown(mut self) {
        info!("Stopping source {}", self.name);
        self.stop.store(true, Ordering::SeqCst);
        if let Some(wake) = self.wake.take() {
            wake();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Source {} thread panicked", self.name);
            }
        }
    }
}

/// Build and start every configured source. Sources that fail to build or
/// start are logged and skipped.
pub fn start_sources(config: &Config, bridge: &Bridge<UpdateCoordinator>) -> Vec<SourceHandle> {
    let ctx = SourceContext { config };
    let mut handles = Vec::new();

    for factory in REGISTRY {
        let source = match factory(&ctx) {
            Ok(Some(source)) => source,
            Ok(None) => continue,
            Err(e) => {
                error!("Failed to build push source: {:#}", e);
                continue;
            }
        };

        let name = source.name().to_string();
        match source.start(bridge.clone()) {
            Ok(handle) => {
                info!("Started push source {}", name);
                handles.push(handle);
            }
            Err(e) => error!("Failed to start push source {}: {:#}", name, e),
        }
    }

    if handles.is_empty() {
        warn!("No push sources running; appliances will never update");
    }
    handles
}

/// Hand a decoded message to the coordinator, waiting for queue space.
/// Returns false once the coordinator is gone.
pub(crate) fn forward(source: &str, bridge: &Bridge<UpdateCoordinator>, message: PushMessage) -> bool {
    match bridge.push_blocking(message) {
        Ok(()) => true,
        Err(e) => {
            error!("Source {}: coordinator unreachable, stopping: {}", source, e);
            false
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object of fields")]
    NotAnObject,

    #[error("topic '{0}' does not name an appliance")]
    Topic(String),
}

/// Decode a JSON object of fields for one appliance.
pub fn decode_fields(appliance_id: &str, payload: &[u8]) -> Result<PushMessage, DecodeError> {
    match serde_json::from_slice(payload)? {
        serde_json::Value::Object(fields) => Ok(PushMessage::from_fields(appliance_id, fields)),
        _ => Err(DecodeError::NotAnObject),
    }
}

/// One recorded update: `{"applianceId": "...", "fields": {...}}`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "applianceId", alias = "appliance_id")]
    appliance_id: String,

    #[serde(default)]
    fields: serde_json::Map<String, serde_json::Value>,
}

pub fn decode_envelope(line: &str) -> Result<PushMessage, DecodeError> {
    let envelope: Envelope = serde_json::from_str(line)?;
    Ok(PushMessage::from_fields(envelope.appliance_id, envelope.fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::AttributeValue;
    use crate::coordinator::ConnectionStatus;
    use crate::coordinator::channel;

    #[test]
    fn test_decode_fields_flattens() {
        let message = decode_fields(
            "wm-1",
            br#"{"temp": 40, "attributes": {"lastConnEvent": {"category": "DISCONNECTED"}}}"#,
        )
        .unwrap();

        assert_eq!(message.appliance_id(), "wm-1");
        assert_eq!(
            message.connection_status(),
            Some(ConnectionStatus::Disconnected)
        );
        assert_eq!(
            message.attributes().get("temp"),
            Some(&AttributeValue::Int(40))
        );
    }

    #[test]
    fn test_decode_fields_rejects_non_objects() {
        assert!(matches!(
            decode_fields("wm-1", b"[1, 2]"),
            Err(DecodeError::NotAnObject)
        ));
        assert!(matches!(
            decode_fields("wm-1", b"{not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_decode_envelope() {
        let message =
            decode_envelope(r#"{"applianceId": "ov-1", "fields": {"remoteCtrValid": 0}}"#).unwrap();
        assert_eq!(message.appliance_id(), "ov-1");
        assert_eq!(message.remote_control_valid(), Some(false));

        let message = decode_envelope(r#"{"appliance_id": "ov-1"}"#).unwrap();
        assert!(message.is_empty());

        assert!(decode_envelope(r#"{"fields": {}}"#).is_err());
    }

    #[test]
    fn test_forward_stops_when_closed() {
        let (bridge, mut rx) = channel::<UpdateCoordinator>(4);
        assert!(forward("test", &bridge, PushMessage::new("wm-1")));
        assert_eq!(rx.len(), 1);

        rx.close();
        assert!(!forward("test", &bridge, PushMessage::new("wm-1")));
    }

    #[test]
    fn test_handle_shutdown_stops_thread() {
        let handle = SourceHandle::spawn("idle", |stop| {
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        })
        .unwrap();
        assert_eq!(handle.name(), "idle");
        assert!(!handle.is_finished());
        handle.shutdown();
    }

    #[test]
    fn test_no_sources_configured() {
        let config = Config::default();
        let (bridge, _rx) = channel::<UpdateCoordinator>(4);
        assert!(start_sources(&config, &bridge).is_empty());
    }
}
