//! Push messages delivered by the backend.
//!
//! The backend sends flat field maps. A handful of field names carry the
//! connection and remote-control flags the coordinator cares about; every
//! other field is an appliance attribute.

use std::collections::BTreeMap;

use tracing::debug;

use super::snapshot::ApplianceId;
use super::snapshot::AttributeValue;
use super::snapshot::ConnectionStatus;

/// Field carrying the connection status (`"connected"`, `"disconnected"`, ...).
pub const CONNECTION_STATUS_FIELD: &str = "connectionStatus";

/// Vendor form of the connection status, as sent by the appliance cloud.
pub const LAST_CONN_EVENT_FIELD: &str = "attributes.lastConnEvent.category";

/// Field carrying the remote-control validity flag as a bool.
pub const REMOTE_CONTROL_FIELD: &str = "remoteControlValid";

/// Vendor form of the remote-control validity flag (`1` / `0`).
pub const REMOTE_CTR_VALID_FIELD: &str = "remoteCtrValid";

/// A single push notification for one appliance.
///
/// Built by value and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    appliance_id: ApplianceId,
    connection_status: Option<ConnectionStatus>,
    remote_control_valid: Option<bool>,
    attributes: BTreeMap<String, AttributeValue>,
}

impl PushMessage {
    pub fn new(appliance_id: impl Into<ApplianceId>) -> Self {
        Self {
            appliance_id: appliance_id.into(),
            connection_status: None,
            remote_control_valid: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_connection(mut self, status: ConnectionStatus) -> Self {
        self.connection_status = Some(status);
        self
    }

    pub fn with_remote_control(mut self, valid: bool) -> Self {
        self.remote_control_valid = Some(valid);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Build a message from a decoded JSON field map.
    ///
    /// Nested objects are flattened into dotted keys, which is how the vendor
    /// addresses nested attributes (`attributes.lastConnEvent.category`).
    /// Nulls, arrays and unparseable flag values are skipped.
    pub fn from_fields(
        appliance_id: impl Into<ApplianceId>,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let mut flat = BTreeMap::new();
        flatten_into(&mut flat, None, fields);

        let mut message = Self::new(appliance_id);
        for (key, value) in flat {
            match key.as_str() {
                CONNECTION_STATUS_FIELD | LAST_CONN_EVENT_FIELD => {
                    match parse_connection_status(&value) {
                        Some(status) => message.connection_status = Some(status),
                        None => debug!(
                            "Ignoring unrecognised connection status for {}: {}",
                            message.appliance_id, value
                        ),
                    }
                }
                REMOTE_CONTROL_FIELD | REMOTE_CTR_VALID_FIELD => match value.as_bool() {
                    Some(valid) => message.remote_control_valid = Some(valid),
                    None => debug!(
                        "Ignoring unrecognised remote control flag for {}: {}",
                        message.appliance_id, value
                    ),
                },
                _ => {
                    message.attributes.insert(key, value);
                }
            }
        }
        message
    }

    pub fn appliance_id(&self) -> &str {
        &self.appliance_id
    }

    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        self.connection_status
    }

    pub fn remote_control_valid(&self) -> Option<bool> {
        self.remote_control_valid
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    /// True if the message carries nothing at all.
    ///
    /// Empty messages still trigger a notification pass: the backend uses
    /// them to say "something changed, re-read everything".
    pub fn is_empty(&self) -> bool {
        self.connection_status.is_none()
            && self.remote_control_valid.is_none()
            && self.attributes.is_empty()
    }
}

fn parse_connection_status(value: &AttributeValue) -> Option<ConnectionStatus> {
    match value {
        AttributeValue::Bool(true) => Some(ConnectionStatus::Connected),
        AttributeValue::Bool(false) => Some(ConnectionStatus::Disconnected),
        AttributeValue::Text(s) => s.parse().ok(),
        _ => None,
    }
}

fn flatten_into(
    out: &mut BTreeMap<String, AttributeValue>,
    prefix: Option<&str>,
    fields: serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in fields {
        let key = match prefix {
            Some(prefix) => format!("{}.{}", prefix, key),
            None => key,
        };

        match value {
            serde_json::Value::Null => {}
            serde_json::Value::Bool(b) => {
                out.insert(key, AttributeValue::Bool(b));
            }
            serde_json::Value::Number(n) => {
                let value = match n.as_i64() {
                    Some(i) => AttributeValue::Int(i),
                    None => AttributeValue::Float(n.as_f64().unwrap_or(f64::NAN)),
                };
                out.insert(key, value);
            }
            serde_json::Value::String(s) => {
                out.insert(key, AttributeValue::Text(s));
            }
            serde_json::Value::Object(nested) => flatten_into(out, Some(&key), nested),
            serde_json::Value::Array(_) => {
                debug!("Skipping array-valued field {}", key);
            }
        }
    }
}
