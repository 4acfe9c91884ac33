use std::collections::BTreeMap;
use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Identifier of an appliance as reported by the backend.
pub type ApplianceId = String;

/// Connection state of an appliance as seen by the backend.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    #[default]
    Unknown,
}

/// A typed attribute value carried in push messages and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    /// Numeric view of the value. Text is parsed, since the backend sends
    /// many numeric settings as strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Bool(_) => None,
            AttributeValue::Int(i) => Some(*i as f64),
            AttributeValue::Float(f) => Some(*f),
            AttributeValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Boolean view of the value: `1`, `true`, `"1"`, `"on"` and `"true"` are on.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            AttributeValue::Int(i) => Some(*i != 0),
            AttributeValue::Float(f) => Some(*f != 0.0),
            AttributeValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "on" | "true" => Some(true),
                "0" | "off" | "false" => Some(false),
                _ => None,
            },
        }
    }

    /// Name of the variant, used in render errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Int(_) => "int",
            AttributeValue::Float(_) => "float",
            AttributeValue::Text(_) => "text",
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Int(i64::from(v))
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

/// The coordinator's authoritative view of one appliance.
///
/// Snapshots are only ever replaced as a whole: the coordinator builds the
/// next snapshot from a clone of the current one and swaps it in before any
/// listener runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplianceSnapshot {
    pub appliance_id: ApplianceId,
    pub connection_status: ConnectionStatus,
    pub remote_control_valid: bool,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl ApplianceSnapshot {
    /// An empty snapshot for an appliance that has not reported yet.
    ///
    /// Remote control defaults to valid: the backend omits the flag for
    /// appliances that have no remote-control lockout.
    pub fn empty(appliance_id: impl Into<ApplianceId>) -> Self {
        Self {
            appliance_id: appliance_id.into(),
            connection_status: ConnectionStatus::Unknown,
            remote_control_valid: true,
            attributes: BTreeMap::new(),
            last_updated_at: None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_status_parses_case_insensitively() {
        assert_eq!(
            "CONNECTED".parse::<ConnectionStatus>().unwrap(),
            ConnectionStatus::Connected
        );
        assert_eq!(
            "Disconnected".parse::<ConnectionStatus>().unwrap(),
            ConnectionStatus::Disconnected
        );
        assert!("flaky".parse::<ConnectionStatus>().is_err());
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
    }

    #[test]
    fn test_attribute_views() {
        assert_eq!(AttributeValue::from("21.5").as_f64(), Some(21.5));
        assert_eq!(AttributeValue::from(3).as_f64(), Some(3.0));
        assert_eq!(AttributeValue::from(true).as_f64(), None);

        assert_eq!(AttributeValue::from(1).as_bool(), Some(true));
        assert_eq!(AttributeValue::from("ON").as_bool(), Some(true));
        assert_eq!(AttributeValue::from("0").as_bool(), Some(false));
        assert_eq!(AttributeValue::from("maybe").as_bool(), None);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = ApplianceSnapshot::empty("wm-1");
        assert_eq!(snapshot.connection_status, ConnectionStatus::Unknown);
        assert!(snapshot.remote_control_valid);
        assert!(!snapshot.is_connected());
        assert!(snapshot.last_updated_at.is_none());
    }
}
