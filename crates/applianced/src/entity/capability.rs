use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::coordinator::ApplianceSnapshot;
use crate::coordinator::AttributeValue;
use crate::coordinator::ListenerError;

/// A value in the representation the host expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RenderedValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for RenderedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderedValue::Bool(true) => f.write_str("on"),
            RenderedValue::Bool(false) => f.write_str("off"),
            RenderedValue::Number(n) => write!(f, "{}", n),
            RenderedValue::Text(s) => f.write_str(s),
        }
    }
}

/// What an entity exposes, and how its attribute is rendered.
///
/// Every kind shares the availability and write-suppression behaviour of
/// [`super::Entity`]; kinds only differ in [`Capability::render`] and
/// [`Capability::guard`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    Sensor {
        #[serde(default)]
        unit: Option<String>,
    },
    Switch,
    Climate,
    /// Fan speed, reported as a level out of `speeds`.
    Fan {
        speeds: u32,
    },
    Light,
    Lock,
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Select {
        options: Vec<String>,
    },
}

impl Capability {
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// Entity-specific part of the availability policy.
    pub fn guard(&self, key: &str, snapshot: &ApplianceSnapshot) -> bool {
        let Some(value) = snapshot.attribute(key) else {
            return false;
        };

        match self {
            Capability::Number { min, max } => match value.as_f64() {
                Some(v) => min.is_none_or(|min| v >= min) && max.is_none_or(|max| v <= max),
                None => false,
            },
            Capability::Select { options } => options.len() >= 2,
            _ => true,
        }
    }

    /// Render an attribute value for the host.
    pub fn render(&self, key: &str, value: &AttributeValue) -> Result<RenderedValue, ListenerError> {
        let mismatch = |expected: &str| ListenerError::Render {
            key: key.to_string(),
            reason: format!("expected {}, got {} '{}'", expected, value.type_name(), value),
        };

        match self {
            Capability::Sensor { .. } => Ok(match value {
                AttributeValue::Bool(b) => RenderedValue::Bool(*b),
                AttributeValue::Int(i) => RenderedValue::Number(*i as f64),
                AttributeValue::Float(f) => RenderedValue::Number(*f),
                AttributeValue::Text(s) => RenderedValue::Text(s.clone()),
            }),
            Capability::Switch | Capability::Light => value
                .as_bool()
                .map(RenderedValue::Bool)
                .ok_or_else(|| mismatch("an on/off value")),
            Capability::Climate | Capability::Number { .. } => value
                .as_f64()
                .map(RenderedValue::Number)
                .ok_or_else(|| mismatch("a number")),
            Capability::Fan { speeds } => {
                let level = value.as_f64().ok_or_else(|| mismatch("a speed level"))?;
                if *speeds == 0 {
                    return Err(mismatch("a fan with at least one speed"));
                }
                let percentage = (level / f64::from(*speeds) * 100.0).round().clamp(0.0, 100.0);
                Ok(RenderedValue::Number(percentage))
            }
            Capability::Lock => value
                .as_bool()
                .map(|locked| {
                    RenderedValue::Text(if locked { "locked" } else { "unlocked" }.to_string())
                })
                .ok_or_else(|| mismatch("a lock state")),
            Capability::Select { options } => match value {
                AttributeValue::Text(s) if options.contains(s) => Ok(RenderedValue::Text(s.clone())),
                AttributeValue::Int(i) => usize::try_from(*i)
                    .ok()
                    .and_then(|i| options.get(i))
                    .map(|option| RenderedValue::Text(option.clone()))
                    .ok_or_else(|| mismatch("an option index")),
                _ => Err(mismatch("one of the configured options")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ConnectionStatus;

    fn snapshot_with(key: &str, value: impl Into<AttributeValue>) -> ApplianceSnapshot {
        let mut snapshot = ApplianceSnapshot::empty("wm-1");
        snapshot.connection_status = ConnectionStatus::Connected;
        snapshot.attributes.insert(key.to_string(), value.into());
        snapshot
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Capability::Sensor { unit: None }.kind(), "sensor");
        assert_eq!(Capability::Fan { speeds: 3 }.kind(), "fan");
        assert_eq!(Capability::Select { options: vec![] }.kind(), "select");
    }

    #[test]
    fn test_default_guard_needs_key() {
        let snapshot = snapshot_with("temp", 20);
        assert!(Capability::Climate.guard("temp", &snapshot));
        assert!(!Capability::Climate.guard("spin", &snapshot));
    }

    #[test]
    fn test_number_guard_checks_range() {
        let number = Capability::Number {
            min: Some(0.0),
            max: Some(10.0),
        };
        assert!(number.guard("delay", &snapshot_with("delay", 4)));
        assert!(!number.guard("delay", &snapshot_with("delay", 12)));
        assert!(!number.guard("delay", &snapshot_with("delay", "soon")));
    }

    #[test]
    fn test_select_guard_needs_two_options() {
        let snapshot = snapshot_with("program", "eco");
        let single = Capability::Select {
            options: vec!["eco".to_string()],
        };
        let pair = Capability::Select {
            options: vec!["eco".to_string(), "cotton".to_string()],
        };
        assert!(!single.guard("program", &snapshot));
        assert!(pair.guard("program", &snapshot));
    }

    #[test]
    fn test_render_kinds() {
        let cases = [
            (Capability::Sensor { unit: None }, AttributeValue::Int(20), "20"),
            (Capability::Switch, AttributeValue::Int(1), "on"),
            (Capability::Light, AttributeValue::from("0"), "off"),
            (Capability::Climate, AttributeValue::from("21.5"), "21.5"),
            (Capability::Fan { speeds: 3 }, AttributeValue::Int(2), "67"),
            (Capability::Lock, AttributeValue::Bool(true), "locked"),
            (
                Capability::Number { min: None, max: None },
                AttributeValue::Float(2.5),
                "2.5",
            ),
            (
                Capability::Select {
                    options: vec!["eco".to_string(), "cotton".to_string()],
                },
                AttributeValue::Int(1),
                "cotton",
            ),
        ];

        let rendered: Vec<String> = cases
            .iter()
            .map(|(capability, value, _)| capability.render("k", value).unwrap().to_string())
            .collect();
        let expected: Vec<&str> = cases.iter().map(|(_, _, e)| *e).collect();
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_render_mismatch() {
        let err = Capability::Switch
            .render("active", &AttributeValue::from("maybe"))
            .unwrap_err();
        insta::assert_snapshot!(err, @"cannot render attribute 'active': expected an on/off value, got text 'maybe'");

        let select = Capability::Select {
            options: vec!["eco".to_string(), "cotton".to_string()],
        };
        assert!(select.render("program", &AttributeValue::from("wool")).is_err());
        assert!(select.render("program", &AttributeValue::Int(5)).is_err());
        assert!(select.render("program", &AttributeValue::Int(-1)).is_err());
    }

    #[test]
    fn test_deserialize_tagged() {
        let capability: Capability = toml::from_str(
            r#"
            kind = "select"
            options = ["eco", "cotton"]
            "#,
        )
        .unwrap();
        assert_eq!(
            capability,
            Capability::Select {
                options: vec!["eco".to_string(), "cotton".to_string()]
            }
        );

        let capability: Capability = toml::from_str(r#"kind = "switch""#).unwrap();
        assert_eq!(capability, Capability::Switch);
    }
}
