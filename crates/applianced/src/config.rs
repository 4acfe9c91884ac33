//! Configuration file parsing and structures.
//!
//! applianced reads one TOML file describing the coordinator, the push
//! sources feeding it, and the appliances and entities to expose.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;

use crate::entity::Capability;
use crate::entity::entity_id_for;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub api: Option<ApiConfig>,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub appliances: Vec<ApplianceConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"applianced::sources" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

#[derive(Debug, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_coordinator_name")]
    pub name: String,

    /// Bridge queue bound; producers block or fail once it is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: default_coordinator_name(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_coordinator_name() -> String {
    "applianced".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8565
}

#[derive(Debug, Default, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub mqtt: Option<MqttSourceConfig>,

    #[serde(default)]
    pub replay: Option<ReplaySourceConfig>,
}

/// MQTT broker delivering appliance updates on `{topic_prefix}/{id}/update`.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttSourceConfig {
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "applianced".to_string()
}

fn default_topic_prefix() -> String {
    "appliances".to_string()
}

/// JSON-lines file of recorded updates.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplaySourceConfig {
    pub path: PathBuf,

    /// Delay between records
    #[serde(default)]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplianceConfig {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityConfig {
    /// Snapshot attribute backing this entity
    pub key: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub capability: Capability,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        contents.parse()
    }

    /// Reject configurations that parse but cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "coordinator.queue_capacity must be at least 1".to_string(),
            ));
        }

        let mut appliance_ids = HashSet::new();
        let mut entity_ids = HashSet::new();
        for appliance in &self.appliances {
            if !appliance_ids.insert(appliance.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate appliance id '{}'",
                    appliance.id
                )));
            }

            let mut keys = HashSet::new();
            for entity in &appliance.entities {
                if !keys.insert(entity.key.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "appliance '{}': duplicate entity key '{}'",
                        appliance.id, entity.key
                    )));
                }
                validate_capability(&appliance.id, entity)?;

                let entity_id =
                    entity_id_for(entity.capability.kind(), &appliance.id, &entity.key);
                if !entity_ids.insert(entity_id.clone()) {
                    return Err(ConfigError::Invalid(format!(
                        "appliance '{}', entity '{}': entity id '{}' is already taken",
                        appliance.id, entity.key, entity_id
                    )));
                }
            }
        }

        Ok(())
    }
}

fn validate_capability(appliance_id: &str, entity: &EntityConfig) -> Result<(), ConfigError> {
    let problem = match &entity.capability {
        Capability::Select { options } if options.is_empty() => Some("select has no options"),
        Capability::Fan { speeds: 0 } => Some("fan needs at least one speed"),
        Capability::Number {
            min: Some(min),
            max: Some(max),
        } if min > max => Some("number has min greater than max"),
        _ => None,
    };

    match problem {
        Some(problem) => Err(ConfigError::Invalid(format!(
            "appliance '{}', entity '{}': {}",
            appliance_id, entity.key, problem
        ))),
        None => Ok(()),
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(ConfigError::Parse)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
