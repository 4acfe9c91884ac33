pub mod api;
pub mod availability;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod host;
pub mod sources;

pub use availability::AvailabilityResult;
pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use coordinator::Bridge;
pub use coordinator::BridgeError;
pub use coordinator::PushMessage;
pub use coordinator::UpdateCoordinator;
pub use entity::Capability;
pub use entity::Entity;
pub use host::StateStore;
pub use host::StateWriter;
