//! Entity abstraction for applianced
//!
//! One [`Entity`] per exposed appliance capability. All entities share the
//! availability policy and write suppression; the [`Capability`] decides how
//! the backing attribute is rendered.

mod capability;

pub use capability::Capability;
pub use capability::RenderedValue;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::availability::AvailabilityResult;
use crate::config::ApplianceConfig;
use crate::coordinator::ApplianceId;
use crate::coordinator::ApplianceSnapshot;
use crate::coordinator::CoordinatorError;
use crate::coordinator::Listener;
use crate::coordinator::ListenerError;
use crate::coordinator::ListenerId;
use crate::coordinator::UpdateContext;
use crate::coordinator::UpdateCoordinator;

/// A single appliance capability rendered to the host.
#[derive(Debug)]
pub struct Entity {
    entity_id: String,
    name: Option<String>,
    appliance_id: ApplianceId,
    key: String,
    capability: Capability,
    /// Last rendered value, kept while unavailable.
    rendered: Option<RenderedValue>,
    /// Availability last accepted by the host; `None` until the first
    /// successful write or after a failed one.
    published_available: Option<bool>,
    available: bool,
}

impl Entity {
    pub fn new(
        appliance_id: impl Into<ApplianceId>,
        key: impl Into<String>,
        capability: Capability,
    ) -> Self {
        let appliance_id = appliance_id.into();
        let key = key.into();
        Self {
            entity_id: entity_id_for(capability.kind(), &appliance_id, &key),
            name: None,
            appliance_id,
            key,
            capability,
            rendered: None,
            published_available: None,
            available: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Register with the coordinator for this entity's appliance.
    pub fn attach(self, coordinator: &mut UpdateCoordinator) -> Result<ListenerId, CoordinatorError> {
        let appliance_id = self.appliance_id.clone();
        coordinator.register_listener(appliance_id, Box::new(self))
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn appliance_id(&self) -> &str {
        &self.appliance_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn rendered(&self) -> Option<&RenderedValue> {
        self.rendered.as_ref()
    }

    /// Write to the host, retrying once. A second failure leaves the entity
    /// unavailable until its next update instead of propagating.
    fn publish(&mut self, ctx: &UpdateContext<'_>, with_value: bool, available: bool) {
        let value = if with_value {
            self.rendered.as_ref()
        } else {
            None
        };

        let result = ctx
            .write_state(&self.entity_id, value, available)
            .or_else(|e| {
                debug!("Write for {} failed ({}), retrying", self.entity_id, e);
                ctx.write_state(&self.entity_id, value, available)
            });

        match result {
            Ok(()) => {
                debug!(
                    "Entity {} wrote state: value={:?}, available={}",
                    self.entity_id, value, available
                );
                self.published_available = Some(available);
            }
            Err(e) => {
                warn!(
                    "Entity {} write failed after retry, unavailable until next update: {}",
                    self.entity_id, e
                );
                self.available = false;
                self.published_available = None;
            }
        }
    }

    fn mark_unavailable(&mut self, ctx: &UpdateContext<'_>) {
        self.available = false;
        if self.published_available != Some(false) {
            self.publish(ctx, false, false);
        }
    }

    fn render_from(&self, snapshot: &ApplianceSnapshot) -> Result<RenderedValue, ListenerError> {
        let value = snapshot
            .attribute(&self.key)
            .ok_or_else(|| ListenerError::MissingAttribute {
                key: self.key.clone(),
            })?;
        self.capability.render(&self.key, value)
    }
}

impl Listener for Entity {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn on_update(
        &mut self,
        snapshot: &ApplianceSnapshot,
        ctx: &mut UpdateContext<'_>,
    ) -> Result<(), ListenerError> {
        let guard = self.capability.guard(&self.key, snapshot);
        let availability = AvailabilityResult::evaluate(snapshot, guard);

        if !availability.available {
            debug!(
                "Entity {} not available: {}",
                self.entity_id,
                availability.reason().unwrap_or("unknown")
            );
            self.mark_unavailable(ctx);
            return Ok(());
        }

        let rendered = match self.render_from(snapshot) {
            Ok(rendered) => rendered,
            Err(e) => {
                // Last good value stays published, flagged unavailable.
                self.mark_unavailable(ctx);
                return Err(e);
            }
        };

        let changed = self.rendered.as_ref() != Some(&rendered);
        let transitioned = self.published_available != Some(true);
        self.rendered = Some(rendered);
        self.available = true;

        if changed || transitioned {
            self.publish(ctx, true, true);
        } else {
            debug!("Entity {} unchanged, skipping write", self.entity_id);
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

/// Host-facing entity id: `{kind}.{appliance}_{key}`, lowercased, with
/// anything but ASCII alphanumerics replaced by `_`.
pub fn entity_id_for(kind: &str, appliance_id: &str, key: &str) -> String {
    let slug: String = format!("{}_{}", appliance_id, key)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.{}", kind, slug)
}

/// Build and register every configured entity.
pub fn attach_entities(
    coordinator: &mut UpdateCoordinator,
    appliances: &[ApplianceConfig],
) -> Result<Vec<ListenerId>, CoordinatorError> {
    let mut ids = Vec::new();
    for appliance in appliances {
        for config in &appliance.entities {
            let mut entity = Entity::new(&appliance.id, &config.key, config.capability.clone());
            if let Some(name) = &config.name {
                entity = entity.with_name(name);
            }
            debug!(
                "Attaching entity {} to appliance {}",
                entity.entity_id, appliance.id
            );
            ids.push(entity.attach(coordinator)?);
        }
    }
    info!(
        "Update subscription established for {} entities across {} appliances",
        ids.len(),
        appliances.len()
    );
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;
    use crate::config::EntityConfig;
    use crate::coordinator::ConnectionStatus;
    use crate::coordinator::PushMessage;
    use crate::coordinator::WriteError;
    use crate::host::StateWriter;

    type Write = (String, Option<RenderedValue>, bool);

    /// Records writes; fails the next `fail_next` of them.
    #[derive(Default)]
    struct RecordingWriter {
        writes: Mutex<Vec<Write>>,
        fail_next: Mutex<usize>,
    }

    impl RecordingWriter {
        fn writes(&self) -> Vec<Write> {
            self.writes.lock().unwrap().clone()
        }

        fn fail(&self, n: usize) {
            *self.fail_next.lock().unwrap() = n;
        }
    }

    impl StateWriter for RecordingWriter {
        fn write_state(
            &self,
            entity_id: &str,
            value: Option<&RenderedValue>,
            available: bool,
        ) -> Result<(), WriteError> {
            let mut fail_next = self.fail_next.lock().unwrap();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(WriteError {
                    entity_id: entity_id.to_string(),
                    reason: "host busy".to_string(),
                });
            }
            self.writes
                .lock()
                .unwrap()
                .push((entity_id.to_string(), value.cloned(), available));
            Ok(())
        }
    }

    fn setup(capability: Capability) -> (UpdateCoordinator, Arc<RecordingWriter>, ListenerId) {
        let writer = Arc::new(RecordingWriter::default());
        let mut coordinator = UpdateCoordinator::new("test", writer.clone());
        let id = Entity::new("wm-1", "temp", capability)
            .attach(&mut coordinator)
            .unwrap();
        (coordinator, writer, id)
    }

    fn connected() -> PushMessage {
        PushMessage::new("wm-1")
            .with_connection(ConnectionStatus::Connected)
            .with_remote_control(true)
    }

    #[test]
    fn test_attach_refuses_colliding_entity_ids() {
        let writer = Arc::new(RecordingWriter::default());
        let mut coordinator = UpdateCoordinator::new("test", writer);
        let appliance = |id: &str| ApplianceConfig {
            id: id.to_string(),
            name: None,
            entities: vec![EntityConfig {
                key: "temp".to_string(),
                name: None,
                capability: Capability::Climate,
            }],
        };

        let result = attach_entities(&mut coordinator, &[appliance("wm-1"), appliance("wm_1")]);
        assert_eq!(
            result,
            Err(CoordinatorError::DuplicateEntity("climate.wm_1_temp".to_string()))
        );
        assert_eq!(coordinator.listener_count("wm-1"), 1);
        assert_eq!(coordinator.listener_count("wm_1"), 0);
    }

    #[test]
    fn test_entity_id_for() {
        assert_eq!(entity_id_for("sensor", "wm-1", "temp"), "sensor.wm_1_temp");
        assert_eq!(
            entity_id_for("switch", "WM 1", "startProgram.prewash"),
            "switch.wm_1_startprogram_prewash"
        );
    }

    #[test]
    fn test_writes_only_on_change() {
        let (mut coordinator, writer, _) = setup(Capability::Climate);

        coordinator.ingest(connected().with_attribute("temp", 20)).unwrap();
        coordinator.ingest(connected().with_attribute("temp", 20)).unwrap();
        coordinator.ingest(connected().with_attribute("temp", 21)).unwrap();

        assert_eq!(
            writer.writes(),
            vec![
                ("climate.wm_1_temp".to_string(), Some(RenderedValue::Number(20.0)), true),
                ("climate.wm_1_temp".to_string(), Some(RenderedValue::Number(21.0)), true),
            ]
        );
    }

    #[test]
    fn test_unavailable_keeps_rendered_value() {
        let (mut coordinator, writer, id) = setup(Capability::Climate);

        coordinator.ingest(connected().with_attribute("temp", 21)).unwrap();
        coordinator
            .ingest(PushMessage::new("wm-1").with_connection(ConnectionStatus::Disconnected))
            .unwrap();
        coordinator
            .ingest(PushMessage::new("wm-1").with_connection(ConnectionStatus::Disconnected))
            .unwrap();

        let writes = writer.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1], ("climate.wm_1_temp".to_string(), None, false));
        assert!(!coordinator.listener(id).unwrap().is_available());

        // Reconnecting republishes the retained value.
        coordinator.ingest(connected()).unwrap();
        let writes = writer.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(
            writes[2],
            ("climate.wm_1_temp".to_string(), Some(RenderedValue::Number(21.0)), true)
        );
    }

    #[test]
    fn test_remote_control_lockout_makes_unavailable() {
        let (mut coordinator, writer, id) = setup(Capability::Switch);

        coordinator
            .ingest(connected().with_remote_control(false).with_attribute("temp", 1))
            .unwrap();

        assert_eq!(
            writer.writes(),
            vec![("switch.wm_1_temp".to_string(), None, false)]
        );
        assert!(!coordinator.listener(id).unwrap().is_available());
    }

    #[test]
    fn test_missing_attribute_is_unavailable() {
        let (mut coordinator, writer, _) = setup(Capability::Climate);

        coordinator.ingest(connected().with_attribute("spin", 800)).unwrap();
        assert_eq!(
            writer.writes(),
            vec![("climate.wm_1_temp".to_string(), None, false)]
        );
    }

    #[test]
    fn test_write_retried_once() {
        let (mut coordinator, writer, id) = setup(Capability::Climate);
        writer.fail(1);

        coordinator.ingest(connected().with_attribute("temp", 20)).unwrap();
        assert_eq!(writer.writes().len(), 1);
        assert!(coordinator.listener(id).unwrap().is_available());
    }

    #[test]
    fn test_write_failure_is_contained() {
        let (mut coordinator, writer, id) = setup(Capability::Climate);
        writer.fail(2);

        let report = coordinator
            .ingest(connected().with_attribute("temp", 20))
            .unwrap();
        assert!(report.notify.failures.is_empty());
        assert!(writer.writes().is_empty());
        assert!(!coordinator.listener(id).unwrap().is_available());

        // The next update writes again even though the value is unchanged.
        coordinator.ingest(connected().with_attribute("temp", 20)).unwrap();
        assert_eq!(writer.writes().len(), 1);
        assert!(coordinator.listener(id).unwrap().is_available());
    }

    #[test]
    fn test_render_error_is_reported() {
        let (mut coordinator, writer, id) = setup(Capability::Climate);

        let report = coordinator
            .ingest(connected().with_attribute("temp", "warm"))
            .unwrap();
        assert_eq!(report.notify.failures.len(), 1);
        assert_eq!(report.notify.failures[0].entity_id, "climate.wm_1_temp");
        assert_eq!(
            writer.writes(),
            vec![("climate.wm_1_temp".to_string(), None, false)]
        );
        assert!(!coordinator.listener(id).unwrap().is_available());
    }

    #[test]
    fn test_render_error_keeps_last_value_until_next_update() {
        let (mut coordinator, writer, id) = setup(Capability::Climate);

        coordinator.ingest(connected().with_attribute("temp", 40)).unwrap();
        coordinator
            .ingest(connected().with_attribute("temp", "warm"))
            .unwrap();
        // Still broken: already published as unavailable.
        coordinator
            .ingest(connected().with_attribute("temp", "hot"))
            .unwrap();
        assert!(!coordinator.listener(id).unwrap().is_available());

        coordinator.ingest(connected().with_attribute("temp", 45)).unwrap();
        assert!(coordinator.listener(id).unwrap().is_available());
        assert_eq!(
            writer.writes(),
            vec![
                ("climate.wm_1_temp".to_string(), Some(RenderedValue::Number(40.0)), true),
                ("climate.wm_1_temp".to_string(), None, false),
                ("climate.wm_1_temp".to_string(), Some(RenderedValue::Number(45.0)), true),
            ]
        );
    }
}
