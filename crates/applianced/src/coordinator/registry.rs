use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;

use tracing::debug;

use super::error::CoordinatorError;
use super::error::ListenerError;
use super::error::WriteError;
use super::snapshot::ApplianceId;
use super::snapshot::ApplianceSnapshot;
use crate::entity::RenderedValue;
use crate::host::StateWriter;

/// Handle identifying one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Something that wants to hear about snapshot changes for one appliance.
pub trait Listener: Send {
    /// Host-facing id of the entity behind this listener.
    fn entity_id(&self) -> &str;

    /// Called once per notification pass with the current snapshot.
    ///
    /// The snapshot is only borrowed for the duration of the call.
    fn on_update(
        &mut self,
        snapshot: &ApplianceSnapshot,
        ctx: &mut UpdateContext<'_>,
    ) -> Result<(), ListenerError>;

    /// Whether the listener currently considers its value publishable.
    fn is_available(&self) -> bool;
}

struct Slot {
    appliance_id: ApplianceId,
    entity_id: String,
    /// `None` while the listener is checked out for its update hook.
    listener: Option<Box<dyn Listener>>,
}

/// Listener registry owned by the coordinator.
#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    by_appliance: HashMap<ApplianceId, Vec<ListenerId>>,
    slots: HashMap<ListenerId, Slot>,
    closed_appliances: HashSet<ApplianceId>,
    closed: bool,
}

impl Registry {
    pub(crate) fn insert(
        &mut self,
        appliance_id: ApplianceId,
        listener: Box<dyn Listener>,
    ) -> Result<ListenerId, CoordinatorError> {
        if self.closed {
            return Err(CoordinatorError::Closed);
        }
        if self.closed_appliances.contains(&appliance_id) {
            return Err(CoordinatorError::ApplianceClosed(appliance_id));
        }

        let entity_id = listener.entity_id().to_string();
        if self.slots.values().any(|slot| slot.entity_id == entity_id) {
            return Err(CoordinatorError::DuplicateEntity(entity_id));
        }

        self.next_id += 1;
        let id = ListenerId(self.next_id);
        debug!("Registered {} ({}) for appliance {}", id, entity_id, appliance_id);

        self.by_appliance
            .entry(appliance_id.clone())
            .or_default()
            .push(id);
        self.slots.insert(
            id,
            Slot {
                appliance_id,
                entity_id,
                listener: Some(listener),
            },
        );
        Ok(id)
    }

    /// Remove a registration.
    ///
    /// Returns `Some(Some(listener))` if it was registered and idle,
    /// `Some(None)` if it was registered but is currently running its hook
    /// (the notification pass drops it when the hook returns), and `None`
    /// if the id is unknown.
    pub(crate) fn remove(&mut self, id: ListenerId) -> Option<Option<Box<dyn Listener>>> {
        let slot = self.slots.remove(&id)?;
        if let Some(ids) = self.by_appliance.get_mut(&slot.appliance_id) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_appliance.remove(&slot.appliance_id);
            }
        }
        debug!(
            "Deregistered {} ({}) from appliance {}",
            id, slot.entity_id, slot.appliance_id
        );
        Some(slot.listener)
    }

    /// Remove every registration for one appliance and refuse new ones.
    pub(crate) fn close_appliance(&mut self, appliance_id: &str) -> usize {
        self.closed_appliances.insert(appliance_id.to_string());
        let ids = self.by_appliance.remove(appliance_id).unwrap_or_default();
        for id in &ids {
            self.slots.remove(id);
        }
        ids.len()
    }

    /// Remove every registration and refuse new ones.
    pub(crate) fn close(&mut self) -> usize {
        self.closed = true;
        let count = self.slots.len();
        self.slots.clear();
        self.by_appliance.clear();
        count
    }

    /// Point-in-time copy of the listener ids for one appliance.
    pub(crate) fn ids_for(&self, appliance_id: &str) -> Vec<ListenerId> {
        self.by_appliance
            .get(appliance_id)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn count_for(&self, appliance_id: &str) -> usize {
        self.by_appliance.get(appliance_id).map_or(0, Vec::len)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn entity_id(&self, id: ListenerId) -> Option<&str> {
        self.slots.get(&id).map(|slot| slot.entity_id.as_str())
    }

    pub(crate) fn get(&self, id: ListenerId) -> Option<&dyn Listener> {
        self.slots.get(&id)?.listener.as_deref()
    }

    /// Take a live listener out for its hook.
    pub(crate) fn checkout(&mut self, id: ListenerId) -> Option<Box<dyn Listener>> {
        self.slots.get_mut(&id)?.listener.take()
    }

    /// Return a listener after its hook. Hands it back if the registration
    /// was removed in the meantime, so the caller can drop it.
    pub(crate) fn checkin(
        &mut self,
        id: ListenerId,
        listener: Box<dyn Listener>,
    ) -> Option<Box<dyn Listener>> {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.listener = Some(listener);
                None
            }
            None => Some(listener),
        }
    }
}

/// What a listener may touch while its hook runs.
pub struct UpdateContext<'a> {
    listener_id: ListenerId,
    registry: &'a mut Registry,
    writer: &'a dyn StateWriter,
}

impl<'a> UpdateContext<'a> {
    pub(crate) fn new(
        listener_id: ListenerId,
        registry: &'a mut Registry,
        writer: &'a dyn StateWriter,
    ) -> Self {
        Self {
            listener_id,
            registry,
            writer,
        }
    }

    /// Id of the listener whose hook is running.
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    /// Forward a state write to the host rendering API.
    pub fn write_state(
        &self,
        entity_id: &str,
        value: Option<&RenderedValue>,
        available: bool,
    ) -> Result<(), WriteError> {
        self.writer.write_state(entity_id, value, available)
    }

    /// Register another listener. It is not notified in the running pass.
    pub fn register(
        &mut self,
        appliance_id: impl Into<ApplianceId>,
        listener: Box<dyn Listener>,
    ) -> Result<ListenerId, CoordinatorError> {
        self.registry.insert(appliance_id.into(), listener)
    }

    /// Deregister a listener. If it has not been visited yet in the running
    /// pass it is skipped. Returns whether the id was registered.
    pub fn deregister(&mut self, id: ListenerId) -> bool {
        self.registry.remove(id).is_some()
    }

    /// Deregister the listener whose hook is running; it is dropped when the
    /// hook returns.
    pub fn deregister_self(&mut self) -> bool {
        let id = self.listener_id;
        self.deregister(id)
    }
}
