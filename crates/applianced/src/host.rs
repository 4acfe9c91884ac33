//! Host rendering API and the in-process state store behind it.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use crate::coordinator::WriteError;
use crate::entity::RenderedValue;

/// Synchronous sink for entity state writes.
pub trait StateWriter: Send + Sync {
    /// Publish an entity's state. `value == None` leaves the previously
    /// published value in place and only updates availability.
    fn write_state(
        &self,
        entity_id: &str,
        value: Option<&RenderedValue>,
        available: bool,
    ) -> Result<(), WriteError>;
}

/// Published state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    pub value: Option<RenderedValue>,
    pub available: bool,
    pub updated_at: DateTime<Utc>,
}

/// Everything the host has been told so far.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostState {
    pub entities: BTreeMap<String, EntityState>,
}

/// Lock-free store of published entity states.
///
/// Writers copy-on-write a new snapshot with read-copy-update, so
/// concurrent writers never lose each other's entries. Readers load an `Arc`.
#[derive(Debug, Default)]
pub struct StateStore {
    state: ArcSwap<HostState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current published state. Clones the `Arc` only.
    pub fn snapshot(&self) -> Arc<HostState> {
        self.state.load_full()
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.state.load().entities.get(entity_id).cloned()
    }
}

impl StateWriter for StateStore {
    fn write_state(
        &self,
        entity_id: &str,
        value: Option<&RenderedValue>,
        available: bool,
    ) -> Result<(), WriteError> {
        let now = Utc::now();
        // The closure may rerun if another writer swapped in between.
        self.state.rcu(|current| {
            let mut state = HostState::clone(current);
            state
                .entities
                .entry(entity_id.to_string())
                .and_modify(|entry| {
                    if let Some(value) = value {
                        entry.value = Some(value.clone());
                    }
                    entry.available = available;
                    entry.updated_at = now;
                })
                .or_insert_with(|| EntityState {
                    value: value.cloned(),
                    available,
                    updated_at: now,
                });
            state
        });
        Ok(())
    }
}
