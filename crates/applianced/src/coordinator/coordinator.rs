use std::any::Any;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::bridge::Bridge;
use super::bridge::BridgeReceiver;
use super::error::BridgeError;
use super::error::CoordinatorError;
use super::error::FailureKind;
use super::error::ListenerFailure;
use super::message::PushMessage;
use super::registry::Listener;
use super::registry::ListenerId;
use super::registry::Registry;
use super::registry::UpdateContext;
use super::snapshot::ApplianceId;
use super::snapshot::ApplianceSnapshot;
use super::snapshot::AttributeValue;
use super::snapshot::ConnectionStatus;
use crate::host::StateWriter;

/// Per-appliance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Lifecycle {
    /// Known (a listener registered) but no snapshot ingested yet.
    Uninitialized,
    Active,
    /// Disconnected: listeners are still notified, attributes are frozen.
    Suspended,
    Closed,
}

struct ApplianceSlot {
    snapshot: Arc<ApplianceSnapshot>,
    lifecycle: Lifecycle,
    /// Attribute updates that arrived while suspended, applied on resume.
    held: BTreeMap<String, AttributeValue>,
}

impl ApplianceSlot {
    fn new(appliance_id: &str) -> Self {
        Self {
            snapshot: Arc::new(ApplianceSnapshot::empty(appliance_id)),
            lifecycle: Lifecycle::Uninitialized,
            held: BTreeMap::new(),
        }
    }
}

/// Result of one notification pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifyReport {
    pub appliance_id: ApplianceId,
    /// Hooks invoked, failed ones included.
    pub notified: usize,
    /// Listeners deregistered during the pass before they were visited.
    pub skipped: usize,
    pub failures: Vec<ListenerFailure>,
}

/// Result of one ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub lifecycle: Lifecycle,
    /// Existing attributes whose value changed.
    pub changed: Vec<String>,
    /// Attributes the snapshot did not have before.
    pub new_fields: Vec<String>,
    /// Attribute updates held back because the appliance is suspended.
    pub held_back: usize,
    pub notify: NotifyReport,
}

/// Serializable per-appliance summary for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ApplianceOverview {
    pub appliance_id: ApplianceId,
    pub lifecycle: Lifecycle,
    pub listeners: usize,
    pub connection_status: ConnectionStatus,
    pub remote_control_valid: bool,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub last_updated_at: Option<chrono::DateTime<Utc>>,
}

/// Fans appliance snapshots out to registered listeners.
///
/// One instance per monitored account. All methods run on the single task
/// that owns the coordinator; other threads reach it through a
/// [`Bridge`].
pub struct UpdateCoordinator {
    name: String,
    appliances: HashMap<ApplianceId, ApplianceSlot>,
    registry: Registry,
    writer: Arc<dyn StateWriter>,
    closed: bool,
}

impl UpdateCoordinator {
    pub fn new(name: impl Into<String>, writer: Arc<dyn StateWriter>) -> Self {
        let name = name.into();
        info!("Initialized update coordinator: {}", name);
        Self {
            name,
            appliances: HashMap::new(),
            registry: Registry::default(),
            writer,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Register a listener for an appliance.
    ///
    /// The listener hears about the next ingestion; it is not replayed the
    /// current snapshot.
    pub fn register_listener(
        &mut self,
        appliance_id: impl Into<ApplianceId>,
        listener: Box<dyn Listener>,
    ) -> Result<ListenerId, CoordinatorError> {
        let appliance_id = appliance_id.into();
        let id = self.registry.insert(appliance_id.clone(), listener)?;
        self.appliances
            .entry(appliance_id)
            .or_insert_with_key(|id| ApplianceSlot::new(id));
        Ok(id)
    }

    /// Remove a registration and hand the listener back for teardown.
    pub fn deregister_listener(&mut self, id: ListenerId) -> Option<Box<dyn Listener>> {
        self.registry.remove(id).flatten()
    }

    /// Merge a push message into its appliance's snapshot and notify
    /// listeners.
    ///
    /// Fields merge last-write-wins. While the appliance is disconnected the
    /// flags are applied but attribute updates are held back and merged on
    /// reconnection, so listeners keep seeing the last connected values.
    pub fn ingest(&mut self, message: PushMessage) -> Result<IngestReport, CoordinatorError> {
        if self.closed {
            return Err(CoordinatorError::Closed);
        }

        let appliance_id = message.appliance_id().to_string();
        debug!(
            "Coordinator {} received update for {}: {:?}",
            self.name, appliance_id, message
        );

        let slot = self
            .appliances
            .entry(appliance_id.clone())
            .or_insert_with_key(|id| ApplianceSlot::new(id));
        if slot.lifecycle == Lifecycle::Closed {
            return Err(CoordinatorError::ApplianceClosed(appliance_id));
        }

        let mut next = ApplianceSnapshot::clone(&slot.snapshot);
        if let Some(status) = message.connection_status() {
            next.connection_status = status;
        }
        if let Some(valid) = message.remote_control_valid() {
            next.remote_control_valid = valid;
        }

        // Only an explicit Connected resumes a suspended appliance.
        let suspended = match next.connection_status {
            ConnectionStatus::Connected => false,
            ConnectionStatus::Disconnected => true,
            ConnectionStatus::Unknown => slot.lifecycle == Lifecycle::Suspended,
        };
        let mut changed = Vec::new();
        let mut new_fields = Vec::new();
        let mut held_back = 0;

        if suspended {
            held_back = message.attributes().len();
            slot.held.extend(
                message
                    .attributes()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        } else {
            let mut incoming = std::mem::take(&mut slot.held);
            incoming.extend(
                message
                    .attributes()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            for (key, value) in incoming {
                match next.attributes.insert(key.clone(), value.clone()) {
                    None => new_fields.push(key),
                    Some(old) if old != value => changed.push(key),
                    Some(_) => {}
                }
            }
        }
        next.last_updated_at = Some(Utc::now());

        let previous = slot.lifecycle;
        let lifecycle = if suspended {
            Lifecycle::Suspended
        } else {
            Lifecycle::Active
        };
        if previous != lifecycle {
            info!(
                "Appliance {} on {}: {} -> {}",
                appliance_id, self.name, previous, lifecycle
            );
        }
        if previous != Lifecycle::Uninitialized && !new_fields.is_empty() {
            debug!(
                "Partial snapshot for {}: fields {:?} were not initialised before",
                appliance_id, new_fields
            );
        }
        if held_back > 0 {
            debug!(
                "Appliance {} is disconnected, holding back {} attribute update(s)",
                appliance_id, held_back
            );
        }

        slot.snapshot = Arc::new(next);
        slot.lifecycle = lifecycle;
        debug!(
            "Update applied for {}: {} changed, {} new",
            appliance_id,
            changed.len(),
            new_fields.len()
        );

        let notify = self.notify_listeners(&appliance_id)?;
        Ok(IngestReport {
            lifecycle,
            changed,
            new_fields,
            held_back,
            notify,
        })
    }

    /// Run one notification pass for an appliance.
    ///
    /// The listener set is copied up front: listeners registered during the
    /// pass wait for the next one, and each listener's registration is
    /// re-checked immediately before its hook runs. A failing or panicking
    /// hook is recorded and the pass continues.
    pub fn notify_listeners(&mut self, appliance_id: &str) -> Result<NotifyReport, CoordinatorError> {
        if self.closed {
            return Err(CoordinatorError::Closed);
        }

        let mut report = NotifyReport {
            appliance_id: appliance_id.to_string(),
            ..NotifyReport::default()
        };

        let snapshot = match self.appliances.get(appliance_id) {
            Some(slot) if slot.lifecycle == Lifecycle::Closed => {
                return Err(CoordinatorError::ApplianceClosed(appliance_id.to_string()));
            }
            Some(slot) if slot.lifecycle != Lifecycle::Uninitialized => Arc::clone(&slot.snapshot),
            _ => {
                debug!("No snapshot for {} yet, nothing to notify", appliance_id);
                return Ok(report);
            }
        };

        let ids = self.registry.ids_for(appliance_id);
        debug!(
            "Coordinator {} notifying {} listener(s) for {}",
            self.name,
            ids.len(),
            appliance_id
        );

        for id in ids {
            let Some(mut listener) = self.registry.checkout(id) else {
                report.skipped += 1;
                continue;
            };

            let outcome = {
                let mut ctx = UpdateContext::new(id, &mut self.registry, self.writer.as_ref());
                std::panic::catch_unwind(AssertUnwindSafe(|| {
                    listener.on_update(&snapshot, &mut ctx)
                }))
            };
            report.notified += 1;

            let kind = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(FailureKind::Error(e)),
                Err(payload) => Some(FailureKind::Panicked(panic_message(payload.as_ref()))),
            };
            if let Some(kind) = kind {
                let failure = ListenerFailure {
                    listener_id: id,
                    entity_id: listener.entity_id().to_string(),
                    kind,
                };
                warn!("Listener failed during update of {}: {}", appliance_id, failure);
                report.failures.push(failure);
            }

            if let Some(stale) = self.registry.checkin(id, listener) {
                debug!(
                    "Dropping {} ({}), deregistered during its own update",
                    id,
                    stale.entity_id()
                );
            }
        }

        Ok(report)
    }

    /// Re-notify every appliance that has a snapshot, without merging data.
    pub fn refresh_all(&mut self) -> Result<Vec<NotifyReport>, CoordinatorError> {
        if self.closed {
            return Err(CoordinatorError::Closed);
        }

        let mut ids: Vec<ApplianceId> = self
            .appliances
            .iter()
            .filter(|(_, slot)| {
                matches!(slot.lifecycle, Lifecycle::Active | Lifecycle::Suspended)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();

        ids.iter()
            .map(|id| self.notify_listeners(id))
            .collect()
    }

    /// Tear down one appliance: deregister its listeners and reject further
    /// ingestion for it. Returns the number of listeners removed.
    pub fn close_appliance(&mut self, appliance_id: &str) -> Result<usize, CoordinatorError> {
        if self.closed {
            return Err(CoordinatorError::Closed);
        }

        let slot = self
            .appliances
            .entry(appliance_id.to_string())
            .or_insert_with_key(|id| ApplianceSlot::new(id));
        slot.lifecycle = Lifecycle::Closed;
        slot.held.clear();

        let removed = self.registry.close_appliance(appliance_id);
        info!(
            "Closed appliance {} on {}, deregistered {} listener(s)",
            appliance_id, self.name, removed
        );
        Ok(removed)
    }

    /// Tear down the coordinator. Every listener is deregistered and all
    /// further ingestion is rejected. Returns the number of listeners
    /// removed; closing twice is a no-op.
    pub fn close(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;
        for slot in self.appliances.values_mut() {
            slot.lifecycle = Lifecycle::Closed;
            slot.held.clear();
        }

        let removed = self.registry.close();
        info!(
            "Coordinator {} closed, deregistered {} listener(s)",
            self.name, removed
        );
        removed
    }

    pub fn lifecycle(&self, appliance_id: &str) -> Option<Lifecycle> {
        self.appliances.get(appliance_id).map(|slot| slot.lifecycle)
    }

    pub fn snapshot(&self, appliance_id: &str) -> Option<Arc<ApplianceSnapshot>> {
        self.appliances
            .get(appliance_id)
            .map(|slot| Arc::clone(&slot.snapshot))
    }

    pub fn listener(&self, id: ListenerId) -> Option<&dyn Listener> {
        self.registry.get(id)
    }

    pub fn listener_count(&self, appliance_id: &str) -> usize {
        self.registry.count_for(appliance_id)
    }

    pub fn total_listeners(&self) -> usize {
        self.registry.len()
    }

    pub fn entity_id(&self, id: ListenerId) -> Option<&str> {
        self.registry.entity_id(id)
    }

    /// Per-appliance summary, sorted by appliance id.
    pub fn overview(&self) -> Vec<ApplianceOverview> {
        let mut overview: Vec<ApplianceOverview> = self
            .appliances
            .iter()
            .map(|(id, slot)| ApplianceOverview {
                appliance_id: id.clone(),
                lifecycle: slot.lifecycle,
                listeners: self.registry.count_for(id),
                connection_status: slot.snapshot.connection_status,
                remote_control_valid: slot.snapshot.remote_control_valid,
                attributes: slot.snapshot.attributes.clone(),
                last_updated_at: slot.snapshot.last_updated_at,
            })
            .collect();
        overview.sort_by(|a, b| a.appliance_id.cmp(&b.appliance_id));
        overview
    }

    /// Drive the coordinator from a bridge until shutdown.
    ///
    /// Runs bridged calls one at a time, in queue order. Stops as soon as
    /// `shutdown` fires (or its sender is dropped), when every bridge
    /// producer is gone, or when a bridged call closes the coordinator.
    /// On the way out the queue is closed, so producers get
    /// [`BridgeError::Closed`], and calls that were already queued run
    /// against the closed coordinator, which rejects them.
    pub async fn run(
        mut self,
        mut rx: BridgeReceiver<Self>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Self {
        info!("Coordinator {} starting", self.name);

        loop {
            // Shutdown wins over a non-empty queue.
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Coordinator {}: shutdown requested", self.name);
                    break;
                }
                job = rx.recv() => match job {
                    Some(job) => job(&mut self),
                    None => {
                        info!("Coordinator {}: all producers disconnected", self.name);
                        break;
                    }
                },
            }

            if self.closed {
                break;
            }
        }

        rx.close();
        self.close();

        let mut late = 0;
        while let Some(job) = rx.try_recv() {
            job(&mut self);
            late += 1;
        }
        if late > 0 {
            warn!(
                "Coordinator {}: {} call(s) queued at teardown were rejected",
                self.name, late
            );
        }

        info!("Coordinator {} stopped", self.name);
        self
    }
}

impl Bridge<UpdateCoordinator> {
    /// Submit a push message for ingestion without waiting.
    pub fn push(&self, message: PushMessage) -> Result<(), BridgeError> {
        self.submit(apply_push, message)
    }

    /// Submit a push message, waiting for queue capacity. Producer threads
    /// only.
    pub fn push_blocking(&self, message: PushMessage) -> Result<(), BridgeError> {
        self.submit_blocking(apply_push, message)
    }
}

fn apply_push(coordinator: &mut UpdateCoordinator, message: PushMessage) {
    let appliance_id = message.appliance_id().to_string();
    if let Err(e) = coordinator.ingest(message) {
        warn!("Rejected update for {}: {}", appliance_id, e);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
