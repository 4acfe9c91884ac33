//! Availability policy shared by every entity.

use serde::Serialize;

use crate::coordinator::ApplianceSnapshot;
use crate::coordinator::ConnectionStatus;

/// Outcome of the availability policy for one entity and one snapshot.
///
/// Never stored: entities recompute it on every notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AvailabilityResult {
    pub available: bool,
    pub connection_status: ConnectionStatus,
    pub remote_control_valid: bool,
    pub entity_guard: bool,
}

impl AvailabilityResult {
    /// An entity is available only while its appliance is connected, accepts
    /// remote commands, and the entity's own guard holds.
    pub fn evaluate(snapshot: &ApplianceSnapshot, entity_guard: bool) -> Self {
        Self::from_flags(
            snapshot.connection_status,
            snapshot.remote_control_valid,
            entity_guard,
        )
    }

    pub fn from_flags(
        connection_status: ConnectionStatus,
        remote_control_valid: bool,
        entity_guard: bool,
    ) -> Self {
        Self {
            available: connection_status == ConnectionStatus::Connected
                && remote_control_valid
                && entity_guard,
            connection_status,
            remote_control_valid,
            entity_guard,
        }
    }

    /// Short reason for unavailability, for logs.
    pub fn reason(&self) -> Option<&'static str> {
        if self.available {
            None
        } else if self.connection_status != ConnectionStatus::Connected {
            Some("appliance not connected")
        } else if !self.remote_control_valid {
            Some("remote control not valid")
        } else {
            Some("entity guard failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUSES: [ConnectionStatus; 3] = [
        ConnectionStatus::Connected,
        ConnectionStatus::Disconnected,
        ConnectionStatus::Unknown,
    ];

    #[test]
    fn test_available_matches_conjunction() {
        for status in STATUSES {
            for remote in [true, false] {
                for guard in [true, false] {
                    let result = AvailabilityResult::from_flags(status, remote, guard);
                    assert_eq!(
                        result.available,
                        status == ConnectionStatus::Connected && remote && guard,
                        "{:?}",
                        result
                    );
                }
            }
        }
    }

    #[test]
    fn test_not_connected_is_never_available() {
        for status in [ConnectionStatus::Disconnected, ConnectionStatus::Unknown] {
            let result = AvailabilityResult::from_flags(status, true, true);
            assert!(!result.available);
            assert_eq!(result.reason(), Some("appliance not connected"));
        }
    }

    #[test]
    fn test_evaluate_reads_snapshot_flags() {
        let mut snapshot = ApplianceSnapshot::empty("wm-1");
        snapshot.connection_status = ConnectionStatus::Connected;
        snapshot.remote_control_valid = false;

        let result = AvailabilityResult::evaluate(&snapshot, true);
        assert!(!result.available);
        assert_eq!(result.reason(), Some("remote control not valid"));

        snapshot.remote_control_valid = true;
        assert_eq!(AvailabilityResult::evaluate(&snapshot, true).reason(), None);
        assert_eq!(
            AvailabilityResult::evaluate(&snapshot, false).reason(),
            Some("entity guard failed")
        );
    }
}
