//! Operator control: the bridge's tri-state operational flag

use crate::error::{BridgeError, BridgeResult};

use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationalState {
    /// Accepting new transfers
    Active,
    /// New intake stopped; existing transfers still settle
    Paused,
    /// Boot-time default until both chains are reachable
    Maintenance,
}

impl OperationalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationalState::Active => "active",
            OperationalState::Paused => "paused",
            OperationalState::Maintenance => "maintenance",
        }
    }

    /// Gauge value for metrics
    pub fn as_gauge(&self) -> f64 {
        match self {
            OperationalState::Active => 0.0,
            OperationalState::Paused => 1.0,
            OperationalState::Maintenance => 2.0,
        }
    }
}

impl fmt::Display for OperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holds the operational flag
pub struct OperatorControl {
    state: watch::Sender<OperationalState>,
}

impl Default for OperatorControl {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorControl {
    pub fn new() -> Self {
        let (state, _) = watch::channel(OperationalState::Maintenance);
        crate::metrics::record_operational_state(OperationalState::Maintenance);
        Self { state }
    }

    pub fn state(&self) -> OperationalState {
        *self.state.borrow()
    }

    /// Reject new intake unless the bridge is `Active`
    pub fn ensure_accepting(&self) -> BridgeResult<()> {
        match self.state() {
            OperationalState::Active => Ok(()),
            OperationalState::Paused => Err(BridgeError::Operational(
                "bridge is paused".to_string(),
            )),
            OperationalState::Maintenance => Err(BridgeError::Operational(
                "bridge is in maintenance".to_string(),
            )),
        }
    }

    /// Leave maintenance once initialization succeeded
    pub fn activate(&self) {
        self.set(OperationalState::Active);
    }

    pub fn enter_maintenance(&self) {
        self.set(OperationalState::Maintenance);
    }

    /// Stop accepting new transfers. Pausing twice is a no-op.
    pub fn pause(&self) -> BridgeResult<()> {
        self.swap(OperationalState::Active, OperationalState::Paused)
    }

    /// Resume accepting new transfers. Never leaves maintenance.
    pub fn unpause(&self) -> BridgeResult<()> {
        self.swap(OperationalState::Paused, OperationalState::Active)
    }

    fn swap(&self, from: OperationalState, to: OperationalState) -> BridgeResult<()> {
        let mut result = Ok(());

        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                if *state == OperationalState::Maintenance {
                    result = Err(BridgeError::Operational(format!(
                        "cannot switch to {} while in maintenance",
                        to
                    )));
                }
                false
            }
        });

        if changed {
            info!("Bridge operational state: {} -> {}", from, to);
            crate::metrics::record_operational_state(to);
        } else if let Err(e) = &result {
            warn!("{}", e);
        }

        result
    }

    fn set(&self, next: OperationalState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Bridge operational state: {} -> {}", previous, next);
        }
        crate::metrics::record_operational_state(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boots_into_maintenance() {
        let control = OperatorControl::new();
        assert_eq!(control.state(), OperationalState::Maintenance);
        assert!(matches!(
            control.ensure_accepting(),
            Err(BridgeError::Operational(_))
        ));
    }

    #[test]
    fn test_pause_and_unpause() {
        let control = OperatorControl::new();
        control.activate();
        assert!(control.ensure_accepting().is_ok());

        control.pause().unwrap();
        assert_eq!(control.state(), OperationalState::Paused);
        assert!(matches!(
            control.ensure_accepting(),
            Err(BridgeError::Operational(ref msg)) if msg.contains("paused")
        ));

        // Idempotent in both directions
        control.pause().unwrap();
        control.unpause().unwrap();
        control.unpause().unwrap();
        assert_eq!(control.state(), OperationalState::Active);
    }

    #[test]
    fn test_maintenance_is_not_left_by_operator_toggles() {
        let control = OperatorControl::new();

        assert!(control.pause().is_err());
        assert!(control.unpause().is_err());
        assert_eq!(control.state(), OperationalState::Maintenance);
    }
}
