//! Coordination of bridge transfers
//!
//! The coordination layer:
//! 1. Drains each direction's pending work set on a fixed cadence
//! 2. Checks source finality and submits releases on the target chain
//! 3. Retries recoverable failures up to a bound
//! 4. Gates new intake on the operator's operational flag

pub mod control;
pub mod scheduler;

pub use control::{OperationalState, OperatorControl};
pub use scheduler::{ReconciliationScheduler, SchedulerConfig};
