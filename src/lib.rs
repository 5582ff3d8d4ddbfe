//! Bridge Orchestrator - Ethereum <-> Aleo transfer coordination
//!
//! Tracks every bridge transfer from the source-side lock to the target-side
//! release. Chain events create transfers, a per-direction reconciliation
//! loop drives them to completion, and an operator flag gates new intake.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod state;
pub mod status;
pub mod transfer;

pub use error::{BridgeError, BridgeResult};
pub use orchestrator::Orchestrator;
