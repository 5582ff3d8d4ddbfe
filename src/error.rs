//! Error types for the bridge orchestrator

use crate::transfer::Chain;
use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Adapter error on {chain}: {message}")]
    Adapter { chain: Chain, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Source reference {reference} not final on {chain}")]
    NotFinal { chain: Chain, reference: String },

    #[error("Reorg detected on {chain} at block {block_number}")]
    ReorgDetected { chain: Chain, block_number: u64 },

    #[error("Submission rejected by {chain}: {message}")]
    Rejected { chain: Chain, message: String },

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("Transaction {id} already exists")]
    DuplicateId { id: String },

    #[error("Transaction {id} not found")]
    NotFound { id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Maximum retries ({max_retries}) exceeded: {last_error}")]
    MaxRetriesExceeded { max_retries: u32, last_error: String },

    #[error("Operational error: {0}")]
    Operational(String),

    #[error("Insufficient relayer balance on {chain}: have {have}, need {need}")]
    InsufficientBalance {
        chain: Chain,
        have: String,
        need: String,
    },

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Check if error is retryable on the next reconciliation tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Adapter { .. }
                | BridgeError::Timeout { .. }
                | BridgeError::NotFinal { .. }
                | BridgeError::ReorgDetected { .. }
        )
    }

    /// Check if error is a broken caller contract rather than an external failure
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidTransition { .. } | BridgeError::NotFound { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            BridgeError::InsufficientBalance { .. }
                | BridgeError::ReorgDetected { .. }
                | BridgeError::Rejected { .. }
        )
    }
}

/// Result type for orchestrator operations
pub type BridgeResult<T> = Result<T, BridgeError>;
