//! Bridge transfer records and their lifecycle
//!
//! A `BridgeTransaction` is created once per transfer request and moves
//! through `Pending -> Processing -> {Completed | Failed}`. The
//! `TransactionStore` is the single source of truth for these records and
//! for the two per-direction pending work sets.

pub mod store;

pub use store::{ReleaseMatch, StoreStats, TransactionStore};

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two ledgers connected by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Aleo,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Aleo => "aleo",
        }
    }

    pub fn parse(value: &str) -> Option<Chain> {
        match value {
            "ethereum" => Some(Chain::Ethereum),
            "aleo" => Some(Chain::Aleo),
            _ => None,
        }
    }

    /// The opposite side of the bridge
    pub fn counterpart(&self) -> Chain {
        match self {
            Chain::Ethereum => Chain::Aleo,
            Chain::Aleo => Chain::Ethereum,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer direction; each direction has its own pending work set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    EthereumToAleo,
    AleoToEthereum,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::EthereumToAleo, Direction::AleoToEthereum];

    /// Resolve a direction from a (source, target) pair; `None` if both sides match
    pub fn between(source: Chain, target: Chain) -> Option<Direction> {
        match (source, target) {
            (Chain::Ethereum, Chain::Aleo) => Some(Direction::EthereumToAleo),
            (Chain::Aleo, Chain::Ethereum) => Some(Direction::AleoToEthereum),
            _ => None,
        }
    }

    /// Direction of transfers that originate on `chain`
    pub fn from_source(chain: Chain) -> Direction {
        match chain {
            Chain::Ethereum => Direction::EthereumToAleo,
            Chain::Aleo => Direction::AleoToEthereum,
        }
    }

    pub fn source(&self) -> Chain {
        match self {
            Direction::EthereumToAleo => Chain::Ethereum,
            Direction::AleoToEthereum => Chain::Aleo,
        }
    }

    pub fn target(&self) -> Chain {
        self.source().counterpart()
    }

    /// Prefix used for orchestrator-generated transfer ids
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Direction::EthereumToAleo => "eth_aleo",
            Direction::AleoToEthereum => "aleo_eth",
        }
    }

    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Direction::EthereumToAleo => "ethereum_to_aleo",
            Direction::AleoToEthereum => "aleo_to_ethereum",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Processing => "processing",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<TransferStatus> {
        match value {
            "pending" => Some(TransferStatus::Pending),
            "processing" => Some(TransferStatus::Processing),
            "completed" => Some(TransferStatus::Completed),
            "failed" => Some(TransferStatus::Failed),
            _ => None,
        }
    }

    /// Position in the lifecycle; terminal states share the last rank
    pub fn rank(&self) -> i16 {
        match self {
            TransferStatus::Pending => 0,
            TransferStatus::Processing => 1,
            TransferStatus::Completed | TransferStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    /// Whether the transfer still belongs to a pending work set
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Allowed moves: one step forward, or to `Failed` from any active state
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        matches!(
            (self, next),
            (TransferStatus::Pending, TransferStatus::Processing)
                | (TransferStatus::Pending, TransferStatus::Failed)
                | (TransferStatus::Processing, TransferStatus::Completed)
                | (TransferStatus::Processing, TransferStatus::Failed)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work tracked by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeTransaction {
    pub id: String,
    pub source_chain: Chain,
    pub target_chain: Chain,
    pub source_address: String,
    pub target_address: String,
    /// Decimal-encoded unsigned integer, immutable after creation
    pub amount: String,
    pub fee: Option<String>,
    pub status: TransferStatus,
    pub source_tx_ref: Option<String>,
    pub target_tx_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl BridgeTransaction {
    /// Build a new `Pending` transfer record
    pub fn new(
        id: impl Into<String>,
        direction: Direction,
        source_address: impl Into<String>,
        target_address: impl Into<String>,
        amount: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_chain: direction.source(),
            target_chain: direction.target(),
            source_address: source_address.into(),
            target_address: target_address.into(),
            amount: amount.into(),
            fee: None,
            status: TransferStatus::Pending,
            source_tx_ref: None,
            target_tx_ref: None,
            created_at: Utc::now(),
            error_message: None,
        }
    }

    pub fn with_fee(mut self, fee: impl Into<String>) -> Self {
        self.fee = Some(fee.into());
        self
    }

    pub fn with_source_ref(mut self, source_tx_ref: impl Into<String>) -> Self {
        self.source_tx_ref = Some(source_tx_ref.into());
        self
    }

    pub fn direction(&self) -> Direction {
        Direction::from_source(self.source_chain)
    }
}

/// Mutable fields applied together with a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub target_tx_ref: Option<String>,
    pub error_message: Option<String>,
    pub fee: Option<String>,
}

impl TransitionFields {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn completed(target_tx_ref: impl Into<String>) -> Self {
        Self {
            target_tx_ref: Some(target_tx_ref.into()),
            ..Self::default()
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            error_message: Some(error_message.into()),
            ..Self::default()
        }
    }
}

/// Filter for listing transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListFilter {
    #[default]
    All,
    /// Pending or processing
    Active,
    Status(TransferStatus),
}

impl ListFilter {
    pub fn matches(&self, tx: &BridgeTransaction) -> bool {
        match self {
            ListFilter::All => true,
            ListFilter::Active => tx.status.is_active(),
            ListFilter::Status(status) => tx.status == *status,
        }
    }
}

/// Notification published whenever a transfer is created or changes state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferUpdate {
    pub kind: UpdateKind,
    pub transaction: BridgeTransaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Created,
    Processing,
    Completed,
    Failed,
}

impl UpdateKind {
    pub fn for_status(status: TransferStatus) -> UpdateKind {
        match status {
            TransferStatus::Pending => UpdateKind::Created,
            TransferStatus::Processing => UpdateKind::Processing,
            TransferStatus::Completed => UpdateKind::Completed,
            TransferStatus::Failed => UpdateKind::Failed,
        }
    }
}

/// Parse a decimal-encoded unsigned amount
pub fn parse_amount(value: &str) -> Option<U256> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    U256::from_dec_str(value).ok()
}

/// Clamp a fee to the configured subsidy ceiling; returns the fee and whether it was clamped
pub fn clamp_fee(fee: U256, max_subsidy: U256) -> (U256, bool) {
    if fee > max_subsidy {
        (max_subsidy, true)
    } else {
        (fee, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotonic() {
        use TransferStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        // No skipping, no going back, nothing out of a terminal state
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Processing));
    }

    #[test]
    fn test_direction_mapping() {
        assert_eq!(
            Direction::between(Chain::Ethereum, Chain::Aleo),
            Some(Direction::EthereumToAleo)
        );
        assert_eq!(Direction::between(Chain::Aleo, Chain::Aleo), None);
        assert_eq!(Direction::AleoToEthereum.source(), Chain::Aleo);
        assert_eq!(Direction::AleoToEthereum.target(), Chain::Ethereum);

        let tx = BridgeTransaction::new("t1", Direction::AleoToEthereum, "aleo1x", "0xB", "5");
        assert_eq!(tx.direction(), Direction::AleoToEthereum);
        assert_eq!(tx.status, TransferStatus::Pending);
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1000"), Some(U256::from(1000u64)));
        assert_eq!(
            parse_amount("1000000000000000000000"),
            U256::from_dec_str("1000000000000000000000").ok()
        );
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("-5"), None);
        assert_eq!(parse_amount("1.5"), None);
        assert_eq!(parse_amount("0x10"), None);
    }

    #[test]
    fn test_clamp_fee() {
        let max = U256::from(100u64);
        assert_eq!(clamp_fee(U256::from(40u64), max), (U256::from(40u64), false));
        assert_eq!(clamp_fee(U256::from(250u64), max), (max, true));
    }
}
