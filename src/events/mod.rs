//! Chain event types and parsing
//!
//! Chain adapters translate chain-native logs into `ChainEvent`s; the
//! `EventIngestor` turns those into transaction store mutations.

pub mod ingestor;

pub use ingestor::{EventIngestor, IngestOutcome};

use crate::error::{BridgeError, BridgeResult};
use crate::transfer::Chain;

use ethers::abi::parse_abi;
use ethers::contract::{AbiError, BaseContract};
use ethers::types::{Address, Log, H256, U256};
use serde::{Deserialize, Serialize};

/// Domain events delivered by a chain adapter subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChainEvent {
    /// Value escrowed on the source chain
    ValueLocked {
        chain: Chain,
        event_id: String,
        sender: String,
        target_address: String,
        amount: String,
        fee: Option<String>,
        source_tx_ref: Option<String>,
        block_number: u64,
    },

    /// Value disbursed on the target chain
    ValueReleased {
        chain: Chain,
        recipient: String,
        amount: String,
        source_tx_ref: Option<String>,
        bridge_tx_id: Option<String>,
        target_tx_ref: String,
        block_number: u64,
    },

    /// Every event up to `block_number` has been emitted
    Scanned { chain: Chain, block_number: u64 },
}

impl ChainEvent {
    /// Chain that emitted the event
    pub fn chain(&self) -> Chain {
        match self {
            ChainEvent::ValueLocked { chain, .. } => *chain,
            ChainEvent::ValueReleased { chain, .. } => *chain,
            ChainEvent::Scanned { chain, .. } => *chain,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            ChainEvent::ValueLocked { .. } => "value_locked",
            ChainEvent::ValueReleased { .. } => "value_released",
            ChainEvent::Scanned { .. } => "scanned",
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            ChainEvent::ValueLocked { block_number, .. } => *block_number,
            ChainEvent::ValueReleased { block_number, .. } => *block_number,
            ChainEvent::Scanned { block_number, .. } => *block_number,
        }
    }
}

/// Human-readable ABI of the Ethereum bridge contract
pub const BRIDGE_ABI: &[&str] = &[
    "function lockTokens(string aleoRecipient, uint256 amount) external returns (bytes32)",
    "function unlockTokens(address recipient, uint256 amount, bytes32 aleoTransactionHash, bytes32 bridgeTransactionId) external returns (bool)",
    "function isAleoTransactionProcessed(bytes32 aleoTransactionHash) external view returns (bool)",
    "event TokensLocked(address indexed sender, string aleoRecipient, uint256 amount, uint256 fee, bytes32 indexed transactionHash)",
    "event TokensUnlocked(address indexed recipient, uint256 amount, bytes32 indexed aleoTransactionHash, bytes32 indexed bridgeTransactionId)",
];

/// Human-readable ABI of the bridged ERC-20 token
pub const TOKEN_ABI: &[&str] = &["function balanceOf(address owner) external view returns (uint256)"];

/// Build a `BaseContract` from a human-readable ABI
pub fn base_contract(abi: &[&str]) -> BridgeResult<BaseContract> {
    parse_abi(abi)
        .map(BaseContract::from)
        .map_err(|e| BridgeError::Internal(format!("Invalid ABI: {}", e)))
}

/// Render a 32-byte hash the way the rest of the orchestrator stores it
pub fn format_hash(hash: &H256) -> String {
    format!("0x{}", hex::encode(hash.as_bytes()))
}

/// Event parser for the Ethereum bridge contract
pub struct EvmEventParser {
    contract: BaseContract,
    locked_topic: H256,
    unlocked_topic: H256,
}

impl EvmEventParser {
    pub fn new() -> BridgeResult<Self> {
        let contract = base_contract(BRIDGE_ABI)?;
        let locked_topic = event_topic(&contract, "TokensLocked")?;
        let unlocked_topic = event_topic(&contract, "TokensUnlocked")?;

        Ok(Self {
            contract,
            locked_topic,
            unlocked_topic,
        })
    }

    /// Topics the listener filters on
    pub fn topics(&self) -> Vec<H256> {
        vec![self.locked_topic, self.unlocked_topic]
    }

    /// Parse a log entry into a `ChainEvent`; `None` for unrelated logs
    pub fn parse_log(&self, log: &Log) -> BridgeResult<Option<ChainEvent>> {
        let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
        let log_tx_hash = log.transaction_hash.map(|h| format_hash(&h));

        let Some(topic) = log.topics.first().copied() else {
            return Ok(None);
        };

        if topic == self.locked_topic {
            let (sender, aleo_recipient, amount, fee, transaction_hash): (
                Address,
                String,
                U256,
                U256,
                H256,
            ) = self
                .contract
                .decode_event("TokensLocked", log.topics.clone(), log.data.clone())
                .map_err(parse_error)?;

            return Ok(Some(ChainEvent::ValueLocked {
                chain: Chain::Ethereum,
                event_id: format_hash(&transaction_hash),
                sender: format!("{:?}", sender),
                target_address: aleo_recipient,
                amount: amount.to_string(),
                fee: Some(fee.to_string()),
                source_tx_ref: log_tx_hash,
                block_number,
            }));
        }

        if topic == self.unlocked_topic {
            let (recipient, amount, aleo_tx_hash, bridge_tx_id): (Address, U256, H256, H256) = self
                .contract
                .decode_event("TokensUnlocked", log.topics.clone(), log.data.clone())
                .map_err(parse_error)?;

            let target_tx_ref = log_tx_hash.ok_or_else(|| {
                BridgeError::EventParsing("TokensUnlocked log without transaction hash".into())
            })?;

            return Ok(Some(ChainEvent::ValueReleased {
                chain: Chain::Ethereum,
                recipient: format!("{:?}", recipient),
                amount: amount.to_string(),
                source_tx_ref: Some(format_hash(&aleo_tx_hash)),
                bridge_tx_id: Some(format_hash(&bridge_tx_id)),
                target_tx_ref,
                block_number,
            }));
        }

        Ok(None)
    }
}

fn event_topic(contract: &BaseContract, name: &str) -> BridgeResult<H256> {
    contract
        .abi()
        .event(name)
        .map(|event| event.signature())
        .map_err(|e| BridgeError::Internal(format!("Missing event {}: {}", name, e)))
}

fn parse_error(e: AbiError) -> BridgeError {
    BridgeError::EventParsing(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::{encode, Token};

    fn address_topic(address: Address) -> H256 {
        H256::from(address)
    }

    #[test]
    fn test_parse_tokens_locked() {
        let parser = EvmEventParser::new().unwrap();
        let sender = Address::from_low_u64_be(0xA);
        let event_hash = H256::repeat_byte(0x11);

        let data = encode(&[
            Token::String("aleo1X".to_string()),
            Token::Uint(U256::from(1000u64)),
            Token::Uint(U256::from(3u64)),
        ]);
        let log = Log {
            topics: vec![parser.locked_topic, address_topic(sender), event_hash],
            data: data.into(),
            block_number: Some(42u64.into()),
            transaction_hash: Some(H256::repeat_byte(0x22)),
            ..Default::default()
        };

        let event = parser.parse_log(&log).unwrap().unwrap();
        match event {
            ChainEvent::ValueLocked {
                event_id,
                target_address,
                amount,
                fee,
                source_tx_ref,
                block_number,
                ..
            } => {
                assert_eq!(event_id, format_hash(&event_hash));
                assert_eq!(target_address, "aleo1X");
                assert_eq!(amount, "1000");
                assert_eq!(fee.as_deref(), Some("3"));
                assert_eq!(source_tx_ref, Some(format_hash(&H256::repeat_byte(0x22))));
                assert_eq!(block_number, 42);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_tokens_unlocked() {
        let parser = EvmEventParser::new().unwrap();
        let recipient = Address::from_low_u64_be(0xB);

        let data = encode(&[Token::Uint(U256::from(77u64))]);
        let log = Log {
            topics: vec![
                parser.unlocked_topic,
                address_topic(recipient),
                H256::repeat_byte(0x33),
                H256::repeat_byte(0x44),
            ],
            data: data.into(),
            block_number: Some(7u64.into()),
            transaction_hash: Some(H256::repeat_byte(0x55)),
            ..Default::default()
        };

        let event = parser.parse_log(&log).unwrap().unwrap();
        assert_eq!(event.name(), "value_released");
        match event {
            ChainEvent::ValueReleased {
                bridge_tx_id,
                target_tx_ref,
                amount,
                ..
            } => {
                assert_eq!(bridge_tx_id, Some(format_hash(&H256::repeat_byte(0x44))));
                assert_eq!(target_tx_ref, format_hash(&H256::repeat_byte(0x55)));
                assert_eq!(amount, "77");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unrelated_and_truncated_logs() {
        let parser = EvmEventParser::new().unwrap();

        let unrelated = Log {
            topics: vec![H256::repeat_byte(0x99)],
            ..Default::default()
        };
        assert_eq!(parser.parse_log(&unrelated).unwrap(), None);

        // Right topic, missing data: a decoding error, not a panic
        let truncated = Log {
            topics: vec![parser.locked_topic],
            ..Default::default()
        };
        assert!(matches!(
            parser.parse_log(&truncated),
            Err(BridgeError::EventParsing(_))
        ));
    }
}
