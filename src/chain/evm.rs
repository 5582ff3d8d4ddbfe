//! Ethereum bridge adapter
//!
//! Polls the bridge contract for `TokensLocked`/`TokensUnlocked` logs and
//! submits `unlockTokens` releases for Aleo -> Ethereum transfers.

use super::{classify_submit_error, ChainAdapter, EvmProvider, FinalityTracker, ReleaseRequest};
use crate::config::EthereumConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{base_contract, format_hash, ChainEvent, EvmEventParser, BRIDGE_ABI, TOKEN_ABI};
use crate::transfer::{parse_amount, Chain};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::contract::BaseContract;
use ethers::middleware::SignerMiddleware;
use ethers::providers::Middleware;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Filter, TransactionRequest, ValueOrArray, H256, U256};
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

/// Derive a bytes32 contract key from an orchestrator identifier
pub fn keccak_key(value: &str) -> H256 {
    let mut hasher = Keccak256::new();
    hasher.update(value.as_bytes());
    H256::from_slice(&hasher.finalize())
}

/// `ChainAdapter` for the Ethereum bridge contract
pub struct EvmAdapter {
    config: EthereumConfig,
    provider: Arc<EvmProvider>,
    finality: FinalityTracker,
    parser: EvmEventParser,
    bridge: BaseContract,
    token: BaseContract,
    bridge_address: Address,
    token_address: Address,
    wallet: LocalWallet,
    chain_id: OnceCell<u64>,
    /// bridgeTransactionId -> submitted tx hash
    submitted: DashMap<H256, String>,
    /// Hex bridgeTransactionId -> orchestrator transfer id
    release_ids: DashMap<String, String>,
    /// Last block scanned by the listener
    last_scanned: AtomicU64,
}

impl EvmAdapter {
    /// Build the adapter; no network access until first use
    pub fn new(config: EthereumConfig) -> BridgeResult<Self> {
        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        let provider = Arc::new(EvmProvider::new(&config.rpc_urls, poll_interval)?);

        let bridge_address: Address = config
            .bridge_address
            .parse()
            .map_err(|e| BridgeError::Config(format!("Invalid bridge address: {}", e)))?;
        let token_address: Address = config
            .token_address
            .parse()
            .map_err(|e| BridgeError::Config(format!("Invalid token address: {}", e)))?;

        let key = std::env::var(&config.private_key_env).map_err(|_| {
            BridgeError::Config(format!(
                "Operator key variable {} is not set",
                config.private_key_env
            ))
        })?;
        let wallet: LocalWallet = key
            .trim()
            .parse()
            .map_err(|e| BridgeError::Config(format!("Invalid private key: {}", e)))?;

        info!(
            "Ethereum adapter for {} initialized with wallet {:?}",
            config.network,
            wallet.address()
        );

        Ok(Self {
            finality: FinalityTracker::new(config.confirmation_blocks, provider.clone()),
            parser: EvmEventParser::new()?,
            bridge: base_contract(BRIDGE_ABI)?,
            token: base_contract(TOKEN_ABI)?,
            last_scanned: AtomicU64::new(config.start_block.map_or(0, |b| b.saturating_sub(1))),
            config,
            provider,
            bridge_address,
            token_address,
            wallet,
            chain_id: OnceCell::new(),
            submitted: DashMap::new(),
            release_ids: DashMap::new(),
        })
    }

    async fn chain_id(&self) -> BridgeResult<u64> {
        self.chain_id
            .get_or_try_init(|| self.provider.get_chain_id())
            .await
            .copied()
    }

    /// Ask the contract whether a source-side hash was already released
    async fn is_processed(&self, source_key: H256) -> BridgeResult<bool> {
        let data = self
            .bridge
            .encode("isAleoTransactionProcessed", source_key)
            .map_err(|e| BridgeError::Internal(e.to_string()))?;
        let call: TypedTransaction = TransactionRequest::new()
            .to(self.bridge_address)
            .data(data)
            .into();

        let output = self.provider.call(&call).await?;
        self.bridge
            .decode_output("isAleoTransactionProcessed", output)
            .map_err(|e| BridgeError::EventParsing(e.to_string()))
    }

    /// Replace contract-level release ids with transfer ids this process submitted
    fn resolve_release_ids(&self, event: ChainEvent) -> ChainEvent {
        match event {
            ChainEvent::ValueReleased {
                chain,
                recipient,
                amount,
                source_tx_ref,
                bridge_tx_id,
                target_tx_ref,
                block_number,
            } => {
                let bridge_tx_id = bridge_tx_id.map(|key| {
                    self.release_ids
                        .get(&key)
                        .map(|id| id.value().clone())
                        .unwrap_or(key)
                });
                ChainEvent::ValueReleased {
                    chain,
                    recipient,
                    amount,
                    source_tx_ref,
                    bridge_tx_id,
                    target_tx_ref,
                    block_number,
                }
            }
            locked => locked,
        }
    }

    async fn starting_block(&self) -> BridgeResult<u64> {
        let scanned = self.last_scanned.load(Ordering::Relaxed);
        if scanned > 0 || self.config.start_block.is_some() {
            return Ok(scanned);
        }

        let head = self.provider.get_block_number().await?;
        self.last_scanned.store(head, Ordering::Relaxed);
        Ok(head)
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain(&self) -> Chain {
        Chain::Ethereum
    }

    fn bridge_address(&self) -> String {
        format!("{:?}", self.bridge_address)
    }

    fn synced_height(&self) -> Option<u64> {
        match self.last_scanned.load(Ordering::Relaxed) {
            0 => None,
            block => Some(block),
        }
    }

    fn resume_from(&self, height: u64) {
        info!("Ethereum listener resuming after block {}", height);
        self.last_scanned.store(height, Ordering::Relaxed);
    }

    async fn current_height(&self) -> BridgeResult<u64> {
        self.provider.get_block_number().await
    }

    async fn is_final(&self, reference: &str) -> BridgeResult<bool> {
        let tx_hash: H256 = reference.parse().map_err(|_| BridgeError::Rejected {
            chain: Chain::Ethereum,
            message: format!("{} is not a transaction hash", reference),
        })?;
        self.finality.is_finalized(tx_hash).await
    }

    async fn submit_release(&self, request: &ReleaseRequest) -> BridgeResult<String> {
        if request.direction.target() != Chain::Ethereum {
            return Err(BridgeError::Internal(format!(
                "{} release routed to the Ethereum adapter",
                request.direction
            )));
        }

        let bridge_tx_id = keccak_key(&request.idempotency_key);
        let source_key = keccak_key(
            request
                .source_tx_ref
                .as_deref()
                .unwrap_or(&request.idempotency_key),
        );
        self.release_ids
            .insert(format_hash(&bridge_tx_id), request.transfer_id.clone());

        if let Some(tx_ref) = self.submitted.get(&bridge_tx_id) {
            debug!("Release for {} already submitted", request.transfer_id);
            return Ok(tx_ref.value().clone());
        }

        if self.is_processed(source_key).await? {
            info!(
                "Release for {} already processed by the bridge contract",
                request.transfer_id
            );
            let tx_ref = format_hash(&source_key);
            self.submitted.insert(bridge_tx_id, tx_ref.clone());
            return Ok(tx_ref);
        }

        let recipient: Address = request.recipient.parse().map_err(|_| BridgeError::Rejected {
            chain: Chain::Ethereum,
            message: format!("invalid recipient {}", request.recipient),
        })?;
        let amount: U256 = parse_amount(&request.amount).ok_or_else(|| BridgeError::Rejected {
            chain: Chain::Ethereum,
            message: format!("invalid amount {}", request.amount),
        })?;

        let data = self
            .bridge
            .encode("unlockTokens", (recipient, amount, source_key, bridge_tx_id))
            .map_err(|e| BridgeError::Internal(e.to_string()))?;
        let tx = TransactionRequest::new().to(self.bridge_address).data(data);

        let chain_id = self.chain_id().await?;
        let client = SignerMiddleware::new(
            self.provider.http().clone(),
            self.wallet.clone().with_chain_id(chain_id),
        );

        let pending = client
            .send_transaction(tx, None)
            .await
            .map_err(|e| classify_submit_error(Chain::Ethereum, e.to_string(), &request.amount))?;
        let tx_ref = format_hash(&pending.tx_hash());

        self.submitted.insert(bridge_tx_id, tx_ref.clone());
        info!(
            "Submitted unlockTokens for {}: {}",
            request.transfer_id, tx_ref
        );

        Ok(tx_ref)
    }

    async fn liquidity(&self) -> BridgeResult<String> {
        let data = self
            .token
            .encode("balanceOf", self.bridge_address)
            .map_err(|e| BridgeError::Internal(e.to_string()))?;
        let call: TypedTransaction = TransactionRequest::new()
            .to(self.token_address)
            .data(data)
            .into();

        let output = self.provider.call(&call).await?;
        let balance: U256 = self
            .token
            .decode_output("balanceOf", output)
            .map_err(|e| BridgeError::EventParsing(e.to_string()))?;

        Ok(balance.to_string())
    }

    async fn listen(&self, sink: mpsc::Sender<ChainEvent>) -> BridgeResult<()> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let topics: Vec<Option<H256>> = self.parser.topics().into_iter().map(Some).collect();
        let base_filter = Filter::new()
            .address(self.bridge_address)
            .topic0(ValueOrArray::Array(topics));

        self.starting_block().await?;
        info!("Polling Ethereum bridge logs every {:?}", poll_interval);

        loop {
            if sink.is_closed() {
                return Ok(());
            }

            let current_block = match self.provider.get_block_number().await {
                Ok(b) => b,
                Err(e) => {
                    warn!("Failed to get block number: {}", e);
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            let last_block = self.last_scanned.load(Ordering::Relaxed);

            // Only process if we have new blocks
            if current_block <= last_block {
                tokio::time::sleep(poll_interval).await;
                continue;
            }

            // Limit the block range per query
            let from_block = last_block + 1;
            let to_block = current_block.min(from_block + self.config.max_block_range - 1);

            debug!("Ethereum: processing blocks {} to {}", from_block, to_block);

            let filter = base_filter.clone().from_block(from_block).to_block(to_block);
            let logs = self.provider.get_logs(&filter).await?;

            for log in logs {
                match self.parser.parse_log(&log) {
                    Ok(Some(event)) => {
                        let event = self.resolve_release_ids(event);
                        if sink.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Failed to parse Ethereum log: {}", e);
                        crate::metrics::record_event_discarded(Chain::Ethereum);
                    }
                }
            }

            self.last_scanned.store(to_block, Ordering::Relaxed);
            crate::metrics::record_blocks_processed(Chain::Ethereum, to_block);

            let scanned = ChainEvent::Scanned {
                chain: Chain::Ethereum,
                block_number: to_block,
            };
            if sink.send(scanned).await.is_err() {
                return Ok(());
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}
