//! Ethereum provider with multi-RPC support and automatic failover

use crate::error::{BridgeError, BridgeResult};
use crate::transfer::Chain;

use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, Filter, Log, TransactionReceipt, H256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct EvmProvider {
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EvmProvider {
    /// Create a provider over every parseable RPC URL
    pub fn new(rpc_urls: &[String], poll_interval: Duration) -> BridgeResult<Self> {
        let mut http_providers = Vec::new();

        for url in rpc_urls.iter().filter(|url| !url.trim().is_empty()) {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(poll_interval));
                    debug!("Added Ethereum HTTP provider: {}", url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(BridgeError::Config(
                "No valid Ethereum RPC providers".to_string(),
            ));
        }

        Ok(Self {
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        if self.http_providers.len() < 2 {
            return;
        }
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Ethereum failover to provider {}", next);
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> BridgeResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get Ethereum block number: {}", e);
                    self.failover();
                }
            }
        }

        Err(adapter_error("All providers failed"))
    }

    pub async fn get_chain_id(&self) -> BridgeResult<u64> {
        self.http()
            .get_chainid()
            .await
            .map(|id| id.as_u64())
            .map_err(|e| adapter_error(e.to_string()))
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> BridgeResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| adapter_error(e.to_string()))
    }

    /// Get logs for a filter
    pub async fn get_logs(&self, filter: &Filter) -> BridgeResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get Ethereum logs: {}", e);
                    self.failover();
                }
            }
        }

        Err(adapter_error("All providers failed to get logs"))
    }

    /// Execute a read-only contract call
    pub async fn call(&self, tx: &TypedTransaction) -> BridgeResult<Bytes> {
        for _ in 0..self.http_providers.len() {
            match self.http().call(tx, None).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    warn!("Ethereum eth_call failed: {}", e);
                    self.failover();
                }
            }
        }

        Err(adapter_error("All providers failed eth_call"))
    }
}

fn adapter_error(message: impl Into<String>) -> BridgeError {
    BridgeError::Adapter {
        chain: Chain::Ethereum,
        message: message.into(),
    }
}
