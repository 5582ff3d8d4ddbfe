//! Chain module - adapters for the two ledgers connected by the bridge
//!
//! This module provides:
//! - The `ChainAdapter` seam the orchestrator drives
//! - An EVM adapter with multi-RPC failover and log polling
//! - A JSON-RPC gateway adapter for the Aleo side
//! - Listener supervision with automatic restart

pub mod evm;
pub mod finality;
pub mod gateway;
pub mod provider;

#[cfg(test)]
pub(crate) mod scripted;

pub use evm::EvmAdapter;
pub use finality::{FinalityTracker, ReceiptSource};
pub use gateway::GatewayAdapter;
pub use provider::EvmProvider;

use crate::error::{BridgeError, BridgeResult};
use crate::events::ChainEvent;
use crate::transfer::{Chain, Direction};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A release to be executed on the target chain of a transfer
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRequest {
    pub transfer_id: String,
    pub direction: Direction,
    pub recipient: String,
    pub amount: String,
    pub source_tx_ref: Option<String>,
    /// Stable per transfer; a repeated submission with the same key must not
    /// produce a second on-chain effect
    pub idempotency_key: String,
}

/// Capabilities the orchestrator needs from one chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    /// Bridge contract address or program id
    fn bridge_address(&self) -> String;

    /// Highest block the event subscription has scanned, if it has started
    fn synced_height(&self) -> Option<u64>;

    /// Continue the event subscription after `height`
    fn resume_from(&self, height: u64);

    async fn current_height(&self) -> BridgeResult<u64>;

    /// Whether a source-side reference has reached the chain's finality depth
    async fn is_final(&self, reference: &str) -> BridgeResult<bool>;

    /// Submit a release; returns the target-side transaction reference
    async fn submit_release(&self, request: &ReleaseRequest) -> BridgeResult<String>;

    /// Funds available to the bridge on this chain (decimal string)
    async fn liquidity(&self) -> BridgeResult<String>;

    /// Stream bridge events into `sink`. Returns `Ok` once the sink is closed.
    async fn listen(&self, sink: mpsc::Sender<ChainEvent>) -> BridgeResult<()>;
}

/// The adapter pair, one per side of the bridge
#[derive(Clone)]
pub struct ChainAdapters {
    ethereum: Arc<dyn ChainAdapter>,
    aleo: Arc<dyn ChainAdapter>,
}

impl ChainAdapters {
    pub fn new(ethereum: Arc<dyn ChainAdapter>, aleo: Arc<dyn ChainAdapter>) -> BridgeResult<Self> {
        if ethereum.chain() != Chain::Ethereum || aleo.chain() != Chain::Aleo {
            return Err(BridgeError::Config(
                "chain adapters registered for the wrong side".to_string(),
            ));
        }
        Ok(Self { ethereum, aleo })
    }

    /// Get the adapter for a specific chain
    pub fn get(&self, chain: Chain) -> Arc<dyn ChainAdapter> {
        match chain {
            Chain::Ethereum => self.ethereum.clone(),
            Chain::Aleo => self.aleo.clone(),
        }
    }

    pub fn all(&self) -> [Arc<dyn ChainAdapter>; 2] {
        [self.ethereum.clone(), self.aleo.clone()]
    }

    /// Spawn one supervised subscription task per chain
    pub fn start_listeners(
        &self,
        sink: mpsc::Sender<ChainEvent>,
        restart_delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.all()
            .into_iter()
            .map(|adapter| {
                tokio::spawn(supervise_listener(
                    adapter,
                    sink.clone(),
                    restart_delay,
                    shutdown.clone(),
                ))
            })
            .collect()
    }
}

/// Keep a chain subscription alive until shutdown or until the sink closes
async fn supervise_listener(
    adapter: Arc<dyn ChainAdapter>,
    sink: mpsc::Sender<ChainEvent>,
    restart_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let chain = adapter.chain();
    info!("Starting {} listener", chain);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let result = tokio::select! {
            result = adapter.listen(sink.clone()) => result,
            _ = shutdown.changed() => break,
        };

        match result {
            Ok(()) => {
                info!("{} event sink closed, listener exiting", chain);
                break;
            }
            Err(e) => {
                error!("Listener error for {}: {}", chain, e);
                crate::metrics::record_listener_restart(chain);
            }
        }

        // Reconnect after delay
        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            _ = shutdown.changed() => break,
        }
        warn!("Restarting {} listener", chain);
    }

    info!("{} listener stopped", chain);
}

/// Map a failed submission to the error taxonomy
pub(crate) fn classify_submit_error(chain: Chain, message: String, amount: &str) -> BridgeError {
    let lowered = message.to_lowercase();

    if lowered.contains("insufficient funds") || lowered.contains("insufficient balance") {
        BridgeError::InsufficientBalance {
            chain,
            have: "unknown".to_string(),
            need: amount.to_string(),
        }
    } else if lowered.contains("revert") || lowered.contains("rejected") {
        BridgeError::Rejected { chain, message }
    } else {
        BridgeError::Adapter { chain, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_classify_submit_error() {
        assert!(matches!(
            classify_submit_error(Chain::Ethereum, "insufficient funds for gas".into(), "10"),
            BridgeError::InsufficientBalance { ref need, .. } if need == "10"
        ));
        assert!(matches!(
            classify_submit_error(Chain::Ethereum, "execution reverted: paused".into(), "10"),
            BridgeError::Rejected { .. }
        ));

        let transient = classify_submit_error(Chain::Aleo, "connection reset".into(), "10");
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_adapters_must_match_their_side() {
        let mut ethereum = MockChainAdapter::new();
        ethereum.expect_chain().return_const(Chain::Ethereum);
        let mut aleo = MockChainAdapter::new();
        aleo.expect_chain().return_const(Chain::Ethereum);

        let result = ChainAdapters::new(Arc::new(ethereum), Arc::new(aleo));
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    /// Fails every subscription attempt and counts them
    struct FlakyListener {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ChainAdapter for FlakyListener {
        fn chain(&self) -> Chain {
            Chain::Aleo
        }
        fn bridge_address(&self) -> String {
            "bridge.aleo".to_string()
        }
        fn synced_height(&self) -> Option<u64> {
            None
        }
        fn resume_from(&self, _height: u64) {}
        async fn current_height(&self) -> BridgeResult<u64> {
            Ok(0)
        }
        async fn is_final(&self, _reference: &str) -> BridgeResult<bool> {
            Ok(true)
        }
        async fn submit_release(&self, _request: &ReleaseRequest) -> BridgeResult<String> {
            Ok("at1".to_string())
        }
        async fn liquidity(&self) -> BridgeResult<String> {
            Ok("0".to_string())
        }
        async fn listen(&self, _sink: mpsc::Sender<ChainEvent>) -> BridgeResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(BridgeError::Adapter {
                chain: Chain::Aleo,
                message: "gateway unreachable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_listener_restarts_until_shutdown() {
        let adapter = Arc::new(FlakyListener {
            attempts: AtomicUsize::new(0),
        });
        let (sink, _rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(supervise_listener(
            adapter.clone(),
            sink,
            Duration::from_millis(5),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(adapter.attempts.load(Ordering::SeqCst) >= 2);
    }
}
