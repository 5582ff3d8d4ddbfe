//! Confirmation-depth finality tracking for Ethereum transactions
//!
//! A transaction is final once it sits `confirmation_blocks` below the head.
//! Receipts are re-read on every check, so a transaction that moves blocks
//! or disappears after being seen is reported as a reorg.

use super::EvmProvider;
use crate::error::{BridgeError, BridgeResult};
use crate::transfer::Chain;

use async_trait::async_trait;
use ethers::types::{TransactionReceipt, H256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const MAX_FINALIZED_CACHE: usize = 10_000;

/// Chain reads the tracker depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReceiptSource: Send + Sync {
    async fn block_number(&self) -> BridgeResult<u64>;

    async fn receipt(&self, tx_hash: H256) -> BridgeResult<Option<TransactionReceipt>>;
}

#[async_trait]
impl ReceiptSource for EvmProvider {
    async fn block_number(&self) -> BridgeResult<u64> {
        self.get_block_number().await
    }

    async fn receipt(&self, tx_hash: H256) -> BridgeResult<Option<TransactionReceipt>> {
        self.get_transaction_receipt(tx_hash).await
    }
}

/// Tracks finality for transactions on the Ethereum side
pub struct FinalityTracker {
    /// Required confirmation blocks
    confirmation_blocks: u64,
    provider: Arc<dyn ReceiptSource>,
    /// Seen but not yet final: tx_hash -> inclusion block
    pending: RwLock<HashMap<H256, u64>>,
    /// Finalized transactions (cached to avoid re-checking)
    finalized: RwLock<HashSet<H256>>,
}

impl FinalityTracker {
    pub fn new(confirmation_blocks: u64, provider: Arc<dyn ReceiptSource>) -> Self {
        Self {
            confirmation_blocks,
            provider,
            pending: RwLock::new(HashMap::new()),
            finalized: RwLock::new(HashSet::new()),
        }
    }

    /// Check if a transaction has reached finality
    pub async fn is_finalized(&self, tx_hash: H256) -> BridgeResult<bool> {
        if self.finalized.read().await.contains(&tx_hash) {
            return Ok(true);
        }

        let current_block = self.provider.block_number().await?;
        let receipt = self.provider.receipt(tx_hash).await?;
        let tracked = self.pending.read().await.get(&tx_hash).copied();

        let Some(receipt) = receipt else {
            if let Some(tx_block) = tracked {
                // Seen before, gone now
                self.pending.write().await.remove(&tx_hash);
                warn!(
                    "Reorg detected: tx {:?} no longer included on Ethereum",
                    tx_hash
                );
                return Err(BridgeError::ReorgDetected {
                    chain: Chain::Ethereum,
                    block_number: tx_block,
                });
            }
            debug!("Transaction {:?} not yet mined", tx_hash);
            return Ok(false);
        };

        if receipt.status == Some(0u64.into()) {
            return Err(BridgeError::Rejected {
                chain: Chain::Ethereum,
                message: format!("source transaction {:?} reverted", tx_hash),
            });
        }

        let Some(tx_block) = receipt.block_number.map(|b| b.as_u64()) else {
            return Ok(false);
        };

        if let Some(previous) = tracked {
            if previous != tx_block {
                warn!(
                    "Transaction {:?} moved from block {} to {} after a reorg",
                    tx_hash, previous, tx_block
                );
            }
        }

        let confirmations = current_block.saturating_sub(tx_block);
        if confirmations >= self.confirmation_blocks {
            self.pending.write().await.remove(&tx_hash);
            self.remember_finalized(tx_hash).await;

            info!(
                "Transaction {:?} finalized on Ethereum ({} confirmations)",
                tx_hash, confirmations
            );
            return Ok(true);
        }

        self.pending.write().await.insert(tx_hash, tx_block);
        debug!(
            "Transaction {:?} has {} / {} confirmations on Ethereum",
            tx_hash, confirmations, self.confirmation_blocks
        );
        Ok(false)
    }

    async fn remember_finalized(&self, tx_hash: H256) {
        let mut finalized = self.finalized.write().await;
        if finalized.len() >= MAX_FINALIZED_CACHE {
            // Simple cleanup - just clear half
            let to_remove: Vec<_> = finalized
                .iter()
                .take(finalized.len() / 2)
                .copied()
                .collect();
            for hash in to_remove {
                finalized.remove(&hash);
            }
        }
        finalized.insert(tx_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn mined_at(block: u64, status: u64) -> TransactionReceipt {
        TransactionReceipt {
            block_number: Some(block.into()),
            status: Some(status.into()),
            ..Default::default()
        }
    }

    fn hash() -> H256 {
        H256::repeat_byte(0xab)
    }

    #[tokio::test]
    async fn test_final_once_confirmation_depth_reached() {
        let head = Arc::new(AtomicU64::new(105));
        let mut source = MockReceiptSource::new();
        let reads = head.clone();
        source
            .expect_block_number()
            .times(2)
            .returning(move || Ok(reads.load(Ordering::SeqCst)));
        source
            .expect_receipt()
            .times(2)
            .returning(|_| Ok(Some(mined_at(100, 1))));

        let tracker = FinalityTracker::new(10, Arc::new(source));

        assert!(!tracker.is_finalized(hash()).await.unwrap());

        head.store(110, Ordering::SeqCst);
        assert!(tracker.is_finalized(hash()).await.unwrap());

        // Cached: no further chain reads
        assert!(tracker.is_finalized(hash()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unmined_transaction_is_not_final() {
        let mut source = MockReceiptSource::new();
        source.expect_block_number().returning(|| Ok(500));
        source.expect_receipt().returning(|_| Ok(None));

        let tracker = FinalityTracker::new(10, Arc::new(source));
        assert!(!tracker.is_finalized(hash()).await.unwrap());
        assert!(!tracker.is_finalized(hash()).await.unwrap());
    }

    #[tokio::test]
    async fn test_receipt_disappearing_is_a_reorg() {
        let seen = Arc::new(AtomicU64::new(0));
        let calls = seen.clone();
        let mut source = MockReceiptSource::new();
        source.expect_block_number().returning(|| Ok(103));
        source.expect_receipt().returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Some(mined_at(100, 1)))
            } else {
                Ok(None)
            }
        });

        let tracker = FinalityTracker::new(10, Arc::new(source));
        assert!(!tracker.is_finalized(hash()).await.unwrap());

        let result = tracker.is_finalized(hash()).await;
        assert!(matches!(
            result,
            Err(BridgeError::ReorgDetected { chain: Chain::Ethereum, block_number: 100 })
        ));
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_reverted_source_transaction_is_rejected() {
        let mut source = MockReceiptSource::new();
        source.expect_block_number().returning(|| Ok(1_000));
        source
            .expect_receipt()
            .returning(|_| Ok(Some(mined_at(100, 0))));

        let tracker = FinalityTracker::new(10, Arc::new(source));
        let result = tracker.is_finalized(hash()).await;
        assert!(matches!(result, Err(BridgeError::Rejected { chain: Chain::Ethereum, .. })));
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let mut source = MockReceiptSource::new();
        source.expect_block_number().returning(|| {
            Err(BridgeError::Adapter {
                chain: Chain::Ethereum,
                message: "All providers failed".to_string(),
            })
        });

        let tracker = FinalityTracker::new(10, Arc::new(source));
        assert!(matches!(
            tracker.is_finalized(hash()).await,
            Err(BridgeError::Adapter { .. })
        ));
    }
}
