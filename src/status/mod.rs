//! Status aggregation
//!
//! Periodically samples chain heights and bridge liquidity. Snapshots are
//! observational only: a failed refresh keeps the previous snapshot and
//! never touches transfer processing.

use crate::chain::{ChainAdapter, ChainAdapters};
use crate::coordination::OperationalState;
use crate::error::{BridgeError, BridgeResult};
use crate::transfer::{parse_amount, Chain, StoreStats};

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Blocks the listener may trail the head before the chain reports `Syncing`
const SYNC_LAG_TOLERANCE: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Online,
    Offline,
    Syncing,
}

/// Last observed state of one chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainSnapshot {
    pub chain: Chain,
    pub status: ChainStatus,
    pub height: Option<u64>,
    pub bridge_address: String,
    pub liquidity: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ChainSnapshot {
    fn offline(chain: Chain, bridge_address: String) -> Self {
        Self {
            chain,
            status: ChainStatus::Offline,
            height: None,
            bridge_address,
            liquidity: None,
            updated_at: None,
        }
    }
}

/// Pending transfers by direction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingCounts {
    pub ethereum_to_aleo: u64,
    pub aleo_to_ethereum: u64,
    pub total: u64,
}

/// Combined bridge status returned by `get_status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeStatus {
    pub ethereum: ChainSnapshot,
    pub aleo: ChainSnapshot,
    pub operational_state: OperationalState,
    pub pending: PendingCounts,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Holds per-chain snapshots and refreshes them on a cadence
pub struct StatusAggregator {
    adapters: ChainAdapters,
    timeout: Duration,
    snapshots: RwLock<HashMap<Chain, ChainSnapshot>>,
}

impl StatusAggregator {
    pub fn new(adapters: ChainAdapters, timeout: Duration) -> Self {
        let snapshots = adapters
            .all()
            .iter()
            .map(|adapter| {
                let chain = adapter.chain();
                (chain, ChainSnapshot::offline(chain, adapter.bridge_address()))
            })
            .collect();

        Self {
            adapters,
            timeout,
            snapshots: RwLock::new(snapshots),
        }
    }

    /// Status loop; a failure on one tick never stops the next
    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Status aggregator started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh().await,
                _ = shutdown.changed() => break,
            }
        }

        info!("Status aggregator stopped");
    }

    /// Refresh both chains concurrently
    pub async fn refresh(&self) {
        let adapters = self.adapters.all();
        futures::future::join_all(adapters.iter().map(|adapter| self.refresh_chain(adapter))).await;
    }

    async fn refresh_chain(&self, adapter: &Arc<dyn ChainAdapter>) {
        let chain = adapter.chain();

        let height = match self.bounded(chain, "height", adapter.current_height()).await {
            Ok(height) => height,
            Err(e) => {
                warn!("Status refresh for {} failed, keeping last snapshot: {}", chain, e);
                crate::metrics::record_chain_health(chain, false);
                return;
            }
        };

        let status = match adapter.synced_height() {
            Some(synced) if height.saturating_sub(synced) > SYNC_LAG_TOLERANCE => {
                ChainStatus::Syncing
            }
            _ => ChainStatus::Online,
        };

        let liquidity = match self.bounded(chain, "liquidity", adapter.liquidity()).await {
            Ok(liquidity) => Some(liquidity),
            Err(e) => {
                warn!("Liquidity refresh for {} failed: {}", chain, e);
                None
            }
        };

        let mut snapshots = self.snapshots.write().await;
        let snapshot = snapshots
            .entry(chain)
            .or_insert_with(|| ChainSnapshot::offline(chain, adapter.bridge_address()));

        snapshot.status = status;
        snapshot.height = Some(height);
        if let Some(liquidity) = liquidity {
            crate::metrics::record_liquidity(chain, &liquidity);
            snapshot.liquidity = Some(liquidity);
        }
        snapshot.updated_at = Some(Utc::now());

        crate::metrics::record_chain_health(chain, true);
        crate::metrics::record_chain_height(chain, height);
        debug!("{} status: {:?} at height {}", chain, status, height);
    }

    async fn bounded<T>(
        &self,
        chain: Chain,
        what: &str,
        call: impl std::future::Future<Output = BridgeResult<T>>,
    ) -> BridgeResult<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| BridgeError::Timeout {
                operation: format!("{} {} refresh", chain, what),
            })?
    }

    /// Current snapshot for one chain
    pub async fn snapshot(&self, chain: Chain) -> ChainSnapshot {
        self.snapshots
            .read()
            .await
            .get(&chain)
            .cloned()
            .unwrap_or_else(|| ChainSnapshot::offline(chain, self.adapters.get(chain).bridge_address()))
    }

    /// Last known liquidity on a chain, if it has been sampled
    pub async fn liquidity(&self, chain: Chain) -> Option<U256> {
        self.snapshot(chain)
            .await
            .liquidity
            .as_deref()
            .and_then(parse_amount)
    }

    /// Combine snapshots with live state owned elsewhere
    pub async fn compose(&self, operational_state: OperationalState, stats: &StoreStats) -> BridgeStatus {
        let ethereum = self.snapshot(Chain::Ethereum).await;
        let aleo = self.snapshot(Chain::Aleo).await;
        let last_updated = ethereum.updated_at.max(aleo.updated_at);

        BridgeStatus {
            ethereum,
            aleo,
            operational_state,
            pending: PendingCounts {
                ethereum_to_aleo: stats.pending_ethereum_to_aleo,
                aleo_to_ethereum: stats.pending_aleo_to_ethereum,
                total: stats.pending_total(),
            },
            last_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainAdapter;
    use mockall::Sequence;

    fn mock(chain: Chain) -> MockChainAdapter {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain().return_const(chain);
        adapter
            .expect_bridge_address()
            .returning(move || format!("{}-bridge", chain));
        adapter
    }

    fn aggregator(ethereum: MockChainAdapter, aleo: MockChainAdapter) -> StatusAggregator {
        let adapters = ChainAdapters::new(Arc::new(ethereum), Arc::new(aleo)).unwrap();
        StatusAggregator::new(adapters, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_never_refreshed_chain_is_offline() {
        let status = aggregator(mock(Chain::Ethereum), mock(Chain::Aleo));

        let snapshot = status.snapshot(Chain::Aleo).await;
        assert_eq!(snapshot.status, ChainStatus::Offline);
        assert_eq!(snapshot.height, None);
        assert_eq!(snapshot.bridge_address, "aleo-bridge");
        assert_eq!(status.liquidity(Chain::Aleo).await, None);
    }

    #[tokio::test]
    async fn test_refresh_records_height_and_liquidity() {
        let mut ethereum = mock(Chain::Ethereum);
        ethereum.expect_current_height().returning(|| Ok(1_200));
        ethereum.expect_synced_height().return_const(Some(1_190u64));
        ethereum
            .expect_liquidity()
            .returning(|| Ok("5000".to_string()));

        let mut aleo = mock(Chain::Aleo);
        aleo.expect_current_height().returning(|| Ok(900));
        // Listener far behind the head
        aleo.expect_synced_height().return_const(Some(100u64));
        aleo.expect_liquidity().returning(|| Ok("42".to_string()));

        let status = aggregator(ethereum, aleo);
        status.refresh().await;

        let eth = status.snapshot(Chain::Ethereum).await;
        assert_eq!(eth.status, ChainStatus::Online);
        assert_eq!(eth.height, Some(1_200));
        assert_eq!(eth.liquidity.as_deref(), Some("5000"));
        assert!(eth.updated_at.is_some());

        let aleo = status.snapshot(Chain::Aleo).await;
        assert_eq!(aleo.status, ChainStatus::Syncing);
        assert_eq!(status.liquidity(Chain::Aleo).await, Some(U256::from(42u64)));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let mut seq = Sequence::new();
        let mut ethereum = mock(Chain::Ethereum);
        ethereum
            .expect_current_height()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(10));
        ethereum
            .expect_current_height()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Err(BridgeError::Adapter {
                    chain: Chain::Ethereum,
                    message: "timeout".to_string(),
                })
            });
        ethereum.expect_synced_height().return_const(None::<u64>);
        ethereum
            .expect_liquidity()
            .times(1)
            .returning(|| Ok("77".to_string()));

        let mut aleo = mock(Chain::Aleo);
        aleo.expect_current_height().returning(|| Ok(5));
        aleo.expect_synced_height().return_const(None::<u64>);
        aleo.expect_liquidity().returning(|| Ok("1".to_string()));

        let status = aggregator(ethereum, aleo);
        status.refresh().await;
        let before = status.snapshot(Chain::Ethereum).await;

        status.refresh().await;
        let after = status.snapshot(Chain::Ethereum).await;

        assert_eq!(before, after);
        assert_eq!(after.status, ChainStatus::Online);
        assert_eq!(after.height, Some(10));
        assert_eq!(after.liquidity.as_deref(), Some("77"));
    }

    #[tokio::test]
    async fn test_compose_combines_live_state() {
        let status = aggregator(mock(Chain::Ethereum), mock(Chain::Aleo));
        let stats = StoreStats {
            total: 4,
            pending: 2,
            processing: 1,
            completed: 1,
            failed: 0,
            pending_ethereum_to_aleo: 2,
            pending_aleo_to_ethereum: 1,
        };

        let combined = status.compose(OperationalState::Paused, &stats).await;
        assert_eq!(combined.operational_state, OperationalState::Paused);
        assert_eq!(combined.pending.total, 3);
        assert_eq!(combined.ethereum.status, ChainStatus::Offline);
        assert_eq!(combined.last_updated, None);
    }
}
