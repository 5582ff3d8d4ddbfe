//! Reconciliation scheduler
//!
//! Each direction has its own loop draining its pending work set. Every tick
//! advances each pending transfer by at most one step. A transfer is owned
//! by at most one attempt at a time, even when a slow adapter call outlives
//! the tick that started it.

use crate::chain::{ChainAdapters, ReleaseRequest};
use crate::config::OrchestratorConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::transfer::{
    BridgeTransaction, Direction, TransactionStore, TransferStatus, TransitionFields,
};

use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub max_retries: u32,
    pub adapter_timeout: Duration,
    pub max_concurrent_attempts: usize,
}

impl From<&OrchestratorConfig> for SchedulerConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            interval: config.reconcile_interval(),
            max_retries: config.max_retries,
            adapter_timeout: config.adapter_timeout(),
            max_concurrent_attempts: config.max_concurrent_attempts,
        }
    }
}

/// Marks a transfer as owned by a running attempt until dropped
struct InFlightGuard {
    in_flight: Arc<DashSet<String>>,
    id: String,
}

impl InFlightGuard {
    fn acquire(in_flight: &Arc<DashSet<String>>, id: &str) -> Option<Self> {
        in_flight.insert(id.to_string()).then(|| Self {
            in_flight: in_flight.clone(),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

/// Drives pending transfers to a terminal state
pub struct ReconciliationScheduler {
    store: Arc<TransactionStore>,
    adapters: ChainAdapters,
    config: SchedulerConfig,
    /// Recoverable failures per transfer; not persisted
    retries: DashMap<String, u32>,
    in_flight: Arc<DashSet<String>>,
    ethereum_to_aleo: Arc<Semaphore>,
    aleo_to_ethereum: Arc<Semaphore>,
}

impl ReconciliationScheduler {
    pub fn new(
        store: Arc<TransactionStore>,
        adapters: ChainAdapters,
        config: SchedulerConfig,
    ) -> Self {
        let permits = config.max_concurrent_attempts.max(1);
        Self {
            store,
            adapters,
            retries: DashMap::new(),
            in_flight: Arc::new(DashSet::new()),
            ethereum_to_aleo: Arc::new(Semaphore::new(permits)),
            aleo_to_ethereum: Arc::new(Semaphore::new(permits)),
            config,
        }
    }

    fn permits(&self, direction: Direction) -> Arc<Semaphore> {
        match direction {
            Direction::EthereumToAleo => self.ethereum_to_aleo.clone(),
            Direction::AleoToEthereum => self.aleo_to_ethereum.clone(),
        }
    }

    /// Reconciliation loop for one direction
    pub async fn run(self: Arc<Self>, direction: Direction, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut attempts = JoinSet::new();

        info!("Reconciliation scheduler started for {}", direction);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_into(direction, &mut attempts).await;
                }

                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    if let Err(e) = joined {
                        error!("Reconciliation attempt for {} aborted: {}", direction, e);
                    }
                }

                _ = shutdown.changed() => break,
            }
        }

        // No new ticks; running attempts finish or hit their adapter timeout
        while attempts.join_next().await.is_some() {}

        info!("Reconciliation scheduler stopped for {}", direction);
    }

    /// Run one tick and hand back the spawned attempts
    pub async fn tick(self: &Arc<Self>, direction: Direction) -> JoinSet<()> {
        let mut attempts = JoinSet::new();
        self.tick_into(direction, &mut attempts).await;
        attempts
    }

    async fn tick_into(self: &Arc<Self>, direction: Direction, attempts: &mut JoinSet<()>) {
        self.prune_retries().await;

        let ids = self.store.pending_ids(direction).await;
        crate::metrics::record_pending(direction, ids.len());

        if !ids.is_empty() {
            debug!("Reconciling {} pending {} transfers", ids.len(), direction);
        }

        for id in ids {
            let Some(guard) = InFlightGuard::acquire(&self.in_flight, &id) else {
                debug!("Transfer {} still has an attempt in flight", id);
                continue;
            };

            let scheduler = self.clone();
            let permits = self.permits(direction);

            attempts.spawn(async move {
                let _guard = guard;
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                scheduler.attempt(direction, &id).await;
            });
        }
    }

    /// Drop counters of transfers settled outside the scheduler
    async fn prune_retries(&self) {
        if self.retries.is_empty() {
            return;
        }

        let mut active = HashSet::new();
        for direction in Direction::ALL {
            active.extend(self.store.pending_ids(direction).await);
        }
        self.retries.retain(|id, _| active.contains(id));
    }

    /// Advance a single transfer by one step
    async fn attempt(&self, direction: Direction, id: &str) {
        let started = Instant::now();

        let Some(tx) = self.store.get(id).await else {
            // Store is authoritative
            self.store.forget_pending(direction, id).await;
            self.retries.remove(id);
            return;
        };

        if tx.status.is_terminal() {
            self.store.forget_pending(direction, id).await;
            self.retries.remove(id);
            return;
        }

        if tx.status == TransferStatus::Pending {
            if let Err(e) = self
                .store
                .transition(id, TransferStatus::Processing, TransitionFields::none())
                .await
            {
                self.log_lost_race(id, e).await;
                return;
            }
            debug!("Transfer {} is now processing", id);
        }

        match self.advance(&tx).await {
            Ok(target_tx_ref) => self.complete(direction, id, target_tx_ref).await,
            Err(e) if e.is_retryable() => self.record_retry(direction, id, e).await,
            Err(e) => {
                if e.should_alert() {
                    error!("Alert: transfer {} rejected: {}", id, e);
                }
                self.fail(direction, id, e.to_string()).await;
            }
        }

        crate::metrics::record_reconcile_latency(direction, started.elapsed());
    }

    /// Finality check on the source, then release on the target
    async fn advance(&self, tx: &BridgeTransaction) -> BridgeResult<String> {
        if let Some(reference) = &tx.source_tx_ref {
            let source = self.adapters.get(tx.source_chain);
            let is_final = self
                .bounded("source finality check", source.is_final(reference))
                .await?;

            if !is_final {
                return Err(BridgeError::NotFinal {
                    chain: tx.source_chain,
                    reference: reference.clone(),
                });
            }
        }

        let request = ReleaseRequest {
            transfer_id: tx.id.clone(),
            direction: tx.direction(),
            recipient: tx.target_address.clone(),
            amount: tx.amount.clone(),
            source_tx_ref: tx.source_tx_ref.clone(),
            idempotency_key: tx.id.clone(),
        };

        let target = self.adapters.get(tx.target_chain);
        self.bounded("release submission", target.submit_release(&request))
            .await
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = BridgeResult<T>>,
    ) -> BridgeResult<T> {
        tokio::time::timeout(self.config.adapter_timeout, call)
            .await
            .map_err(|_| BridgeError::Timeout {
                operation: operation.to_string(),
            })?
    }

    async fn complete(&self, direction: Direction, id: &str, target_tx_ref: String) {
        self.retries.remove(id);

        match self
            .store
            .transition(
                id,
                TransferStatus::Completed,
                TransitionFields::completed(target_tx_ref.clone()),
            )
            .await
        {
            Ok(_) => {
                info!("Transfer {} completed: {}", id, target_tx_ref);
                crate::metrics::record_transfer_completed(direction);
            }
            Err(e) => self.log_lost_race(id, e).await,
        }
    }

    async fn record_retry(&self, direction: Direction, id: &str, error: BridgeError) {
        let attempts = {
            let mut count = self.retries.entry(id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        crate::metrics::record_retry(direction);

        if attempts > self.config.max_retries {
            let exhausted = BridgeError::MaxRetriesExceeded {
                max_retries: self.config.max_retries,
                last_error: error.to_string(),
            };
            self.fail(direction, id, exhausted.to_string()).await;
        } else {
            warn!(
                "Attempt {}/{} for transfer {} failed: {}",
                attempts, self.config.max_retries, id, error
            );
        }
    }

    async fn fail(&self, direction: Direction, id: &str, message: String) {
        self.retries.remove(id);

        match self
            .store
            .transition(id, TransferStatus::Failed, TransitionFields::failed(message.clone()))
            .await
        {
            Ok(_) => {
                error!("Transfer {} failed: {}", id, message);
                crate::metrics::record_transfer_failed(direction);
            }
            Err(e) => self.log_lost_race(id, e).await,
        }
    }

    /// A release event may settle a transfer while its attempt is running
    async fn log_lost_race(&self, id: &str, e: BridgeError) {
        match self.store.get(id).await.map(|tx| tx.status) {
            Some(TransferStatus::Completed) => {
                debug!("Transfer {} was already settled by a release event", id)
            }
            _ if e.is_contract_violation() => {
                error!("Store refused update of transfer {}: {}", id, e)
            }
            _ => warn!("Failed to update transfer {}: {}", id, e),
        }
    }
}
