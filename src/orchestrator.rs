//! Transfer orchestrator
//!
//! Owns the transaction store and wires the background activities around
//! it: chain listeners feeding the event ingestor, one reconciliation loop
//! per direction, the status aggregator and the optional archive. Also the
//! entry point for the request layer.

use crate::chain::ChainAdapters;
use crate::config::OrchestratorConfig;
use crate::coordination::{OperationalState, OperatorControl, ReconciliationScheduler, SchedulerConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::events::EventIngestor;
use crate::state::{self, TransactionArchive};
use crate::status::{BridgeStatus, StatusAggregator};
use crate::transfer::{
    clamp_fee, parse_amount, BridgeTransaction, Chain, Direction, ListFilter, StoreStats,
    TransactionStore, TransferUpdate,
};

use ethers::types::U256;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<TransactionStore>,
    adapters: ChainAdapters,
    control: Arc<OperatorControl>,
    scheduler: Arc<ReconciliationScheduler>,
    status: Arc<StatusAggregator>,
    ingestor: Arc<EventIngestor>,
    archive: Option<Arc<dyn TransactionArchive>>,
    max_fee: U256,
    default_fee: U256,
    shutdown: watch::Sender<bool>,
    archive_shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    archiver: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        adapters: ChainAdapters,
        archive: Option<Arc<dyn TransactionArchive>>,
    ) -> BridgeResult<Self> {
        let max_fee = config.max_fee()?;
        let default_fee = config.default_fee()?;

        let store = Arc::new(TransactionStore::new());
        let scheduler = Arc::new(ReconciliationScheduler::new(
            store.clone(),
            adapters.clone(),
            SchedulerConfig::from(&config),
        ));
        let status = Arc::new(StatusAggregator::new(
            adapters.clone(),
            config.adapter_timeout(),
        ));
        let ingestor = Arc::new(EventIngestor::new(store.clone(), max_fee, archive.clone()));
        let (shutdown, _) = watch::channel(false);
        let (archive_shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            adapters,
            control: Arc::new(OperatorControl::new()),
            scheduler,
            status,
            ingestor,
            archive,
            max_fee,
            default_fee,
            shutdown,
            archive_shutdown,
            tasks: Mutex::new(Vec::new()),
            archiver: Mutex::new(None),
        })
    }

    /// Bring the orchestrator up.
    ///
    /// Both chains must answer a height query first; until then the bridge
    /// stays in maintenance and nothing is spawned. May be called again
    /// after `stop`.
    pub async fn start(&self) -> BridgeResult<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(BridgeError::Operational(
                "orchestrator already started".to_string(),
            ));
        }

        info!("Starting orchestrator {}", self.config.instance_id);
        self.control.enter_maintenance();

        for adapter in self.adapters.all() {
            let chain = adapter.chain();
            let height = tokio::time::timeout(self.config.adapter_timeout(), adapter.current_height())
                .await
                .map_err(|_| BridgeError::Timeout {
                    operation: format!("{} height check", chain),
                })?
                .map_err(|e| {
                    error!("{} adapter failed initialization: {}", chain, e);
                    e
                })?;
            info!("{} reachable at height {}", chain, height);
        }

        if let Some(archive) = &self.archive {
            let records = archive.load_active().await?;
            let found = records.len();
            let requeued = self.store.restore(records).await;
            info!("Restored {} archived transfers, {} re-enqueued", found, requeued);

            for adapter in self.adapters.all() {
                if let Some(height) = archive.get_checkpoint(adapter.chain()).await? {
                    adapter.resume_from(height);
                }
            }

            self.archive_shutdown.send_replace(false);

            *self.archiver.lock().await = Some(tokio::spawn(state::run_archiver(
                self.store.clone(),
                archive.clone(),
                self.store.subscribe(),
                self.archive_shutdown.subscribe(),
            )));
        }

        self.shutdown.send_replace(false);
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer);
        tasks.extend(self.adapters.start_listeners(
            events_tx,
            self.config.listener_restart(),
            self.shutdown.subscribe(),
        ));

        let ingestor = self.ingestor.clone();
        tasks.push(tokio::spawn(async move { ingestor.run(events_rx).await }));

        for direction in Direction::ALL {
            tasks.push(tokio::spawn(
                self.scheduler
                    .clone()
                    .run(direction, self.shutdown.subscribe()),
            ));
        }

        self.status.refresh().await;
        tasks.push(tokio::spawn(self.status.clone().run(
            self.config.status_interval(),
            self.shutdown.subscribe(),
        )));

        self.control.activate();
        info!("Orchestrator {} active", self.config.instance_id);
        Ok(())
    }

    /// Stop all background activity. In-flight chain calls finish or time out.
    pub async fn stop(&self) {
        info!("Stopping orchestrator {}", self.config.instance_id);
        self.control.enter_maintenance();
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for joined in futures::future::join_all(tasks).await {
            if let Err(e) = joined {
                error!("Background task ended abnormally: {}", e);
            }
        }

        // Archive last so it sees the final state of drained attempts
        self.archive_shutdown.send_replace(true);
        if let Some(archiver) = self.archiver.lock().await.take() {
            if let Err(e) = archiver.await {
                error!("Archiver ended abnormally: {}", e);
            }
        }

        info!("Orchestrator stopped");
    }

    /// Accept a direct transfer request
    pub async fn create_transfer(
        &self,
        source_chain: Chain,
        target_chain: Chain,
        from: &str,
        to: &str,
        amount: &str,
    ) -> BridgeResult<BridgeTransaction> {
        self.control.ensure_accepting()?;

        let direction = Direction::between(source_chain, target_chain).ok_or_else(|| {
            BridgeError::InvalidTransfer(format!(
                "source and target chain are both {}",
                source_chain
            ))
        })?;

        let requested = parse_amount(amount).ok_or_else(|| {
            BridgeError::InvalidTransfer(format!("amount {:?} is not an unsigned integer", amount))
        })?;

        // Unknown liquidity does not block intake
        if let Some(available) = self.status.liquidity(target_chain).await {
            if available < requested {
                warn!(
                    "Rejecting transfer of {} to {}: only {} available",
                    requested, target_chain, available
                );
                return Err(BridgeError::Operational(format!(
                    "insufficient relayer balance on {}: have {}, need {}",
                    target_chain, available, requested
                )));
            }
        }

        let (fee, clamped) = clamp_fee(self.default_fee, self.max_fee);
        if clamped {
            warn!("Default fee clamped to max subsidy {}", self.max_fee);
        }

        let id = format!("{}_{}", direction.id_prefix(), Uuid::new_v4());
        let tx = BridgeTransaction::new(id, direction, from, to, requested.to_string())
            .with_fee(fee.to_string());

        let created = self.store.create(tx).await?;
        crate::metrics::record_transfer_created(direction);
        info!(
            "Created transfer {}: {} {} -> {}",
            created.id, created.amount, created.source_address, created.target_address
        );

        Ok(created)
    }

    pub async fn get_transaction(&self, id: &str) -> BridgeResult<BridgeTransaction> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| BridgeError::NotFound { id: id.to_string() })
    }

    pub async fn list_transactions(&self, filter: ListFilter) -> Vec<BridgeTransaction> {
        self.store.list(filter).await
    }

    pub async fn get_status(&self) -> BridgeStatus {
        let stats = self.store.stats().await;
        self.status.compose(self.control.state(), &stats).await
    }

    pub fn pause(&self) -> BridgeResult<()> {
        self.control.pause()
    }

    pub fn unpause(&self) -> BridgeResult<()> {
        self.control.unpause()
    }

    pub fn operational_state(&self) -> OperationalState {
        self.control.state()
    }

    /// Counts for monitoring: pending by direction and totals by status
    pub async fn health_counters(&self) -> StoreStats {
        self.store.stats().await
    }

    /// Lifecycle notifications for every transfer
    pub fn subscribe_updates(&self) -> broadcast::Receiver<TransferUpdate> {
        self.store.subscribe()
    }
}
