//! Durable archive of transfer records
//!
//! Handles:
//! - Mirroring every lifecycle change out of the in-memory store
//! - Reloading unfinished transfers for restart recovery
//! - Per-chain scan checkpoints so listeners resume where they stopped

mod postgres;

pub use postgres::PgArchive;

use crate::error::BridgeResult;
use crate::transfer::{BridgeTransaction, Chain, ListFilter, TransactionStore, TransferUpdate};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{error, info, warn};

/// Persistence seam for transfer records
#[async_trait]
pub trait TransactionArchive: Send + Sync {
    /// Write a record. A write carrying an older lifecycle state than the
    /// archived one is ignored.
    async fn upsert(&self, tx: &BridgeTransaction) -> BridgeResult<()>;

    async fn get(&self, id: &str) -> BridgeResult<Option<BridgeTransaction>>;

    /// Records still pending or processing
    async fn load_active(&self) -> BridgeResult<Vec<BridgeTransaction>>;

    /// Record that every event up to `height` on `chain` has been ingested.
    /// Checkpoints never move backward.
    async fn save_checkpoint(&self, chain: Chain, height: u64) -> BridgeResult<()>;

    async fn get_checkpoint(&self, chain: Chain) -> BridgeResult<Option<u64>>;
}

/// Archive held in process memory
#[derive(Default)]
pub struct MemoryArchive {
    records: RwLock<HashMap<String, BridgeTransaction>>,
    checkpoints: RwLock<HashMap<Chain, u64>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionArchive for MemoryArchive {
    async fn upsert(&self, tx: &BridgeTransaction) -> BridgeResult<()> {
        let mut records = self.records.write().await;
        match records.get(&tx.id) {
            Some(current)
                if current.status.rank() > tx.status.rank()
                    || (current.status.rank() == tx.status.rank()
                        && current.status != tx.status) => {}
            _ => {
                records.insert(tx.id.clone(), tx.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> BridgeResult<Option<BridgeTransaction>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn load_active(&self) -> BridgeResult<Vec<BridgeTransaction>> {
        let mut active: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|tx| tx.status.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    async fn save_checkpoint(&self, chain: Chain, height: u64) -> BridgeResult<()> {
        let mut checkpoints = self.checkpoints.write().await;
        let entry = checkpoints.entry(chain).or_insert(height);
        *entry = (*entry).max(height);
        Ok(())
    }

    async fn get_checkpoint(&self, chain: Chain) -> BridgeResult<Option<u64>> {
        Ok(self.checkpoints.read().await.get(&chain).copied())
    }
}

/// Mirror store updates into the archive until shutdown.
///
/// Archive failures are logged and never reach transfer processing. If the
/// update stream lags, every record is rewritten from the store.
pub async fn run_archiver(
    store: Arc<TransactionStore>,
    archive: Arc<dyn TransactionArchive>,
    mut updates: broadcast::Receiver<TransferUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Transfer archiver started");

    loop {
        let update = tokio::select! {
            update = updates.recv() => update,
            _ = shutdown.changed() => break,
        };

        match update {
            Ok(update) => {
                if let Err(e) = archive.upsert(&update.transaction).await {
                    error!("Failed to archive transfer {}: {}", update.transaction.id, e);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Archiver lagged by {} updates, resyncing", skipped);
                resync(&store, archive.as_ref()).await;
            }
            Err(RecvError::Closed) => break,
        }
    }

    // Catch anything published between the last update and shutdown
    resync(&store, archive.as_ref()).await;
    info!("Transfer archiver stopped");
}

async fn resync(store: &TransactionStore, archive: &dyn TransactionArchive) {
    for tx in store.list(ListFilter::All).await {
        if let Err(e) = archive.upsert(&tx).await {
            error!("Failed to archive transfer {}: {}", tx.id, e);
        }
    }
}
