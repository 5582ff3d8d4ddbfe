//! Event ingestor: applies chain events to the transaction store
//!
//! Lock events create transfers keyed on the chain event id, so redelivery
//! after a reconnect is absorbed. Release events complete an existing
//! transfer and never create one.
//!
//! With an archive attached, a new transfer is archived before any later
//! scan checkpoint for its chain, and a lock whose transfer is already
//! archived is treated as a duplicate.

use super::ChainEvent;
use crate::error::BridgeError;
use crate::state::TransactionArchive;
use crate::transfer::{
    clamp_fee, parse_amount, BridgeTransaction, Chain, Direction, ReleaseMatch, TransactionStore,
};

use ethers::types::U256;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What ingesting one event did to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new transfer was created
    Created(String),
    /// The lock event was already known
    Duplicate(String),
    /// The release completed a transfer
    Completed(String),
    /// The release referred to a transfer that was already completed
    AlreadyCompleted(String),
    /// The release matched no known transfer and was dropped
    Orphaned,
    /// The event was malformed or contradicted the store and was dropped
    Discarded(String),
    /// Scan progress for the chain was recorded
    Checkpointed(u64),
}

/// Converts chain-native events into transaction store entries
pub struct EventIngestor {
    store: Arc<TransactionStore>,
    max_fee: U256,
    archive: Option<Arc<dyn TransactionArchive>>,
}

impl EventIngestor {
    pub fn new(
        store: Arc<TransactionStore>,
        max_fee: U256,
        archive: Option<Arc<dyn TransactionArchive>>,
    ) -> Self {
        Self {
            store,
            max_fee,
            archive,
        }
    }

    /// Consume events until every sender is dropped
    pub async fn run(&self, mut events: mpsc::Receiver<ChainEvent>) {
        info!("Event ingestor started");

        while let Some(event) = events.recv().await {
            self.ingest(event).await;
        }

        info!("Event ingestor stopped");
    }

    /// Apply a single event to the store
    pub async fn ingest(&self, event: ChainEvent) -> IngestOutcome {
        let chain = event.chain();
        if let ChainEvent::Scanned { block_number, .. } = event {
            return self.checkpoint(chain, block_number).await;
        }
        crate::metrics::record_event(chain, event.name());

        let outcome = match event {
            ChainEvent::ValueLocked {
                chain,
                event_id,
                sender,
                target_address,
                amount,
                fee,
                source_tx_ref,
                ..
            } => {
                self.handle_locked(
                    chain,
                    event_id,
                    sender,
                    target_address,
                    amount,
                    fee,
                    source_tx_ref,
                )
                .await
            }

            ChainEvent::ValueReleased {
                chain,
                bridge_tx_id,
                source_tx_ref,
                target_tx_ref,
                ..
            } => {
                self.handle_released(chain, bridge_tx_id, source_tx_ref, target_tx_ref)
                    .await
            }

            ChainEvent::Scanned { block_number, .. } => IngestOutcome::Checkpointed(block_number),
        };

        match &outcome {
            IngestOutcome::Discarded(reason) => {
                warn!("Discarded {} event: {}", chain, reason);
                crate::metrics::record_event_discarded(chain);
            }
            IngestOutcome::Duplicate(id) => {
                debug!("Duplicate lock event {} on {}", id, chain);
                crate::metrics::record_event_duplicate(chain);
            }
            IngestOutcome::Orphaned => crate::metrics::record_event_orphaned(chain),
            _ => {}
        }

        outcome
    }

    /// Handle a source-side lock
    #[allow(clippy::too_many_arguments)]
    async fn handle_locked(
        &self,
        chain: Chain,
        event_id: String,
        sender: String,
        target_address: String,
        amount: String,
        fee: Option<String>,
        source_tx_ref: Option<String>,
    ) -> IngestOutcome {
        if event_id.trim().is_empty() {
            return IngestOutcome::Discarded("lock event without event id".to_string());
        }
        if parse_amount(&amount).is_none() {
            return IngestOutcome::Discarded(format!(
                "lock event {} has invalid amount {:?}",
                event_id, amount
            ));
        }

        let fee = match fee.as_deref().map(parse_amount) {
            None => None,
            Some(Some(fee)) => {
                let (fee, clamped) = clamp_fee(fee, self.max_fee);
                if clamped {
                    warn!(
                        "Fee on lock event {} exceeds subsidy ceiling, clamped to {}",
                        event_id, fee
                    );
                }
                Some(fee.to_string())
            }
            Some(None) => {
                return IngestOutcome::Discarded(format!(
                    "lock event {} has invalid fee {:?}",
                    event_id, fee
                ));
            }
        };

        if self.already_archived(&event_id).await {
            return IngestOutcome::Duplicate(event_id);
        }

        let direction = Direction::from_source(chain);
        let mut tx = BridgeTransaction::new(
            event_id.clone(),
            direction,
            sender,
            target_address,
            amount,
        );
        tx.fee = fee;
        tx.source_tx_ref = source_tx_ref.or_else(|| Some(event_id.clone()));

        match self.store.create(tx).await {
            Ok(tx) => {
                info!(
                    "Lock detected on {}: {} {} -> {} ({})",
                    chain, tx.amount, tx.source_address, tx.target_address, tx.id
                );
                crate::metrics::record_transfer_created(direction);
                if let Some(archive) = &self.archive {
                    if let Err(e) = archive.upsert(&tx).await {
                        error!("Failed to archive new transfer {}: {}", tx.id, e);
                    }
                }
                IngestOutcome::Created(tx.id)
            }
            Err(BridgeError::DuplicateId { id }) => IngestOutcome::Duplicate(id),
            Err(e) => IngestOutcome::Discarded(format!("lock event {}: {}", event_id, e)),
        }
    }

    async fn already_archived(&self, id: &str) -> bool {
        let Some(archive) = &self.archive else {
            return false;
        };
        match archive.get(id).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                // Release submission is idempotent, so creating is the safer miss
                warn!("Archive lookup for lock {} failed: {}", id, e);
                false
            }
        }
    }

    async fn checkpoint(&self, chain: Chain, height: u64) -> IngestOutcome {
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.save_checkpoint(chain, height).await {
                warn!("Failed to save {} checkpoint at {}: {}", chain, height, e);
            }
        }
        IngestOutcome::Checkpointed(height)
    }

    /// Handle a target-side release
    async fn handle_released(
        &self,
        chain: Chain,
        bridge_tx_id: Option<String>,
        source_tx_ref: Option<String>,
        target_tx_ref: String,
    ) -> IngestOutcome {
        if target_tx_ref.trim().is_empty() {
            return IngestOutcome::Discarded("release event without transaction ref".to_string());
        }
        if bridge_tx_id.is_none() && source_tx_ref.is_none() {
            return IngestOutcome::Discarded(
                "release event names neither transfer nor source".to_string(),
            );
        }

        let result = self
            .store
            .settle_release(
                chain,
                bridge_tx_id.as_deref(),
                source_tx_ref.as_deref(),
                &target_tx_ref,
            )
            .await;

        match result {
            Ok(ReleaseMatch::Completed(tx)) => {
                info!("Release confirmed on {} for {}: {}", chain, tx.id, target_tx_ref);
                crate::metrics::record_transfer_completed(tx.direction());
                IngestOutcome::Completed(tx.id)
            }
            Ok(ReleaseMatch::AlreadyCompleted(id)) => {
                debug!("Release for {} already recorded", id);
                IngestOutcome::AlreadyCompleted(id)
            }
            Ok(ReleaseMatch::Unknown) => {
                warn!(
                    "Dropping release on {} with no matching lock (transfer {:?}, source {:?})",
                    chain, bridge_tx_id, source_tx_ref
                );
                IngestOutcome::Orphaned
            }
            Err(e) => {
                error!("Release on {} contradicts the store: {}", chain, e);
                IngestOutcome::Discarded(e.to_string())
            }
        }
    }
}
