//! In-memory transaction store with per-direction pending work sets

use super::{
    parse_amount, BridgeTransaction, Chain, Direction, ListFilter, TransferStatus, TransferUpdate,
    TransitionFields, UpdateKind,
};
use crate::error::{BridgeError, BridgeResult};

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Records and work sets are guarded by one lock so every
/// read-modify-write sequence is atomic across components.
struct StoreInner {
    /// All transfers ever created, keyed by id
    transactions: HashMap<String, BridgeTransaction>,
    /// Ids awaiting progression, one set per direction
    pending: HashMap<Direction, HashSet<String>>,
}

impl StoreInner {
    fn pending_set(&mut self, direction: Direction) -> &mut HashSet<String> {
        self.pending.entry(direction).or_default()
    }
}

/// Outcome of applying a target-side release to the store
#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseMatch {
    /// The matching transfer moved to `Completed`
    Completed(BridgeTransaction),
    /// The matching transfer was already `Completed`
    AlreadyCompleted(String),
    /// No transfer matches the release
    Unknown,
}

/// Authoritative record of every transfer and its lifecycle state
pub struct TransactionStore {
    inner: RwLock<StoreInner>,
    updates: broadcast::Sender<TransferUpdate>,
}

impl TransactionStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(StoreInner {
                transactions: HashMap::new(),
                pending: HashMap::new(),
            }),
            updates,
        }
    }

    /// Subscribe to transfer lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TransferUpdate> {
        self.updates.subscribe()
    }

    fn publish(&self, kind: UpdateKind, tx: &BridgeTransaction) {
        // No subscribers is fine
        let _ = self.updates.send(TransferUpdate {
            kind,
            transaction: tx.clone(),
        });
    }

    /// Insert a new transfer as `Pending` and enqueue it for its direction
    pub async fn create(&self, mut tx: BridgeTransaction) -> BridgeResult<BridgeTransaction> {
        validate(&tx)?;

        tx.status = TransferStatus::Pending;
        tx.target_tx_ref = None;
        tx.error_message = None;

        let mut inner = self.inner.write().await;
        if inner.transactions.contains_key(&tx.id) {
            return Err(BridgeError::DuplicateId { id: tx.id });
        }

        let direction = tx.direction();
        inner.pending_set(direction).insert(tx.id.clone());
        inner.transactions.insert(tx.id.clone(), tx.clone());
        drop(inner);

        debug!("Created transfer {} ({})", tx.id, direction);
        self.publish(UpdateKind::Created, &tx);
        Ok(tx)
    }

    /// Move a transfer to `new_status`, applying `fields` in the same step
    pub async fn transition(
        &self,
        id: &str,
        new_status: TransferStatus,
        fields: TransitionFields,
    ) -> BridgeResult<BridgeTransaction> {
        let mut inner = self.inner.write().await;
        let updated = apply_transition(&mut inner, id, new_status, fields)?;
        drop(inner);

        self.publish(UpdateKind::for_status(new_status), &updated);
        Ok(updated)
    }

    /// Complete the transfer a release on `chain` refers to.
    ///
    /// Looks up by bridge transfer id first, then by source reference; only
    /// transfers targeting `chain` match. A `Pending` match is walked through
    /// `Processing` so no state is skipped.
    pub async fn settle_release(
        &self,
        chain: Chain,
        bridge_tx_id: Option<&str>,
        source_tx_ref: Option<&str>,
        target_tx_ref: &str,
    ) -> BridgeResult<ReleaseMatch> {
        let mut inner = self.inner.write().await;

        let id = bridge_tx_id
            .filter(|id| {
                inner
                    .transactions
                    .get(*id)
                    .map(|tx| tx.target_chain == chain)
                    .unwrap_or(false)
            })
            .map(str::to_string)
            .or_else(|| {
                source_tx_ref.and_then(|reference| {
                    inner
                        .transactions
                        .values()
                        .find(|tx| {
                            tx.target_chain == chain
                                && tx.source_tx_ref.as_deref() == Some(reference)
                        })
                        .map(|tx| tx.id.clone())
                })
            });

        let Some(id) = id else {
            return Ok(ReleaseMatch::Unknown);
        };

        let mut published = Vec::new();
        let status = inner.transactions[&id].status;
        match status {
            TransferStatus::Completed => return Ok(ReleaseMatch::AlreadyCompleted(id)),
            TransferStatus::Pending => {
                let processing = apply_transition(
                    &mut inner,
                    &id,
                    TransferStatus::Processing,
                    TransitionFields::none(),
                )?;
                published.push((UpdateKind::Processing, processing));
            }
            _ => {}
        }

        let completed = apply_transition(
            &mut inner,
            &id,
            TransferStatus::Completed,
            TransitionFields::completed(target_tx_ref),
        )?;
        drop(inner);

        published.push((UpdateKind::Completed, completed.clone()));
        for (kind, tx) in &published {
            self.publish(*kind, tx);
        }

        Ok(ReleaseMatch::Completed(completed))
    }

    /// Get a transfer by id
    pub async fn get(&self, id: &str) -> Option<BridgeTransaction> {
        self.inner.read().await.transactions.get(id).cloned()
    }

    /// List transfers matching `filter`, oldest first
    pub async fn list(&self, filter: ListFilter) -> Vec<BridgeTransaction> {
        let mut txs: Vec<_> = self
            .inner
            .read()
            .await
            .transactions
            .values()
            .filter(|tx| filter.matches(tx))
            .cloned()
            .collect();
        txs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        txs
    }

    /// Snapshot of the ids in one direction's pending work set
    pub async fn pending_ids(&self, direction: Direction) -> Vec<String> {
        self.inner
            .read()
            .await
            .pending
            .get(&direction)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop an id from a pending set unless it still names an active transfer.
    /// Returns true if the id was removed.
    pub async fn forget_pending(&self, direction: Direction, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let active = inner
            .transactions
            .get(id)
            .map(|tx| tx.status.is_active() && tx.direction() == direction)
            .unwrap_or(false);
        if active {
            return false;
        }
        inner.pending_set(direction).remove(id)
    }

    /// Aggregate counts by status and direction
    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.read().await;
        let mut stats = StoreStats::default();

        for tx in inner.transactions.values() {
            stats.total += 1;
            match tx.status {
                TransferStatus::Pending => stats.pending += 1,
                TransferStatus::Processing => stats.processing += 1,
                TransferStatus::Completed => stats.completed += 1,
                TransferStatus::Failed => stats.failed += 1,
            }
        }

        stats.pending_ethereum_to_aleo = inner
            .pending
            .get(&Direction::EthereumToAleo)
            .map(HashSet::len)
            .unwrap_or(0) as u64;
        stats.pending_aleo_to_ethereum = inner
            .pending
            .get(&Direction::AleoToEthereum)
            .map(HashSet::len)
            .unwrap_or(0) as u64;

        stats
    }

    /// Load records recovered after a restart.
    ///
    /// Transfers found in `Processing` re-enter as `Pending` so they are
    /// retried; records already in the store are left untouched. Returns the
    /// number of transfers re-enqueued.
    pub async fn restore(&self, records: Vec<BridgeTransaction>) -> usize {
        let mut inner = self.inner.write().await;
        let mut requeued = 0;

        for mut tx in records {
            if inner.transactions.contains_key(&tx.id) {
                warn!("Skipping restore of {}: already present", tx.id);
                continue;
            }

            if tx.status == TransferStatus::Processing {
                info!("Re-enqueuing {} interrupted while processing", tx.id);
                tx.status = TransferStatus::Pending;
            }

            if tx.status.is_active() {
                inner.pending_set(tx.direction()).insert(tx.id.clone());
                requeued += 1;
            }
            inner.transactions.insert(tx.id.clone(), tx);
        }

        requeued
    }
}

impl Default for TransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(tx: &BridgeTransaction) -> BridgeResult<()> {
    if tx.id.trim().is_empty() {
        return Err(BridgeError::InvalidTransfer("empty id".to_string()));
    }
    if tx.source_chain == tx.target_chain {
        return Err(BridgeError::InvalidTransfer(format!(
            "source and target chain are both {}",
            tx.source_chain
        )));
    }
    if tx.source_address.trim().is_empty() || tx.target_address.trim().is_empty() {
        return Err(BridgeError::InvalidTransfer("empty address".to_string()));
    }
    if parse_amount(&tx.amount).is_none() {
        return Err(BridgeError::InvalidTransfer(format!(
            "amount {:?} is not an unsigned integer",
            tx.amount
        )));
    }
    if let Some(fee) = &tx.fee {
        if parse_amount(fee).is_none() {
            return Err(BridgeError::InvalidTransfer(format!(
                "fee {:?} is not an unsigned integer",
                fee
            )));
        }
    }
    Ok(())
}

fn apply_transition(
    inner: &mut StoreInner,
    id: &str,
    new_status: TransferStatus,
    fields: TransitionFields,
) -> BridgeResult<BridgeTransaction> {
    let tx = inner
        .transactions
        .get_mut(id)
        .ok_or_else(|| BridgeError::NotFound { id: id.to_string() })?;

    if !tx.status.can_transition_to(new_status) {
        return Err(BridgeError::InvalidTransition {
            from: tx.status.to_string(),
            to: new_status.to_string(),
        });
    }

    tx.status = new_status;
    if let Some(target_tx_ref) = fields.target_tx_ref {
        tx.target_tx_ref = Some(target_tx_ref);
    }
    if let Some(fee) = fields.fee {
        tx.fee = Some(fee);
    }
    if new_status == TransferStatus::Failed {
        tx.error_message = fields
            .error_message
            .or_else(|| Some("transfer failed".to_string()));
    }

    let updated = tx.clone();
    if new_status.is_terminal() {
        inner.pending_set(updated.direction()).remove(id);
    }

    debug!("Transfer {} -> {}", id, new_status);
    Ok(updated)
}

/// Transfer counts by status and pending direction
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending_ethereum_to_aleo: u64,
    pub pending_aleo_to_ethereum: u64,
}

impl StoreStats {
    pub fn pending_total(&self) -> u64 {
        self.pending_ethereum_to_aleo + self.pending_aleo_to_ethereum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_tx(id: &str) -> BridgeTransaction {
        BridgeTransaction::new(id, Direction::EthereumToAleo, "0xA", "aleo1X", "1000")
            .with_source_ref(format!("0xsrc_{}", id))
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let store = TransactionStore::new();
        store.create(lock_tx("evt1")).await.unwrap();

        let err = store.create(lock_tx("evt1")).await.unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateId { ref id } if id == "evt1"));
        assert_eq!(store.stats().await.total, 1);
    }

    #[tokio::test]
    async fn test_create_validates_fields() {
        let store = TransactionStore::new();

        let mut bad_amount = lock_tx("a");
        bad_amount.amount = "-1".to_string();
        assert!(matches!(
            store.create(bad_amount).await,
            Err(BridgeError::InvalidTransfer(_))
        ));

        let mut same_chain = lock_tx("b");
        same_chain.target_chain = same_chain.source_chain;
        assert!(store.create(same_chain).await.is_err());

        let mut no_address = lock_tx("c");
        no_address.target_address = "  ".to_string();
        assert!(store.create(no_address).await.is_err());

        assert_eq!(store.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_pending_set_tracks_active_status() {
        let store = TransactionStore::new();
        store.create(lock_tx("t1")).await.unwrap();
        store
            .create(BridgeTransaction::new(
                "t2",
                Direction::AleoToEthereum,
                "aleo1Y",
                "0xB",
                "7",
            ))
            .await
            .unwrap();

        assert_eq!(store.pending_ids(Direction::EthereumToAleo).await, vec!["t1"]);
        assert_eq!(store.pending_ids(Direction::AleoToEthereum).await, vec!["t2"]);

        store
            .transition("t1", TransferStatus::Processing, TransitionFields::none())
            .await
            .unwrap();
        assert_eq!(store.pending_ids(Direction::EthereumToAleo).await.len(), 1);

        let done = store
            .transition(
                "t1",
                TransferStatus::Completed,
                TransitionFields::completed("aleo_tx_1"),
            )
            .await
            .unwrap();
        assert_eq!(done.target_tx_ref.as_deref(), Some("aleo_tx_1"));
        assert_eq!(store.pending_ids(Direction::EthereumToAleo).await.len(), 0);

        store
            .transition("t2", TransferStatus::Failed, TransitionFields::failed("boom"))
            .await
            .unwrap();
        let failed = store.get("t2").await.unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert_eq!(store.pending_ids(Direction::AleoToEthereum).await.len(), 0);

        let stats = store.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending_total(), 0);
    }

    #[tokio::test]
    async fn test_transition_errors() {
        let store = TransactionStore::new();
        assert!(matches!(
            store
                .transition("missing", TransferStatus::Processing, TransitionFields::none())
                .await,
            Err(BridgeError::NotFound { .. })
        ));

        store.create(lock_tx("t1")).await.unwrap();
        let err = store
            .transition("t1", TransferStatus::Completed, TransitionFields::completed("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTransition { .. }));

        // A rejected transition leaves the record untouched
        let tx = store.get("t1").await.unwrap();
        assert_eq!(tx.status, TransferStatus::Pending);
        assert_eq!(tx.target_tx_ref, None);
    }

    #[tokio::test]
    async fn test_settle_release_by_id_and_source_ref() {
        let store = TransactionStore::new();
        store.create(lock_tx("t1")).await.unwrap();
        store.create(lock_tx("t2")).await.unwrap();
        let mut updates = store.subscribe();

        let by_id = store
            .settle_release(Chain::Aleo, Some("t1"), None, "0xrelease1")
            .await
            .unwrap();
        assert!(matches!(by_id, ReleaseMatch::Completed(ref tx) if tx.id == "t1"));
        assert_eq!(updates.recv().await.unwrap().kind, UpdateKind::Processing);
        assert_eq!(updates.recv().await.unwrap().kind, UpdateKind::Completed);

        let by_ref = store
            .settle_release(Chain::Aleo, Some("unknown"), Some("0xsrc_t2"), "0xrelease2")
            .await
            .unwrap();
        assert!(matches!(by_ref, ReleaseMatch::Completed(ref tx) if tx.id == "t2"));

        let again = store
            .settle_release(Chain::Aleo, Some("t1"), None, "0xrelease1")
            .await
            .unwrap();
        assert_eq!(again, ReleaseMatch::AlreadyCompleted("t1".to_string()));

        let orphan = store
            .settle_release(Chain::Aleo, Some("nope"), Some("0xnothing"), "0xr")
            .await
            .unwrap();
        assert_eq!(orphan, ReleaseMatch::Unknown);

        // A release on the source chain never settles the transfer
        store.create(lock_tx("t3")).await.unwrap();
        let wrong_side = store
            .settle_release(Chain::Ethereum, Some("t3"), None, "0xr")
            .await
            .unwrap();
        assert_eq!(wrong_side, ReleaseMatch::Unknown);
        assert_eq!(store.stats().await.total, 3);
    }

    #[tokio::test]
    async fn test_restore_requeues_processing_as_pending() {
        let store = TransactionStore::new();

        let mut interrupted = lock_tx("p1");
        interrupted.status = TransferStatus::Processing;
        let mut done = lock_tx("c1");
        done.status = TransferStatus::Completed;
        done.target_tx_ref = Some("aleo_tx".to_string());

        let requeued = store.restore(vec![interrupted, done]).await;
        assert_eq!(requeued, 1);
        assert_eq!(store.get("p1").await.unwrap().status, TransferStatus::Pending);
        assert_eq!(store.pending_ids(Direction::EthereumToAleo).await, vec!["p1"]);
        assert_eq!(
            store.list(ListFilter::Active).await.len(),
            1,
            "completed transfers stay out of the work set"
        );
    }

    #[tokio::test]
    async fn test_forget_pending_keeps_active_ids() {
        let store = TransactionStore::new();
        store.create(lock_tx("t1")).await.unwrap();

        assert!(!store.forget_pending(Direction::EthereumToAleo, "t1").await);
        assert!(!store.forget_pending(Direction::EthereumToAleo, "ghost").await);
        assert_eq!(store.pending_ids(Direction::EthereumToAleo).await.len(), 1);
    }
}
