//! In-memory `ChainAdapter` with scripted behavior for tests

use super::{ChainAdapter, ReleaseRequest};
use crate::error::{BridgeError, BridgeResult};
use crate::events::ChainEvent;
use crate::transfer::Chain;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct ScriptedAdapter {
    chain: Chain,
    pub is_final: AtomicBool,
    pub fail_submit: Mutex<Option<fn(Chain) -> BridgeError>>,
    pub fail_height: AtomicBool,
    pub delay: Duration,
    pub height: AtomicU64,
    pub liquidity: Mutex<String>,
    /// Events handed to the first `listen` call
    pub events: Mutex<Vec<ChainEvent>>,
    /// Every call to `submit_release`
    pub submits: AtomicUsize,
    /// Idempotency key -> tx ref; one entry per on-chain effect
    pub effects: Mutex<HashMap<String, String>>,
    concurrent: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    /// Last height handed to `resume_from`
    pub resumed_from: Mutex<Option<u64>>,
}

/// Counts a submission as in progress until dropped, including on cancellation
struct InProgress<'a>(&'a AtomicUsize);

impl<'a> InProgress<'a> {
    fn enter(counter: &'a AtomicUsize) -> (Self, usize) {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        (Self(counter), now)
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedAdapter {
    pub fn healthy(chain: Chain) -> Self {
        Self {
            chain,
            is_final: AtomicBool::new(true),
            fail_submit: Mutex::new(None),
            fail_height: AtomicBool::new(false),
            delay: Duration::ZERO,
            height: AtomicU64::new(100),
            liquidity: Mutex::new("1000000".to_string()),
            events: Mutex::new(Vec::new()),
            submits: AtomicUsize::new(0),
            effects: Mutex::new(HashMap::new()),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            resumed_from: Mutex::new(None),
        }
    }

    pub fn failing(chain: Chain, make_error: fn(Chain) -> BridgeError) -> Self {
        let adapter = Self::healthy(chain);
        adapter.set_submit_failure(Some(make_error));
        adapter
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_events(self, events: Vec<ChainEvent>) -> Self {
        *self.events.lock().unwrap() = events;
        self
    }

    pub fn set_submit_failure(&self, make_error: Option<fn(Chain) -> BridgeError>) {
        *self.fail_submit.lock().unwrap() = make_error;
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn effect_count(&self) -> usize {
        self.effects.lock().unwrap().len()
    }
}

pub fn rpc_down(chain: Chain) -> BridgeError {
    BridgeError::Adapter {
        chain,
        message: "rpc unavailable".to_string(),
    }
}

pub fn reverted(chain: Chain) -> BridgeError {
    BridgeError::Rejected {
        chain,
        message: "execution reverted".to_string(),
    }
}

#[async_trait]
impl ChainAdapter for ScriptedAdapter {
    fn chain(&self) -> Chain {
        self.chain
    }

    fn bridge_address(&self) -> String {
        format!("{}-bridge", self.chain)
    }

    fn synced_height(&self) -> Option<u64> {
        *self.resumed_from.lock().unwrap()
    }

    fn resume_from(&self, height: u64) {
        *self.resumed_from.lock().unwrap() = Some(height);
    }

    async fn current_height(&self) -> BridgeResult<u64> {
        if self.fail_height.load(Ordering::SeqCst) {
            return Err(rpc_down(self.chain));
        }
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn is_final(&self, _reference: &str) -> BridgeResult<bool> {
        Ok(self.is_final.load(Ordering::SeqCst))
    }

    async fn submit_release(&self, request: &ReleaseRequest) -> BridgeResult<String> {
        let (in_progress, now) = InProgress::enter(&self.concurrent);
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        self.submits.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        drop(in_progress);

        let failure = *self.fail_submit.lock().unwrap();
        if let Some(make_error) = failure {
            return Err(make_error(self.chain));
        }

        let mut effects = self.effects.lock().unwrap();
        let tx_ref = effects
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| format!("{}-release-{}", self.chain, request.transfer_id));
        Ok(tx_ref.clone())
    }

    async fn liquidity(&self) -> BridgeResult<String> {
        Ok(self.liquidity.lock().unwrap().clone())
    }

    async fn listen(&self, sink: mpsc::Sender<ChainEvent>) -> BridgeResult<()> {
        let events: Vec<ChainEvent> = self.events.lock().unwrap().drain(..).collect();
        for event in events {
            if sink.send(event).await.is_err() {
                return Ok(());
            }
        }
        // Stay subscribed until the ingestor goes away
        sink.closed().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::Direction;

    fn request() -> ReleaseRequest {
        ReleaseRequest {
            transfer_id: "eth_aleo_1".to_string(),
            direction: Direction::EthereumToAleo,
            recipient: "aleo1X".to_string(),
            amount: "10".to_string(),
            source_tx_ref: None,
            idempotency_key: "eth_aleo_1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_cancelled_submission_leaves_no_call_in_progress() {
        let adapter = ScriptedAdapter::healthy(Chain::Aleo).with_delay(Duration::from_millis(200));

        let result =
            tokio::time::timeout(Duration::from_millis(10), adapter.submit_release(&request()))
                .await;
        assert!(result.is_err());

        assert_eq!(adapter.concurrent.load(Ordering::SeqCst), 0);
        assert_eq!(adapter.max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.effect_count(), 0);
    }
}
