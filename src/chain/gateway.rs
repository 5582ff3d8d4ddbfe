//! Aleo bridge adapter over a JSON-RPC gateway
//!
//! The gateway owns the Aleo program interaction and proof generation. It
//! exposes the `bridge_*` methods used here and deduplicates release
//! submissions on the idempotency key.

use super::{classify_submit_error, ChainAdapter, ReleaseRequest};
use crate::config::AleoConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::events::ChainEvent;
use crate::transfer::Chain;

use async_trait::async_trait;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Maximum height span requested per `bridge_events` call
const MAX_HEIGHT_RANGE: u64 = 500;

#[derive(Debug, Clone, Serialize)]
struct SubmitReleaseParams<'a> {
    program_id: &'a str,
    transfer_id: &'a str,
    recipient: &'a str,
    amount: &'a str,
    source_tx_ref: Option<&'a str>,
    idempotency_key: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubmitReleaseResult {
    transaction_id: String,
}

/// Bridge program event as reported by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayEvent {
    Locked {
        event_id: String,
        sender: String,
        recipient: String,
        amount: String,
        #[serde(default)]
        fee: Option<String>,
        transaction_id: String,
        height: u64,
    },
    Released {
        #[serde(default)]
        transfer_id: Option<String>,
        #[serde(default)]
        source_tx_ref: Option<String>,
        recipient: String,
        amount: String,
        transaction_id: String,
        height: u64,
    },
}

impl From<GatewayEvent> for ChainEvent {
    fn from(event: GatewayEvent) -> Self {
        match event {
            GatewayEvent::Locked {
                event_id,
                sender,
                recipient,
                amount,
                fee,
                transaction_id,
                height,
            } => ChainEvent::ValueLocked {
                chain: Chain::Aleo,
                event_id,
                sender,
                target_address: recipient,
                amount,
                fee,
                source_tx_ref: Some(transaction_id),
                block_number: height,
            },
            GatewayEvent::Released {
                transfer_id,
                source_tx_ref,
                recipient,
                amount,
                transaction_id,
                height,
            } => ChainEvent::ValueReleased {
                chain: Chain::Aleo,
                recipient,
                amount,
                source_tx_ref,
                bridge_tx_id: transfer_id,
                target_tx_ref: transaction_id,
                block_number: height,
            },
        }
    }
}

/// `ChainAdapter` for the Aleo bridge program
pub struct GatewayAdapter {
    config: AleoConfig,
    client: Provider<Http>,
    last_scanned: AtomicU64,
}

impl GatewayAdapter {
    pub fn new(config: AleoConfig) -> BridgeResult<Self> {
        let client = Provider::<Http>::try_from(config.gateway_url.as_str())
            .map_err(|e| BridgeError::Config(format!("Invalid Aleo gateway URL: {}", e)))?;

        info!(
            "Aleo adapter for {} using gateway {}",
            config.network, config.gateway_url
        );

        Ok(Self {
            last_scanned: AtomicU64::new(config.start_height.map_or(0, |h| h.saturating_sub(1))),
            config,
            client,
        })
    }

    async fn request<T, R>(&self, method: &str, params: T) -> BridgeResult<R>
    where
        T: Debug + Serialize + Send + Sync,
        R: Debug + Serialize + DeserializeOwned + Send,
    {
        self.client
            .request(method, params)
            .await
            .map_err(|e| BridgeError::Adapter {
                chain: Chain::Aleo,
                message: format!("{} failed: {}", method, e),
            })
    }
}

/// The gateway answered with a JSON-RPC error: it understood and refused
fn submit_error(error: ProviderError, amount: &str) -> BridgeError {
    if let ProviderError::JsonRpcClientError(inner) = &error {
        if let Some(response) = inner.as_error_response() {
            return match classify_submit_error(Chain::Aleo, response.message.clone(), amount) {
                BridgeError::Adapter { chain, message } => BridgeError::Rejected { chain, message },
                classified => classified,
            };
        }
    }

    BridgeError::Adapter {
        chain: Chain::Aleo,
        message: error.to_string(),
    }
}

#[async_trait]
impl ChainAdapter for GatewayAdapter {
    fn chain(&self) -> Chain {
        Chain::Aleo
    }

    fn bridge_address(&self) -> String {
        self.config.bridge_program_id.clone()
    }

    fn synced_height(&self) -> Option<u64> {
        match self.last_scanned.load(Ordering::Relaxed) {
            0 => None,
            height => Some(height),
        }
    }

    fn resume_from(&self, height: u64) {
        info!("Aleo listener resuming after height {}", height);
        self.last_scanned.store(height, Ordering::Relaxed);
    }

    async fn current_height(&self) -> BridgeResult<u64> {
        self.request("bridge_blockHeight", json!([])).await
    }

    async fn is_final(&self, reference: &str) -> BridgeResult<bool> {
        self.request(
            "bridge_isFinal",
            json!([reference, self.config.confirmation_blocks]),
        )
        .await
    }

    async fn submit_release(&self, request: &ReleaseRequest) -> BridgeResult<String> {
        if request.direction.target() != Chain::Aleo {
            return Err(BridgeError::Internal(format!(
                "{} release routed to the Aleo adapter",
                request.direction
            )));
        }

        let params = SubmitReleaseParams {
            program_id: &self.config.bridge_program_id,
            transfer_id: &request.transfer_id,
            recipient: &request.recipient,
            amount: &request.amount,
            source_tx_ref: request.source_tx_ref.as_deref(),
            idempotency_key: &request.idempotency_key,
        };

        let result: SubmitReleaseResult = self
            .client
            .request("bridge_submitRelease", [params])
            .await
            .map_err(|e| submit_error(e, &request.amount))?;

        info!(
            "Submitted Aleo release for {}: {}",
            request.transfer_id, result.transaction_id
        );
        Ok(result.transaction_id)
    }

    async fn liquidity(&self) -> BridgeResult<String> {
        self.request(
            "bridge_liquidity",
            json!([self.config.bridge_program_id, self.config.token_program_id]),
        )
        .await
    }

    async fn listen(&self, sink: mpsc::Sender<ChainEvent>) -> BridgeResult<()> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        if self.last_scanned.load(Ordering::Relaxed) == 0 && self.config.start_height.is_none() {
            let head = self.current_height().await?;
            self.last_scanned.store(head, Ordering::Relaxed);
        }
        info!("Polling Aleo bridge events every {:?}", poll_interval);

        loop {
            if sink.is_closed() {
                return Ok(());
            }

            let current_height = match self.current_height().await {
                Ok(h) => h,
                Err(e) => {
                    warn!("Failed to get Aleo height: {}", e);
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            let last_height = self.last_scanned.load(Ordering::Relaxed);
            if current_height <= last_height {
                tokio::time::sleep(poll_interval).await;
                continue;
            }

            let from_height = last_height + 1;
            let to_height = current_height.min(from_height + MAX_HEIGHT_RANGE - 1);
            debug!("Aleo: processing heights {} to {}", from_height, to_height);

            let events: Vec<serde_json::Value> = self
                .request(
                    "bridge_events",
                    json!([self.config.bridge_program_id, from_height, to_height]),
                )
                .await?;

            for raw in events {
                match serde_json::from_value::<GatewayEvent>(raw) {
                    Ok(event) => {
                        if sink.send(event.into()).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        warn!("Failed to parse Aleo gateway event: {}", e);
                        crate::metrics::record_event_discarded(Chain::Aleo);
                    }
                }
            }

            self.last_scanned.store(to_height, Ordering::Relaxed);
            crate::metrics::record_blocks_processed(Chain::Aleo, to_height);

            let scanned = ChainEvent::Scanned {
                chain: Chain::Aleo,
                block_number: to_height,
            };
            if sink.send(scanned).await.is_err() {
                return Ok(());
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AleoConfig {
        AleoConfig {
            network: "testnet".to_string(),
            gateway_url: "http://localhost:3030".to_string(),
            bridge_program_id: "ghostzk_bridge.aleo".to_string(),
            token_program_id: "ghostzk_token.aleo".to_string(),
            confirmation_blocks: 10,
            poll_interval_ms: 100,
            start_height: None,
        }
    }

    #[test]
    fn test_gateway_events_map_to_chain_events() {
        let locked: GatewayEvent = serde_json::from_value(json!({
            "kind": "locked",
            "event_id": "evt9",
            "sender": "aleo1sender",
            "recipient": "0xB",
            "amount": "250",
            "transaction_id": "at1lock",
            "height": 77
        }))
        .unwrap();

        match ChainEvent::from(locked) {
            ChainEvent::ValueLocked {
                chain,
                event_id,
                fee,
                source_tx_ref,
                block_number,
                ..
            } => {
                assert_eq!(chain, Chain::Aleo);
                assert_eq!(event_id, "evt9");
                assert_eq!(fee, None);
                assert_eq!(source_tx_ref.as_deref(), Some("at1lock"));
                assert_eq!(block_number, 77);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let released: GatewayEvent = serde_json::from_value(json!({
            "kind": "released",
            "transfer_id": "eth_aleo_1",
            "recipient": "aleo1X",
            "amount": "1000",
            "transaction_id": "at1release",
            "height": 80
        }))
        .unwrap();

        let event = ChainEvent::from(released);
        assert_eq!(event.name(), "value_released");
        assert!(matches!(
            event,
            ChainEvent::ValueReleased { ref bridge_tx_id, ref target_tx_ref, .. }
                if bridge_tx_id.as_deref() == Some("eth_aleo_1") && target_tx_ref == "at1release"
        ));
    }

    #[test]
    fn test_unknown_event_kind_is_rejected() {
        let result = serde_json::from_value::<GatewayEvent>(json!({"kind": "minted"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_adapter_identity() {
        let adapter = GatewayAdapter::new(config()).unwrap();
        assert_eq!(adapter.chain(), Chain::Aleo);
        assert_eq!(adapter.bridge_address(), "ghostzk_bridge.aleo");
        assert_eq!(adapter.synced_height(), None);

        adapter.resume_from(812);
        assert_eq!(adapter.synced_height(), Some(812));
    }
}
