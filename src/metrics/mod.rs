//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain reachability, height and liquidity
//! - Event intake per chain
//! - Transfer lifecycle and reconciliation per direction
//! - The operational flag

use crate::coordination::OperationalState;
use crate::error::{BridgeError, BridgeResult};
use crate::transfer::{Chain, Direction};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "bridge_chain_connected",
        "Chain reachability (1=reachable, 0=unreachable)",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "bridge_chain_block_height",
        "Latest observed head per chain",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_SCANNED_HEIGHT: GaugeVec = register_gauge_vec!(
        "bridge_chain_scanned_height",
        "Highest block scanned by the event subscription",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_LIQUIDITY: GaugeVec = register_gauge_vec!(
        "bridge_liquidity",
        "Bridge liquidity per chain in base units",
        &["chain"]
    ).unwrap();

    pub static ref LISTENER_RESTARTS: CounterVec = register_counter_vec!(
        "bridge_listener_restarts_total",
        "Chain subscription restarts",
        &["chain"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "bridge_events_received_total",
        "Chain events received by type",
        &["chain", "event_type"]
    ).unwrap();

    pub static ref EVENTS_DROPPED: CounterVec = register_counter_vec!(
        "bridge_events_dropped_total",
        "Chain events not turned into a state change",
        &["chain", "reason"]
    ).unwrap();

    // Transfer metrics
    pub static ref TRANSFERS_CREATED: CounterVec = register_counter_vec!(
        "bridge_transfers_created_total",
        "Transfers created",
        &["direction"]
    ).unwrap();

    pub static ref TRANSFERS_COMPLETED: CounterVec = register_counter_vec!(
        "bridge_transfers_completed_total",
        "Transfers completed",
        &["direction"]
    ).unwrap();

    pub static ref TRANSFERS_FAILED: CounterVec = register_counter_vec!(
        "bridge_transfers_failed_total",
        "Transfers failed",
        &["direction"]
    ).unwrap();

    pub static ref TRANSFER_RETRIES: CounterVec = register_counter_vec!(
        "bridge_transfer_retries_total",
        "Recoverable reconciliation failures",
        &["direction"]
    ).unwrap();

    pub static ref PENDING_TRANSFERS: GaugeVec = register_gauge_vec!(
        "bridge_pending_transfers",
        "Size of the pending work set",
        &["direction"]
    ).unwrap();

    pub static ref RECONCILE_LATENCY: HistogramVec = register_histogram_vec!(
        "bridge_reconcile_latency_seconds",
        "Duration of one reconciliation attempt",
        &["direction"],
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // Operational state (0=active, 1=paused, 2=maintenance)
    pub static ref OPERATIONAL_STATE: Gauge = register_gauge!(
        "bridge_operational_state",
        "Operational flag (0=active, 1=paused, 2=maintenance)"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> BridgeResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::Internal(format!("metrics bind {}: {}", addr, e)))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| BridgeError::Internal(format!("metrics server: {}", e)))
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain: Chain, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_chain_height(chain: Chain, height: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[chain.as_str()])
        .set(height as f64);
}

pub fn record_blocks_processed(chain: Chain, block_number: u64) {
    CHAIN_SCANNED_HEIGHT
        .with_label_values(&[chain.as_str()])
        .set(block_number as f64);
}

/// Liquidity arrives as a decimal string; precision loss is fine for a gauge
pub fn record_liquidity(chain: Chain, liquidity: &str) {
    if let Ok(value) = liquidity.parse::<f64>() {
        CHAIN_LIQUIDITY.with_label_values(&[chain.as_str()]).set(value);
    }
}

pub fn record_listener_restart(chain: Chain) {
    LISTENER_RESTARTS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_event(chain: Chain, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[chain.as_str(), event_type])
        .inc();
}

pub fn record_event_discarded(chain: Chain) {
    EVENTS_DROPPED
        .with_label_values(&[chain.as_str(), "malformed"])
        .inc();
}

pub fn record_event_duplicate(chain: Chain) {
    EVENTS_DROPPED
        .with_label_values(&[chain.as_str(), "duplicate"])
        .inc();
}

pub fn record_event_orphaned(chain: Chain) {
    EVENTS_DROPPED
        .with_label_values(&[chain.as_str(), "orphaned"])
        .inc();
}

pub fn record_transfer_created(direction: Direction) {
    TRANSFERS_CREATED.with_label_values(&[direction.label()]).inc();
}

pub fn record_transfer_completed(direction: Direction) {
    TRANSFERS_COMPLETED
        .with_label_values(&[direction.label()])
        .inc();
}

pub fn record_transfer_failed(direction: Direction) {
    TRANSFERS_FAILED.with_label_values(&[direction.label()]).inc();
}

pub fn record_retry(direction: Direction) {
    TRANSFER_RETRIES.with_label_values(&[direction.label()]).inc();
}

pub fn record_pending(direction: Direction, pending: usize) {
    PENDING_TRANSFERS
        .with_label_values(&[direction.label()])
        .set(pending as f64);
}

pub fn record_reconcile_latency(direction: Direction, elapsed: Duration) {
    RECONCILE_LATENCY
        .with_label_values(&[direction.label()])
        .observe(elapsed.as_secs_f64());
}

pub fn record_operational_state(state: OperationalState) {
    OPERATIONAL_STATE.set(state.as_gauge());
}
