//! HTTP API for health checks, status, and monitoring

use crate::config::ApiConfig;
use crate::coordination::OperationalState;
use crate::error::{BridgeError, BridgeResult};
use crate::orchestrator::Orchestrator;
use crate::status::BridgeStatus;
use crate::transfer::StoreStats;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: Instant,
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState {
        orchestrator,
        started_at: Instant::now(),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server until shutdown
pub async fn run_server(
    config: ApiConfig,
    orchestrator: Arc<Orchestrator>,
    mut shutdown: watch::Receiver<bool>,
) -> BridgeResult<()> {
    let app = router(orchestrator);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BridgeError::Internal(format!("API bind {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| BridgeError::Internal(format!("API server: {}", e)))
}

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Readiness check - ready only while accepting transfers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let operational_state = state.orchestrator.operational_state();
    let ready = operational_state == OperationalState::Active;

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(ReadinessResponse {
            ready,
            operational_state,
        }),
    )
}

/// Get bridge status
async fn get_status(State(state): State<AppState>) -> Json<BridgeStatus> {
    Json(state.orchestrator.get_status().await)
}

/// Get transfer statistics
async fn get_stats(State(state): State<AppState>) -> Json<StoreStats> {
    Json(state.orchestrator.health_counters().await)
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    operational_state: OperationalState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::scripted::ScriptedAdapter;
    use crate::chain::ChainAdapters;
    use crate::config::OrchestratorConfig;
    use crate::transfer::Chain;

    fn app_state() -> AppState {
        let adapters = ChainAdapters::new(
            Arc::new(ScriptedAdapter::healthy(Chain::Ethereum)),
            Arc::new(ScriptedAdapter::healthy(Chain::Aleo)),
        )
        .unwrap();
        let config = OrchestratorConfig {
            instance_id: "api-test".to_string(),
            reconcile_interval_secs: 60,
            status_interval_secs: 60,
            max_retries: 3,
            adapter_timeout_ms: 500,
            max_concurrent_attempts: 4,
            max_fee_subsidy: "100".to_string(),
            default_fee: "0".to_string(),
            event_buffer: 16,
            listener_restart_secs: 1,
        };

        AppState {
            orchestrator: Arc::new(Orchestrator::new(config, adapters, None).unwrap()),
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_ready_only_when_active() {
        let state = app_state();

        let before = readiness_check(State(state.clone())).await.into_response();
        assert_eq!(before.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.orchestrator.start().await.unwrap();
        let active = readiness_check(State(state.clone())).await.into_response();
        assert_eq!(active.status(), StatusCode::OK);

        state.orchestrator.pause().unwrap();
        let paused = readiness_check(State(state.clone())).await.into_response();
        assert_eq!(paused.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_status_reports_offline_before_refresh() {
        let state = app_state();

        let Json(status) = get_status(State(state.clone())).await;
        assert_eq!(status.operational_state, OperationalState::Maintenance);
        assert_eq!(status.pending.total, 0);

        let Json(stats) = get_stats(State(state)).await;
        assert_eq!(stats.total, 0);
    }
}
