//! Bridge Orchestrator - Ethereum <-> Aleo transfer coordination
//!
//! Watches the bridge contracts on both chains and settles every locked
//! transfer with a release on the opposite side.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use bridge_orchestrator::api;
use bridge_orchestrator::chain::{ChainAdapter, ChainAdapters, EvmAdapter, GatewayAdapter};
use bridge_orchestrator::config::{LogFormat, Settings};
use bridge_orchestrator::metrics::MetricsServer;
use bridge_orchestrator::state::{PgArchive, TransactionArchive};
use bridge_orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load().context("failed to load configuration")?;

    // Initialize logging
    init_logging(&settings.logging.format);

    info!("Starting Bridge Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Bridging {} <-> {}",
        settings.chains.ethereum.network, settings.chains.aleo.network
    );

    // Initialize chain adapters
    let ethereum: Arc<dyn ChainAdapter> = Arc::new(
        EvmAdapter::new(settings.chains.ethereum.clone())
            .context("failed to initialize Ethereum adapter")?,
    );
    let aleo: Arc<dyn ChainAdapter> = Arc::new(
        GatewayAdapter::new(settings.chains.aleo.clone())
            .context("failed to initialize Aleo adapter")?,
    );
    let adapters = ChainAdapters::new(ethereum, aleo)?;

    // Initialize the optional archive
    let archive: Option<Arc<dyn TransactionArchive>> = match &settings.database {
        Some(database) => {
            let archive = PgArchive::new(database)
                .await
                .context("failed to connect to database")?;
            archive.run_migrations().await?;
            info!("Database connection established");
            Some(Arc::new(archive))
        }
        None => {
            info!("No database configured, transfers are kept in memory only");
            None
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        settings.orchestrator.clone(),
        adapters,
        archive,
    )?);
    orchestrator
        .start()
        .await
        .context("chain adapters failed initialization, staying in maintenance")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start API server
    let api_handle = if settings.api.enabled {
        let config = settings.api.clone();
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown_rx.clone();
        info!("API server: http://{}:{}", config.host, config.port);
        Some(tokio::spawn(async move {
            if let Err(e) = api::run_server(config, orchestrator, shutdown).await {
                error!("API server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        let shutdown = shutdown_rx.clone();
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("Bridge Orchestrator is running");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    orchestrator.stop().await;
    let _ = shutdown_tx.send(true);

    for handle in [api_handle, metrics_handle].into_iter().flatten() {
        if let Err(e) = handle.await {
            error!("Server task ended abnormally: {}", e);
        }
    }

    info!("Bridge Orchestrator stopped");
    Ok(())
}

fn init_logging(format: &LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,bridge_orchestrator=debug,sqlx=warn,hyper=warn")
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
