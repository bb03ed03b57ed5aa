//! Atom Swapper daemon
//!
//! Receives matched orders over HTTP and drives each one through an HTLC
//! atomic swap between a UTXO chain and an account chain.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use atom_swapper::api;
use atom_swapper::atom::ChainRegistry;
use atom_swapper::clock::{Clock, SystemClock};
use atom_swapper::config::Settings;
use atom_swapper::coordination::SwapEngine;
use atom_swapper::keystore::EnvKeystore;
use atom_swapper::metrics::MetricsServer;
use atom_swapper::network::HttpNetwork;
use atom_swapper::order_tag;
use atom_swapper::state::{MemorySwapStore, PgSwapStore, SwapStore};
use atom_swapper::swap::{RetryPolicy, SwapContext, Timing};
use atom_swapper::watchdog::HttpWatchdog;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Atom Swapper v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!("Loaded configuration for {} chains", settings.chains.len());

    // Swap state store
    let store: Arc<dyn SwapStore> = match &settings.database {
        Some(database) => {
            let store = PgSwapStore::new(database).await?;
            info!("Database connection established");
            store.run_migrations().await?;
            Arc::new(store)
        }
        None => {
            warn!("No [database] configured, swap state will not survive a restart");
            Arc::new(MemorySwapStore::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Chain binders
    let keystore = EnvKeystore::new(&settings.chains);
    let registry = ChainRegistry::from_settings(&settings, &keystore, clock.clone())?;
    info!("Chain connections initialized");

    let ctx = SwapContext {
        store,
        network: Arc::new(HttpNetwork::new(&settings.network, clock.clone())?),
        watchdog: Arc::new(HttpWatchdog::new(&settings.watchdog)?),
        clock,
        retry: RetryPolicy::from(&settings.swapper),
        timing: Timing::from(&settings.swapper),
    };

    let (engine, mut outcomes) =
        SwapEngine::new(Arc::new(registry), ctx, settings.swapper.request_buffer);
    info!("Swap engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let engine = engine.clone();
        async move {
            if let Err(e) = api::run_server(config, engine).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = settings.metrics.enabled.then(|| {
        let server = MetricsServer::new(settings.metrics.port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start swap engine
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Swap engine error: {}", e);
            }
        }
    });

    let outcome_handle = tokio::spawn(async move {
        while let Some(outcome) = outcomes.recv().await {
            match outcome.result {
                Ok(status) => info!("[{}] Outcome: {}", order_tag(&outcome.order_id), status),
                Err(e) => warn!("[{}] Outcome: {}", order_tag(&outcome.order_id), e),
            }
        }
    });

    info!("Atom Swapper is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    engine.stop();
    if let Err(e) = engine_handle.await {
        warn!("Swap engine task ended abnormally: {}", e);
    }

    api_handle.abort();
    outcome_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Atom Swapper stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atom_swapper=debug,sqlx=warn,hyper=warn"));

    let json = std::env::var("SWAPPER_LOG_FORMAT").is_ok_and(|format| format == "json");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
