//! Gateway service entry point.
//!
//! Live cart-occupancy dashboards over WebSocket.

use anyhow::{Context, Result};
use cart_store::{CartStore, MemoryCartStore, RedisCartStore};
use gateway::{create_router, AppState, GatewayConfig, LiveUpdates, StoreBackend};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env().context("invalid configuration")?;
    config.log_summary();

    if config.metrics_port != 0 {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.metrics_port))
            .install()
            .context("failed to start Prometheus exporter")?;
        info!("Prometheus metrics server started on port {}", config.metrics_port);
    }

    let store: Arc<dyn CartStore> = match config.store_backend {
        StoreBackend::Redis => {
            info!("Connecting to Redis at {}", config.redis_url);
            Arc::new(RedisCartStore::new(&config.redis_url, &config.key_prefix)?)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory cart store; data is not persisted");
            Arc::new(MemoryCartStore::new())
        }
    };

    // Without the store there is nothing to serve.
    if let Err(e) = store.ping().await {
        error!("Cart store unreachable: {}", e);
        return Err(e).context("cart store unreachable at startup");
    }
    info!("Cart store ready");

    let live = Arc::new(LiveUpdates::new(
        store,
        config.resource_model,
        config.source_settings(),
    ));

    let state = Arc::new(AppState {
        live: live.clone(),
        ping_interval: config.ping_interval,
        client_buffer_size: config.client_buffer_size,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down change sources...");
    live.shutdown().await;

    info!("Gateway stopped");
    Ok(())
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
