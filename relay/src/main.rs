use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chain_cloud_relay::{
    account_cache::AccountCache,
    app_state::AppState,
    config::{CacheBackendKind, RelayConfig, BLOCK_COUNT},
    database::Database,
    http_router, ws_router,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chain_cloud_relay=debug"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();

    tracing::info!("Starting chain-cloud-relay...");

    let config = RelayConfig::from_env();

    // ========== Storage ==========

    let db = Database::connect(&config.database_url, config.db_max_connections)
        .await
        .context("failed to open device database")?;
    db.bootstrap_blocks(BLOCK_COUNT)
        .await
        .context("failed to create data blocks")?;
    tracing::info!("Device database ready ({})", config.database_url);

    let cache = match config.cache_backend {
        CacheBackendKind::Redis => AccountCache::redis(&config.redis_url)
            .await
            .with_context(|| format!("failed to connect to redis at {}", config.redis_url))?,
        CacheBackendKind::Memory => AccountCache::memory(),
    };
    tracing::info!("Account cache: {}", cache.backend_name());

    let state = Arc::new(AppState::new(&config, db, cache));
    tracing::info!("Upstream RPC: {}", state.upstream.url());

    // ========== Background Tasks ==========

    let sweep_handle = state.gateway.clone().spawn_liveness_sweep();
    tracing::info!("Liveness sweep started");

    // ========== Start Servers ==========

    let http_addr: SocketAddr = format!("{}:{}", config.bind_addr, config.http_port)
        .parse()
        .context("invalid HTTP listen address")?;
    let ws_addr: SocketAddr = format!("{}:{}", config.bind_addr, config.ws_port)
        .parse()
        .context("invalid WebSocket listen address")?;

    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await?;
    tracing::info!("RPC server listening on {}", http_addr);
    tracing::info!("WebSocket server listening on {}", ws_addr);

    let http = axum::serve(
        http_listener,
        http_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    let ws = axum::serve(ws_listener, ws_router(&state)).with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(async { http.await }, async { ws.await })?;

    sweep_handle.abort();
    state.registry.database().close().await;
    tracing::info!("Shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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

    tracing::info!("Shutdown signal received");
}
