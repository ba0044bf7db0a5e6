use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod api;
mod blacklist;
mod config;
mod dispatch;
mod error;
mod estimator;
mod interval;
mod pool;
mod recovery;
mod registry;
mod routing;
mod sessions;
mod sse;
mod state;
mod stats;
mod usage;

use config::AppConfig;
use state::AppState;

/// Period of the expiry sweeper over the selection cache, scorer memo,
/// blacklist and session table.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Period of the usage-log archive check.
const ARCHIVE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // DEBUG=1 (or server.debug) widens the default filter; RUST_LOG wins.
    let default_filter = if std::env::var("DEBUG").is_ok_and(|v| v == "1" || v == "true") {
        "smart_ai_router=debug,tower_http=info"
    } else {
        "smart_ai_router=info,tower_http=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config_path = std::env::var("SAR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"));
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let data_dir = std::env::var("SAR_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));

    info!(
        host = %config.server.host,
        port = config.server.port,
        channels = config.channels.len(),
        providers = config.providers.len(),
        "smart-ai-router starting"
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server.host/server.port")?;

    let state = Arc::new(AppState::new(config, config_path, &data_dir));
    let shutdown = CancellationToken::new();

    let mut background = Vec::new();
    background.push(tokio::spawn(
        Arc::new(recovery::RecoveryLoop::new(
            Arc::clone(&state.config),
            Arc::clone(&state.blacklist),
            Arc::clone(&state.pool),
        ))
        .run(shutdown.clone()),
    ));
    background.push(tokio::spawn(sweeper(Arc::clone(&state), shutdown.clone())));
    background.push(tokio::spawn(archiver(Arc::clone(&state), shutdown.clone())));
    if state.config.get().tasks.model_discovery.enabled {
        background.push(tokio::spawn(model_discovery(
            Arc::clone(&state),
            shutdown.clone(),
        )));
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let app = api::app(Arc::clone(&state)).layer(
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    // Drain order: ingress has stopped; cancel background tasks and wait for
    // their current tick, then release the pool and expire idle sessions.
    info!("shutting down");
    shutdown.cancel();
    for task in background {
        let _ = task.await;
    }
    state.pool.close_all();
    state.sessions.cleanup_expired();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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

/// Periodic expiry sweep over every TTL-bearing shared structure.
async fn sweeper(state: Arc<AppState>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let cache = state.router.selection_cache.sweep();
                state.router.scorer_sweep();
                let blacklist = state.blacklist.cleanup_expired();
                let sessions = state.sessions.cleanup_expired();
                if cache + blacklist + sessions > 0 {
                    tracing::debug!(cache, blacklist, sessions, "expiry sweep");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Daily usage-log archiver (also runs once shortly after startup).
async fn archiver(state: Arc<AppState>, shutdown: CancellationToken) {
    let retention = state.config.get().server.usage_retention_days;
    let mut interval = tokio::time::interval(ARCHIVE_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match state.usage.archive_old_files(retention).await {
                    Ok(0) => {}
                    Ok(moved) => info!(moved, "archived old usage logs"),
                    Err(e) => warn!(error = %e, "usage log archive failed"),
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Periodic per-channel model discovery via `GET /v1/models`.
async fn model_discovery(state: Arc<AppState>, shutdown: CancellationToken) {
    let period = Duration::from_secs(state.config.get().tasks.model_discovery.interval_secs.max(60));
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let config = state.config.get();
                for channel in config.enabled_channels() {
                    let base_url = state.base_url(channel);
                    if base_url.is_empty() {
                        continue;
                    }
                    let auth = state.auth_header(channel);
                    match state
                        .catalog
                        .refresh(&state.pool.client(&base_url), &channel.id, &channel.api_key, &base_url, auth)
                        .await
                    {
                        Ok(count) => tracing::debug!(channel = %channel.id, models = count, "model discovery refreshed"),
                        Err(e) => tracing::debug!(channel = %channel.id, error = %e, "model discovery failed"),
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
