//! LinkDave node binary: the WebSocket gateway on one listener, health/stats
//! on another, and a signal-driven drain before shutdown.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use linkdave_audio::{HttpSourceFactory, SourceConfig};
use linkdave_voice::{PlatformSocketFactory, VoiceManager};
use linkdave_ws::NodeServer;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Time controllers get to migrate their players before forced shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::Config::from_env();
    tracing::info!(
        version = VERSION,
        ws_addr = %config.ws_addr,
        http_addr = %config.http_addr,
        "starting linkdave"
    );

    let source_factory = Arc::new(HttpSourceFactory::new(SourceConfig::from_env()));
    let socket_factory = Arc::new(PlatformSocketFactory);
    let manager = VoiceManager::new(socket_factory, source_factory);
    let server = NodeServer::new(VERSION, manager.clone());
    server.start_stats_ticker();

    let ws_listener = TcpListener::bind(&config.ws_addr)
        .await
        .with_context(|| format!("bind {}", config.ws_addr))?;
    let http_listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("bind {}", config.http_addr))?;

    tracing::info!(addr = %config.ws_addr, "websocket server listening");
    tracing::info!(addr = %config.http_addr, "health server listening");

    let shutdown = Arc::new(Notify::new());
    let ws_task = tokio::spawn(serve(
        ws_listener,
        linkdave_ws::gateway_router(server.clone()),
        shutdown.clone(),
    ));
    let http_task = tokio::spawn(serve(
        http_listener,
        linkdave_ws::monitor_router(server.clone()),
        shutdown.clone(),
    ));

    wait_for_signal().await;
    tracing::info!("received shutdown signal");

    server.drain("shutdown", DRAIN_TIMEOUT.as_millis() as i64);

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            ticker.tick().await;
            let remaining = server.player_count();
            if remaining == 0 {
                break;
            }
            tracing::info!(remaining_players = remaining, "waiting for player migration");
        }
    })
    .await;

    match drained {
        Ok(()) => tracing::info!("all players migrated successfully"),
        Err(_) => tracing::warn!("drain timeout reached, forcing shutdown"),
    }

    tracing::info!("shutting down servers...");
    manager.close().await;

    shutdown.notify_waiters();
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = ws_task.await;
        let _ = http_task.await;
    })
    .await;

    tracing::info!("linkdave stopped");
    Ok(())
}

async fn serve(listener: TcpListener, app: Router, shutdown: Arc<Notify>) {
    let graceful = async move { shutdown.notified().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await
    {
        tracing::error!(error = %e, "server error");
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
