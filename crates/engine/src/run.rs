// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level server bootstrap: tracing, session recovery, router assembly,
//! and the listener/signal plumbing shared by `main` and integration tests.

use std::sync::Arc;

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::session_store::SessionStore;

/// Shared state reachable from every HTTP and WebSocket handler.
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub config: Arc<Config>,
    pub shutdown: CancellationToken,
}

/// Priority: explicit `--log-level` (falling back to `RUST_LOG`) > default "info".
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    let filter = if std::env::var("RUST_LOG").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

fn build_router(state: Arc<AppState>) -> Router {
    crate::http_api::router(state.clone())
        .merge(crate::ws_router::router(state.clone()))
        .layer(middleware::from_fn_with_state(state, crate::auth::auth_layer))
        .layer(TraceLayer::new_for_http())
}

fn build_health_router(_state: Arc<AppState>) -> Router {
    Router::new().route("/api/health", get(|| async { "ok" }))
}

/// Run the server until a shutdown signal arrives or a listener fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);

    let (store, recovery) = SessionStore::new(config.control_dir.clone(), config.max_sessions).await?;
    info!(
        running = recovery.recovered_running,
        exited = recovery.recovered_exited,
        "session store ready"
    );

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState { store, config: Arc::new(config), shutdown: shutdown.clone() });

    let addr = format!("{}:{}", state.config.bind_addr, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {}", listener.local_addr()?);

    let router = build_router(state.clone());
    let sd = shutdown.clone();
    let serve = tokio::spawn(async move {
        let result = axum::serve(listener, router).with_graceful_shutdown(sd.cancelled_owned()).await;
        if let Err(e) = result {
            error!("HTTP/WebSocket server error: {e}");
        }
    });

    if let Some(health_port) = state.config.health_port {
        let health_router = build_health_router(state.clone());
        let addr = format!("{}:{health_port}", state.config.bind_addr);
        let listener = TcpListener::bind(&addr).await?;
        info!("health probe listening on {addr}");
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, health_router).with_graceful_shutdown(sd.cancelled_owned()).await;
            if let Err(e) = result {
                error!("health server error: {e}");
            }
        });
    }

    spawn_signal_handler(shutdown.clone());

    let _ = serve.await;
    Ok(())
}

/// First SIGTERM/SIGINT triggers graceful shutdown; a second forces exit.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async { if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await } } => {
                info!("received SIGTERM");
            }
            _ = async { if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await } } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        tokio::select! {
            _ = async { if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await } } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async { if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await } } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
