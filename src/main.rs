//! tvarr-relay
//!
//! A live media relay: one upstream fetch per channel, fanned out to any
//! number of HTTP clients as continuous MPEG-TS, HLS (TS or fMP4
//! segments) or MPEG-DASH, with passthrough, repackage and transcode
//! delivery paths.

#![allow(dead_code)]

mod buffer;
mod circuit;
mod classify;
mod client;
mod config;
mod demux;
mod error;
mod http;
#[cfg(test)]
mod integration;
mod mux;
mod processor;
mod routing;
mod session;
mod transcode;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::RelayConfig;
use crate::error::Result;
use crate::http::{create_router, AppState};
use crate::session::SessionManager;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
const APP_NAME: &str = "tvarr-relay";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    tracing::info!("{} v{} starting", APP_NAME, VERSION);

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        match RelayConfig::from_file(&config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "Failed to load config file {}: {}. Using defaults.",
                    config_path,
                    e
                );
                RelayConfig::default()
            }
        }
    } else {
        RelayConfig::default()
    };
    tracing::info!(channels = config.channels.len(), "configuration loaded");

    // Session manager plus its background cleanup sweep
    let manager = SessionManager::new(config.clone());
    manager.start_cleanup();

    let state = Arc::new(AppState {
        config: config.clone(),
        manager: manager.clone(),
    });
    let app = create_router(state);

    let addr: SocketAddr = config
        .socket_addr()
        .parse()
        .map_err(|e| crate::error::RelayError::Config(format!("bad listen address: {}", e)))?;
    tracing::info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;

    Ok(())
}

async fn shutdown_signal(manager: Arc<SessionManager>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down, closing sessions");
    manager.shutdown().await;
}

/// Initialize logging with tracing
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tvarr_relay=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
