//! Standalone binary hosting a single process's worth of tunnel sessions
//! behind an `axum` HTTP/WS server (§6).
//!
//! This replaces the teacher's systemd-managed proxy-agent binary: there is
//! no service install/upgrade lifecycle here, no outbound reconnect loop —
//! the session core is a server, not a client, so the binary's job is just
//! config, logging, and serving `axum_adapter::router` until told to stop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::info;

use dotunnel_session::axum_adapter::{self, AppState};
use dotunnel_session::config::{Config, ConfigFile};
use dotunnel_session::logging;
use dotunnel_session::manager::SessionManager;
use dotunnel_session::registry::{NullRegistry, TunnelRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    logging::init(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        max_concurrent_streams = config.max_concurrent_streams,
        "dotunnel-sessiond starting"
    );

    let registry: Arc<dyn TunnelRegistry> = Arc::new(NullRegistry);
    let manager = Arc::new(SessionManager::new(config.clone(), Arc::clone(&registry)));
    let state = AppState {
        config: config.clone(),
        registry,
        manager,
    };

    let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.bind_port)
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, axum_adapter::router(state))
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("server exited with an error")?;

    info!("dotunnel-sessiond stopped");
    Ok(())
}

/// Merge an optional TOML config file in ahead of CLI/env parsing, then let
/// clap resolve the final precedence: CLI flags > env vars > file.
fn load_config() -> anyhow::Result<Config> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(path) = args
        .iter()
        .position(|a| a == "--config-file")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .or_else(|| std::env::var("DOTUNNEL_SESSION_CONFIG_FILE").ok())
    {
        let file = ConfigFile::load(std::path::Path::new(&path))
            .with_context(|| format!("failed to load config file {path}"))?;
        file.inject_env();
    }
    Ok(Config::parse())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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

    info!("shutdown signal received, draining");
}
