//! strangers-core - Main entry point
//!
//! Runs the pairing coordinator: HTTP diagnostics plus the signaling WebSocket.

use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use strangers_core::args::Args;
use strangers_core::config::Config;
use strangers_core::pairing::{Matchmaker, PairingMetrics, Sweeper};
use strangers_core::web::{self, SharedState};
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Configuration comes first so the file can set the log level
    let loaded = args.load_config();
    let mut config = match &loaded {
        Ok(cfg) => cfg.clone(),
        Err(_) => Config::default(),
    };
    let env_port = std::env::var("PORT").ok();
    args.apply_overrides(&mut config, env_port.as_deref())?;

    // Initialize logging with noise filtering for the HTTP/WebSocket stack
    env_logger::Builder::new()
        .parse_filters(&std::env::var("STRANGERS_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("tungstenite", log::LevelFilter::Warn)
        .filter_module("tokio_tungstenite", log::LevelFilter::Warn)
        .filter_module("hyper", log::LevelFilter::Warn)
        .init();

    info!("strangers-core v{}", env!("CARGO_PKG_VERSION"));
    match loaded {
        Ok(_) => info!("Loaded configuration from {:?}", args.config),
        Err(e) => warn!("Failed to load config: {}, using defaults", e),
    }
    config.validate()?;

    let metrics = Arc::new(PairingMetrics::new()?);
    let matchmaker = Arc::new(Matchmaker::new(config.matching.clone(), metrics));
    info!(
        "Matching: max wait {}s, sweep every {}s, stale pairs after {}s",
        config.matching.max_wait_secs, config.matching.sweep_interval_secs, config.matching.stale_pair_secs
    );

    let sweeper = Sweeper::new(matchmaker.clone()).spawn();

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let state = Arc::new(SharedState::new(config, matchmaker));
    let listener = TcpListener::bind(&addr).await?;

    let result = web::run_http_server(listener, state, shutdown_signal()).await;
    sweeper.abort();
    if let Err(ref e) = result {
        error!("HTTP server error: {}", e);
    }
    info!("Shutdown complete");
    result
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received, draining connections");
}
