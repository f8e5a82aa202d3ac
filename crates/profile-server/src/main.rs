//! # Profile Server
//!
//! Reactive profile service: HTTP CRUD over profiles plus a WebSocket
//! stream of change notifications.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! profiles
//!
//! # Run with a custom config file
//! PROFILES_CONFIG=/path/to/profiles.toml profiles
//!
//! # Run with environment variables
//! HTTP_PORT=8080 SLOW_POLICY=EVICT profiles
//! ```

mod config;
mod handlers;
mod metrics;
mod profiles;
mod routing;
mod session;

use anyhow::{Context, Result};
use profile_core::{NotificationBus, ProfileService};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "profiles=debug,profile_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    info!(
        "Starting profile server on {}:{}",
        config.http_host, config.http_port
    );

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics_enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics_port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Store and bus must be up before accepting traffic
    let store = profile_core::store::open(&config.store_uri)
        .with_context(|| format!("Failed to open store {}", config.store_uri))?;
    store.ping().await.context("Store unreachable")?;

    let bus = Arc::new(NotificationBus::new(store.clone(), config.bus_config()));
    bus.start()?;
    bus.wait_connected(config.startup_timeout())
        .await
        .context("Change stream did not come up")?;

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let state = Arc::new(handlers::AppState::new(
        ProfileService::new(store),
        bus.clone(),
        config,
        shutdown.clone(),
    ));

    let served = handlers::run_server(state, listener).await;

    shutdown.cancel();
    bus.stop().await;
    info!("Profile server stopped");

    served
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
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
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => return,
    }

    info!("Received shutdown signal");
    shutdown.cancel();
}
