//! HTTP application assembly.
//!
//! Wires the CRUD routes, the WebSocket endpoint, and the health check into
//! one router behind the case-insensitive routing middleware.

use crate::config::Config;
use crate::{profiles, routing, session};
use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use profile_core::{NotificationBus, ProfileService};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// WebSocket endpoint path.
pub const WS_PATH: &str = "/ws/profiles";

/// Shared server state.
pub struct AppState {
    /// Profile CRUD.
    pub service: ProfileService,
    /// Change-notification bus.
    pub bus: Arc<NotificationBus>,
    /// Server configuration.
    pub config: Config,
    /// Cancelled on server shutdown; sessions observe child tokens.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(
        service: ProfileService,
        bus: Arc<NotificationBus>,
        config: Config,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            service,
            bus,
            config,
            shutdown,
        }
    }
}

/// Build the application router.
///
/// Routing happens on the canonical URI, so the rewrite middleware wraps
/// the whole route table as a fallback service.
pub fn app(state: Arc<AppState>) -> Router {
    let routes = Router::new()
        .route(
            "/profiles",
            get(profiles::list_profiles).post(profiles::create_profile),
        )
        .route(
            "/profiles/:id",
            get(profiles::get_profile)
                .put(profiles::update_profile)
                .delete(profiles::delete_profile),
        )
        .route(WS_PATH, get(session::ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    Router::new()
        .fallback_service(routes)
        .layer(middleware::from_fn(routing::canonical_paths))
}

/// Serve the application until the state's shutdown token is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails while serving.
pub async fn run_server(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    let shutdown = state.shutdown.clone();

    info!("Profile server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, WS_PATH);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server drained");
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = state.service.store();
    let bus = state.bus.stats();

    let (status, code) = match store.ping().await {
        Ok(()) => ("ok", StatusCode::OK),
        Err(e) => {
            warn!(error = %e, "Health check: store unreachable");
            ("degraded", StatusCode::SERVICE_UNAVAILABLE)
        }
    };

    let body = serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "store": store.name(),
        "bus": {
            "subscribers": bus.subscribers,
            "connected": bus.connected,
            "events_dispatched": bus.events_dispatched,
            "upstream_restarts": bus.upstream_restarts,
            "evictions": bus.evictions,
        },
    });
    (code, Json(body))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_health(state: Arc<AppState>) -> (StatusCode, serde_json::Value) {
        let response = app(state)
            .oneshot(Request::get("/Health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_bus() {
        let harness = harness(test_config()).await;
        let (status, body) = get_health(harness.state.clone()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "memory");
        assert_eq!(body["bus"]["connected"], true);
        assert_eq!(body["bus"]["subscribers"], 0);
        harness.state.bus.stop().await;
    }

    #[tokio::test]
    async fn test_health_degraded_when_store_down() {
        let harness = harness(test_config()).await;
        harness.store.set_available(false);

        let (status, body) = get_health(harness.state.clone()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
        harness.state.bus.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let harness = harness(test_config()).await;
        let response = app(harness.state.clone())
            .oneshot(Request::get("/nothing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        harness.state.bus.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let harness = harness(test_config()).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = tokio::spawn(run_server(harness.state.clone(), listener));

        harness.state.shutdown.cancel();
        let served = tokio::time::timeout(std::time::Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(served.is_ok());
        harness.state.bus.stop().await;
    }
}
