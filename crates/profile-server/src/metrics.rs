//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use profile_protocol::ChangeKind;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "profiles_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "profiles_sessions_active";
    pub const NOTIFICATIONS_TOTAL: &str = "profiles_notifications_total";
    pub const NOTIFICATION_BYTES: &str = "profiles_notification_bytes";
    pub const MUTATIONS_TOTAL: &str = "profiles_mutations_total";
    pub const DROPPED_TOTAL: &str = "profiles_dropped_total";
    pub const SESSION_SEND_SECONDS: &str = "profiles_session_send_seconds";
    pub const ERRORS_TOTAL: &str = "profiles_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of WebSocket sessions since server start"
    );
    metrics::describe_gauge!(
        names::SESSIONS_ACTIVE,
        "Current number of open WebSocket sessions"
    );
    metrics::describe_counter!(
        names::NOTIFICATIONS_TOTAL,
        "Total number of notification frames sent"
    );
    metrics::describe_counter!(
        names::NOTIFICATION_BYTES,
        "Total bytes of notification frames sent"
    );
    metrics::describe_counter!(names::MUTATIONS_TOTAL, "Profile mutations by kind");
    metrics::describe_counter!(
        names::DROPPED_TOTAL,
        "Events dropped by slow-subscriber policy or closure"
    );
    metrics::describe_histogram!(
        names::SESSION_SEND_SECONDS,
        "Time spent writing one notification frame"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a sent notification frame.
pub fn record_notification(bytes: usize, elapsed: Duration) {
    counter!(names::NOTIFICATIONS_TOTAL).increment(1);
    counter!(names::NOTIFICATION_BYTES).increment(bytes as u64);
    histogram!(names::SESSION_SEND_SECONDS).record(elapsed.as_secs_f64());
}

/// Record a committed mutation.
pub fn record_mutation(kind: ChangeKind) {
    counter!(names::MUTATIONS_TOTAL, "kind" => kind.as_str()).increment(1);
}

/// Record events a session never received.
pub fn record_dropped(count: u64) {
    if count > 0 {
        counter!(names::DROPPED_TOTAL).increment(count);
    }
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records session close on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording a session open.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}
