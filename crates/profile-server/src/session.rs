//! WebSocket notification sessions.
//!
//! Each session owns one bus subscription and runs two cooperative tasks:
//! an inbound reader and an outbound writer, tied together by a
//! cancellation token derived from the server's shutdown token.
//!
//! The subscription is taken before the upgrade completes. Nothing is
//! written until the client's first text frame (the "kick") arrives; events
//! committed in between stay queued.

use crate::handlers::AppState;
use crate::metrics::{self, SessionMetricsGuard};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use profile_core::{CloseReason, Subscription};
use profile_protocol::{codec, NotificationFormat};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Client went away or a send failed.
    ClientGone,
    /// Inbound frame violated the protocol.
    ProtocolError,
    /// Subscription evicted as a slow consumer.
    SlowConsumer,
    /// Upstream change stream lost.
    UpstreamLost,
    /// Bus stopped or server shutting down.
    Shutdown,
}

impl SessionEnd {
    fn close_code(self) -> Option<u16> {
        match self {
            SessionEnd::ClientGone => None,
            SessionEnd::ProtocolError => Some(close_code::PROTOCOL),
            SessionEnd::SlowConsumer => Some(close_code::ERROR),
            SessionEnd::UpstreamLost => Some(close_code::RESTART),
            SessionEnd::Shutdown => Some(close_code::AWAY),
        }
    }

    fn reason(self) -> &'static str {
        match self {
            SessionEnd::ClientGone => "client gone",
            SessionEnd::ProtocolError => "protocol error",
            SessionEnd::SlowConsumer => "slow consumer",
            SessionEnd::UpstreamLost => "upstream lost",
            SessionEnd::Shutdown => "going away",
        }
    }
}

impl From<Option<CloseReason>> for SessionEnd {
    fn from(reason: Option<CloseReason>) -> Self {
        match reason {
            Some(CloseReason::SlowConsumer) => SessionEnd::SlowConsumer,
            Some(CloseReason::UpstreamLost) => SessionEnd::UpstreamLost,
            Some(CloseReason::BusStopped) => SessionEnd::Shutdown,
            Some(CloseReason::Unsubscribed) | None => SessionEnd::ClientGone,
        }
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let subscription = match state.bus.subscribe(state.config.ws_queue_capacity) {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(error = %e, "Rejecting WebSocket session");
            metrics::record_error("subscribe");
            return (axum::http::StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    // Hard transport cap; the per-frame protocol limit is checked by the reader.
    let transport_limit = state.config.max_message_size.saturating_mul(2);
    ws.max_message_size(transport_limit)
        .on_upgrade(move |socket| run_session(socket, state, subscription))
}

/// Handle one WebSocket session until it ends, then unsubscribe.
async fn run_session(socket: WebSocket, state: Arc<AppState>, subscription: Subscription) {
    let _metrics_guard = SessionMetricsGuard::new();
    let session = subscription.id();
    info!(session, "WebSocket session opened");

    let (mut sink, stream) = socket.split();
    let cancel = state.shutdown.child_token();
    let (ready_tx, ready_rx) = oneshot::channel();

    let reader = tokio::spawn(read_inbound(
        stream,
        cancel.clone(),
        state.config.max_message_size,
        ready_tx,
        session,
    ));

    let written = write_outbound(
        &mut sink,
        &subscription,
        &cancel,
        ready_rx,
        state.config.notification_format,
    )
    .await;

    let end = match written {
        Some(end) => {
            cancel.cancel();
            if let Err(e) = reader.await {
                warn!(session, error = %e, "Reader task failed");
            }
            end
        }
        None => reader.await.unwrap_or(SessionEnd::ClientGone),
    };

    match end.close_code() {
        Some(code) => {
            let frame = CloseFrame {
                code,
                reason: Cow::Borrowed(end.reason()),
            };
            if sink.send(Message::Close(Some(frame))).await.is_err() {
                debug!(session, "Close frame not delivered");
            }
        }
        None => {
            let _ = sink.close().await;
        }
    }

    state.bus.unsubscribe(&subscription);
    let stats = subscription.stats();
    metrics::record_dropped(stats.dropped);

    info!(
        session,
        code = ?end.close_code(),
        reason = end.reason(),
        delivered = stats.delivered,
        dropped = stats.dropped,
        "WebSocket session closed"
    );
}

/// Read inbound frames until the client leaves or the session is cancelled. The first text frame marks the session ready.
async fn read_inbound(
    mut stream: SplitStream<WebSocket>,
    cancel: CancellationToken,
    max_message_size: usize,
    ready: oneshot::Sender<()>,
    session: u64,
) -> SessionEnd {
    let mut ready = Some(ready);

    let end = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break SessionEnd::Shutdown,
            message = stream.next() => message,
        };

        let size = match message {
            Some(Ok(Message::Text(text))) => text.len(),
            Some(Ok(Message::Binary(data))) => data.len(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                debug!(session, "Client closed the session");
                break SessionEnd::ClientGone;
            }
            Some(Err(e)) => {
                debug!(session, error = %e, "WebSocket read error");
                let end = read_error_end(e);
                if end == SessionEnd::ProtocolError {
                    metrics::record_error("protocol");
                }
                break end;
            }
        };

        if let Err(e) = codec::check_inbound(size, max_message_size) {
            warn!(session, error = %e, "Inbound frame rejected");
            metrics::record_error("protocol");
            break SessionEnd::ProtocolError;
        }

        match ready.take() {
            Some(ready) => {
                debug!(session, "Session ready");
                let _ = ready.send(());
            }
            None => trace!(session, size, "Ignoring inbound frame"),
        }
    };

    cancel.cancel();
    end
}

/// Classify a transport read failure.
///
/// I/O failures mean the client is gone. Anything else means the peer broke
/// framing rules, for example by sending an over-limit message.
fn read_error_end(err: axum::Error) -> SessionEnd {
    let inner = err.into_inner();
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&*inner);
    while let Some(err) = source {
        if err.is::<std::io::Error>() {
            return SessionEnd::ClientGone;
        }
        source = err.source();
    }
    SessionEnd::ProtocolError
}

/// Forward subscription events to the client once the session is ready.
///
/// Returns `None` when the reader side decided the outcome.
async fn write_outbound(
    sink: &mut SplitSink<WebSocket, Message>,
    subscription: &Subscription,
    cancel: &CancellationToken,
    ready: oneshot::Receiver<()>,
    format: NotificationFormat,
) -> Option<SessionEnd> {
    tokio::select! {
        _ = cancel.cancelled() => return None,
        // Closed before the kick: end now, the queue is dropped on unsubscribe.
        _ = subscription.closed() => {
            return Some(SessionEnd::from(subscription.close_reason()));
        }
        ready = ready => ready.ok()?,
    }

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            event = subscription.recv() => event,
        };

        let Some(event) = event else {
            return Some(SessionEnd::from(subscription.close_reason()));
        };

        let text = match codec::encode(&event.to_notification(), format) {
            Ok(text) => text,
            Err(e) => {
                warn!(session = subscription.id(), error = %e, "Failed to encode notification");
                metrics::record_error("encode");
                continue;
            }
        };

        let bytes = text.len();
        let started = Instant::now();
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!(session = subscription.id(), error = %e, "Send failed");
            return Some(SessionEnd::ClientGone);
        }
        metrics::record_notification(bytes, started.elapsed());
    }
}
