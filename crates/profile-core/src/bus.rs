//! Change-notification bus.
//!
//! The bus consumes a single upstream change stream and multiplexes it to a
//! dynamic set of subscriptions. Each subscription has its own bounded queue
//! and slow-subscriber policy, so one stalled consumer never delays another.
//!
//! ```text
//!                      ┌──────────────┐
//!  store.changes() ──▶ │  fan-out     │──▶ Subscription 1 (queue, policy)
//!                      │  loop        │──▶ Subscription 2 (queue, policy)
//!                      └──────────────┘──▶ ...
//! ```
//!
//! When the upstream is lost or emits `INVALIDATE`, every open
//! subscription receives a terminal `INVALIDATE` and closes; the loop then
//! reopens the upstream after a jittered exponential backoff.

use crate::backoff::{Backoff, BackoffConfig};
use crate::event::{ChangeEvent, Sequence};
use crate::store::{ChangeStream, ProfileStore, StoreError};
use crate::subscription::{
    CloseReason, PushOutcome, Shared, SlowPolicy, Subscription, SubscriptionId,
    SubscriptionStats, DEFAULT_QUEUE_CAPACITY,
};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus has been stopped.
    #[error("Notification bus is stopped")]
    Stopped,

    /// The upstream change stream did not come up in time.
    #[error("Change stream not connected within {0:?}")]
    NotConnected(Duration),
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Queue capacity used when a subscriber asks for 0.
    pub default_capacity: usize,
    /// Slow-subscriber policy applied to new subscriptions.
    pub policy: SlowPolicy,
    /// Upstream reconnect backoff.
    pub backoff: BackoffConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_QUEUE_CAPACITY,
            policy: SlowPolicy::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Outcome of one fan-out pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutResult {
    /// Sequence of the event.
    pub sequence: Sequence,
    /// Subscriptions that enqueued the event.
    pub delivered: u64,
    /// Subscriptions that lost an event to their policy.
    pub dropped: u64,
    /// Subscriptions evicted as slow consumers.
    pub evicted: u64,
}

/// Bus statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    /// Active subscriptions.
    pub subscribers: usize,
    /// Whether an upstream cursor is live.
    pub connected: bool,
    /// Events fanned out since start.
    pub events_dispatched: u64,
    /// Times the upstream was lost.
    pub upstream_restarts: u64,
    /// Subscriptions evicted as slow consumers.
    pub evictions: u64,
}

/// Why a single upstream cursor stopped.
enum StreamEnd {
    Shutdown,
    Invalidated,
    Failed(StoreError),
    Ended,
}

type Registry = Arc<RwLock<HashMap<SubscriptionId, Arc<Shared>>>>;

/// The in-process multicast bus.
pub struct NotificationBus {
    store: Arc<dyn ProfileStore>,
    config: BusConfig,
    registry: Registry,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    connected: watch::Sender<bool>,
    last_sequence: AtomicU64,
    events_dispatched: AtomicU64,
    upstream_restarts: AtomicU64,
    evictions: AtomicU64,
}

impl NotificationBus {
    /// Create a bus fed by `store.changes()`. Call [`start`](Self::start) to run it.
    #[must_use]
    pub fn new(store: Arc<dyn ProfileStore>, config: BusConfig) -> Self {
        info!(
            policy = ?config.policy,
            default_capacity = config.default_capacity,
            "Creating notification bus"
        );
        let (connected, _) = watch::channel(false);
        Self {
            store,
            config,
            registry: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            connected,
            last_sequence: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            upstream_restarts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// The bus configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Spawn the fan-out loop. Calling it again while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Stopped`] after [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>) -> Result<(), BusError> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Stopped);
        }
        let mut task = self.task.lock();
        if task.is_none() {
            *task = Some(tokio::spawn(Arc::clone(self).run()));
            info!("Notification bus started");
        }
        Ok(())
    }

    /// Stop the loop and close every subscription.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Fan-out loop panicked");
            }
        }
        let closed = self.close_all(CloseReason::BusStopped);
        self.connected.send_replace(false);
        info!(closed, "Notification bus stopped");
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until an upstream cursor is live.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NotConnected`] on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), BusError> {
        let mut connected = self.connected.subscribe();
        let result = match tokio::time::timeout(timeout, connected.wait_for(|up| *up)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BusError::Stopped),
            Err(_) => Err(BusError::NotConnected(timeout)),
        };
        result
    }

    /// Register a subscriber.
    ///
    /// Only events emitted after this call are delivered. A `capacity` of 0
    /// selects the configured default.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Stopped`] after [`stop`](Self::stop).
    pub fn subscribe(&self, capacity: usize) -> Result<Subscription, BusError> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Stopped);
        }
        let capacity = if capacity == 0 {
            self.config.default_capacity
        } else {
            capacity
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared::new(id, capacity, self.config.policy));
        self.registry.write().insert(id, Arc::clone(&shared));

        let registry = Arc::downgrade(&self.registry);
        let subscription = Subscription::new(Arc::clone(&shared), move |id| {
            if let Some(registry) = registry.upgrade() {
                registry.write().remove(&id);
            }
            debug!(subscription = id, "Unsubscribed");
        });

        // stop() may have drained the registry between the check and insert.
        if self.shutdown.is_cancelled() {
            self.registry.write().remove(&id);
            shared.close(CloseReason::BusStopped, true);
            return Err(BusError::Stopped);
        }

        debug!(
            subscription = id,
            capacity,
            subscribers = self.subscriber_count(),
            "Subscribed"
        );
        Ok(subscription)
    }

    /// Unsubscribe. Idempotent; safe from the subscriber's own consumer.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Look up an active subscription's counters by id.
    #[must_use]
    pub fn subscription_stats(&self, id: SubscriptionId) -> Option<SubscriptionStats> {
        self.registry.read().get(&id).map(|shared| shared.stats())
    }

    /// Get bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            subscribers: self.subscriber_count(),
            connected: *self.connected.borrow(),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            upstream_restarts: self.upstream_restarts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Fan one event out to every active subscription.
    ///
    /// A terminal event closes every subscription instead.
    pub fn publish(&self, event: ChangeEvent) -> FanoutResult {
        if event.is_terminal() {
            let sequence = event.sequence;
            let closed = self.invalidate_all(Arc::new(event));
            return FanoutResult {
                sequence,
                delivered: closed as u64,
                ..Default::default()
            };
        }
        self.dispatch(Arc::new(event))
    }

    fn dispatch(&self, event: Arc<ChangeEvent>) -> FanoutResult {
        // Copy-on-read: delivery never holds the registry lock.
        let snapshot: Vec<Arc<Shared>> = self.registry.read().values().cloned().collect();

        let mut result = FanoutResult {
            sequence: event.sequence,
            ..Default::default()
        };
        let mut evicted = Vec::new();

        for subscription in &snapshot {
            match subscription.push(Arc::clone(&event)) {
                PushOutcome::Enqueued => result.delivered += 1,
                PushOutcome::DroppedOldest => {
                    result.delivered += 1;
                    result.dropped += 1;
                }
                PushOutcome::DroppedNewest => result.dropped += 1,
                PushOutcome::Evicted => evicted.push(subscription.id()),
                PushOutcome::Inactive => {}
            }
        }

        if !evicted.is_empty() {
            let mut registry = self.registry.write();
            for id in &evicted {
                registry.remove(id);
                warn!(subscription = id, "Evicted slow subscriber");
            }
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        }
        result.evicted = evicted.len() as u64;

        self.last_sequence.fetch_max(event.sequence, Ordering::Relaxed);
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn drain_registry(&self) -> Vec<Arc<Shared>> {
        self.registry.write().drain().map(|(_, shared)| shared).collect()
    }

    /// Send a terminal event to every subscription and close it.
    fn invalidate_all(&self, event: Arc<ChangeEvent>) -> usize {
        let subscriptions = self.drain_registry();
        let closed = subscriptions
            .iter()
            .filter(|shared| shared.terminate(Arc::clone(&event), CloseReason::UpstreamLost))
            .count();
        if closed > 0 {
            warn!(closed, "Invalidated subscriptions");
        }
        closed
    }

    fn close_all(&self, reason: CloseReason) -> usize {
        self.drain_registry()
            .iter()
            .filter(|shared| shared.close(reason, true))
            .count()
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                opened = self.store.changes() => opened,
            };

            match opened {
                Ok(stream) => {
                    backoff.reset();
                    self.connected.send_replace(true);
                    info!(store = self.store.name(), "Change stream established");

                    let end = self.pump(stream).await;
                    self.connected.send_replace(false);

                    match end {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Invalidated => warn!("Change stream invalidated"),
                        StreamEnd::Failed(e) => warn!(error = %e, "Change stream failed"),
                        StreamEnd::Ended => warn!("Change stream ended"),
                    }

                    self.upstream_restarts.fetch_add(1, Ordering::Relaxed);
                    let sequence = self.last_sequence.load(Ordering::Relaxed);
                    self.invalidate_all(Arc::new(ChangeEvent::invalidate(sequence)));
                }
                Err(e) => warn!(error = %e, "Failed to open change stream"),
            }

            let delay = backoff.next_delay();
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempts(),
                "Reopening change stream after backoff"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.connected.send_replace(false);
        debug!("Fan-out loop exited");
    }

    async fn pump(&self, mut stream: ChangeStream) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return StreamEnd::Shutdown,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) if event.is_terminal() => return StreamEnd::Invalidated,
                Some(Ok(event)) => {
                    self.dispatch(Arc::new(event));
                }
                Some(Err(e)) => return StreamEnd::Failed(e),
                None => return StreamEnd::Ended,
            }
        }
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("store", &self.store.name())
            .field("subscribers", &self.subscriber_count())
            .field("policy", &self.config.policy)
            .finish_non_exhaustive()
    }
}
