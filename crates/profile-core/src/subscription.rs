//! Bus subscriptions.
//!
//! Each subscription owns a bounded FIFO filled by the bus fan-out loop and
//! drained by one consumer. Enqueue never blocks: when the queue is full the
//! subscription's [`SlowPolicy`] decides what gives.

use crate::event::ChangeEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::debug;

/// Default subscription queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// A subscription identifier, unique per bus.
pub type SubscriptionId = u64;

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlowPolicy {
    /// Discard the oldest queued event and enqueue the new one.
    #[default]
    #[serde(alias = "drop_oldest")]
    DropOldest,
    /// Discard the incoming event for this subscriber only.
    #[serde(alias = "drop_newest")]
    DropNewest,
    /// Close the subscription as a slow consumer.
    #[serde(alias = "evict")]
    Evict,
}

impl FromStr for SlowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DROP_OLDEST" => Ok(SlowPolicy::DropOldest),
            "DROP_NEWEST" => Ok(SlowPolicy::DropNewest),
            "EVICT" => Ok(SlowPolicy::Evict),
            other => Err(format!("unknown slow-subscriber policy: {other}")),
        }
    }
}

/// Lifecycle state of a subscription. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubscriptionState {
    /// Receiving events.
    Active,
    /// No longer receiving; queued events may still be drained.
    Closing,
    /// Drained or dropped; nothing further will be observed.
    Closed,
}

/// Why a subscription left the active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The consumer unsubscribed or went away.
    Unsubscribed,
    /// The queue overflowed under [`SlowPolicy::Evict`].
    SlowConsumer,
    /// The upstream change stream was lost or invalidated.
    UpstreamLost,
    /// The bus was stopped.
    BusStopped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Unsubscribed => "unsubscribed",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::UpstreamLost => "upstream lost",
            CloseReason::BusStopped => "bus stopped",
        };
        f.write_str(s)
    }
}

/// Result of offering one event to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued without loss.
    Enqueued,
    /// Enqueued after discarding the oldest queued event.
    DroppedOldest,
    /// The incoming event was discarded.
    DroppedNewest,
    /// The subscription was closed as a slow consumer.
    Evicted,
    /// The subscription was not active; nothing happened.
    Inactive,
}

/// Point-in-time view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Subscription id.
    pub id: SubscriptionId,
    /// Lifecycle state.
    pub state: SubscriptionState,
    /// Queue capacity.
    pub capacity: usize,
    /// Events currently queued.
    pub queued: usize,
    /// Events handed to the consumer.
    pub delivered: u64,
    /// Events discarded by policy or closure.
    pub dropped: u64,
    /// Why the subscription closed, if it has.
    pub close_reason: Option<CloseReason>,
}

struct Mailbox {
    queue: VecDeque<Arc<ChangeEvent>>,
    state: SubscriptionState,
    close_reason: Option<CloseReason>,
}

/// State shared between the bus (producer) and the consumer handle.
pub(crate) struct Shared {
    id: SubscriptionId,
    capacity: usize,
    policy: SlowPolicy,
    mailbox: Mutex<Mailbox>,
    notify: Notify,
    closed: watch::Sender<bool>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    pub(crate) fn new(id: SubscriptionId, capacity: usize, policy: SlowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            capacity,
            policy,
            mailbox: Mutex::new(Mailbox {
                queue: VecDeque::with_capacity(capacity),
                state: SubscriptionState::Active,
                close_reason: None,
            }),
            notify: Notify::new(),
            closed: watch::Sender::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Offer an event. Never blocks beyond the mailbox lock.
    pub(crate) fn push(&self, event: Arc<ChangeEvent>) -> PushOutcome {
        let outcome = {
            let mut mailbox = self.mailbox.lock();
            if mailbox.state != SubscriptionState::Active {
                return PushOutcome::Inactive;
            }

            if mailbox.queue.len() < self.capacity {
                mailbox.queue.push_back(event);
                PushOutcome::Enqueued
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match self.policy {
                    SlowPolicy::DropOldest => {
                        mailbox.queue.pop_front();
                        mailbox.queue.push_back(event);
                        PushOutcome::DroppedOldest
                    }
                    SlowPolicy::DropNewest => PushOutcome::DroppedNewest,
                    SlowPolicy::Evict => {
                        self.close_locked(&mut mailbox, CloseReason::SlowConsumer, false);
                        PushOutcome::Evicted
                    }
                }
            }
        };

        if outcome != PushOutcome::DroppedNewest {
            self.notify.notify_one();
        }
        outcome
    }

    /// Enqueue a terminal event and close, keeping the queue for draining.
    ///
    /// The terminal event always gets a slot; if the queue is full the
    /// oldest event makes room for it.
    pub(crate) fn terminate(&self, event: Arc<ChangeEvent>, reason: CloseReason) -> bool {
        let closed = {
            let mut mailbox = self.mailbox.lock();
            if mailbox.state != SubscriptionState::Active {
                false
            } else {
                if mailbox.queue.len() >= self.capacity {
                    mailbox.queue.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                mailbox.queue.push_back(event);
                self.close_locked(&mut mailbox, reason, true);
                true
            }
        };
        self.notify.notify_one();
        closed
    }

    /// Leave the active state. Returns `false` if already inactive.
    ///
    /// Closing a draining subscription without `drain` drops what is left.
    pub(crate) fn close(&self, reason: CloseReason, drain: bool) -> bool {
        let closed = {
            let mut mailbox = self.mailbox.lock();
            match mailbox.state {
                SubscriptionState::Active => {
                    self.close_locked(&mut mailbox, reason, drain);
                    true
                }
                SubscriptionState::Closing if !drain => {
                    self.dropped
                        .fetch_add(mailbox.queue.len() as u64, Ordering::Relaxed);
                    mailbox.queue.clear();
                    mailbox.state = SubscriptionState::Closed;
                    false
                }
                SubscriptionState::Closing | SubscriptionState::Closed => false,
            }
        };
        self.notify.notify_one();
        closed
    }

    fn close_locked(&self, mailbox: &mut Mailbox, reason: CloseReason, drain: bool) {
        mailbox.close_reason = Some(reason);
        mailbox.state = SubscriptionState::Closing;
        self.closed.send_replace(true);
        if !drain && !mailbox.queue.is_empty() {
            self.dropped
                .fetch_add(mailbox.queue.len() as u64, Ordering::Relaxed);
            mailbox.queue.clear();
        }
        if mailbox.queue.is_empty() {
            mailbox.state = SubscriptionState::Closed;
        }
        debug!(
            subscription = self.id,
            reason = %reason,
            state = ?mailbox.state,
            "Subscription closing"
        );
    }

    fn try_recv(&self) -> Result<Option<Arc<ChangeEvent>>, ()> {
        let mut mailbox = self.mailbox.lock();
        if let Some(event) = mailbox.queue.pop_front() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            if mailbox.state == SubscriptionState::Closing && mailbox.queue.is_empty() {
                mailbox.state = SubscriptionState::Closed;
            }
            return Ok(Some(event));
        }
        match mailbox.state {
            SubscriptionState::Active => Err(()),
            SubscriptionState::Closing | SubscriptionState::Closed => {
                mailbox.state = SubscriptionState::Closed;
                Ok(None)
            }
        }
    }

    async fn recv(&self) -> Option<Arc<ChangeEvent>> {
        loop {
            if let Ok(next) = self.try_recv() {
                return next;
            }
            // Single consumer: a permit stored by notify_one is never lost.
            self.notify.notified().await;
        }
    }

    pub(crate) fn stats(&self) -> SubscriptionStats {
        let mailbox = self.mailbox.lock();
        SubscriptionStats {
            id: self.id,
            state: mailbox.state,
            capacity: self.capacity,
            queued: mailbox.queue.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            close_reason: mailbox.close_reason,
        }
    }
}

/// Consumer-side handle for a bus subscription.
///
/// The bus owns registration; this handle only consumes and closes.
/// Dropping it unsubscribes.
pub struct Subscription {
    shared: Arc<Shared>,
    on_close: Box<dyn Fn(SubscriptionId) + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new(
        shared: Arc<Shared>,
        on_close: impl Fn(SubscriptionId) + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared,
            on_close: Box::new(on_close),
        }
    }

    /// Subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.shared.mailbox.lock().state
    }

    /// Why the subscription closed, if it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.mailbox.lock().close_reason
    }

    /// Snapshot of counters and state.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.shared.stats()
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the subscription is closed and drained.
    pub async fn recv(&self) -> Option<Arc<ChangeEvent>> {
        self.shared.recv().await
    }

    /// Wait until the subscription leaves the active state.
    ///
    /// Resolves immediately if it already has. Events queued before the
    /// close are left for [`recv`](Self::recv).
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        // The sender lives in `shared`, which outlives this borrow.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Receive without waiting.
    ///
    /// Returns `None` if nothing is queued right now.
    #[must_use]
    pub fn try_recv(&self) -> Option<Arc<ChangeEvent>> {
        self.shared.try_recv().ok().flatten()
    }

    /// Unsubscribe. Queued events are dropped. Idempotent.
    pub fn unsubscribe(&self) {
        if self.shared.close(CloseReason::Unsubscribed, false) {
            (self.on_close)(self.shared.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("policy", &self.shared.policy)
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profile_protocol::{ChangeKind, Profile};

    fn event(seq: u64) -> Arc<ChangeEvent> {
        Arc::new(ChangeEvent::new(
            seq,
            ChangeKind::Insert,
            Profile::new(seq.to_string(), "x@y"),
        ))
    }

    fn detached(capacity: usize, policy: SlowPolicy) -> (Arc<Shared>, Subscription) {
        let shared = Arc::new(Shared::new(1, capacity, policy));
        (shared.clone(), Subscription::new(shared, |_| {}))
    }

    #[test]
    fn test_slow_policy_parse() {
        assert_eq!("drop_oldest".parse::<SlowPolicy>(), Ok(SlowPolicy::DropOldest));
        assert_eq!("DROP_NEWEST".parse::<SlowPolicy>(), Ok(SlowPolicy::DropNewest));
        assert_eq!("Evict".parse::<SlowPolicy>(), Ok(SlowPolicy::Evict));
        assert!("block".parse::<SlowPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (shared, sub) = detached(8, SlowPolicy::DropOldest);
        for seq in 1..=5 {
            assert_eq!(shared.push(event(seq)), PushOutcome::Enqueued);
        }
        for seq in 1..=5 {
            assert_eq!(sub.recv().await.unwrap().sequence, seq);
        }
        assert_eq!(sub.stats().delivered, 5);
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let (shared, sub) = detached(3, SlowPolicy::DropOldest);
        for seq in 1..=10 {
            shared.push(event(seq));
            assert!(sub.stats().queued <= 3);
        }

        let stats = sub.stats();
        assert_eq!(stats.dropped, 7);
        let seqs: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![8, 9, 10]);
        assert_eq!(sub.stats().delivered + sub.stats().dropped, 10);
    }

    #[test]
    fn test_drop_newest_keeps_oldest() {
        let (shared, sub) = detached(3, SlowPolicy::DropNewest);
        for seq in 1..=5 {
            shared.push(event(seq));
        }
        assert_eq!(shared.push(event(6)), PushOutcome::DroppedNewest);

        let seqs: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(sub.stats().dropped, 3);
    }

    #[tokio::test]
    async fn test_evict_closes_immediately() {
        let (shared, sub) = detached(2, SlowPolicy::Evict);
        shared.push(event(1));
        shared.push(event(2));
        assert_eq!(shared.push(event(3)), PushOutcome::Evicted);

        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert_eq!(sub.close_reason(), Some(CloseReason::SlowConsumer));
        assert_eq!(shared.push(event(4)), PushOutcome::Inactive);
        assert!(sub.recv().await.is_none());
        assert_eq!(sub.stats().dropped, 3);
    }

    #[tokio::test]
    async fn test_terminate_drains_then_closes() {
        let (shared, sub) = detached(2, SlowPolicy::DropOldest);
        shared.push(event(1));
        shared.push(event(2));
        assert!(shared.terminate(
            Arc::new(ChangeEvent::invalidate(2)),
            CloseReason::UpstreamLost
        ));
        assert_eq!(sub.state(), SubscriptionState::Closing);

        assert_eq!(sub.recv().await.unwrap().sequence, 2);
        let last = sub.recv().await.unwrap();
        assert!(last.is_terminal());
        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert!(sub.recv().await.is_none());
        assert_eq!(sub.close_reason(), Some(CloseReason::UpstreamLost));
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let shared = Arc::new(Shared::new(9, 4, SlowPolicy::DropOldest));
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let sub = Subscription::new(shared.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        shared.push(event(1));

        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(shared.stats().state, SubscriptionState::Closed);
        assert_eq!(shared.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_closed_resolves_without_draining() {
        let (shared, sub) = detached(4, SlowPolicy::DropOldest);
        shared.push(event(1));

        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), sub.closed()).await;
        assert!(pending.is_err());

        let closer = Arc::clone(&shared);
        let waiter = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            closer.terminate(Arc::new(ChangeEvent::invalidate(1)), CloseReason::UpstreamLost);
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), sub.closed())
            .await
            .unwrap();
        waiter.await.unwrap();

        assert_eq!(sub.state(), SubscriptionState::Closing);
        assert_eq!(sub.stats().queued, 2);
        // Already closed: resolves at once.
        sub.closed().await;
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let (shared, sub) = detached(4, SlowPolicy::DropOldest);
        let producer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            shared.push(event(42));
        });

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.sequence, 42);
        producer.await.unwrap();
    }
}
