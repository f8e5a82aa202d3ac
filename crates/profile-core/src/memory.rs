//! In-process document store.
//!
//! Models a collection paired with a capped, tailable change log. Mutations
//! and their change events are committed under one lock, so every cursor
//! observes events in commit order.

use crate::event::{ChangeEvent, Sequence};
use crate::store::{ChangeStream, ProfileStore, ProfileStream, StoreError};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use profile_protocol::{ChangeKind, Profile, ProfileId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Default number of change events retained for lagging cursors.
pub const DEFAULT_OPLOG_CAPACITY: usize = 4096;

struct Collection {
    documents: BTreeMap<ProfileId, Profile>,
    sequence: Sequence,
    oplog: broadcast::Sender<ChangeEvent>,
}

impl Collection {
    fn commit(&mut self, kind: ChangeKind, profile: Profile) {
        self.sequence += 1;
        let event = ChangeEvent::new(self.sequence, kind, profile);
        trace!(sequence = event.sequence, kind = %kind, "Committed change");
        // No open cursors is not an error.
        let _ = self.oplog.send(event);
    }
}

/// An in-memory profile store with a capped change log.
pub struct MemoryStore {
    collection: Mutex<Collection>,
    oplog_capacity: usize,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create a store with the default change log capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OPLOG_CAPACITY)
    }

    /// Create a store with a specific change log capacity.
    #[must_use]
    pub fn with_capacity(oplog_capacity: usize) -> Self {
        let oplog_capacity = oplog_capacity.max(1);
        let (oplog, _) = broadcast::channel(oplog_capacity);
        info!(oplog_capacity, "Opened in-memory profile store");
        Self {
            collection: Mutex::new(Collection {
                documents: BTreeMap::new(),
                sequence: 0,
                oplog,
            }),
            oplog_capacity,
            available: AtomicBool::new(true),
        }
    }

    /// Number of stored profiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.collection.lock().documents.len()
    }

    /// Whether the store holds no profiles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence of the last committed change.
    #[must_use]
    pub fn last_sequence(&self) -> Sequence {
        self.collection.lock().sequence
    }

    /// Number of change cursors currently open.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.collection.lock().oplog.receiver_count()
    }

    /// End every open change cursor, as a dropped connection would.
    ///
    /// Cursors yield any events already buffered, then terminate. New
    /// cursors can be opened immediately.
    pub fn interrupt_change_streams(&self) {
        let (oplog, _) = broadcast::channel(self.oplog_capacity);
        let previous = std::mem::replace(&mut self.collection.lock().oplog, oplog);
        warn!(cursors = previous.receiver_count(), "Interrupted change streams");
    }

    /// Mark the store reachable or unreachable.
    ///
    /// Going unavailable also ends open cursors.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was && !available {
            self.interrupt_change_streams();
        }
        if was != available {
            info!(available, "Store availability changed");
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn all(&self) -> Result<ProfileStream, StoreError> {
        self.check_available()?;
        let snapshot: Vec<Profile> = self.collection.lock().documents.values().cloned().collect();
        Ok(futures_util::stream::iter(snapshot).boxed())
    }

    async fn get(&self, id: &str) -> Result<Option<Profile>, StoreError> {
        self.check_available()?;
        Ok(self.collection.lock().documents.get(id).cloned())
    }

    async fn insert(&self, email: &str) -> Result<Profile, StoreError> {
        self.check_available()?;
        let profile = Profile::new(Uuid::new_v4().to_string(), email);

        let mut collection = self.collection.lock();
        collection
            .documents
            .insert(profile.id.clone(), profile.clone());
        collection.commit(ChangeKind::Insert, profile.clone());

        debug!(profile = %profile.id, "Inserted profile");
        Ok(profile)
    }

    async fn update(&self, id: &str, email: &str) -> Result<Option<Profile>, StoreError> {
        self.check_available()?;
        let mut collection = self.collection.lock();

        let Some(document) = collection.documents.get_mut(id) else {
            return Ok(None);
        };
        document.email = email.to_string();
        let profile = document.clone();
        collection.commit(ChangeKind::Update, profile.clone());

        debug!(profile = %id, "Updated profile");
        Ok(Some(profile))
    }

    async fn delete(&self, id: &str) -> Result<Option<Profile>, StoreError> {
        self.check_available()?;
        let mut collection = self.collection.lock();

        let Some(profile) = collection.documents.remove(id) else {
            return Ok(None);
        };
        collection.commit(ChangeKind::Delete, profile.clone());

        debug!(profile = %id, "Deleted profile");
        Ok(Some(profile))
    }

    async fn changes(&self) -> Result<ChangeStream, StoreError> {
        self.check_available()?;
        let (receiver, last) = {
            let collection = self.collection.lock();
            (collection.oplog.subscribe(), collection.sequence)
        };
        debug!(from_sequence = last, "Opened change cursor");

        let stream = futures_util::stream::unfold((receiver, last), |(mut receiver, last)| async move {
            match receiver.recv().await {
                Ok(event) => {
                    let sequence = event.sequence;
                    Some((Ok::<_, StoreError>(event), (receiver, sequence)))
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Change cursor fell behind the capped log");
                    Some((Ok(ChangeEvent::invalidate(last)), (receiver, last)))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_assigns_id() {
        let store = MemoryStore::new();
        let profile = store.insert("email@email.com").await.unwrap();
        assert!(!profile.id.is_empty());
        assert_eq!(store.get(&profile.id).await.unwrap(), Some(profile));
    }

    #[tokio::test]
    async fn test_all_is_finite() {
        let store = MemoryStore::new();
        for email in ["Josh", "Matt", "Jane"] {
            store.insert(email).await.unwrap();
        }

        let all: Vec<Profile> = store.all().await.unwrap().collect().await;
        assert_eq!(all.len(), 3);
        let mut emails: Vec<&str> = all.iter().map(|p| p.email.as_str()).collect();
        emails.sort_unstable();
        assert_eq!(emails, vec!["Jane", "Josh", "Matt"]);
    }

    #[tokio::test]
    async fn test_update_and_delete_missing() {
        let store = MemoryStore::new();
        assert_eq!(store.update("nope", "x").await.unwrap(), None);
        assert_eq!(store.delete("nope").await.unwrap(), None);
        assert_eq!(store.last_sequence(), 0);
    }

    #[tokio::test]
    async fn test_changes_in_commit_order() {
        let store = MemoryStore::new();
        let before = store.insert("before").await.unwrap();
        let mut changes = store.changes().await.unwrap();

        let created = store.insert("a@b").await.unwrap();
        store.update(&created.id, "c@d").await.unwrap();
        store.delete(&created.id).await.unwrap();

        let mut kinds = Vec::new();
        for _ in 0..3 {
            let event = changes.next().await.unwrap().unwrap();
            assert_ne!(event.profile.unwrap().id, before.id);
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
        );
    }

    #[tokio::test]
    async fn test_interrupt_ends_cursor() {
        let store = MemoryStore::new();
        let mut changes = store.changes().await.unwrap();
        store.insert("buffered").await.unwrap();

        store.interrupt_change_streams();

        let event = changes.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert!(changes.next().await.is_none());
        assert!(store.changes().await.is_ok());
    }

    #[tokio::test]
    async fn test_lagging_cursor_invalidates_and_resumes() {
        let store = MemoryStore::with_capacity(2);
        let mut changes = store.changes().await.unwrap();
        for i in 0..5 {
            store.insert(&format!("{i}@x")).await.unwrap();
        }

        let first = changes.next().await.unwrap().unwrap();
        assert_eq!(first.kind, ChangeKind::Invalidate);

        let resumed = changes.next().await.unwrap().unwrap();
        assert_eq!(resumed.kind, ChangeKind::Insert);
        assert_eq!(resumed.sequence, 4);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_everything() {
        let store = MemoryStore::new();
        let mut changes = store.changes().await.unwrap();
        store.set_available(false);

        assert!(changes.next().await.is_none());
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(store.insert("x").await.is_err());
        assert!(store.changes().await.is_err());

        store.set_available(true);
        assert!(store.insert("x").await.is_ok());
    }
}
