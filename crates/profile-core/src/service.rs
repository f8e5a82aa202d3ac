//! Profile CRUD service.
//!
//! A thin layer over the store adapter. Each mutating operation commits
//! exactly one change event through the store; failed or missing-record
//! operations commit none.

use crate::store::{ProfileStore, ProfileStream, StoreError};
use profile_protocol::Profile;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Service errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No profile with the given id.
    #[error("Profile not found: {0}")]
    NotFound(String),

    /// The store failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// CRUD operations on profiles.
#[derive(Clone)]
pub struct ProfileService {
    store: Arc<dyn ProfileStore>,
}

impl ProfileService {
    /// Create a service over a store.
    #[must_use]
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ProfileStore> {
        &self.store
    }

    /// Stream every profile.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the store fails.
    pub async fn all(&self) -> Result<ProfileStream, ServiceError> {
        Ok(self.store.all().await?)
    }

    /// Fetch one profile.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if absent.
    pub async fn get(&self, id: &str) -> Result<Profile, ServiceError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    /// Create a profile with a generated id.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the store fails.
    pub async fn create(&self, email: &str) -> Result<Profile, ServiceError> {
        let profile = self.store.insert(email).await?;
        debug!(profile = %profile.id, "Created profile");
        Ok(profile)
    }

    /// Replace a profile's email.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if absent.
    pub async fn update(&self, id: &str, email: &str) -> Result<Profile, ServiceError> {
        self.store
            .update(id, email)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    /// Remove a profile, returning the removed record.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if absent.
    pub async fn delete(&self, id: &str) -> Result<Profile, ServiceError> {
        self.store
            .delete(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use futures_util::StreamExt;
    use profile_protocol::ChangeKind;

    fn service() -> (ProfileService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ProfileService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_save() {
        let (service, _) = service();
        let saved = service.create("email@email.com").await.unwrap();
        assert!(!saved.id.is_empty());
    }

    #[tokio::test]
    async fn test_update() {
        let (service, _) = service();
        let saved = service.create("test").await.unwrap();
        let updated = service.update(&saved.id, "test1").await.unwrap();
        assert_eq!(updated.id, saved.id);
        assert_eq!(updated.email, "test1");
    }

    #[tokio::test]
    async fn test_delete_returns_removed() {
        let (service, _) = service();
        let saved = service.create("test").await.unwrap();
        let deleted = service.delete(&saved.id).await.unwrap();
        assert_eq!(deleted.email, "test");
        assert!(matches!(
            service.get(&saved.id).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_by_id() {
        let (service, _) = service();
        let saved = service.create("someone@example.com").await.unwrap();
        let fetched = service.get(&saved.id).await.unwrap();
        assert_eq!(fetched, saved);
    }

    #[tokio::test]
    async fn test_get_all() {
        let (service, _) = service();
        for email in ["Josh", "Matt", "Jane"] {
            service.create(email).await.unwrap();
        }
        let all: Vec<Profile> = service.all().await.unwrap().collect().await;
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_one_event_per_mutation() {
        let (service, store) = service();
        let mut changes = store.changes().await.unwrap();

        let saved = service.create("a@b").await.unwrap();
        service.update(&saved.id, "c@d").await.unwrap();
        assert!(service.update("missing", "x").await.is_err());
        assert!(service.delete("missing").await.is_err());
        service.delete(&saved.id).await.unwrap();

        assert_eq!(store.last_sequence(), 3);
        let kinds: Vec<ChangeKind> = (&mut changes)
            .take(3)
            .map(|event| event.unwrap().kind)
            .collect()
            .await;
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
        );
    }

    #[tokio::test]
    async fn test_store_error_emits_nothing() {
        let (service, store) = service();
        store.set_available(false);

        assert!(matches!(
            service.create("x").await,
            Err(ServiceError::Store(StoreError::Unavailable(_)))
        ));
        assert_eq!(store.last_sequence(), 0);
    }
}
