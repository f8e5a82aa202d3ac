//! Store adapter for profile documents.
//!
//! The adapter persists profiles and exposes the collection's change stream
//! as an infinite sequence of [`ChangeEvent`]s. Each call to
//! [`ProfileStore::changes`] opens a fresh cursor at the current tail.

use crate::event::ChangeEvent;
use crate::memory::{MemoryStore, DEFAULT_OPLOG_CAPACITY};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use profile_protocol::Profile;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The connection string names a store this build cannot open.
    #[error("Unsupported store URI: {0}")]
    UnsupportedUri(String),
}

/// Finite stream over all stored profiles.
pub type ProfileStream = BoxStream<'static, Profile>;

/// Infinite stream of committed changes.
///
/// The stream ends (or yields an error) when the cursor is lost.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, StoreError>>;

/// A document store holding profiles.
///
/// Every successful mutation commits exactly one change event, visible to
/// every cursor open at commit time, in commit order.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Short name for logs and health output.
    fn name(&self) -> &'static str;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Stream every stored profile.
    async fn all(&self) -> Result<ProfileStream, StoreError>;

    /// Look up a profile by id.
    async fn get(&self, id: &str) -> Result<Option<Profile>, StoreError>;

    /// Insert a profile, assigning its id.
    async fn insert(&self, email: &str) -> Result<Profile, StoreError>;

    /// Replace a profile's email. Returns `None` if absent.
    async fn update(&self, id: &str, email: &str) -> Result<Option<Profile>, StoreError>;

    /// Remove a profile, returning the removed record.
    async fn delete(&self, id: &str) -> Result<Option<Profile>, StoreError>;

    /// Open a change cursor at the current tail.
    ///
    /// No events committed before the call are delivered.
    async fn changes(&self) -> Result<ChangeStream, StoreError>;
}

/// Parsed store connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUri {
    /// `memory://[?oplog=N]` - in-process document store.
    Memory {
        /// Capacity of the capped change log.
        oplog_capacity: usize,
    },
}

impl FromStr for StoreUri {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| StoreError::UnsupportedUri(s.to_string()))?;

        match scheme.to_ascii_lowercase().as_str() {
            "memory" => {
                let mut oplog_capacity = DEFAULT_OPLOG_CAPACITY;
                if let Some((_, query)) = rest.split_once('?') {
                    for pair in query.split('&').filter(|p| !p.is_empty()) {
                        match pair.split_once('=') {
                            Some(("oplog", value)) => {
                                oplog_capacity = value
                                    .parse()
                                    .ok()
                                    .filter(|n| *n > 0)
                                    .ok_or_else(|| StoreError::UnsupportedUri(s.to_string()))?;
                            }
                            _ => return Err(StoreError::UnsupportedUri(s.to_string())),
                        }
                    }
                }
                Ok(StoreUri::Memory { oplog_capacity })
            }
            _ => Err(StoreError::UnsupportedUri(s.to_string())),
        }
    }
}

/// Open the store named by a connection string.
///
/// # Errors
///
/// Returns [`StoreError::UnsupportedUri`] for unknown schemes or options.
pub fn open(uri: &str) -> Result<Arc<dyn ProfileStore>, StoreError> {
    match uri.parse::<StoreUri>()? {
        StoreUri::Memory { oplog_capacity } => Ok(Arc::new(MemoryStore::with_capacity(oplog_capacity))),
    }
}
