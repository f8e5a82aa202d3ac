//! Profile document types.
//!
//! These are the JSON bodies exchanged on the HTTP surface and the
//! documents held by the store.

use serde::{Deserialize, Serialize};

/// A profile identifier.
///
/// Opaque to clients; assigned by the store on insert and immutable after.
pub type ProfileId = String;

/// A stored profile record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Profile {
    /// Store-assigned identifier.
    pub id: ProfileId,
    /// Free-form email address.
    pub email: String,
}

impl Profile {
    /// Create a profile.
    #[must_use]
    pub fn new(id: impl Into<ProfileId>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
        }
    }

    /// Canonical resource path for this profile.
    #[must_use]
    pub fn location(&self) -> String {
        format!("/profiles/{}", self.id)
    }
}

/// Request body for `POST /profiles` and `PUT /profiles/{id}`.
///
/// Clients may send a full profile document; any `id` field is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRequest {
    /// Email to store.
    pub email: String,
}
