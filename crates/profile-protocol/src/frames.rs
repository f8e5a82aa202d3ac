//! Notification frames sent to WebSocket subscribers.
//!
//! One text frame is emitted per change event. The payload is either the
//! bare profile id or a compact JSON object, selected by
//! [`NotificationFormat`].

use crate::profile::{Profile, ProfileId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of committed mutation a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// A profile was created.
    Insert,
    /// A profile's email was changed.
    Update,
    /// A profile was removed.
    Delete,
    /// A whole profile document was replaced.
    Replace,
    /// The change stream diverged; no replay will follow.
    Invalidate,
}

impl ChangeKind {
    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
            ChangeKind::Replace => "REPLACE",
            ChangeKind::Invalidate => "INVALIDATE",
        }
    }

    /// Whether this kind ends a subscription.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ChangeKind::Invalidate)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload encoding for notification frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationFormat {
    /// `{"id":"...","email":"...","kind":"INSERT"}`.
    #[default]
    Json,
    /// The bare profile id, or the kind name for events without a profile.
    Id,
}

impl FromStr for NotificationFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(NotificationFormat::Json),
            "id" => Ok(NotificationFormat::Id),
            other => Err(format!("unknown notification format: {other}")),
        }
    }
}

/// A notification frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Affected profile id, absent for `INVALIDATE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ProfileId>,
    /// Profile email after the change (before it, for deletes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// What happened.
    pub kind: ChangeKind,
}

impl Notification {
    /// Build a notification for a change to `profile`.
    #[must_use]
    pub fn change(kind: ChangeKind, profile: &Profile) -> Self {
        Self {
            id: Some(profile.id.clone()),
            email: Some(profile.email.clone()),
            kind,
        }
    }

    /// Build the terminal invalidate notification.
    #[must_use]
    pub fn invalidate() -> Self {
        Self {
            id: None,
            email: None,
            kind: ChangeKind::Invalidate,
        }
    }
}
