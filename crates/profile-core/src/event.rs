//! Change events emitted by the store.
//!
//! A change event describes one committed mutation on the profile
//! collection, or the synthetic `INVALIDATE` marker.

use profile_protocol::{ChangeKind, Notification, Profile};
use std::time::{SystemTime, UNIX_EPOCH};

/// Position of an event in the store's commit order.
pub type Sequence = u64;

/// Current wall-clock time in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A change notification for the profile collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Commit sequence. Synthetic events reuse the last sequence seen.
    pub sequence: Sequence,
    /// What happened.
    pub kind: ChangeKind,
    /// The affected profile, absent for `INVALIDATE`.
    pub profile: Option<Profile>,
    /// When the event was created (ms since the epoch).
    pub timestamp: u64,
}

impl ChangeEvent {
    /// Create an event for a committed mutation.
    #[must_use]
    pub fn new(sequence: Sequence, kind: ChangeKind, profile: Profile) -> Self {
        Self {
            sequence,
            kind,
            profile: Some(profile),
            timestamp: now_millis(),
        }
    }

    /// Create the synthetic invalidate marker.
    #[must_use]
    pub fn invalidate(sequence: Sequence) -> Self {
        Self {
            sequence,
            kind: ChangeKind::Invalidate,
            profile: None,
            timestamp: now_millis(),
        }
    }

    /// Whether this event ends the subscriptions that receive it.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Wire form of this event.
    #[must_use]
    pub fn to_notification(&self) -> Notification {
        match &self.profile {
            Some(profile) => Notification::change(self.kind, profile),
            None => Notification {
                id: None,
                email: None,
                kind: self.kind,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_event_creation() {
        let event = ChangeEvent::new(7, ChangeKind::Insert, Profile::new("1", "a@b"));
        assert_eq!(event.sequence, 7);
        assert!(!event.is_terminal());
        assert!(event.timestamp > 0);
    }

    #[test]
    fn test_invalidate_has_no_profile() {
        let event = ChangeEvent::invalidate(3);
        assert!(event.is_terminal());
        assert!(event.profile.is_none());
        assert_eq!(event.to_notification(), Notification::invalidate());
    }

    #[test]
    fn test_to_notification_carries_profile() {
        let event = ChangeEvent::new(1, ChangeKind::Update, Profile::new("x", "c@d"));
        let n = event.to_notification();
        assert_eq!(n.id.as_deref(), Some("x"));
        assert_eq!(n.email.as_deref(), Some("c@d"));
        assert_eq!(n.kind, ChangeKind::Update);
    }
}
