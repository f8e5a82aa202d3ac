//! Text codec for notification frames.
//!
//! Outbound frames are compact JSON or a bare id. Inbound frames carry no
//! meaning for the server beyond their size, which is bounded.

use thiserror::Error;

use crate::frames::{Notification, NotificationFormat};

/// Default maximum inbound frame size (64 KiB).
pub const DEFAULT_MAX_INBOUND_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Inbound frame exceeds the configured maximum.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Observed size in bytes.
        size: usize,
        /// Configured limit in bytes.
        max: usize,
    },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is not a valid notification.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a notification as a text frame payload.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode(notification: &Notification, format: NotificationFormat) -> Result<String, ProtocolError> {
    match format {
        NotificationFormat::Json => Ok(serde_json::to_string(notification)?),
        NotificationFormat::Id => Ok(notification
            .id
            .clone()
            .unwrap_or_else(|| notification.kind.as_str().to_string())),
    }
}

/// Decode a JSON notification frame.
///
/// # Errors
///
/// Returns an error if the text is empty or not a JSON notification.
pub fn decode(text: &str) -> Result<Notification, ProtocolError> {
    if text.is_empty() {
        return Err(ProtocolError::Invalid("empty frame".to_string()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Check an inbound frame against the size limit.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if `size` exceeds `max`.
pub fn check_inbound(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    Ok(())
}
