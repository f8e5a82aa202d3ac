//! # profile-protocol
//!
//! Wire types for the profiles service.
//!
//! This crate defines the JSON documents served over HTTP and the text
//! frames pushed to WebSocket subscribers.
//!
//! ## Types
//!
//! - `Profile` / `ProfileRequest` - HTTP bodies
//! - `ChangeKind` - what a committed mutation did
//! - `Notification` - one WebSocket text frame per change
//!
//! ## Example
//!
//! ```rust
//! use profile_protocol::{codec, ChangeKind, Notification, NotificationFormat, Profile};
//!
//! let profile = Profile::new("42", "someone@example.com");
//! let frame = Notification::change(ChangeKind::Insert, &profile);
//!
//! let text = codec::encode(&frame, NotificationFormat::Json).unwrap();
//! let decoded = codec::decode(&text).unwrap();
//! assert_eq!(decoded, frame);
//! ```

pub mod codec;
pub mod frames;
pub mod profile;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{ChangeKind, Notification, NotificationFormat};
pub use profile::{Profile, ProfileId, ProfileRequest};
