//! # profile-core
//!
//! Profile storage, CRUD, and the change-notification bus.
//!
//! - **Store** - Adapter trait over a document store with a change stream
//! - **Service** - CRUD operations on profiles
//! - **Bus** - Fans one upstream change stream out to many subscriptions
//! - **Subscription** - Bounded per-subscriber queue with a slow-consumer policy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────────┐
//! │  Service    │────▶│   Store     │────▶│  Change stream  │
//! └─────────────┘     └─────────────┘     └─────────────────┘
//!                                                  │
//!                                                  ▼
//!                     ┌─────────────┐     ┌─────────────────┐
//!                     │ Subscription│◀────│ NotificationBus │
//!                     └─────────────┘     └─────────────────┘
//! ```

pub mod backoff;
pub mod bus;
pub mod event;
pub mod memory;
pub mod service;
pub mod store;
pub mod subscription;

pub use backoff::{Backoff, BackoffConfig};
pub use bus::{BusConfig, BusError, BusStats, FanoutResult, NotificationBus};
pub use event::{ChangeEvent, Sequence};
pub use memory::MemoryStore;
pub use service::{ProfileService, ServiceError};
pub use store::{ChangeStream, ProfileStore, ProfileStream, StoreError, StoreUri};
pub use subscription::{
    CloseReason, SlowPolicy, Subscription, SubscriptionId, SubscriptionState, SubscriptionStats,
    DEFAULT_QUEUE_CAPACITY,
};
