//! Domain Layer
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for external collaborators
//!   (loader, shard transport, invalidation transport, membership, clock)
//! - **Events** (`events.rs`) - Invalidation events carried by the bus
//!
//! # Usage
//!
//! ```ignore
//! use shardcache::domain::ports::{loader_fn, Loader};
//!
//! let loader = loader_fn(|key| async move {
//!     let row = db.fetch(key.as_bytes()).await.map_err(|e| LoaderError::new(e.to_string()))?;
//!     Ok(row.map(Bytes::from))
//! });
//! ```

pub mod events;
pub mod ports;

// Re-export commonly used types
pub use events::InvalidationEvent;
pub use ports::{
    loader_fn, Clock, DeleteOutcome, FnLoader, InvalidationHandler, InvalidationTransport,
    LoadResult, Loader, ManualClock, MembershipSource, SetOutcome, ShardConnector,
    ShardTransport, SubscriptionHandle, SystemClock,
};
