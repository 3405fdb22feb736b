//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  ShardTransport │ InvalidationTransport │ MembershipSource │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryShardStore │ InMemoryCluster │ BroadcastBus        │ │
//! │  │ StaticMembership                                           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The in-memory adapters let several `TieredCache` instances in one process
//! behave like a fleet: they share shard stores through an `InMemoryCluster`
//! and invalidations through one `BroadcastBus`.
//!
//! # Usage
//!
//! ```ignore
//! use shardcache::adapters::{BroadcastBus, InMemoryCluster};
//! use shardcache::cache::{CacheConfig, TieredCache};
//!
//! let cluster = Arc::new(InMemoryCluster::new(Arc::new(SystemClock)));
//! let bus = Arc::new(BroadcastBus::default());
//!
//! let cache = TieredCache::builder(CacheConfig::default())
//!     .connector(cluster)
//!     .bus(bus)
//!     .node_id("shard-a")
//!     .build()?;
//! ```

mod broadcast_bus;
mod membership;
mod memory_store;

pub use broadcast_bus::{BroadcastBus, BusStats, DEFAULT_BUS_CAPACITY};
pub use membership::StaticMembership;
pub use memory_store::{InMemoryCluster, InMemoryShardStore, ShardStoreStats};
