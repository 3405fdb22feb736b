//! ShardCache - Distributed Multi-Level Cache
//!
//! A read-through cache shared by a fleet of processes. Each process keeps a
//! small local tier (L1) in front of a sharded shared tier (L2); keys are
//! placed on shard nodes by consistent hashing, and a per-key lease in the
//! shared tier makes sure a missing key is recomputed once, not once per
//! caller or once per process.
//!
//! # Architecture
//!
//! ```text
//! caller ─▶ L1 (local) ─▶ Stampede Guard ─▶ L2 client ─▶ Shard Router ─▶ shard node
//!            ▲                  │                │
//!            │                  ▼                ▼
//!            │               Loader       Invalidation Bus
//!            └───────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - Consistent hashing with virtual nodes, immutable versioned shard maps
//! - L1 with LRU or LFU eviction and a short self-healing TTL
//! - Cross-process single flight through leases, in-process request coalescing
//! - Probabilistic early refresh ahead of expiry
//! - Negative caching of "not found upstream"
//! - Versioned invalidations; stale events are discarded
//! - Degrade-to-loader when the shared tier is unavailable
//!
//! # Modules
//!
//! - [`adapters`] - In-memory shard nodes, broadcast bus, static membership
//! - [`admin`] - Membership, stats, manual invalidation, health
//! - [`cache`] - Router, tiers, stampede guard and the `TieredCache` facade
//! - [`domain`] - Ports (loader, transports, clock) and events
//! - [`error`] - Error types

pub mod adapters;
pub mod admin;
pub mod cache;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheKey, CacheValue, Deadline, NodeId, TieredCache};
pub use domain::ports::{loader_fn, Loader};
pub use error::{Error, LoaderError, Result};
