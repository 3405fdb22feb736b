//! Error types for the cache coordination layer

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache coordination layer.
///
/// `Clone` so that a single failure can be delivered to every caller
/// coalesced behind one recompute.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A shard node (L2) could not be reached or answered with a failure
    #[error("Transport error talking to shard {node}: {reason}")]
    Transport { node: String, reason: String },

    /// The caller-supplied loader failed to produce a value
    #[error("Loader failed for key {key}: {reason}")]
    Loader { key: String, reason: String },

    /// A lease holder stopped responding and the lease expired while waiting
    #[error("Lease timed out for key {key}")]
    LeaseTimeout { key: String },

    /// A lease was revoked by a concurrent delete before the holder populated
    #[error("Lease revoked for key {key}")]
    LeaseRevoked { key: String },

    /// No shard node can serve the key
    #[error("Shard unavailable: {0}")]
    ShardUnavailable(String),

    /// The caller's deadline passed before the cache could answer
    #[error("Deadline exceeded for key {key} after {after_ms}ms")]
    DeadlineExceeded { key: String, after_ms: u64 },

    /// Invalidation bus could not accept or deliver an event
    #[error("Invalidation bus unavailable: {0}")]
    BusUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a transport error for a node
    pub fn transport(node: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Error::Transport {
            node: node.to_string(),
            reason: reason.into(),
        }
    }

    /// True for failures of the cache infrastructure itself (retry / degrade),
    /// as opposed to failures the caller must see.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::ShardUnavailable(_)
                | Error::LeaseTimeout { .. }
                | Error::BusUnavailable(_)
        )
    }

    /// True if the error came from the loader
    pub fn is_loader(&self) -> bool {
        matches!(self, Error::Loader { .. })
    }
}

/// Failure reported by a [`Loader`](crate::domain::ports::Loader) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct LoaderError {
    pub message: String,
}

impl LoaderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
