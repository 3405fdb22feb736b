//! Caller-supplied deadline carried through every shared-tier call and lease wait.

use std::time::Duration;

use tokio::time::Instant;

use super::entry::{millis, CacheKey};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    started: Instant,
    at: Instant,
}

impl Deadline {
    /// Deadline `budget` from now
    pub fn after(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: started + budget,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// `DeadlineExceeded` for a key
    pub fn exceeded(&self, key: &CacheKey) -> Error {
        Error::DeadlineExceeded {
            key: key.to_string(),
            after_ms: millis(self.elapsed()),
        }
    }
}
