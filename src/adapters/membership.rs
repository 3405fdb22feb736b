//! Static membership source, mutable at runtime for operators and tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::cache::NodeId;
use crate::domain::ports::MembershipSource;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct StaticMembership {
    members: RwLock<BTreeSet<NodeId>>,
    reachable: AtomicBool,
}

impl StaticMembership {
    pub fn new<I, N>(members: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        Self {
            members: RwLock::new(members.into_iter().map(Into::into).collect()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn add(&self, node: impl Into<NodeId>) -> bool {
        self.members.write().insert(node.into())
    }

    pub fn remove(&self, node: &NodeId) -> bool {
        self.members.write().remove(node)
    }

    /// Make `fetch_members` fail, as an unreachable registry would
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl MembershipSource for StaticMembership {
    async fn fetch_members(&self) -> Result<BTreeSet<NodeId>> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Internal("membership source unreachable".into()));
        }
        Ok(self.members.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_members() {
        let source = StaticMembership::new(["shard-a", "shard-b"]);
        assert!(source.add("shard-c"));
        assert!(!source.add("shard-a"));
        assert!(source.remove(&NodeId::from("shard-b")));

        let members = source.fetch_members().await.unwrap();
        let names: Vec<_> = members.iter().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["shard-a", "shard-c"]);

        source.set_reachable(false);
        assert!(source.fetch_members().await.is_err());
    }
}
