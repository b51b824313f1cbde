//! Immutable cloud snapshots and the handle that publishes them.
//!
//! A `Cloud` never changes after construction. Store, RPC and task code hold
//! the `Arc<Cloud>` they started with and compare versions against the handle
//! to detect that membership moved underneath them.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::watch;

use super::types::{Node, NodeId};
use crate::error::{ClusterError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cloud {
    version: u64,
    hash: u64,
    members: Vec<Node>,
}

impl Cloud {
    /// Members are ordered by `NodeId`; duplicates are dropped.
    pub fn new(version: u64, mut members: Vec<Node>) -> Self {
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members.dedup_by(|a, b| a.id == b.id);
        let hash = cloud_hash(members.iter().map(|n| &n.id));
        Self {
            version,
            hash,
            members,
        }
    }

    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn members(&self) -> &[Node] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|n| n.id.clone()).collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index_of(id).is_some()
    }

    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.members.binary_search_by(|n| n.id.cmp(id)).ok()
    }

    pub fn member(&self, id: &NodeId) -> Option<&Node> {
        self.index_of(id).map(|i| &self.members[i])
    }

    /// True when `ids` (in any order) names exactly this cloud's members.
    pub fn same_members(&self, ids: &[NodeId]) -> bool {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        sorted.len() == self.members.len()
            && sorted.iter().zip(self.members.iter()).all(|(a, b)| a == &b.id)
    }
}

pub fn cloud_hash<'a>(ids: impl Iterator<Item = &'a NodeId>) -> u64 {
    let mut hasher = DefaultHasher::new();
    for id in ids {
        id.hash(&mut hasher);
    }
    hasher.finish()
}

pub fn name_hash(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone)]
pub struct CloudState {
    pub cloud: Arc<Cloud>,
    pub settled: bool,
}

/// Owner of the node's current cloud. Published snapshots are versioned and
/// only ever move forward.
pub struct CloudHandle {
    local: NodeId,
    tx: watch::Sender<CloudState>,
}

impl CloudHandle {
    /// Starts with a settled single-member cloud containing only `local`.
    pub fn bootstrap(local: Node) -> Arc<Self> {
        let id = local.id.clone();
        let (tx, _rx) = watch::channel(CloudState {
            cloud: Arc::new(Cloud::new(1, vec![local])),
            settled: true,
        });
        Arc::new(Self { local: id, tx })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    pub fn current(&self) -> Arc<Cloud> {
        self.tx.borrow().cloud.clone()
    }

    pub fn is_settled(&self) -> bool {
        self.tx.borrow().settled
    }

    /// The current cloud, or `CloudUnsettled` while an agreement is in flight.
    pub fn require_settled(&self) -> Result<Arc<Cloud>> {
        let state = self.tx.borrow();
        if !state.settled {
            return Err(ClusterError::CloudUnsettled);
        }
        Ok(state.cloud.clone())
    }

    /// Fails if `cloud` has been superseded since the caller captured it.
    pub fn ensure_current(&self, cloud: &Cloud) -> Result<()> {
        let actual = self.tx.borrow().cloud.version();
        if actual != cloud.version() {
            return Err(ClusterError::CloudChanged {
                expected: cloud.version(),
                actual,
            });
        }
        Ok(())
    }

    /// Publishes `cloud` as settled. Older or equal versions are ignored.
    pub fn publish(&self, cloud: Cloud) -> Arc<Cloud> {
        let cloud = Arc::new(cloud);
        let mut published = cloud.clone();
        self.tx.send_if_modified(|state| {
            if cloud.version() > state.cloud.version() {
                state.cloud = cloud.clone();
                state.settled = true;
                true
            } else {
                published = state.cloud.clone();
                if cloud.version() == state.cloud.version() && !state.settled {
                    state.settled = true;
                    return true;
                }
                false
            }
        });
        if Arc::ptr_eq(&published, &cloud) {
            tracing::info!(
                "Published cloud v{} with {} member(s) (hash={:x})",
                cloud.version(),
                cloud.size(),
                cloud.hash()
            );
        }
        published
    }

    /// Marks the cloud as in flux until the next `publish`.
    pub fn unsettle(&self) {
        self.tx.send_if_modified(|state| {
            let changed = state.settled;
            state.settled = false;
            changed
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<CloudState> {
        self.tx.subscribe()
    }
}
