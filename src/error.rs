//! Classified failures shared by every subsystem.
//!
//! Each variant belongs to one class: transient network trouble (retried by the
//! RPC layer and nowhere else), ownership/coherence conflicts (caller retries
//! its own operation), membership errors (fail fast), task-logic errors and
//! cancellation. The enum is serializable so a remote node can hand back a
//! failure without losing its class.

use crate::key::Key;
use crate::membership::types::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("node {0:?} is not a member of the current cloud")]
    NotInCloud(NodeId),

    #[error("cloud membership is not settled")]
    CloudUnsettled,

    #[error("cloud changed from version {expected} to {actual}")]
    CloudChanged { expected: u64, actual: u64 },

    #[error("stale compare-and-swap on {key}: current version is {current}")]
    CasConflict { key: Key, current: u64 },

    #[error("write to {key} was overtaken by a later write from the same node (current version {current})")]
    Superseded { key: Key, current: u64 },

    #[error("{key} is locked by {holder}")]
    Locked { key: Key, holder: String },

    #[error("key not found: {0}")]
    NotFound(Key),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("node {0:?} was lost during the operation")]
    NodeLost(NodeId),

    #[error("invalidation of {key} did not complete in time")]
    InvalidationTimeout { key: Key },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("persistence error: {0}")]
    Persist(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    /// Only transport hiccups are worth repeating at the RPC layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Transport(_))
    }

    /// Errors that leave the cluster in a state no single caller can repair.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::InvalidationTimeout { .. } | ClusterError::NodeLost(_)
        )
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(e: bincode::Error) -> Self {
        ClusterError::Codec(e.to_string())
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Persist(e.to_string())
    }
}
