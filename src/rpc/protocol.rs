//! Wire Protocol
//!
//! Endpoint paths and the bincode-encoded envelope exchanged between nodes.

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::executor::types::{Partial, TaskId, TaskRequest};
use crate::key::Key;
use crate::membership::types::NodeId;
use crate::storage::locks::LockMode;
use crate::storage::value::Value;

/// Latency-sensitive control traffic.
pub const ENDPOINT_RPC_CONTROL: &str = "/internal/rpc/control";
/// Chunk transfer and task dispatch.
pub const ENDPOINT_RPC_BULK: &str = "/internal/rpc/bulk";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Control,
    Bulk,
}

impl Priority {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Priority::Control => ENDPOINT_RPC_CONTROL,
            Priority::Bulk => ENDPOINT_RPC_BULK,
        }
    }

    /// Chunks travel on the bulk channel, everything else on control.
    pub fn for_key(key: &Key) -> Self {
        match key.kind() {
            crate::key::KeyKind::Chunk => Priority::Bulk,
            _ => Priority::Control,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    /// Version of the cloud the sender issued the call under.
    pub cloud_version: u64,
    pub seq: u64,
    pub priority: Priority,
    pub request: RpcRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Read a value from its home and register the sender as a replica.
    Fetch { key: Key },
    Put {
        key: Key,
        value: Value,
        dont_cache: bool,
    },
    Cas {
        key: Key,
        expected_version: u64,
        value: Value,
    },
    Remove { key: Key },
    /// Drop any cached copy of `key` older than `version`.
    Invalidate { key: Key, version: u64 },
    Lock {
        key: Key,
        mode: LockMode,
        owner: String,
    },
    Unlock { key: Key, owner: String },
    RunTask(TaskRequest),
    CancelTask { task_id: TaskId },
}

impl RpcRequest {
    /// Requests that need the sender and receiver to agree on the cloud.
    pub fn requires_same_cloud(&self) -> bool {
        matches!(
            self,
            RpcRequest::Put { .. }
                | RpcRequest::Cas { .. }
                | RpcRequest::Remove { .. }
                | RpcRequest::RunTask(_)
        )
    }

    /// Key whose put/invalidate messages must be applied in send order.
    pub fn ordered_key(&self) -> Option<&Key> {
        match self {
            RpcRequest::Put { key, .. }
            | RpcRequest::Cas { key, .. }
            | RpcRequest::Remove { key }
            | RpcRequest::Invalidate { key, .. } => Some(key),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    Value(Option<Value>),
    /// Version assigned by the home to an accepted write.
    Ack { version: u64 },
    Partials(Vec<Partial>),
    Ok,
    Error(ClusterError),
}
