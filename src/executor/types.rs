use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::fvec::chunk::Chunk;
use crate::key::Key;
use crate::membership::cloud::Cloud;
use crate::membership::types::NodeId;
use crate::storage::memory::DistributedStore;

/// Unique identifier of one task invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a task on the node that submitted it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskState {
    Created,
    LocalSetup,
    Dispatched,
    RunningLocal,
    RunningRemote,
    Reducing,
    Done,
    Cancelled,
    Failed { error: String },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Cancelled | TaskState::Failed { .. }
        )
    }
}

/// How a task ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion<T> {
    Done(T),
    Cancelled,
}

impl<T> Completion<T> {
    pub fn into_done(self) -> Option<T> {
        match self {
            Completion::Done(t) => Some(t),
            Completion::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Completion::Cancelled)
    }
}

/// What a node knows while setting a task up locally.
pub struct LocalContext {
    pub task_id: TaskId,
    pub node: NodeId,
    pub cloud: Arc<Cloud>,
    pub store: Arc<DistributedStore>,
}

/// Per-algorithm capability plugged into the task engine.
///
/// The engine clones the set-up prototype once per partition, calls `map`
/// with that partition's chunk of every scanned vector, and folds the results
/// pairwise with `reduce` in a fixed fork-tree order. `reduce` must be
/// associative; it need not be commutative. State crosses the wire with
/// serde, so accumulators should be plain data.
pub trait MapReduce: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Registry name used to run the task on remote nodes.
    const NAME: &'static str;

    /// Runs once per node per task before any `map`.
    fn setup_local(&mut self, _ctx: &LocalContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn map(&mut self, chunks: &[Chunk]) -> anyhow::Result<()>;

    /// Folds `other` (the right-hand neighbour) into `self`.
    fn reduce(&mut self, other: Self) -> anyhow::Result<()>;
}

/// A remote sub-task: every subtree of the fork tree homed on the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub name: String,
    /// bincode of the prototype before local setup.
    pub state: Vec<u8>,
    pub vectors: Vec<Key>,
    /// Half-open partition ranges, each one fork-tree subtree.
    pub ranges: Vec<(u32, u32)>,
}

/// One reduced subtree returned by a remote node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partial {
    pub lo: u32,
    pub hi: u32,
    pub state: Vec<u8>,
}
