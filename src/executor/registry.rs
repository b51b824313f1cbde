//! Task Registry
//!
//! Maps a `MapReduce` implementation's `NAME` to a type-erased runner so a
//! node can execute sub-tasks it receives over the wire. Every node that may
//! hold partitions must register the same task types.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

use super::executor::TaskEngine;
use super::types::{MapReduce, Partial, TaskRequest};
use crate::error::{ClusterError, Result};

/// Type-erased runner: decodes the prototype and runs the requested subtrees.
pub type TaskRunnerFn =
    Arc<dyn Fn(Arc<TaskEngine>, TaskRequest) -> BoxFuture<'static, Result<Vec<Partial>>> + Send + Sync>;

pub struct TaskRegistry {
    runners: DashMap<String, TaskRunnerFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            runners: DashMap::new(),
        }
    }

    pub fn register<T: MapReduce>(&self) {
        let runner: TaskRunnerFn = Arc::new(|engine: Arc<TaskEngine>, request: TaskRequest| {
            async move {
                let prototype: T = bincode::deserialize(&request.state)?;
                engine.run_remote(request, prototype).await
            }
            .boxed()
        });

        self.runners.insert(T::NAME.to_string(), runner);
        tracing::info!("Registered task: {}", T::NAME);
    }

    pub async fn execute(&self, engine: Arc<TaskEngine>, request: TaskRequest) -> Result<Vec<Partial>> {
        let runner = self
            .runners
            .get(&request.name)
            .map(|entry| entry.value().clone());

        match runner {
            Some(runner) => {
                tracing::debug!(
                    "Running {} sub-task {} over {} subtree(s)",
                    request.name,
                    request.task_id.0,
                    request.ranges.len()
                );
                runner(engine, request).await
            }
            None => {
                let error = format!("Unknown task: {}", request.name);
                tracing::error!("{}", error);
                Err(ClusterError::TaskFailed(error))
            }
        }
    }

    pub fn list_tasks(&self) -> Vec<String> {
        self.runners.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.runners.contains_key(name)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
