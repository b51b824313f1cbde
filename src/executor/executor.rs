//! Fork-Join Task Engine
//!
//! Runs a `MapReduce` over every partition of one or more chunk-aligned
//! vectors.
//!
//! ## Lifecycle
//! 1. **Setup**: the vectors' metadata gives the partition count; the
//!    prototype runs `setup_local` once on the submitting node.
//! 2. **Dispatch**: the fork tree is covered by maximal subtrees whose
//!    partitions share a home. Every remote home receives one sub-task with
//!    all of its subtrees.
//! 3. **Leaves**: each leaf faults in its chunks through the store, then runs
//!    `map` on a bounded worker pool.
//! 4. **Reduce**: subtrees reduce pairwise in tree order; the root reassembles
//!    local and remote partials along the same tree.
//!
//! Cancellation is a `CancellationToken` checked at every fork boundary and at
//! the start of every leaf. In-flight leaves finish; nothing new starts.

use dashmap::DashMap;
use futures::future::{join, join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::fork::{assemble, combine, gather, homogeneous_cover, split};
use super::registry::TaskRegistry;
use super::types::{Completion, LocalContext, MapReduce, Partial, TaskId, TaskRequest, TaskState};
use crate::error::{ClusterError, Result};
use crate::fvec::chunk::Chunk;
use crate::fvec::vector::{load_chunk, load_meta, VecMeta};
use crate::key::{home_of, Key};
use crate::membership::cloud::{Cloud, CloudHandle};
use crate::membership::types::NodeId;
use crate::rpc::client::RpcClient;
use crate::rpc::protocol::{Priority, RpcRequest, RpcResponse};
use crate::storage::memory::DistributedStore;

/// Finished tasks whose final state stays queryable.
pub const FINISHED_TASKS_RETAINED: usize = 256;

struct TaskEntry {
    state: TaskState,
    token: CancellationToken,
    progress: Arc<AtomicUsize>,
}

/// Everything a running (sub-)task shares between its leaves.
struct RunCtx<T> {
    task_id: TaskId,
    prototype: T,
    vectors: Vec<VecMeta>,
    token: CancellationToken,
    progress: Arc<AtomicUsize>,
}

pub struct TaskEngine {
    local: NodeId,
    cloud: Arc<CloudHandle>,
    store: Arc<DistributedStore>,
    rpc: Arc<RpcClient>,
    registry: TaskRegistry,
    workers: Arc<Semaphore>,
    worker_count: usize,
    tasks: DashMap<TaskId, TaskEntry>,
    finished: Mutex<VecDeque<TaskId>>,
}

impl TaskEngine {
    /// # Arguments
    /// * `worker_count`: concurrent `map` calls on this node, typically the core count.
    pub fn new(
        cloud: Arc<CloudHandle>,
        store: Arc<DistributedStore>,
        rpc: Arc<RpcClient>,
        worker_count: usize,
    ) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        tracing::info!("Task engine started with {} workers", worker_count);
        Arc::new(Self {
            local: cloud.local_id().clone(),
            cloud,
            store,
            rpc,
            registry: TaskRegistry::new(),
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            tasks: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
        })
    }

    pub fn register<T: MapReduce>(&self) {
        self.registry.register::<T>();
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskState> {
        self.tasks.get(task_id).map(|e| e.state.clone())
    }

    /// Cancels a task by id. Remote sub-tasks are told to stop as well.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        match self.tasks.get(task_id) {
            Some(entry) => {
                tracing::info!("Cancelling task {}", task_id.0);
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    fn set_state(&self, task_id: &TaskId, state: TaskState) {
        if let Some(mut entry) = self.tasks.get_mut(task_id) {
            tracing::debug!("Task {}: {:?} -> {:?}", task_id.0, entry.state, state);
            entry.state = state;
        }
    }

    /// Keeps the final state of `task_id` and forgets the oldest finished
    /// task beyond `FINISHED_TASKS_RETAINED`.
    fn retire(&self, task_id: &TaskId) {
        let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        finished.push_back(task_id.clone());
        while finished.len() > FINISHED_TASKS_RETAINED {
            if let Some(oldest) = finished.pop_front() {
                self.tasks.remove(&oldest);
            }
        }
    }

    /// Starts `task` over `vectors` and returns immediately.
    pub fn submit<T: MapReduce>(self: &Arc<Self>, task: T, vectors: &[Key]) -> TaskHandle<T> {
        let task_id = TaskId::new();
        let token = CancellationToken::new();
        let progress = Arc::new(AtomicUsize::new(0));

        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                state: TaskState::Created,
                token: token.clone(),
                progress: progress.clone(),
            },
        );
        tracing::info!("Task {} ({}) created", task_id.0, T::NAME);

        let engine = self.clone();
        let id = task_id.clone();
        let vectors = vectors.to_vec();
        let join = tokio::spawn(async move { engine.drive(id, task, vectors).await });

        TaskHandle {
            id: task_id,
            token,
            progress,
            engine: self.clone(),
            join,
        }
    }

    /// Runs `task` to completion.
    pub async fn run<T: MapReduce>(self: &Arc<Self>, task: T, vectors: &[Key]) -> Result<Completion<T>> {
        self.submit(task, vectors).join().await
    }

    async fn drive<T: MapReduce>(
        self: Arc<Self>,
        task_id: TaskId,
        task: T,
        vectors: Vec<Key>,
    ) -> Result<Completion<T>> {
        let result = self.execute(&task_id, task, &vectors).await;

        let outcome = match result {
            Ok(done) => {
                self.set_state(&task_id, TaskState::Done);
                tracing::info!("Task {} done", task_id.0);
                Ok(Completion::Done(done))
            }
            Err(ClusterError::Cancelled) => {
                self.set_state(&task_id, TaskState::Cancelled);
                tracing::info!("Task {} cancelled", task_id.0);
                Ok(Completion::Cancelled)
            }
            Err(e) => {
                self.set_state(
                    &task_id,
                    TaskState::Failed {
                        error: e.to_string(),
                    },
                );
                tracing::error!("Task {} failed: {}", task_id.0, e);
                Err(e)
            }
        };
        self.retire(&task_id);
        outcome
    }

    async fn execute<T: MapReduce>(
        self: &Arc<Self>,
        task_id: &TaskId,
        task: T,
        vectors: &[Key],
    ) -> Result<T> {
        let (token, progress) = match self.tasks.get(task_id) {
            Some(entry) => (entry.token.clone(), entry.progress.clone()),
            None => return Err(ClusterError::TaskFailed("task entry vanished".into())),
        };
        let cloud = self.cloud.require_settled()?;

        self.set_state(task_id, TaskState::LocalSetup);
        let wire_state = bincode::serialize(&task)?;
        let metas = self.load_metas(vectors).await?;
        let prototype = self.setup(task_id, task, &cloud)?;

        let n = metas.first().map(|m| m.n_chunks()).unwrap_or(0);
        if n == 0 {
            return Ok(prototype);
        }

        let homes: Vec<NodeId> = (0..n)
            .map(|cidx| home_of(&metas[0].chunk_key(cidx), &cloud, &self.local))
            .collect();

        let mut local_ranges = Vec::new();
        let mut remote: BTreeMap<NodeId, Vec<(u32, u32)>> = BTreeMap::new();
        for (lo, hi, home) in homogeneous_cover(&homes) {
            if home == self.local {
                local_ranges.push((lo, hi));
            } else {
                remote.entry(home).or_default().push((lo, hi));
            }
        }
        tracing::debug!(
            "Task {}: {} partitions, {} local subtree(s), {} remote node(s)",
            task_id.0,
            n,
            local_ranges.len(),
            remote.len()
        );

        let ctx = Arc::new(RunCtx {
            task_id: task_id.clone(),
            prototype,
            vectors: metas,
            token: token.clone(),
            progress: progress.clone(),
        });

        self.set_state(task_id, TaskState::Dispatched);
        let remote_calls = remote.into_iter().map(|(node, ranges)| {
            let request = TaskRequest {
                task_id: task_id.clone(),
                name: T::NAME.to_string(),
                state: wire_state.clone(),
                vectors: vectors.to_vec(),
                ranges,
            };
            let (cloud, token, progress) = (cloud.clone(), token.clone(), progress.clone());
            async move {
                let result = self
                    .dispatch::<T>(&cloud, node, request, &token, &progress)
                    .await;
                stop_siblings_on_failure(&result, &token);
                result
            }
        });

        self.set_state(task_id, TaskState::RunningLocal);
        let local_run = async {
            let out = self.clone().run_ranges(ctx.clone(), local_ranges).await;
            stop_siblings_on_failure(&out, &token);
            self.set_state(task_id, TaskState::RunningRemote);
            out
        };
        let (local, remote) = join(local_run, join_all(remote_calls)).await;
        let (local, remote) = combine(local, gather(remote))?;

        if token.is_cancelled() {
            return Err(ClusterError::Cancelled);
        }
        self.cloud.ensure_current(&cloud)?;

        self.set_state(task_id, TaskState::Reducing);
        let mut parts: HashMap<(u32, u32), T> = local
            .into_iter()
            .chain(remote.into_iter().flatten())
            .map(|(lo, hi, t)| ((lo, hi), t))
            .collect();
        assemble(0, n, &mut parts, &mut |mut left: T, right: T| {
            left.reduce(right)
                .map_err(|e| ClusterError::TaskFailed(format!("reduce failed: {:#}", e)))?;
            Ok(left)
        })
    }

    async fn load_metas(&self, vectors: &[Key]) -> Result<Vec<VecMeta>> {
        let metas = try_join_all(vectors.iter().map(|key| load_meta(&self.store, key))).await?;
        if let Some(first) = metas.first() {
            if let Some(other) = metas.iter().find(|m| m.espc != first.espc) {
                return Err(ClusterError::TaskFailed(format!(
                    "{} and {} are not chunk-aligned",
                    first.key, other.key
                )));
            }
        }
        Ok(metas)
    }

    fn setup<T: MapReduce>(&self, task_id: &TaskId, mut task: T, cloud: &Arc<Cloud>) -> Result<T> {
        let ctx = LocalContext {
            task_id: task_id.clone(),
            node: self.local.clone(),
            cloud: cloud.clone(),
            store: self.store.clone(),
        };
        task.setup_local(&ctx)
            .map_err(|e| ClusterError::TaskFailed(format!("setup failed: {:#}", e)))?;
        Ok(task)
    }

    /// Ships one sub-task and decodes its partials. A node that cannot be
    /// reached is reported as lost; the task is never resubmitted elsewhere.
    async fn dispatch<T: MapReduce>(
        &self,
        cloud: &Cloud,
        node: NodeId,
        request: TaskRequest,
        token: &CancellationToken,
        progress: &AtomicUsize,
    ) -> Result<Vec<(u32, u32, T)>> {
        let task_id = request.task_id.clone();
        let call = self
            .rpc
            .call(cloud, &node, Priority::Bulk, RpcRequest::RunTask(request));
        tokio::pin!(call);

        let response = tokio::select! {
            response = &mut call => response,
            _ = token.cancelled() => {
                let cancel = RpcRequest::CancelTask { task_id: task_id.clone() };
                if let Err(e) = self.rpc.dinvoke(cloud, &node, Priority::Control, cancel).await {
                    tracing::warn!("Failed to cancel sub-task on {:?}: {}", node, e);
                }
                call.await
            }
        };

        let partials = match response {
            Ok(RpcResponse::Partials(partials)) => partials,
            Ok(other) => {
                return Err(ClusterError::Codec(format!(
                    "unexpected task response: {:?}",
                    other
                )))
            }
            Err(ClusterError::Transport(e)) => {
                tracing::error!("Lost {:?} while running task {}: {}", node, task_id.0, e);
                return Err(ClusterError::NodeLost(node.clone()));
            }
            Err(ClusterError::NotInCloud(_)) => return Err(ClusterError::NodeLost(node.clone())),
            Err(e) => return Err(e),
        };

        partials
            .into_iter()
            .map(|p| {
                let state: T = bincode::deserialize(&p.state)?;
                progress.fetch_add((p.hi - p.lo) as usize, Ordering::Relaxed);
                Ok((p.lo, p.hi, state))
            })
            .collect()
    }

    /// Executes a sub-task received from another node.
    pub async fn serve_remote(self: &Arc<Self>, request: TaskRequest) -> Result<Vec<Partial>> {
        self.registry.execute(self.clone(), request).await
    }

    pub(crate) async fn run_remote<T: MapReduce>(
        self: Arc<Self>,
        request: TaskRequest,
        prototype: T,
    ) -> Result<Vec<Partial>> {
        let task_id = request.task_id.clone();
        let token = CancellationToken::new();
        let progress = Arc::new(AtomicUsize::new(0));
        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                state: TaskState::RunningLocal,
                token: token.clone(),
                progress: progress.clone(),
            },
        );

        let result = async {
            let cloud = self.cloud.require_settled()?;
            let metas = self.load_metas(&request.vectors).await?;
            let prototype = self.setup(&task_id, prototype, &cloud)?;
            let ctx = Arc::new(RunCtx {
                task_id: task_id.clone(),
                prototype,
                vectors: metas,
                token,
                progress,
            });
            let results = self.clone().run_ranges(ctx, request.ranges.clone()).await?;
            results
                .into_iter()
                .map(|(lo, hi, t)| {
                    Ok(Partial {
                        lo,
                        hi,
                        state: bincode::serialize(&t)?,
                    })
                })
                .collect::<Result<Vec<Partial>>>()
        }
        .await;

        self.tasks.remove(&task_id);
        if let Err(e) = &result {
            tracing::debug!("Sub-task {} ended early: {}", task_id.0, e);
        }
        result
    }

    async fn run_ranges<T: MapReduce>(
        self: Arc<Self>,
        ctx: Arc<RunCtx<T>>,
        ranges: Vec<(u32, u32)>,
    ) -> Result<Vec<(u32, u32, T)>> {
        let runs = ranges.into_iter().map(|(lo, hi)| {
            let fut = self.clone().run_range(ctx.clone(), lo, hi);
            async move { fut.await.map(|t| (lo, hi, t)) }
        });

        gather(join_all(runs).await)
    }

    /// One fork-tree subtree: both halves run concurrently, then the left
    /// absorbs the right.
    fn run_range<T: MapReduce>(
        self: Arc<Self>,
        ctx: Arc<RunCtx<T>>,
        lo: u32,
        hi: u32,
    ) -> BoxFuture<'static, Result<T>> {
        async move {
            if ctx.token.is_cancelled() {
                return Err(ClusterError::Cancelled);
            }
            if hi - lo == 1 {
                return self.run_leaf(&ctx, lo).await;
            }

            let mid = split(lo, hi);
            let (left, right) = join(
                self.clone().run_range(ctx.clone(), lo, mid),
                self.clone().run_range(ctx.clone(), mid, hi),
            )
            .await;
            let (mut left, right) = combine(left, right)?;

            if ctx.token.is_cancelled() {
                return Err(ClusterError::Cancelled);
            }
            if let Err(e) = left.reduce(right) {
                ctx.token.cancel();
                return Err(ClusterError::TaskFailed(format!("reduce failed: {:#}", e)));
            }
            Ok(left)
        }
        .boxed()
    }

    async fn run_leaf<T: MapReduce>(&self, ctx: &RunCtx<T>, cidx: u32) -> Result<T> {
        let chunks: Vec<Chunk> = try_join_all(
            ctx.vectors
                .iter()
                .map(|meta| load_chunk(&self.store, meta, cidx)),
        )
        .await?;

        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClusterError::TaskFailed("worker pool closed".into()))?;
        if ctx.token.is_cancelled() {
            return Err(ClusterError::Cancelled);
        }

        let mut acc = ctx.prototype.clone();
        let outcome = tokio::task::spawn_blocking(move || acc.map(&chunks).map(|_| acc)).await;

        match outcome {
            Ok(Ok(acc)) => {
                ctx.progress.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Task {}: partition {} mapped", ctx.task_id.0, cidx);
                Ok(acc)
            }
            Ok(Err(e)) => {
                ctx.token.cancel();
                Err(ClusterError::TaskFailed(format!(
                    "map failed on partition {}: {:#}",
                    cidx, e
                )))
            }
            Err(e) => {
                ctx.token.cancel();
                Err(ClusterError::TaskFailed(format!(
                    "map panicked on partition {}: {}",
                    cidx, e
                )))
            }
        }
    }
}

/// A failed branch cancels the task, so sibling leaves stop and every
/// remote sub-task still running is told to stop.
fn stop_siblings_on_failure<R>(result: &Result<R>, token: &CancellationToken) {
    if let Err(e) = result {
        if *e != ClusterError::Cancelled && !token.is_cancelled() {
            token.cancel();
        }
    }
}

/// Caller's view of a submitted task.
pub struct TaskHandle<T> {
    id: TaskId,
    token: CancellationToken,
    progress: Arc<AtomicUsize>,
    engine: Arc<TaskEngine>,
    join: JoinHandle<Result<Completion<T>>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Leaves finished so far, local and remote.
    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> Option<TaskState> {
        self.engine.status(&self.id)
    }

    pub async fn join(self) -> Result<Completion<T>> {
        self.join
            .await
            .map_err(|e| ClusterError::TaskFailed(format!("task panicked: {}", e)))?
    }
}
