use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use super::protocol::{Envelope, Priority, RpcRequest, RpcResponse};
use super::transport::Transport;
use crate::error::{ClusterError, Result};
use crate::key::Key;
use crate::membership::cloud::Cloud;
use crate::membership::types::NodeId;

const CONTROL_POOL: usize = 32;
const BULK_POOL: usize = 8;
/// Task dispatch waits for the remote sub-task to finish.
const TASK_DISPATCH_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct RpcClient {
    local: NodeId,
    transport: Arc<dyn Transport>,
    control: Semaphore,
    bulk: Semaphore,
    seq: AtomicU64,
    attempts: usize,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(
        local: NodeId,
        transport: Arc<dyn Transport>,
        attempts: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            transport,
            control: Semaphore::new(CONTROL_POOL),
            bulk: Semaphore::new(BULK_POOL),
            seq: AtomicU64::new(1),
            attempts: attempts.max(1),
            timeout,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// Sends `request` to `target` under `cloud` and waits for the answer.
    ///
    /// A remote `RpcResponse::Error` is returned as `Err`. Only transport
    /// failures are retried, with exponential backoff and jitter.
    pub async fn call(
        &self,
        cloud: &Cloud,
        target: &NodeId,
        priority: Priority,
        request: RpcRequest,
    ) -> Result<RpcResponse> {
        let node = cloud
            .member(target)
            .ok_or_else(|| ClusterError::NotInCloud(target.clone()))?;

        let (timeout, attempts, pooled) = match &request {
            RpcRequest::RunTask(_) => (TASK_DISPATCH_TIMEOUT, 1, false),
            _ => (self.timeout, self.attempts, true),
        };

        let envelope = Envelope {
            from: self.local.clone(),
            cloud_version: cloud.version(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            priority,
            request,
        };

        let pool = match priority {
            Priority::Control => &self.control,
            Priority::Bulk => &self.bulk,
        };
        // A dispatched sub-task holds its connection until the remote side
        // finishes, so it does not occupy a transfer slot.
        let _permit = if pooled {
            Some(
                pool.acquire()
                    .await
                    .map_err(|_| ClusterError::Transport("rpc pool closed".into()))?,
            )
        } else {
            None
        };

        let mut delay_ms = 150u64;
        for attempt in 0..attempts {
            match self
                .transport
                .send(node, envelope.clone(), timeout)
                .await
            {
                Ok(RpcResponse::Error(e)) => return Err(e),
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    tracing::debug!(
                        "RPC to {:?} failed (attempt {}/{}): {}",
                        target,
                        attempt + 1,
                        attempts,
                        e
                    );
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClusterError::Transport("Retry attempts exhausted".into()))
    }

    /// Fire-and-execute: the caller only learns whether the request was applied.
    pub async fn dinvoke(
        &self,
        cloud: &Cloud,
        target: &NodeId,
        priority: Priority,
        request: RpcRequest,
    ) -> Result<()> {
        self.call(cloud, target, priority, request).await.map(|_| ())
    }
}

/// How an ordered message relates to the last one applied from its sender
/// for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Fresh,
    /// A resend of the last applied message; carries the version it produced.
    Repeat(u64),
    /// Sent before the last applied message and must not be applied.
    Stale,
}

struct Applied {
    seq: u64,
    version: u64,
    at: Instant,
}

/// Receiver-side ordering of put/invalidate messages per (sender, key).
///
/// Entries only matter while an older message could still be in flight, so
/// they are dropped after a horizon and when their sender leaves the cloud.
#[derive(Default)]
pub struct SequenceTracker {
    last: DashMap<(NodeId, Key), Applied>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, from: &NodeId, key: &Key, seq: u64) -> Admission {
        match self.last.get(&(from.clone(), key.clone())) {
            None => Admission::Fresh,
            Some(last) if seq > last.seq => Admission::Fresh,
            Some(last) if seq == last.seq => Admission::Repeat(last.version),
            Some(_) => Admission::Stale,
        }
    }

    /// Records that `seq` from `from` was applied to `key`, producing `version`.
    pub fn record(&self, from: &NodeId, key: &Key, seq: u64, version: u64) {
        let mut entry = self
            .last
            .entry((from.clone(), key.clone()))
            .or_insert(Applied {
                seq: 0,
                version: 0,
                at: Instant::now(),
            });
        if seq >= entry.seq {
            *entry = Applied {
                seq,
                version,
                at: Instant::now(),
            };
        }
    }

    /// Drops senders outside `cloud` and entries older than `horizon`.
    pub fn prune(&self, cloud: &Cloud, horizon: Duration) {
        self.last
            .retain(|(from, _), applied| cloud.contains(from) && applied.at.elapsed() < horizon);
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
