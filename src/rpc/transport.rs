use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::protocol::{Envelope, RpcResponse};
use crate::error::{ClusterError, Result};
use crate::membership::types::{Node, NodeId};

/// Receiving side of the RPC layer, implemented by a cluster node.
pub trait RpcHandler: Send + Sync {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'_, RpcResponse>;
}

/// Moves one envelope to `target` and returns its response. Implementations
/// report delivery problems as `ClusterError::Transport`; the client decides
/// whether to retry.
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        target: &'a Node,
        envelope: Envelope,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RpcResponse>>;
}

/// HTTP transport: bincode bodies posted to the target's control or bulk route.
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        target: &'a Node,
        envelope: Envelope,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RpcResponse>> {
        async move {
            let url = format!("http://{}{}", target.http_addr, envelope.priority.endpoint());
            let body = bincode::serialize(&envelope)?;

            let response = self
                .http_client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| ClusterError::Transport(e.to_string()))?;

            if !response.status().is_success() {
                return Err(ClusterError::Transport(format!(
                    "{:?} answered {}",
                    target.id,
                    response.status()
                )));
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| ClusterError::Transport(e.to_string()))?;
            Ok(bincode::deserialize(&bytes)?)
        }
        .boxed()
    }
}

/// In-process transport joining several nodes of one test process.
///
/// Envelopes still go through bincode so wire types are exercised. A node can
/// be disconnected to simulate a crash: calls to it fail as transport errors.
#[derive(Default)]
pub struct LocalTransport {
    handlers: DashMap<NodeId, Weak<dyn RpcHandler>>,
    down: DashSet<NodeId>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: NodeId, handler: Weak<dyn RpcHandler>) {
        self.down.remove(&id);
        self.handlers.insert(id, handler);
    }

    pub fn disconnect(&self, id: &NodeId) {
        tracing::info!("Disconnecting {:?} from local transport", id);
        self.down.insert(id.clone());
    }

    pub fn reconnect(&self, id: &NodeId) {
        self.down.remove(id);
    }
}

impl Transport for LocalTransport {
    fn send<'a>(
        &'a self,
        target: &'a Node,
        envelope: Envelope,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RpcResponse>> {
        async move {
            if self.down.contains(&target.id) {
                return Err(ClusterError::Transport(format!(
                    "{:?} is unreachable",
                    target.id
                )));
            }
            let handler = self
                .handlers
                .get(&target.id)
                .and_then(|h| h.value().upgrade())
                .ok_or_else(|| {
                    ClusterError::Transport(format!("no route to {:?}", target.id))
                })?;

            let wire = Bytes::from(bincode::serialize(&envelope)?);
            let envelope: Envelope = bincode::deserialize(&wire)?;

            let response = tokio::time::timeout(timeout, handler.handle(envelope))
                .await
                .map_err(|_| ClusterError::Transport(format!("{:?} timed out", target.id)))?;

            let wire = bincode::serialize(&response)?;
            Ok(bincode::deserialize(&wire)?)
        }
        .boxed()
    }
}
