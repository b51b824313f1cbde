//! Cluster Node
//!
//! One participant of the cloud: its cloud handle, RPC client, store and task
//! engine, plus the dispatcher for everything other nodes send it.

use axum::Router;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::config::NodeConfig;
use crate::error::{ClusterError, Result};
use crate::executor::executor::TaskEngine;
use crate::key::{home_of, Key};
use crate::membership::cloud::{Cloud, CloudHandle};
use crate::membership::service::MembershipService;
use crate::membership::types::{Node, NodeId};
use crate::rpc::client::RpcClient;
use crate::rpc::handlers::router;
use crate::rpc::protocol::{Envelope, RpcRequest, RpcResponse};
use crate::rpc::transport::{HttpTransport, LocalTransport, RpcHandler, Transport};
use crate::storage::codec::TypeRegistry;
use crate::storage::memory::{DistributedStore, Write};
use crate::storage::persist::{DiskPersist, MemPersist, Persist};

const KEY_COUNT_INTERVAL: Duration = Duration::from_secs(1);

pub struct ClusterNode {
    id: NodeId,
    cloud: Arc<CloudHandle>,
    rpc: Arc<RpcClient>,
    store: Arc<DistributedStore>,
    engine: Arc<TaskEngine>,
    membership: Option<Arc<MembershipService>>,
}

impl ClusterNode {
    /// Wires a node around an existing cloud handle and transport.
    pub fn new(
        cloud: Arc<CloudHandle>,
        transport: Arc<dyn Transport>,
        persist: Arc<dyn Persist>,
        types: Arc<TypeRegistry>,
        config: &NodeConfig,
    ) -> Arc<Self> {
        Self::build(cloud, transport, persist, types, config, None)
    }

    fn build(
        cloud: Arc<CloudHandle>,
        transport: Arc<dyn Transport>,
        persist: Arc<dyn Persist>,
        types: Arc<TypeRegistry>,
        config: &NodeConfig,
        membership: Option<Arc<MembershipService>>,
    ) -> Arc<Self> {
        let id = cloud.local_id().clone();
        let rpc = Arc::new(RpcClient::new(
            id.clone(),
            transport,
            config.rpc_attempts,
            config.rpc_timeout,
        ));
        let store = Arc::new(DistributedStore::new(
            cloud.clone(),
            rpc.clone(),
            persist,
            types,
            config.store_config(),
        ));
        let engine = TaskEngine::new(cloud.clone(), store.clone(), rpc.clone(), config.workers);

        Arc::new(Self {
            id,
            cloud,
            rpc,
            store,
            engine,
            membership,
        })
    }

    /// Starts a networked node: UDP membership on `config.bind`, RPC over
    /// HTTP on port + 1000, and the background memory manager.
    pub async fn launch(config: &NodeConfig) -> anyhow::Result<Arc<Self>> {
        let membership = MembershipService::new(config.bind, &config.cloud_name).await?;
        let persist: Arc<dyn Persist> = match &config.spill_dir {
            Some(dir) => Arc::new(DiskPersist::new(dir).await?),
            None => Arc::new(MemPersist::new()),
        };

        let node = Self::build(
            membership.cloud_handle(),
            Arc::new(HttpTransport::new()),
            persist,
            Arc::new(TypeRegistry::new()),
            config,
            Some(membership.clone()),
        );

        membership.clone().start().await;
        membership.join(&config.seeds).await?;
        node.start_background();

        tracing::info!(
            "Node {:?} up (gossip={}, rpc={})",
            node.id,
            membership.local_node.gossip_addr,
            membership.local_node.http_addr
        );
        Ok(node)
    }

    fn start_background(self: &Arc<Self>) {
        self.store.clone().start_memory_manager();

        if let Some(membership) = &self.membership {
            let membership = membership.clone();
            let store = self.store.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(KEY_COUNT_INTERVAL);
                loop {
                    interval.tick().await;
                    membership.set_local_key_count(store.local_key_count() as u64);
                }
            });
        }
    }

    /// HTTP routes for inbound RPC.
    pub fn router(self: &Arc<Self>) -> Router {
        router(self.clone())
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn cloud(&self) -> &Arc<CloudHandle> {
        &self.cloud
    }

    pub fn current_cloud(&self) -> Arc<Cloud> {
        self.cloud.current()
    }

    pub fn store(&self) -> &Arc<DistributedStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    pub fn membership(&self) -> Option<&Arc<MembershipService>> {
        self.membership.as_ref()
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<RpcResponse> {
        let Envelope {
            from,
            cloud_version,
            seq,
            request,
            ..
        } = envelope;

        let current = self.cloud.current();
        if request.requires_same_cloud() && cloud_version != current.version() {
            tracing::debug!(
                "Rejecting request from {:?} issued under cloud v{} (now v{})",
                from,
                cloud_version,
                current.version()
            );
            return Err(ClusterError::CloudChanged {
                expected: cloud_version,
                actual: current.version(),
            });
        }
        if let Some(key) = request.ordered_key() {
            tracing::trace!("{:?} seq {} on {} from {:?}", self.id, seq, key, from);
        }

        match request {
            RpcRequest::Fetch { key } => {
                let value = self.store.serve_fetch(&from, &key).await?;
                Ok(RpcResponse::Value(value))
            }
            RpcRequest::Put {
                key,
                value,
                dont_cache,
            } => self.write(&from, seq, &key, Write::Put(value), dont_cache).await,
            RpcRequest::Cas {
                key,
                expected_version,
                value,
            } => {
                let write = Write::Cas {
                    expected_version,
                    value,
                };
                self.write(&from, seq, &key, write, false).await
            }
            RpcRequest::Remove { key } => self.write(&from, seq, &key, Write::Remove, true).await,
            RpcRequest::Invalidate { key, version } => {
                self.store.apply_invalidate(&from, seq, &key, version);
                Ok(RpcResponse::Ok)
            }
            RpcRequest::Lock { key, mode, owner } => {
                self.store.apply_lock(&key, mode, &owner)?;
                Ok(RpcResponse::Ok)
            }
            RpcRequest::Unlock { key, owner } => {
                self.store.apply_unlock(&key, &owner);
                Ok(RpcResponse::Ok)
            }
            RpcRequest::RunTask(task) => {
                let partials = self.engine.serve_remote(task).await?;
                Ok(RpcResponse::Partials(partials))
            }
            RpcRequest::CancelTask { task_id } => {
                self.engine.cancel(&task_id);
                Ok(RpcResponse::Ok)
            }
        }
    }

    async fn write(
        &self,
        from: &NodeId,
        seq: u64,
        key: &Key,
        write: Write,
        dont_cache: bool,
    ) -> Result<RpcResponse> {
        let cloud = self.cloud.require_settled()?;
        let version = self
            .store
            .apply_write(&cloud, from, Some(seq), key, write, dont_cache)
            .await?;
        Ok(RpcResponse::Ack { version })
    }
}

impl RpcHandler for ClusterNode {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'_, RpcResponse> {
        async move {
            match self.dispatch(envelope).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("RPC on {:?} failed: {}", self.id, e);
                    RpcResponse::Error(e)
                }
            }
        }
        .boxed()
    }
}

/// Several nodes in one process, joined by a `LocalTransport` and sharing one
/// settled cloud. Used by tests and demos; membership gossip is not running.
pub struct LocalCluster {
    pub nodes: Vec<Arc<ClusterNode>>,
    pub transport: Arc<LocalTransport>,
}

impl LocalCluster {
    pub fn new(size: usize, config: &NodeConfig) -> Self {
        Self::wrapped(size, config, |local| local as Arc<dyn Transport>)
    }

    /// Like `new`, but every node sends through `wrap(local transport)`, so a
    /// test can delay, reorder or drop traffic.
    pub fn wrapped(
        size: usize,
        config: &NodeConfig,
        wrap: impl FnOnce(Arc<LocalTransport>) -> Arc<dyn Transport>,
    ) -> Self {
        let members: Vec<Node> = (0..size)
            .map(|i| {
                Node::local(
                    NodeId(format!("node-{:02}", i)),
                    std::net::SocketAddr::from(([127, 0, 0, 1], 7000 + i as u16)),
                )
            })
            .collect();
        let transport = LocalTransport::new();
        let sender = wrap(transport.clone());

        let nodes: Vec<Arc<ClusterNode>> = members
            .iter()
            .map(|member| {
                let cloud = CloudHandle::bootstrap(member.clone());
                cloud.publish(Cloud::new(2, members.clone()));
                let node = ClusterNode::new(
                    cloud,
                    sender.clone(),
                    Arc::new(MemPersist::new()),
                    Arc::new(TypeRegistry::new()),
                    config,
                );
                let handler: Weak<dyn RpcHandler> = Arc::downgrade(&node) as Weak<dyn RpcHandler>;
                transport.register(member.id.clone(), handler);
                node
            })
            .collect();

        tracing::info!("Local cluster of {} node(s) ready", size);
        Self { nodes, transport }
    }

    pub fn node(&self, i: usize) -> &Arc<ClusterNode> {
        &self.nodes[i]
    }

    /// Node that is home for `key` under the shared cloud.
    pub fn home_of(&self, key: &Key) -> &Arc<ClusterNode> {
        let first = &self.nodes[0];
        let home = home_of(key, &first.current_cloud(), first.id());
        self.nodes
            .iter()
            .find(|n| n.id() == &home)
            .unwrap_or(first)
    }

    /// Makes a node unreachable, as if its process died.
    pub fn kill(&self, i: usize) {
        self.transport.disconnect(self.nodes[i].id());
    }
}
