use anyhow::Result;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use super::agreement::{Agreement, Proposal, Vote};
use super::cloud::{name_hash, Cloud, CloudHandle};
use super::types::{GossipMessage, HeartBeat, Node, NodeId, NodeState, ResourceSnapshot};

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(1);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEAD_TIMEOUT: Duration = Duration::from_secs(6);
/// How long a dead member outside the cloud is remembered before it is dropped.
const DEAD_RETENTION: Duration = Duration::from_secs(30);
const AGREEMENT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    cloud: Arc<CloudHandle>,
    agreement: Mutex<Agreement>,
    cloud_name_hash: u64,
    max_seen_version: AtomicU64,
    local_keys: AtomicU64,
}

impl MembershipService {
    pub async fn new(bind_addr: SocketAddr, cloud_name: &str) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let gossip_addr = socket.local_addr()?;
        let mut local_node = Node::local(NodeId::new(), gossip_addr);
        local_node.resources = ResourceSnapshot::capture(0);

        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        let cloud = CloudHandle::bootstrap(local_node.clone());

        Ok(Arc::new(Self {
            agreement: Mutex::new(Agreement::new(local_node.id.clone())),
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: Arc::new(RwLock::new(1)),
            cloud,
            cloud_name_hash: name_hash(cloud_name),
            max_seen_version: AtomicU64::new(1),
            local_keys: AtomicU64::new(0),
        }))
    }

    /// Sends a join request to every seed; the seeds answer with their member table.
    pub async fn join(&self, seed_nodes: &[SocketAddr]) -> Result<()> {
        if seed_nodes.is_empty() {
            return Ok(());
        }
        info!("Joining cluster via {} seed node(s)", seed_nodes.len());

        let msg = GossipMessage::Join {
            node: self.local_node.clone(),
            cloud_name_hash: self.cloud_name_hash,
        };
        let encoded = bincode::serialize(&msg)?;
        for seed_node in seed_nodes {
            self.socket.send_to(&encoded, seed_node).await?;
            info!("Sent join request to {}", seed_node);
        }
        Ok(())
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.heartbeat_loop().await;
            });
        }

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            });
        }

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            });
        }

        tracing::info!("All background tasks started");
    }

    pub fn cloud_handle(&self) -> Arc<CloudHandle> {
        self.cloud.clone()
    }

    pub fn current_cloud(&self) -> Arc<Cloud> {
        self.cloud.current()
    }

    pub fn set_local_key_count(&self, keys: u64) {
        self.local_keys.store(keys, Ordering::Relaxed);
    }

    pub fn get_member(&self, id: &NodeId) -> Option<Node> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every member not yet declared dead, ordered by id. Suspects stay in
    /// the view until they are evicted.
    pub fn live_view(&self) -> Vec<Node> {
        let mut view: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| entry.value().state != NodeState::Dead)
            .map(|entry| entry.value().clone())
            .collect();
        view.sort_by(|a, b| a.id.cmp(&b.id));
        view
    }

    /// Broadcasts one heartbeat with a fresh resource snapshot.
    pub async fn heartbeat(&self) {
        let cloud = self.cloud.current();
        let mut node = self.local_node.clone();
        node.incarnation = *self.incarnation.read().await;
        node.resources = ResourceSnapshot::capture(self.local_keys.load(Ordering::Relaxed));

        let msg = GossipMessage::Heartbeat(HeartBeat {
            node,
            cloud_name_hash: self.cloud_name_hash,
            cloud_hash: cloud.hash(),
            cloud_version: cloud.version(),
            settled: self.cloud.is_settled(),
        });
        self.broadcast_message(msg).await;
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            interval.tick().await;
            self.heartbeat().await;
            self.gossip_members().await;
        }
    }

    /// Pushes the member table to one random live peer.
    async fn gossip_members(&self) {
        let peers: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local_node.id && entry.value().state == NodeState::Alive
            })
            .map(|entry| entry.value().clone())
            .collect();

        if peers.is_empty() {
            return;
        }

        use rand::Rng;
        let idx = rand::thread_rng().gen_range(0..peers.len());
        let target = &peers[idx];

        let msg = GossipMessage::Members {
            from: self.local_node.id.clone(),
            members: self.members.iter().map(|e| e.value().clone()).collect(),
        };
        if let Err(e) = self.send_to(target.gossip_addr, &msg).await {
            tracing::warn!("Failed to gossip to {:?}: {}", target.id, e);
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub(crate) async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Heartbeat(hb) => self.handle_heartbeat(hb).await?,
            GossipMessage::Join {
                node,
                cloud_name_hash,
            } => self.handle_join(node, cloud_name_hash, src).await?,
            GossipMessage::Members { from, members } => {
                tracing::debug!("Received {} member(s) from {:?}", members.len(), from);
                for member in members {
                    self.merge_member(member);
                }
            }
            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => self.handle_suspect(node_id, incarnation).await?,
            GossipMessage::Alive {
                node_id,
                incarnation,
            } => self.handle_alive(node_id, incarnation),
            GossipMessage::Propose(proposal) => self.handle_propose(proposal).await?,
            GossipMessage::Vote(vote) => self.handle_vote(vote).await?,
            GossipMessage::Commit(proposal) => self.handle_commit(proposal).await,
        }

        Ok(())
    }

    async fn handle_heartbeat(&self, hb: HeartBeat) -> Result<()> {
        if hb.cloud_name_hash != self.cloud_name_hash {
            tracing::debug!("Ignoring heartbeat from foreign cloud node {:?}", hb.node.id);
            return Ok(());
        }
        self.max_seen_version
            .fetch_max(hb.cloud_version, Ordering::Relaxed);

        let from = hb.node.id.clone();
        self.observe(hb.node);

        let mine = self.cloud.current();
        if hb.settled && self.cloud.is_settled() && hb.cloud_hash != mine.hash() {
            tracing::debug!(
                "Cloud disagreement with {:?}: theirs v{} ({:x}), ours v{} ({:x})",
                from,
                hb.cloud_version,
                hb.cloud_hash,
                mine.version(),
                mine.hash()
            );
            self.maybe_propose().await?;
        }
        Ok(())
    }

    /// Records direct evidence that `node` is alive.
    fn observe(&self, node: Node) {
        match self.members.get_mut(&node.id) {
            Some(mut existing) => {
                if existing.state != NodeState::Alive {
                    tracing::info!("Node {:?} at {} is alive again", node.id, node.gossip_addr);
                }
                existing.state = NodeState::Alive;
                existing.incarnation = existing.incarnation.max(node.incarnation);
                existing.resources = node.resources;
                existing.last_seen = Some(Instant::now());
            }
            None => {
                tracing::info!("Discovered new member {:?} at {}", node.id, node.gossip_addr);
                let mut node = node;
                node.state = NodeState::Alive;
                node.last_seen = Some(Instant::now());
                self.members.insert(node.id.clone(), node);
            }
        }
    }

    fn merge_member(&self, new_member: Node) {
        match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {:?}: inc {} -> {}",
                        new_member.id,
                        existing.incarnation,
                        new_member.incarnation,
                    );

                    existing.state = new_member.state;
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{:?} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                if new_member.state == NodeState::Dead {
                    return;
                }
                tracing::info!(
                    "Discovered new member: {:?} at {}",
                    new_member.id,
                    new_member.gossip_addr
                );

                let mut member_with_timestamp = new_member;
                member_with_timestamp.last_seen = Some(Instant::now());

                self.members
                    .insert(member_with_timestamp.id.clone(), member_with_timestamp);
            }
        }
    }

    async fn handle_join(&self, node: Node, cloud_name_hash: u64, src: SocketAddr) -> Result<()> {
        if cloud_name_hash != self.cloud_name_hash {
            tracing::warn!("Rejected join from {} (different cloud name)", src);
            return Ok(());
        }
        tracing::info!("Node {:?} joining cluster at {}", node.id, node.gossip_addr);
        self.observe(node);

        let reply = GossipMessage::Members {
            from: self.local_node.id.clone(),
            members: self.members.iter().map(|e| e.value().clone()).collect(),
        };
        self.send_to(src, &reply).await?;

        tracing::info!("Cluster size now: {}", self.members.len());
        self.maybe_propose().await
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) -> Result<()> {
        if node_id == self.local_node.id {
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                *inc = (*inc).max(incarnation) + 1;
                *inc
            };
            tracing::info!("Refuting suspicion with incarnation {}", my_incarnation);
            self.broadcast_message(GossipMessage::Alive {
                node_id,
                incarnation: my_incarnation,
            })
            .await;
            return Ok(());
        }

        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == NodeState::Alive {
                    tracing::info!("Node {:?} at {} suspected", existing.id, existing.gossip_addr);
                    existing.state = NodeState::Suspect;
                    existing.incarnation = incarnation;
                }
            }
            None => {
                tracing::debug!("Suspected node {:?} doesn't exist", node_id);
            }
        }

        Ok(())
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation > existing.incarnation
                    || (incarnation == existing.incarnation
                        && existing.state == NodeState::Suspect)
                {
                    tracing::info!(
                        "Node {:?} at {} is now Alive (inc={})",
                        existing.id,
                        existing.gossip_addr,
                        incarnation
                    );
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Alive message for unknown node {:?}", node_id);
            }
        }
    }

    /// Starts a new ballot if this node leads its live view and that view
    /// differs from the published cloud (or the cloud is unsettled).
    async fn maybe_propose(&self) -> Result<()> {
        let view = self.live_view();
        let ids: Vec<NodeId> = view.iter().map(|n| n.id.clone()).collect();
        let current = self.cloud.current();

        if current.same_members(&ids) && self.cloud.is_settled() {
            return Ok(());
        }
        if Agreement::leader_of(&ids) != Some(&self.local_node.id) {
            return Ok(());
        }

        let proposal = {
            let mut agreement = self.agreement.lock().await;
            if agreement.is_proposing() {
                return Ok(());
            }
            let version = self
                .max_seen_version
                .load(Ordering::Relaxed)
                .max(current.version())
                + 1;
            agreement.propose(view.clone(), version)
        };

        tracing::info!(
            "Proposing cloud v{} with {} member(s) (round {})",
            proposal.version,
            proposal.members.len(),
            proposal.ballot.round
        );

        for member in &view {
            if member.id == self.local_node.id {
                self.handle_propose(proposal.clone()).await?;
            } else {
                self.send_to(member.gossip_addr, &GossipMessage::Propose(proposal.clone()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_propose(&self, proposal: Proposal) -> Result<()> {
        let view: Vec<NodeId> = self.live_view().into_iter().map(|n| n.id).collect();
        let vote = self.agreement.lock().await.on_propose(&proposal, &view);

        if matches!(vote, Vote::Accept { .. }) {
            tracing::debug!("Accepted ballot {:?}", proposal.ballot);
            self.cloud.unsettle();
        } else {
            tracing::debug!("Rejected ballot {:?}", proposal.ballot);
        }

        if proposal.ballot.proposer == self.local_node.id {
            return self.handle_vote(vote).await;
        }
        match self.get_member(&proposal.ballot.proposer) {
            Some(proposer) => self.send_to(proposer.gossip_addr, &GossipMessage::Vote(vote)).await,
            None => {
                tracing::warn!("Proposal from unknown node {:?}", proposal.ballot.proposer);
                Ok(())
            }
        }
    }

    async fn handle_vote(&self, vote: Vote) -> Result<()> {
        let commit = self.agreement.lock().await.on_vote(vote);
        let Some(commit) = commit else {
            return Ok(());
        };

        tracing::info!("Ballot {:?} accepted by all members", commit.ballot);
        for member in &commit.members {
            if member.id == self.local_node.id {
                continue;
            }
            if let Err(e) = self
                .send_to(member.gossip_addr, &GossipMessage::Commit(commit.clone()))
                .await
            {
                tracing::warn!("Failed to send commit to {:?}: {}", member.id, e);
            }
        }
        self.handle_commit(commit).await;
        Ok(())
    }

    async fn handle_commit(&self, proposal: Proposal) {
        if !self.agreement.lock().await.on_commit(&proposal) {
            tracing::debug!("Ignoring stale commit {:?}", proposal.ballot);
            return;
        }
        if !proposal.members.iter().any(|m| m.id == self.local_node.id) {
            tracing::warn!("Committed cloud v{} does not include this node", proposal.version);
        }
        self.max_seen_version
            .fetch_max(proposal.version, Ordering::Relaxed);
        self.cloud.publish(Cloud::new(proposal.version, proposal.members));
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            self.detect_failures().await;

            if self.agreement.lock().await.expire(AGREEMENT_TIMEOUT) {
                tracing::warn!("Cloud agreement stalled; waiting for a new ballot");
            }
            if let Err(e) = self.maybe_propose().await {
                tracing::warn!("Failed to propose new cloud: {}", e);
            }
        }
    }

    pub(crate) async fn detect_failures(&self) {
        let now = Instant::now();
        let cloud = self.cloud.current();
        let mut messages_to_broadcast = Vec::new();
        let mut forgotten = Vec::new();

        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();

            if member.id == self.local_node.id {
                continue;
            }

            let Some(last_seen) = member.last_seen else {
                member.last_seen = Some(now);
                continue;
            };
            let elapsed = now.duration_since(last_seen);

            match member.state {
                NodeState::Alive => {
                    if elapsed > SUSPECT_TIMEOUT {
                        tracing::warn!(
                            "Node {:?} suspected (no contact for {:?})",
                            member.id,
                            elapsed
                        );
                        member.state = NodeState::Suspect;
                        messages_to_broadcast.push(GossipMessage::Suspect {
                            node_id: member.id.clone(),
                            incarnation: member.incarnation,
                        });
                    }
                }
                NodeState::Suspect => {
                    if elapsed > DEAD_TIMEOUT {
                        tracing::warn!(
                            "Node {:?} declared DEAD (no contact for {:?})",
                            member.id,
                            elapsed
                        );
                        member.state = NodeState::Dead;
                    }
                }
                NodeState::Dead => {
                    if elapsed > DEAD_TIMEOUT + DEAD_RETENTION && !cloud.contains(&member.id) {
                        forgotten.push(member.id.clone());
                    }
                }
            }
        }

        for id in forgotten {
            tracing::debug!("Forgetting dead node {:?}", id);
            self.members.remove(&id);
        }

        for msg in messages_to_broadcast {
            self.broadcast_message(msg).await;
        }
    }

    async fn send_to(&self, addr: SocketAddr, msg: &GossipMessage) -> Result<()> {
        let encoded = bincode::serialize(msg)?;
        self.socket.send_to(&encoded, addr).await?;
        Ok(())
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let Ok(encoded) = bincode::serialize(&msg) else {
            tracing::error!("Failed to serialize gossip message");
            return;
        };
        let targets: Vec<(NodeId, SocketAddr)> = self
            .members
            .iter()
            .filter(|e| e.value().id != self.local_node.id && e.value().state != NodeState::Dead)
            .map(|e| (e.value().id.clone(), e.value().gossip_addr))
            .collect();

        for (id, addr) in targets {
            if let Err(e) = self.socket.send_to(&encoded, addr).await {
                tracing::warn!("Failed to broadcast to {:?}: {}", id, e);
            }
        }
    }
}
