use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::agreement::{Proposal, Vote};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

/// Point-in-time resources of a node, refreshed on every heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceSnapshot {
    pub cpus: u32,
    pub total_memory: u64,
    pub free_memory: u64,
    pub total_disk: u64,
    pub free_disk: u64,
    /// Number of keys held locally, homed or cached.
    pub keys: u64,
}

impl ResourceSnapshot {
    pub fn capture(keys: u64) -> Self {
        use sysinfo::{Disks, System};

        let mut sys = System::new();
        sys.refresh_memory();

        let disks = Disks::new_with_refreshed_list();
        let (total_disk, free_disk) = disks.list().iter().fold((0u64, 0u64), |acc, d| {
            (acc.0 + d.total_space(), acc.1 + d.available_space())
        });

        Self {
            cpus: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            total_memory: sys.total_memory(),
            free_memory: sys.available_memory(),
            total_disk,
            free_disk,
            keys,
        }
    }
}

/// Represents a single member in the cluster.
///
/// Contains identity, network addressing, process identity and the last
/// resource snapshot it reported. The `incarnation` field is a logical clock
/// used to refute a false "Suspect" claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,
    pub pid: u32,
    pub boot_ms: u64,
    pub resources: ResourceSnapshot,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Node {
    /// Builds the local node record. The RPC port sits 1000 above the gossip port.
    pub fn local(id: NodeId, gossip_addr: SocketAddr) -> Self {
        let http_addr = SocketAddr::new(gossip_addr.ip(), gossip_addr.port().wrapping_add(1000));
        Self {
            id,
            gossip_addr,
            http_addr,
            state: NodeState::Alive,
            incarnation: 1,
            pid: std::process::id(),
            boot_ms: now_ms(),
            resources: ResourceSnapshot::default(),
            last_seen: Some(Instant::now()),
        }
    }
}

/// Health report broadcast by every node on each heartbeat tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartBeat {
    pub node: Node,
    /// Heartbeats from a differently named cloud are ignored.
    pub cloud_name_hash: u64,
    pub cloud_hash: u64,
    pub cloud_version: u64,
    pub settled: bool,
}

/// The datagram protocol for inter-node control traffic.
///
/// - `Heartbeat`: liveness plus the sender's view of the active cloud.
/// - `Join`/`Members`: entry via a seed node and member-table gossip.
/// - `Suspect`/`Alive`: disseminate changes in node health.
/// - `Propose`/`Vote`/`Commit`: agreement on the next cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Heartbeat(HeartBeat),

    Join {
        node: Node,
        cloud_name_hash: u64,
    },

    Members {
        from: NodeId,
        members: Vec<Node>,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },

    Propose(Proposal),

    Vote(Vote),

    Commit(Proposal),
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
