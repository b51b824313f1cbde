use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::types::{Key, KeyKind};
use crate::membership::cloud::Cloud;
use crate::membership::types::NodeId;

/// Node authoritative for writes to `key` under `cloud`.
///
/// Pure and O(members) with no RPC. An empty cloud (bootstrap) resolves to
/// `local`.
pub fn home_of(key: &Key, cloud: &Cloud, local: &NodeId) -> NodeId {
    if cloud.is_empty() {
        return local.clone();
    }

    match (key.kind(), key.chunk_index(), key.vector_key()) {
        (KeyKind::Chunk, Some(cidx), Some(vector)) => {
            let members = cloud.members();
            let anchor = rendezvous(vector.as_bytes(), cloud);
            let start = cloud.index_of(&anchor).unwrap_or(0);
            let idx = (start + cidx as usize) % members.len();
            members[idx].id.clone()
        }
        _ => rendezvous(key.as_bytes(), cloud),
    }
}

pub fn is_home(key: &Key, cloud: &Cloud, local: &NodeId) -> bool {
    &home_of(key, cloud, local) == local
}

/// Highest-random-weight choice: the member with the largest score wins, ties
/// broken by the smaller id.
fn rendezvous(bytes: &[u8], cloud: &Cloud) -> NodeId {
    let mut best: Option<(u64, &NodeId)> = None;
    for node in cloud.members() {
        let s = score(bytes, &node.id);
        best = match best {
            Some((bs, bid)) if bs > s || (bs == s && bid < &node.id) => Some((bs, bid)),
            _ => Some((s, &node.id)),
        };
    }
    // Callers check for an empty cloud first.
    best.map(|(_, id)| id.clone()).unwrap_or_default()
}

fn score(bytes: &[u8], node: &NodeId) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    node.hash(&mut hasher);
    hasher.finish()
}
