use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::codec::{Storable, TypeRegistry};
use super::locks::{LockMode, LockTable};
use super::persist::Persist;
use super::value::{Payload, Value};
use crate::error::{ClusterError, Result};
use crate::key::{home_of, Key};
use crate::membership::cloud::{Cloud, CloudHandle};
use crate::membership::types::NodeId;
use crate::rpc::client::{Admission, RpcClient, SequenceTracker};
use crate::rpc::protocol::{Priority, RpcRequest, RpcResponse};

/// A fetch that keeps racing with invalidations gives up after this many tries.
const FETCH_ATTEMPTS: usize = 5;
const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub invalidate_timeout: Duration,
    /// Bytes of inline payload the store tries to stay under.
    pub memory_budget: usize,
    /// Longest an RPC can stay in flight; ordering state older than this is dropped.
    pub ordering_horizon: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            invalidate_timeout: Duration::from_secs(5),
            memory_budget: 512 * 1024 * 1024,
            ordering_horizon: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Do not keep a cached copy on the writer after the home acknowledges.
    pub dont_cache: bool,
}

/// A home-side write, applied under the key's entry lock.
#[derive(Debug, Clone)]
pub enum Write {
    Put(Value),
    Cas { expected_version: u64, value: Value },
    Remove,
}

/// Lowest version a fetched copy may have to be cached.
struct Floor {
    version: u64,
    at: Instant,
}

struct Entry {
    value: Value,
    /// True when this node is the key's home and `value` is authoritative.
    home: bool,
    /// Nodes holding a cached copy (home entries only).
    replicas: HashSet<NodeId>,
}

/// Coherent per-node key/value store.
///
/// Acts as the authority for keys homed here and as a cache for everything
/// else. Writes are always applied by the home, which invalidates every
/// cached copy before acknowledging.
pub struct DistributedStore {
    local: NodeId,
    cloud: Arc<CloudHandle>,
    rpc: Arc<RpcClient>,
    persist: Arc<dyn Persist>,
    types: Arc<TypeRegistry>,
    entries: DashMap<Key, Entry>,
    /// Highest version this node was told about or returned, per key.
    observed: DashMap<Key, Floor>,
    locks: LockTable,
    seqs: SequenceTracker,
    config: StoreConfig,
}

impl DistributedStore {
    pub fn new(
        cloud: Arc<CloudHandle>,
        rpc: Arc<RpcClient>,
        persist: Arc<dyn Persist>,
        types: Arc<TypeRegistry>,
        config: StoreConfig,
    ) -> Self {
        Self {
            local: cloud.local_id().clone(),
            cloud,
            rpc,
            persist,
            types,
            entries: DashMap::new(),
            observed: DashMap::new(),
            locks: LockTable::new(),
            seqs: SequenceTracker::new(),
            config,
        }
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    fn home(&self, key: &Key, cloud: &Cloud) -> NodeId {
        home_of(key, cloud, &self.local)
    }

    // ============================================================
    // CLIENT OPERATIONS
    // ============================================================

    /// Reads `key`. Remote keys are served from the local cache when present,
    /// otherwise fetched from their home and cached. Removed keys read as `None`.
    pub async fn get(&self, key: &Key) -> Result<Option<Value>> {
        let cloud = self.cloud.current();
        let home = self.home(key, &cloud);

        if home == self.local {
            return Ok(self.load_home(key).await?.filter(|v| !v.is_tombstone()));
        }

        if let Some(cached) = self.cached(key) {
            tracing::trace!("GET {}: cache hit v{}", key, cached.version);
            return Ok(Some(cached).filter(|v| !v.is_tombstone()));
        }

        for attempt in 0..FETCH_ATTEMPTS {
            let response = self
                .rpc
                .call(
                    &cloud,
                    &home,
                    Priority::for_key(key),
                    RpcRequest::Fetch { key: key.clone() },
                )
                .await?;

            let value = match response {
                RpcResponse::Value(value) => value,
                other => return Err(unexpected(other)),
            };
            let Some(value) = value else {
                return Ok(None);
            };

            if self.cache(key, value.clone()) {
                self.observe(key, value.version);
                tracing::debug!("GET {}: fetched v{} from {:?}", key, value.version, home);
                return Ok(Some(value).filter(|v| !v.is_tombstone()));
            }
            tracing::debug!(
                "GET {}: fetched v{} is older than an invalidation (attempt {})",
                key,
                value.version,
                attempt + 1
            );
        }

        Err(ClusterError::Transport(format!(
            "{} kept resolving to stale versions",
            key
        )))
    }

    pub async fn get_as<T: Storable>(&self, key: &Key) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(value.decode()?)),
            None => Ok(None),
        }
    }

    /// Writes `value` at its home. Returns the version the home assigned.
    pub async fn put(&self, key: &Key, value: Value) -> Result<u64> {
        self.put_with_options(key, value, PutOptions::default())
            .await
    }

    pub async fn put_as<T: Storable>(&self, key: &Key, item: &T) -> Result<u64> {
        self.put(key, Value::encode(item)?).await
    }

    pub async fn put_with_options(
        &self,
        key: &Key,
        value: Value,
        options: PutOptions,
    ) -> Result<u64> {
        let request = RpcRequest::Put {
            key: key.clone(),
            value: value.clone(),
            dont_cache: options.dont_cache,
        };
        self.write(key, Write::Put(value), request, options.dont_cache)
            .await
    }

    /// Replaces `key` only if its current version is `expected_version`
    /// (0 for a key that was never written). A mismatch is reported as
    /// `CasConflict` carrying the current version; it is never retried here.
    pub async fn compare_and_swap(
        &self,
        key: &Key,
        expected_version: u64,
        value: Value,
    ) -> Result<u64> {
        let request = RpcRequest::Cas {
            key: key.clone(),
            expected_version,
            value: value.clone(),
        };
        self.write(
            key,
            Write::Cas {
                expected_version,
                value,
            },
            request,
            false,
        )
        .await
    }

    /// Removes `key` by writing a tombstone. Fails with `Locked` while any
    /// advisory lock is held on it.
    pub async fn remove(&self, key: &Key) -> Result<u64> {
        let request = RpcRequest::Remove { key: key.clone() };
        self.write(key, Write::Remove, request, true).await
    }

    async fn write(
        &self,
        key: &Key,
        write: Write,
        request: RpcRequest,
        dont_cache: bool,
    ) -> Result<u64> {
        let cloud = self.cloud.require_settled()?;
        let home = self.home(key, &cloud);

        if home == self.local {
            return self
                .apply_write(&cloud, &self.local, None, key, write, dont_cache)
                .await;
        }

        let response = self
            .rpc
            .call(&cloud, &home, Priority::for_key(key), request)
            .await?;
        let version = match response {
            RpcResponse::Ack { version } => version,
            other => return Err(unexpected(other)),
        };

        let written = match write {
            Write::Put(value) | Write::Cas { value, .. } if !dont_cache => Some(value),
            _ => None,
        };
        match written {
            Some(mut value) => {
                value.version = version;
                self.cache(key, value);
            }
            None => {
                self.entries.remove_if(key, |_, e| !e.home);
            }
        }
        self.observe(key, version);
        Ok(version)
    }

    /// Drops cached copies of `key`. On the home this flushes every replica.
    pub async fn invalidate(&self, key: &Key) -> Result<()> {
        let cloud = self.cloud.current();
        if self.home(key, &cloud) != self.local {
            self.entries.remove_if(key, |_, e| !e.home);
            return Ok(());
        }

        let (version, replicas) = match self.entries.get_mut(key) {
            Some(mut entry) => (
                entry.value.version,
                std::mem::take(&mut entry.replicas),
            ),
            None => return Ok(()),
        };
        self.invalidate_replicas(&cloud, key, version, replicas)
            .await
    }

    pub async fn read_lock(&self, key: &Key, owner: &str) -> Result<()> {
        self.lock(key, LockMode::Read, owner).await
    }

    pub async fn write_lock(&self, key: &Key, owner: &str) -> Result<()> {
        self.lock(key, LockMode::Write, owner).await
    }

    pub async fn lock(&self, key: &Key, mode: LockMode, owner: &str) -> Result<()> {
        let cloud = self.cloud.current();
        let home = self.home(key, &cloud);
        if home == self.local {
            return self.locks.acquire(key, mode, owner);
        }
        let request = RpcRequest::Lock {
            key: key.clone(),
            mode,
            owner: owner.to_string(),
        };
        self.rpc
            .dinvoke(&cloud, &home, Priority::Control, request)
            .await
    }

    pub async fn unlock(&self, key: &Key, owner: &str) -> Result<()> {
        let cloud = self.cloud.current();
        let home = self.home(key, &cloud);
        if home == self.local {
            self.locks.release(key, owner);
            return Ok(());
        }
        let request = RpcRequest::Unlock {
            key: key.clone(),
            owner: owner.to_string(),
        };
        self.rpc
            .dinvoke(&cloud, &home, Priority::Control, request)
            .await
    }

    // ============================================================
    // HOME-SIDE OPERATIONS (local or on behalf of a remote caller)
    // ============================================================

    /// Applies a write as the key's home: one CAS step on the entry, then a
    /// synchronous invalidation of every other cached copy.
    ///
    /// `seq` orders writes from a remote sender. A write sent before the last
    /// one applied from that sender for this key fails with `Superseded`; a
    /// resend of the last applied write is acknowledged with the version it
    /// produced and applied only once.
    pub async fn apply_write(
        &self,
        cloud: &Cloud,
        from: &NodeId,
        seq: Option<u64>,
        key: &Key,
        write: Write,
        dont_cache: bool,
    ) -> Result<u64> {
        if let Write::Put(value) | Write::Cas { value, .. } = &write {
            self.types.check(value.type_tag)?;
        }
        if let Write::Remove = write {
            if let Some(holder) = self.locks.holder(key) {
                return Err(ClusterError::Locked {
                    key: key.clone(),
                    holder,
                });
            }
        }

        let floor = cloud.version() << 32;
        let (version, stale_replicas, was_persisted) = {
            let mut slot = self.entries.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::tombstone(),
                home: true,
                replicas: HashSet::new(),
            });
            let entry = slot.value_mut();
            let current = entry.value.version;

            if let Some(seq) = seq {
                match self.seqs.check(from, key, seq) {
                    Admission::Fresh => {}
                    Admission::Repeat(version) => {
                        tracing::debug!("Write {} to {} from {:?} already applied", seq, key, from);
                        return Ok(version);
                    }
                    Admission::Stale => {
                        tracing::debug!("Dropping out-of-order write to {} from {:?}", key, from);
                        return Err(ClusterError::Superseded {
                            key: key.clone(),
                            current,
                        });
                    }
                }
            }

            let mut next = match write {
                Write::Put(value) => value,
                Write::Cas {
                    expected_version,
                    value,
                } => {
                    if expected_version != current {
                        return Err(ClusterError::CasConflict {
                            key: key.clone(),
                            current,
                        });
                    }
                    value
                }
                Write::Remove => Value::tombstone(),
            };

            next.version = (current + 1).max(floor);
            next.persisted = false;
            if let Some(seq) = seq {
                self.seqs.record(from, key, seq, next.version);
            }
            let was_persisted = entry.value.persisted;
            entry.value = next;
            entry.home = true;

            let mut replicas = std::mem::take(&mut entry.replicas);
            replicas.remove(&self.local);
            replicas.remove(from);
            if from != &self.local && !dont_cache {
                entry.replicas.insert(from.clone());
            }
            (entry.value.version, replicas, was_persisted)
        };

        if was_persisted {
            if let Err(e) = self.persist.delete(key).await {
                tracing::warn!("Failed to drop spilled copy of {}: {}", key, e);
            }
        }

        self.invalidate_replicas(cloud, key, version, stale_replicas)
            .await?;
        tracing::debug!("PUT {}: v{} acknowledged", key, version);
        Ok(version)
    }

    /// Serves a fetch as home, registering `from` as a replica holder in the
    /// same step that reads the value.
    pub async fn serve_fetch(&self, from: &NodeId, key: &Key) -> Result<Option<Value>> {
        for _ in 0..FETCH_ATTEMPTS {
            if self.load_home(key).await?.is_none() {
                return Ok(None);
            }
            if let Some(mut entry) = self.entries.get_mut(key) {
                if entry.value.is_spilled() {
                    continue;
                }
                if from != &self.local {
                    entry.replicas.insert(from.clone());
                }
                return Ok(Some(entry.value.clone()));
            }
        }
        Err(ClusterError::Persist(format!("{} could not be kept in memory", key)))
    }

    /// Applies an invalidation from `key`'s home: cached copies at or below
    /// `version` are dropped and older fetches are refused from now on.
    pub fn apply_invalidate(&self, from: &NodeId, seq: u64, key: &Key, version: u64) {
        match self.entries.entry(key.clone()) {
            MapEntry::Occupied(slot) => {
                if self.seqs.check(from, key, seq) != Admission::Fresh {
                    return;
                }
                self.seqs.record(from, key, seq, version);
                self.observe(key, version);
                let entry = slot.get();
                if !entry.home && entry.value.version <= version {
                    slot.remove();
                    tracing::debug!("Invalidated cached {} (<= v{})", key, version);
                }
            }
            MapEntry::Vacant(_) => {
                if self.seqs.check(from, key, seq) == Admission::Fresh {
                    self.seqs.record(from, key, seq, version);
                    self.observe(key, version);
                }
            }
        }
    }

    pub fn apply_lock(&self, key: &Key, mode: LockMode, owner: &str) -> Result<()> {
        self.locks.acquire(key, mode, owner)
    }

    pub fn apply_unlock(&self, key: &Key, owner: &str) {
        self.locks.release(key, owner);
    }

    async fn invalidate_replicas(
        &self,
        cloud: &Cloud,
        key: &Key,
        version: u64,
        replicas: HashSet<NodeId>,
    ) -> Result<()> {
        let targets: Vec<NodeId> = replicas
            .into_iter()
            .filter(|node| {
                let live = cloud.contains(node);
                if !live {
                    tracing::debug!("Skipping invalidation of {} on departed {:?}", key, node);
                }
                live
            })
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        let calls = targets.iter().map(|node| {
            self.rpc.dinvoke(
                cloud,
                node,
                Priority::Control,
                RpcRequest::Invalidate {
                    key: key.clone(),
                    version,
                },
            )
        });

        match tokio::time::timeout(self.config.invalidate_timeout, try_join_all(calls)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!("Invalidation of {} v{} failed: {}", key, version, e);
                Err(ClusterError::InvalidationTimeout { key: key.clone() })
            }
            Err(_) => {
                tracing::error!(
                    "Invalidation of {} v{} did not finish within {:?}",
                    key,
                    version,
                    self.config.invalidate_timeout
                );
                Err(ClusterError::InvalidationTimeout { key: key.clone() })
            }
        }
    }

    // ============================================================
    // LOCAL STATE
    // ============================================================

    /// The home copy of `key`, faulted back in from the persistence backend
    /// if it was spilled.
    async fn load_home(&self, key: &Key) -> Result<Option<Value>> {
        let snapshot = self
            .entries
            .get(key)
            .filter(|e| e.home)
            .map(|e| e.value.clone());
        let Some(value) = snapshot else {
            return Ok(None);
        };
        if !value.is_spilled() {
            return Ok(Some(value));
        }

        let bytes = self
            .persist
            .read(key)
            .await?
            .ok_or_else(|| ClusterError::Persist(format!("spilled copy of {} is gone", key)))?;
        tracing::debug!("Faulted {} back in ({} bytes)", key, bytes.len());

        let mut restored = value;
        restored.payload = Payload::Inline(bytes);
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.value.version == restored.version && entry.value.is_spilled() {
                entry.value = restored.clone();
            }
        }
        Ok(Some(restored))
    }

    fn cached(&self, key: &Key) -> Option<Value> {
        self.entries
            .get(key)
            .filter(|e| !e.home)
            .map(|e| e.value.clone())
    }

    /// Stores a fetched copy unless an invalidation already superseded it.
    /// Returns false if `value` is older than what this node was told about.
    fn cache(&self, key: &Key, value: Value) -> bool {
        match self.entries.entry(key.clone()) {
            MapEntry::Occupied(mut slot) => {
                let floor = self.observed_version(key);
                if value.version < floor {
                    return false;
                }
                let entry = slot.get_mut();
                if !entry.home && entry.value.version <= value.version {
                    entry.value = value;
                }
                true
            }
            MapEntry::Vacant(slot) => {
                let floor = self.observed_version(key);
                if value.version < floor {
                    return false;
                }
                slot.insert(Entry {
                    value,
                    home: false,
                    replicas: HashSet::new(),
                });
                true
            }
        }
    }

    fn observe(&self, key: &Key, version: u64) {
        let mut floor = self.observed.entry(key.clone()).or_insert(Floor {
            version: 0,
            at: Instant::now(),
        });
        floor.version = floor.version.max(version);
        floor.at = Instant::now();
    }

    fn observed_version(&self, key: &Key) -> u64 {
        self.observed.get(key).map(|f| f.version).unwrap_or(0)
    }

    /// Entry held locally, home or cached, without any RPC.
    pub fn get_local(&self, key: &Key) -> Option<Value> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn is_cached(&self, key: &Key) -> bool {
        self.entries.get(key).map(|e| !e.home).unwrap_or(false)
    }

    pub fn replicas_of(&self, key: &Key) -> Vec<NodeId> {
        self.entries
            .get(key)
            .map(|e| e.replicas.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn local_key_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.value().value.is_tombstone())
            .count()
    }

    pub fn memory_used(&self) -> usize {
        self.entries.iter().map(|e| e.value().value.mem_size()).sum()
    }

    /// Fetch floors plus per-sender sequence records currently held.
    pub fn ordering_entries(&self) -> usize {
        self.observed.len() + self.seqs.len()
    }

    /// Forgets ordering state no in-flight message can still need: fetch
    /// floors and sequence records older than `horizon`, and sequence records
    /// of senders that left the cloud. A fetch or write older than `horizon`
    /// has already timed out at its sender.
    pub fn prune_ordering(&self, horizon: Duration) {
        let cloud = self.cloud.current();
        self.seqs.prune(&cloud, horizon);
        self.observed.retain(|_, floor| floor.at.elapsed() < horizon);
    }

    // ============================================================
    // MEMORY MANAGEMENT
    // ============================================================

    /// Drops cached (non-home) copies until `target` bytes are freed. The
    /// homes are not told; they will send a harmless invalidation later.
    pub fn evict_cached(&self, target: usize) -> usize {
        let mut candidates: Vec<(Key, usize)> = self
            .entries
            .iter()
            .filter(|e| !e.value().home)
            .map(|e| (e.key().clone(), e.value().value.mem_size()))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let mut freed = 0;
        for (key, size) in candidates {
            if freed >= target {
                break;
            }
            if self.entries.remove_if(&key, |_, e| !e.home).is_some() {
                freed += size;
            }
        }
        freed
    }

    /// Writes home-owned payloads to the persistence backend and releases
    /// their memory until `target` bytes are freed.
    pub async fn spill(&self, target: usize) -> Result<usize> {
        let mut candidates: Vec<(Key, Value)> = self
            .entries
            .iter()
            .filter(|e| e.value().home && e.value().value.bytes().is_some())
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect();
        candidates.sort_by(|a, b| b.1.mem_size().cmp(&a.1.mem_size()));

        let mut freed = 0;
        for (key, value) in candidates {
            if freed >= target {
                break;
            }
            let Some(bytes) = value.bytes().cloned() else {
                continue;
            };
            self.persist.write(&key, bytes.clone()).await?;

            if let Some(mut entry) = self.entries.get_mut(&key) {
                if entry.value.version == value.version && !entry.value.is_spilled() {
                    entry.value.payload = Payload::Spilled;
                    entry.value.persisted = true;
                    freed += bytes.len();
                }
            }
        }
        if freed > 0 {
            tracing::info!("Spilled {} bytes to the persistence backend", freed);
        }
        Ok(freed)
    }

    /// Brings inline memory back under budget: cached copies go first.
    pub async fn enforce_budget(&self) -> Result<()> {
        let used = self.memory_used();
        if used <= self.config.memory_budget {
            return Ok(());
        }
        let mut excess = used - self.config.memory_budget;
        let evicted = self.evict_cached(excess);
        tracing::debug!("Evicted {} cached bytes", evicted);
        excess = excess.saturating_sub(evicted);
        if excess > 0 {
            self.spill(excess).await?;
        }
        Ok(())
    }

    pub fn start_memory_manager(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MEMORY_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = self.enforce_budget().await {
                    tracing::warn!("Memory manager failed: {}", e);
                }
                self.prune_ordering(self.config.ordering_horizon);
            }
        });
    }
}

fn unexpected(response: RpcResponse) -> ClusterError {
    ClusterError::Codec(format!("unexpected RPC response: {:?}", response))
}
