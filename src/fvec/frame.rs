use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::vector::remove_vector;
use crate::error::{ClusterError, Result};
use crate::key::Key;
use crate::storage::codec::type_tags;
use crate::storage::locks::LockMode;
use crate::storage::memory::DistributedStore;

/// Named columns, each a vector. A frame is stored as one plain value and is
/// not partitioned itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    names: Vec<String>,
    vectors: Vec<Key>,
}

crate::bincode_storable!(Frame, type_tags::FRAME, "frame");

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a column, or replaces the vector of an existing one.
    pub fn add(&mut self, name: &str, vector: Key) -> Option<Key> {
        match self.names.iter().position(|n| n == name) {
            Some(i) => Some(std::mem::replace(&mut self.vectors[i], vector)),
            None => {
                self.names.push(name.to_string());
                self.vectors.push(vector);
                None
            }
        }
    }

    pub fn vector(&self, name: &str) -> Option<&Key> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.vectors[i])
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn vectors(&self) -> &[Key] {
        &self.vectors
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub async fn save(&self, store: &DistributedStore, key: &Key) -> Result<u64> {
        store.put_as(key, self).await
    }

    pub async fn load(store: &DistributedStore, key: &Key) -> Result<Self> {
        store
            .get_as::<Frame>(key)
            .await?
            .ok_or_else(|| ClusterError::NotFound(key.clone()))
    }

    /// Read-locks every column so none can be removed while `owner` uses them.
    pub async fn read_lock(&self, store: &DistributedStore, owner: &str) -> Result<()> {
        self.lock_columns(store, owner, LockMode::Read).await
    }

    pub async fn write_lock(&self, store: &DistributedStore, owner: &str) -> Result<()> {
        self.lock_columns(store, owner, LockMode::Write).await
    }

    /// Releases every column, even when some releases fail.
    pub async fn unlock(&self, store: &DistributedStore, owner: &str) -> Result<()> {
        join_all(self.vectors.iter().map(|v| store.unlock(v, owner)))
            .await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// All columns or none: on failure the holds taken here are released.
    async fn lock_columns(&self, store: &DistributedStore, owner: &str, mode: LockMode) -> Result<()> {
        let results = join_all(self.vectors.iter().map(|v| store.lock(v, mode, owner))).await;

        let mut taken = Vec::new();
        let mut failure = None;
        for (vector, result) in self.vectors.iter().zip(results) {
            match result {
                Ok(()) => taken.push(vector),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        let Some(e) = failure else {
            return Ok(());
        };

        for vector in taken {
            if let Err(release) = store.unlock(vector, owner).await {
                tracing::warn!("Failed to release {} for {}: {}", vector, owner, release);
            }
        }
        Err(e)
    }

    /// Deletes every column's vector and chunks, then the frame itself.
    pub async fn remove(store: &DistributedStore, key: &Key) -> Result<()> {
        let frame = Self::load(store, key).await?;
        for vector in &frame.vectors {
            remove_vector(store, vector).await?;
        }
        store.remove(key).await?;
        tracing::info!("Removed frame {} ({} columns)", key, frame.len());
        Ok(())
    }
}
