//! Row subsets of a vector.
//!
//! A subset stores only a vector of master row numbers. Chunk `c` of a subset
//! has the layout and home of chunk `c` of that rows vector; each of its rows
//! reads the master row it names. Subsets are read-only views.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::builder::ChunkBuilder;
use super::chunk::{Chunk, WriteOutcome};
use super::vector::{load_chunk, load_meta, read_row, remove_vector, upload_vector, VecMeta};
use crate::error::{ClusterError, Result};
use crate::key::Key;
use crate::storage::codec::type_tags;
use crate::storage::memory::DistributedStore;

/// Stored under the subset's own key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsetMeta {
    pub key: Key,
    pub master: Key,
    /// Vector of master row numbers, one per subset row.
    pub rows: Key,
}

crate::bincode_storable!(SubsetMeta, type_tags::SUBSET_META, "subset-meta");

#[derive(Debug, Clone)]
pub struct Subset {
    pub meta: SubsetMeta,
    rows: VecMeta,
    master: VecMeta,
}

impl Subset {
    /// Selects `rows` of `master`, in the given order and with repeats
    /// allowed. Fails with `NotFound` if a row is past the end of `master`.
    pub async fn create(
        store: &DistributedStore,
        master: &VecMeta,
        rows: &[u64],
        rows_per_chunk: usize,
    ) -> Result<Self> {
        if let Some(bad) = rows.iter().find(|&&r| r >= master.len) {
            tracing::warn!("Row {} is outside {} ({} rows)", bad, master.key, master.len);
            return Err(ClusterError::NotFound(master.key.clone()));
        }

        let numbers: Vec<f64> = rows.iter().map(|&r| r as f64).collect();
        let rows_meta = upload_vector(store, &numbers, rows_per_chunk).await?;
        let meta = SubsetMeta {
            key: Key::new_vector(),
            master: master.key.clone(),
            rows: rows_meta.key.clone(),
        };
        store.put_as(&meta.key, &meta).await?;

        tracing::info!("Created subset {} of {} ({} rows)", meta.key, master.key, rows.len());
        Ok(Self {
            meta,
            rows: rows_meta,
            master: master.clone(),
        })
    }

    pub async fn load(store: &DistributedStore, key: &Key) -> Result<Self> {
        let meta = store
            .get_as::<SubsetMeta>(key)
            .await?
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        let rows = load_meta(store, &meta.rows).await?;
        let master = load_meta(store, &meta.master).await?;
        Ok(Self { meta, rows, master })
    }

    pub fn len(&self) -> u64 {
        self.rows.len
    }

    pub fn is_empty(&self) -> bool {
        self.rows.len == 0
    }

    pub fn n_chunks(&self) -> u32 {
        self.rows.n_chunks()
    }

    /// Key whose home holds chunk `cidx` of the row numbers.
    pub fn chunk_key(&self, cidx: u32) -> Key {
        self.rows.chunk_key(cidx)
    }

    /// Chunk `cidx` with every master chunk it reads already fetched.
    pub async fn chunk(&self, store: &DistributedStore, cidx: u32) -> Result<SubsetChunk> {
        let numbers = load_chunk(store, &self.rows, cidx).await?;

        let mut slots: HashMap<u32, usize> = HashMap::new();
        let mut needed = Vec::new();
        let mut picks = Vec::with_capacity(numbers.len());
        for number in numbers.iter() {
            let (master_cidx, local) = self
                .master
                .row_to_chunk(number as u64)
                .ok_or_else(|| ClusterError::NotFound(self.master.key.clone()))?;
            let slot = *slots.entry(master_cidx).or_insert_with(|| {
                needed.push(master_cidx);
                needed.len() - 1
            });
            picks.push((slot, local));
        }

        let masters = try_join_all(needed.iter().map(|&c| load_chunk(store, &self.master, c))).await?;
        Ok(SubsetChunk { masters, picks })
    }

    pub async fn read_row(&self, store: &DistributedStore, row: u64) -> Result<f64> {
        let number = read_row(store, &self.rows, row).await?;
        read_row(store, &self.master, number as u64).await
    }

    /// Removes the subset and its row numbers. The master is left alone.
    pub async fn remove(store: &DistributedStore, key: &Key) -> Result<()> {
        let meta = store
            .get_as::<SubsetMeta>(key)
            .await?
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        remove_vector(store, &meta.rows).await?;
        store.remove(key).await?;
        tracing::debug!("Removed subset {}", key);
        Ok(())
    }
}

/// One chunk of a subset. Reads go through to the master chunks; writes are
/// always rejected.
#[derive(Debug, Clone)]
pub struct SubsetChunk {
    masters: Vec<Chunk>,
    /// Per row: master chunk slot and row within it.
    picks: Vec<(usize, usize)>,
}

impl SubsetChunk {
    pub fn len(&self) -> usize {
        self.picks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.picks.is_empty()
    }

    fn source(&self, row: usize) -> (&Chunk, usize) {
        let (slot, local) = self.picks[row];
        (&self.masters[slot], local)
    }

    pub fn at_f64(&self, row: usize) -> f64 {
        let (chunk, local) = self.source(row);
        chunk.at_f64(local)
    }

    pub fn at_i64(&self, row: usize) -> Option<i64> {
        let (chunk, local) = self.source(row);
        chunk.at_i64(local)
    }

    pub fn is_na(&self, row: usize) -> bool {
        let (chunk, local) = self.source(row);
        chunk.is_na(local)
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.len()).map(move |row| self.at_f64(row))
    }

    pub fn set(&mut self, _row: usize, _v: f64) -> WriteOutcome {
        WriteOutcome::Rejected
    }

    pub fn set_na(&mut self, _row: usize) -> WriteOutcome {
        WriteOutcome::Rejected
    }

    /// Copies the selected rows into a standalone chunk.
    pub fn to_chunk(&self) -> Chunk {
        self.iter().collect::<ChunkBuilder>().build()
    }
}
