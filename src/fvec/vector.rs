use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use super::builder::ChunkBuilder;
use super::chunk::{as_exact_integer, Chunk};
use crate::error::{ClusterError, Result};
use crate::key::Key;
use crate::storage::codec::type_tags;
use crate::storage::memory::{DistributedStore, PutOptions};
use crate::storage::value::Value;

/// Vectors at or below this many rows stay in one chunk.
const SMALL_VECTOR_ROWS: usize = 8192;
const MIN_ROWS_PER_CHUNK: usize = 10;
const MAX_ROWS_PER_CHUNK: usize = 1 << 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeHint {
    Integer,
    Real,
}

/// Metadata of a vector, stored under the vector's own key.
///
/// `espc` holds the first global row of every chunk plus the total length as
/// a final entry, so chunk `c` covers rows `espc[c]..espc[c + 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VecMeta {
    pub key: Key,
    pub len: u64,
    pub espc: Vec<u64>,
    pub hint: TypeHint,
}

crate::bincode_storable!(VecMeta, type_tags::VEC_META, "vec-meta");

impl VecMeta {
    pub fn n_chunks(&self) -> u32 {
        self.espc.len().saturating_sub(1) as u32
    }

    pub fn chunk_key(&self, cidx: u32) -> Key {
        Key::chunk(&self.key, cidx)
    }

    pub fn chunk_start(&self, cidx: u32) -> u64 {
        self.espc[cidx as usize]
    }

    pub fn chunk_len(&self, cidx: u32) -> usize {
        (self.espc[cidx as usize + 1] - self.espc[cidx as usize]) as usize
    }

    /// Chunk index and local row holding global `row`.
    pub fn row_to_chunk(&self, row: u64) -> Option<(u32, usize)> {
        if row >= self.len {
            return None;
        }
        let cidx = self.espc.partition_point(|&start| start <= row) - 1;
        Some((cidx as u32, (row - self.espc[cidx]) as usize))
    }

    pub fn chunk_to_row(&self, cidx: u32, local: usize) -> u64 {
        self.chunk_start(cidx) + local as u64
    }
}

/// Rows per chunk for a vector of `total` rows on `cloud_size` nodes with
/// `cores` cores each: a few chunks per core on every node.
pub fn optimal_rows_per_chunk(total: usize, cores: usize, cloud_size: usize) -> usize {
    if total <= SMALL_VECTOR_ROWS {
        return total.max(1);
    }
    let per_node = total.div_ceil(cloud_size.max(1));
    (per_node / (4 * cores.max(1))).clamp(MIN_ROWS_PER_CHUNK, MAX_ROWS_PER_CHUNK)
}

pub async fn load_meta(store: &DistributedStore, key: &Key) -> Result<VecMeta> {
    store
        .get_as::<VecMeta>(key)
        .await?
        .ok_or_else(|| ClusterError::NotFound(key.clone()))
}

/// Fetches chunk `cidx`, faulting it in from its home when it is not local.
pub async fn load_chunk(store: &DistributedStore, meta: &VecMeta, cidx: u32) -> Result<Chunk> {
    let key = meta.chunk_key(cidx);
    let chunk = store
        .get_as::<Chunk>(&key)
        .await?
        .ok_or_else(|| ClusterError::NotFound(key.clone()))?;

    if chunk.len() != meta.chunk_len(cidx) {
        return Err(ClusterError::Codec(format!(
            "{} holds {} rows, metadata says {}",
            key,
            chunk.len(),
            meta.chunk_len(cidx)
        )));
    }
    Ok(chunk)
}

/// Reads one global row.
pub async fn read_row(store: &DistributedStore, meta: &VecMeta, row: u64) -> Result<f64> {
    let (cidx, local) = meta
        .row_to_chunk(row)
        .ok_or_else(|| ClusterError::NotFound(meta.key.clone()))?;
    Ok(load_chunk(store, meta, cidx).await?.at_f64(local))
}

/// Splits `values` into chunks of `rows_per_chunk` rows (the last may be
/// shorter), writes every chunk to its home and then the metadata.
/// NaN entries are stored as missing values.
pub async fn upload_vector(
    store: &DistributedStore,
    values: &[f64],
    rows_per_chunk: usize,
) -> Result<VecMeta> {
    let key = Key::new_vector();
    let rows_per_chunk = rows_per_chunk.max(1);

    let mut espc = vec![0u64];
    let mut puts = Vec::new();
    for (cidx, rows) in values.chunks(rows_per_chunk).enumerate() {
        espc.push(espc[cidx] + rows.len() as u64);
        let chunk = rows.iter().copied().collect::<ChunkBuilder>().build();
        let chunk_key = Key::chunk(&key, cidx as u32);
        let value = Value::encode(&chunk)?;
        puts.push(async move {
            store
                .put_with_options(&chunk_key, value, PutOptions { dont_cache: true })
                .await
        });
    }
    try_join_all(puts).await?;

    let hint = if values
        .iter()
        .all(|v| v.is_nan() || as_exact_integer(*v).is_some())
    {
        TypeHint::Integer
    } else {
        TypeHint::Real
    };
    let meta = VecMeta {
        key: key.clone(),
        len: values.len() as u64,
        espc,
        hint,
    };
    store.put_as(&key, &meta).await?;

    tracing::info!(
        "Uploaded vector {} ({} rows in {} chunks)",
        key,
        meta.len,
        meta.n_chunks()
    );
    Ok(meta)
}

/// Removes a vector's chunks, then its metadata. Fails with `Locked` while
/// the vector is locked.
pub async fn remove_vector(store: &DistributedStore, key: &Key) -> Result<()> {
    let meta = load_meta(store, key).await?;
    store.remove(key).await?;
    try_join_all((0..meta.n_chunks()).map(|cidx| {
        let chunk_key = meta.chunk_key(cidx);
        async move { store.remove(&chunk_key).await }
    }))
    .await?;
    tracing::debug!("Removed vector {}", key);
    Ok(())
}
