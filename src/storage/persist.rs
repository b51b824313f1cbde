//! Backing stores for spilled values.
//!
//! The boundary is read, write, exists, delete and list
//! by `Key`. File formats live above it.

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::key::Key;

pub trait Persist: Send + Sync {
    fn read<'a>(&'a self, key: &'a Key) -> BoxFuture<'a, Result<Option<Bytes>>>;
    fn write<'a>(&'a self, key: &'a Key, bytes: Bytes) -> BoxFuture<'a, Result<()>>;
    fn exists<'a>(&'a self, key: &'a Key) -> BoxFuture<'a, Result<bool>>;
    fn delete<'a>(&'a self, key: &'a Key) -> BoxFuture<'a, Result<()>>;
    fn list(&self) -> BoxFuture<'_, Result<Vec<Key>>>;
}

/// One file per key under `root`, named by the hex of the key bytes.
pub struct DiskPersist {
    root: PathBuf,
}

impl DiskPersist {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        tracing::info!("Spilling values to {}", root.display());
        Ok(Self { root })
    }

    fn path_of(&self, key: &Key) -> PathBuf {
        self.root.join(key.to_hex())
    }
}

impl Persist for DiskPersist {
    fn read<'a>(&'a self, key: &'a Key) -> BoxFuture<'a, Result<Option<Bytes>>> {
        async move {
            match tokio::fs::read(self.path_of(key)).await {
                Ok(data) => Ok(Some(Bytes::from(data))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
        .boxed()
    }

    fn write<'a>(&'a self, key: &'a Key, bytes: Bytes) -> BoxFuture<'a, Result<()>> {
        async move {
            let path = self.path_of(key);
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
            tracing::debug!("Wrote {} bytes for {}", bytes.len(), key);
            Ok(())
        }
        .boxed()
    }

    fn exists<'a>(&'a self, key: &'a Key) -> BoxFuture<'a, Result<bool>> {
        async move { Ok(tokio::fs::try_exists(self.path_of(key)).await?) }.boxed()
    }

    fn delete<'a>(&'a self, key: &'a Key) -> BoxFuture<'a, Result<()>> {
        async move {
            match tokio::fs::remove_file(self.path_of(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
        .boxed()
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Key>>> {
        async move {
            let mut keys = Vec::new();
            let mut dir = tokio::fs::read_dir(&self.root).await?;
            while let Some(entry) = dir.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                match Key::from_hex(name) {
                    Ok(key) => keys.push(key),
                    Err(_) => tracing::debug!("Skipping foreign file {}", name),
                }
            }
            Ok(keys)
        }
        .boxed()
    }
}

#[derive(Default)]
pub struct MemPersist {
    data: DashMap<Key, Bytes>,
}

impl MemPersist {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persist for MemPersist {
    fn read<'a>(&'a self, key: &'a Key) -> BoxFuture<'a, Result<Option<Bytes>>> {
        let found = self.data.get(key).map(|e| e.value().clone());
        async move { Ok(found) }.boxed()
    }

    fn write<'a>(&'a self, key: &'a Key, bytes: Bytes) -> BoxFuture<'a, Result<()>> {
        self.data.insert(key.clone(), bytes);
        async move { Ok(()) }.boxed()
    }

    fn exists<'a>(&'a self, key: &'a Key) -> BoxFuture<'a, Result<bool>> {
        let found = self.data.contains_key(key);
        async move { Ok(found) }.boxed()
    }

    fn delete<'a>(&'a self, key: &'a Key) -> BoxFuture<'a, Result<()>> {
        self.data.remove(key);
        async move { Ok(()) }.boxed()
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Key>>> {
        let keys = self.data.iter().map(|e| e.key().clone()).collect();
        async move { Ok(keys) }.boxed()
    }
}
