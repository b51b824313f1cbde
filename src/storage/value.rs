use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::codec::Storable;
use crate::error::{ClusterError, Result};

/// Where a value's bytes currently live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Inline(Bytes),
    /// Written to the persistence backend and dropped from memory.
    Spilled,
    /// A removed key. Kept so versions never go backwards.
    Tombstone,
}

/// The payload a key resolves to.
///
/// `version` is assigned by the key's home on every accepted write and is
/// strictly increasing per key. Replica sets are tracked by the home's store
/// entry, not by the value itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub type_tag: u16,
    pub version: u64,
    pub payload: Payload,
    pub persisted: bool,
}

impl Value {
    pub fn new(type_tag: u16, bytes: Bytes) -> Self {
        Self {
            type_tag,
            version: 0,
            payload: Payload::Inline(bytes),
            persisted: false,
        }
    }

    pub fn tombstone() -> Self {
        Self {
            type_tag: 0,
            version: 0,
            payload: Payload::Tombstone,
            persisted: false,
        }
    }

    pub fn encode<T: Storable>(item: &T) -> Result<Self> {
        Ok(Self::new(T::TYPE_TAG, item.to_bytes()?))
    }

    /// Decodes the payload as `T`, checking the type tag first.
    pub fn decode<T: Storable>(&self) -> Result<T> {
        if self.type_tag != T::TYPE_TAG {
            return Err(ClusterError::Codec(format!(
                "expected {} (tag {}), found tag {}",
                T::TYPE_NAME,
                T::TYPE_TAG,
                self.type_tag
            )));
        }
        match &self.payload {
            Payload::Inline(bytes) => T::from_bytes(bytes),
            Payload::Spilled => Err(ClusterError::Persist("value is not loaded".into())),
            Payload::Tombstone => Err(ClusterError::Codec("value was removed".into())),
        }
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Inline(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload == Payload::Tombstone
    }

    pub fn is_spilled(&self) -> bool {
        self.payload == Payload::Spilled
    }

    /// Bytes held in memory.
    pub fn mem_size(&self) -> usize {
        self.bytes().map(|b| b.len()).unwrap_or(0)
    }
}
