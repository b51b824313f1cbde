//! Explicit type tags for stored payloads.
//!
//! Every type that can live in the store implements `Storable`, which fixes a
//! small integer tag and an encode/decode pair. Homes refuse values whose tag
//! is not in their `TypeRegistry`.

use bytes::Bytes;
use dashmap::DashMap;

use crate::error::{ClusterError, Result};

pub mod type_tags {
    pub const BYTES: u16 = 1;
    pub const STRING: u16 = 2;
    pub const CHUNK: u16 = 16;
    pub const VEC_META: u16 = 17;
    pub const FRAME: u16 = 18;
    pub const SUBSET_META: u16 = 19;
    /// First tag available to application types.
    pub const USER_BASE: u16 = 256;
}

pub trait Storable: Sized + Send + Sync + 'static {
    const TYPE_TAG: u16;
    const TYPE_NAME: &'static str;

    fn to_bytes(&self) -> Result<Bytes>;
    fn from_bytes(bytes: &Bytes) -> Result<Self>;
}

/// Implements `Storable` through bincode for a serde type.
#[macro_export]
macro_rules! bincode_storable {
    ($ty:ty, $tag:expr, $name:expr) => {
        impl $crate::storage::codec::Storable for $ty {
            const TYPE_TAG: u16 = $tag;
            const TYPE_NAME: &'static str = $name;

            fn to_bytes(&self) -> $crate::error::Result<bytes::Bytes> {
                Ok(bytes::Bytes::from(bincode::serialize(self)?))
            }

            fn from_bytes(bytes: &bytes::Bytes) -> $crate::error::Result<Self> {
                Ok(bincode::deserialize(bytes)?)
            }
        }
    };
}

impl Storable for Bytes {
    const TYPE_TAG: u16 = type_tags::BYTES;
    const TYPE_NAME: &'static str = "bytes";

    fn to_bytes(&self) -> Result<Bytes> {
        Ok(self.clone())
    }

    fn from_bytes(bytes: &Bytes) -> Result<Self> {
        Ok(bytes.clone())
    }
}

impl Storable for String {
    const TYPE_TAG: u16 = type_tags::STRING;
    const TYPE_NAME: &'static str = "string";

    fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(self.clone().into_bytes()))
    }

    fn from_bytes(bytes: &Bytes) -> Result<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|e| ClusterError::Codec(e.to_string()))
    }
}

pub struct TypeRegistry {
    types: DashMap<u16, &'static str>,
}

impl TypeRegistry {
    /// Registry with the built-in store and columnar types.
    pub fn new() -> Self {
        let registry = Self {
            types: DashMap::new(),
        };
        registry.register::<Bytes>();
        registry.register::<String>();
        registry.register::<crate::fvec::chunk::Chunk>();
        registry.register::<crate::fvec::vector::VecMeta>();
        registry.register::<crate::fvec::frame::Frame>();
        registry.register::<crate::fvec::subset::SubsetMeta>();
        registry
    }

    pub fn register<T: Storable>(&self) {
        if let Some(existing) = self.types.insert(T::TYPE_TAG, T::TYPE_NAME) {
            if existing != T::TYPE_NAME {
                tracing::warn!(
                    "Type tag {} re-registered: {} -> {}",
                    T::TYPE_TAG,
                    existing,
                    T::TYPE_NAME
                );
            }
        }
    }

    pub fn name_of(&self, tag: u16) -> Option<&'static str> {
        self.types.get(&tag).map(|e| *e.value())
    }

    pub fn check(&self, tag: u16) -> Result<()> {
        if self.types.contains_key(&tag) {
            Ok(())
        } else {
            Err(ClusterError::Codec(format!("unregistered type tag {}", tag)))
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
