use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ClusterError, Result};

const VECTOR_ID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyKind {
    Plain = 0,
    Vector = 1,
    Chunk = 2,
}

impl KeyKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(KeyKind::Plain),
            1 => Some(KeyKind::Vector),
            2 => Some(KeyKind::Chunk),
            _ => None,
        }
    }
}

/// Globally unique object identifier.
///
/// Layouts:
/// - plain:  `[0][utf-8 name]`
/// - vector: `[1][16-byte uuid]`
/// - chunk:  `[2][cidx: u32 BE][16-byte uuid]`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(Bytes);

impl Key {
    pub fn named(name: &str) -> Self {
        let mut buf = BytesMut::with_capacity(1 + name.len());
        buf.put_u8(KeyKind::Plain as u8);
        buf.put_slice(name.as_bytes());
        Key(buf.freeze())
    }

    pub fn new_vector() -> Self {
        Self::vector(Uuid::new_v4())
    }

    pub fn vector(id: Uuid) -> Self {
        let mut buf = BytesMut::with_capacity(1 + VECTOR_ID_LEN);
        buf.put_u8(KeyKind::Vector as u8);
        buf.put_slice(id.as_bytes());
        Key(buf.freeze())
    }

    /// Key of partition `cidx` of `vector`. Accepts either the vector key or
    /// any of its chunk keys.
    pub fn chunk(vector: &Key, cidx: u32) -> Self {
        let mut buf = BytesMut::with_capacity(5 + VECTOR_ID_LEN);
        buf.put_u8(KeyKind::Chunk as u8);
        buf.put_u32(cidx);
        buf.put_slice(vector.vector_id_bytes());
        Key(buf.freeze())
    }

    /// Validates and wraps raw key bytes.
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        let kind = bytes
            .first()
            .and_then(|b| KeyKind::from_byte(*b))
            .ok_or_else(|| ClusterError::Codec("unknown key kind".into()))?;
        let ok = match kind {
            KeyKind::Plain => std::str::from_utf8(&bytes[1..]).is_ok(),
            KeyKind::Vector => bytes.len() == 1 + VECTOR_ID_LEN,
            KeyKind::Chunk => bytes.len() == 5 + VECTOR_ID_LEN,
        };
        if !ok {
            return Err(ClusterError::Codec(format!(
                "malformed {:?} key of {} bytes",
                kind,
                bytes.len()
            )));
        }
        Ok(Key(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn kind(&self) -> KeyKind {
        // Every constructor writes a valid kind byte.
        self.0
            .first()
            .and_then(|b| KeyKind::from_byte(*b))
            .unwrap_or(KeyKind::Plain)
    }

    pub fn chunk_index(&self) -> Option<u32> {
        if self.kind() != KeyKind::Chunk {
            return None;
        }
        let mut idx = [0u8; 4];
        idx.copy_from_slice(&self.0[1..5]);
        Some(u32::from_be_bytes(idx))
    }

    /// The owning vector of a chunk key, the key itself for a vector key.
    pub fn vector_key(&self) -> Option<Key> {
        match self.kind() {
            KeyKind::Plain => None,
            KeyKind::Vector => Some(self.clone()),
            KeyKind::Chunk => {
                let mut buf = BytesMut::with_capacity(1 + VECTOR_ID_LEN);
                buf.put_u8(KeyKind::Vector as u8);
                buf.put_slice(&self.0[5..]);
                Some(Key(buf.freeze()))
            }
        }
    }

    fn vector_id_bytes(&self) -> &[u8] {
        match self.kind() {
            KeyKind::Vector => &self.0[1..],
            KeyKind::Chunk => &self.0[5..],
            KeyKind::Plain => &self.0[1..],
        }
    }

    fn vector_uuid(&self) -> Option<Uuid> {
        Uuid::from_slice(self.vector_id_bytes()).ok()
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() % 2 != 0 {
            return Err(ClusterError::Codec(format!("odd-length key hex: {}", s)));
        }
        let bytes = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|e| ClusterError::Codec(e.to_string()))?;
        Self::from_bytes(Bytes::from(bytes))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            KeyKind::Plain => write!(f, "{}", String::from_utf8_lossy(&self.0[1..])),
            KeyKind::Vector => match self.vector_uuid() {
                Some(id) => write!(f, "$vec:{}", id),
                None => write!(f, "$vec:?"),
            },
            KeyKind::Chunk => match (self.vector_uuid(), self.chunk_index()) {
                (Some(id), Some(cidx)) => write!(f, "$chk:{}#{}", id, cidx),
                _ => write!(f, "$chk:?"),
            },
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::named(name)
    }
}
