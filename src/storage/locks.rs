use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ClusterError, Result};
use crate::key::Key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct LockState {
    readers: HashMap<String, u32>,
    writer: Option<String>,
}

impl LockState {
    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }

    fn holder(&self) -> Option<String> {
        self.writer
            .clone()
            .or_else(|| self.readers.keys().next().cloned())
    }
}

/// Advisory read/write locks, held at a key's home. Read locks are
/// re-entrant per owner; an owner holding the only read lock may upgrade.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<Key, LockState>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &Key, mode: LockMode, owner: &str) -> Result<()> {
        let mut state = self.locks.entry(key.clone()).or_default();

        if let Some(writer) = &state.writer {
            if writer != owner {
                return Err(ClusterError::Locked {
                    key: key.clone(),
                    holder: writer.clone(),
                });
            }
        }

        match mode {
            LockMode::Read => {
                *state.readers.entry(owner.to_string()).or_insert(0) += 1;
            }
            LockMode::Write => {
                if let Some(other) = state.readers.keys().find(|r| r.as_str() != owner) {
                    return Err(ClusterError::Locked {
                        key: key.clone(),
                        holder: other.clone(),
                    });
                }
                state.writer = Some(owner.to_string());
            }
        }
        tracing::debug!("{:?} lock on {} taken by {}", mode, key, owner);
        Ok(())
    }

    /// Releases one hold of `owner` on `key`. Returns false if it held none.
    pub fn release(&self, key: &Key, owner: &str) -> bool {
        let released = match self.locks.get_mut(key) {
            Some(mut state) => {
                if state.writer.as_deref() == Some(owner) {
                    state.writer = None;
                    true
                } else if let Some(count) = state.readers.get_mut(owner) {
                    *count -= 1;
                    if *count == 0 {
                        state.readers.remove(owner);
                    }
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        self.locks.remove_if(key, |_, state| state.is_free());
        released
    }

    pub fn holder(&self, key: &Key) -> Option<String> {
        self.locks.get(key).and_then(|state| state.holder())
    }
}
