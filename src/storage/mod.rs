//! Distributed Store Module
//!
//! A per-node map from `Key` to `Value` that is the authority for keys homed
//! on this node and a coherent cache for everything else.
//!
//! ## Core Concepts
//! - **Home writes**: `put`, `compare_and_swap` and `remove` always execute on
//!   the key's home. A remote caller's write becomes an RPC to the home.
//! - **Invalidation**: the home bumps the key's version under the entry lock,
//!   then synchronously invalidates every replica holder before acknowledging.
//! - **Monotonic reads**: a node never caches or returns a version older than
//!   one it has already seen or been told about.
//! - **Memory pressure**: cached copies are evicted first; home values are
//!   spilled to a `Persist` backend and faulted back in on the next read.
//! - **Typed payloads**: values carry a type tag checked against a registry.

pub mod codec;
pub mod locks;
pub mod memory;
pub mod persist;
pub mod value;

pub use codec::{Storable, TypeRegistry};
pub use locks::LockMode;
pub use memory::{DistributedStore, PutOptions, StoreConfig, Write};
pub use persist::{DiskPersist, MemPersist, Persist};
pub use value::{Payload, Value};
