//! Distributed In-Memory Key/Value Cluster Library
//!
//! A cluster of peer nodes that agree on a versioned membership set (the
//! *cloud*), store values coherently at a hash-computed home node, and run
//! fork-join map/reduce tasks next to the columnar data they scan.
//!
//! ## Architecture Modules
//! - **`membership`**: UDP heartbeats, failure detection and cloud agreement.
//!   Publishes immutable, versioned `Cloud` snapshots.
//! - **`key`**: self-describing keys and the pure home-node function.
//! - **`storage`**: the coherent store. Homes apply writes and invalidate every
//!   cached copy before acknowledging; values spill to a persistence backend.
//! - **`rpc`**: envelopes, retrying client, HTTP and in-process transports.
//! - **`executor`**: the fork-join task engine.
//! - **`fvec`**: compressed chunks, vectors and frames.
//! - **`node`**: wires the above into one cluster participant.

pub mod config;
pub mod error;
pub mod executor;
pub mod fvec;
pub mod key;
pub mod membership;
pub mod node;
pub mod rpc;
pub mod storage;

pub use error::{ClusterError, Result};
pub use node::{ClusterNode, LocalCluster};
