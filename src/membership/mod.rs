//! Membership & Cloud Module
//!
//! Tracks which nodes are alive and turns that view into an agreed, versioned
//! *cloud*: the member set every key home, RPC and task is computed against.
//!
//! ## Core Mechanisms
//! - **Heartbeats**: Every node broadcasts a UDP heartbeat carrying its resource
//!   snapshot and the hash of the cloud it currently believes in.
//! - **Failure Detection**: Silent members move "Alive" -> "Suspect" -> "Dead";
//!   incarnation numbers let a node refute a false suspicion.
//! - **Cloud Agreement**: The lowest `NodeId` of the live view proposes the next
//!   member set. Members lock their cloud on accept, and the commit publishes a
//!   new immutable `Cloud` with a strictly higher version.
//! - **Cloud Handle**: Other subsystems read the published cloud through a
//!   `watch` channel and fail with `CloudUnsettled` while agreement is running.

pub mod agreement;
pub mod cloud;
pub mod service;
pub mod types;

pub use cloud::{Cloud, CloudHandle};
pub use types::{Node, NodeId, NodeState};
