//! RPC Layer
//!
//! Request/response messaging between cloud members.
//!
//! ## Channels
//! - **Control**: store metadata, invalidations, locks and task cancellation.
//!   Small, latency-sensitive, served from its own client pool.
//! - **Bulk**: chunk transfer and task dispatch.
//!
//! Every outbound call is stamped with the caller's cloud version and a
//! per-sender sequence number. Transport failures are retried with backoff;
//! calls to nodes outside the caller's cloud fail immediately. Receivers drop
//! put/invalidate messages that arrive out of send order for the same key.

pub mod client;
pub mod handlers;
pub mod protocol;
pub mod transport;

pub use client::{Admission, RpcClient, SequenceTracker};
pub use protocol::{Envelope, Priority, RpcRequest, RpcResponse};
pub use transport::{HttpTransport, LocalTransport, RpcHandler, Transport};
