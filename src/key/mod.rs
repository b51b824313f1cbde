//! Key & Home-Node Assignment
//!
//! A `Key` is a self-describing byte string. Its first byte names the kind of
//! object it addresses; chunk keys also embed their partition index and parent
//! vector id so a chunk's home can be computed without any lookup.
//!
//! Home assignment is a pure function of the key bytes and a `Cloud` snapshot:
//! - plain and vector keys use rendezvous hashing, so a membership change only
//!   moves the keys owned by the nodes that joined or left;
//! - chunk keys are laid out round-robin starting at their vector's home, which
//!   spreads a vector's partitions evenly over the cloud.

pub mod home;
pub mod types;

pub use home::{home_of, is_home};
pub use types::{Key, KeyKind};

#[cfg(test)]
mod tests;
