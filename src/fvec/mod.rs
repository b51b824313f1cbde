//! Columnar Storage Module
//!
//! Vectors are logical 1-D arrays of doubles split into row-range chunks.
//! Each chunk is an ordinary store value keyed by `(vector id, chunk index)`,
//! so it lives on the home that key hashes to and tasks can run next to it.
//!
//! ## Submodules
//! - **`chunk`**: compressed chunk representation with uniform accessors.
//! - **`builder`**: picks the smallest compression scheme for a run of values.
//! - **`vector`**: vector metadata, row/chunk translation, upload and removal.
//! - **`frame`**: named collections of vectors.
//! - **`subset`**: read-only row selections of a vector.

pub mod builder;
pub mod chunk;
pub mod frame;
pub mod subset;
pub mod vector;

pub use builder::ChunkBuilder;
pub use chunk::{Chunk, Scheme, WriteOutcome};
pub use frame::Frame;
pub use subset::{Subset, SubsetChunk};
pub use vector::{optimal_rows_per_chunk, upload_vector, VecMeta};

#[cfg(test)]
mod tests;
