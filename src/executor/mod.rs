//! Distributed Task Engine Module
//!
//! Runs fork-join computations over partitioned vectors, shipping work to the
//! nodes that hold the data instead of moving the data.
//!
//! ## Architecture Overview
//! 1. **Submission**: a `MapReduce` prototype and the vectors it scans are
//!    submitted on any node, which becomes the task's root.
//! 2. **Fork tree**: partitions `[0, n)` split in halves down to single
//!    partitions. The shape depends only on `n`.
//! 3. **Dispatch**: maximal subtrees homed on one remote node go to that node
//!    as a single sub-task; it runs them and returns one partial per subtree.
//! 4. **Reduce**: partials fold pairwise in tree order, so results do not
//!    depend on which leaf finished first.
//!
//! Work is never resubmitted: a lost node fails the task with `NodeLost`.
//!
//! ## Submodules
//! - **`types`**: task ids, states, the `MapReduce` trait and wire requests.
//! - **`fork`**: fork-tree shape, home-homogeneous cover and reassembly.
//! - **`executor`**: the `TaskEngine` and `TaskHandle`.
//! - **`registry`**: maps task names to runners for remote execution.

pub mod executor;
pub mod fork;
pub mod registry;
pub mod types;

pub use executor::{TaskEngine, TaskHandle};
pub use types::{Completion, LocalContext, MapReduce, TaskId, TaskState};

#[cfg(test)]
mod tests;
