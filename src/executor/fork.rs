//! Fork-tree shape.
//!
//! A task over `n` partitions is the balanced binary tree obtained by
//! splitting `[lo, hi)` at `lo + (hi - lo) / 2` until every leaf holds one
//! partition. The shape depends only on `n`, so reductions pair the same
//! subtrees on every run no matter where or when the leaves finish.

use std::collections::HashMap;

use crate::error::{ClusterError, Result};
use crate::membership::types::NodeId;

pub fn split(lo: u32, hi: u32) -> u32 {
    lo + (hi - lo) / 2
}

/// Covers `[0, homes.len())` with maximal fork-tree subtrees whose partitions
/// all share one home, in partition order.
pub fn homogeneous_cover(homes: &[NodeId]) -> Vec<(u32, u32, NodeId)> {
    let mut out = Vec::new();
    if !homes.is_empty() {
        cover(0, homes.len() as u32, homes, &mut out);
    }
    out
}

fn cover(lo: u32, hi: u32, homes: &[NodeId], out: &mut Vec<(u32, u32, NodeId)>) {
    let first = &homes[lo as usize];
    if homes[lo as usize..hi as usize].iter().all(|h| h == first) {
        out.push((lo, hi, first.clone()));
        return;
    }
    let mid = split(lo, hi);
    cover(lo, mid, homes, out);
    cover(mid, hi, homes, out);
}

/// Rebuilds the result of `[lo, hi)` from already-reduced subtrees, folding
/// missing levels with `reduce` in tree order.
pub fn assemble<T, F>(
    lo: u32,
    hi: u32,
    parts: &mut HashMap<(u32, u32), T>,
    reduce: &mut F,
) -> Result<T>
where
    F: FnMut(T, T) -> Result<T>,
{
    if let Some(part) = parts.remove(&(lo, hi)) {
        return Ok(part);
    }
    if hi - lo <= 1 {
        return Err(ClusterError::TaskFailed(format!(
            "no result for partition {}",
            lo
        )));
    }
    let mid = split(lo, hi);
    let left = assemble(lo, mid, parts, reduce)?;
    let right = assemble(mid, hi, parts, reduce)?;
    reduce(left, right)
}

/// Merges sibling outcomes. A real failure wins over the cancellation it
/// triggered elsewhere in the tree.
pub fn combine<A, B>(left: Result<A>, right: Result<B>) -> Result<(A, B)> {
    match (left, right) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
        (Err(ClusterError::Cancelled), Err(e)) => Err(e),
        (Err(e), Err(_)) => Err(e),
    }
}

/// Collects sibling outcomes in order, with the same precedence as `combine`.
pub fn gather<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(results.len());
    let mut failure: Option<ClusterError> = None;
    for result in results {
        match result {
            Ok(value) => out.push(value),
            Err(e) => {
                failure = match failure {
                    None | Some(ClusterError::Cancelled) => Some(e),
                    keep => keep,
                }
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(out),
    }
}
