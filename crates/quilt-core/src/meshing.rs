//! Pair discovery for meshing.
//!
//! Randomly partitions a bin's candidates into two halves and greedily scans
//! for cross-half pairs whose occupancy bitmaps are disjoint. Each discovered
//! pair is emitted through the callback; each candidate joins at most one
//! pair per pass.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::miniheap::MiniHeap;

/// Emits bitmap-disjoint pairs from `candidates` via `found`.
pub fn simple_greedy_splitting<F>(rng: &mut SmallRng, mut candidates: Vec<Arc<MiniHeap>>, mut found: F)
where
    F: FnMut(Arc<MiniHeap>, Arc<MiniHeap>),
{
    if candidates.len() < 2 {
        return;
    }
    candidates.shuffle(rng);
    let right = candidates.split_off(candidates.len() / 2);
    let mut used = vec![false; right.len()];

    for left in candidates {
        for (i, candidate) in right.iter().enumerate() {
            if used[i] {
                continue;
            }
            if left.is_disjoint(candidate) {
                used[i] = true;
                found(left, Arc::clone(candidate));
                break;
            }
        }
    }
}
