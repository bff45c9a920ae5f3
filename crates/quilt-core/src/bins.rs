//! Per-size-class tracking of mini-heaps, partitioned by fullness.
//!
//! Each tracker holds every live mini-heap of one size class in one of five
//! occupancy bins. Reuse selection walks densest-first so shallow mini-heaps
//! drain and feed the meshing candidate pool. The tracker carries its own
//! mutex so post-free transitions can run under the shared heap lock.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::miniheap::{MiniHeap, MiniHeapId};

const BIN_EMPTY: usize = 0;
const BIN_SHALLOW: usize = 1;
const BIN_PARTIAL: usize = 2;
const BIN_DEEP: usize = 3;
const BIN_FULL: usize = 4;
const NUM_FULLNESS_BINS: usize = 5;

/// Reuse preference: densest occupied bins first, then empties.
const REUSE_ORDER: [usize; 4] = [BIN_DEEP, BIN_PARTIAL, BIN_SHALLOW, BIN_EMPTY];

fn fullness_bin(in_use: usize, count: usize) -> usize {
    if in_use == 0 {
        BIN_EMPTY
    } else if in_use == count {
        BIN_FULL
    } else if in_use * 4 <= count {
        BIN_SHALLOW
    } else if in_use * 4 <= count * 3 {
        BIN_PARTIAL
    } else {
        BIN_DEEP
    }
}

struct TrackerInner {
    bins: [Vec<Arc<MiniHeap>>; NUM_FULLNESS_BINS],
    /// Drained, detached mini-heaps awaiting release by the next flush.
    pending: Vec<Arc<MiniHeap>>,
}

/// The set of mini-heaps of one size class.
pub struct BinnedTracker {
    object_size: usize,
    object_count: usize,
    flush_threshold: usize,
    inner: Mutex<TrackerInner>,
}

impl BinnedTracker {
    #[must_use]
    pub fn new(object_size: usize, object_count: usize, flush_threshold: usize) -> Self {
        Self {
            object_size,
            object_count,
            flush_threshold,
            inner: Mutex::new(TrackerInner {
                bins: Default::default(),
                pending: Vec::new(),
            }),
        }
    }

    /// Slot size of this class.
    #[must_use]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Slots per mini-heap in this class.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Places a newly created mini-heap.
    pub fn add(&self, mh: Arc<MiniHeap>) {
        let bin = fullness_bin(mh.in_use_count(), self.object_count);
        self.inner.lock().bins[bin].push(mh);
    }

    /// Removes a mini-heap on destruction (mesh donors). Returns the handle
    /// if it was tracked.
    pub fn remove(&self, id: MiniHeapId) -> Option<Arc<MiniHeap>> {
        let mut inner = self.inner.lock();
        for bin in &mut inner.bins {
            if let Some(pos) = bin.iter().position(|m| m.id() == id) {
                return Some(bin.swap_remove(pos));
            }
        }
        let pos = inner.pending.iter().position(|m| m.id() == id)?;
        Some(inner.pending.swap_remove(pos))
    }

    /// Chooses a detached, not-full mini-heap for a fresh attachment,
    /// densest first; insertion order breaks ties within a bin.
    #[must_use]
    pub fn select_for_reuse(&self) -> Option<Arc<MiniHeap>> {
        let inner = self.inner.lock();
        for &bin in &REUSE_ORDER {
            if let Some(mh) = inner.bins[bin].iter().find(|m| !m.is_attached()) {
                return Some(Arc::clone(mh));
            }
        }
        None
    }

    /// Re-bins a mini-heap after occupancy changed; parks it when drained and
    /// detached. Returns true once enough releasable heaps accumulate that
    /// the caller should flush.
    pub fn post_free(&self, mh: &Arc<MiniHeap>) -> bool {
        let mut inner = self.inner.lock();
        let Some(current) = inner
            .bins
            .iter()
            .position(|bin| bin.iter().any(|m| m.id() == mh.id()))
        else {
            // Already parked; it stays parked until flushed.
            return false;
        };
        let pos = inner.bins[current]
            .iter()
            .position(|m| m.id() == mh.id())
            .unwrap();
        let in_use = mh.in_use_count();
        if in_use == 0 && !mh.is_attached() {
            let taken = inner.bins[current].swap_remove(pos);
            inner.pending.push(taken);
            return inner.pending.len() >= self.flush_threshold;
        }
        let target = fullness_bin(in_use, self.object_count);
        if target != current {
            let taken = inner.bins[current].swap_remove(pos);
            inner.bins[target].push(taken);
        }
        false
    }

    /// Releases every parked mini-heap through `release`, skipping (and
    /// re-parking) those with outstanding borrows. Must be called with the
    /// global mini-heap rw-lock held exclusively.
    pub fn flush_free_miniheaps<F: FnMut(&Arc<MiniHeap>)>(&self, mut release: F) {
        let pending: Vec<Arc<MiniHeap>> = {
            let mut inner = self.inner.lock();
            inner.pending.drain(..).collect()
        };
        for mh in pending {
            if mh.ref_count() > 0 {
                self.inner.lock().pending.push(mh);
            } else {
                release(&mh);
            }
        }
    }

    /// Mini-heaps with at least one allocated slot.
    #[must_use]
    pub fn non_empty_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .bins
            .iter()
            .flatten()
            .filter(|m| m.in_use_count() > 0)
            .count()
    }

    /// Allocated slots across the whole class.
    #[must_use]
    pub fn allocated_object_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .bins
            .iter()
            .flatten()
            .chain(inner.pending.iter())
            .map(|m| m.in_use_count())
            .sum()
    }

    /// Mini-heaps eligible for the meshing pass.
    #[must_use]
    pub fn meshing_candidates(&self, max_meshes: usize) -> Vec<Arc<MiniHeap>> {
        let inner = self.inner.lock();
        inner.bins[..BIN_FULL]
            .iter()
            .flatten()
            .filter(|m| m.is_meshing_candidate(max_meshes))
            .cloned()
            .collect()
    }

    /// One-line occupancy summary for stat dumps.
    #[must_use]
    pub fn occupancy_summary(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let heaps = inner.bins.iter().flatten().count() + inner.pending.len();
        drop(inner);
        (heaps, self.allocated_object_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miniheap::MiniHeapId;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn miniheap(id: u32, buf: &mut Vec<u8>, count: usize) -> Arc<MiniHeap> {
        buf.resize(16 * count, 0);
        Arc::new(MiniHeap::new(
            MiniHeapId::from_raw(id),
            buf.as_ptr() as usize,
            16,
            count,
            16 * count,
            4,
            &mut SmallRng::seed_from_u64(id as u64),
        ))
    }

    #[test]
    fn fullness_banding() {
        assert_eq!(fullness_bin(0, 16), BIN_EMPTY);
        assert_eq!(fullness_bin(1, 16), BIN_SHALLOW);
        assert_eq!(fullness_bin(4, 16), BIN_SHALLOW);
        assert_eq!(fullness_bin(5, 16), BIN_PARTIAL);
        assert_eq!(fullness_bin(12, 16), BIN_PARTIAL);
        assert_eq!(fullness_bin(13, 16), BIN_DEEP);
        assert_eq!(fullness_bin(16, 16), BIN_FULL);
    }

    #[test]
    fn select_prefers_densest_detached() {
        let tracker = BinnedTracker::new(16, 8, 4);
        let mut buf_a = Vec::new();
        let mut buf_b = Vec::new();

        let shallow = miniheap(1, &mut buf_a, 8);
        shallow.detach();
        let deep = miniheap(2, &mut buf_b, 8);
        for _ in 0..7 {
            deep.alloc_slot().unwrap();
        }
        deep.detach();

        // shallow: detached+empty -> Empty bin; deep: 7/8 -> Deep bin.
        tracker.add(Arc::clone(&shallow));
        tracker.add(Arc::clone(&deep));
        let chosen = tracker.select_for_reuse().unwrap();
        assert_eq!(chosen.id(), deep.id());
    }

    #[test]
    fn select_skips_attached() {
        let tracker = BinnedTracker::new(16, 8, 4);
        let mut buf = Vec::new();
        let attached = miniheap(1, &mut buf, 8);
        attached.alloc_slot().unwrap();
        tracker.add(Arc::clone(&attached));
        assert!(tracker.select_for_reuse().is_none());
    }

    #[test]
    fn post_free_moves_between_bins_and_parks() {
        let tracker = BinnedTracker::new(16, 8, 2);
        let mut buf = Vec::new();
        let mh = miniheap(1, &mut buf, 8);
        let addrs: Vec<usize> = std::iter::from_fn(|| mh.alloc_slot()).collect();
        tracker.add(Arc::clone(&mh));
        assert_eq!(tracker.non_empty_count(), 1);

        for &a in &addrs[..7] {
            mh.free(a);
            assert!(!tracker.post_free(&mh));
        }
        mh.detach();
        mh.free(addrs[7]);
        // Drained and detached: parked, below the flush threshold of 2.
        assert!(!tracker.post_free(&mh));
        assert_eq!(tracker.non_empty_count(), 0);
        assert!(tracker.select_for_reuse().is_none());
    }

    #[test]
    fn flush_skips_borrowed_heaps() {
        let tracker = BinnedTracker::new(16, 8, 1);
        let mut buf = Vec::new();
        let mh = miniheap(1, &mut buf, 8);
        let addr = mh.alloc_slot().unwrap();
        mh.detach();
        tracker.add(Arc::clone(&mh));

        mh.free(addr);
        assert!(tracker.post_free(&mh), "threshold of 1 reached");

        mh.inc_ref();
        let mut released = Vec::new();
        tracker.flush_free_miniheaps(|m| released.push(m.id()));
        assert!(released.is_empty(), "borrowed heap must be re-parked");

        mh.dec_ref();
        tracker.flush_free_miniheaps(|m| released.push(m.id()));
        assert_eq!(released, vec![mh.id()]);
    }

    #[test]
    fn allocated_object_count_spans_bins_and_pending() {
        let tracker = BinnedTracker::new(16, 8, 10);
        let mut buf_a = Vec::new();
        let mut buf_b = Vec::new();
        let a = miniheap(1, &mut buf_a, 8);
        let b = miniheap(2, &mut buf_b, 8);
        a.alloc_slot().unwrap();
        a.alloc_slot().unwrap();
        b.alloc_slot().unwrap();
        tracker.add(a);
        tracker.add(b);
        assert_eq!(tracker.allocated_object_count(), 3);
        assert_eq!(tracker.non_empty_count(), 2);
    }
}
