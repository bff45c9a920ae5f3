//! Mini-heap descriptors.
//!
//! A mini-heap is the descriptor for one logical pool of a single size
//! class. It owns one or more physical spans; after meshing, every span in
//! the list aliases the primary span's backing pages, so a slot is readable
//! and writable through any of them at the same offset.
//!
//! Hot fields (`bitmap`, `ref_count`, `attached`) are atomics so frees can
//! run under the shared heap lock; the span list and freelist sit behind
//! short mutexes and only change under the exclusive lock or while the
//! descriptor is exclusively attached to one front-end cache.

#![allow(unsafe_code)]

use std::num::NonZeroU32;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::bitmap::Bitmap;
use crate::fatal;

/// Opaque handle stored in the arena's page-to-owner map; resolved to a
/// descriptor through the global heap's registry under its rw-lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MiniHeapId(NonZeroU32);

impl MiniHeapId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(NonZeroU32::new(raw).expect("mini-heap ids start at 1"))
    }

    /// Raw id value.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Descriptor for one size-class pool over one or more meshed spans.
pub struct MiniHeap {
    id: MiniHeapId,
    object_size: usize,
    object_count: usize,
    span_size: usize,
    /// Base of `spans[0]`; fixed for the descriptor's lifetime.
    primary_base: usize,
    /// Virtual bases of every span; index 0 is the primary.
    spans: Mutex<Vec<usize>>,
    /// Slot occupancy; bit i set means slot i is allocated.
    bitmap: Bitmap,
    /// Randomized permutation of free slot indices; populated while attached.
    freelist: Mutex<Vec<u16>>,
    /// Outstanding borrowers (raised by lookup, released by handle drop).
    ref_count: AtomicU32,
    /// True while a front-end cache holds this mini-heap for fast allocation.
    attached: AtomicBool,
}

impl MiniHeap {
    pub(crate) fn new(
        id: MiniHeapId,
        span_base: usize,
        object_size: usize,
        object_count: usize,
        span_size: usize,
        max_meshes: usize,
        rng: &mut SmallRng,
    ) -> Self {
        debug_assert!(object_size * object_count <= span_size);
        let mut freelist: Vec<u16> = (0..object_count as u16).collect();
        freelist.shuffle(rng);
        // Reserved up front so growing the mesh chain never allocates while
        // the world is stopped.
        let mut spans = Vec::with_capacity(max_meshes.max(1));
        spans.push(span_base);
        Self {
            id,
            object_size,
            object_count,
            span_size,
            primary_base: span_base,
            spans: Mutex::new(spans),
            bitmap: Bitmap::new(object_count),
            freelist: Mutex::new(freelist),
            ref_count: AtomicU32::new(0),
            attached: AtomicBool::new(true),
        }
    }

    /// Stable identity for registry and page-map bookkeeping.
    #[must_use]
    pub fn id(&self) -> MiniHeapId {
        self.id
    }

    /// Nominal slot size (the size class maximum).
    #[must_use]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Number of slots per span.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Length of each span in bytes.
    #[must_use]
    pub fn span_size(&self) -> usize {
        self.span_size
    }

    /// Base address of the primary span.
    #[must_use]
    pub fn span_start(&self) -> usize {
        self.primary_base
    }

    /// Snapshot of every span base, primary first.
    #[must_use]
    pub fn spans(&self) -> Vec<usize> {
        self.spans.lock().clone()
    }

    /// Copies the span list into `out` without allocating, provided `out`
    /// has capacity for the mesh chain.
    pub(crate) fn spans_into(&self, out: &mut Vec<usize>) {
        out.clear();
        out.extend_from_slice(&self.spans.lock());
    }

    /// Number of spans aliasing this pool; 1 means unmeshed.
    #[must_use]
    pub fn mesh_count(&self) -> usize {
        self.spans.lock().len()
    }

    /// Allocated slots.
    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.bitmap.in_use_count()
    }

    /// True when no slot is allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    /// True when every slot is allocated.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.bitmap.in_use_count() == self.object_count
    }

    /// True while a front-end cache owns this mini-heap.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Outstanding borrow count.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Eligible to participate in a merge: detached, not full, and its mesh
    /// chain still under the bound.
    #[must_use]
    pub fn is_meshing_candidate(&self, max_meshes: usize) -> bool {
        !self.is_attached() && !self.is_full() && self.mesh_count() < max_meshes
    }

    /// True when both pools could share backing pages right now.
    #[must_use]
    pub fn is_disjoint(&self, other: &MiniHeap) -> bool {
        self.bitmap.is_disjoint(&other.bitmap)
    }

    /// Pops a free slot and returns its address in the primary span.
    ///
    /// Returns `None` once the primed freelist is exhausted; slots freed
    /// remotely since the last attach are only recovered by `reattach`.
    pub fn alloc_slot(&self) -> Option<usize> {
        let idx = self.freelist.lock().pop()?;
        if !self.bitmap.try_set(idx as usize) {
            fatal("mini-heap freelist handed out an allocated slot");
        }
        Some(self.primary_base + idx as usize * self.object_size)
    }

    /// Releases the slot holding `addr`, which may point through any of the
    /// meshed spans.
    pub fn free(&self, addr: usize) {
        let slot = self.slot_of(addr);
        if !self.bitmap.clear(slot) {
            fatal("double free of mini-heap slot");
        }
    }

    /// Slot size for any address owned by this mini-heap.
    #[must_use]
    pub fn get_size(&self, _addr: usize) -> usize {
        self.object_size
    }

    fn slot_of(&self, addr: usize) -> usize {
        let spans = self.spans.lock();
        for &base in spans.iter() {
            if addr >= base && addr < base + self.span_size {
                let slot = (addr - base) / self.object_size;
                if slot >= self.object_count {
                    fatal("pointer into span padding");
                }
                return slot;
            }
        }
        fatal("pointer does not belong to this mini-heap");
    }

    /// Rebuilds the randomized freelist from the current bitmap and marks the
    /// mini-heap attached. Called with the heap lock held exclusively.
    pub(crate) fn reattach(&self, rng: &mut SmallRng) {
        debug_assert!(!self.is_attached());
        let mut freelist: Vec<u16> = self
            .bitmap
            .unset_bits()
            .into_iter()
            .map(|i| i as u16)
            .collect();
        freelist.shuffle(rng);
        *self.freelist.lock() = freelist;
        self.attached.store(true, Ordering::Release);
    }

    /// Drops the front-end attachment. Unconsumed freelist entries are
    /// recomputed from the bitmap on the next attach.
    pub(crate) fn detach(&self) {
        self.freelist.lock().clear();
        self.attached.store(false, Ordering::Release);
    }

    /// Merges `src` into `self`: copies `src`'s live slots into the primary
    /// span, unions the bitmaps, and takes over `src`'s spans.
    ///
    /// Precondition (checked): occupancy bitmaps are disjoint. Must run with
    /// the world stopped, since `src`'s spans still point at their old
    /// backing until the arena remaps them; performs no heap allocation of
    /// its own for the same reason.
    pub(crate) fn consume(&self, src: &MiniHeap) {
        debug_assert_eq!(self.object_size, src.object_size);
        debug_assert_eq!(self.span_size, src.span_size);
        for slot in 0..src.object_count {
            if !src.bitmap.is_set(slot) {
                continue;
            }
            let offset = slot * self.object_size;
            // SAFETY: both spans are live mappings of span_size bytes; the
            // destination slot is free (bitmaps are disjoint) and nothing
            // else runs while the world is stopped.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (src.primary_base + offset) as *const u8,
                    (self.primary_base + offset) as *mut u8,
                    self.object_size,
                );
            }
            if !self.bitmap.try_set(slot) {
                fatal("meshing pair was not disjoint");
            }
        }
        let mut src_spans = src.spans.lock();
        self.spans.lock().append(&mut src_spans);
    }

    pub(crate) fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_ref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "mini-heap refcount underflow");
    }

    /// Overwrites the descriptor's mutable storage with the retirement
    /// pattern (0x42). Debug aid only; allocation-free.
    #[cfg(debug_assertions)]
    pub(crate) fn poison(&self) {
        self.bitmap.poison();
        for slot in self.freelist.lock().iter_mut() {
            *slot = 0x4242;
        }
    }
}

/// RAII borrow of a mini-heap.
///
/// Holding one guarantees the descriptor and its spans stay alive: an empty
/// mini-heap with outstanding borrows is parked by its tracker and only
/// released after the last handle drops.
pub struct MiniHeapRef {
    mh: Arc<MiniHeap>,
}

impl MiniHeapRef {
    pub(crate) fn new(mh: &Arc<MiniHeap>) -> Self {
        mh.inc_ref();
        Self { mh: Arc::clone(mh) }
    }

    pub(crate) fn arc(&self) -> &Arc<MiniHeap> {
        &self.mh
    }
}

impl Deref for MiniHeapRef {
    type Target = MiniHeap;

    fn deref(&self) -> &MiniHeap {
        &self.mh
    }
}

impl Clone for MiniHeapRef {
    fn clone(&self) -> Self {
        Self::new(&self.mh)
    }
}

impl Drop for MiniHeapRef {
    fn drop(&mut self) {
        self.mh.dec_ref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(0x5eed)
    }

    /// A mini-heap over plain heap memory; good enough for slot accounting
    /// tests that never touch the arena.
    fn buffer_miniheap(buf: &mut Vec<u8>, object_size: usize, count: usize) -> MiniHeap {
        buf.resize(object_size * count, 0);
        MiniHeap::new(
            MiniHeapId::from_raw(1),
            buf.as_ptr() as usize,
            object_size,
            count,
            object_size * count,
            4,
            &mut rng(),
        )
    }

    #[test]
    fn alloc_covers_every_slot_once() {
        let mut buf = Vec::new();
        let mh = buffer_miniheap(&mut buf, 16, 32);
        let mut seen = std::collections::HashSet::new();
        while let Some(addr) = mh.alloc_slot() {
            assert!(seen.insert(addr));
        }
        assert_eq!(seen.len(), 32);
        assert!(mh.is_full());
        assert!(mh.alloc_slot().is_none());
    }

    #[test]
    fn free_and_reattach_recover_slots() {
        let mut buf = Vec::new();
        let mh = buffer_miniheap(&mut buf, 16, 16);
        let addrs: Vec<usize> = std::iter::from_fn(|| mh.alloc_slot()).collect();
        for &a in &addrs[..8] {
            mh.free(a);
        }
        assert_eq!(mh.in_use_count(), 8);

        // Remote frees are invisible to the exhausted freelist until reattach.
        assert!(mh.alloc_slot().is_none());
        mh.detach();
        assert!(!mh.is_attached());
        mh.reattach(&mut rng());
        assert!(mh.is_attached());
        let recovered: Vec<usize> = std::iter::from_fn(|| mh.alloc_slot()).collect();
        assert_eq!(recovered.len(), 8);
        assert!(mh.is_full());
    }

    #[test]
    fn consume_merges_disjoint_pools() {
        let mut buf_a = Vec::new();
        let mut buf_b = Vec::new();
        let a = buffer_miniheap(&mut buf_a, 8, 16);
        let b = buffer_miniheap(&mut buf_b, 8, 16);

        // a takes even slots, b takes odd slots, each tagged through memory.
        let base_a = a.span_start();
        let base_b = b.span_start();
        for slot in 0..16usize {
            let (mh, base) = if slot % 2 == 0 { (&a, base_a) } else { (&b, base_b) };
            assert!(mh.bitmap.try_set(slot));
            unsafe { ((base + slot * 8) as *mut u8).write(slot as u8) };
        }

        assert!(a.is_disjoint(&b));
        a.consume(&b);
        assert_eq!(a.in_use_count(), 16);
        assert_eq!(a.mesh_count(), 2);
        assert_eq!(b.mesh_count(), 0, "donor spans move to the survivor");
        for slot in 0..16usize {
            let byte = unsafe { ((base_a + slot * 8) as *const u8).read() };
            assert_eq!(byte, slot as u8);
        }
    }

    #[test]
    fn borrow_handle_tracks_refcount() {
        let mut buf = Vec::new();
        let mh = Arc::new(buffer_miniheap(&mut buf, 16, 8));
        assert_eq!(mh.ref_count(), 0);
        let r1 = MiniHeapRef::new(&mh);
        let r2 = r1.clone();
        assert_eq!(mh.ref_count(), 2);
        drop(r1);
        assert_eq!(mh.ref_count(), 1);
        assert_eq!(r2.object_size(), 16);
        drop(r2);
        assert_eq!(mh.ref_count(), 0);
    }
}
