//! The meshable arena.
//!
//! One shared-memory file, mapped once, carved into page-aligned spans. At
//! birth every virtual page views its own file offset (the identity mapping);
//! meshing points a span's virtual range at another span's file offset so
//! both ranges share physical pages, and the donor's original pages are
//! punched out of the file.
//!
//! The arena also owns the page-to-owner map: every page of every live span
//! records the mini-heap that owns it, as an opaque id resolved by the
//! global heap.

#![allow(unsafe_code)]

use std::collections::HashMap;

use crate::miniheap::MiniHeapId;
use crate::size_class::PAGE_SIZE;
use crate::{fatal, sys};

/// Owner of the small-object virtual region.
pub struct MeshableArena {
    fd: i32,
    base: usize,
    arena_pages: usize,
    /// First never-allocated page.
    frontier_page: usize,
    /// Recycled virtual spans, keyed by length in pages.
    free_spans: HashMap<usize, Vec<usize>>,
    /// Owning mini-heap per page; `None` for unassigned pages.
    page_owner: Vec<Option<MiniHeapId>>,
    in_use_spans: usize,
}

impl MeshableArena {
    /// Reserves the arena mapping. Failure to reserve is fatal: the allocator
    /// cannot run without its region.
    #[must_use]
    pub fn new(arena_bytes: usize) -> Self {
        assert!(arena_bytes % PAGE_SIZE == 0, "arena must be page-aligned");
        let fd = match sys::create_arena_file(arena_bytes) {
            Ok(fd) => fd,
            Err(err) => fatal(&format!("arena backing file: {err}")),
        };
        let base = match sys::map_arena(fd, arena_bytes) {
            Ok(ptr) => ptr as usize,
            Err(err) => fatal(&format!("arena mapping: {err}")),
        };
        let arena_pages = arena_bytes / PAGE_SIZE;
        tracing::debug!(arena_bytes, base = format_args!("{base:#x}"), "arena reserved");
        Self {
            fd,
            base,
            arena_pages,
            frontier_page: 0,
            free_spans: HashMap::new(),
            page_owner: vec![None; arena_pages],
            in_use_spans: 0,
        }
    }

    /// Obtains a span of `span_size` bytes. Virtual exhaustion is fatal.
    pub fn malloc(&mut self, span_size: usize) -> usize {
        assert!(span_size % PAGE_SIZE == 0);
        let pages = span_size / PAGE_SIZE;
        let start = if let Some(start) = self.free_spans.get_mut(&pages).and_then(Vec::pop) {
            start
        } else {
            let start = self.frontier_page;
            if start + pages > self.arena_pages {
                fatal("arena exhausted");
            }
            self.frontier_page = start + pages;
            start
        };
        self.in_use_spans += 1;
        self.base + start * PAGE_SIZE
    }

    /// Returns a span: the physical pages are decommitted, the virtual range
    /// is restored to its identity backing and kept for reuse.
    pub fn free(&mut self, span_base: usize, span_size: usize) {
        let start = self.page_index(span_base);
        let pages = span_size / PAGE_SIZE;
        for page in start..start + pages {
            self.page_owner[page] = None;
        }

        let offset = span_base - self.base;
        // A meshed span views someone else's pages; point it back at its own
        // offset before recycling so the next owner gets private zeroes.
        // SAFETY: the range is a span inside our mapping; its owner released it.
        if let Err(err) = unsafe { sys::remap_fixed(self.fd, span_base as *mut u8, span_size, offset) } {
            fatal(&format!("arena span restore: {err}"));
        }
        if let Err(err) = sys::punch_hole(self.fd, offset, span_size) {
            fatal(&format!("arena decommit: {err}"));
        }

        self.free_spans.entry(pages).or_default().push(start);
        self.in_use_spans -= 1;
    }

    /// Records `n_pages` starting at `span_base` as owned by `owner`.
    pub fn assoc(&mut self, span_base: usize, owner: MiniHeapId, n_pages: usize) {
        let start = self.page_index(span_base);
        for page in start..start + n_pages {
            debug_assert!(self.page_owner[page].is_none(), "page already owned");
            self.page_owner[page] = Some(owner);
        }
    }

    /// O(1) reverse lookup from address to owning mini-heap.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<MiniHeapId> {
        if !self.contains(addr) {
            return None;
        }
        self.page_owner[(addr - self.base) / PAGE_SIZE]
    }

    /// True if `addr` falls inside the arena mapping.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.arena_pages * PAGE_SIZE
    }

    /// Remaps `src_base`'s range onto `dst_base`'s backing pages and releases
    /// `src_base`'s own pages. Afterwards reads and writes through either
    /// virtual range observe identical memory, and `src_base`'s pages answer
    /// to `dst_base`'s owner.
    ///
    /// Must run with application threads stopped: between the remap of one
    /// donor span and the next, sibling spans briefly view stale backing.
    pub fn mesh(&mut self, dst_base: usize, src_base: usize, span_size: usize) {
        let dst_offset = dst_base - self.base;
        let src_offset = src_base - self.base;
        debug_assert_ne!(dst_offset, src_offset);

        // SAFETY: both ranges are live spans inside the mapping; the world is
        // stopped, so nothing observes the transition.
        if let Err(err) = unsafe { sys::remap_fixed(self.fd, src_base as *mut u8, span_size, dst_offset) } {
            fatal(&format!("mesh remap: {err}"));
        }
        // The donor's identity pages are no longer referenced by any mapping
        // (its own range now views dst). Punching an already-punched range is
        // a no-op, which covers donors that were themselves meshed earlier.
        if let Err(err) = sys::punch_hole(self.fd, src_offset, span_size) {
            fatal(&format!("mesh decommit: {err}"));
        }

        let owner = self.page_owner[dst_offset / PAGE_SIZE];
        debug_assert!(owner.is_some(), "mesh destination must be owned");
        let start = src_offset / PAGE_SIZE;
        for page in start..start + span_size / PAGE_SIZE {
            self.page_owner[page] = owner;
        }
    }

    /// Spans currently in service.
    #[must_use]
    pub fn allocated_span_count(&self) -> usize {
        self.in_use_spans
    }

    fn page_index(&self, addr: usize) -> usize {
        if !self.contains(addr) || (addr - self.base) % PAGE_SIZE != 0 {
            fatal("address is not a span base in this arena");
        }
        (addr - self.base) / PAGE_SIZE
    }
}

impl Drop for MeshableArena {
    fn drop(&mut self) {
        // SAFETY: the mapping and fd were created in new() and the arena is
        // being destroyed; callers must not retain span addresses past this.
        unsafe { sys::unmap(self.base as *mut u8, self.arena_pages * PAGE_SIZE) };
        sys::close_arena_file(self.fd);
    }
}
