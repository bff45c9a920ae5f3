//! Meshing allocator core.
//!
//! quilt reclaims physical memory from fragmented small-object heaps by
//! *meshing*: remapping virtual spans with non-overlapping occupancy onto a
//! single backing range of physical pages, without ever moving a live object
//! in the virtual address space.
//!
//! # Architecture
//!
//! - **Meshable arena** (`arena`): one shared-memory mapping carved into
//!   page-aligned spans, with a page-to-owner map and the kernel-level remap
//!   that makes meshing possible
//! - **Mini-heaps** (`miniheap`): fixed-size-class span descriptors with an
//!   atomic occupancy bitmap and a randomized freelist
//! - **Binned trackers** (`bins`): per-size-class pools partitioned by
//!   fullness, feeding reuse and meshing candidates
//! - **Meshing strategy** (`meshing`): randomized split-and-scan discovery of
//!   bitmap-disjoint pairs
//! - **Global heap** (`global`): routes every allocation and free, drives the
//!   stop-the-world meshing pass, and exposes the `mallctl` control surface
//! - **Large-object sidecar** (`large`): conventional mapping-per-allocation
//!   path for requests above the largest size class
//! - **Stop-the-world** (`stop_world`): signal-handshake suspension of every
//!   peer thread while spans are remapped

pub mod arena;
pub mod bins;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod global;
pub mod large;
pub mod meshing;
pub mod miniheap;
pub mod size_class;
pub mod stats;
pub mod stop_world;
pub mod sys;

pub use config::HeapConfig;
pub use error::CtlError;
pub use global::{global, GlobalHeap};
pub use miniheap::{MiniHeap, MiniHeapId, MiniHeapRef};
pub use stats::StatsSnapshot;

/// Terminal failure: the allocator is either correct or dead.
pub(crate) fn fatal(context: &str) -> ! {
    tracing::error!("fatal: {context}");
    std::process::abort()
}
