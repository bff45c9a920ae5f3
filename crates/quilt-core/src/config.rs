//! Construction-time heap configuration.
//!
//! The global heap is parameterized by values, not compile-time
//! specialization: the size-class mapping arrives as plain function pointers
//! and the policy knobs as constants. The mesh period additionally honors
//! the `QUILT_MESH_PERIOD` environment variable (read once, cached).

use std::sync::OnceLock;

use crate::size_class;

/// Frees between opportunistic mesh checks when no override is set.
pub const DEFAULT_MESH_PERIOD: usize = 1024;

/// Upper bound on a mini-heap's mesh chain.
pub const MAX_MESHES: usize = 16;

/// Virtual reservation for the small-object arena.
pub const DEFAULT_ARENA_BYTES: usize = 1 << 30;

/// Drained mini-heaps accumulated before `post_free` requests a flush.
pub const FLUSH_THRESHOLD: usize = 8;

/// Tunables and size-class hooks for a [`GlobalHeap`](crate::GlobalHeap).
#[derive(Clone)]
pub struct HeapConfig {
    /// Number of small size classes.
    pub num_bins: usize,
    /// Maps a request size to its class; `None` routes to the large path.
    pub size_class_for: fn(usize) -> Option<usize>,
    /// Maximum (slot) size of a class.
    pub class_max_size: fn(usize) -> usize,
    /// Frees between mesh checks; 0 disables the countdown.
    pub mesh_period: usize,
    /// Mesh chain bound.
    pub max_meshes: usize,
    /// Minimum slots per span.
    pub min_object_count: usize,
    /// Arena reservation in bytes.
    pub arena_bytes: usize,
    /// Pending-empty mini-heaps that trigger a flush.
    pub flush_threshold: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            num_bins: size_class::NUM_SIZE_CLASSES,
            size_class_for: size_class::bin_index,
            class_max_size: size_class::bin_size,
            mesh_period: default_mesh_period(),
            max_meshes: MAX_MESHES,
            min_object_count: size_class::MIN_OBJECT_COUNT,
            arena_bytes: DEFAULT_ARENA_BYTES,
            flush_threshold: FLUSH_THRESHOLD,
        }
    }
}

static ENV_MESH_PERIOD: OnceLock<Option<usize>> = OnceLock::new();

/// The default mesh period, honoring `QUILT_MESH_PERIOD` if set to an
/// unsigned integer.
#[must_use]
pub fn default_mesh_period() -> usize {
    ENV_MESH_PERIOD
        .get_or_init(|| {
            std::env::var("QUILT_MESH_PERIOD")
                .ok()
                .and_then(|v| v.trim().parse().ok())
        })
        .unwrap_or(DEFAULT_MESH_PERIOD)
}
