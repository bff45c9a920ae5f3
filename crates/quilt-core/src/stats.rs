//! Atomic heap statistics and resident-memory measurement.
//!
//! All counters use relaxed ordering — they are advisory/diagnostic,
//! not synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global heap operation counters.
pub struct HeapStats {
    /// Mini-heap pairs merged (or attempted) by meshing passes.
    pub mesh_count: AtomicU64,
    /// Mini-heap descriptors created.
    pub mh_alloc_count: AtomicU64,
    /// Mini-heap descriptors released back to the arena.
    pub mh_free_count: AtomicU64,
    /// Best-effort peak of live mini-heap descriptors.
    pub mh_high_water_mark: AtomicU64,
}

impl HeapStats {
    /// Create a new zeroed counter set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mesh_count: AtomicU64::new(0),
            mh_alloc_count: AtomicU64::new(0),
            mh_free_count: AtomicU64::new(0),
            mh_high_water_mark: AtomicU64::new(0),
        }
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter value.
    #[must_use]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Raise the high-water mark if `current` exceeds it. Best effort: a
    /// racing reader may observe a briefly stale peak.
    pub fn raise_high_water(&self, current: u64) {
        self.mh_high_water_mark
            .fetch_max(current, Ordering::Relaxed);
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            mesh_count: Self::get(&self.mesh_count),
            mh_alloc_count: Self::get(&self.mh_alloc_count),
            mh_free_count: Self::get(&self.mh_free_count),
            mh_high_water_mark: Self::get(&self.mh_high_water_mark),
        }
    }
}

impl Default for HeapStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of the heap counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    pub mesh_count: u64,
    pub mh_alloc_count: u64,
    pub mh_free_count: u64,
    pub mh_high_water_mark: u64,
}

/// Proportional-set-size of the current process, in bytes.
///
/// Meshed pages are shared between several of our own mappings; PSS counts
/// each physical page once, where RSS would count it per mapping.
#[must_use]
pub fn measure_pss_bytes() -> u64 {
    if let Some(kib) = pss_kib_from("/proc/self/smaps_rollup") {
        return kib * 1024;
    }
    // Older kernels lack smaps_rollup; sum the full smaps instead.
    pss_kib_from("/proc/self/smaps").unwrap_or(0) * 1024
}

fn pss_kib_from(path: &str) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    let mut total = 0u64;
    let mut seen = false;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("Pss:") {
            let kib: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            total += kib;
            seen = true;
        }
    }
    seen.then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let s = HeapStats::new();
        let snap = s.snapshot();
        assert_eq!(snap.mesh_count, 0);
        assert_eq!(snap.mh_alloc_count, 0);
    }

    #[test]
    fn add_and_high_water() {
        let s = HeapStats::new();
        HeapStats::add(&s.mh_alloc_count, 3);
        s.raise_high_water(2);
        s.raise_high_water(5);
        s.raise_high_water(4);
        let snap = s.snapshot();
        assert_eq!(snap.mh_alloc_count, 3);
        assert_eq!(snap.mh_high_water_mark, 5);
    }

    #[test]
    fn pss_is_nonzero_for_live_process() {
        assert!(measure_pss_bytes() > 0);
    }

    #[test]
    fn snapshot_serializes() {
        let s = HeapStats::new();
        HeapStats::add(&s.mesh_count, 7);
        let json = serde_json::to_string(&s.snapshot()).unwrap();
        assert!(json.contains("\"mesh_count\":7"));
    }
}
