//! Benchmark crate for the quilt meshing allocator; see `benches/`.
