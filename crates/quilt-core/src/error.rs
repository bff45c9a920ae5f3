//! Status codes for the keyed control surface.
//!
//! Only `mallctl` is status-coded; every other failure in the allocator is
//! either fatal (process abort) or silently skipped.

use thiserror::Error;

/// Errors returned by [`GlobalHeap::mallctl`](crate::global::GlobalHeap::mallctl).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CtlError {
    /// A read key was invoked without an output buffer.
    #[error("read key requires an output buffer")]
    MissingOutput,
    /// The output buffer cannot hold a 64-bit value.
    #[error("output buffer smaller than 8 bytes")]
    OutputTooSmall,
    /// A write key was invoked without an 8-byte input buffer.
    #[error("input buffer smaller than 8 bytes")]
    InputTooSmall,
}
