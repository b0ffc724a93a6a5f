//! Two-level segregated-fit (TLSF-style) allocator over an abstract
//! address space.
//!
//! The allocator never touches memory. It hands out `(offset, slot)` pairs
//! inside `[0, capacity)` and the caller maps them onto whatever storage it
//! owns (a GPU buffer, a CPU shadow array, ...).
//!
//! # Invariants
//! - Live allocations never overlap.
//! - Free regions and live allocations partition `[0, capacity)` exactly.
//! - Adjacent free regions are always merged on `free`.
//! - `allocate` and `free` are O(1): no loops over nodes or bins.

mod allocator;
pub mod small_float;

pub use allocator::{AllocError, Allocation, Allocator, Region, StorageReport};

pub fn crate_info() -> &'static str {
    "tessera-alloc v0.1.0"
}
