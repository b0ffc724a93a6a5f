//! Shared building blocks for the tessera crates.
//!
//! # Invariants
//! - A handle is only ever resolved by the registry that issued it.
//! - A removed slot bumps its generation, so handles to the old occupant
//!   never resolve to the new one.
//! - Structurally equal values hash identically across runs.

mod handle;
mod hash;
mod registry;

pub use handle::Handle;
pub use hash::{StructuralHasher, structural_hash};
pub use registry::{DenseRegistry, Registry, SecondaryMap};

pub fn crate_info() -> &'static str {
    "tessera-common v0.1.0"
}
