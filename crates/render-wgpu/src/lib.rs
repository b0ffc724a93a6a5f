//! wgpu backend for the tessera rendering core.
//!
//! [`WgpuDevice`] implements the core's `Device` trait: it owns every wgpu
//! object behind an opaque id and replays a frame's draw stream into a single
//! render pass.
//!
//! # Invariants
//! - Only state the stream marks as changed is rebound.
//! - Each submission records exactly one render pass and one queue submit.
//! - A frame that references objects which are not live is rejected before
//!   anything is encoded.

mod convert;
mod error;
mod gpu;

pub use error::WgpuError;
pub use gpu::WgpuDevice;

pub fn crate_info() -> &'static str {
    "tessera-render-wgpu v0.1.0"
}
