//! Tessera Render: retained-mode rendering core.
//!
//! Applications describe textures, buffers, binding sets, materials and
//! geometry as versioned descriptors in a [`Scene`]. Each frame the
//! [`Renderer`] resolves a render list against a [`ResourceCache`], sorts it
//! by binding set and pipeline, encodes a delta-compressed [`DrawStream`] and
//! hands it to a [`Device`] in one submission.
//!
//! # Invariants
//! - Descriptors never hold device ids; the cache owns every device object.
//! - A cache entry is reused only while its descriptor version and every
//!   dependency stamp are unchanged.
//! - Shared layouts, samplers, shaders and pipelines are destroyed when
//!   their last reference is released.
//! - Each stream record carries only the fields that changed since the
//!   previous draw.
//! - A frame that fails before submission submits nothing.

pub mod arena;
pub mod cache;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod headless;
pub mod heap;
pub mod key;
pub mod pool;
pub mod renderer;
pub mod shared;
pub mod stream;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheStats, GpuGeometry, PassState, ResolvedMaterial, ResourceCache};
pub use config::RenderConfig;
pub use descriptor::{
    Binding, BindingResource, Bindings, BindingsKey, Buffer, BufferKey, BufferKind,
    ColorAttachment, DepthAttachment, DrawItem, Geometry, GeometryKey, Material, MaterialKey,
    RenderPass, RenderTarget, Scene, Shader, Texture, TextureKey,
};
pub use device::{
    Device, FrameSubmission, GpuBindGroup, GpuBuffer, GpuLayout, GpuPipeline, GpuSampler,
    GpuShader, GpuTexture, ResolvedTarget,
};
pub use error::{RenderError, Result};
pub use headless::{HeadlessDevice, ObjectKind};
pub use pool::{PoolKind, PoolStats};
pub use renderer::{FramePhase, FrameStats, Renderer};
pub use stream::{DrawStream, DrawStreamDecoder, StreamFields};

pub fn crate_info() -> &'static str {
    "tessera-render v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("render"));
    }
}
