//! The seam between the rendering core and a graphics API.
//!
//! Device objects are opaque `u32` ids, one id space per kind. The core never
//! inspects them; it only stores, compares and hands them back.

use crate::error::Result;
use crate::stream::DrawStream;
use crate::types::{
    BufferUsages, LoadOp, PipelineState, SamplerDesc, ShaderStages, StoreOp, TextureFormat,
    TextureUsages, VertexBufferLayout,
};

macro_rules! device_id {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);
        )*
    };
}

device_id! {
    GpuBuffer;
    GpuTexture;
    GpuSampler;
    GpuShader;
    /// A bind group layout.
    GpuLayout;
    GpuBindGroup;
    GpuPipeline;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub depth_or_layers: u32,
    pub mip_level_count: u32,
    pub sample_count: u32,
    pub format: TextureFormat,
    pub usage: TextureUsages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderDesc<'a> {
    pub label: &'a str,
    pub source: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSampleType {
    Float { filterable: bool },
    Depth,
}

/// Shape of one entry in a bind group layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingType {
    UniformBuffer { dynamic: bool, min_size: u64 },
    StorageBuffer { read_only: bool },
    Texture {
        sample_type: TextureSampleType,
        multisampled: bool,
    },
    Sampler { filtering: bool, comparison: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutEntry {
    pub binding: u32,
    pub visibility: ShaderStages,
    pub ty: BindingType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindResource {
    Buffer {
        buffer: GpuBuffer,
        offset: u64,
        size: u64,
    },
    Texture(GpuTexture),
    Sampler(GpuSampler),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindEntry {
    pub binding: u32,
    pub resource: BindResource,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc<'a> {
    pub label: &'a str,
    pub shader: GpuShader,
    pub vertex_entry: &'a str,
    pub fragment_entry: Option<&'a str>,
    /// Bind group layouts in group order.
    pub layouts: &'a [GpuLayout],
    pub vertex_buffers: &'a [VertexBufferLayout],
    pub state: PipelineState,
    pub color_formats: &'a [TextureFormat],
    pub depth_format: Option<TextureFormat>,
    pub sample_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedColor {
    pub view: GpuTexture,
    pub resolve: Option<GpuTexture>,
    pub clear: Option<[f64; 4]>,
    pub load: LoadOp,
    pub store: StoreOp,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedDepth {
    pub view: GpuTexture,
    pub clear: Option<f32>,
    pub load: LoadOp,
    pub store: StoreOp,
}

/// A render target with every attachment resolved to a device texture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedTarget {
    pub color: Vec<ResolvedColor>,
    pub depth: Option<ResolvedDepth>,
}

/// One frame handed to the device. Borrowed only for the duration of
/// [`Device::submit`].
#[derive(Debug, Clone, Copy)]
pub struct FrameSubmission<'a> {
    pub label: &'a str,
    pub stream: &'a DrawStream,
    pub target: &'a ResolvedTarget,
}

/// Object lifetime, uploads and frame submission on a graphics device.
///
/// Creation is infallible at this seam: backends report API-level failures
/// through their own channels (wgpu's error scopes, for instance).
pub trait Device {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> GpuBuffer;
    /// `offset` and `data.len()` are multiples of 4.
    fn write_buffer(&mut self, buffer: GpuBuffer, offset: u64, data: &[u8]);
    fn destroy_buffer(&mut self, buffer: GpuBuffer);

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> GpuTexture;
    /// Upload tightly packed texels for one mip level.
    fn write_texture(&mut self, texture: GpuTexture, mip_level: u32, data: &[u8]);
    fn destroy_texture(&mut self, texture: GpuTexture);

    fn create_sampler(&mut self, desc: &SamplerDesc) -> GpuSampler;
    fn destroy_sampler(&mut self, sampler: GpuSampler);

    fn create_shader(&mut self, desc: &ShaderDesc<'_>) -> GpuShader;
    fn destroy_shader(&mut self, shader: GpuShader);

    fn create_layout(&mut self, entries: &[LayoutEntry]) -> GpuLayout;
    fn destroy_layout(&mut self, layout: GpuLayout);

    fn create_bind_group(&mut self, layout: GpuLayout, entries: &[BindEntry]) -> GpuBindGroup;
    fn destroy_bind_group(&mut self, group: GpuBindGroup);

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> GpuPipeline;
    fn destroy_pipeline(&mut self, pipeline: GpuPipeline);

    /// Queue one frame. A frame that references objects which are not live
    /// is rejected whole with `RenderError::Device` and records nothing.
    fn submit(&mut self, frame: &FrameSubmission<'_>) -> Result<()>;
}
