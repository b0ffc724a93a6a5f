//! Scene setup shared by the cache and renderer tests.

use std::collections::HashMap;

use tessera_common::Registry;

use crate::config::RenderConfig;
use crate::descriptor::{
    BindingResource, Bindings, Buffer, BufferKey, BufferKind, ColorAttachment, DepthAttachment,
    Geometry, GeometryKey, Material, MaterialKey, RenderPass, RenderTarget, Scene, Shader,
    Texture, TextureKey,
};
use crate::device::{
    BindEntry, BufferDesc, Device, FrameSubmission, GpuBindGroup, GpuBuffer, GpuLayout,
    GpuPipeline, GpuSampler, GpuShader, GpuTexture, LayoutEntry, PipelineDesc, ShaderDesc,
    TextureDesc,
};
use crate::error::Result;
use crate::headless::ObjectKind;
use crate::types::{
    IndexFormat, SamplerDesc, ShaderStages, TextureFormat, VertexBufferLayout, VertexFormat,
};

pub(crate) const WGSL: &str = "@vertex fn vs_main() {} @fragment fn fs_main() {}";

/// Small heaps so tests stay cheap on the headless device.
pub(crate) fn config() -> RenderConfig {
    RenderConfig {
        uniform_heap_size: 64 << 10,
        attribute_heap_size: 256 << 10,
        vertex_heap_size: 256 << 10,
        index_heap_size: 64 << 10,
        max_heaps_per_pool: 4,
        max_allocations_per_heap: 256,
        uniform_alignment: 256,
        dynamic_arena_size: 64 << 10,
        dynamic_block_size: 256,
        initial_registry_capacity: 16,
    }
}

pub(crate) struct Fixture {
    pub scene: Scene,
    pub pass: RenderPass,
    pub color: TextureKey,
    pub albedo: TextureKey,
    pub globals: BufferKey,
    pub positions: BufferKey,
    pub indices: BufferKey,
}

impl Fixture {
    pub fn new() -> Self {
        let mut scene = Scene::with_capacity(config().initial_registry_capacity);
        let color = scene.add_texture(Texture::attachment(
            "color",
            64,
            64,
            TextureFormat::Rgba8UnormSrgb,
        ));
        let depth = scene.add_texture(Texture::attachment(
            "depth",
            64,
            64,
            TextureFormat::Depth32Float,
        ));
        let albedo = scene.add_texture(Texture::new_2d("albedo", 16, 16, TextureFormat::Rgba8Unorm));
        let globals = scene.add_buffer(Buffer::uniform("globals", &[0.0f32; 16]));
        let pass_bindings = scene.add_bindings(Bindings::new("pass").with(
            0,
            "globals",
            ShaderStages::VERTEX_FRAGMENT,
            BindingResource::Uniform(globals),
        ));
        let positions = scene.add_buffer(Buffer::from_pod(
            "positions",
            BufferKind::Attribute,
            &[[0.0f32; 3]; 8],
        ));
        let indices = scene.add_buffer(Buffer::from_pod(
            "indices",
            BufferKind::Index(IndexFormat::Uint16),
            &[0u16, 1, 2, 2, 3, 0, 4, 5, 6, 6, 7, 4],
        ));
        let pass = RenderPass {
            label: "main".into(),
            bindings: pass_bindings,
            target: RenderTarget {
                color: vec![ColorAttachment::clear(color, [0.0, 0.0, 0.0, 1.0])],
                depth: Some(DepthAttachment::clear(depth, 1.0)),
            },
        };
        Self {
            scene,
            pass,
            color,
            albedo,
            globals,
            positions,
            indices,
        }
    }

    /// A material with its own shader, sampling `texture`.
    pub fn material(&mut self, label: &str, texture: TextureKey) -> MaterialKey {
        let source = format!("// {label}\n{WGSL}");
        self.material_with_shader(label, Shader::new(label, source), texture)
    }

    pub fn material_with_shader(
        &mut self,
        label: &str,
        shader: Shader,
        texture: TextureKey,
    ) -> MaterialKey {
        let bindings = self.scene.add_bindings(
            Bindings::new(label)
                .with(0, "albedo", ShaderStages::FRAGMENT, BindingResource::Texture(texture))
                .with(
                    1,
                    "albedo_sampler",
                    ShaderStages::FRAGMENT,
                    BindingResource::Sampler(SamplerDesc::default()),
                ),
        );
        self.scene
            .add_material(Material::new(label, shader, bindings))
    }

    /// An indexed mesh over the shared streams drawing the first `count`
    /// indices.
    pub fn mesh(&mut self, label: &str, count: u32) -> GeometryKey {
        let mut geometry = Geometry::new(label)
            .with_stream(
                self.positions,
                VertexBufferLayout::single(VertexFormat::Float32x3, 0),
            )
            .with_index(self.indices);
        geometry.set_range(Some(0..count));
        self.scene.add_geometry(geometry)
    }

    /// A second sampled texture, for materials that must not share a set.
    pub fn texture(&mut self, label: &str) -> TextureKey {
        self.scene
            .add_texture(Texture::new_2d(label, 8, 8, TextureFormat::Rgba8Unorm))
    }
}

/// A device that hands a destroyed object's id to the next creation of the
/// same kind, the way slot-based backends do.
#[derive(Debug, Default)]
pub(crate) struct ReusingDevice {
    objects: HashMap<ObjectKind, Registry<()>>,
    pub bind_groups_created: u32,
}

impl ReusingDevice {
    fn create(&mut self, kind: ObjectKind) -> u32 {
        self.objects.entry(kind).or_default().insert(()).index()
    }

    fn destroy(&mut self, kind: ObjectKind, id: u32) {
        if let Some(objects) = self.objects.get_mut(&kind) {
            objects.remove_at(id);
        }
    }
}

impl Device for ReusingDevice {
    fn create_buffer(&mut self, _desc: &BufferDesc<'_>) -> GpuBuffer {
        GpuBuffer(self.create(ObjectKind::Buffer))
    }

    fn write_buffer(&mut self, _buffer: GpuBuffer, _offset: u64, _data: &[u8]) {}

    fn destroy_buffer(&mut self, buffer: GpuBuffer) {
        self.destroy(ObjectKind::Buffer, buffer.0);
    }

    fn create_texture(&mut self, _desc: &TextureDesc<'_>) -> GpuTexture {
        GpuTexture(self.create(ObjectKind::Texture))
    }

    fn write_texture(&mut self, _texture: GpuTexture, _mip_level: u32, _data: &[u8]) {}

    fn destroy_texture(&mut self, texture: GpuTexture) {
        self.destroy(ObjectKind::Texture, texture.0);
    }

    fn create_sampler(&mut self, _desc: &SamplerDesc) -> GpuSampler {
        GpuSampler(self.create(ObjectKind::Sampler))
    }

    fn destroy_sampler(&mut self, sampler: GpuSampler) {
        self.destroy(ObjectKind::Sampler, sampler.0);
    }

    fn create_shader(&mut self, _desc: &ShaderDesc<'_>) -> GpuShader {
        GpuShader(self.create(ObjectKind::Shader))
    }

    fn destroy_shader(&mut self, shader: GpuShader) {
        self.destroy(ObjectKind::Shader, shader.0);
    }

    fn create_layout(&mut self, _entries: &[LayoutEntry]) -> GpuLayout {
        GpuLayout(self.create(ObjectKind::Layout))
    }

    fn destroy_layout(&mut self, layout: GpuLayout) {
        self.destroy(ObjectKind::Layout, layout.0);
    }

    fn create_bind_group(&mut self, _layout: GpuLayout, _entries: &[BindEntry]) -> GpuBindGroup {
        self.bind_groups_created += 1;
        GpuBindGroup(self.create(ObjectKind::BindGroup))
    }

    fn destroy_bind_group(&mut self, group: GpuBindGroup) {
        self.destroy(ObjectKind::BindGroup, group.0);
    }

    fn create_pipeline(&mut self, _desc: &PipelineDesc<'_>) -> GpuPipeline {
        GpuPipeline(self.create(ObjectKind::Pipeline))
    }

    fn destroy_pipeline(&mut self, pipeline: GpuPipeline) {
        self.destroy(ObjectKind::Pipeline, pipeline.0);
    }

    fn submit(&mut self, _frame: &FrameSubmission<'_>) -> Result<()> {
        Ok(())
    }
}
