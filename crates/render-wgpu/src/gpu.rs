//! [`Device`] implementation over a wgpu device and queue.
//!
//! Ids handed to the core are slot indices into one registry per object
//! kind. The core destroys an id before it can be reused, so slot reuse never
//! aliases a live object.

use std::num::NonZeroU64;

use tessera_common::Registry;
use tessera_render::RenderError;
use tessera_render::device::{
    BindEntry, BindResource, BufferDesc, Device, FrameSubmission, GpuBindGroup, GpuBuffer,
    GpuLayout, GpuPipeline, GpuSampler, GpuShader, GpuTexture, LayoutEntry, PipelineDesc,
    ShaderDesc, TextureDesc,
};
use tessera_render::stream::{
    BIND_GROUP_SLOTS, DrawStreamDecoder, StreamFields, VERTEX_BUFFER_SLOTS,
};
use tessera_render::types::{SamplerDesc, TextureFormat};

use crate::convert;
use crate::error::WgpuError;

/// Id returned when a creation references objects that are not live.
const INVALID: u32 = u32::MAX;

struct TextureEntry {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: TextureFormat,
    width: u32,
    height: u32,
    layers: u32,
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    buffers: Registry<wgpu::Buffer>,
    textures: Registry<TextureEntry>,
    samplers: Registry<wgpu::Sampler>,
    shaders: Registry<wgpu::ShaderModule>,
    layouts: Registry<wgpu::BindGroupLayout>,
    bind_groups: Registry<wgpu::BindGroup>,
    pipelines: Registry<wgpu::RenderPipeline>,
    submitted: u64,
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            buffers: Registry::new(),
            textures: Registry::new(),
            samplers: Registry::new(),
            shaders: Registry::new(),
            layouts: Registry::new(),
            bind_groups: Registry::new(),
            pipelines: Registry::new(),
            submitted: 0,
        }
    }

    /// Open the preferred adapter without a surface.
    pub fn headless() -> Result<Self, WgpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(WgpuError::NoAdapter)?;

        let info = adapter.get_info();
        tracing::info!(
            adapter = %info.name,
            backend = ?info.backend,
            "opened headless adapter"
        );

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("tessera"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))?;
        Ok(Self::new(device, queue))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// View of a texture the core created, for presenting or read-back.
    pub fn texture_view(&self, texture: GpuTexture) -> Option<&wgpu::TextureView> {
        self.textures.get_at(texture.0).map(|entry| &entry.view)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Block until every submitted frame has finished on the GPU.
    pub fn wait_idle(&self) {
        if !self.device.poll(wgpu::Maintain::Wait).is_queue_empty() {
            tracing::debug!("queue still busy after wait");
        }
    }

    pub fn live_objects(&self) -> usize {
        self.buffers.len()
            + self.textures.len()
            + self.samplers.len()
            + self.shaders.len()
            + self.layouts.len()
            + self.bind_groups.len()
            + self.pipelines.len()
    }

    fn attachment(
        &self,
        label: &str,
        texture: GpuTexture,
    ) -> Result<&wgpu::TextureView, RenderError> {
        self.texture_view(texture).ok_or_else(|| RenderError::Device {
            label: label.to_owned(),
            reason: format!("attachment texture {} is not live", texture.0),
        })
    }

    /// First object a stream references that is not live, checked before
    /// anything is encoded.
    fn unresolved(&self, words: &[u32]) -> Option<String> {
        for (index, draw) in DrawStreamDecoder::new(words).enumerate() {
            let state = &draw.state;
            match state.pipeline() {
                None => return Some(format!("draw {index} has no pipeline")),
                Some(pipeline) if self.pipelines.get_at(pipeline.0).is_none() => {
                    return Some(format!("draw {index}: pipeline {} is not live", pipeline.0));
                }
                Some(_) => {}
            }
            for slot in 0..BIND_GROUP_SLOTS {
                if let Some(group) = state.bind_group(slot) {
                    if self.bind_groups.get_at(group.0).is_none() {
                        return Some(format!("draw {index}: bind group {} is not live", group.0));
                    }
                }
            }
            let buffers = (0..VERTEX_BUFFER_SLOTS)
                .filter_map(|slot| state.vertex_buffer(slot))
                .chain(state.index_buffer().map(|(buffer, _)| (buffer, 0)));
            for (buffer, _) in buffers {
                if self.buffers.get_at(buffer.0).is_none() {
                    return Some(format!("draw {index}: buffer {} is not live", buffer.0));
                }
            }
        }
        None
    }

    /// Replay a decoded stream into an open pass. Every referenced object
    /// has been checked by [`WgpuDevice::unresolved`].
    fn replay(&self, pass: &mut wgpu::RenderPass<'_>, words: &[u32]) -> u32 {
        let mut draws = 0;
        for draw in DrawStreamDecoder::new(words) {
            let state = &draw.state;
            let changed = draw.changed;

            if changed.contains(StreamFields::PIPELINE) {
                if let Some(pipeline) = state.pipeline().and_then(|p| self.pipelines.get_at(p.0)) {
                    pass.set_pipeline(pipeline);
                }
            }

            for slot in 0..BIND_GROUP_SLOTS {
                let mut fields = StreamFields::bind_group(slot);
                if slot == BIND_GROUP_SLOTS - 1 {
                    fields |= StreamFields::DYNAMIC_OFFSET;
                }
                if !changed.intersects(fields) {
                    continue;
                }
                let Some(group) = state
                    .bind_group(slot)
                    .and_then(|g| self.bind_groups.get_at(g.0))
                else {
                    continue;
                };
                let dynamic = state.dynamic_offset();
                let offsets = match dynamic.as_ref() {
                    Some(offset) if slot == BIND_GROUP_SLOTS - 1 => std::slice::from_ref(offset),
                    _ => &[],
                };
                pass.set_bind_group(slot as u32, group, offsets);
            }

            for slot in 0..VERTEX_BUFFER_SLOTS {
                let fields = StreamFields::vertex_buffer(slot) | StreamFields::vertex_offset(slot);
                if !changed.intersects(fields) {
                    continue;
                }
                if let Some((buffer, offset)) = state.vertex_buffer(slot) {
                    if let Some(buffer) = self.buffers.get_at(buffer.0) {
                        pass.set_vertex_buffer(slot as u32, buffer.slice(u64::from(offset)..));
                    }
                }
            }

            if changed.intersects(StreamFields::INDEX_BUFFER | StreamFields::INDEX_FORMAT) {
                if let Some((buffer, format)) = state.index_buffer() {
                    if let Some(buffer) = self.buffers.get_at(buffer.0) {
                        pass.set_index_buffer(buffer.slice(..), convert::index_format(format));
                    }
                }
            }

            let count = state.draw_count();
            let first_instance = state.first_instance();
            let instances = first_instance..first_instance + state.instance_count();
            match state.first_index() {
                Some(first) => {
                    pass.draw_indexed(first..first + count, state.base_vertex(), instances);
                }
                _ => {
                    let first = state.first_vertex();
                    pass.draw(first..first + count, instances);
                }
            }
            draws += 1;
        }
        draws
    }
}

impl Device for WgpuDevice {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> GpuBuffer {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: desc.size,
            usage: convert::buffer_usages(desc.usage),
            mapped_at_creation: false,
        });
        GpuBuffer(self.buffers.insert(buffer).index())
    }

    fn write_buffer(&mut self, buffer: GpuBuffer, offset: u64, data: &[u8]) {
        match self.buffers.get_at(buffer.0) {
            Some(target) => self.queue.write_buffer(target, offset, data),
            None => tracing::warn!(buffer = buffer.0, "write to unknown buffer dropped"),
        }
    }

    fn destroy_buffer(&mut self, buffer: GpuBuffer) {
        if let Some(buffer) = self.buffers.remove_at(buffer.0) {
            buffer.destroy();
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> GpuTexture {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.depth_or_layers,
            },
            mip_level_count: desc.mip_level_count,
            sample_count: desc.sample_count,
            dimension: wgpu::TextureDimension::D2,
            format: convert::texture_format(desc.format),
            usage: convert::texture_usages(desc.usage),
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let entry = TextureEntry {
            texture,
            view,
            format: desc.format,
            width: desc.width,
            height: desc.height,
            layers: desc.depth_or_layers,
        };
        GpuTexture(self.textures.insert(entry).index())
    }

    fn write_texture(&mut self, texture: GpuTexture, mip_level: u32, data: &[u8]) {
        let Some(entry) = self.textures.get_at(texture.0) else {
            tracing::warn!(texture = texture.0, "upload to unknown texture dropped");
            return;
        };
        let Some(texel) = entry.format.bytes_per_texel() else {
            tracing::warn!(format = ?entry.format, "format has no upload layout");
            return;
        };
        let width = (entry.width >> mip_level).max(1);
        let height = (entry.height >> mip_level).max(1);
        let bytes_per_row = width * texel;
        let expected = bytes_per_row as usize * height as usize * entry.layers as usize;
        if data.len() < expected {
            tracing::warn!(
                texture = texture.0,
                mip_level,
                expected,
                got = data.len(),
                "short texture upload dropped"
            );
            return;
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &entry.texture,
                mip_level,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &data[..expected],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: entry.layers,
            },
        );
    }

    fn destroy_texture(&mut self, texture: GpuTexture) {
        if let Some(entry) = self.textures.remove_at(texture.0) {
            entry.texture.destroy();
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> GpuSampler {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("tessera sampler"),
            address_mode_u: convert::address(desc.address_u),
            address_mode_v: convert::address(desc.address_v),
            address_mode_w: convert::address(desc.address_w),
            mag_filter: convert::filter(desc.mag_filter),
            min_filter: convert::filter(desc.min_filter),
            mipmap_filter: convert::filter(desc.mipmap_filter),
            compare: desc.compare.map(convert::compare),
            ..Default::default()
        });
        GpuSampler(self.samplers.insert(sampler).index())
    }

    fn destroy_sampler(&mut self, sampler: GpuSampler) {
        self.samplers.remove_at(sampler.0);
    }

    fn create_shader(&mut self, desc: &ShaderDesc<'_>) -> GpuShader {
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(desc.label),
                source: wgpu::ShaderSource::Wgsl(desc.source.into()),
            });
        GpuShader(self.shaders.insert(module).index())
    }

    fn destroy_shader(&mut self, shader: GpuShader) {
        self.shaders.remove_at(shader.0);
    }

    fn create_layout(&mut self, entries: &[LayoutEntry]) -> GpuLayout {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = entries
            .iter()
            .map(|entry| wgpu::BindGroupLayoutEntry {
                binding: entry.binding,
                visibility: convert::shader_stages(entry.visibility),
                ty: convert::binding_type(entry.ty),
                count: None,
            })
            .collect();
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("tessera layout"),
                entries: &entries,
            });
        GpuLayout(self.layouts.insert(layout).index())
    }

    fn destroy_layout(&mut self, layout: GpuLayout) {
        self.layouts.remove_at(layout.0);
    }

    fn create_bind_group(&mut self, layout: GpuLayout, entries: &[BindEntry]) -> GpuBindGroup {
        let Some(wgpu_layout) = self.layouts.get_at(layout.0) else {
            tracing::error!(layout = layout.0, "bind group against unknown layout");
            return GpuBindGroup(INVALID);
        };

        let mut resolved = Vec::with_capacity(entries.len());
        for entry in entries {
            let resource = match entry.resource {
                BindResource::Buffer {
                    buffer,
                    offset,
                    size,
                } => self.buffers.get_at(buffer.0).map(|buffer| {
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset,
                        size: NonZeroU64::new(size),
                    })
                }),
                BindResource::Texture(texture) => self
                    .texture_view(texture)
                    .map(wgpu::BindingResource::TextureView),
                BindResource::Sampler(sampler) => self
                    .samplers
                    .get_at(sampler.0)
                    .map(wgpu::BindingResource::Sampler),
            };
            let Some(resource) = resource else {
                tracing::error!(binding = entry.binding, "bind group entry is not live");
                return GpuBindGroup(INVALID);
            };
            resolved.push(wgpu::BindGroupEntry {
                binding: entry.binding,
                resource,
            });
        }

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("tessera bind group"),
            layout: wgpu_layout,
            entries: &resolved,
        });
        GpuBindGroup(self.bind_groups.insert(group).index())
    }

    fn destroy_bind_group(&mut self, group: GpuBindGroup) {
        self.bind_groups.remove_at(group.0);
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> GpuPipeline {
        let Some(module) = self.shaders.get_at(desc.shader.0) else {
            tracing::error!(label = desc.label, "pipeline against unknown shader");
            return GpuPipeline(INVALID);
        };
        let mut layouts = Vec::with_capacity(desc.layouts.len());
        for layout in desc.layouts {
            match self.layouts.get_at(layout.0) {
                Some(layout) => layouts.push(layout),
                None => {
                    tracing::error!(label = desc.label, "pipeline against unknown layout");
                    return GpuPipeline(INVALID);
                }
            }
        }
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &layouts,
                push_constant_ranges: &[],
            });

        let attributes: Vec<Vec<wgpu::VertexAttribute>> = desc
            .vertex_buffers
            .iter()
            .map(|stream| {
                stream
                    .attributes
                    .iter()
                    .map(|attr| wgpu::VertexAttribute {
                        format: convert::vertex_format(attr.format),
                        offset: u64::from(attr.offset),
                        shader_location: attr.location,
                    })
                    .collect()
            })
            .collect();
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = desc
            .vertex_buffers
            .iter()
            .zip(&attributes)
            .map(|(stream, attributes)| wgpu::VertexBufferLayout {
                array_stride: u64::from(stream.stride),
                step_mode: convert::step_mode(stream.step),
                attributes,
            })
            .collect();
        let targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_formats
            .iter()
            .map(|&format| {
                Some(wgpu::ColorTargetState {
                    format: convert::texture_format(format),
                    blend: convert::blend_state(desc.state.blend),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some(desc.vertex_entry),
                    buffers: &vertex_buffers,
                    compilation_options: Default::default(),
                },
                fragment: desc.fragment_entry.map(|entry| wgpu::FragmentState {
                    module,
                    entry_point: Some(entry),
                    targets: &targets,
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: convert::topology(desc.state.topology),
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: convert::cull_mode(desc.state.cull),
                    ..Default::default()
                },
                depth_stencil: desc.depth_format.map(|format| wgpu::DepthStencilState {
                    format: convert::texture_format(format),
                    depth_write_enabled: desc.state.depth.write,
                    depth_compare: convert::compare(desc.state.depth.compare),
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState {
                    count: desc.sample_count,
                    ..Default::default()
                },
                multiview: None,
                cache: None,
            });
        tracing::debug!(label = desc.label, "created render pipeline");
        GpuPipeline(self.pipelines.insert(pipeline).index())
    }

    fn destroy_pipeline(&mut self, pipeline: GpuPipeline) {
        self.pipelines.remove_at(pipeline.0);
    }

    fn submit(&mut self, frame: &FrameSubmission<'_>) -> tessera_render::Result<()> {
        if let Some(reason) = self.unresolved(frame.stream.words()) {
            return Err(RenderError::Device {
                label: frame.label.to_owned(),
                reason,
            });
        }
        let mut colors = Vec::with_capacity(frame.target.color.len());
        for color in &frame.target.color {
            let view = self.attachment(frame.label, color.view)?;
            let resolve_target = match color.resolve {
                Some(resolve) => Some(self.attachment(frame.label, resolve)?),
                None => None,
            };
            colors.push(Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target,
                ops: wgpu::Operations {
                    load: convert::color_load(color.load, color.clear),
                    store: convert::store(color.store),
                },
            }));
        }
        let depth = match &frame.target.depth {
            Some(depth) => {
                let view = self.attachment(frame.label, depth.view)?;
                Some(wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: convert::depth_load(depth.load, depth.clear),
                        store: convert::store(depth.store),
                    }),
                    stencil_ops: None,
                })
            }
            None => None,
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(frame.label),
            });
        let draws = {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(frame.label),
                color_attachments: &colors,
                depth_stencil_attachment: depth,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            self.replay(&mut pass, frame.stream.words())
        };
        self.queue.submit(Some(encoder.finish()));
        self.submitted += 1;
        tracing::debug!(label = frame.label, draws, "submitted frame");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_render::types::BufferUsages;

    fn device() -> Option<WgpuDevice> {
        match WgpuDevice::headless() {
            Ok(device) => Some(device),
            Err(err) => {
                eprintln!("skipping: {err}");
                None
            }
        }
    }

    #[test]
    fn destroyed_buffer_slot_is_reused() {
        let Some(mut device) = device() else {
            return;
        };
        let desc = BufferDesc {
            label: "uniforms",
            size: 256,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        };
        let first = device.create_buffer(&desc);
        device.write_buffer(first, 0, &[0u8; 16]);
        device.destroy_buffer(first);
        let second = device.create_buffer(&desc);
        assert_eq!(first, second);
        assert_eq!(device.live_objects(), 1);
    }

    #[test]
    fn stream_with_dead_pipeline_is_rejected_before_encoding() {
        let Some(mut device) = device() else {
            return;
        };
        let mut stream = tessera_render::DrawStream::new();
        stream.set_pipeline(GpuPipeline(INVALID));
        stream.set_non_indexed(0, 3);
        stream.draw();
        let err = device
            .submit(&FrameSubmission {
                label: "frame",
                stream: &stream,
                target: &tessera_render::ResolvedTarget::default(),
            })
            .unwrap_err();
        assert!(matches!(err, RenderError::Device { .. }));
        assert_eq!(device.submitted(), 0);
    }

    #[test]
    fn unknown_layout_yields_invalid_group() {
        let Some(mut device) = device() else {
            return;
        };
        let group = device.create_bind_group(GpuLayout(7), &[]);
        assert_eq!(group, GpuBindGroup(INVALID));
        assert_eq!(device.live_objects(), 0);
    }
}
