//! Resolution of scene descriptors to device objects.
//!
//! Each descriptor kind has a side table of cache entries keyed by the
//! descriptor's handle. An entry is reused while the descriptor's version
//! (and, for binding sets, every dependency stamp) is unchanged. Layouts,
//! samplers, shaders and pipelines are shared between entries through
//! reference-counted [`SharedCache`]s keyed by structural hash.

use std::hash::{Hash, Hasher};

use tessera_common::{SecondaryMap, StructuralHasher, structural_hash};

use crate::config::RenderConfig;
use crate::descriptor::{
    Binding, BindingResource, Bindings, BindingsKey, Buffer, BufferKey, BufferKind, GeometryKey,
    MAX_VERTEX_STREAMS, Material, MaterialKey, RenderTarget, Scene, Texture, TextureKey, Version,
};
use crate::device::{
    BindEntry, BindResource, BindingType, BufferDesc, Device, GpuBindGroup, GpuBuffer, GpuLayout,
    GpuPipeline, GpuSampler, GpuShader, GpuTexture, LayoutEntry, PipelineDesc, ResolvedColor,
    ResolvedDepth, ResolvedTarget, ShaderDesc, TextureSampleType,
};
use crate::error::{RenderError, Result};
use crate::pool::{BufferPool, BufferPools, BufferSlice, PoolKind, PoolStats};
use crate::shared::SharedCache;
use crate::types::{
    BufferUsages, IndexFormat, PipelineState, SamplerDesc, TextureFormat, TextureUsages,
    VertexBufferLayout, VertexStepMode, align_up,
};

/// A resolved binding set and the layout it was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundSet {
    pub group: GpuBindGroup,
    pub layout: GpuLayout,
    pub layout_hash: u64,
}

/// Layout of the dynamic uniform group, when a draw uses one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicLayout {
    pub layout: GpuLayout,
    pub hash: u64,
}

/// Everything about the current pass that a pipeline depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct PassState {
    /// The pass's global binding set (group 0).
    pub global: BoundSet,
    /// The dynamic uniform layout (group 2), if the draw uses one.
    pub dynamic: Option<DynamicLayout>,
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub sample_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMaterial {
    pub pipeline: GpuPipeline,
    pub bindings: BoundSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBinding {
    pub buffer: GpuBuffer,
    /// Byte offset of the stream in its heap.
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBinding {
    pub buffer: GpuBuffer,
    pub format: IndexFormat,
}

/// A geometry resolved to pooled buffers and draw parameters.
///
/// For indexed draws `first` is the first index in the heap (the pool offset
/// is folded in); otherwise it is the first vertex of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuGeometry {
    pub vertex_buffers: [Option<VertexBinding>; MAX_VERTEX_STREAMS],
    pub index: Option<IndexBinding>,
    pub first: u32,
    pub count: u32,
    pub base_vertex: i32,
    pub instance_count: u32,
    pub first_instance: u32,
}

/// Formats and sample count of a resolved render target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetFormats {
    pub color: Vec<TextureFormat>,
    pub depth: Option<TextureFormat>,
    pub sample_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub textures_created: u64,
    pub textures_recreated: u64,
    pub buffers_created: u64,
    pub binding_sets_created: u64,
    pub binding_sets_rebuilt: u64,
    pub layouts_created: u64,
    pub samplers_created: u64,
    pub shaders_created: u64,
    pub pipelines_compiled: u64,
    pub pipeline_hits: u64,
}

/// Device objects carry a cache-assigned serial alongside their id. Devices
/// may hand a destroyed object's id to the next creation, so binding-set
/// stamps are built from serials, never from ids.
#[derive(Debug)]
struct TextureEntry {
    version: Version,
    texture: GpuTexture,
    serial: u64,
}

#[derive(Debug)]
struct DedicatedBuffer {
    version: Version,
    buffer: GpuBuffer,
    serial: u64,
}

#[derive(Debug)]
struct BindingSetEntry {
    version: Version,
    layout_hash: u64,
    layout: GpuLayout,
    group: GpuBindGroup,
    stamps: Vec<u64>,
    samplers: Vec<u64>,
}

impl BindingSetEntry {
    fn bound(&self) -> BoundSet {
        BoundSet {
            group: self.group,
            layout: self.layout,
            layout_hash: self.layout_hash,
        }
    }
}

#[derive(Debug)]
struct MaterialEntry {
    version: Version,
    /// Pipelines this material holds a reference on, by key hash.
    pipelines: Vec<(u64, GpuPipeline)>,
}

#[derive(Debug, Clone)]
struct PipelineRecord {
    pipeline: GpuPipeline,
    shader_hash: u64,
    layout_hashes: [u64; 2],
}

#[derive(Hash)]
struct PipelineKey<'a> {
    shader: u64,
    state: PipelineState,
    layouts: [u64; 2],
    dynamic_layout: Option<u64>,
    vertex: u64,
    color_formats: &'a [TextureFormat],
    depth_format: Option<TextureFormat>,
    sample_count: u32,
}

enum PendingResource {
    Ready(BindResource),
    Sampler(SamplerDesc, u64),
}

struct ResolvedBinding {
    layout: LayoutEntry,
    resource: PendingResource,
    stamp: u64,
}

#[derive(Debug)]
pub struct ResourceCache {
    pools: BufferPools,
    textures: SecondaryMap<Texture, TextureEntry>,
    buffers: SecondaryMap<Buffer, DedicatedBuffer>,
    sets: SecondaryMap<Bindings, BindingSetEntry>,
    materials: SecondaryMap<Material, MaterialEntry>,
    layouts: SharedCache<GpuLayout>,
    samplers: SharedCache<GpuSampler>,
    shaders: SharedCache<GpuShader>,
    pipelines: SharedCache<PipelineRecord>,
    next_serial: u64,
    stats: CacheStats,
}

impl ResourceCache {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            pools: BufferPools::new(config),
            textures: SecondaryMap::new(),
            buffers: SecondaryMap::new(),
            sets: SecondaryMap::new(),
            materials: SecondaryMap::new(),
            layouts: SharedCache::new(),
            samplers: SharedCache::new(),
            shaders: SharedCache::new(),
            pipelines: SharedCache::new(),
            next_serial: 0,
            stats: CacheStats::default(),
        }
    }

    // --- Textures ---

    /// The device texture for `key`, recreated when the descriptor's version
    /// has moved on.
    pub fn get_texture<D: Device>(
        &mut self,
        device: &mut D,
        scene: &Scene,
        key: TextureKey,
    ) -> Result<GpuTexture> {
        let texture = scene.texture(key).ok_or(RenderError::StaleHandle("texture"))?;
        match self.textures.get_mut(key) {
            Some(entry) if entry.version == texture.version() => Ok(entry.texture),
            Some(entry) => {
                device.destroy_texture(entry.texture);
                entry.texture = device.create_texture(&texture.desc());
                entry.version = texture.version();
                self.next_serial += 1;
                entry.serial = self.next_serial;
                self.stats.textures_recreated += 1;
                tracing::debug!(
                    label = texture.label(),
                    width = texture.width(),
                    height = texture.height(),
                    "recreated texture"
                );
                Ok(entry.texture)
            }
            None => {
                let gpu = device.create_texture(&texture.desc());
                self.next_serial += 1;
                let entry = TextureEntry {
                    version: texture.version(),
                    texture: gpu,
                    serial: self.next_serial,
                };
                if let Some(stale) = self.textures.insert(key, entry) {
                    device.destroy_texture(stale.texture);
                }
                self.stats.textures_created += 1;
                Ok(gpu)
            }
        }
    }

    fn texture_serial(&self, key: TextureKey) -> u64 {
        self.textures.get(key).map_or(0, |entry| entry.serial)
    }

    // --- Buffers ---

    fn buffer_serial(&self, key: BufferKey) -> u64 {
        self.buffers.get(key).map_or(0, |entry| entry.serial)
    }

    /// A dedicated device buffer for a uniform or storage buffer bound whole.
    pub fn get_buffer<D: Device>(
        &mut self,
        device: &mut D,
        scene: &mut Scene,
        key: BufferKey,
    ) -> Result<GpuBuffer> {
        let buffer = scene.buffer_mut(key).ok_or(RenderError::StaleHandle("buffer"))?;
        let usage = match buffer.kind() {
            BufferKind::Storage { .. } => BufferUsages::STORAGE,
            BufferKind::Uniform => BufferUsages::UNIFORM,
            _ => {
                return Err(RenderError::WrongBufferKind {
                    label: buffer.label().to_owned(),
                    expected: "a uniform or storage binding",
                });
            }
        };

        let current = self
            .buffers
            .get(key)
            .is_some_and(|e| e.version == buffer.version());
        if !current {
            if let Some(old) = self.buffers.remove(key) {
                device.destroy_buffer(old.buffer);
            }
            let gpu = device.create_buffer(&BufferDesc {
                label: buffer.label(),
                size: u64::from(align_up(buffer.len().max(4), 4)),
                usage: usage | BufferUsages::COPY_DST,
            });
            self.next_serial += 1;
            let entry = DedicatedBuffer {
                version: buffer.version(),
                buffer: gpu,
                serial: self.next_serial,
            };
            if let Some(stale) = self.buffers.insert(key, entry) {
                device.destroy_buffer(stale.buffer);
            }
            self.stats.buffers_created += 1;
            buffer.mark_all_dirty();
        }

        let gpu = self
            .buffers
            .get(key)
            .map(|e| e.buffer)
            .ok_or(RenderError::StaleHandle("buffer"))?;
        if let Some(range) = buffer.take_dirty() {
            let start = range.start & !3;
            let end = align_up(range.end, 4);
            let data = buffer.data();
            let mut bytes = data[start as usize..(end as usize).min(data.len())].to_vec();
            bytes.resize((end - start) as usize, 0);
            device.write_buffer(gpu, u64::from(start), &bytes);
        }
        Ok(gpu)
    }

    pub fn get_uniform<D: Device>(
        &mut self,
        device: &mut D,
        scene: &mut Scene,
        key: BufferKey,
    ) -> Result<BufferSlice> {
        Self::pooled(&mut self.pools.uniform, device, scene, key)
    }

    pub fn get_attribute<D: Device>(
        &mut self,
        device: &mut D,
        scene: &mut Scene,
        key: BufferKey,
    ) -> Result<BufferSlice> {
        Self::pooled(&mut self.pools.attribute, device, scene, key)
    }

    pub fn get_vertex<D: Device>(
        &mut self,
        device: &mut D,
        scene: &mut Scene,
        key: BufferKey,
    ) -> Result<BufferSlice> {
        Self::pooled(&mut self.pools.vertex, device, scene, key)
    }

    pub fn get_index<D: Device>(
        &mut self,
        device: &mut D,
        scene: &mut Scene,
        key: BufferKey,
    ) -> Result<BufferSlice> {
        Self::pooled(&mut self.pools.index, device, scene, key)
    }

    fn pooled<D: Device>(
        pool: &mut BufferPool,
        device: &mut D,
        scene: &mut Scene,
        key: BufferKey,
    ) -> Result<BufferSlice> {
        let buffer = scene.buffer_mut(key).ok_or(RenderError::StaleHandle("buffer"))?;
        pool.get(device, key, buffer)
    }

    // --- Samplers ---

    /// Take a reference on the shared sampler for `desc`. Pair with
    /// [`release_sampler`](Self::release_sampler).
    pub fn get_sampler<D: Device>(&mut self, device: &mut D, desc: &SamplerDesc) -> GpuSampler {
        let hash = structural_hash(desc);
        let stats = &mut self.stats;
        self.samplers.acquire(hash, || {
            stats.samplers_created += 1;
            device.create_sampler(desc)
        })
    }

    pub fn release_sampler<D: Device>(&mut self, device: &mut D, desc: &SamplerDesc) {
        if let Some(sampler) = self.samplers.release(structural_hash(desc)) {
            device.destroy_sampler(sampler);
        }
    }

    // --- Binding sets ---

    /// Resolve a binding set, rebuilding its bind group when the descriptor
    /// or any resource it references has changed.
    pub fn get_binding_set<D: Device>(
        &mut self,
        device: &mut D,
        scene: &mut Scene,
        key: BindingsKey,
    ) -> Result<BoundSet> {
        let bindings = scene.bindings(key).ok_or(RenderError::StaleHandle("bindings"))?;
        let label = bindings.label().to_owned();
        let version = bindings.version();
        let mut entries = bindings.entries().to_vec();
        entries.sort_by_key(|b| b.slot);
        if let Some(pair) = entries.windows(2).find(|w| w[0].slot == w[1].slot) {
            return Err(RenderError::InvalidBinding {
                label,
                slot: pair[0].slot,
                reason: "duplicate binding slot",
            });
        }

        let mut resolved = Vec::with_capacity(entries.len());
        for binding in &entries {
            resolved.push(self.resolve_binding(device, scene, &label, binding)?);
        }
        let shape: Vec<LayoutEntry> = resolved.iter().map(|r| r.layout).collect();
        let layout_hash = structural_hash(&shape);
        let stamps: Vec<u64> = resolved.iter().map(|r| r.stamp).collect();

        if let Some(entry) = self.sets.get(key) {
            if entry.version == version
                && entry.layout_hash == layout_hash
                && entry.stamps == stamps
            {
                return Ok(entry.bound());
            }
        }

        // Take the new references before dropping the old ones, so a shared
        // layout never touches zero on a plain rebuild.
        let layout = self.acquire_layout(device, layout_hash, &shape);
        let mut samplers = Vec::new();
        let mut bind_entries = Vec::with_capacity(resolved.len());
        for r in &resolved {
            let resource = match r.resource {
                PendingResource::Ready(resource) => resource,
                PendingResource::Sampler(desc, hash) => {
                    samplers.push(hash);
                    BindResource::Sampler(self.get_sampler(device, &desc))
                }
            };
            bind_entries.push(BindEntry {
                binding: r.layout.binding,
                resource,
            });
        }
        let group = device.create_bind_group(layout, &bind_entries);

        let previous = self.sets.remove(key);
        let rebuilt = previous.is_some();
        if let Some(old) = previous {
            self.release_set(device, old);
        }
        let entry = BindingSetEntry {
            version,
            layout_hash,
            layout,
            group,
            stamps,
            samplers,
        };
        let bound = entry.bound();
        if let Some(stale) = self.sets.insert(key, entry) {
            self.release_set(device, stale);
        }
        if rebuilt {
            self.stats.binding_sets_rebuilt += 1;
        } else {
            self.stats.binding_sets_created += 1;
        }
        tracing::debug!(label = %label, rebuilt, entries = bind_entries.len(), "built binding set");
        Ok(bound)
    }

    fn resolve_binding<D: Device>(
        &mut self,
        device: &mut D,
        scene: &mut Scene,
        label: &str,
        binding: &Binding,
    ) -> Result<ResolvedBinding> {
        let invalid = |reason| RenderError::InvalidBinding {
            label: label.to_owned(),
            slot: binding.slot,
            reason,
        };
        let layout = |ty| LayoutEntry {
            binding: binding.slot,
            visibility: binding.visibility,
            ty,
        };

        match binding.resource {
            BindingResource::Buffer(key) => {
                let buffer = scene.buffer(key).ok_or(RenderError::StaleHandle("buffer"))?;
                if buffer.is_empty() {
                    return Err(invalid("zero-sized buffer"));
                }
                let ty = match buffer.kind() {
                    BufferKind::Storage { read_only } => BindingType::StorageBuffer { read_only },
                    _ => BindingType::UniformBuffer {
                        dynamic: false,
                        min_size: 0,
                    },
                };
                let (size, version) = (align_up(buffer.len(), 4), buffer.version());
                let gpu = self.get_buffer(device, scene, key)?;
                Ok(ResolvedBinding {
                    layout: layout(ty),
                    resource: PendingResource::Ready(BindResource::Buffer {
                        buffer: gpu,
                        offset: 0,
                        size: u64::from(size),
                    }),
                    stamp: structural_hash(&(self.buffer_serial(key), version)),
                })
            }
            BindingResource::Uniform(key) => {
                let buffer = scene.buffer_mut(key).ok_or(RenderError::StaleHandle("buffer"))?;
                if buffer.is_empty() {
                    return Err(invalid("zero-sized buffer"));
                }
                let slice = self.pools.uniform.get(device, key, buffer)?;
                let size = align_up(slice.size, 16);
                Ok(ResolvedBinding {
                    layout: layout(BindingType::UniformBuffer {
                        dynamic: false,
                        min_size: 0,
                    }),
                    resource: PendingResource::Ready(BindResource::Buffer {
                        buffer: slice.buffer,
                        offset: u64::from(slice.offset),
                        size: u64::from(size),
                    }),
                    stamp: structural_hash(&slice),
                })
            }
            BindingResource::Texture(key) => {
                let gpu = self.get_texture(device, scene, key)?;
                let texture = scene.texture(key).ok_or(RenderError::StaleHandle("texture"))?;
                if !texture.usage().contains(TextureUsages::SAMPLED) {
                    return Err(invalid("texture is not created for sampling"));
                }
                let format = texture.format();
                let sample_type = if format.is_depth() {
                    TextureSampleType::Depth
                } else {
                    TextureSampleType::Float {
                        filterable: format.is_filterable(),
                    }
                };
                Ok(ResolvedBinding {
                    layout: layout(BindingType::Texture {
                        sample_type,
                        multisampled: texture.sample_count() > 1,
                    }),
                    resource: PendingResource::Ready(BindResource::Texture(gpu)),
                    stamp: structural_hash(&(self.texture_serial(key), texture.version())),
                })
            }
            BindingResource::Sampler(desc) => {
                let hash = structural_hash(&desc);
                Ok(ResolvedBinding {
                    layout: layout(BindingType::Sampler {
                        filtering: desc.is_filtering(),
                        comparison: desc.compare.is_some(),
                    }),
                    resource: PendingResource::Sampler(desc, hash),
                    stamp: hash,
                })
            }
        }
    }

    fn acquire_layout<D: Device>(
        &mut self,
        device: &mut D,
        hash: u64,
        shape: &[LayoutEntry],
    ) -> GpuLayout {
        let stats = &mut self.stats;
        self.layouts.acquire(hash, || {
            stats.layouts_created += 1;
            device.create_layout(shape)
        })
    }

    fn release_layout<D: Device>(&mut self, device: &mut D, hash: u64) {
        if let Some(layout) = self.layouts.release(hash) {
            device.destroy_layout(layout);
        }
    }

    fn release_set<D: Device>(&mut self, device: &mut D, entry: BindingSetEntry) {
        device.destroy_bind_group(entry.group);
        for hash in entry.samplers {
            if let Some(sampler) = self.samplers.release(hash) {
                device.destroy_sampler(sampler);
            }
        }
        self.release_layout(device, entry.layout_hash);
    }

    // --- Pipelines ---

    /// The pipeline for drawing `geometry` with `material` in a pass.
    pub fn get_pipeline<D: Device>(
        &mut self,
        device: &mut D,
        scene: &mut Scene,
        material: MaterialKey,
        geometry: GeometryKey,
        pass: &PassState,
    ) -> Result<GpuPipeline> {
        self.resolve_material(device, scene, material, geometry, pass)
            .map(|m| m.pipeline)
    }

    /// Resolve a material's binding set and pipeline together.
    pub fn resolve_material<D: Device>(
        &mut self,
        device: &mut D,
        scene: &mut Scene,
        material: MaterialKey,
        geometry: GeometryKey,
        pass: &PassState,
    ) -> Result<ResolvedMaterial> {
        let bindings_key = scene
            .material(material)
            .ok_or(RenderError::StaleHandle("material"))?
            .bindings();
        let set = self.get_binding_set(device, scene, bindings_key)?;

        let desc = scene.material(material).ok_or(RenderError::StaleHandle("material"))?;
        let geometry_desc = scene.geometry(geometry).ok_or(RenderError::StaleHandle("geometry"))?;
        let mut vertex = StructuralHasher::new();
        for layout in geometry_desc.vertex_layouts() {
            layout.hash(&mut vertex);
        }
        let shader_hash = desc.shader().content_hash();
        let layout_hashes = [pass.global.layout_hash, set.layout_hash];
        let key_hash = structural_hash(&PipelineKey {
            shader: shader_hash,
            state: desc.state(),
            layouts: layout_hashes,
            dynamic_layout: pass.dynamic.map(|d| d.hash),
            vertex: vertex.finish(),
            color_formats: &pass.color_formats,
            depth_format: pass.depth_format,
            sample_count: pass.sample_count,
        });

        let outdated = self
            .materials
            .get(material)
            .is_some_and(|e| e.version != desc.version());
        if outdated {
            if let Some(old) = self.materials.remove(material) {
                for (hash, _) in old.pipelines {
                    self.release_pipeline(device, hash);
                }
            }
        }
        let memoised = self
            .materials
            .get(material)
            .and_then(|e| e.pipelines.iter().find(|(h, _)| *h == key_hash))
            .map(|&(_, p)| p);
        if let Some(pipeline) = memoised {
            self.stats.pipeline_hits += 1;
            return Ok(ResolvedMaterial {
                pipeline,
                bindings: set,
            });
        }

        let pipeline = match self.pipelines.retain(key_hash) {
            Some(record) => record.pipeline,
            None => {
                let shader = desc.shader();
                let stats = &mut self.stats;
                let gpu_shader = self.shaders.acquire(shader_hash, || {
                    stats.shaders_created += 1;
                    device.create_shader(&ShaderDesc {
                        label: &shader.label,
                        source: &shader.source,
                    })
                });
                for hash in layout_hashes {
                    self.layouts.retain(hash);
                }
                let mut layouts = vec![pass.global.layout, set.layout];
                if let Some(dynamic) = pass.dynamic {
                    layouts.push(dynamic.layout);
                }
                let vertex_buffers: Vec<VertexBufferLayout> =
                    geometry_desc.vertex_layouts().cloned().collect();
                let pipeline = device.create_pipeline(&PipelineDesc {
                    label: desc.label(),
                    shader: gpu_shader,
                    vertex_entry: &shader.vertex_entry,
                    fragment_entry: shader.fragment_entry.as_deref(),
                    layouts: &layouts,
                    vertex_buffers: &vertex_buffers,
                    state: desc.state(),
                    color_formats: &pass.color_formats,
                    depth_format: pass.depth_format,
                    sample_count: pass.sample_count,
                });
                self.stats.pipelines_compiled += 1;
                tracing::debug!(material = desc.label(), key = key_hash, "compiled pipeline");
                let record = PipelineRecord {
                    pipeline,
                    shader_hash,
                    layout_hashes,
                };
                self.pipelines.insert(key_hash, record);
                pipeline
            }
        };

        let version = desc.version();
        if !self.materials.contains(material) {
            let fresh = MaterialEntry {
                version,
                pipelines: Vec::new(),
            };
            if let Some(stale) = self.materials.insert(material, fresh) {
                for (hash, _) in stale.pipelines {
                    self.release_pipeline(device, hash);
                }
            }
        }
        if let Some(entry) = self.materials.get_mut(material) {
            entry.pipelines.push((key_hash, pipeline));
        }
        Ok(ResolvedMaterial {
            pipeline,
            bindings: set,
        })
    }

    fn release_pipeline<D: Device>(&mut self, device: &mut D, hash: u64) {
        let Some(record) = self.pipelines.release(hash) else {
            return;
        };
        device.destroy_pipeline(record.pipeline);
        if let Some(shader) = self.shaders.release(record.shader_hash) {
            device.destroy_shader(shader);
        }
        for layout in record.layout_hashes {
            self.release_layout(device, layout);
        }
        tracing::debug!(key = hash, "released pipeline");
    }

    // --- Geometry and targets ---

    /// Resolve vertex streams and the index buffer through the pools.
    pub fn get_geometry<D: Device>(
        &mut self,
        device: &mut D,
        scene: &mut Scene,
        key: GeometryKey,
    ) -> Result<GpuGeometry> {
        let geometry = scene.geometry(key).ok_or(RenderError::StaleHandle("geometry"))?;
        let count = geometry.streams().len();
        if count > MAX_VERTEX_STREAMS {
            return Err(RenderError::TooManyVertexStreams {
                label: geometry.label().to_owned(),
                count,
                max: MAX_VERTEX_STREAMS,
            });
        }
        let mut streams = [None; MAX_VERTEX_STREAMS];
        for (slot, stream) in geometry.streams().iter().enumerate() {
            streams[slot] = Some((stream.buffer, stream.layout.stride, stream.layout.step));
        }
        let index_key = geometry.index();
        let range = geometry.range();
        let mut resolved = GpuGeometry {
            vertex_buffers: [None; MAX_VERTEX_STREAMS],
            index: None,
            first: 0,
            count: 0,
            base_vertex: geometry.base_vertex(),
            instance_count: geometry.instance_count(),
            first_instance: geometry.first_instance(),
        };

        let mut vertex_count: Option<u32> = None;
        for (slot, stream) in streams.into_iter().enumerate() {
            let Some((buffer_key, stride, step)) = stream else {
                continue;
            };
            let buffer = scene
                .buffer_mut(buffer_key)
                .ok_or(RenderError::StaleHandle("buffer"))?;
            let pool = match buffer.kind() {
                BufferKind::Attribute => &mut self.pools.attribute,
                BufferKind::Vertex { .. } => &mut self.pools.vertex,
                _ => {
                    return Err(RenderError::WrongBufferKind {
                        label: buffer.label().to_owned(),
                        expected: "a vertex stream",
                    });
                }
            };
            if step == VertexStepMode::Vertex && stride > 0 {
                let n = buffer.len() / stride;
                vertex_count = Some(vertex_count.map_or(n, |c| c.min(n)));
            }
            let slice = pool.get(device, buffer_key, buffer)?;
            resolved.vertex_buffers[slot] = Some(VertexBinding {
                buffer: slice.buffer,
                offset: slice.offset,
            });
        }

        match index_key {
            Some(index_key) => {
                let buffer = scene
                    .buffer_mut(index_key)
                    .ok_or(RenderError::StaleHandle("buffer"))?;
                let BufferKind::Index(format) = buffer.kind() else {
                    return Err(RenderError::WrongBufferKind {
                        label: buffer.label().to_owned(),
                        expected: "an index buffer",
                    });
                };
                let available = buffer.len() / format.size();
                let slice = self.pools.index.get(device, index_key, buffer)?;
                let first_in_heap = slice.offset / format.size();
                resolved.index = Some(IndexBinding {
                    buffer: slice.buffer,
                    format,
                });
                let range = range.unwrap_or(0..available);
                resolved.first = first_in_heap + range.start;
                resolved.count = range.end.min(available).saturating_sub(range.start);
            }
            None => {
                // Without a per-vertex stream there is nothing to bound the
                // range against, as with vertex-pulling shaders.
                let range = match vertex_count {
                    Some(available) => {
                        range.map_or(0..available, |r| r.start..r.end.min(available))
                    }
                    None => range.unwrap_or(0..0),
                };
                resolved.first = range.start;
                resolved.count = range.end.saturating_sub(range.start);
            }
        }
        Ok(resolved)
    }

    /// Resolve every attachment of a render target.
    pub fn resolve_target<D: Device>(
        &mut self,
        device: &mut D,
        scene: &Scene,
        target: &RenderTarget,
    ) -> Result<(ResolvedTarget, TargetFormats)> {
        if target.color.is_empty() && target.depth.is_none() {
            return Err(RenderError::MissingResource(
                "render target has no attachments".into(),
            ));
        }
        let mut resolved = ResolvedTarget::default();
        let mut formats = TargetFormats::default();
        for attachment in &target.color {
            let view = self.get_texture(device, scene, attachment.texture)?;
            let texture = attachment_texture(scene, attachment.texture)?;
            formats.color.push(texture.format());
            formats.sample_count = texture.sample_count();
            let resolve = match attachment.resolve {
                Some(key) => {
                    attachment_texture(scene, key)?;
                    Some(self.get_texture(device, scene, key)?)
                }
                None => None,
            };
            resolved.color.push(ResolvedColor {
                view,
                resolve,
                clear: attachment.clear,
                load: attachment.load,
                store: attachment.store,
            });
        }
        if let Some(depth) = &target.depth {
            let view = self.get_texture(device, scene, depth.texture)?;
            let texture = attachment_texture(scene, depth.texture)?;
            formats.depth = Some(texture.format());
            if target.color.is_empty() {
                formats.sample_count = texture.sample_count();
            }
            resolved.depth = Some(ResolvedDepth {
                view,
                clear: depth.clear,
                load: depth.load,
                store: depth.store,
            });
        }
        Ok((resolved, formats))
    }

    /// Upload deferred pool writes.
    pub fn dispatch<D: Device>(&mut self, device: &mut D) {
        self.pools.dispatch(device);
    }

    // --- Destruction ---

    pub fn destroy_texture<D: Device>(&mut self, device: &mut D, key: TextureKey) {
        if let Some(entry) = self.textures.remove(key) {
            device.destroy_texture(entry.texture);
        }
    }

    pub fn destroy_buffer<D: Device>(&mut self, device: &mut D, key: BufferKey) {
        self.pools.free(key);
        if let Some(entry) = self.buffers.remove(key) {
            device.destroy_buffer(entry.buffer);
        }
    }

    pub fn destroy_bindings<D: Device>(&mut self, device: &mut D, key: BindingsKey) {
        if let Some(entry) = self.sets.remove(key) {
            self.release_set(device, entry);
        }
    }

    pub fn destroy_material<D: Device>(&mut self, device: &mut D, key: MaterialKey) {
        if let Some(entry) = self.materials.remove(key) {
            for (hash, _) in entry.pipelines {
                self.release_pipeline(device, hash);
            }
        }
    }

    // --- Introspection ---

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn pool_stats(&self, kind: PoolKind) -> PoolStats {
        match kind {
            PoolKind::Uniform => self.pools.uniform.stats(),
            PoolKind::Attribute => self.pools.attribute.stats(),
            PoolKind::Vertex => self.pools.vertex.stats(),
            PoolKind::Index => self.pools.index.stats(),
        }
    }

    pub fn layout_count(&self) -> usize {
        self.layouts.len()
    }

    pub fn sampler_count(&self) -> usize {
        self.samplers.len()
    }

    pub fn shader_count(&self) -> usize {
        self.shaders.len()
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }
}

fn attachment_texture(scene: &Scene, key: TextureKey) -> Result<&Texture> {
    let texture = scene.texture(key).ok_or(RenderError::StaleHandle("texture"))?;
    if !texture.usage().contains(TextureUsages::RENDER_ATTACHMENT) {
        return Err(RenderError::MissingResource(format!(
            "texture '{}' is not a render attachment",
            texture.label()
        )));
    }
    Ok(texture)
}
