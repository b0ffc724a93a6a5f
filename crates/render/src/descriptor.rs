//! Application-facing descriptors and the [`Scene`] that owns them.
//!
//! A descriptor holds plain value state plus a version counter. Mutating
//! methods bump the version; the resource cache compares versions to decide
//! between reuse and rebuild. Descriptors never hold device ids.

use std::ops::Range;

use tessera_common::{Handle, Registry, structural_hash};

use crate::device::TextureDesc;
use crate::types::{
    IndexFormat, LoadOp, PipelineState, SamplerDesc, ShaderStages, StoreOp, TextureFormat,
    TextureUsages, VertexBufferLayout,
};

pub type Version = u64;

pub type TextureKey = Handle<Texture>;
pub type BufferKey = Handle<Buffer>;
pub type BindingsKey = Handle<Bindings>;
pub type MaterialKey = Handle<Material>;
pub type GeometryKey = Handle<Geometry>;

/// Vertex streams a geometry may reference.
pub const MAX_VERTEX_STREAMS: usize = 4;

// --- Texture ---

#[derive(Debug, Clone, PartialEq)]
pub struct Texture {
    label: String,
    width: u32,
    height: u32,
    depth_or_layers: u32,
    mip_level_count: u32,
    sample_count: u32,
    format: TextureFormat,
    usage: TextureUsages,
    version: Version,
}

impl Texture {
    /// A sampled 2D texture that accepts uploads.
    pub fn new_2d(label: impl Into<String>, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            label: label.into(),
            width: width.max(1),
            height: height.max(1),
            depth_or_layers: 1,
            mip_level_count: 1,
            sample_count: 1,
            format,
            usage: TextureUsages::SAMPLED | TextureUsages::COPY_DST,
            version: 0,
        }
    }

    /// A 2D texture usable as a color or depth attachment.
    pub fn attachment(label: impl Into<String>, width: u32, height: u32, format: TextureFormat) -> Self {
        let mut texture = Self::new_2d(label, width, height, format);
        texture.usage = TextureUsages::RENDER_ATTACHMENT | TextureUsages::SAMPLED;
        texture
    }

    pub fn with_mips(mut self, count: u32) -> Self {
        self.mip_level_count = count.max(1);
        self
    }

    pub fn with_samples(mut self, count: u32) -> Self {
        self.sample_count = count.max(1);
        self
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.depth_or_layers = layers.max(1);
        self
    }

    pub fn with_usage(mut self, usage: TextureUsages) -> Self {
        self.usage = usage;
        self
    }

    /// Change the extent. A no-op resize keeps the version.
    pub fn resize(&mut self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) != (self.width, self.height) {
            self.width = width;
            self.height = height;
            self.version += 1;
        }
    }

    pub fn set_format(&mut self, format: TextureFormat) {
        if format != self.format {
            self.format = format;
            self.version += 1;
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn usage(&self) -> TextureUsages {
        self.usage
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn desc(&self) -> TextureDesc<'_> {
        TextureDesc {
            label: &self.label,
            width: self.width,
            height: self.height,
            depth_or_layers: self.depth_or_layers,
            mip_level_count: self.mip_level_count,
            sample_count: self.sample_count,
            format: self.format,
            usage: self.usage,
        }
    }
}

// --- Buffer ---

/// What a buffer's bytes are for. Selects the pool (or dedicated buffer)
/// that backs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// A uniform block placed in the uniform pool.
    Uniform,
    /// A storage buffer bound whole through a dedicated device buffer.
    Storage { read_only: bool },
    /// One tightly packed vertex attribute, placed in the attribute pool.
    Attribute,
    /// Interleaved vertices of the given stride, placed in the vertex pool.
    Vertex { stride: u32 },
    Index(IndexFormat),
}

/// CPU-side bytes plus a pending dirty range.
///
/// The version changes only when the byte length changes; in-place writes
/// just widen the dirty range.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    label: String,
    kind: BufferKind,
    data: Vec<u8>,
    dirty: Option<Range<u32>>,
    version: Version,
}

impl Buffer {
    pub fn new(label: impl Into<String>, kind: BufferKind, data: Vec<u8>) -> Self {
        let dirty = (!data.is_empty()).then(|| 0..data.len() as u32);
        Self {
            label: label.into(),
            kind,
            data,
            dirty,
            version: 0,
        }
    }

    /// Build a buffer from a slice of plain-old-data values.
    pub fn from_pod<T: bytemuck::Pod>(label: impl Into<String>, kind: BufferKind, values: &[T]) -> Self {
        Self::new(label, kind, bytemuck::cast_slice(values).to_vec())
    }

    pub fn uniform<T: bytemuck::Pod>(label: impl Into<String>, value: &T) -> Self {
        Self::new(label, BufferKind::Uniform, bytemuck::bytes_of(value).to_vec())
    }

    /// Overwrite bytes at `offset`, growing the buffer if the write runs past
    /// its end.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
            self.version += 1;
        }
        self.data[start..end].copy_from_slice(bytes);
        self.mark_dirty(offset..end as u32);
    }

    pub fn write_pod<T: bytemuck::Pod>(&mut self, offset: u32, value: &T) {
        self.write(offset, bytemuck::bytes_of(value));
    }

    /// Replace the whole payload.
    pub fn set_data(&mut self, data: Vec<u8>) {
        if data.len() != self.data.len() {
            self.version += 1;
        }
        self.data = data;
        self.dirty = (!self.data.is_empty()).then(|| 0..self.data.len() as u32);
    }

    fn mark_dirty(&mut self, range: Range<u32>) {
        self.dirty = Some(match self.dirty.take() {
            Some(d) => d.start.min(range.start)..d.end.max(range.end),
            None => range,
        });
    }

    pub(crate) fn mark_all_dirty(&mut self) {
        self.dirty = (!self.data.is_empty()).then(|| 0..self.data.len() as u32);
    }

    pub(crate) fn take_dirty(&mut self) -> Option<Range<u32>> {
        self.dirty.take()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dirty(&self) -> Option<Range<u32>> {
        self.dirty.clone()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Indices in an index buffer, or vertices in an interleaved vertex buffer.
    pub fn element_count(&self) -> Option<u32> {
        match self.kind {
            BufferKind::Index(format) => Some(self.len() / format.size()),
            BufferKind::Vertex { stride } if stride > 0 => Some(self.len() / stride),
            _ => None,
        }
    }
}

// --- Bindings ---

/// What a binding slot refers to. The set of kinds is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingResource {
    /// A uniform or storage buffer bound whole from its own device buffer.
    Buffer(BufferKey),
    Texture(TextureKey),
    Sampler(SamplerDesc),
    /// A uniform block placed in the shared uniform pool.
    Uniform(BufferKey),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub slot: u32,
    pub name: String,
    pub visibility: ShaderStages,
    pub resource: BindingResource,
}

/// A binding set: the resources bound together at one group index.
#[derive(Debug, Clone, PartialEq)]
pub struct Bindings {
    label: String,
    entries: Vec<Binding>,
    version: Version,
}

impl Bindings {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: Vec::new(),
            version: 0,
        }
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(
        mut self,
        slot: u32,
        name: impl Into<String>,
        visibility: ShaderStages,
        resource: BindingResource,
    ) -> Self {
        self.entries.push(Binding {
            slot,
            name: name.into(),
            visibility,
            resource,
        });
        self
    }

    /// Insert or replace the binding at `slot`.
    pub fn set(
        &mut self,
        slot: u32,
        name: impl Into<String>,
        visibility: ShaderStages,
        resource: BindingResource,
    ) {
        let binding = Binding {
            slot,
            name: name.into(),
            visibility,
            resource,
        };
        match self.entries.iter_mut().find(|b| b.slot == slot) {
            Some(existing) if *existing == binding => return,
            Some(existing) => *existing = binding,
            None => self.entries.push(binding),
        }
        self.version += 1;
    }

    pub fn remove(&mut self, slot: u32) -> Option<Binding> {
        let position = self.entries.iter().position(|b| b.slot == slot)?;
        self.version += 1;
        Some(self.entries.remove(position))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn entries(&self) -> &[Binding] {
        &self.entries
    }

    pub fn version(&self) -> Version {
        self.version
    }
}

// --- Material ---

/// Shader source and entry points. Opaque to the core beyond hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shader {
    pub label: String,
    pub source: String,
    pub vertex_entry: String,
    pub fragment_entry: Option<String>,
}

impl Shader {
    pub fn new(label: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            source: source.into(),
            vertex_entry: "vs_main".into(),
            fragment_entry: Some("fs_main".into()),
        }
    }

    /// Hash of what the device compiles. The label is left out, so equal
    /// sources share one shader module.
    pub fn content_hash(&self) -> u64 {
        structural_hash(&(&self.source, &self.vertex_entry, &self.fragment_entry))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    label: String,
    shader: Shader,
    bindings: BindingsKey,
    state: PipelineState,
    version: Version,
}

impl Material {
    pub fn new(label: impl Into<String>, shader: Shader, bindings: BindingsKey) -> Self {
        Self {
            label: label.into(),
            shader,
            bindings,
            state: PipelineState::default(),
            version: 0,
        }
    }

    pub fn with_state(mut self, state: PipelineState) -> Self {
        self.state = state;
        self
    }

    pub fn set_state(&mut self, state: PipelineState) {
        if state != self.state {
            self.state = state;
            self.version += 1;
        }
    }

    pub fn set_shader(&mut self, shader: Shader) {
        if shader != self.shader {
            self.shader = shader;
            self.version += 1;
        }
    }

    pub fn set_bindings(&mut self, bindings: BindingsKey) {
        if bindings != self.bindings {
            self.bindings = bindings;
            self.version += 1;
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn shader(&self) -> &Shader {
        &self.shader
    }

    pub fn bindings(&self) -> BindingsKey {
        self.bindings
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn version(&self) -> Version {
        self.version
    }
}

// --- Geometry ---

#[derive(Debug, Clone, PartialEq)]
pub struct VertexStream {
    pub buffer: BufferKey,
    pub layout: VertexBufferLayout,
}

/// Vertex streams, an optional index buffer and the drawn range.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    label: String,
    streams: Vec<VertexStream>,
    index: Option<BufferKey>,
    range: Option<Range<u32>>,
    base_vertex: i32,
    instance_count: u32,
    first_instance: u32,
    version: Version,
}

impl Geometry {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            streams: Vec::new(),
            index: None,
            range: None,
            base_vertex: 0,
            instance_count: 1,
            first_instance: 0,
            version: 0,
        }
    }

    pub fn with_stream(mut self, buffer: BufferKey, layout: VertexBufferLayout) -> Self {
        self.push_stream(buffer, layout);
        self
    }

    pub fn with_index(mut self, buffer: BufferKey) -> Self {
        self.index = Some(buffer);
        self
    }

    pub fn push_stream(&mut self, buffer: BufferKey, layout: VertexBufferLayout) {
        self.streams.push(VertexStream { buffer, layout });
        self.version += 1;
    }

    pub fn set_index(&mut self, index: Option<BufferKey>) {
        if index != self.index {
            self.index = index;
            self.version += 1;
        }
    }

    /// Restrict drawing to a sub-range of indices (or vertices when not
    /// indexed). `None` draws everything.
    pub fn set_range(&mut self, range: Option<Range<u32>>) {
        self.range = range;
    }

    pub fn set_base_vertex(&mut self, base_vertex: i32) {
        self.base_vertex = base_vertex;
    }

    pub fn set_instances(&mut self, count: u32, first: u32) {
        self.instance_count = count;
        self.first_instance = first;
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn streams(&self) -> &[VertexStream] {
        &self.streams
    }

    /// Vertex layouts in stream order, as the pipeline consumes them.
    pub fn vertex_layouts(&self) -> impl Iterator<Item = &VertexBufferLayout> {
        self.streams.iter().map(|s| &s.layout)
    }

    pub fn index(&self) -> Option<BufferKey> {
        self.index
    }

    pub fn range(&self) -> Option<Range<u32>> {
        self.range.clone()
    }

    pub fn base_vertex(&self) -> i32 {
        self.base_vertex
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn first_instance(&self) -> u32 {
        self.first_instance
    }

    pub fn version(&self) -> Version {
        self.version
    }
}

// --- Render target and pass ---

#[derive(Debug, Clone, PartialEq)]
pub struct ColorAttachment {
    pub texture: TextureKey,
    pub resolve: Option<TextureKey>,
    pub clear: Option<[f64; 4]>,
    pub load: LoadOp,
    pub store: StoreOp,
}

impl ColorAttachment {
    pub fn clear(texture: TextureKey, color: [f64; 4]) -> Self {
        Self {
            texture,
            resolve: None,
            clear: Some(color),
            load: LoadOp::Clear,
            store: StoreOp::Store,
        }
    }

    pub fn load(texture: TextureKey) -> Self {
        Self {
            texture,
            resolve: None,
            clear: None,
            load: LoadOp::Load,
            store: StoreOp::Store,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthAttachment {
    pub texture: TextureKey,
    pub clear: Option<f32>,
    pub load: LoadOp,
    pub store: StoreOp,
}

impl DepthAttachment {
    pub fn clear(texture: TextureKey, depth: f32) -> Self {
        Self {
            texture,
            clear: Some(depth),
            load: LoadOp::Clear,
            store: StoreOp::Discard,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderTarget {
    pub color: Vec<ColorAttachment>,
    pub depth: Option<DepthAttachment>,
}

/// One pass: its global binding set (group 0) and where it draws.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPass {
    pub label: String,
    pub bindings: BindingsKey,
    pub target: RenderTarget,
}

/// One entry of a render list.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawItem {
    pub geometry: GeometryKey,
    pub material: MaterialKey,
    /// Per-draw uniform bytes placed in the dynamic arena. Empty for none.
    pub uniforms: Vec<u8>,
}

impl DrawItem {
    pub fn new(geometry: GeometryKey, material: MaterialKey) -> Self {
        Self {
            geometry,
            material,
            uniforms: Vec::new(),
        }
    }

    pub fn with_uniforms<T: bytemuck::Pod>(mut self, value: &T) -> Self {
        self.uniforms = bytemuck::bytes_of(value).to_vec();
        self
    }
}

// --- Scene ---

/// Owns every descriptor, one registry per kind.
#[derive(Debug, Default)]
pub struct Scene {
    textures: Registry<Texture>,
    buffers: Registry<Buffer>,
    bindings: Registry<Bindings>,
    materials: Registry<Material>,
    geometries: Registry<Geometry>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            textures: Registry::with_capacity(capacity),
            buffers: Registry::with_capacity(capacity),
            bindings: Registry::with_capacity(capacity),
            materials: Registry::with_capacity(capacity),
            geometries: Registry::with_capacity(capacity),
        }
    }

    /// Descriptors of each kind the scene holds before a registry grows.
    pub fn capacity(&self) -> usize {
        [
            self.textures.capacity(),
            self.buffers.capacity(),
            self.bindings.capacity(),
            self.materials.capacity(),
            self.geometries.capacity(),
        ]
        .into_iter()
        .min()
        .unwrap_or(0)
    }

    pub fn add_texture(&mut self, texture: Texture) -> TextureKey {
        self.textures.insert(texture)
    }

    pub fn texture(&self, key: TextureKey) -> Option<&Texture> {
        self.textures.get(key)
    }

    pub fn texture_mut(&mut self, key: TextureKey) -> Option<&mut Texture> {
        self.textures.get_mut(key)
    }

    pub(crate) fn remove_texture(&mut self, key: TextureKey) -> Option<Texture> {
        self.textures.remove(key)
    }

    pub fn add_buffer(&mut self, buffer: Buffer) -> BufferKey {
        self.buffers.insert(buffer)
    }

    pub fn buffer(&self, key: BufferKey) -> Option<&Buffer> {
        self.buffers.get(key)
    }

    pub fn buffer_mut(&mut self, key: BufferKey) -> Option<&mut Buffer> {
        self.buffers.get_mut(key)
    }

    pub(crate) fn remove_buffer(&mut self, key: BufferKey) -> Option<Buffer> {
        self.buffers.remove(key)
    }

    pub fn add_bindings(&mut self, bindings: Bindings) -> BindingsKey {
        self.bindings.insert(bindings)
    }

    pub fn bindings(&self, key: BindingsKey) -> Option<&Bindings> {
        self.bindings.get(key)
    }

    pub fn bindings_mut(&mut self, key: BindingsKey) -> Option<&mut Bindings> {
        self.bindings.get_mut(key)
    }

    pub(crate) fn remove_bindings(&mut self, key: BindingsKey) -> Option<Bindings> {
        self.bindings.remove(key)
    }

    pub fn add_material(&mut self, material: Material) -> MaterialKey {
        self.materials.insert(material)
    }

    pub fn material(&self, key: MaterialKey) -> Option<&Material> {
        self.materials.get(key)
    }

    pub fn material_mut(&mut self, key: MaterialKey) -> Option<&mut Material> {
        self.materials.get_mut(key)
    }

    pub(crate) fn remove_material(&mut self, key: MaterialKey) -> Option<Material> {
        self.materials.remove(key)
    }

    pub fn add_geometry(&mut self, geometry: Geometry) -> GeometryKey {
        self.geometries.insert(geometry)
    }

    pub fn geometry(&self, key: GeometryKey) -> Option<&Geometry> {
        self.geometries.get(key)
    }

    pub fn geometry_mut(&mut self, key: GeometryKey) -> Option<&mut Geometry> {
        self.geometries.get_mut(key)
    }

    pub(crate) fn remove_geometry(&mut self, key: GeometryKey) -> Option<Geometry> {
        self.geometries.remove(key)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    pub fn geometry_count(&self) -> usize {
        self.geometries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndexFormat;

    #[test]
    fn resize_bumps_version_only_on_change() {
        let mut texture = Texture::new_2d("albedo", 64, 64, TextureFormat::Rgba8UnormSrgb);
        texture.resize(64, 64);
        assert_eq!(texture.version(), 0);
        texture.resize(128, 64);
        assert_eq!(texture.version(), 1);
    }

    #[test]
    fn in_place_writes_keep_version_and_widen_dirty_range() {
        let mut buffer = Buffer::new("u", BufferKind::Uniform, vec![0; 64]);
        assert_eq!(buffer.take_dirty(), Some(0..64));
        buffer.write(8, &[1; 4]);
        buffer.write(32, &[2; 4]);
        assert_eq!(buffer.version(), 0);
        assert_eq!(buffer.dirty(), Some(8..36));
    }

    #[test]
    fn growing_write_bumps_version() {
        let mut buffer = Buffer::new("v", BufferKind::Attribute, vec![0; 8]);
        buffer.write(4, &[1; 8]);
        assert_eq!(buffer.len(), 12);
        assert_eq!(buffer.version(), 1);
    }

    #[test]
    fn set_data_same_length_keeps_version() {
        let mut buffer = Buffer::new("i", BufferKind::Index(IndexFormat::Uint16), vec![0; 12]);
        buffer.set_data(vec![1; 12]);
        assert_eq!(buffer.version(), 0);
        buffer.set_data(vec![1; 24]);
        assert_eq!(buffer.version(), 1);
        assert_eq!(buffer.element_count(), Some(12));
    }

    #[test]
    fn bindings_set_replaces_slot() {
        let mut bindings = Bindings::new("material");
        let sampler = BindingResource::Sampler(SamplerDesc::default());
        bindings.set(0, "s", ShaderStages::FRAGMENT, sampler);
        bindings.set(0, "s", ShaderStages::FRAGMENT, sampler);
        assert_eq!(bindings.version(), 1);
        bindings.set(0, "s", ShaderStages::FRAGMENT, BindingResource::Sampler(SamplerDesc::nearest()));
        assert_eq!(bindings.entries().len(), 1);
        assert_eq!(bindings.version(), 2);
        assert!(bindings.remove(0).is_some());
        assert!(bindings.remove(0).is_none());
    }

    #[test]
    fn scene_keys_go_stale_after_removal() {
        let mut scene = Scene::new();
        let key = scene.add_texture(Texture::new_2d("t", 4, 4, TextureFormat::Rgba8Unorm));
        assert!(scene.remove_texture(key).is_some());
        let reused = scene.add_texture(Texture::new_2d("u", 4, 4, TextureFormat::Rgba8Unorm));
        assert_eq!(reused.index(), key.index());
        assert!(scene.texture(key).is_none());
        assert_eq!(scene.texture(reused).unwrap().label(), "u");
    }
}
