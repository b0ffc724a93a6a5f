use std::collections::HashMap;

use tessera_common::{DenseRegistry, Handle};

use crate::device::{
    BindEntry, BufferDesc, Device, FrameSubmission, GpuBindGroup, GpuBuffer, GpuLayout,
    GpuPipeline, GpuSampler, GpuShader, GpuTexture, LayoutEntry, PipelineDesc, ResolvedTarget,
    ShaderDesc, TextureDesc,
};
use crate::error::{RenderError, Result};
use crate::stream::{BIND_GROUP_SLOTS, VERTEX_BUFFER_SLOTS};
use crate::types::SamplerDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Texture,
    Sampler,
    Shader,
    Layout,
    BindGroup,
    Pipeline,
}

impl ObjectKind {
    const COUNT: usize = 7;

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
struct LiveObject {
    kind: ObjectKind,
    id: u32,
    label: String,
}

/// One `write_buffer` call as the device saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferWrite {
    pub buffer: GpuBuffer,
    pub offset: u64,
    pub len: usize,
}

/// A submitted frame, copied out of the borrowed submission.
#[derive(Debug, Clone)]
pub struct RecordedFrame {
    pub label: String,
    pub stream: Vec<u32>,
    pub draws: u32,
    pub target: ResolvedTarget,
}

/// A device with no GPU behind it.
///
/// Hands out sequential ids, keeps buffer contents in memory, counts every
/// call and records submitted frames. Used by tests and by the CLI when no
/// adapter is requested.
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    next_id: u32,
    live: DenseRegistry<LiveObject>,
    lookup: HashMap<(ObjectKind, u32), Handle<LiveObject>>,
    created: [u64; ObjectKind::COUNT],
    destroyed: [u64; ObjectKind::COUNT],
    calls: u64,
    contents: HashMap<u32, Vec<u8>>,
    writes: Vec<BufferWrite>,
    bytes_written: u64,
    misaligned_writes: u64,
    texture_writes: u64,
    frames: Vec<RecordedFrame>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn create(&mut self, kind: ObjectKind, label: &str) -> u32 {
        self.calls += 1;
        self.next_id += 1;
        let id = self.next_id;
        let handle = self.live.insert(LiveObject {
            kind,
            id,
            label: label.to_owned(),
        });
        self.lookup.insert((kind, id), handle);
        self.created[kind.slot()] += 1;
        tracing::trace!(?kind, id, label, "headless create");
        id
    }

    fn destroy(&mut self, kind: ObjectKind, id: u32) {
        self.calls += 1;
        match self.lookup.remove(&(kind, id)) {
            Some(handle) => {
                self.live.remove(handle);
                self.destroyed[kind.slot()] += 1;
            }
            None => tracing::warn!(?kind, id, "destroying an object that is not live"),
        }
    }

    /// Total number of device calls of any kind.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn created(&self, kind: ObjectKind) -> u64 {
        self.created[kind.slot()]
    }

    pub fn destroyed(&self, kind: ObjectKind) -> u64 {
        self.destroyed[kind.slot()]
    }

    /// Objects of `kind` created and not yet destroyed.
    pub fn live(&self, kind: ObjectKind) -> usize {
        self.live.iter().filter(|(_, o)| o.kind == kind).count()
    }

    pub fn is_live(&self, kind: ObjectKind, id: u32) -> bool {
        self.lookup.contains_key(&(kind, id))
    }

    pub fn label(&self, kind: ObjectKind, id: u32) -> Option<&str> {
        let handle = self.lookup.get(&(kind, id))?;
        self.live.get(*handle).map(|o| o.label.as_str())
    }

    pub fn buffer_contents(&self, buffer: GpuBuffer) -> Option<&[u8]> {
        self.contents.get(&buffer.0).map(Vec::as_slice)
    }

    /// Buffer writes recorded since the last [`clear_writes`](Self::clear_writes).
    pub fn writes(&self) -> &[BufferWrite] {
        &self.writes
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn misaligned_writes(&self) -> u64 {
        self.misaligned_writes
    }

    pub fn texture_writes(&self) -> u64 {
        self.texture_writes
    }

    pub fn frames(&self) -> &[RecordedFrame] {
        &self.frames
    }

    pub fn last_frame(&self) -> Option<&RecordedFrame> {
        self.frames.last()
    }

    /// First object a submission references that is not live.
    fn unresolved(&self, frame: &FrameSubmission<'_>) -> Option<String> {
        let dead = |kind: ObjectKind, id: u32| {
            (!self.is_live(kind, id)).then(|| format!("{kind:?} {id} is not live"))
        };
        let views = frame
            .target
            .color
            .iter()
            .flat_map(|c| Some(c.view).into_iter().chain(c.resolve))
            .chain(frame.target.depth.iter().map(|d| d.view));
        for view in views {
            if let Some(reason) = dead(ObjectKind::Texture, view.0) {
                return Some(reason);
            }
        }
        for (index, draw) in frame.stream.decode().enumerate() {
            let state = &draw.state;
            let Some(pipeline) = state.pipeline() else {
                return Some(format!("draw {index} has no pipeline"));
            };
            let mut refs = vec![(ObjectKind::Pipeline, pipeline.0)];
            refs.extend(
                (0..BIND_GROUP_SLOTS)
                    .filter_map(|slot| state.bind_group(slot))
                    .map(|group| (ObjectKind::BindGroup, group.0)),
            );
            refs.extend(
                (0..VERTEX_BUFFER_SLOTS)
                    .filter_map(|slot| state.vertex_buffer(slot))
                    .map(|(buffer, _)| (ObjectKind::Buffer, buffer.0)),
            );
            refs.extend(state.index_buffer().map(|(buffer, _)| (ObjectKind::Buffer, buffer.0)));
            if let Some(reason) = refs.into_iter().find_map(|(kind, id)| dead(kind, id)) {
                return Some(format!("draw {index}: {reason}"));
            }
        }
        None
    }
}

impl Device for HeadlessDevice {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> GpuBuffer {
        let id = self.create(ObjectKind::Buffer, desc.label);
        self.contents.insert(id, vec![0; desc.size as usize]);
        GpuBuffer(id)
    }

    fn write_buffer(&mut self, buffer: GpuBuffer, offset: u64, data: &[u8]) {
        self.calls += 1;
        if offset % 4 != 0 || data.len() % 4 != 0 {
            self.misaligned_writes += 1;
            tracing::warn!(buffer = buffer.0, offset, len = data.len(), "misaligned buffer write");
        }
        let Some(contents) = self.contents.get_mut(&buffer.0) else {
            tracing::warn!(buffer = buffer.0, "write to a buffer that is not live");
            return;
        };
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            tracing::warn!(buffer = buffer.0, end, size = contents.len(), "buffer write out of bounds");
            return;
        }
        contents[start..end].copy_from_slice(data);
        self.writes.push(BufferWrite {
            buffer,
            offset,
            len: data.len(),
        });
        self.bytes_written += data.len() as u64;
    }

    fn destroy_buffer(&mut self, buffer: GpuBuffer) {
        self.contents.remove(&buffer.0);
        self.destroy(ObjectKind::Buffer, buffer.0);
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> GpuTexture {
        GpuTexture(self.create(ObjectKind::Texture, desc.label))
    }

    fn write_texture(&mut self, texture: GpuTexture, mip_level: u32, data: &[u8]) {
        self.calls += 1;
        self.texture_writes += 1;
        tracing::trace!(texture = texture.0, mip_level, len = data.len(), "headless texture write");
    }

    fn destroy_texture(&mut self, texture: GpuTexture) {
        self.destroy(ObjectKind::Texture, texture.0);
    }

    fn create_sampler(&mut self, _desc: &SamplerDesc) -> GpuSampler {
        GpuSampler(self.create(ObjectKind::Sampler, "sampler"))
    }

    fn destroy_sampler(&mut self, sampler: GpuSampler) {
        self.destroy(ObjectKind::Sampler, sampler.0);
    }

    fn create_shader(&mut self, desc: &ShaderDesc<'_>) -> GpuShader {
        GpuShader(self.create(ObjectKind::Shader, desc.label))
    }

    fn destroy_shader(&mut self, shader: GpuShader) {
        self.destroy(ObjectKind::Shader, shader.0);
    }

    fn create_layout(&mut self, entries: &[LayoutEntry]) -> GpuLayout {
        let label = format!("layout[{}]", entries.len());
        GpuLayout(self.create(ObjectKind::Layout, &label))
    }

    fn destroy_layout(&mut self, layout: GpuLayout) {
        self.destroy(ObjectKind::Layout, layout.0);
    }

    fn create_bind_group(&mut self, layout: GpuLayout, entries: &[BindEntry]) -> GpuBindGroup {
        if !self.is_live(ObjectKind::Layout, layout.0) {
            tracing::warn!(layout = layout.0, "bind group created against a dead layout");
        }
        let label = format!("group[{}]", entries.len());
        GpuBindGroup(self.create(ObjectKind::BindGroup, &label))
    }

    fn destroy_bind_group(&mut self, group: GpuBindGroup) {
        self.destroy(ObjectKind::BindGroup, group.0);
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> GpuPipeline {
        GpuPipeline(self.create(ObjectKind::Pipeline, desc.label))
    }

    fn destroy_pipeline(&mut self, pipeline: GpuPipeline) {
        self.destroy(ObjectKind::Pipeline, pipeline.0);
    }

    fn submit(&mut self, frame: &FrameSubmission<'_>) -> Result<()> {
        self.calls += 1;
        if let Some(reason) = self.unresolved(frame) {
            return Err(RenderError::Device {
                label: frame.label.to_owned(),
                reason,
            });
        }
        self.frames.push(RecordedFrame {
            label: frame.label.to_owned(),
            stream: frame.stream.words().to_vec(),
            draws: frame.stream.draw_count(),
            target: frame.target.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::DrawStream;
    use crate::types::BufferUsages;

    fn buffer_desc(size: u64) -> BufferDesc<'static> {
        BufferDesc {
            label: "test",
            size,
            usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
        }
    }

    #[test]
    fn ids_are_unique_across_kinds() {
        let mut device = HeadlessDevice::new();
        let a = device.create_buffer(&buffer_desc(16));
        let b = device.create_sampler(&SamplerDesc::default());
        assert_ne!(a.0, b.0);
        assert_eq!(device.live(ObjectKind::Buffer), 1);
        assert_eq!(device.live(ObjectKind::Sampler), 1);
    }

    #[test]
    fn writes_land_in_contents() {
        let mut device = HeadlessDevice::new();
        let buffer = device.create_buffer(&buffer_desc(16));
        device.write_buffer(buffer, 4, &[1, 2, 3, 4]);
        assert_eq!(device.buffer_contents(buffer).unwrap()[4..8], [1, 2, 3, 4]);
        assert_eq!(device.writes().len(), 1);
        assert_eq!(device.misaligned_writes(), 0);
    }

    #[test]
    fn misaligned_writes_are_counted() {
        let mut device = HeadlessDevice::new();
        let buffer = device.create_buffer(&buffer_desc(16));
        device.write_buffer(buffer, 2, &[1, 2]);
        assert_eq!(device.misaligned_writes(), 1);
    }

    #[test]
    fn destroy_tracks_liveness() {
        let mut device = HeadlessDevice::new();
        let buffer = device.create_buffer(&buffer_desc(4));
        device.destroy_buffer(buffer);
        assert_eq!(device.live(ObjectKind::Buffer), 0);
        assert_eq!(device.destroyed(ObjectKind::Buffer), 1);
        assert!(device.buffer_contents(buffer).is_none());
        // Double destroy only warns.
        device.destroy_buffer(buffer);
        assert_eq!(device.destroyed(ObjectKind::Buffer), 1);
    }

    fn submit_pipeline(device: &mut HeadlessDevice, pipeline: GpuPipeline) -> Result<()> {
        let mut stream = DrawStream::new();
        stream.set_pipeline(pipeline);
        stream.set_non_indexed(0, 3);
        stream.draw();
        device.submit(&FrameSubmission {
            label: "test",
            stream: &stream,
            target: &ResolvedTarget::default(),
        })
    }

    #[test]
    fn submission_with_dead_pipeline_is_rejected() {
        let mut device = HeadlessDevice::new();
        let err = submit_pipeline(&mut device, GpuPipeline(u32::MAX)).unwrap_err();
        assert!(matches!(err, RenderError::Device { .. }));
        assert!(device.frames().is_empty());
    }

    #[test]
    fn submission_with_live_objects_is_recorded() {
        let mut device = HeadlessDevice::new();
        let shader = device.create_shader(&ShaderDesc {
            label: "s",
            source: "",
        });
        let pipeline = device.create_pipeline(&PipelineDesc {
            label: "p",
            shader,
            vertex_entry: "vs_main",
            fragment_entry: None,
            layouts: &[],
            vertex_buffers: &[],
            state: Default::default(),
            color_formats: &[],
            depth_format: None,
            sample_count: 1,
        });
        submit_pipeline(&mut device, pipeline).unwrap();
        assert_eq!(device.last_frame().unwrap().draws, 1);
    }
}
