use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::arena::DynamicArena;
use crate::cache::{DynamicLayout, GpuGeometry, PassState, ResolvedMaterial, ResourceCache};
use crate::config::RenderConfig;
use crate::descriptor::{
    BindingsKey, BufferKey, DrawItem, GeometryKey, MaterialKey, RenderPass, Scene, TextureKey,
};
use crate::device::{Device, FrameSubmission, ResolvedTarget};
use crate::error::{RenderError, Result};
use crate::key::{DrawEntry, DrawKeyBuilder, SortContext};
use crate::pool::PoolKind;
use crate::stream::{DrawStream, StreamFields};

/// Where a frame currently is. Anything but `Idle` is only observable from
/// inside [`Device::submit`] or after an error is mapped back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FramePhase {
    #[default]
    Idle,
    ResolvePass,
    BuildList,
    Sort,
    Encode,
    Commit,
    Submit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frame: u64,
    pub draws: u32,
    pub pipeline_binds: u32,
    pub bind_group_binds: u32,
    pub stream_words: usize,
    pub dynamic_bytes: u32,
    pub key_bits: u32,
    /// Device buffer writes issued by this frame's commit phase.
    pub commit_writes: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ResolvedDraw {
    material: ResolvedMaterial,
    geometry: GpuGeometry,
}

/// Turns a scene and a render list into one device submission per frame.
#[derive(Debug)]
pub struct Renderer<D: Device> {
    device: D,
    config: RenderConfig,
    cache: ResourceCache,
    arena: DynamicArena,
    stream: DrawStream,
    keys: DrawKeyBuilder,
    sort: SortContext,
    entries: Vec<DrawEntry>,
    draws: Vec<ResolvedDraw>,
    geometries: HashMap<GeometryKey, GpuGeometry>,
    materials: HashMap<(MaterialKey, GeometryKey, bool), ResolvedMaterial>,
    target: ResolvedTarget,
    phase: FramePhase,
    frame: u64,
}

impl<D: Device> Renderer<D> {
    pub fn new(mut device: D, config: RenderConfig) -> Result<Self> {
        config.validate()?;
        let arena = DynamicArena::new(&mut device, &config);
        let cache = ResourceCache::new(&config);
        tracing::info!(
            arena = config.dynamic_arena_size,
            max_heaps = config.max_heaps_per_pool,
            "renderer ready"
        );
        Ok(Self {
            device,
            config,
            cache,
            arena,
            stream: DrawStream::new(),
            keys: DrawKeyBuilder::new(),
            sort: SortContext::new(),
            entries: Vec::new(),
            draws: Vec::new(),
            geometries: HashMap::new(),
            materials: HashMap::new(),
            target: ResolvedTarget::default(),
            phase: FramePhase::Idle,
            frame: 0,
        })
    }

    /// Render one pass. On error nothing is submitted and the renderer is
    /// back in [`FramePhase::Idle`].
    pub fn render(
        &mut self,
        scene: &mut Scene,
        pass: &RenderPass,
        items: &[DrawItem],
    ) -> Result<FrameStats> {
        let result = self.render_frame(scene, pass, items);
        self.phase = FramePhase::Idle;
        if let Err(err) = &result {
            tracing::warn!(frame = self.frame, %err, "frame aborted");
        }
        self.frame += 1;
        result
    }

    fn render_frame(
        &mut self,
        scene: &mut Scene,
        pass: &RenderPass,
        items: &[DrawItem],
    ) -> Result<FrameStats> {
        let _span = tracing::info_span!("render_frame", frame = self.frame, items = items.len())
            .entered();
        let start = Instant::now();

        self.phase = FramePhase::ResolvePass;
        self.stream.clear();
        self.arena.reset();
        self.keys.clear();
        self.entries.clear();
        self.draws.clear();
        self.geometries.clear();
        self.materials.clear();

        let global = self
            .cache
            .get_binding_set(&mut self.device, scene, pass.bindings)?;
        let (target, formats) = self
            .cache
            .resolve_target(&mut self.device, scene, &pass.target)?;
        self.target = target;
        let plain = PassState {
            global,
            dynamic: None,
            color_formats: formats.color,
            depth_format: formats.depth,
            sample_count: formats.sample_count.max(1),
        };
        let with_dynamic = PassState {
            dynamic: Some(DynamicLayout {
                layout: self.arena.layout(),
                hash: self.arena.layout_hash(),
            }),
            ..plain.clone()
        };

        self.phase = FramePhase::BuildList;
        {
            let _span = tracing::debug_span!("build_list").entered();
            for item in items {
                let geometry = match self.geometries.get(&item.geometry) {
                    Some(g) => *g,
                    None => {
                        let g = self
                            .cache
                            .get_geometry(&mut self.device, scene, item.geometry)?;
                        self.geometries.insert(item.geometry, g);
                        g
                    }
                };
                let dynamic = !item.uniforms.is_empty();
                let memo = (item.material, item.geometry, dynamic);
                let material = match self.materials.get(&memo) {
                    Some(m) => *m,
                    None => {
                        let state = if dynamic { &with_dynamic } else { &plain };
                        let m = self.cache.resolve_material(
                            &mut self.device,
                            scene,
                            item.material,
                            item.geometry,
                            state,
                        )?;
                        self.materials.insert(memo, m);
                        m
                    }
                };
                self.keys.rank_set(material.bindings.group);
                self.keys.rank_pipeline(material.pipeline);
                self.draws.push(ResolvedDraw { material, geometry });
            }
        }

        self.phase = FramePhase::Sort;
        let layout = self.keys.layout();
        for (index, draw) in self.draws.iter().enumerate() {
            let set_rank = self.keys.rank_set(draw.material.bindings.group);
            let pipeline_rank = self.keys.rank_pipeline(draw.material.pipeline);
            self.entries.push(DrawEntry {
                key: layout.pack(set_rank, pipeline_rank),
                index: index as u32,
            });
        }
        self.sort.sort(&mut self.entries, layout.total_bits());

        self.phase = FramePhase::Encode;
        {
            let _span = tracing::debug_span!("encode", draws = self.entries.len()).entered();
            self.stream.set_bind_group(0, global.group);
            for entry in &self.entries {
                let index = entry.index as usize;
                let draw = &self.draws[index];
                let item = &items[index];
                self.stream.set_pipeline(draw.material.pipeline);
                self.stream.set_bind_group(1, draw.material.bindings.group);
                if !item.uniforms.is_empty() {
                    let block = self.arena.allocate(&item.uniforms)?;
                    self.stream.set_bind_group(2, block.bind_group);
                    self.stream.set_dynamic_offset(block.offset);
                }
                let geometry = &draw.geometry;
                for (slot, binding) in geometry.vertex_buffers.iter().enumerate() {
                    if let Some(binding) = binding {
                        self.stream
                            .set_vertex_buffer(slot, binding.buffer, binding.offset);
                    }
                }
                match geometry.index {
                    Some(index) => {
                        self.stream.set_index_buffer(index.buffer, index.format);
                        self.stream
                            .set_indexed(geometry.first, geometry.count, geometry.base_vertex);
                    }
                    None => self.stream.set_non_indexed(geometry.first, geometry.count),
                }
                self.stream
                    .set_instances(geometry.instance_count, geometry.first_instance);
                self.stream.draw();
                tracing::trace!(key = entry.key, index, "encoded draw");
            }
        }

        self.phase = FramePhase::Commit;
        let writes_before = self.commit_writes();
        self.cache.dispatch(&mut self.device);
        self.arena.commit(&mut self.device);
        let commit_writes = self.commit_writes() - writes_before;

        self.phase = FramePhase::Submit;
        self.device.submit(&FrameSubmission {
            label: &pass.label,
            stream: &self.stream,
            target: &self.target,
        })?;

        let stats = FrameStats {
            frame: self.frame,
            draws: self.stream.draw_count(),
            pipeline_binds: self.stream.count_changes(StreamFields::PIPELINE),
            bind_group_binds: self.stream.count_changes(StreamFields::BIND_GROUP_1),
            stream_words: self.stream.len(),
            dynamic_bytes: self.arena.cursor(),
            key_bits: layout.total_bits(),
            commit_writes,
            elapsed: start.elapsed(),
        };
        tracing::debug!(
            draws = stats.draws,
            pipeline_binds = stats.pipeline_binds,
            words = stats.stream_words,
            "frame submitted"
        );
        Ok(stats)
    }

    fn commit_writes(&self) -> u64 {
        self.cache.pool_stats(PoolKind::Index).writes + self.arena.writes()
    }

    /// Upload texels for one mip level, creating the texture if needed.
    pub fn upload_texture(
        &mut self,
        scene: &Scene,
        key: TextureKey,
        mip_level: u32,
        data: &[u8],
    ) -> Result<()> {
        let texture = scene.texture(key).ok_or(RenderError::StaleHandle("texture"))?;
        if mip_level >= texture.mip_level_count() {
            return Err(RenderError::MissingResource(format!(
                "texture '{}' has no mip level {mip_level}",
                texture.label()
            )));
        }
        let gpu = self.cache.get_texture(&mut self.device, scene, key)?;
        self.device.write_texture(gpu, mip_level, data);
        Ok(())
    }

    // --- Destruction: release cached device state, then the descriptor ---

    pub fn destroy_texture(&mut self, scene: &mut Scene, key: TextureKey) {
        self.cache.destroy_texture(&mut self.device, key);
        scene.remove_texture(key);
    }

    pub fn destroy_buffer(&mut self, scene: &mut Scene, key: BufferKey) {
        self.cache.destroy_buffer(&mut self.device, key);
        scene.remove_buffer(key);
    }

    pub fn destroy_bindings(&mut self, scene: &mut Scene, key: BindingsKey) {
        self.cache.destroy_bindings(&mut self.device, key);
        scene.remove_bindings(key);
    }

    pub fn destroy_material(&mut self, scene: &mut Scene, key: MaterialKey) {
        self.cache.destroy_material(&mut self.device, key);
        scene.remove_material(key);
    }

    /// Geometry owns no device state of its own; its buffers are destroyed
    /// separately.
    pub fn destroy_geometry(&mut self, scene: &mut Scene, key: GeometryKey) {
        scene.remove_geometry(key);
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// An empty scene with registries sized by the configuration.
    pub fn new_scene(&self) -> Scene {
        Scene::with_capacity(self.config.initial_registry_capacity)
    }

    pub fn arena(&self) -> &DynamicArena {
        &self.arena
    }

    /// The stream of the last frame, kept until the next one starts.
    pub fn stream(&self) -> &DrawStream {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessDevice, ObjectKind};
    use crate::testing::{Fixture, config};

    fn renderer() -> Renderer<HeadlessDevice> {
        Renderer::new(HeadlessDevice::new(), config()).unwrap()
    }

    #[test]
    fn new_scene_is_sized_by_the_config() {
        let renderer = Renderer::new(
            HeadlessDevice::new(),
            RenderConfig {
                initial_registry_capacity: 100,
                ..config()
            },
        )
        .unwrap();
        let scene = renderer.new_scene();
        assert!(scene.capacity() >= 100);
        assert_eq!(Scene::new().capacity(), 0);
    }

    #[test]
    fn draws_group_by_set_and_pipeline_in_any_order() {
        let mut fx = Fixture::new();
        let other = fx.texture("other");
        let m1 = fx.material("m1", fx.albedo);
        let m2 = fx.material("m2", other);
        let a = fx.mesh("a", 6);
        let b = fx.mesh("b", 12);
        let c = fx.mesh("c", 3);
        let draws = [(c, m2), (a, m1), (b, m1)];
        let mut renderer = renderer();

        for order in [[0, 1, 2], [1, 0, 2], [1, 2, 0], [2, 0, 1]] {
            let items: Vec<DrawItem> = order
                .iter()
                .map(|&i| DrawItem::new(draws[i].0, draws[i].1))
                .collect();
            let stats = renderer.render(&mut fx.scene, &fx.pass, &items).unwrap();
            assert_eq!(stats.draws, 3);
            assert_eq!(stats.pipeline_binds, 2, "order {order:?}");
            assert_eq!(stats.bind_group_binds, 2, "order {order:?}");
        }
        assert_eq!(renderer.cache().stats().pipelines_compiled, 2);
        assert_eq!(renderer.device().frames().len(), 4);
        assert_eq!(renderer.phase(), FramePhase::Idle);
    }

    #[test]
    fn shared_state_is_encoded_once() {
        let mut fx = Fixture::new();
        let material = fx.material("m", fx.albedo);
        let items: Vec<DrawItem> = (1..=4)
            .map(|n| DrawItem::new(fx.mesh(&format!("mesh{n}"), n * 3), material))
            .collect();
        let mut renderer = renderer();
        let stats = renderer.render(&mut fx.scene, &fx.pass, &items).unwrap();

        assert_eq!(stats.pipeline_binds, 1);
        assert_eq!(stats.bind_group_binds, 1);
        let stream = renderer.stream();
        assert_eq!(stream.count_changes(StreamFields::DRAW_COUNT), 4);
        assert_eq!(stream.count_changes(StreamFields::INDEX_BUFFER), 1);
        let counts: Vec<u32> = stream.decode().map(|d| d.state.draw_count()).collect();
        assert_eq!(counts, vec![3, 6, 9, 12]);
        for draw in stream.decode() {
            assert!(draw.state.pipeline().is_some());
            assert!(draw.state.bind_group(0).is_some());
            assert!(draw.state.bind_group(1).is_some());
            assert!(draw.state.is_indexed());
            assert_eq!(draw.state.instance_count(), 1);
        }
        let frame = renderer.device().last_frame().unwrap();
        assert_eq!(frame.stream, stream.words());
        assert_eq!(frame.label, "main");
    }

    #[test]
    fn per_draw_uniforms_go_through_one_arena_write() {
        let mut fx = Fixture::new();
        let material = fx.material("m", fx.albedo);
        let mesh = fx.mesh("quad", 6);
        let items: Vec<DrawItem> = (0..5)
            .map(|i| DrawItem::new(mesh, material).with_uniforms(&[i as f32; 4]))
            .collect();
        let mut renderer = renderer();
        let stats = renderer.render(&mut fx.scene, &fx.pass, &items).unwrap();

        assert_eq!(stats.dynamic_bytes, 5 * 256);
        assert_eq!(renderer.arena().writes(), 1);
        let offsets: Vec<u32> = renderer
            .stream()
            .decode()
            .filter_map(|d| d.state.dynamic_offset())
            .collect();
        assert_eq!(offsets, vec![0, 256, 512, 768, 1024]);
        assert_eq!(renderer.stream().count_changes(StreamFields::BIND_GROUP_2), 1);
        assert_eq!(stats.pipeline_binds, 1);
    }

    #[test]
    fn uniform_and_plain_draws_use_different_pipelines() {
        let mut fx = Fixture::new();
        let material = fx.material("m", fx.albedo);
        let mesh = fx.mesh("quad", 6);
        let items = [
            DrawItem::new(mesh, material),
            DrawItem::new(mesh, material).with_uniforms(&[1.0f32; 4]),
        ];
        let mut renderer = renderer();
        let stats = renderer.render(&mut fx.scene, &fx.pass, &items).unwrap();
        assert_eq!(stats.pipeline_binds, 2);
        assert_eq!(stats.bind_group_binds, 1);
    }

    #[test]
    fn index_uploads_are_committed_with_the_frame() {
        let mut fx = Fixture::new();
        let material = fx.material("m", fx.albedo);
        let items = [DrawItem::new(fx.mesh("quad", 6), material)];
        let mut renderer = renderer();
        let first = renderer.render(&mut fx.scene, &fx.pass, &items).unwrap();
        assert_eq!(first.commit_writes, 1);
        let second = renderer.render(&mut fx.scene, &fx.pass, &items).unwrap();
        assert_eq!(second.commit_writes, 0);
        assert_eq!(second.frame, 1);
        assert_eq!(renderer.device().misaligned_writes(), 0);
    }

    #[test]
    fn arena_overflow_aborts_before_submit() {
        let config = RenderConfig {
            dynamic_arena_size: 1024,
            ..config()
        };
        let mut renderer = Renderer::new(HeadlessDevice::new(), config).unwrap();
        let mut fx = Fixture::new();
        let material = fx.material("m", fx.albedo);
        let mesh = fx.mesh("quad", 6);
        let items: Vec<DrawItem> = (0..5)
            .map(|i| DrawItem::new(mesh, material).with_uniforms(&[i as f32; 4]))
            .collect();

        let err = renderer.render(&mut fx.scene, &fx.pass, &items).unwrap_err();
        assert!(matches!(err, RenderError::ArenaOverflow { cursor: 1024, .. }));
        assert!(renderer.device().frames().is_empty());
        assert_eq!(renderer.phase(), FramePhase::Idle);

        let stats = renderer.render(&mut fx.scene, &fx.pass, &items[..4]).unwrap();
        assert_eq!(stats.draws, 4);
        assert_eq!(renderer.device().frames().len(), 1);
    }

    #[test]
    fn oversized_uniforms_are_rejected() {
        let mut fx = Fixture::new();
        let material = fx.material("m", fx.albedo);
        let mesh = fx.mesh("quad", 6);
        let items = [DrawItem::new(mesh, material).with_uniforms(&[0.0f32; 128])];
        let mut renderer = renderer();
        let err = renderer.render(&mut fx.scene, &fx.pass, &items).unwrap_err();
        assert!(matches!(err, RenderError::UniformBlockTooLarge { size: 512, limit: 256 }));
    }

    #[test]
    fn destroyed_material_fails_the_next_frame() {
        let mut fx = Fixture::new();
        let material = fx.material("m", fx.albedo);
        let items = [DrawItem::new(fx.mesh("quad", 6), material)];
        let mut renderer = renderer();
        renderer.render(&mut fx.scene, &fx.pass, &items).unwrap();
        assert_eq!(renderer.device().live(ObjectKind::Pipeline), 1);

        renderer.destroy_material(&mut fx.scene, material);
        assert_eq!(renderer.device().live(ObjectKind::Pipeline), 0);
        let err = renderer.render(&mut fx.scene, &fx.pass, &items).unwrap_err();
        assert!(matches!(err, RenderError::StaleHandle("material")));
        assert_eq!(renderer.device().frames().len(), 1);
    }

    #[test]
    fn texture_uploads_check_the_mip_chain() {
        let mut fx = Fixture::new();
        let mut renderer = renderer();
        renderer
            .upload_texture(&fx.scene, fx.albedo, 0, &[0; 16 * 16 * 4])
            .unwrap();
        assert_eq!(renderer.device().texture_writes(), 1);
        assert!(matches!(
            renderer.upload_texture(&fx.scene, fx.albedo, 1, &[]),
            Err(RenderError::MissingResource(_))
        ));
        renderer.destroy_texture(&mut fx.scene, fx.albedo);
        assert!(matches!(
            renderer.upload_texture(&fx.scene, fx.albedo, 0, &[]),
            Err(RenderError::StaleHandle("texture"))
        ));
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = RenderConfig {
            dynamic_block_size: 8192,
            dynamic_arena_size: 4096,
            ..config()
        };
        assert!(matches!(
            Renderer::new(HeadlessDevice::new(), config),
            Err(RenderError::Config(_))
        ));
    }
}
