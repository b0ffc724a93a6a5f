//! Typed buffer pools: many small buffers packed into a few large heaps.

use std::collections::BTreeMap;

use tessera_common::SecondaryMap;

use crate::config::RenderConfig;
use crate::descriptor::{Buffer, BufferKey, BufferKind, Version};
use crate::device::{Device, GpuBuffer};
use crate::error::{RenderError, Result};
use crate::heap::{HeapAllocation, HeapSet, HeapStats, WriteMode};
use crate::types::{BufferUsages, lcm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Uniform,
    Attribute,
    Vertex,
    Index,
}

impl PoolKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::Attribute => "attribute",
            Self::Vertex => "vertex",
            Self::Index => "index",
        }
    }

    fn usage(self) -> BufferUsages {
        match self {
            Self::Uniform => BufferUsages::UNIFORM,
            Self::Attribute | Self::Vertex => BufferUsages::VERTEX,
            Self::Index => BufferUsages::INDEX,
        }
    }

    fn write_mode(self) -> WriteMode {
        match self {
            Self::Index => WriteMode::Deferred,
            _ => WriteMode::Immediate,
        }
    }

    fn accepts(self, kind: BufferKind) -> bool {
        matches!(
            (self, kind),
            (Self::Uniform, BufferKind::Uniform)
                | (Self::Attribute, BufferKind::Attribute)
                | (Self::Vertex, BufferKind::Vertex { .. })
                | (Self::Index, BufferKind::Index(_))
        )
    }
}

/// Where a pooled buffer currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSlice {
    pub buffer: GpuBuffer,
    pub heap: u32,
    /// Byte offset into the heap buffer.
    pub offset: u32,
    /// Logical byte length of the descriptor's payload.
    pub size: u32,
}

#[derive(Debug)]
struct PoolEntry {
    granularity: u32,
    block: HeapAllocation,
    version: Version,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub buffers: usize,
    pub heaps: u32,
    pub capacity: u64,
    pub used: u64,
    pub writes: u64,
}

/// One pool: a heap family per granularity plus the placement of every
/// buffer resolved through it.
#[derive(Debug)]
pub struct BufferPool {
    kind: PoolKind,
    heap_size: u32,
    alignment: u32,
    max_heaps: u32,
    max_allocations: u32,
    families: BTreeMap<u32, HeapSet>,
    entries: SecondaryMap<Buffer, PoolEntry>,
}

impl BufferPool {
    pub fn new(kind: PoolKind, config: &RenderConfig) -> Self {
        let (heap_size, alignment) = match kind {
            PoolKind::Uniform => (config.uniform_heap_size, config.uniform_alignment),
            PoolKind::Attribute => (config.attribute_heap_size, 4),
            PoolKind::Vertex => (config.vertex_heap_size, 4),
            PoolKind::Index => (config.index_heap_size, 4),
        };
        Self {
            kind,
            heap_size,
            alignment,
            max_heaps: config.max_heaps_per_pool,
            max_allocations: config.max_allocations_per_heap,
            families: BTreeMap::new(),
            entries: SecondaryMap::new(),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Interleaved vertices need offsets on a whole vertex as well as on a
    /// 4-byte boundary.
    fn granularity(&self, kind: BufferKind) -> u32 {
        match kind {
            BufferKind::Vertex { stride } if self.kind == PoolKind::Vertex => {
                lcm(stride.max(1), self.alignment)
            }
            _ => self.alignment,
        }
    }

    /// Place `buffer` (allocating on first use or after a size change) and
    /// upload its pending dirty range.
    pub fn get<D: Device>(
        &mut self,
        device: &mut D,
        key: BufferKey,
        buffer: &mut Buffer,
    ) -> Result<BufferSlice> {
        if !self.kind.accepts(buffer.kind()) {
            return Err(RenderError::WrongBufferKind {
                label: buffer.label().to_owned(),
                expected: self.kind.name(),
            });
        }

        let current = self
            .entries
            .get(key)
            .is_some_and(|e| e.version == buffer.version());
        if !current {
            self.free(key);
            let granularity = self.granularity(buffer.kind());
            let (kind, heap_size) = (self.kind, self.heap_size);
            let (max_heaps, max_allocations) = (self.max_heaps, self.max_allocations);
            let family = self.families.entry(granularity).or_insert_with(|| {
                HeapSet::new(
                    kind.name(),
                    kind.usage(),
                    heap_size,
                    granularity,
                    max_heaps,
                    max_allocations,
                )
            });
            let block = family.allocate(device, buffer.len())?;
            let entry = PoolEntry {
                granularity,
                block,
                version: buffer.version(),
            };
            if let Some(stale) = self.entries.insert(key, entry) {
                self.release(stale);
            }
            buffer.mark_all_dirty();
            tracing::trace!(
                pool = self.kind.name(),
                heap = block.heap,
                offset = block.offset,
                bytes = buffer.len(),
                "placed buffer"
            );
        }

        let entry = self
            .entries
            .get(key)
            .ok_or(RenderError::StaleHandle("buffer"))?;
        let family = self
            .families
            .get_mut(&entry.granularity)
            .ok_or_else(|| RenderError::MissingResource(format!("{} heap family", self.kind.name())))?;
        if let Some(range) = buffer.take_dirty() {
            let bytes = &buffer.data()[range.start as usize..range.end as usize];
            family.write(device, &entry.block, range.start, bytes, self.kind.write_mode());
        }
        let gpu = family.buffer(entry.block.heap).ok_or_else(|| {
            RenderError::MissingResource(format!("{} heap {}", self.kind.name(), entry.block.heap))
        })?;
        Ok(BufferSlice {
            buffer: gpu,
            heap: entry.block.heap,
            offset: entry.block.offset,
            size: buffer.len(),
        })
    }

    /// Current placement without touching the device.
    pub fn placement(&self, key: BufferKey) -> Option<(u32, u32)> {
        self.entries
            .get(key)
            .map(|e| (e.block.heap, e.block.offset))
    }

    /// Return the buffer's block to its heap. Returns whether it was placed.
    pub fn free(&mut self, key: BufferKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.release(entry);
                true
            }
            None => false,
        }
    }

    fn release(&mut self, entry: PoolEntry) {
        if let Some(family) = self.families.get_mut(&entry.granularity) {
            family.free(entry.block);
        }
    }

    /// Upload deferred writes. A no-op for write-through pools.
    pub fn dispatch<D: Device>(&mut self, device: &mut D) {
        for family in self.families.values_mut() {
            family.dispatch(device);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            buffers: self.entries.len(),
            ..PoolStats::default()
        };
        for family in self.families.values() {
            let HeapStats {
                heaps,
                capacity,
                used,
                writes,
            } = family.stats();
            stats.heaps += heaps;
            stats.capacity += capacity;
            stats.used += used;
            stats.writes += writes;
        }
        stats
    }
}

/// The four pools, selected by buffer kind.
#[derive(Debug)]
pub struct BufferPools {
    pub uniform: BufferPool,
    pub attribute: BufferPool,
    pub vertex: BufferPool,
    pub index: BufferPool,
}

impl BufferPools {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            uniform: BufferPool::new(PoolKind::Uniform, config),
            attribute: BufferPool::new(PoolKind::Attribute, config),
            vertex: BufferPool::new(PoolKind::Vertex, config),
            index: BufferPool::new(PoolKind::Index, config),
        }
    }

    /// The pool backing `kind`; storage buffers are not pooled.
    pub fn for_kind(&mut self, kind: BufferKind) -> Option<&mut BufferPool> {
        match kind {
            BufferKind::Uniform => Some(&mut self.uniform),
            BufferKind::Attribute => Some(&mut self.attribute),
            BufferKind::Vertex { .. } => Some(&mut self.vertex),
            BufferKind::Index(_) => Some(&mut self.index),
            BufferKind::Storage { .. } => None,
        }
    }

    pub fn free(&mut self, key: BufferKey) -> bool {
        // A key is placed in at most one pool, but its kind may be gone.
        self.uniform.free(key)
            | self.attribute.free(key)
            | self.vertex.free(key)
            | self.index.free(key)
    }

    pub fn dispatch<D: Device>(&mut self, device: &mut D) {
        self.index.dispatch(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Scene;
    use crate::headless::HeadlessDevice;
    use crate::types::IndexFormat;

    fn small_config() -> RenderConfig {
        RenderConfig {
            uniform_heap_size: 1024,
            index_heap_size: 4096,
            vertex_heap_size: 4800,
            max_heaps_per_pool: 2,
            ..RenderConfig::default()
        }
    }

    #[test]
    fn uniform_offsets_are_256_aligned() {
        let mut device = HeadlessDevice::new();
        let mut scene = Scene::new();
        let mut pool = BufferPool::new(PoolKind::Uniform, &small_config());
        for len in [16u32, 64, 200] {
            let key = scene.add_buffer(Buffer::new("u", BufferKind::Uniform, vec![1; len as usize]));
            let slice = pool.get(&mut device, key, scene.buffer_mut(key).unwrap()).unwrap();
            assert_eq!(slice.offset % 256, 0);
            assert_eq!(slice.size, len);
        }
        assert_eq!(device.misaligned_writes(), 0);
    }

    #[test]
    fn interleaved_vertices_align_to_stride() {
        let mut device = HeadlessDevice::new();
        let mut scene = Scene::new();
        let mut pool = BufferPool::new(PoolKind::Vertex, &small_config());
        let a = scene.add_buffer(Buffer::new("a", BufferKind::Vertex { stride: 12 }, vec![0; 36]));
        let b = scene.add_buffer(Buffer::new("b", BufferKind::Vertex { stride: 12 }, vec![0; 24]));
        let c = scene.add_buffer(Buffer::new("c", BufferKind::Vertex { stride: 20 }, vec![0; 40]));
        let sa = pool.get(&mut device, a, scene.buffer_mut(a).unwrap()).unwrap();
        let sb = pool.get(&mut device, b, scene.buffer_mut(b).unwrap()).unwrap();
        let sc = pool.get(&mut device, c, scene.buffer_mut(c).unwrap()).unwrap();
        assert_eq!(sa.offset % 12, 0);
        assert_eq!(sb.offset % 12, 0);
        assert_eq!(sc.offset % 20, 0);
        // Different strides live in different heap families.
        assert_ne!(sa.buffer, sc.buffer);
        assert_eq!(sa.buffer, sb.buffer);
    }

    #[test]
    fn unchanged_buffer_is_not_rewritten() {
        let mut device = HeadlessDevice::new();
        let mut scene = Scene::new();
        let mut pool = BufferPool::new(PoolKind::Attribute, &small_config());
        let key = scene.add_buffer(Buffer::new("pos", BufferKind::Attribute, vec![3; 48]));
        let first = pool.get(&mut device, key, scene.buffer_mut(key).unwrap()).unwrap();
        let writes = device.writes().len();
        let second = pool.get(&mut device, key, scene.buffer_mut(key).unwrap()).unwrap();
        assert_eq!(first, second);
        assert_eq!(device.writes().len(), writes);
    }

    #[test]
    fn in_place_write_uploads_only_the_dirty_range() {
        let mut device = HeadlessDevice::new();
        let mut scene = Scene::new();
        let mut pool = BufferPool::new(PoolKind::Attribute, &small_config());
        let key = scene.add_buffer(Buffer::new("pos", BufferKind::Attribute, vec![0; 64]));
        let slice = pool.get(&mut device, key, scene.buffer_mut(key).unwrap()).unwrap();
        device.clear_writes();
        scene.buffer_mut(key).unwrap().write(8, &[9; 8]);
        let again = pool.get(&mut device, key, scene.buffer_mut(key).unwrap()).unwrap();
        assert_eq!(slice, again);
        assert_eq!(device.writes().len(), 1);
        assert_eq!(device.writes()[0].offset, u64::from(slice.offset) + 8);
        assert_eq!(device.writes()[0].len, 8);
    }

    #[test]
    fn size_change_reallocates() {
        let mut device = HeadlessDevice::new();
        let mut scene = Scene::new();
        let mut pool = BufferPool::new(PoolKind::Uniform, &small_config());
        let key = scene.add_buffer(Buffer::new("u", BufferKind::Uniform, vec![0; 64]));
        pool.get(&mut device, key, scene.buffer_mut(key).unwrap()).unwrap();
        scene.buffer_mut(key).unwrap().set_data(vec![1; 512]);
        let slice = pool.get(&mut device, key, scene.buffer_mut(key).unwrap()).unwrap();
        assert_eq!(slice.size, 512);
        assert_eq!(pool.stats().buffers, 1);
        assert_eq!(pool.stats().used, 512);
        let contents = device.buffer_contents(slice.buffer).unwrap();
        let start = slice.offset as usize;
        assert_eq!(contents[start..start + 512], [1; 512]);
    }

    #[test]
    fn index_uploads_are_deferred_and_coalesced() {
        let mut device = HeadlessDevice::new();
        let mut scene = Scene::new();
        let mut pools = BufferPools::new(&small_config());
        let kind = BufferKind::Index(IndexFormat::Uint16);
        let mut keys = Vec::new();
        for i in 0..8u8 {
            let key = scene.add_buffer(Buffer::new("idx", kind, vec![i; 12]));
            let pool = pools.for_kind(kind).unwrap();
            pool.get(&mut device, key, scene.buffer_mut(key).unwrap()).unwrap();
            keys.push(key);
        }
        assert!(device.writes().is_empty());
        pools.dispatch(&mut device);
        assert_eq!(device.writes().len(), 1);
        let buffer = pools.index.get(&mut device, keys[0], scene.buffer_mut(keys[0]).unwrap()).unwrap().buffer;
        let contents = device.buffer_contents(buffer).unwrap();
        for (i, key) in keys.iter().enumerate() {
            let (_, offset) = pools.index.placement(*key).unwrap();
            let start = offset as usize;
            assert_eq!(contents[start..start + 12], [i as u8; 12]);
        }
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let mut device = HeadlessDevice::new();
        let mut scene = Scene::new();
        let mut pool = BufferPool::new(PoolKind::Index, &small_config());
        let key = scene.add_buffer(Buffer::new("u", BufferKind::Uniform, vec![0; 16]));
        let err = pool.get(&mut device, key, scene.buffer_mut(key).unwrap()).unwrap_err();
        assert!(matches!(err, RenderError::WrongBufferKind { expected: "index", .. }));
    }

    #[test]
    fn free_returns_space() {
        let mut device = HeadlessDevice::new();
        let mut scene = Scene::new();
        let mut pools = BufferPools::new(&small_config());
        let key = scene.add_buffer(Buffer::new("u", BufferKind::Uniform, vec![0; 16]));
        pools.uniform.get(&mut device, key, scene.buffer_mut(key).unwrap()).unwrap();
        assert!(pools.free(key));
        assert!(!pools.free(key));
        assert_eq!(pools.uniform.stats().used, 0);
        assert_eq!(pools.uniform.stats().heaps, 1);
    }
}
