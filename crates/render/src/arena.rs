//! Per-frame ring of dynamic uniform blocks.
//!
//! One device buffer, one shadow, one cursor. Blocks are bound through a
//! single bind group with a dynamic offset, so per-draw uniforms never cost a
//! bind group of their own.

use tessera_common::structural_hash;

use crate::config::RenderConfig;
use crate::device::{
    BindEntry, BindResource, BindingType, BufferDesc, Device, GpuBindGroup, GpuBuffer, GpuLayout,
    LayoutEntry,
};
use crate::error::{RenderError, Result};
use crate::types::{BufferUsages, ShaderStages, align_up};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicBlock {
    pub bind_group: GpuBindGroup,
    pub offset: u32,
}

#[derive(Debug)]
pub struct DynamicArena {
    buffer: GpuBuffer,
    layout: GpuLayout,
    layout_hash: u64,
    bind_group: GpuBindGroup,
    shadow: Vec<u8>,
    cursor: u32,
    alignment: u32,
    block_size: u32,
    blocks: u32,
    writes: u64,
}

impl DynamicArena {
    pub fn new<D: Device>(device: &mut D, config: &RenderConfig) -> Self {
        let capacity = config.dynamic_arena_size;
        let block_size = config.dynamic_block_size;
        let buffer = device.create_buffer(&BufferDesc {
            label: "dynamic_arena",
            size: u64::from(capacity),
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        });
        let entries = [LayoutEntry {
            binding: 0,
            visibility: ShaderStages::VERTEX_FRAGMENT,
            ty: BindingType::UniformBuffer {
                dynamic: true,
                min_size: u64::from(block_size),
            },
        }];
        let layout = device.create_layout(&entries);
        let bind_group = device.create_bind_group(
            layout,
            &[BindEntry {
                binding: 0,
                resource: BindResource::Buffer {
                    buffer,
                    offset: 0,
                    size: u64::from(block_size),
                },
            }],
        );
        tracing::debug!(capacity, block_size, "created dynamic arena");
        Self {
            buffer,
            layout,
            layout_hash: structural_hash(&entries),
            bind_group,
            shadow: vec![0; capacity as usize],
            cursor: 0,
            alignment: config.uniform_alignment,
            block_size,
            blocks: 0,
            writes: 0,
        }
    }

    /// Start a new frame. Previous blocks are overwritten.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.blocks = 0;
    }

    /// Copy `data` at the cursor and advance by its aligned size.
    pub fn allocate(&mut self, data: &[u8]) -> Result<DynamicBlock> {
        if data.len() > self.block_size as usize {
            return Err(RenderError::UniformBlockTooLarge {
                size: data.len(),
                limit: self.block_size,
            });
        }
        let offset = self.cursor;
        let advance = align_up(data.len().max(1) as u32, self.alignment);
        // The whole bound window must fit, not just the payload.
        let window_end = offset.checked_add(self.block_size.max(advance));
        match window_end {
            Some(end) if end <= self.capacity() => {}
            _ => {
                return Err(RenderError::ArenaOverflow {
                    cursor: offset,
                    requested: data.len() as u32,
                    capacity: self.capacity(),
                });
            }
        }
        self.shadow[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        self.cursor = offset + advance;
        self.blocks += 1;
        Ok(DynamicBlock {
            bind_group: self.bind_group,
            offset,
        })
    }

    /// Upload everything written this frame in one write.
    pub fn commit<D: Device>(&mut self, device: &mut D) {
        if self.cursor == 0 {
            return;
        }
        let end = align_up(self.cursor, 4).min(self.capacity());
        device.write_buffer(self.buffer, 0, &self.shadow[..end as usize]);
        self.writes += 1;
        tracing::trace!(bytes = end, blocks = self.blocks, "committed dynamic arena");
    }

    pub fn layout(&self) -> GpuLayout {
        self.layout
    }

    /// Structural hash of the arena's layout, for pipeline keys.
    pub fn layout_hash(&self) -> u64 {
        self.layout_hash
    }

    pub fn bind_group(&self) -> GpuBindGroup {
        self.bind_group
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn capacity(&self) -> u32 {
        self.shadow.len() as u32
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Blocks handed out since the last reset.
    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn destroy<D: Device>(self, device: &mut D) {
        device.destroy_bind_group(self.bind_group);
        device.destroy_layout(self.layout);
        device.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessDevice, ObjectKind};

    fn arena(device: &mut HeadlessDevice, capacity: u32, block: u32) -> DynamicArena {
        let config = RenderConfig {
            dynamic_arena_size: capacity,
            dynamic_block_size: block,
            ..RenderConfig::default()
        };
        DynamicArena::new(device, &config)
    }

    #[test]
    fn blocks_advance_by_aligned_size() {
        let mut device = HeadlessDevice::new();
        let mut arena = arena(&mut device, 4096, 256);
        let a = arena.allocate(&[1; 64]).unwrap();
        let b = arena.allocate(&[2; 200]).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
        assert_eq!(a.bind_group, b.bind_group);
        assert_eq!(arena.cursor(), 512);
    }

    #[test]
    fn commit_issues_one_write() {
        let mut device = HeadlessDevice::new();
        let mut arena = arena(&mut device, 4096, 256);
        arena.commit(&mut device);
        assert!(device.writes().is_empty());
        for i in 0..5u8 {
            arena.allocate(&[i; 16]).unwrap();
        }
        arena.commit(&mut device);
        assert_eq!(device.writes().len(), 1);
        assert_eq!(device.writes()[0].offset, 0);
        assert_eq!(device.writes()[0].len, 5 * 256);
        let contents = device.buffer_contents(device.writes()[0].buffer).unwrap();
        assert_eq!(contents[4 * 256..4 * 256 + 16], [4; 16]);
    }

    #[test]
    fn overflow_is_reported() {
        let mut device = HeadlessDevice::new();
        let mut arena = arena(&mut device, 1024, 256);
        for _ in 0..4 {
            arena.allocate(&[0; 64]).unwrap();
        }
        let err = arena.allocate(&[0; 64]).unwrap_err();
        assert!(matches!(err, RenderError::ArenaOverflow { cursor: 1024, .. }));
    }

    #[test]
    fn oversized_blob_is_rejected() {
        let mut device = HeadlessDevice::new();
        let mut arena = arena(&mut device, 4096, 256);
        let err = arena.allocate(&[0; 257]).unwrap_err();
        assert!(matches!(err, RenderError::UniformBlockTooLarge { size: 257, limit: 256 }));
        assert_eq!(arena.cursor(), 0);
    }

    #[test]
    fn reset_rewinds_cursor() {
        let mut device = HeadlessDevice::new();
        let mut arena = arena(&mut device, 1024, 256);
        arena.allocate(&[0; 64]).unwrap();
        arena.reset();
        assert_eq!(arena.cursor(), 0);
        assert_eq!(arena.allocate(&[0; 64]).unwrap().offset, 0);
    }

    #[test]
    fn destroy_releases_device_objects() {
        let mut device = HeadlessDevice::new();
        let arena = arena(&mut device, 1024, 256);
        arena.destroy(&mut device);
        assert_eq!(device.live(ObjectKind::Buffer), 0);
        assert_eq!(device.live(ObjectKind::Layout), 0);
        assert_eq!(device.live(ObjectKind::BindGroup), 0);
    }
}
