use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{RenderError, Result};

/// Sizing of the buffer pools, the dynamic arena and the registries.
///
/// All sizes are in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Capacity of each uniform-pool heap.
    pub uniform_heap_size: u32,
    /// Capacity of each attribute-pool heap (one attribute per stream).
    pub attribute_heap_size: u32,
    /// Capacity of each interleaved-vertex-pool heap.
    pub vertex_heap_size: u32,
    /// Capacity of each index-pool heap.
    pub index_heap_size: u32,
    /// Heaps a pool may create before failing with `HeapLimitReached`.
    pub max_heaps_per_pool: u32,
    /// Allocator node table size per heap.
    pub max_allocations_per_heap: u32,
    /// Offset alignment of uniform blocks, both pooled and dynamic.
    pub uniform_alignment: u32,
    /// Capacity of the per-frame dynamic uniform arena.
    pub dynamic_arena_size: u32,
    /// Window bound at each dynamic offset; the largest per-draw uniform blob.
    pub dynamic_block_size: u32,
    /// Initial slot capacity of each descriptor registry in scenes made by
    /// `Renderer::new_scene`.
    pub initial_registry_capacity: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            uniform_heap_size: 1 << 20,
            attribute_heap_size: 16 << 20,
            vertex_heap_size: 16 << 20,
            index_heap_size: 8 << 20,
            max_heaps_per_pool: 16,
            max_allocations_per_heap: 16 * 1024,
            uniform_alignment: 256,
            dynamic_arena_size: 4 << 20,
            dynamic_block_size: 256,
            initial_registry_capacity: 64,
        }
    }
}

impl RenderConfig {
    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), "loaded render config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let heaps = [
            ("uniform_heap_size", self.uniform_heap_size),
            ("attribute_heap_size", self.attribute_heap_size),
            ("vertex_heap_size", self.vertex_heap_size),
            ("index_heap_size", self.index_heap_size),
            ("dynamic_arena_size", self.dynamic_arena_size),
            ("dynamic_block_size", self.dynamic_block_size),
        ];
        for (name, size) in heaps {
            if size == 0 {
                return Err(RenderError::Config(format!("{name} must be non-zero")));
            }
            if size % 4 != 0 {
                return Err(RenderError::Config(format!(
                    "{name} must be a multiple of 4, got {size}"
                )));
            }
        }
        if self.max_heaps_per_pool == 0 {
            return Err(RenderError::Config(
                "max_heaps_per_pool must be non-zero".into(),
            ));
        }
        if self.max_allocations_per_heap < 2 {
            return Err(RenderError::Config(
                "max_allocations_per_heap must be at least 2".into(),
            ));
        }
        if !self.uniform_alignment.is_power_of_two() || self.uniform_alignment < 4 {
            return Err(RenderError::Config(format!(
                "uniform_alignment must be a power of two >= 4, got {}",
                self.uniform_alignment
            )));
        }
        if self.uniform_heap_size < self.uniform_alignment {
            return Err(RenderError::Config(
                "uniform_heap_size is smaller than one aligned uniform block".into(),
            ));
        }
        if self.dynamic_block_size > self.dynamic_arena_size {
            return Err(RenderError::Config(format!(
                "dynamic_block_size {} exceeds dynamic_arena_size {}",
                self.dynamic_block_size, self.dynamic_arena_size
            )));
        }
        Ok(())
    }
}
