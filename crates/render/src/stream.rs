//! Delta-encoded draw commands.
//!
//! Each draw is one metadata word followed by the new values of the fields
//! whose bit is set, in bit order. A field is written when it has not been
//! written since the last `clear` or when it differs from the last value
//! written for it. Every `u32`, including `u32::MAX`, is a valid field value.

use bitflags::bitflags;

use crate::device::{GpuBindGroup, GpuBuffer, GpuPipeline};
use crate::types::IndexFormat;

/// `FIRST_INDEX` value of a non-indexed draw.
pub const NON_INDEXED: u32 = u32::MAX;

const SLOTS: usize = 32;
const FIELDS: usize = 20;

/// Bind group slots tracked by the stream: global, material, dynamic.
pub const BIND_GROUP_SLOTS: usize = 3;
pub const VERTEX_BUFFER_SLOTS: usize = 4;

bitflags! {
    /// Fields of the draw state, in canonical encoding order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StreamFields: u32 {
        const PIPELINE = 1 << 0;
        const BIND_GROUP_0 = 1 << 1;
        const BIND_GROUP_1 = 1 << 2;
        const BIND_GROUP_2 = 1 << 3;
        const DYNAMIC_OFFSET = 1 << 4;
        const VERTEX_BUFFER_0 = 1 << 5;
        const VERTEX_BUFFER_1 = 1 << 6;
        const VERTEX_BUFFER_2 = 1 << 7;
        const VERTEX_BUFFER_3 = 1 << 8;
        const VERTEX_OFFSET_0 = 1 << 9;
        const VERTEX_OFFSET_1 = 1 << 10;
        const VERTEX_OFFSET_2 = 1 << 11;
        const VERTEX_OFFSET_3 = 1 << 12;
        const INDEX_BUFFER = 1 << 13;
        const INDEX_FORMAT = 1 << 14;
        const FIRST_INDEX = 1 << 15;
        const DRAW_COUNT = 1 << 16;
        const BASE_VERTEX = 1 << 17;
        const INSTANCE_COUNT = 1 << 18;
        const FIRST_INSTANCE = 1 << 19;
    }
}

const PIPELINE: usize = 0;
const BIND_GROUP: usize = 1;
const DYNAMIC_OFFSET: usize = 4;
const VERTEX_BUFFER: usize = 5;
const VERTEX_OFFSET: usize = 9;
const INDEX_BUFFER: usize = 13;
const INDEX_FORMAT: usize = 14;
const FIRST_INDEX: usize = 15;
const DRAW_COUNT: usize = 16;
const BASE_VERTEX: usize = 17;
const INSTANCE_COUNT: usize = 18;
const FIRST_INSTANCE: usize = 19;

impl StreamFields {
    pub fn bind_group(slot: usize) -> Self {
        Self::from_bits_truncate(1 << (BIND_GROUP + slot))
    }

    pub fn vertex_buffer(slot: usize) -> Self {
        Self::from_bits_truncate(1 << (VERTEX_BUFFER + slot))
    }

    pub fn vertex_offset(slot: usize) -> Self {
        Self::from_bits_truncate(1 << (VERTEX_OFFSET + slot))
    }
}

/// The full draw state after decoding a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawState {
    values: [u32; SLOTS],
    /// Fields decoded at least once, one bit per field.
    bound: u32,
}

impl DrawState {
    fn get(&self, field: usize) -> Option<u32> {
        (self.bound & (1 << field) != 0).then_some(self.values[field])
    }

    pub fn pipeline(&self) -> Option<GpuPipeline> {
        self.get(PIPELINE).map(GpuPipeline)
    }

    pub fn bind_group(&self, slot: usize) -> Option<GpuBindGroup> {
        self.get(BIND_GROUP + slot).map(GpuBindGroup)
    }

    pub fn dynamic_offset(&self) -> Option<u32> {
        self.get(DYNAMIC_OFFSET)
    }

    /// Buffer and byte offset bound at a vertex slot.
    pub fn vertex_buffer(&self, slot: usize) -> Option<(GpuBuffer, u32)> {
        let buffer = self.get(VERTEX_BUFFER + slot)?;
        let offset = self.get(VERTEX_OFFSET + slot).unwrap_or(0);
        Some((GpuBuffer(buffer), offset))
    }

    pub fn index_buffer(&self) -> Option<(GpuBuffer, IndexFormat)> {
        let buffer = self.get(INDEX_BUFFER)?;
        let format = IndexFormat::from_word(self.get(INDEX_FORMAT)?)?;
        Some((GpuBuffer(buffer), format))
    }

    pub fn is_indexed(&self) -> bool {
        self.first_index().is_some()
    }

    pub fn first_index(&self) -> Option<u32> {
        self.get(FIRST_INDEX).filter(|&first| first != NON_INDEXED)
    }

    pub fn draw_count(&self) -> u32 {
        self.get(DRAW_COUNT).unwrap_or(0)
    }

    /// Signed base vertex of an indexed draw.
    pub fn base_vertex(&self) -> i32 {
        self.get(BASE_VERTEX).map_or(0, |w| w as i32)
    }

    /// First vertex of a non-indexed draw. Shares its field with
    /// [`DrawState::base_vertex`].
    pub fn first_vertex(&self) -> u32 {
        self.get(BASE_VERTEX).unwrap_or(0)
    }

    pub fn instance_count(&self) -> u32 {
        self.get(INSTANCE_COUNT).unwrap_or(1)
    }

    pub fn first_instance(&self) -> u32 {
        self.get(FIRST_INSTANCE).unwrap_or(0)
    }
}

/// Append-only command buffer with a "last written" shadow.
#[derive(Debug, Clone)]
pub struct DrawStream {
    words: Vec<u32>,
    shadow: [u32; SLOTS],
    /// Fields present in `shadow`.
    written: u32,
    pending: [u32; SLOTS],
    /// Fields set through a `set_*` call since the last `clear`.
    staged: u32,
    draws: u32,
}

impl Default for DrawStream {
    fn default() -> Self {
        Self {
            words: Vec::new(),
            shadow: [0; SLOTS],
            written: 0,
            pending: [0; SLOTS],
            staged: 0,
            draws: 0,
        }
    }
}

impl DrawStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty the stream and forget all bound state. Capacity is kept.
    pub fn clear(&mut self) {
        self.words.clear();
        self.written = 0;
        self.staged = 0;
        self.draws = 0;
    }

    fn stage(&mut self, field: usize, value: u32) {
        self.pending[field] = value;
        self.staged |= 1 << field;
    }

    pub fn set_pipeline(&mut self, pipeline: GpuPipeline) {
        self.stage(PIPELINE, pipeline.0);
    }

    pub fn set_bind_group(&mut self, slot: usize, group: GpuBindGroup) {
        debug_assert!(slot < BIND_GROUP_SLOTS);
        self.stage(BIND_GROUP + slot, group.0);
    }

    pub fn set_dynamic_offset(&mut self, offset: u32) {
        self.stage(DYNAMIC_OFFSET, offset);
    }

    pub fn set_vertex_buffer(&mut self, slot: usize, buffer: GpuBuffer, offset: u32) {
        debug_assert!(slot < VERTEX_BUFFER_SLOTS);
        self.stage(VERTEX_BUFFER + slot, buffer.0);
        self.stage(VERTEX_OFFSET + slot, offset);
    }

    pub fn set_index_buffer(&mut self, buffer: GpuBuffer, format: IndexFormat) {
        self.stage(INDEX_BUFFER, buffer.0);
        self.stage(INDEX_FORMAT, format.to_word());
    }

    pub fn set_indexed(&mut self, first_index: u32, count: u32, base_vertex: i32) {
        self.stage(FIRST_INDEX, first_index);
        self.stage(DRAW_COUNT, count);
        self.stage(BASE_VERTEX, base_vertex as u32);
    }

    pub fn set_non_indexed(&mut self, first_vertex: u32, count: u32) {
        self.stage(FIRST_INDEX, NON_INDEXED);
        self.stage(DRAW_COUNT, count);
        self.stage(BASE_VERTEX, first_vertex);
    }

    pub fn set_instances(&mut self, count: u32, first: u32) {
        self.stage(INSTANCE_COUNT, count);
        self.stage(FIRST_INSTANCE, first);
    }

    /// Emit one draw with the current state.
    pub fn draw(&mut self) {
        let header = self.words.len();
        self.words.push(0);
        let mut changed = 0u32;
        for field in 0..FIELDS {
            let bit = 1 << field;
            if self.staged & bit == 0 {
                continue;
            }
            let value = self.pending[field];
            if self.written & bit == 0 || value != self.shadow[field] {
                changed |= bit;
                self.words.push(value);
                self.shadow[field] = value;
            }
        }
        self.written |= changed;
        self.words[header] = changed;
        self.draws += 1;
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn draw_count(&self) -> u32 {
        self.draws
    }

    pub fn decode(&self) -> DrawStreamDecoder<'_> {
        DrawStreamDecoder::new(&self.words)
    }

    /// Number of draws that rebound any of `fields`.
    pub fn count_changes(&self, fields: StreamFields) -> u32 {
        self.decode()
            .filter(|d| d.changed.intersects(fields))
            .count() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedDraw {
    pub changed: StreamFields,
    pub state: DrawState,
}

/// Replays a stream, yielding the cumulative state at each draw.
#[derive(Debug, Clone)]
pub struct DrawStreamDecoder<'a> {
    words: &'a [u32],
    cursor: usize,
    state: DrawState,
}

impl<'a> DrawStreamDecoder<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self {
            words,
            cursor: 0,
            state: DrawState::default(),
        }
    }
}

impl Iterator for DrawStreamDecoder<'_> {
    type Item = DecodedDraw;

    fn next(&mut self) -> Option<DecodedDraw> {
        let &mask = self.words.get(self.cursor)?;
        self.cursor += 1;
        for field in 0..FIELDS {
            if mask & (1 << field) != 0 {
                let Some(&value) = self.words.get(self.cursor) else {
                    tracing::warn!(cursor = self.cursor, "truncated draw stream");
                    self.cursor = self.words.len();
                    return None;
                };
                self.state.values[field] = value;
                self.cursor += 1;
            }
        }
        self.state.bound |= mask;
        Some(DecodedDraw {
            changed: StreamFields::from_bits_truncate(mask),
            state: self.state,
        })
    }
}
