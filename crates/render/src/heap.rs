//! Heaps: one device buffer, one [`Allocator`] and a CPU shadow each.
//!
//! A [`HeapSet`] grows by appending heaps and never destroys them. Allocators
//! count in units of the set's granularity, so every byte offset they hand
//! out is a multiple of that granularity.

use std::ops::Range;

use tessera_alloc::{Allocation, Allocator};

use crate::device::{BufferDesc, Device, GpuBuffer};
use crate::error::{RenderError, Result};
use crate::types::{BufferUsages, align_up};

/// Interior-gap threshold for merging the two index upload ranges, as a
/// fraction of their combined span.
pub const COALESCE_GAP_RATIO: f32 = 0.25;

/// Where a block landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapAllocation {
    pub heap: u32,
    pub allocation: Allocation,
    /// Byte offset into the heap buffer.
    pub offset: u32,
    /// Bytes reserved, a multiple of the granularity.
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Copy to the shadow and write to the device at once.
    Immediate,
    /// Copy to the shadow and record the range for [`HeapSet::dispatch`].
    Deferred,
}

/// Dirty byte ranges of one heap, reduced to at most two uploads.
#[derive(Debug, Clone, Default)]
pub struct DirtyRanges {
    ranges: Vec<Range<u32>>,
}

impl DirtyRanges {
    pub fn push(&mut self, range: Range<u32>) {
        if !range.is_empty() {
            self.ranges.push(range);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Reduce to at most two ranges that together cover every dirty byte.
    ///
    /// The range with the lowest start and the range with the highest end are
    /// kept; every other range is folded into whichever of the two is closer.
    /// The pair is then merged when the gap between them is under
    /// [`COALESCE_GAP_RATIO`] of their combined span.
    pub fn coalesce(&self) -> Vec<Range<u32>> {
        let Some(first) = self.ranges.first() else {
            return Vec::new();
        };
        if self.ranges.len() == 1 {
            return vec![first.clone()];
        }

        let low_index = self
            .ranges
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.start)
            .map_or(0, |(i, _)| i);
        let high_index = self
            .ranges
            .iter()
            .enumerate()
            .max_by_key(|(_, r)| r.end)
            .map_or(0, |(i, _)| i);

        let mut low = self.ranges[low_index].clone();
        let mut high = self.ranges[high_index].clone();
        if low_index == high_index {
            // One range spans everything else.
            return vec![low];
        }

        for (i, range) in self.ranges.iter().enumerate() {
            if i == low_index || i == high_index {
                continue;
            }
            let to_low = range.start.saturating_sub(low.end);
            let to_high = high.start.saturating_sub(range.end);
            if to_low <= to_high {
                low.end = low.end.max(range.end);
            } else {
                high.start = high.start.min(range.start);
            }
        }

        if low.end >= high.start {
            return vec![low.start..high.end.max(low.end)];
        }
        let gap = high.start - low.end;
        let span = high.end - low.start;
        if (gap as f32) < COALESCE_GAP_RATIO * span as f32 {
            vec![low.start..high.end]
        } else {
            vec![low, high]
        }
    }
}

#[derive(Debug)]
struct Heap {
    buffer: GpuBuffer,
    allocator: Allocator,
    shadow: Vec<u8>,
    dirty: DirtyRanges,
}

impl Heap {
    /// Write `range` of the shadow, widened to 4-byte boundaries.
    fn upload<D: Device>(&self, device: &mut D, range: Range<u32>) {
        let start = range.start & !3;
        let end = align_up(range.end, 4).min(self.shadow.len() as u32);
        device.write_buffer(
            self.buffer,
            u64::from(start),
            &self.shadow[start as usize..end as usize],
        );
    }
}

/// Usage statistics of one heap set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub heaps: u32,
    pub capacity: u64,
    pub used: u64,
    pub writes: u64,
}

/// An append-only family of equally sized heaps sharing one granularity.
#[derive(Debug)]
pub struct HeapSet {
    name: &'static str,
    usage: BufferUsages,
    granularity: u32,
    units_per_heap: u32,
    max_heaps: u32,
    max_allocations: u32,
    heaps: Vec<Heap>,
    writes: u64,
}

impl HeapSet {
    /// `granularity` must be a non-zero multiple of 4. Heaps hold the largest
    /// multiple of it that fits in `heap_size`.
    pub fn new(
        name: &'static str,
        usage: BufferUsages,
        heap_size: u32,
        granularity: u32,
        max_heaps: u32,
        max_allocations: u32,
    ) -> Self {
        Self {
            name,
            usage: usage | BufferUsages::COPY_DST,
            granularity,
            units_per_heap: heap_size / granularity,
            max_heaps,
            max_allocations,
            heaps: Vec::new(),
            writes: 0,
        }
    }

    pub fn heap_size(&self) -> u32 {
        self.units_per_heap * self.granularity
    }

    pub fn granularity(&self) -> u32 {
        self.granularity
    }

    pub fn heap_count(&self) -> u32 {
        self.heaps.len() as u32
    }

    pub fn buffer(&self, heap: u32) -> Option<GpuBuffer> {
        self.heaps.get(heap as usize).map(|h| h.buffer)
    }

    /// Reserve at least `bytes` (at least one unit), appending a heap when
    /// every existing heap is full.
    pub fn allocate<D: Device>(&mut self, device: &mut D, bytes: u32) -> Result<HeapAllocation> {
        let units = bytes.div_ceil(self.granularity).max(1);
        if units > self.units_per_heap {
            return Err(RenderError::AllocationTooLarge {
                pool: self.name,
                requested: bytes,
                heap_size: self.heap_size(),
            });
        }

        for (index, heap) in self.heaps.iter_mut().enumerate() {
            if let Some(allocation) = heap.allocator.allocate(units) {
                return Ok(self.placed(index as u32, allocation, units));
            }
        }

        if self.heap_count() >= self.max_heaps {
            return Err(RenderError::HeapLimitReached {
                pool: self.name,
                max_heaps: self.max_heaps,
            });
        }
        let index = self.push_heap(device);
        match self.heaps[index as usize].allocator.allocate(units) {
            Some(allocation) => Ok(self.placed(index, allocation, units)),
            // Only reachable when the node table is smaller than one request.
            None => Err(RenderError::AllocationTooLarge {
                pool: self.name,
                requested: bytes,
                heap_size: self.heap_size(),
            }),
        }
    }

    fn placed(&self, heap: u32, allocation: Allocation, units: u32) -> HeapAllocation {
        HeapAllocation {
            heap,
            allocation,
            offset: allocation.offset * self.granularity,
            size: units * self.granularity,
        }
    }

    fn push_heap<D: Device>(&mut self, device: &mut D) -> u32 {
        let index = self.heap_count();
        let size = self.heap_size();
        let label = format!("{}_heap_{index}", self.name);
        let buffer = device.create_buffer(&BufferDesc {
            label: &label,
            size: u64::from(size),
            usage: self.usage,
        });
        self.heaps.push(Heap {
            buffer,
            allocator: Allocator::new(self.units_per_heap, self.max_allocations),
            shadow: vec![0; size as usize],
            dirty: DirtyRanges::default(),
        });
        tracing::debug!(pool = self.name, heap = index, bytes = size, "created heap");
        index
    }

    /// Return a block to its heap. The bytes are left as they are.
    pub fn free(&mut self, block: HeapAllocation) {
        let Some(heap) = self.heaps.get_mut(block.heap as usize) else {
            tracing::warn!(pool = self.name, heap = block.heap, "free on unknown heap");
            return;
        };
        if let Err(err) = heap.allocator.free(block.allocation) {
            tracing::warn!(pool = self.name, heap = block.heap, %err, "free failed");
        }
    }

    /// Copy `data` into the block at `offset` bytes from its start.
    pub fn write<D: Device>(
        &mut self,
        device: &mut D,
        block: &HeapAllocation,
        offset: u32,
        data: &[u8],
        mode: WriteMode,
    ) {
        let Some(heap) = self.heaps.get_mut(block.heap as usize) else {
            tracing::warn!(pool = self.name, heap = block.heap, "write to unknown heap");
            return;
        };
        let start = block.offset + offset;
        let end = start + data.len() as u32;
        heap.shadow[start as usize..end as usize].copy_from_slice(data);
        match mode {
            WriteMode::Immediate => {
                heap.upload(device, start..end);
                self.writes += 1;
            }
            WriteMode::Deferred => heap.dirty.push(start..end),
        }
    }

    /// Upload deferred ranges: at most two writes per heap.
    pub fn dispatch<D: Device>(&mut self, device: &mut D) {
        for (index, heap) in self.heaps.iter_mut().enumerate() {
            if heap.dirty.is_empty() {
                continue;
            }
            let ranges = heap.dirty.coalesce();
            tracing::trace!(pool = self.name, heap = index, uploads = ranges.len(), "dispatch");
            for range in ranges {
                heap.upload(device, range);
                self.writes += 1;
            }
            heap.dirty.clear();
        }
    }

    pub fn stats(&self) -> HeapStats {
        let free_units: u64 = self
            .heaps
            .iter()
            .map(|h| u64::from(h.allocator.storage_report().total_free_space))
            .sum();
        let capacity = u64::from(self.heap_size()) * self.heaps.len() as u64;
        HeapStats {
            heaps: self.heap_count(),
            capacity,
            used: capacity - free_units * u64::from(self.granularity),
            writes: self.writes,
        }
    }
}
