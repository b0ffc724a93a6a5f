//! Per-frame sort keys and the radix sort over them.
//!
//! Pipelines and binding sets touched in a frame get dense ranks in
//! first-seen order. The key packs the binding-set rank above the pipeline
//! rank, each field exactly as wide as that frame's largest rank, so the
//! sort runs as few 8-bit passes as possible.

use std::collections::HashMap;

use crate::device::{GpuBindGroup, GpuPipeline};

/// One render-list entry: its sort key and its index in the list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawEntry {
    pub key: u64,
    pub index: u32,
}

/// Bit widths of the two key fields for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyLayout {
    pub pipeline_bits: u32,
    pub set_bits: u32,
}

impl KeyLayout {
    pub fn pack(&self, set_rank: u32, pipeline_rank: u32) -> u64 {
        (u64::from(set_rank) << self.pipeline_bits) | u64::from(pipeline_rank)
    }

    pub fn total_bits(&self) -> u32 {
        self.pipeline_bits + self.set_bits
    }
}

fn bit_length(n: u32) -> u32 {
    u32::BITS - n.leading_zeros()
}

#[derive(Debug, Default)]
pub struct DrawKeyBuilder {
    pipelines: HashMap<GpuPipeline, u32>,
    sets: HashMap<GpuBindGroup, u32>,
}

impl DrawKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.pipelines.clear();
        self.sets.clear();
    }

    /// Rank of `pipeline` this frame, starting at 1.
    pub fn rank_pipeline(&mut self, pipeline: GpuPipeline) -> u32 {
        let next = self.pipelines.len() as u32 + 1;
        *self.pipelines.entry(pipeline).or_insert(next)
    }

    /// Rank of binding set `group` this frame, starting at 1.
    pub fn rank_set(&mut self, group: GpuBindGroup) -> u32 {
        let next = self.sets.len() as u32 + 1;
        *self.sets.entry(group).or_insert(next)
    }

    pub fn layout(&self) -> KeyLayout {
        KeyLayout {
            pipeline_bits: bit_length(self.pipelines.len() as u32),
            set_bits: bit_length(self.sets.len() as u32),
        }
    }
}

/// Scratch space for [`sort`](SortContext::sort), reused across frames.
#[derive(Debug, Default)]
pub struct SortContext {
    scratch: Vec<DrawEntry>,
}

impl SortContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable LSD radix sort on the low `key_bits` bits, one pass per byte.
    pub fn sort(&mut self, entries: &mut Vec<DrawEntry>, key_bits: u32) {
        let n = entries.len();
        if n < 2 {
            return;
        }
        let passes = key_bits.div_ceil(8).min(8);
        self.scratch.clear();
        self.scratch.resize(n, DrawEntry::default());

        for pass in 0..passes {
            let shift = pass * 8;
            let mut counts = [0usize; 256];
            for entry in entries.iter() {
                counts[((entry.key >> shift) & 0xff) as usize] += 1;
            }
            // A digit shared by every entry leaves the order unchanged.
            if counts.iter().any(|&c| c == n) {
                continue;
            }
            let mut offsets = [0usize; 256];
            let mut total = 0;
            for (digit, count) in counts.iter().enumerate() {
                offsets[digit] = total;
                total += count;
            }
            for entry in entries.iter() {
                let digit = ((entry.key >> shift) & 0xff) as usize;
                self.scratch[offsets[digit]] = *entry;
                offsets[digit] += 1;
            }
            std::mem::swap(entries, &mut self.scratch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xorshift(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    #[test]
    fn ranks_are_dense_in_first_seen_order() {
        let mut keys = DrawKeyBuilder::new();
        assert_eq!(keys.rank_pipeline(GpuPipeline(40)), 1);
        assert_eq!(keys.rank_pipeline(GpuPipeline(7)), 2);
        assert_eq!(keys.rank_pipeline(GpuPipeline(40)), 1);
        assert_eq!(keys.rank_set(GpuBindGroup(99)), 1);
        let layout = keys.layout();
        assert_eq!(layout.pipeline_bits, 2);
        assert_eq!(layout.set_bits, 1);
        assert_eq!(layout.pack(1, 2), 0b110);
    }

    #[test]
    fn key_width_tracks_the_frame() {
        let mut keys = DrawKeyBuilder::new();
        for id in 0..300 {
            keys.rank_pipeline(GpuPipeline(id));
        }
        keys.rank_set(GpuBindGroup(1));
        assert_eq!(keys.layout().pipeline_bits, 9);
        assert_eq!(keys.layout().total_bits(), 10);
        keys.clear();
        assert_eq!(keys.layout().total_bits(), 0);
    }

    #[test]
    fn sort_orders_keys() {
        let mut state = 0x2545_f491_4f6c_dd1d_u64;
        let mut entries: Vec<DrawEntry> = (0..1000)
            .map(|i| DrawEntry {
                key: xorshift(&mut state) % 5000,
                index: i,
            })
            .collect();
        SortContext::new().sort(&mut entries, 13);
        assert!(entries.windows(2).all(|w| w[0].key <= w[1].key));
        assert_eq!(entries.len(), 1000);
    }

    #[test]
    fn sort_is_stable() {
        let mut state = 99u64;
        let mut entries: Vec<DrawEntry> = (0..2000)
            .map(|i| DrawEntry {
                key: xorshift(&mut state) % 7,
                index: i,
            })
            .collect();
        SortContext::new().sort(&mut entries, 3);
        for pair in entries.windows(2) {
            assert!(pair[0].key <= pair[1].key);
            if pair[0].key == pair[1].key {
                assert!(pair[0].index < pair[1].index);
            }
        }
    }

    #[test]
    fn multi_byte_keys_sort_across_passes() {
        let mut entries = vec![
            DrawEntry { key: 0x1_00, index: 0 },
            DrawEntry { key: 0x0_ff, index: 1 },
            DrawEntry { key: 0x1_01, index: 2 },
            DrawEntry { key: 0x0_01, index: 3 },
        ];
        let mut sort = SortContext::new();
        sort.sort(&mut entries, 9);
        let order: Vec<u32> = entries.iter().map(|e| e.index).collect();
        assert_eq!(order, vec![3, 1, 0, 2]);
        // Scratch is reused without affecting results.
        sort.sort(&mut entries, 9);
        let again: Vec<u32> = entries.iter().map(|e| e.index).collect();
        assert_eq!(again, order);
    }
}
