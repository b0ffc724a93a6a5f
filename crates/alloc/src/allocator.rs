use crate::small_float;

const NUM_TOP_BINS: usize = 32;
const BINS_PER_LEAF: usize = 8;
const TOP_BINS_INDEX_SHIFT: u32 = 3;
const LEAF_BINS_INDEX_MASK: u32 = 0x7;
const NUM_LEAF_BINS: usize = NUM_TOP_BINS * BINS_PER_LEAF;

const UNUSED: u32 = u32::MAX;

/// Errors from [`Allocator::free`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("slot {0} is not a live allocation")]
    NotAllocated(u32),
}

/// A live allocation: byte offset plus the node slot needed to free it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub offset: u32,
    pub slot: u32,
}

/// Summary of free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageReport {
    /// Sum of all free region sizes.
    pub total_free_space: u32,
    /// Lower bound on the largest request that is guaranteed to succeed.
    pub largest_free_region: u32,
}

/// One contiguous region, as reported by [`Allocator::regions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u32,
    pub size: u32,
    pub used: bool,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    data_offset: u32,
    data_size: u32,
    bin_list_prev: u32,
    bin_list_next: u32,
    neighbor_prev: u32,
    neighbor_next: u32,
    used: bool,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            data_offset: 0,
            data_size: 0,
            bin_list_prev: UNUSED,
            bin_list_next: UNUSED,
            neighbor_prev: UNUSED,
            neighbor_next: UNUSED,
            used: false,
        }
    }
}

/// Lowest set bit at or above `start`, if any.
fn find_lowest_set_bit_after(mask: u32, start: u32) -> Option<u32> {
    if start >= u32::BITS {
        return None;
    }
    let bits_after = mask & !((1u32 << start) - 1);
    (bits_after != 0).then(|| bits_after.trailing_zeros())
}

/// Segregated-fit allocator with a fixed node table.
///
/// Free blocks are filed in 256 size classes (see [`small_float`]). A 32-bit
/// mask tracks which exponent rows are populated and an 8-bit mask per row
/// tracks populated mantissa columns, so a suitable bin is found with two
/// find-first-set operations.
#[derive(Debug, Clone)]
pub struct Allocator {
    size: u32,
    max_allocs: u32,
    free_storage: u32,

    used_bins_top: u32,
    used_bins: [u8; NUM_TOP_BINS],
    bin_indices: [u32; NUM_LEAF_BINS],

    nodes: Vec<Node>,
    free_nodes: Vec<u32>,
    free_offset: u32,
}

impl Allocator {
    /// An allocator over `[0, size)` with room for `max_allocs` nodes
    /// (live allocations plus free regions).
    pub fn new(size: u32, max_allocs: u32) -> Self {
        let max_allocs = max_allocs.max(2);
        let mut allocator = Self {
            size,
            max_allocs,
            free_storage: 0,
            used_bins_top: 0,
            used_bins: [0; NUM_TOP_BINS],
            bin_indices: [UNUSED; NUM_LEAF_BINS],
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            free_offset: 0,
        };
        allocator.reset();
        allocator
    }

    /// Forget every allocation and return to a single free region.
    pub fn reset(&mut self) {
        self.free_storage = 0;
        self.used_bins_top = 0;
        self.free_offset = self.max_allocs - 1;
        self.used_bins = [0; NUM_TOP_BINS];
        self.bin_indices = [UNUSED; NUM_LEAF_BINS];

        self.nodes = vec![Node::default(); self.max_allocs as usize];
        // Stack of free node ids; the top is at `free_offset`.
        self.free_nodes = (0..self.max_allocs).rev().collect();

        if self.size > 0 {
            self.insert_node_into_bin(self.size, 0);
        }
    }

    pub fn capacity(&self) -> u32 {
        self.size
    }

    pub fn max_allocs(&self) -> u32 {
        self.max_allocs
    }

    /// Reserve `size` units. Returns `None` when no free region is large
    /// enough or the node table is exhausted.
    pub fn allocate(&mut self, size: u32) -> Option<Allocation> {
        // Keep one node in reserve for the split remainder.
        if self.free_offset == 0 {
            tracing::trace!(size, "allocator node table exhausted");
            return None;
        }

        let min_bin_index = small_float::round_up(size);
        let min_top_bin_index = min_bin_index >> TOP_BINS_INDEX_SHIFT;
        let min_leaf_bin_index = min_bin_index & LEAF_BINS_INDEX_MASK;

        let mut top_bin_index = min_top_bin_index;
        let mut leaf_bin_index = None;

        if self.used_bins_top & (1 << top_bin_index) != 0 {
            leaf_bin_index = find_lowest_set_bit_after(
                self.used_bins[top_bin_index as usize] as u32,
                min_leaf_bin_index,
            );
        }

        let leaf_bin_index = match leaf_bin_index {
            Some(leaf) => leaf,
            None => {
                // Any populated row above the requested one is large enough
                // at its lowest column.
                top_bin_index =
                    find_lowest_set_bit_after(self.used_bins_top, min_top_bin_index + 1)?;
                (self.used_bins[top_bin_index as usize] as u32).trailing_zeros()
            }
        };

        let bin_index = ((top_bin_index << TOP_BINS_INDEX_SHIFT) | leaf_bin_index) as usize;

        let node_index = self.bin_indices[bin_index];
        let node = &mut self.nodes[node_index as usize];
        let node_total_size = node.data_size;
        node.data_size = size;
        node.used = true;
        let bin_next = node.bin_list_next;
        let data_offset = node.data_offset;
        let neighbor_next = node.neighbor_next;

        self.bin_indices[bin_index] = bin_next;
        if bin_next != UNUSED {
            self.nodes[bin_next as usize].bin_list_prev = UNUSED;
        }
        self.free_storage -= node_total_size;

        if self.bin_indices[bin_index] == UNUSED {
            self.clear_bin_bit(top_bin_index, leaf_bin_index);
        }

        let remainder = node_total_size - size;
        if remainder > 0 {
            let new_node_index = self.insert_node_into_bin(remainder, data_offset + size);

            if neighbor_next != UNUSED {
                self.nodes[neighbor_next as usize].neighbor_prev = new_node_index;
            }
            let new_node = &mut self.nodes[new_node_index as usize];
            new_node.neighbor_prev = node_index;
            new_node.neighbor_next = neighbor_next;
            self.nodes[node_index as usize].neighbor_next = new_node_index;
        }

        Some(Allocation {
            offset: data_offset,
            slot: node_index,
        })
    }

    /// Release an allocation, merging it with free address neighbours.
    pub fn free(&mut self, allocation: Allocation) -> Result<(), AllocError> {
        let node_index = allocation.slot;
        match self.nodes.get(node_index as usize) {
            Some(node) if node.used && node.data_offset == allocation.offset => {}
            _ => return Err(AllocError::NotAllocated(node_index)),
        }

        let node = self.nodes[node_index as usize];
        let mut offset = node.data_offset;
        let mut size = node.data_size;
        let mut neighbor_prev = node.neighbor_prev;
        let mut neighbor_next = node.neighbor_next;

        if neighbor_prev != UNUSED && !self.nodes[neighbor_prev as usize].used {
            let prev = self.nodes[neighbor_prev as usize];
            offset = prev.data_offset;
            size += prev.data_size;
            self.remove_node_from_bin(neighbor_prev);
            debug_assert_eq!(prev.neighbor_next, node_index);
            neighbor_prev = prev.neighbor_prev;
        }

        if neighbor_next != UNUSED && !self.nodes[neighbor_next as usize].used {
            let next = self.nodes[neighbor_next as usize];
            size += next.data_size;
            self.remove_node_from_bin(neighbor_next);
            debug_assert_eq!(next.neighbor_prev, node_index);
            neighbor_next = next.neighbor_next;
        }

        // Return the freed node before inserting the merged region.
        self.nodes[node_index as usize].used = false;
        self.push_free_node(node_index);

        let combined = self.insert_node_into_bin(size, offset);
        if neighbor_next != UNUSED {
            self.nodes[combined as usize].neighbor_next = neighbor_next;
            self.nodes[neighbor_next as usize].neighbor_prev = combined;
        }
        if neighbor_prev != UNUSED {
            self.nodes[combined as usize].neighbor_prev = neighbor_prev;
            self.nodes[neighbor_prev as usize].neighbor_next = combined;
        }
        Ok(())
    }

    /// Size recorded for a live allocation.
    pub fn allocation_size(&self, allocation: Allocation) -> Option<u32> {
        self.nodes
            .get(allocation.slot as usize)
            .filter(|n| n.used && n.data_offset == allocation.offset)
            .map(|n| n.data_size)
    }

    pub fn storage_report(&self) -> StorageReport {
        let largest_free_region = if self.free_offset > 0 && self.used_bins_top != 0 {
            let top_bin_index = 31 - self.used_bins_top.leading_zeros();
            let leaf_bin_index = 31 - (self.used_bins[top_bin_index as usize] as u32).leading_zeros();
            small_float::to_size((top_bin_index << TOP_BINS_INDEX_SHIFT) | leaf_bin_index)
        } else {
            0
        };
        StorageReport {
            total_free_space: self.free_storage,
            largest_free_region,
        }
    }

    /// Every live node in address order. O(n); for diagnostics and tests.
    pub fn regions(&self) -> Vec<Region> {
        let mut pooled = vec![false; self.max_allocs as usize];
        for &id in &self.free_nodes[..=self.free_offset as usize] {
            pooled[id as usize] = true;
        }
        let mut regions: Vec<Region> = self
            .nodes
            .iter()
            .zip(&pooled)
            .filter(|(_, pooled)| !**pooled)
            .map(|(node, _)| Region {
                offset: node.data_offset,
                size: node.data_size,
                used: node.used,
            })
            .collect();
        regions.sort_by_key(|r| r.offset);
        regions
    }

    fn clear_bin_bit(&mut self, top_bin_index: u32, leaf_bin_index: u32) {
        let top = top_bin_index as usize;
        self.used_bins[top] &= !(1u8 << leaf_bin_index);
        if self.used_bins[top] == 0 {
            self.used_bins_top &= !(1 << top_bin_index);
        }
    }

    fn push_free_node(&mut self, node_index: u32) {
        self.free_offset += 1;
        self.free_nodes[self.free_offset as usize] = node_index;
    }

    fn insert_node_into_bin(&mut self, size: u32, data_offset: u32) -> u32 {
        let bin_index = small_float::round_down(size);
        let top_bin_index = bin_index >> TOP_BINS_INDEX_SHIFT;
        let leaf_bin_index = bin_index & LEAF_BINS_INDEX_MASK;

        if self.bin_indices[bin_index as usize] == UNUSED {
            self.used_bins[top_bin_index as usize] |= 1 << leaf_bin_index;
            self.used_bins_top |= 1 << top_bin_index;
        }

        let top_node_index = self.bin_indices[bin_index as usize];
        let node_index = self.free_nodes[self.free_offset as usize];
        self.free_offset -= 1;

        self.nodes[node_index as usize] = Node {
            data_offset,
            data_size: size,
            bin_list_next: top_node_index,
            ..Node::default()
        };
        if top_node_index != UNUSED {
            self.nodes[top_node_index as usize].bin_list_prev = node_index;
        }
        self.bin_indices[bin_index as usize] = node_index;

        self.free_storage += size;
        node_index
    }

    fn remove_node_from_bin(&mut self, node_index: u32) {
        let node = self.nodes[node_index as usize];

        if node.bin_list_prev != UNUSED {
            // Interior of the list: unlink.
            self.nodes[node.bin_list_prev as usize].bin_list_next = node.bin_list_next;
            if node.bin_list_next != UNUSED {
                self.nodes[node.bin_list_next as usize].bin_list_prev = node.bin_list_prev;
            }
        } else {
            // Head of the list: the bin now starts at the next node.
            let bin_index = small_float::round_down(node.data_size);
            let top_bin_index = bin_index >> TOP_BINS_INDEX_SHIFT;
            let leaf_bin_index = bin_index & LEAF_BINS_INDEX_MASK;

            self.bin_indices[bin_index as usize] = node.bin_list_next;
            if node.bin_list_next != UNUSED {
                self.nodes[node.bin_list_next as usize].bin_list_prev = UNUSED;
            }
            if self.bin_indices[bin_index as usize] == UNUSED {
                self.clear_bin_bit(top_bin_index, leaf_bin_index);
            }
        }

        self.push_free_node(node_index);
        self.free_storage -= node.data_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Free and used regions tile `[0, capacity)` with no gaps or overlaps,
    /// and no two free regions are adjacent.
    fn assert_partitioned(allocator: &Allocator) {
        let regions = allocator.regions();
        let mut cursor = 0;
        let mut free_total = 0;
        for pair in regions.windows(2) {
            assert!(
                pair[0].used || pair[1].used,
                "adjacent free regions {pair:?}"
            );
        }
        for region in &regions {
            assert_eq!(region.offset, cursor, "gap or overlap at {region:?}");
            cursor += region.size;
            if !region.used {
                free_total += region.size;
            }
        }
        assert_eq!(cursor, allocator.capacity());
        assert_eq!(free_total, allocator.storage_report().total_free_space);
    }

    #[test]
    fn fresh_allocator_is_one_free_region() {
        let allocator = Allocator::new(1024, 16);
        let report = allocator.storage_report();
        assert_eq!(report.total_free_space, 1024);
        assert_eq!(report.largest_free_region, 1024);
        assert_eq!(
            allocator.regions(),
            vec![Region {
                offset: 0,
                size: 1024,
                used: false
            }]
        );
    }

    #[test]
    fn allocations_are_disjoint_and_sequential() {
        let mut allocator = Allocator::new(1024, 16);
        let a = allocator.allocate(100).unwrap();
        let b = allocator.allocate(200).unwrap();
        let c = allocator.allocate(50).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 100);
        assert_eq!(c.offset, 300);
        assert_eq!(allocator.storage_report().total_free_space, 1024 - 350);
        assert_eq!(allocator.allocation_size(b), Some(200));
        assert_partitioned(&allocator);
    }

    #[test]
    fn allocate_then_free_round_trips() {
        let mut allocator = Allocator::new(4096, 32);
        let keep = allocator.allocate(300).unwrap();
        let before = allocator.storage_report();

        let a = allocator.allocate(777).unwrap();
        allocator.free(a).unwrap();
        assert_eq!(allocator.storage_report(), before);

        assert!(allocator.allocate(777).is_some());
        allocator.free(keep).unwrap();
        assert_partitioned(&allocator);
    }

    #[test]
    fn freeing_neighbours_coalesces() {
        let mut allocator = Allocator::new(1024, 16);
        let a = allocator.allocate(128).unwrap();
        let b = allocator.allocate(256).unwrap();
        let c = allocator.allocate(640).unwrap();
        assert_eq!(allocator.storage_report().total_free_space, 0);

        allocator.free(b).unwrap();
        allocator.free(a).unwrap();

        let regions = allocator.regions();
        assert_eq!(
            regions,
            vec![
                Region {
                    offset: 0,
                    size: 384,
                    used: false
                },
                Region {
                    offset: c.offset,
                    size: 640,
                    used: true
                },
            ]
        );

        allocator.free(c).unwrap();
        assert_eq!(allocator.regions().len(), 1);
        assert_eq!(allocator.storage_report().largest_free_region, 1024);
    }

    #[test]
    fn exhausted_space_returns_none() {
        let mut allocator = Allocator::new(256, 16);
        assert!(allocator.allocate(256).is_some());
        assert!(allocator.allocate(1).is_none());
    }

    #[test]
    fn exhausted_node_table_returns_none() {
        let mut allocator = Allocator::new(1 << 20, 4);
        let mut live = Vec::new();
        while let Some(a) = allocator.allocate(16) {
            live.push(a);
        }
        assert!(live.len() < 4);
        assert!(allocator.storage_report().total_free_space > 0);
        for a in live {
            allocator.free(a).unwrap();
        }
        assert_partitioned(&allocator);
    }

    #[test]
    fn request_is_never_served_from_a_smaller_block() {
        let mut allocator = Allocator::new(1000, 16);
        // Leaves a free block of 1000 - 9 = 991 that is filed under a class
        // <= 991; a request of 992 must not be served from it.
        let _a = allocator.allocate(9).unwrap();
        assert!(allocator.allocate(992).is_none());
        assert!(allocator.allocate(960).is_some());
    }

    #[test]
    fn double_free_is_rejected() {
        let mut allocator = Allocator::new(1024, 16);
        let a = allocator.allocate(64).unwrap();
        allocator.free(a).unwrap();
        assert_eq!(allocator.free(a), Err(AllocError::NotAllocated(a.slot)));
        assert_partitioned(&allocator);
    }

    #[test]
    fn conservation_under_mixed_workload() {
        let mut allocator = Allocator::new(1 << 16, 256);
        let mut live: Vec<Allocation> = Vec::new();
        // Deterministic xorshift so the sequence is reproducible.
        let mut state = 0x2545_f491_u32;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };
        for _ in 0..2000 {
            let roll = next();
            if roll % 3 != 0 || live.is_empty() {
                if let Some(a) = allocator.allocate(1 + roll % 700) {
                    live.push(a);
                }
            } else {
                let victim = live.swap_remove((roll as usize / 3) % live.len());
                allocator.free(victim).unwrap();
            }
            let used: u32 = live
                .iter()
                .map(|a| allocator.allocation_size(*a).unwrap())
                .sum();
            assert_eq!(
                used + allocator.storage_report().total_free_space,
                allocator.capacity()
            );
        }
        assert_partitioned(&allocator);
        for a in live.drain(..) {
            allocator.free(a).unwrap();
        }
        assert_eq!(allocator.regions().len(), 1);
    }

    #[test]
    fn reset_restores_full_capacity() {
        let mut allocator = Allocator::new(512, 8);
        allocator.allocate(100).unwrap();
        allocator.allocate(100).unwrap();
        allocator.reset();
        assert_eq!(allocator.storage_report().total_free_space, 512);
        assert_eq!(allocator.allocate(512).map(|a| a.offset), Some(0));
    }
}
