//! A single device memory block with an address-ordered free list

use ash::vk;
use std::collections::BTreeMap;

use super::align_up;

/// Free byte range inside a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRange {
    /// First free byte
    pub offset: u64,
    /// Length in bytes
    pub size: u64,
}

impl FreeRange {
    const fn end(self) -> u64 {
        self.offset + self.size
    }
}

/// One device memory allocation carved up by first-fit
///
/// Live allocations never overlap; freed ranges are merged with their
/// address neighbours so the free list stays sorted and minimal.
#[derive(Debug)]
pub struct MemoryBlock {
    memory: vk::DeviceMemory,
    capacity: u64,
    free: Vec<FreeRange>,
    live: BTreeMap<u64, u64>,
}

impl MemoryBlock {
    /// Wrap a freshly allocated memory object
    #[must_use]
    pub fn new(memory: vk::DeviceMemory, capacity: u64) -> Self {
        Self {
            memory,
            capacity,
            free: vec![FreeRange { offset: 0, size: capacity }],
            live: BTreeMap::new(),
        }
    }

    /// First-fit allocation; `None` when no free range can hold the request
    ///
    /// `alignment` must be a power of two.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        if size > self.capacity {
            return None;
        }
        let (index, offset) = self.free.iter().enumerate().find_map(|(index, range)| {
            let offset = align_up(range.offset, alignment)?;
            let end = offset.checked_add(size)?;
            (end <= range.end()).then_some((index, offset))
        })?;

        let range = self.free[index];
        let leading = FreeRange { offset: range.offset, size: offset - range.offset };
        let trailing = FreeRange { offset: offset + size, size: range.end() - (offset + size) };

        match (leading.size > 0, trailing.size > 0) {
            (true, true) => {
                self.free[index] = leading;
                self.free.insert(index + 1, trailing);
            }
            (true, false) => self.free[index] = leading,
            (false, true) => self.free[index] = trailing,
            (false, false) => {
                self.free.remove(index);
            }
        }

        self.live.insert(offset, size);
        Some(offset)
    }

    /// Return a live allocation to the free list
    ///
    /// Returns the freed size, or `None` when `offset` is not live.
    pub fn free(&mut self, offset: u64) -> Option<u64> {
        let size = self.live.remove(&offset)?;
        let index = self.free.partition_point(|range| range.offset < offset);
        self.free.insert(index, FreeRange { offset, size });

        // Merge with the following range, then with the preceding one
        if index + 1 < self.free.len() && self.free[index].end() == self.free[index + 1].offset {
            self.free[index].size += self.free[index + 1].size;
            self.free.remove(index + 1);
        }
        if index > 0 && self.free[index - 1].end() == self.free[index].offset {
            self.free[index - 1].size += self.free[index].size;
            self.free.remove(index);
        }

        Some(size)
    }

    /// Underlying memory object
    #[must_use]
    pub const fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Block size in bytes
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes held by live allocations
    #[must_use]
    pub fn used(&self) -> u64 {
        self.live.values().sum()
    }

    /// Number of live allocations
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.live.len()
    }

    /// Whether no allocation is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Largest contiguous free range
    #[must_use]
    pub fn largest_free(&self) -> u64 {
        self.free.iter().map(|range| range.size).max().unwrap_or(0)
    }

    /// Free ranges in address order
    #[must_use]
    pub fn free_ranges(&self) -> &[FreeRange] {
        &self.free
    }

    /// Live allocations as `(offset, size)` in address order
    pub fn live_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.live.iter().map(|(&offset, &size)| (offset, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn block(capacity: u64) -> MemoryBlock {
        MemoryBlock::new(vk::DeviceMemory::from_raw(1), capacity)
    }

    fn assert_disjoint(block: &MemoryBlock) {
        let ranges: Vec<_> = block.live_ranges().collect();
        for pair in ranges.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlap: {pair:?}");
        }
        if let Some(&(offset, size)) = ranges.last() {
            assert!(offset + size <= block.capacity());
        }
    }

    #[test]
    fn test_first_fit_and_alignment() {
        let mut block = block(1024);

        assert_eq!(block.allocate(10, 1), Some(0));
        assert_eq!(block.allocate(16, 64), Some(64));
        assert_eq!(block.allocate(4, 4), Some(12));
        assert_eq!(block.free_ranges().len(), 3);
        assert_eq!(block.used(), 30);
    }

    #[test]
    fn test_reuses_hole_before_tail() {
        let mut block = block(256);
        let a = block.allocate(64, 16).unwrap();
        let _b = block.allocate(64, 16).unwrap();

        block.free(a);
        assert_eq!(block.allocate(32, 16), Some(a));
    }

    /// Freeing everything collapses the free list back to one range
    #[test]
    fn test_coalescing_restores_single_range() {
        let mut block = block(4096);
        let offsets: Vec<u64> = (0..8).map(|_| block.allocate(100, 32).unwrap()).collect();

        for offset in offsets.iter().step_by(2) {
            block.free(*offset);
        }
        for offset in offsets.iter().skip(1).step_by(2) {
            block.free(*offset);
        }

        assert!(block.is_empty());
        assert_eq!(block.free_ranges(), &[FreeRange { offset: 0, size: 4096 }]);
        assert_eq!(block.largest_free(), 4096);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut block = block(128);
        assert!(block.allocate(128, 1).is_some());
        assert_eq!(block.allocate(1, 1), None);
    }

    #[test]
    fn test_request_past_address_space_does_not_fit() {
        let mut block = block(1024);
        assert_eq!(block.allocate(64, 64), Some(0));

        assert_eq!(block.allocate(u64::MAX - 10, 1), None);
        assert_eq!(block.allocate(u64::MAX, 1 << 63), None);
        assert_eq!(block.allocate(1025, 1), None);
        assert_eq!(block.used(), 64);
        assert_disjoint(&block);
    }

    #[test]
    fn test_unknown_free_is_rejected() {
        let mut block = block(128);
        let offset = block.allocate(32, 1).unwrap();
        assert_eq!(block.free(offset), Some(32));
        assert_eq!(block.free(offset), None);
    }

    /// Deterministic allocate/free churn never yields overlapping live ranges
    #[test]
    fn test_churn_never_overlaps() {
        let mut block = block(64 * 1024);
        let mut live = Vec::new();
        let mut seed = 0x2545_f491_u64;

        for _ in 0..2000 {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            let roll = seed >> 33;

            if roll % 3 == 0 && !live.is_empty() {
                let victim = live.swap_remove((roll as usize / 3) % live.len());
                assert!(block.free(victim).is_some());
            } else {
                let size = 1 + roll % 700;
                let alignment = 1 << (roll % 8);
                if let Some(offset) = block.allocate(size, alignment) {
                    assert_eq!(offset % alignment, 0);
                    live.push(offset);
                }
            }
            assert_disjoint(&block);
        }

        for offset in live {
            block.free(offset);
        }
        assert_eq!(block.free_ranges().len(), 1);
    }
}
