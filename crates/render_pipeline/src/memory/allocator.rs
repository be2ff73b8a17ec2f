//! Growing block allocator for one memory location

use ash::vk;

use super::block::MemoryBlock;
use super::check_alignment;
use crate::device::{GpuDevice, MemoryLocation};
use crate::error::{RenderError, RenderResult};

/// Region handed out by [`MemoryAllocator::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Memory object backing the region
    pub memory: vk::DeviceMemory,
    /// Index of the owning block
    pub block: usize,
    /// Offset inside the memory object
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
    /// Location the region lives in
    pub location: MemoryLocation,
}

/// Allocator statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Live blocks
    pub blocks: usize,
    /// Total capacity of live blocks
    pub capacity: u64,
    /// Bytes held by live allocations
    pub used: u64,
    /// Number of live allocations
    pub allocations: usize,
    /// Largest contiguous free range in any block
    pub largest_free: u64,
}

/// First-fit allocator over a growable set of memory blocks
#[derive(Debug)]
pub struct MemoryAllocator {
    location: MemoryLocation,
    block_size: u64,
    max_blocks: usize,
    blocks: Vec<Option<MemoryBlock>>,
}

impl MemoryAllocator {
    /// Create an allocator with no blocks
    #[must_use]
    pub const fn new(location: MemoryLocation, block_size: u64, max_blocks: usize) -> Self {
        Self {
            location,
            block_size,
            max_blocks,
            blocks: Vec::new(),
        }
    }

    /// Allocate `size` bytes aligned to `alignment`
    ///
    /// Existing blocks are searched first; a new block of
    /// `max(block_size, size)` bytes is requested when none fits.
    /// `alignment` must be a non-zero power of two.
    pub fn allocate(&mut self, device: &mut dyn GpuDevice, size: u64, alignment: u64) -> RenderResult<Allocation> {
        if size == 0 {
            return Err(RenderError::invalid_state("zero-sized allocation"));
        }
        check_alignment(alignment)?;

        let reused = self.blocks.iter_mut().enumerate().find_map(|(index, slot)| {
            slot.as_mut()
                .and_then(|block| block.allocate(size, alignment))
                .map(|offset| (index, offset))
        });
        if let Some((index, offset)) = reused {
            return Ok(self.allocation(index, offset, size));
        }

        if self.block_count() >= self.max_blocks {
            log::warn!(
                "{:?} pool exhausted: {} bytes requested with {} of {} blocks in use",
                self.location,
                size,
                self.block_count(),
                self.max_blocks
            );
            return Err(RenderError::OutOfMemory { requested: size, alignment });
        }

        let capacity = self.block_size.max(size);
        let memory = device
            .allocate_memory(capacity, self.location)
            .map_err(|e| RenderError::from_allocation(e, size, alignment))?;
        log::debug!("{:?} pool grew by {} bytes", self.location, capacity);

        let mut block = MemoryBlock::new(memory, capacity);
        let offset = block
            .allocate(size, alignment)
            .ok_or(RenderError::OutOfMemory { requested: size, alignment })?;

        let index = match self.blocks.iter().position(Option::is_none) {
            Some(index) => {
                self.blocks[index] = Some(block);
                index
            }
            None => {
                self.blocks.push(Some(block));
                self.blocks.len() - 1
            }
        };

        Ok(self.allocation(index, offset, size))
    }

    /// Return an allocation to its block
    pub fn free(&mut self, allocation: Allocation) {
        let freed = self
            .blocks
            .get_mut(allocation.block)
            .and_then(Option::as_mut)
            .filter(|block| block.memory() == allocation.memory)
            .and_then(|block| block.free(allocation.offset));

        debug_assert!(freed.is_some(), "double free of {allocation:?}");
        if freed.is_none() {
            log::warn!("Ignoring free of unknown allocation {:?}", allocation);
        }
    }

    /// Release empty blocks, keeping the first live block for reuse
    pub fn trim(&mut self, device: &mut dyn GpuDevice) -> usize {
        let mut kept_one = false;
        let mut released = 0;

        for slot in &mut self.blocks {
            let Some(block) = slot else { continue };
            if !block.is_empty() || !kept_one {
                kept_one = true;
                continue;
            }
            device.free_memory(block.memory());
            *slot = None;
            released += 1;
        }

        if released > 0 {
            log::debug!("{:?} pool trimmed {} empty blocks", self.location, released);
        }
        released
    }

    /// Free every block, live allocations included
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        for block in self.blocks.drain(..).flatten() {
            if !block.is_empty() {
                log::warn!(
                    "{:?} block destroyed with {} live allocations",
                    self.location,
                    block.allocation_count()
                );
            }
            device.free_memory(block.memory());
        }
    }

    /// Location served by this allocator
    #[must_use]
    pub const fn location(&self) -> MemoryLocation {
        self.location
    }

    /// Number of live blocks
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.iter().flatten().count()
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        self.blocks.iter().flatten().fold(AllocatorStats::default(), |mut stats, block| {
            stats.blocks += 1;
            stats.capacity += block.capacity();
            stats.used += block.used();
            stats.allocations += block.allocation_count();
            stats.largest_free = stats.largest_free.max(block.largest_free());
            stats
        })
    }

    fn allocation(&self, index: usize, offset: u64, size: u64) -> Allocation {
        let memory = self.blocks[index].as_ref().map_or(vk::DeviceMemory::null(), MemoryBlock::memory);
        Allocation {
            memory,
            block: index,
            offset,
            size,
            location: self.location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HeadlessConfig, HeadlessDevice, ObjectKind};

    fn overlaps(a: &Allocation, b: &Allocation) -> bool {
        a.memory == b.memory && a.offset < b.offset + b.size && b.offset < a.offset + a.size
    }

    #[test]
    fn test_grows_when_block_is_full() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = MemoryAllocator::new(MemoryLocation::DeviceLocal, 1024, 4);

        let a = allocator.allocate(&mut device, 768, 256).unwrap();
        let b = allocator.allocate(&mut device, 768, 256).unwrap();

        assert_ne!(a.block, b.block);
        assert_eq!(allocator.block_count(), 2);
        assert_eq!(device.live_count(ObjectKind::Memory), 2);
    }

    /// Requests larger than the block size get a dedicated block
    #[test]
    fn test_oversized_request_gets_own_block() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = MemoryAllocator::new(MemoryLocation::HostVisible, 1024, 2);

        let big = allocator.allocate(&mut device, 4096, 16).unwrap();
        assert_eq!(big.offset, 0);
        assert_eq!(allocator.stats().capacity, 4096);
    }

    #[test]
    fn test_out_of_memory_at_block_limit() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = MemoryAllocator::new(MemoryLocation::DeviceLocal, 1024, 1);

        allocator.allocate(&mut device, 1024, 1).unwrap();
        let err = allocator.allocate(&mut device, 16, 16).unwrap_err();

        assert!(matches!(err, RenderError::OutOfMemory { requested: 16, alignment: 16 }));
    }

    #[test]
    fn test_device_budget_surfaces_out_of_memory() {
        let mut device = HeadlessDevice::new(HeadlessConfig {
            device_local_budget: Some(1024),
            ..HeadlessConfig::default()
        });
        let mut allocator = MemoryAllocator::new(MemoryLocation::DeviceLocal, 4096, 4);

        let err = allocator.allocate(&mut device, 64, 64).unwrap_err();
        assert!(matches!(err, RenderError::OutOfMemory { requested: 64, alignment: 64 }));
    }

    /// Allocations within capacity never overlap, across blocks and after frees
    #[test]
    fn test_live_allocations_disjoint() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = MemoryAllocator::new(MemoryLocation::DeviceLocal, 64 * 1024, 4);
        let mut live: Vec<Allocation> = Vec::new();

        for round in 0..200_u64 {
            if round % 4 == 3 {
                let victim = live.remove((round as usize * 7) % live.len());
                allocator.free(victim);
            }
            let allocation = allocator.allocate(&mut device, 64 + (round * 37) % 500, 64).unwrap();
            assert!(live.iter().all(|other| !overlaps(other, &allocation)));
            live.push(allocation);
        }

        assert_eq!(allocator.stats().allocations, live.len());
    }

    #[test]
    fn test_trim_keeps_first_block() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = MemoryAllocator::new(MemoryLocation::DeviceLocal, 1024, 4);

        let allocations: Vec<_> = (0..3).map(|_| allocator.allocate(&mut device, 1024, 1).unwrap()).collect();
        for allocation in allocations {
            allocator.free(allocation);
        }

        assert_eq!(allocator.trim(&mut device), 2);
        assert_eq!(allocator.block_count(), 1);
        assert_eq!(device.live_count(ObjectKind::Memory), 1);

        allocator.destroy(&mut device);
        assert_eq!(device.live_count(ObjectKind::Memory), 0);
    }

    /// A request near `u64::MAX` neither wraps into a live block nor panics
    #[test]
    fn test_huge_request_is_out_of_memory() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = MemoryAllocator::new(MemoryLocation::DeviceLocal, 1024, 1);

        let first = allocator.allocate(&mut device, 64, 64).unwrap();
        let err = allocator.allocate(&mut device, u64::MAX - 10, 1).unwrap_err();

        assert!(matches!(err, RenderError::OutOfMemory { requested, alignment: 1 } if requested == u64::MAX - 10));
        assert_eq!(allocator.stats().used, first.size);
        assert_eq!(allocator.stats().allocations, 1);
        assert_eq!(allocator.block_count(), 1);
    }

    /// With room to grow, the oversized request reaches the device and fails there
    #[test]
    fn test_huge_host_request_fails_without_growing() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = MemoryAllocator::new(MemoryLocation::HostVisible, 1024, 4);

        allocator.allocate(&mut device, 64, 64).unwrap();
        let err = allocator.allocate(&mut device, u64::MAX - 10, 64).unwrap_err();

        assert!(matches!(err, RenderError::OutOfMemory { alignment: 64, .. }));
        assert_eq!(allocator.block_count(), 1);
        assert_eq!(device.live_count(ObjectKind::Memory), 1);
    }

    #[test]
    fn test_invalid_alignment_rejected() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = MemoryAllocator::new(MemoryLocation::DeviceLocal, 1024, 1);

        for alignment in [0, 3, 100] {
            let err = allocator.allocate(&mut device, 64, alignment).unwrap_err();
            assert!(matches!(err, RenderError::InvalidState(_)), "alignment {alignment}: {err:?}");
        }
        assert_eq!(allocator.block_count(), 0);
        assert_eq!(device.live_count(ObjectKind::Memory), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_asserts_in_debug() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = MemoryAllocator::new(MemoryLocation::DeviceLocal, 1024, 1);

        let allocation = allocator.allocate(&mut device, 64, 1).unwrap();
        allocator.free(allocation);
        allocator.free(allocation);
    }
}
