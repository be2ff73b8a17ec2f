//! Explicit memory management
//!
//! Device memory is requested in large blocks and sub-allocated:
//!
//! - [`MemoryAllocator`]: first-fit free list per block, grows up to a block limit
//! - [`StackAllocator`]: bump allocation with markers for per-frame transient data
//! - [`MemoryPools`]: one allocator per [`MemoryLocation`]

pub mod allocator;
pub mod block;
pub mod stack;

pub use allocator::{AllocatorStats, Allocation, MemoryAllocator};
pub use block::{FreeRange, MemoryBlock};
pub use stack::{StackAllocator, StackMarker};

use crate::config::MemoryConfig;
use crate::device::{GpuDevice, MemoryLocation};
use crate::error::{RenderError, RenderResult};

/// Round `value` up to a power-of-two `alignment`
///
/// `None` when the rounded value does not fit in a `u64`.
pub(crate) const fn align_up(value: u64, alignment: u64) -> Option<u64> {
    let mask = alignment - 1;
    match value.checked_add(mask) {
        Some(bumped) => Some(bumped & !mask),
        None => None,
    }
}

/// Reject alignments the bit-mask rounding in [`align_up`] cannot honour
pub(crate) fn check_alignment(alignment: u64) -> RenderResult<()> {
    if alignment.is_power_of_two() {
        Ok(())
    } else {
        Err(RenderError::InvalidState(format!("alignment {alignment} is not a power of two")))
    }
}

/// Allocators for every memory location the pipeline uses
#[derive(Debug)]
pub struct MemoryPools {
    device_local: MemoryAllocator,
    host_visible: MemoryAllocator,
}

impl MemoryPools {
    /// Create empty pools; blocks are requested on first use
    #[must_use]
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            device_local: MemoryAllocator::new(MemoryLocation::DeviceLocal, config.block_size, config.max_blocks),
            host_visible: MemoryAllocator::new(MemoryLocation::HostVisible, config.block_size, config.max_blocks),
        }
    }

    /// Allocator serving `location`
    pub fn get_mut(&mut self, location: MemoryLocation) -> &mut MemoryAllocator {
        match location {
            MemoryLocation::DeviceLocal => &mut self.device_local,
            MemoryLocation::HostVisible => &mut self.host_visible,
        }
    }

    /// Allocator serving `location`
    #[must_use]
    pub const fn get(&self, location: MemoryLocation) -> &MemoryAllocator {
        match location {
            MemoryLocation::DeviceLocal => &self.device_local,
            MemoryLocation::HostVisible => &self.host_visible,
        }
    }

    /// Release empty blocks beyond the first in every pool
    pub fn trim(&mut self, device: &mut dyn GpuDevice) -> usize {
        self.device_local.trim(device) + self.host_visible.trim(device)
    }

    /// Free every block
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        self.device_local.destroy(device);
        self.host_visible.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), Some(0));
        assert_eq!(align_up(1, 256), Some(256));
        assert_eq!(align_up(256, 256), Some(256));
        assert_eq!(align_up(257, 16), Some(272));
        assert_eq!(align_up(7, 1), Some(7));
    }

    #[test]
    fn test_align_up_overflow() {
        assert_eq!(align_up(u64::MAX, 1), Some(u64::MAX));
        assert_eq!(align_up(u64::MAX - 10, 64), None);
    }

    #[test]
    fn test_check_alignment() {
        assert!(check_alignment(1).is_ok());
        assert!(check_alignment(4096).is_ok());
        assert!(matches!(check_alignment(0), Err(RenderError::InvalidState(_))));
        assert!(matches!(check_alignment(3), Err(RenderError::InvalidState(_))));
        assert!(matches!(check_alignment(48), Err(RenderError::InvalidState(_))));
    }
}
