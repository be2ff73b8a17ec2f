//! Per-slot frame resources
//!
//! Each frame in flight owns a fence, its acquire/present semaphores and a
//! transient arena. The arena is a persistently mapped host-visible buffer
//! sub-allocated with a [`StackAllocator`]; it is reset at the start of the
//! slot's next frame, after the slot's fence has signaled.

use ash::vk;

use crate::device::GpuDevice;
use crate::error::RenderResult;
use crate::memory::{align_up, MemoryPools, StackAllocator, StackMarker};
use crate::resource::{Buffer, BufferUsage};

/// Transient per-frame data: uniforms, UI vertices, debug lines
#[derive(Debug)]
pub struct FrameArena {
    buffer: Buffer,
    stack: StackAllocator,
}

impl FrameArena {
    /// Create and map an arena of `capacity` bytes
    pub fn new(device: &mut dyn GpuDevice, pools: &mut MemoryPools, capacity: u64) -> RenderResult<Self> {
        let mut buffer = Buffer::new(device, pools, capacity, BufferUsage::Transient)?;
        if let Err(e) = buffer.map(device) {
            buffer.destroy(device, pools);
            return Err(e);
        }

        Ok(Self {
            buffer,
            stack: StackAllocator::new(capacity),
        })
    }

    /// Copy `bytes` into the arena and return their offset
    pub fn push(&mut self, device: &mut dyn GpuDevice, bytes: &[u8], alignment: u64) -> RenderResult<u64> {
        let offset = self.stack.allocate(bytes.len() as u64, alignment)?;
        if let Err(e) = self.buffer.write(device, offset, bytes) {
            self.stack.free(offset)?;
            return Err(e);
        }
        Ok(offset)
    }

    /// Current position
    #[must_use]
    pub fn marker(&self) -> StackMarker {
        self.stack.marker()
    }

    /// Drop everything pushed after `marker`
    pub fn reset_to(&mut self, marker: StackMarker) -> RenderResult<()> {
        self.stack.reset_to(marker)
    }

    /// Drop everything; the slot's previous frame must have completed
    pub fn reset(&mut self) {
        self.stack.reset();
    }

    /// Make this frame's writes visible to the device
    pub fn flush(&mut self, device: &mut dyn GpuDevice) -> RenderResult<()> {
        let used = self.stack.used();
        if used == 0 {
            return Ok(());
        }
        let size = self.buffer.size();
        let len = align_up(used, device.limits().non_coherent_atom_size.max(1)).map_or(size, |len| len.min(size));
        self.buffer.flush_range(device, 0, len)
    }

    /// Buffer handle
    #[must_use]
    pub const fn buffer(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Bytes pushed this frame
    #[must_use]
    pub const fn used(&self) -> u64 {
        self.stack.used()
    }

    /// Most bytes ever pushed in one frame
    #[must_use]
    pub const fn high_water(&self) -> u64 {
        self.stack.high_water()
    }

    /// Capacity in bytes
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.stack.capacity()
    }

    /// Unmap and release the buffer
    pub fn destroy(self, device: &mut dyn GpuDevice, pools: &mut MemoryPools) {
        self.buffer.destroy(device, pools);
    }
}

/// Synchronization and transient data of one frame in flight
#[derive(Debug)]
pub struct FrameSlot {
    /// Signaled when the slot's last submission completes; created signaled
    pub fence: vk::Fence,
    /// Signaled by acquire, waited by submit
    pub image_available: vk::Semaphore,
    /// Signaled by submit, waited by present
    pub render_finished: vk::Semaphore,
    /// Transient arena
    pub arena: FrameArena,
    /// Frame number of the last submission from this slot
    pub submitted_frame: Option<u64>,
}

impl FrameSlot {
    /// Create the sync objects and arena
    pub fn new(device: &mut dyn GpuDevice, pools: &mut MemoryPools, arena_capacity: u64) -> RenderResult<Self> {
        let fence = device.create_fence(true)?;
        let image_available = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_fence(fence);
                return Err(e.into());
            }
        };
        let render_finished = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_semaphore(image_available);
                device.destroy_fence(fence);
                return Err(e.into());
            }
        };
        let arena = match FrameArena::new(device, pools, arena_capacity) {
            Ok(arena) => arena,
            Err(e) => {
                device.destroy_semaphore(render_finished);
                device.destroy_semaphore(image_available);
                device.destroy_fence(fence);
                return Err(e);
            }
        };

        Ok(Self {
            fence,
            image_available,
            render_finished,
            arena,
            submitted_frame: None,
        })
    }

    /// Destroy everything; the device must be idle
    pub fn destroy(self, device: &mut dyn GpuDevice, pools: &mut MemoryPools) {
        self.arena.destroy(device, pools);
        device.destroy_semaphore(self.render_finished);
        device.destroy_semaphore(self.image_available);
        device.destroy_fence(self.fence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::device::{HeadlessConfig, HeadlessDevice, ObjectKind};

    #[test]
    fn test_push_aligns_and_writes() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut pools = MemoryPools::new(&MemoryConfig::default());
        let mut arena = FrameArena::new(&mut device, &mut pools, 4096).unwrap();

        let first = arena.push(&mut device, &[1, 2, 3], 4).unwrap();
        let second = arena.push(&mut device, &[4; 16], 256).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 256);
        assert_eq!(arena.used(), 272);

        arena.reset();
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.high_water(), 272);
        arena.destroy(&mut device, &mut pools);
        pools.destroy(&mut device);
        assert_eq!(device.live_total(), 0);
    }

    /// A marker rolls back a partially recorded frame
    #[test]
    fn test_marker_rollback() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut pools = MemoryPools::new(&MemoryConfig::default());
        let mut arena = FrameArena::new(&mut device, &mut pools, 1024).unwrap();

        arena.push(&mut device, &[0; 64], 16).unwrap();
        let marker = arena.marker();
        arena.push(&mut device, &[0; 128], 16).unwrap();
        arena.reset_to(marker).unwrap();
        assert_eq!(arena.used(), 64);

        assert!(arena.push(&mut device, &[0; 2048], 16).is_err());
        assert_eq!(arena.used(), 64);
        arena.destroy(&mut device, &mut pools);
    }

    #[test]
    fn test_flush_reaches_device() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut pools = MemoryPools::new(&MemoryConfig::default());
        let mut arena = FrameArena::new(&mut device, &mut pools, 1024).unwrap();

        arena.push(&mut device, &[7; 8], 4).unwrap();
        arena.flush(&mut device).unwrap();
        assert!(device.stats().flushes >= 1);
        arena.destroy(&mut device, &mut pools);
    }

    #[test]
    fn test_slot_lifecycle() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut pools = MemoryPools::new(&MemoryConfig::default());

        let slot = FrameSlot::new(&mut device, &mut pools, 1024).unwrap();
        assert!(device.fence_signaled(slot.fence).unwrap());
        assert_eq!(device.live_count(ObjectKind::Semaphore), 2);

        slot.destroy(&mut device, &mut pools);
        assert_eq!(device.live_count(ObjectKind::Fence), 0);
        assert_eq!(device.live_count(ObjectKind::Buffer), 0);
    }
}
