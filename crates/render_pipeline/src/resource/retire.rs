//! Deferred destruction keyed by frame number

use ash::vk;
use std::collections::VecDeque;

use super::attachment::Attachment;
use super::buffer::Buffer;
use crate::device::GpuDevice;
use crate::memory::MemoryPools;

/// Resource waiting for the GPU to stop using it
#[derive(Debug)]
pub enum Retired {
    /// Buffer and its pool range
    Buffer(Buffer),
    /// Attachment image, view and memory
    Attachment(Attachment),
    /// Framebuffer of a replaced attachment generation
    Framebuffer(vk::Framebuffer),
    /// Semaphore left signaled by an abandoned frame
    Semaphore(vk::Semaphore),
}

impl Retired {
    fn destroy(self, device: &mut dyn GpuDevice, pools: &mut MemoryPools) {
        match self {
            Self::Buffer(buffer) => buffer.destroy(device, pools),
            Self::Attachment(attachment) => attachment.destroy(device),
            Self::Framebuffer(framebuffer) => device.destroy_framebuffer(framebuffer),
            Self::Semaphore(semaphore) => device.destroy_semaphore(semaphore),
        }
    }
}

/// Retired resources tagged with the frame count they must outlive
///
/// An entry tagged `n` is destroyed once every frame numbered below `n` has
/// completed on the GPU.
#[derive(Debug, Default)]
pub struct RetireQueue {
    entries: VecDeque<(u64, Retired)>,
}

impl RetireQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defer destruction until frames `< frame` complete
    pub fn retire(&mut self, frame: u64, resource: Retired) {
        self.entries.push_back((frame, resource));
    }

    /// Destroy every entry whose frames have completed
    ///
    /// `completed` is the number of frames known complete. Returns the number
    /// of destroyed resources.
    pub fn collect(&mut self, completed: u64, device: &mut dyn GpuDevice, pools: &mut MemoryPools) -> usize {
        let mut destroyed = 0;
        let mut kept = VecDeque::with_capacity(self.entries.len());

        for (frame, resource) in self.entries.drain(..) {
            if frame <= completed {
                resource.destroy(device, pools);
                destroyed += 1;
            } else {
                kept.push_back((frame, resource));
            }
        }

        self.entries = kept;
        if destroyed > 0 {
            log::trace!("Destroyed {} retired resources ({} pending)", destroyed, self.entries.len());
        }
        destroyed
    }

    /// Destroy everything; the device must be idle
    pub fn drain_all(&mut self, device: &mut dyn GpuDevice, pools: &mut MemoryPools) -> usize {
        let count = self.entries.len();
        for (_, resource) in self.entries.drain(..) {
            resource.destroy(device, pools);
        }
        count
    }

    /// Entries still waiting
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::device::{HeadlessConfig, HeadlessDevice, ObjectKind};
    use crate::resource::buffer::BufferUsage;

    #[test]
    fn test_collect_respects_frame_tags() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut pools = MemoryPools::new(&MemoryConfig::default());
        let mut queue = RetireQueue::new();

        for frame in [1, 2, 3] {
            let buffer = Buffer::new(&mut device, &mut pools, 64, BufferUsage::Staging).unwrap();
            queue.retire(frame, Retired::Buffer(buffer));
        }

        assert_eq!(queue.collect(0, &mut device, &mut pools), 0);
        assert_eq!(queue.collect(2, &mut device, &mut pools), 2);
        assert_eq!(device.live_count(ObjectKind::Buffer), 1);

        assert_eq!(queue.drain_all(&mut device, &mut pools), 1);
        assert!(queue.is_empty());
        assert_eq!(device.live_count(ObjectKind::Buffer), 0);
        pools.destroy(&mut device);
    }
}
