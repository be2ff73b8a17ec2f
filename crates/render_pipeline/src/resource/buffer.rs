//! GPU buffers backed by pool sub-allocations
//!
//! A [`Buffer`] owns one buffer handle and one [`Allocation`]. Host-visible
//! buffers move between unmapped and mapped only through `map`/`unmap`;
//! writes and flushes require the mapped state. Every violation is a
//! [`MappingError`], returned in all builds.

use ash::vk;
use bytemuck::Pod;

use crate::device::{GpuDevice, MemoryLocation};
use crate::error::{MappingError, RenderError, RenderResult};
use crate::memory::{Allocation, MemoryPools};

/// What a buffer is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Vertex data, device local, filled through staging
    Vertex,
    /// `u32` index data, device local, filled through staging
    Index,
    /// Uniform data, host visible
    Uniform,
    /// Upload source, host visible
    Staging,
    /// Per-frame arena holding uniforms, vertices and indices, host visible
    Transient,
}

impl BufferUsage {
    /// Vulkan usage flags
    #[must_use]
    pub const fn flags(self) -> vk::BufferUsageFlags {
        match self {
            Self::Vertex => vk::BufferUsageFlags::from_raw(
                vk::BufferUsageFlags::VERTEX_BUFFER.as_raw() | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
            ),
            Self::Index => vk::BufferUsageFlags::from_raw(
                vk::BufferUsageFlags::INDEX_BUFFER.as_raw() | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
            ),
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            Self::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            Self::Transient => vk::BufferUsageFlags::from_raw(
                vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
                    | vk::BufferUsageFlags::VERTEX_BUFFER.as_raw()
                    | vk::BufferUsageFlags::INDEX_BUFFER.as_raw(),
            ),
        }
    }

    /// Memory location serving this usage
    #[must_use]
    pub const fn location(self) -> MemoryLocation {
        match self {
            Self::Vertex | Self::Index => MemoryLocation::DeviceLocal,
            Self::Uniform | Self::Staging | Self::Transient => MemoryLocation::HostVisible,
        }
    }
}

fn mapping_error(error: MappingError) -> RenderError {
    log::error!("Buffer mapping misuse: {}", error);
    RenderError::Mapping(error)
}

/// Buffer wrapper with pool-backed memory
#[derive(Debug)]
pub struct Buffer {
    handle: vk::Buffer,
    allocation: Allocation,
    size: u64,
    usage: BufferUsage,
    mapped: bool,
}

impl Buffer {
    /// Create a buffer and bind it to a fresh sub-allocation
    pub fn new(device: &mut dyn GpuDevice, pools: &mut MemoryPools, size: u64, usage: BufferUsage) -> RenderResult<Self> {
        let (handle, requirements) = device.create_buffer(size, usage.flags())?;

        let location = usage.location();
        let memory_type = device.memory_type_index(location);
        if requirements.memory_type_bits & (1 << memory_type) == 0 {
            device.destroy_buffer(handle);
            log::error!("{:?} buffer cannot bind {:?} memory type {}", usage, location, memory_type);
            return Err(RenderError::IncompatibleMemory {
                location,
                memory_type,
                type_bits: requirements.memory_type_bits,
            });
        }

        let alignment = match location {
            MemoryLocation::HostVisible => requirements.alignment.max(device.limits().non_coherent_atom_size),
            MemoryLocation::DeviceLocal => requirements.alignment,
        };

        let allocation = match pools.get_mut(location).allocate(device, requirements.size, alignment) {
            Ok(allocation) => allocation,
            Err(e) => {
                device.destroy_buffer(handle);
                return Err(e);
            }
        };

        if let Err(e) = device.bind_buffer_memory(handle, allocation.memory, allocation.offset) {
            device.destroy_buffer(handle);
            pools.get_mut(location).free(allocation);
            return Err(e.into());
        }

        log::trace!("Created {:?} buffer of {} bytes at offset {}", usage, size, allocation.offset);
        Ok(Self {
            handle,
            allocation,
            size,
            usage,
            mapped: false,
        })
    }

    /// Make the buffer host-writable
    pub fn map(&mut self, device: &mut dyn GpuDevice) -> RenderResult<()> {
        if self.mapped {
            return Err(mapping_error(MappingError::AlreadyMapped));
        }
        if self.allocation.location != MemoryLocation::HostVisible {
            return Err(mapping_error(MappingError::NotHostVisible));
        }

        device
            .map_memory(self.allocation.memory, self.allocation.offset, self.size)
            .map_err(|_| mapping_error(MappingError::MapFailed))?;
        self.mapped = true;
        Ok(())
    }

    /// Copy bytes into the mapped range at `offset`
    pub fn write(&mut self, device: &mut dyn GpuDevice, offset: u64, bytes: &[u8]) -> RenderResult<()> {
        self.check_range(offset, bytes.len() as u64)?;
        device
            .write_mapped(self.allocation.memory, self.allocation.offset + offset, bytes)
            .map_err(|_| mapping_error(MappingError::MapFailed))
    }

    /// Copy one plain-old-data value into the mapped range at `offset`
    pub fn write_pod<T: Pod>(&mut self, device: &mut dyn GpuDevice, offset: u64, value: &T) -> RenderResult<()> {
        self.write(device, offset, bytemuck::bytes_of(value))
    }

    /// Make every host write visible to the device
    pub fn flush(&mut self, device: &mut dyn GpuDevice) -> RenderResult<()> {
        self.flush_range(device, 0, self.size)
    }

    /// Make host writes in `offset..offset + len` visible to the device
    pub fn flush_range(&mut self, device: &mut dyn GpuDevice, offset: u64, len: u64) -> RenderResult<()> {
        self.check_range(offset, len)?;
        device.flush_mapped(self.allocation.memory, self.allocation.offset + offset, len)?;
        Ok(())
    }

    /// End host access
    pub fn unmap(&mut self, device: &mut dyn GpuDevice) -> RenderResult<()> {
        if !self.mapped {
            return Err(mapping_error(MappingError::NotMapped));
        }
        device.unmap_memory(self.allocation.memory, self.allocation.offset);
        self.mapped = false;
        Ok(())
    }

    /// Map, run `f`, then unmap even when `f` fails
    pub fn with_mapping<R>(
        &mut self,
        device: &mut dyn GpuDevice,
        f: impl FnOnce(&mut MappedBuffer<'_>) -> RenderResult<R>,
    ) -> RenderResult<R> {
        self.map(device)?;
        let result = f(&mut MappedBuffer { buffer: self, device: &mut *device });
        let unmapped = self.unmap(device);
        let value = result?;
        unmapped?;
        Ok(value)
    }

    /// Write a uniform value, flush and unmap in one scoped operation
    pub fn update_uniform<T: Pod>(&mut self, device: &mut dyn GpuDevice, value: &T) -> RenderResult<()> {
        self.with_mapping(device, |mapped| {
            mapped.write_pod(0, value)?;
            mapped.flush()
        })
    }

    /// Destroy the buffer and return its range to the pool
    pub fn destroy(mut self, device: &mut dyn GpuDevice, pools: &mut MemoryPools) {
        if self.mapped {
            device.unmap_memory(self.allocation.memory, self.allocation.offset);
            self.mapped = false;
        }
        device.destroy_buffer(self.handle);
        pools.get_mut(self.allocation.location).free(self.allocation);
        log::trace!("Destroyed {:?} buffer of {} bytes", self.usage, self.size);
    }

    /// Buffer handle
    #[must_use]
    pub const fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Requested size
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Usage kind
    #[must_use]
    pub const fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Backing allocation
    #[must_use]
    pub const fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Whether the buffer is currently mapped
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn check_range(&self, offset: u64, len: u64) -> RenderResult<()> {
        if !self.mapped {
            return Err(mapping_error(MappingError::NotMapped));
        }
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(mapping_error(MappingError::OutOfRange { offset, len, size: self.size }));
        }
        Ok(())
    }
}

/// Host access to a mapped buffer for the duration of [`Buffer::with_mapping`]
pub struct MappedBuffer<'a> {
    buffer: &'a mut Buffer,
    device: &'a mut dyn GpuDevice,
}

impl MappedBuffer<'_> {
    /// Copy bytes at `offset`
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> RenderResult<()> {
        self.buffer.write(self.device, offset, bytes)
    }

    /// Copy one plain-old-data value at `offset`
    pub fn write_pod<T: Pod>(&mut self, offset: u64, value: &T) -> RenderResult<()> {
        self.buffer.write_pod(self.device, offset, value)
    }

    /// Flush the whole buffer
    pub fn flush(&mut self) -> RenderResult<()> {
        self.buffer.flush(self.device)
    }

    /// Flush part of the buffer
    pub fn flush_range(&mut self, offset: u64, len: u64) -> RenderResult<()> {
        self.buffer.flush_range(self.device, offset, len)
    }
}

/// Device-local vertex data
#[derive(Debug)]
pub struct VertexBuffer {
    buffer: Buffer,
    vertex_count: u32,
}

impl VertexBuffer {
    /// Wrap a buffer filled with `vertex_count` vertices
    #[must_use]
    pub const fn new(buffer: Buffer, vertex_count: u32) -> Self {
        Self { buffer, vertex_count }
    }

    /// Buffer handle
    #[must_use]
    pub const fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Number of vertices
    #[must_use]
    pub const fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Release the underlying buffer
    #[must_use]
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

/// Device-local `u32` index data
#[derive(Debug)]
pub struct IndexBuffer {
    buffer: Buffer,
    index_count: u32,
}

impl IndexBuffer {
    /// Wrap a buffer filled with `index_count` indices
    #[must_use]
    pub const fn new(buffer: Buffer, index_count: u32) -> Self {
        Self { buffer, index_count }
    }

    /// Buffer handle
    #[must_use]
    pub const fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Number of indices
    #[must_use]
    pub const fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Release the underlying buffer
    #[must_use]
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::device::{HeadlessConfig, HeadlessDevice, ObjectKind};

    fn setup() -> (HeadlessDevice, MemoryPools) {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let pools = MemoryPools::new(&MemoryConfig { block_size: 64 * 1024, ..MemoryConfig::default() });
        (device, pools)
    }

    /// Bytes become device-visible at the flush, not at the write
    #[test]
    fn test_map_write_flush_unmap() {
        let (mut device, mut pools) = setup();
        let mut buffer = Buffer::new(&mut device, &mut pools, 256, BufferUsage::Uniform).unwrap();
        let memory = buffer.allocation().memory;
        let base = buffer.allocation().offset;

        buffer.map(&mut device).unwrap();
        buffer.write(&mut device, 16, &[0xAB; 32]).unwrap();
        assert_eq!(device.read_device(memory, base + 16, 32).unwrap(), &[0; 32]);

        buffer.flush(&mut device).unwrap();
        assert_eq!(device.read_device(memory, base + 16, 32).unwrap(), &[0xAB; 32]);

        buffer.unmap(&mut device).unwrap();
        assert!(!buffer.is_mapped());
        buffer.destroy(&mut device, &mut pools);
    }

    #[test]
    fn test_mapping_state_errors() {
        let (mut device, mut pools) = setup();
        let mut buffer = Buffer::new(&mut device, &mut pools, 64, BufferUsage::Staging).unwrap();

        assert!(matches!(buffer.write(&mut device, 0, &[1]), Err(RenderError::Mapping(MappingError::NotMapped))));
        assert!(matches!(buffer.flush(&mut device), Err(RenderError::Mapping(MappingError::NotMapped))));
        assert!(matches!(buffer.unmap(&mut device), Err(RenderError::Mapping(MappingError::NotMapped))));

        buffer.map(&mut device).unwrap();
        assert!(matches!(buffer.map(&mut device), Err(RenderError::Mapping(MappingError::AlreadyMapped))));
        assert!(matches!(
            buffer.write(&mut device, 60, &[0; 8]),
            Err(RenderError::Mapping(MappingError::OutOfRange { offset: 60, len: 8, size: 64 }))
        ));

        buffer.destroy(&mut device, &mut pools);
    }

    #[test]
    fn test_device_local_cannot_map() {
        let (mut device, mut pools) = setup();
        let mut buffer = Buffer::new(&mut device, &mut pools, 64, BufferUsage::Vertex).unwrap();

        assert!(matches!(buffer.map(&mut device), Err(RenderError::Mapping(MappingError::NotHostVisible))));
        buffer.destroy(&mut device, &mut pools);
    }

    /// The guard unmaps even when the closure fails
    #[test]
    fn test_with_mapping_unmaps_on_error() {
        let (mut device, mut pools) = setup();
        let mut buffer = Buffer::new(&mut device, &mut pools, 64, BufferUsage::Staging).unwrap();

        let result = buffer.with_mapping(&mut device, |mapped| mapped.write(128, &[1]));
        assert!(matches!(result, Err(RenderError::Mapping(MappingError::OutOfRange { .. }))));
        assert!(!buffer.is_mapped());

        buffer.destroy(&mut device, &mut pools);
    }

    #[test]
    fn test_update_uniform() {
        let (mut device, mut pools) = setup();
        let mut buffer = Buffer::new(&mut device, &mut pools, 64, BufferUsage::Uniform).unwrap();
        let uniform = [1.0f32, 2.0, 3.0, 4.0];

        buffer.update_uniform(&mut device, &uniform).unwrap();

        let allocation = *buffer.allocation();
        let stored = device.read_device(allocation.memory, allocation.offset, 16).unwrap();
        assert_eq!(stored, bytemuck::bytes_of(&uniform));
        assert!(!buffer.is_mapped());
        buffer.destroy(&mut device, &mut pools);
    }

    /// Buffers whose memory type bits exclude their pool's type are never bound
    #[test]
    fn test_incompatible_memory_type_rejected() {
        let mut device = HeadlessDevice::new(HeadlessConfig {
            buffer_memory_type_bits: 0b01,
            ..HeadlessConfig::default()
        });
        let mut pools = MemoryPools::new(&MemoryConfig::default());

        let err = Buffer::new(&mut device, &mut pools, 64, BufferUsage::Staging).unwrap_err();
        assert!(matches!(
            err,
            RenderError::IncompatibleMemory { location: MemoryLocation::HostVisible, memory_type: 1, type_bits: 0b01 }
        ));
        assert_eq!(device.live_count(ObjectKind::Buffer), 0);
        assert_eq!(device.live_count(ObjectKind::Memory), 0);

        let vertex = Buffer::new(&mut device, &mut pools, 64, BufferUsage::Vertex).unwrap();
        vertex.destroy(&mut device, &mut pools);
        pools.destroy(&mut device);
        assert_eq!(device.live_total(), 0);
    }

    #[test]
    fn test_destroy_returns_memory() {
        let (mut device, mut pools) = setup();
        let buffer = Buffer::new(&mut device, &mut pools, 1024, BufferUsage::Transient).unwrap();
        assert_eq!(pools.get(MemoryLocation::HostVisible).stats().allocations, 1);

        buffer.destroy(&mut device, &mut pools);
        assert_eq!(pools.get(MemoryLocation::HostVisible).stats().allocations, 0);
        assert_eq!(device.live_count(ObjectKind::Buffer), 0);

        pools.destroy(&mut device);
        assert_eq!(device.live_total(), 0);
    }
}
