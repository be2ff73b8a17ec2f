//! Device-local meshes uploaded through staging

use ash::vk;
use bytemuck::Pod;
use slotmap::SlotMap;
use std::time::Duration;

use super::buffer::{Buffer, BufferUsage, IndexBuffer, VertexBuffer};
use crate::command::{Command, CommandStream, CopyRegion};
use crate::device::{GpuDevice, Submission};
use crate::error::{RenderError, RenderResult};
use crate::memory::MemoryPools;

slotmap::new_key_type! {
    /// Handle to a mesh owned by the pipeline
    pub struct MeshKey;
}

/// Meshes by key
pub type MeshRegistry = SlotMap<MeshKey, Mesh>;

/// Vertex and index buffers of one mesh
#[derive(Debug)]
pub struct Mesh {
    vertices: VertexBuffer,
    indices: IndexBuffer,
}

impl Mesh {
    /// Upload vertices and `u32` indices into device-local buffers
    ///
    /// Blocks until the copy has completed. Returns the mesh and the staging
    /// buffer, which the caller retires.
    pub fn upload<V: Pod>(
        device: &mut dyn GpuDevice,
        pools: &mut MemoryPools,
        vertices: &[V],
        indices: &[u32],
        timeout: Duration,
    ) -> RenderResult<(Self, Buffer)> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(RenderError::invalid_state("a mesh needs vertices and indices"));
        }

        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);
        let vertex_size = vertex_bytes.len() as u64;
        let index_size = index_bytes.len() as u64;

        let mut staging = Buffer::new(device, pools, vertex_size + index_size, BufferUsage::Staging)?;
        let uploaded = staging
            .with_mapping(device, |mapped| {
                mapped.write(0, vertex_bytes)?;
                mapped.write(vertex_size, index_bytes)?;
                mapped.flush()
            })
            .and_then(|()| Self::copy_from(device, pools, &staging, vertex_size, index_size, timeout));

        match uploaded {
            Ok((vertex_buffer, index_buffer)) => {
                log::debug!("Uploaded mesh with {} vertices and {} indices", vertices.len(), indices.len());
                let mesh = Self {
                    vertices: VertexBuffer::new(vertex_buffer, vertices.len() as u32),
                    indices: IndexBuffer::new(index_buffer, indices.len() as u32),
                };
                Ok((mesh, staging))
            }
            Err(e) => {
                staging.destroy(device, pools);
                Err(e)
            }
        }
    }

    fn copy_from(
        device: &mut dyn GpuDevice,
        pools: &mut MemoryPools,
        staging: &Buffer,
        vertex_size: u64,
        index_size: u64,
        timeout: Duration,
    ) -> RenderResult<(Buffer, Buffer)> {
        let vertex_buffer = Buffer::new(device, pools, vertex_size, BufferUsage::Vertex)?;
        let index_buffer = match Buffer::new(device, pools, index_size, BufferUsage::Index) {
            Ok(buffer) => buffer,
            Err(e) => {
                vertex_buffer.destroy(device, pools);
                return Err(e);
            }
        };

        let mut commands = CommandStream::new();
        commands.push(Command::CopyBuffer {
            src: staging.handle(),
            dst: vertex_buffer.handle(),
            region: CopyRegion { src_offset: 0, dst_offset: 0, size: vertex_size },
        });
        commands.push(Command::CopyBuffer {
            src: staging.handle(),
            dst: index_buffer.handle(),
            region: CopyRegion { src_offset: vertex_size, dst_offset: 0, size: index_size },
        });

        match submit_and_wait(device, &commands, timeout) {
            Ok(()) => Ok((vertex_buffer, index_buffer)),
            Err(e) => {
                vertex_buffer.destroy(device, pools);
                index_buffer.destroy(device, pools);
                Err(e)
            }
        }
    }

    /// Vertex buffer handle
    #[must_use]
    pub const fn vertex_buffer(&self) -> vk::Buffer {
        self.vertices.handle()
    }

    /// Index buffer handle
    #[must_use]
    pub const fn index_buffer(&self) -> vk::Buffer {
        self.indices.handle()
    }

    /// Number of vertices
    #[must_use]
    pub const fn vertex_count(&self) -> u32 {
        self.vertices.vertex_count()
    }

    /// Number of indices
    #[must_use]
    pub const fn index_count(&self) -> u32 {
        self.indices.index_count()
    }

    /// Release both buffers for retirement
    #[must_use]
    pub fn into_buffers(self) -> [Buffer; 2] {
        [self.vertices.into_buffer(), self.indices.into_buffer()]
    }
}

/// Submit a one-off command stream and block on its fence
pub(crate) fn submit_and_wait(device: &mut dyn GpuDevice, commands: &CommandStream, timeout: Duration) -> RenderResult<()> {
    let fence = device.create_fence(false)?;
    let result = device
        .submit(&Submission {
            commands,
            wait: None,
            signal: None,
            fence,
        })
        .and_then(|()| device.wait_for_fence(fence, timeout));
    device.destroy_fence(fence);
    result.map_err(RenderError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::device::{HeadlessConfig, HeadlessDevice, MemoryLocation, ObjectKind};

    #[test]
    fn test_upload_creates_device_local_buffers() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut pools = MemoryPools::new(&MemoryConfig::default());
        let vertices = [[0.0f32; 8]; 3];

        let (mesh, staging) =
            Mesh::upload(&mut device, &mut pools, &vertices, &[0, 1, 2], Duration::from_secs(1)).unwrap();

        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.index_count(), 3);
        assert_eq!(pools.get(MemoryLocation::DeviceLocal).stats().allocations, 2);
        assert_eq!(device.pending_submissions(), 0);
        assert!(!staging.is_mapped());

        staging.destroy(&mut device, &mut pools);
        for buffer in mesh.into_buffers() {
            buffer.destroy(&mut device, &mut pools);
        }
        pools.destroy(&mut device);
        assert_eq!(device.live_total(), 0);
        assert_eq!(device.hazards().total(), 0);
    }

    #[test]
    fn test_empty_mesh_rejected() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut pools = MemoryPools::new(&MemoryConfig::default());
        let vertices: [[f32; 8]; 0] = [];

        let result = Mesh::upload(&mut device, &mut pools, &vertices, &[0], Duration::from_secs(1));
        assert!(matches!(result, Err(RenderError::InvalidState(_))));
        assert_eq!(device.live_count(ObjectKind::Buffer), 0);
    }

    /// A hung device surfaces as a lost device and nothing leaks
    #[test]
    fn test_upload_on_hung_device() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut pools = MemoryPools::new(&MemoryConfig::default());
        device.set_hung(true);

        let result = Mesh::upload(&mut device, &mut pools, &[[1.0f32; 4]; 4], &[0, 1, 2], Duration::from_millis(5));
        assert!(matches!(result, Err(RenderError::DeviceLost(_))));
        assert_eq!(device.live_count(ObjectKind::Buffer), 0);
        assert_eq!(device.live_count(ObjectKind::Fence), 0);
    }
}
