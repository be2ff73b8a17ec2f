//! # Device Abstraction
//!
//! [`GpuDevice`] is the single boundary between the pipeline and the graphics
//! API. Every object the pipeline creates, every host write into mapped
//! memory and every queue operation goes through it, and the device is passed
//! explicitly to each resource constructor.
//!
//! Two implementations exist:
//!
//! - [`HeadlessDevice`]: a simulated GPU. Submissions complete asynchronously
//!   after a configurable latency. It tracks live objects, host writes into
//!   memory referenced by pending work, and destruction of in-use objects.
//! - `VulkanDevice` (feature `vulkan`): the `ash` backend. It owns the
//!   logical device, the graphics queue and the swapchain built from a
//!   surface handed in by the windowing layer.
//!
//! Methods return raw `vk::Result` errors; the pipeline converts them into
//! [`RenderError`](crate::RenderError) with context.

pub mod headless;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use headless::{HazardReport, HeadlessConfig, HeadlessDevice, HeadlessStats, ObjectKind};
#[cfg(feature = "vulkan")]
pub use vulkan::VulkanDevice;

use ash::vk;
use std::time::Duration;

use crate::command::CommandStream;
use crate::resource::ShaderCode;

/// Result of a device call
pub type DeviceResult<T> = Result<T, vk::Result>;

/// Where a memory block lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// GPU-only memory, written through staging copies
    DeviceLocal,
    /// Host-mappable memory for uniforms, staging and transient data
    HostVisible,
}

/// Device limits the pipeline depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Alignment of dynamic uniform offsets
    pub min_uniform_buffer_offset_alignment: u64,
    /// Granularity of flushes to non-coherent memory
    pub non_coherent_atom_size: u64,
    /// Supported color sample counts
    pub max_color_samples: vk::SampleCountFlags,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            non_coherent_atom_size: 64,
            max_color_samples: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4
                | vk::SampleCountFlags::TYPE_8,
        }
    }
}

/// Image creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Extent in pixels
    pub extent: vk::Extent2D,
    /// Pixel format
    pub format: vk::Format,
    /// Samples per pixel
    pub samples: vk::SampleCountFlags,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
    /// Aspect of the created view
    pub aspect: vk::ImageAspectFlags,
}

/// Image, its default view and its dedicated memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageAllocation {
    /// Image handle
    pub image: vk::Image,
    /// Full-image view
    pub view: vk::ImageView,
    /// Dedicated memory
    pub memory: vk::DeviceMemory,
}

/// Single-subpass render pass layout
///
/// Color and resolve references use `COLOR_ATTACHMENT_OPTIMAL`, the depth
/// reference `DEPTH_STENCIL_ATTACHMENT_OPTIMAL`.
#[derive(Debug, Clone, Default)]
pub struct RenderPassDesc {
    /// Attachment descriptions in framebuffer order
    pub attachments: Vec<vk::AttachmentDescription>,
    /// Indices of color attachments
    pub color: Vec<u32>,
    /// Indices of resolve targets, parallel to `color` when present
    pub resolve: Vec<u32>,
    /// Index of the depth attachment
    pub depth: Option<u32>,
}

/// Descriptor types used by subpasses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Uniform buffer with a per-draw dynamic offset
    DynamicUniform,
    /// Sampled image with sampler
    CombinedImageSampler,
}

impl DescriptorKind {
    /// Vulkan descriptor type
    #[must_use]
    pub const fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::DynamicUniform => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}

/// One binding of a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    /// Binding slot
    pub binding: u32,
    /// Descriptor type
    pub kind: DescriptorKind,
    /// Stages reading the binding
    pub stages: vk::ShaderStageFlags,
}

/// Resource written into a descriptor binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    /// Buffer range starting at offset 0; dynamic offsets are added at bind time
    Buffer {
        /// Buffer
        buffer: vk::Buffer,
        /// Bytes visible per draw
        range: u64,
    },
    /// Image view with sampler
    Image {
        /// View in `SHADER_READ_ONLY_OPTIMAL`
        view: vk::ImageView,
        /// Sampler
        sampler: vk::Sampler,
    },
}

/// Descriptor update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    /// Binding slot
    pub binding: u32,
    /// New resource
    pub resource: DescriptorResource,
}

/// Vertex buffer layout at binding 0
#[derive(Debug, Clone, Default)]
pub struct VertexInput {
    /// Bytes per vertex
    pub stride: u32,
    /// Attributes
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

/// Fixed-function and shader state for one graphics pipeline
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    /// Render pass the pipeline is used in
    pub render_pass: vk::RenderPass,
    /// Pipeline layout
    pub layout: vk::PipelineLayout,
    /// Vertex stage SPIR-V
    pub vertex_shader: &'a ShaderCode,
    /// Fragment stage SPIR-V
    pub fragment_shader: &'a ShaderCode,
    /// Vertex layout; `None` for generated vertices
    pub vertex_input: Option<&'a VertexInput>,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Fill or wireframe
    pub polygon_mode: vk::PolygonMode,
    /// Face culling
    pub cull_mode: vk::CullModeFlags,
    /// Depth test enabled
    pub depth_test: bool,
    /// Depth writes enabled
    pub depth_write: bool,
    /// Alpha blending on every color attachment
    pub blend: bool,
    /// Rasterization samples
    pub samples: vk::SampleCountFlags,
    /// Number of color attachments
    pub color_attachments: u32,
}

/// One queue submission
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    /// Commands to execute
    pub commands: &'a CommandStream,
    /// Semaphore waited before the given stage
    pub wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
    /// Semaphore signaled on completion
    pub signal: Option<vk::Semaphore>,
    /// Fence signaled on completion; must be unsignaled
    pub fence: vk::Fence,
}

/// Graphics device used by the pipeline
///
/// Object-safe so resources can take `&mut dyn GpuDevice`.
pub trait GpuDevice {
    /// Device limits
    fn limits(&self) -> DeviceLimits;

    /// Memory type index that blocks for `location` are allocated from
    ///
    /// A buffer may only be bound to such a block when this index is set in
    /// its `memory_type_bits`.
    fn memory_type_index(&self, location: MemoryLocation) -> u32;
    /// Allocate a memory block
    fn allocate_memory(&mut self, size: u64, location: MemoryLocation) -> DeviceResult<vk::DeviceMemory>;
    /// Free a memory block
    fn free_memory(&mut self, memory: vk::DeviceMemory);
    /// Whether host writes to `location` are visible without a flush
    fn is_coherent(&self, location: MemoryLocation) -> bool;
    /// Make `offset..offset + size` of a host-visible block writable
    fn map_memory(&mut self, memory: vk::DeviceMemory, offset: u64, size: u64) -> DeviceResult<()>;
    /// End the mapping that starts at `offset`
    fn unmap_memory(&mut self, memory: vk::DeviceMemory, offset: u64);
    /// Copy bytes into a mapped range
    fn write_mapped(&mut self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> DeviceResult<()>;
    /// Make host writes in the range visible to the device
    fn flush_mapped(&mut self, memory: vk::DeviceMemory, offset: u64, size: u64) -> DeviceResult<()>;

    /// Create an unbound buffer and report its memory requirements
    fn create_buffer(&mut self, size: u64, usage: vk::BufferUsageFlags) -> DeviceResult<(vk::Buffer, vk::MemoryRequirements)>;
    /// Bind a buffer to a sub-allocated range
    fn bind_buffer_memory(&mut self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: u64) -> DeviceResult<()>;
    /// Destroy a buffer; its memory range is released by the caller
    fn destroy_buffer(&mut self, buffer: vk::Buffer);

    /// Create an image with dedicated memory and a full view
    fn create_image(&mut self, desc: &ImageDesc) -> DeviceResult<ImageAllocation>;
    /// Destroy an image, its view and its memory
    fn destroy_image(&mut self, image: ImageAllocation);
    /// Create a sampler
    fn create_sampler(&mut self, filter: vk::Filter, address_mode: vk::SamplerAddressMode) -> DeviceResult<vk::Sampler>;
    /// Destroy a sampler
    fn destroy_sampler(&mut self, sampler: vk::Sampler);

    /// Create a single-subpass render pass
    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> DeviceResult<vk::RenderPass>;
    /// Destroy a render pass
    fn destroy_render_pass(&mut self, render_pass: vk::RenderPass);
    /// Create a framebuffer
    fn create_framebuffer(&mut self, render_pass: vk::RenderPass, views: &[vk::ImageView], extent: vk::Extent2D) -> DeviceResult<vk::Framebuffer>;
    /// Destroy a framebuffer
    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer);

    /// Create a descriptor set layout
    fn create_descriptor_set_layout(&mut self, bindings: &[LayoutBinding]) -> DeviceResult<vk::DescriptorSetLayout>;
    /// Destroy a descriptor set layout
    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout);
    /// Create a descriptor pool
    fn create_descriptor_pool(&mut self, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> DeviceResult<vk::DescriptorPool>;
    /// Destroy a descriptor pool and every set allocated from it
    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool);
    /// Allocate one descriptor set
    fn allocate_descriptor_set(&mut self, pool: vk::DescriptorPool, layout: vk::DescriptorSetLayout) -> DeviceResult<vk::DescriptorSet>;
    /// Update bindings of a descriptor set
    fn write_descriptor_set(&mut self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    /// Create a pipeline layout over the given set layouts
    fn create_pipeline_layout(&mut self, set_layouts: &[vk::DescriptorSetLayout]) -> DeviceResult<vk::PipelineLayout>;
    /// Destroy a pipeline layout
    fn destroy_pipeline_layout(&mut self, layout: vk::PipelineLayout);
    /// Create a graphics pipeline with dynamic viewport and scissor
    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> DeviceResult<vk::Pipeline>;
    /// Destroy a graphics pipeline
    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline);

    /// Create a fence
    fn create_fence(&mut self, signaled: bool) -> DeviceResult<vk::Fence>;
    /// Destroy a fence
    fn destroy_fence(&mut self, fence: vk::Fence);
    /// Block until the fence signals; `TIMEOUT` after `timeout`
    fn wait_for_fence(&mut self, fence: vk::Fence, timeout: Duration) -> DeviceResult<()>;
    /// Non-blocking fence status
    fn fence_signaled(&mut self, fence: vk::Fence) -> DeviceResult<bool>;
    /// Return a fence to the unsignaled state
    fn reset_fence(&mut self, fence: vk::Fence) -> DeviceResult<()>;
    /// Create a binary semaphore
    fn create_semaphore(&mut self) -> DeviceResult<vk::Semaphore>;
    /// Destroy a semaphore
    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore);

    /// Submit commands to the graphics queue
    fn submit(&mut self, submission: &Submission<'_>) -> DeviceResult<()>;
    /// Block until the queue is idle
    fn wait_idle(&mut self) -> DeviceResult<()>;

    /// Current swapchain extent
    fn swapchain_extent(&self) -> vk::Extent2D;
    /// Acquire the next presentable image, signaling `signal` when ready
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> DeviceResult<u32>;
    /// Present an acquired image after `wait` signals
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> DeviceResult<()>;
    /// Rebuild the swapchain at a new extent
    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> DeviceResult<()>;
}
