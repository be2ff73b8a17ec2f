//! # Vulkan Device
//!
//! `ash` implementation of [`GpuDevice`]. The windowing layer owns the
//! instance and the surface; this device owns the logical device, the
//! swapchain and a command pool. Each fence gets its own command buffer,
//! reused once the fence has signaled and been reset for the next submit.
//!
//! Host-visible blocks are mapped once when allocated and stay mapped until
//! freed. The pools sub-allocate many buffers from one block, so
//! [`map_memory`](GpuDevice::map_memory) only records which ranges the
//! caller may write.

#![allow(unsafe_code)]

use ash::extensions::khr::{Surface, Swapchain};
use ash::{vk, Device, Entry, Instance};
use std::collections::HashMap;
use std::ffi::CStr;
use std::time::Duration;

use super::{
    DescriptorResource, DescriptorWrite, DeviceLimits, DeviceResult, GpuDevice,
    GraphicsPipelineDesc, ImageAllocation, ImageDesc, LayoutBinding, MemoryLocation,
    RenderPassDesc, Submission,
};
use crate::command::{Command, CommandStream};

const SURFACE_FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;

/// Persistent host mapping of one memory block
#[derive(Debug)]
struct HostBlock {
    ptr: *mut u8,
    size: u64,
    /// Ranges handed out through `map_memory`, keyed by offset
    ranges: HashMap<u64, u64>,
}

impl HostBlock {
    fn covers(&self, offset: u64, len: u64) -> bool {
        self.ranges
            .iter()
            .any(|(&start, &size)| offset >= start && offset + len <= start + size)
    }
}

/// Queue family indices picked for the surface
#[derive(Debug, Clone, Copy)]
struct QueueFamilies {
    graphics: u32,
    present: u32,
}

/// Swapchain and its images
struct SwapchainState {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

/// Graphics device backed by a Vulkan logical device and swapchain
pub struct VulkanDevice {
    device: Device,
    physical_device: vk::PhysicalDevice,
    surface_loader: Surface,
    surface: vk::SurfaceKHR,
    swapchain_loader: Swapchain,
    swapchain: SwapchainState,
    families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device_memory_type: u32,
    host_memory_type: u32,
    host_coherent: bool,
    limits: DeviceLimits,
    command_pool: vk::CommandPool,
    command_buffers: HashMap<vk::Fence, vk::CommandBuffer>,
    host_blocks: HashMap<vk::DeviceMemory, HostBlock>,
}

impl VulkanDevice {
    /// Create the logical device and a swapchain for `surface`
    ///
    /// `instance` must outlive the device and must have been created with
    /// the surface extensions for the window system.
    pub fn new(entry: &Entry, instance: &Instance, surface: vk::SurfaceKHR, extent: vk::Extent2D) -> DeviceResult<Self> {
        let surface_loader = Surface::new(entry, instance);
        let (physical_device, families) = pick_physical_device(instance, &surface_loader, surface)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let (host_memory_type, host_coherent) = pick_host_memory_type(&memory_properties)
            .ok_or(vk::Result::ERROR_FEATURE_NOT_PRESENT)?;
        let device_memory_type = pick_device_memory_type(&memory_properties, u32::MAX)
            .ok_or(vk::Result::ERROR_FEATURE_NOT_PRESENT)?;

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!("Selected GPU: {}", device_name.to_string_lossy());

        let mut unique_families = vec![families.graphics];
        if families.present != families.graphics {
            unique_families.push(families.present);
        }
        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extensions = [Swapchain::name().as_ptr()];
        // Wireframe overlays need non-solid fill
        let enabled_features = vk::PhysicalDeviceFeatures::builder()
            .fill_mode_non_solid(features.fill_mode_non_solid == vk::TRUE)
            .build();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&enabled_features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None)? };
        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };
        let swapchain_loader = Swapchain::new(instance, &device);

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let swapchain = match create_swapchain(
            &surface_loader,
            &swapchain_loader,
            physical_device,
            surface,
            extent,
            vk::SwapchainKHR::null(),
        ) {
            Ok(swapchain) => swapchain,
            Err(e) => {
                unsafe {
                    device.destroy_command_pool(command_pool, None);
                    device.destroy_device(None);
                }
                return Err(e);
            }
        };

        let sample_counts = properties.limits.framebuffer_color_sample_counts
            & properties.limits.framebuffer_depth_sample_counts;
        let limits = DeviceLimits {
            min_uniform_buffer_offset_alignment: properties.limits.min_uniform_buffer_offset_alignment,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
            max_color_samples: sample_counts,
        };

        log::info!(
            "Vulkan device ready: swapchain {}x{}, {} images, host memory coherent: {}",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len(),
            host_coherent
        );

        Ok(Self {
            device,
            physical_device,
            surface_loader,
            surface,
            swapchain_loader,
            swapchain,
            families,
            graphics_queue,
            present_queue,
            memory_properties,
            device_memory_type,
            host_memory_type,
            host_coherent,
            limits,
            command_pool,
            command_buffers: HashMap::new(),
            host_blocks: HashMap::new(),
        })
    }

    /// Raw `ash` device for code outside the pipeline
    #[must_use]
    pub const fn raw(&self) -> &Device {
        &self.device
    }

    /// Queue family used for graphics work
    #[must_use]
    pub const fn graphics_family(&self) -> u32 {
        self.families.graphics
    }

    /// Swapchain surface format
    #[must_use]
    pub const fn surface_format(&self) -> vk::Format {
        self.swapchain.format.format
    }

    fn device_memory_type(&self, type_filter: u32) -> DeviceResult<u32> {
        pick_device_memory_type(&self.memory_properties, type_filter).ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    }

    fn command_buffer_for(&mut self, fence: vk::Fence) -> DeviceResult<vk::CommandBuffer> {
        if let Some(&buffer) = self.command_buffers.get(&fence) {
            unsafe {
                self.device
                    .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())?;
            }
            return Ok(buffer);
        }

        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        let buffer = buffers
            .first()
            .copied()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
        self.command_buffers.insert(fence, buffer);
        Ok(buffer)
    }

    fn record(&self, buffer: vk::CommandBuffer, commands: &CommandStream) -> DeviceResult<()> {
        let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(buffer, &begin)? };

        for command in commands {
            self.record_command(buffer, command)?;
        }

        unsafe { self.device.end_command_buffer(buffer) }
    }

    fn record_command(&self, buffer: vk::CommandBuffer, command: &Command) -> DeviceResult<()> {
        let device = &self.device;
        match command {
            Command::BeginRenderPass { render_pass, framebuffer, extent, clear_values } => {
                let clear_values: Vec<vk::ClearValue> = clear_values.iter().map(|value| value.to_vk()).collect();
                let info = vk::RenderPassBeginInfo::builder()
                    .render_pass(*render_pass)
                    .framebuffer(*framebuffer)
                    .render_area(full_rect(*extent))
                    .clear_values(&clear_values);
                unsafe { device.cmd_begin_render_pass(buffer, &info, vk::SubpassContents::INLINE) };
            }
            Command::EndRenderPass => unsafe { device.cmd_end_render_pass(buffer) },
            Command::BindPipeline(pipeline) => unsafe {
                device.cmd_bind_pipeline(buffer, vk::PipelineBindPoint::GRAPHICS, *pipeline);
            },
            Command::BindDescriptorSet { layout, set, dynamic_offsets } => unsafe {
                device.cmd_bind_descriptor_sets(
                    buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    *layout,
                    0,
                    &[*set],
                    dynamic_offsets,
                );
            },
            Command::BindVertexBuffer { buffer: vertices, offset } => unsafe {
                device.cmd_bind_vertex_buffers(buffer, 0, &[*vertices], &[*offset]);
            },
            Command::BindIndexBuffer { buffer: indices, offset } => unsafe {
                device.cmd_bind_index_buffer(buffer, *indices, *offset, vk::IndexType::UINT32);
            },
            Command::SetViewport(extent) => {
                let viewport = vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                unsafe { device.cmd_set_viewport(buffer, 0, &[viewport]) };
            }
            Command::SetScissor(extent) => unsafe {
                device.cmd_set_scissor(buffer, 0, &[full_rect(*extent)]);
            },
            Command::Draw { vertex_count, first_vertex } => unsafe {
                device.cmd_draw(buffer, *vertex_count, 1, *first_vertex, 0);
            },
            Command::DrawIndexed { index_count, first_index, vertex_offset } => unsafe {
                device.cmd_draw_indexed(buffer, *index_count, 1, *first_index, *vertex_offset, 0);
            },
            Command::CopyBuffer { src, dst, region } => {
                let copy = vk::BufferCopy {
                    src_offset: region.src_offset,
                    dst_offset: region.dst_offset,
                    size: region.size,
                };
                unsafe { device.cmd_copy_buffer(buffer, *src, *dst, &[copy]) };
            }
            Command::BlitToSwapchain { source, extent, image_index } => {
                let target = self
                    .swapchain
                    .images
                    .get(*image_index as usize)
                    .copied()
                    .ok_or(vk::Result::ERROR_OUT_OF_DATE_KHR)?;
                self.record_blit(buffer, *source, *extent, target);
            }
        }
        Ok(())
    }

    fn record_blit(&self, buffer: vk::CommandBuffer, source: vk::Image, extent: vk::Extent2D, target: vk::Image) {
        let device = &self.device;
        let to_transfer = [
            image_barrier(
                source,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            ),
            image_barrier(
                target,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        ];
        // Source stage matches the acquire semaphore's wait stage
        unsafe {
            device.cmd_pipeline_barrier(
                buffer,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &to_transfer,
            );
        }

        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let target_extent = self.swapchain.extent;
        let blit = vk::ImageBlit {
            src_subresource: layers,
            src_offsets: [vk::Offset3D::default(), far_corner(extent)],
            dst_subresource: layers,
            dst_offsets: [vk::Offset3D::default(), far_corner(target_extent)],
        };
        unsafe {
            device.cmd_blit_image(
                buffer,
                source,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::NEAREST,
            );
        }

        let to_present = [
            image_barrier(
                target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::empty(),
            ),
            image_barrier(
                source,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_READ,
            ),
        ];
        unsafe {
            device.cmd_pipeline_barrier(
                buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &to_present,
            );
        }
    }
}

impl GpuDevice for VulkanDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn memory_type_index(&self, location: MemoryLocation) -> u32 {
        match location {
            MemoryLocation::HostVisible => self.host_memory_type,
            MemoryLocation::DeviceLocal => self.device_memory_type,
        }
    }

    fn allocate_memory(&mut self, size: u64, location: MemoryLocation) -> DeviceResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(self.memory_type_index(location));
        let memory = unsafe { self.device.allocate_memory(&info, None)? };

        if location == MemoryLocation::HostVisible {
            let ptr = unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            };
            match ptr {
                Ok(ptr) => {
                    self.host_blocks.insert(
                        memory,
                        HostBlock { ptr: ptr.cast::<u8>(), size, ranges: HashMap::new() },
                    );
                }
                Err(e) => {
                    unsafe { self.device.free_memory(memory, None) };
                    return Err(e);
                }
            }
        }

        log::debug!("Allocated {} bytes of {:?} memory", size, location);
        Ok(memory)
    }

    fn free_memory(&mut self, memory: vk::DeviceMemory) {
        unsafe {
            if self.host_blocks.remove(&memory).is_some() {
                self.device.unmap_memory(memory);
            }
            self.device.free_memory(memory, None);
        }
    }

    fn is_coherent(&self, location: MemoryLocation) -> bool {
        match location {
            MemoryLocation::HostVisible => self.host_coherent,
            MemoryLocation::DeviceLocal => false,
        }
    }

    fn map_memory(&mut self, memory: vk::DeviceMemory, offset: u64, size: u64) -> DeviceResult<()> {
        let block = self
            .host_blocks
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if offset + size > block.size || block.ranges.contains_key(&offset) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        block.ranges.insert(offset, size);
        Ok(())
    }

    fn unmap_memory(&mut self, memory: vk::DeviceMemory, offset: u64) {
        if let Some(block) = self.host_blocks.get_mut(&memory) {
            block.ranges.remove(&offset);
        }
    }

    fn write_mapped(&mut self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let block = self
            .host_blocks
            .get(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if !block.covers(offset, data.len() as u64) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        // Range checked against a live mapping of the whole block
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), block.ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    fn flush_mapped(&mut self, memory: vk::DeviceMemory, offset: u64, size: u64) -> DeviceResult<()> {
        if self.host_coherent {
            return Ok(());
        }
        let block = self
            .host_blocks
            .get(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;

        let atom = self.limits.non_coherent_atom_size.max(1);
        let start = offset / atom * atom;
        let end = (offset + size).div_ceil(atom) * atom;
        let size = if end >= block.size { vk::WHOLE_SIZE } else { end - start };
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(start)
            .size(size)
            .build();
        unsafe { self.device.flush_mapped_memory_ranges(&[range]) }
    }

    fn create_buffer(&mut self, size: u64, usage: vk::BufferUsageFlags) -> DeviceResult<(vk::Buffer, vk::MemoryRequirements)> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        Ok((buffer, requirements))
    }

    fn bind_buffer_memory(&mut self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: u64) -> DeviceResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_image(&mut self, desc: &ImageDesc) -> DeviceResult<ImageAllocation> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D { width: desc.extent.width, height: desc.extent.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(desc.samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let image = unsafe { self.device.create_image(&info, None)? };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = self.device_memory_type(requirements.memory_type_bits).and_then(|memory_type| {
            let allocate = vk::MemoryAllocateInfo::builder()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type);
            unsafe { self.device.allocate_memory(&allocate, None) }
        });
        let memory = match memory {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe {
            self.device
                .bind_image_memory(image, memory, 0)
                .and_then(|()| self.device.create_image_view(&view_info, None))
        };
        match view {
            Ok(view) => Ok(ImageAllocation { image, view, memory }),
            Err(e) => {
                unsafe {
                    self.device.destroy_image(image, None);
                    self.device.free_memory(memory, None);
                }
                Err(e)
            }
        }
    }

    fn destroy_image(&mut self, image: ImageAllocation) {
        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.image, None);
            self.device.free_memory(image.memory, None);
        }
    }

    fn create_sampler(&mut self, filter: vk::Filter, address_mode: vk::SamplerAddressMode) -> DeviceResult<vk::Sampler> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .max_lod(0.0);
        unsafe { self.device.create_sampler(&info, None) }
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> DeviceResult<vk::RenderPass> {
        let color_refs: Vec<vk::AttachmentReference> = desc
            .color
            .iter()
            .map(|&attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let resolve_refs: Vec<vk::AttachmentReference> = desc
            .resolve
            .iter()
            .map(|&attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = desc.depth.map(|attachment| vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        });

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if !resolve_refs.is_empty() {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpasses = [subpass.build()];

        // Earlier passes' writes become visible to this pass's reads and writes
        let dependencies = [vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        }];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&desc.attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        unsafe { self.device.create_render_pass(&info, None) }
    }

    fn destroy_render_pass(&mut self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(&mut self, render_pass: vk::RenderPass, views: &[vk::ImageView], extent: vk::Extent2D) -> DeviceResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        unsafe { self.device.create_framebuffer(&info, None) }
    }

    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_descriptor_set_layout(&mut self, bindings: &[LayoutBinding]) -> DeviceResult<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(binding.kind.to_vk())
                    .descriptor_count(1)
                    .stage_flags(binding.stages)
                    .build()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
    }

    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(&mut self, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> DeviceResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        unsafe { self.device.create_descriptor_pool(&info, None) }
    }

    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(&mut self, pool: vk::DescriptorPool, layout: vk::DescriptorSetLayout) -> DeviceResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        sets.first().copied().ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn write_descriptor_set(&mut self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        enum Info {
            Buffer([vk::DescriptorBufferInfo; 1]),
            Image([vk::DescriptorImageInfo; 1]),
        }

        let infos: Vec<(u32, Info)> = writes
            .iter()
            .map(|write| {
                let info = match write.resource {
                    DescriptorResource::Buffer { buffer, range } => Info::Buffer([vk::DescriptorBufferInfo {
                        buffer,
                        offset: 0,
                        range,
                    }]),
                    DescriptorResource::Image { view, sampler } => Info::Image([vk::DescriptorImageInfo {
                        sampler,
                        image_view: view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }]),
                };
                (write.binding, info)
            })
            .collect();

        let updates: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .map(|(binding, info)| {
                let write = vk::WriteDescriptorSet::builder().dst_set(set).dst_binding(*binding);
                match info {
                    Info::Buffer(buffer) => write
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                        .buffer_info(buffer)
                        .build(),
                    Info::Image(image) => write
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(image)
                        .build(),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&updates, &[]) };
    }

    fn create_pipeline_layout(&mut self, set_layouts: &[vk::DescriptorSetLayout]) -> DeviceResult<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        unsafe { self.device.create_pipeline_layout(&info, None) }
    }

    fn destroy_pipeline_layout(&mut self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> DeviceResult<vk::Pipeline> {
        if !desc.vertex_shader.is_spirv() || !desc.fragment_shader.is_spirv() {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        let vertex_module = create_shader_module(&self.device, desc.vertex_shader.words())?;
        let fragment_module = match create_shader_module(&self.device, desc.fragment_shader.words()) {
            Ok(module) => module,
            Err(e) => {
                unsafe { self.device.destroy_shader_module(vertex_module, None) };
                return Err(e);
            }
        };

        let result = build_pipeline(&self.device, desc, vertex_module, fragment_module);
        unsafe {
            self.device.destroy_shader_module(vertex_module, None);
            self.device.destroy_shader_module(fragment_module, None);
        }
        result
    }

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_fence(&mut self, signaled: bool) -> DeviceResult<vk::Fence> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        unsafe {
            if let Some(buffer) = self.command_buffers.remove(&fence) {
                self.device.free_command_buffers(self.command_pool, &[buffer]);
            }
            self.device.destroy_fence(fence, None);
        }
    }

    fn wait_for_fence(&mut self, fence: vk::Fence, timeout: Duration) -> DeviceResult<()> {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        unsafe { self.device.wait_for_fences(&[fence], true, nanos) }
    }

    fn fence_signaled(&mut self, fence: vk::Fence) -> DeviceResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> DeviceResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn create_semaphore(&mut self) -> DeviceResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn submit(&mut self, submission: &Submission<'_>) -> DeviceResult<()> {
        let buffer = self.command_buffer_for(submission.fence)?;
        self.record(buffer, submission.commands)?;

        let command_buffers = [buffer];
        let (wait_semaphores, wait_stages): (Vec<vk::Semaphore>, Vec<vk::PipelineStageFlags>) =
            submission.wait.into_iter().unzip();
        let signal_semaphores: Vec<vk::Semaphore> = submission.signal.into_iter().collect();
        let info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[info], submission.fence)
        }
    }

    fn wait_idle(&mut self) -> DeviceResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> DeviceResult<u32> {
        let (index, suboptimal) = unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain.handle, u64::MAX, signal, vk::Fence::null())?
        };
        if suboptimal {
            log::debug!("Acquired suboptimal swapchain image {}", index);
        }
        Ok(index)
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> DeviceResult<()> {
        let wait_semaphores = [wait];
        let swapchains = [self.swapchain.handle];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let suboptimal = unsafe { self.swapchain_loader.queue_present(self.present_queue, &info)? };
        if suboptimal {
            return Err(vk::Result::SUBOPTIMAL_KHR);
        }
        Ok(())
    }

    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> DeviceResult<()> {
        unsafe { self.device.device_wait_idle()? };

        let swapchain = create_swapchain(
            &self.surface_loader,
            &self.swapchain_loader,
            self.physical_device,
            self.surface,
            extent,
            self.swapchain.handle,
        )?;
        let old = std::mem::replace(&mut self.swapchain, swapchain);
        unsafe { self.swapchain_loader.destroy_swapchain(old.handle, None) };

        log::info!(
            "Swapchain recreated at {}x{}",
            self.swapchain.extent.width,
            self.swapchain.extent.height
        );
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for (memory, _) in self.host_blocks.drain() {
                self.device.unmap_memory(memory);
                self.device.free_memory(memory, None);
            }
            self.device.destroy_command_pool(self.command_pool, None);
            self.swapchain_loader.destroy_swapchain(self.swapchain.handle, None);
            self.device.destroy_device(None);
        }
    }
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("families", &self.families)
            .field("extent", &self.swapchain.extent)
            .field("swapchain_images", &self.swapchain.images.len())
            .field("host_coherent", &self.host_coherent)
            .finish_non_exhaustive()
    }
}

fn pick_physical_device(instance: &Instance, surface_loader: &Surface, surface: vk::SurfaceKHR) -> DeviceResult<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    for device in devices {
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let mut graphics = None;
        let mut present = None;

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics.is_none() {
                graphics = Some(index);
            }
            let supported = unsafe { surface_loader.get_physical_device_surface_support(device, index, surface)? };
            if supported && present.is_none() {
                present = Some(index);
            }
        }

        if let (Some(graphics), Some(present)) = (graphics, present) {
            return Ok((device, QueueFamilies { graphics, present }));
        }
    }

    log::error!("No GPU with graphics and present support for the surface");
    Err(vk::Result::ERROR_INCOMPATIBLE_DRIVER)
}

fn find_memory_type(properties: &vk::PhysicalDeviceMemoryProperties, type_filter: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
    (0..properties.memory_type_count).find(|&index| {
        type_filter & (1 << index) != 0
            && properties.memory_types[index as usize].property_flags.contains(flags)
    })
}

/// Prefer device-local memory; fall back to any type in `type_filter`
fn pick_device_memory_type(properties: &vk::PhysicalDeviceMemoryProperties, type_filter: u32) -> Option<u32> {
    find_memory_type(properties, type_filter, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        .or_else(|| find_memory_type(properties, type_filter, vk::MemoryPropertyFlags::empty()))
}

/// Prefer coherent host memory; fall back to any host-visible type
fn pick_host_memory_type(properties: &vk::PhysicalDeviceMemoryProperties) -> Option<(u32, bool)> {
    let coherent = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    find_memory_type(properties, u32::MAX, coherent)
        .map(|index| (index, true))
        .or_else(|| {
            find_memory_type(properties, u32::MAX, vk::MemoryPropertyFlags::HOST_VISIBLE).map(|index| (index, false))
        })
}

fn create_swapchain(
    surface_loader: &Surface,
    swapchain_loader: &Swapchain,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    requested: vk::Extent2D,
    old_swapchain: vk::SwapchainKHR,
) -> DeviceResult<SwapchainState> {
    let caps = unsafe { surface_loader.get_physical_device_surface_capabilities(physical_device, surface)? };
    let formats = unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface)? };
    let modes = unsafe { surface_loader.get_physical_device_surface_present_modes(physical_device, surface)? };

    let format = formats
        .iter()
        .find(|sf| sf.format == SURFACE_FORMAT && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
        .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;

    let present_mode = modes
        .iter()
        .copied()
        .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO);

    let extent = if caps.current_extent.width == u32::MAX {
        vk::Extent2D {
            width: requested.width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested.height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    } else {
        caps.current_extent
    };

    let image_count = if caps.max_image_count > 0 {
        (caps.min_image_count + 1).min(caps.max_image_count)
    } else {
        caps.min_image_count + 1
    };

    let info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let handle = unsafe { swapchain_loader.create_swapchain(&info, None)? };
    let images = match unsafe { swapchain_loader.get_swapchain_images(handle) } {
        Ok(images) => images,
        Err(e) => {
            unsafe { swapchain_loader.destroy_swapchain(handle, None) };
            return Err(e);
        }
    };

    Ok(SwapchainState { handle, images, format, extent })
}

fn create_shader_module(device: &Device, words: &[u32]) -> DeviceResult<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::builder().code(words);
    unsafe { device.create_shader_module(&info, None) }
}

fn build_pipeline(
    device: &Device,
    desc: &GraphicsPipelineDesc<'_>,
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
) -> DeviceResult<vk::Pipeline> {
    let entry = CStr::from_bytes_with_nul(b"main\0").map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED)?;
    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(entry)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_module)
            .name(entry)
            .build(),
    ];

    let bindings: Vec<vk::VertexInputBindingDescription> = desc
        .vertex_input
        .iter()
        .map(|input| vk::VertexInputBindingDescription {
            binding: 0,
            stride: input.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        })
        .collect();
    let attributes: &[vk::VertexInputAttributeDescription] =
        desc.vertex_input.map_or(&[][..], |input| input.attributes.as_slice());
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(desc.topology)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(desc.polygon_mode)
        .line_width(1.0)
        .cull_mode(desc.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(desc.samples);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let blend_attachment = if desc.blend {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build()
    } else {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()
    };
    let blend_attachments = vec![blend_attachment; desc.color_attachments as usize];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(desc.layout)
        .render_pass(desc.render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
            .map_err(|(_, err)| err)?
    };
    pipelines.first().copied().ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
}

fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access_mask: vk::AccessFlags,
    dst_access_mask: vk::AccessFlags,
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(src_access_mask)
        .dst_access_mask(dst_access_mask)
        .build()
}

const fn full_rect(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent }
}

const fn far_corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D { x: extent.width as i32, y: extent.height as i32, z: 1 }
}
