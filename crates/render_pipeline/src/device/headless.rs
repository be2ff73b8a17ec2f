//! Simulated GPU for tests and headless runs
//!
//! Handles are counters. Submissions sit in an in-order queue and complete
//! once `completion_latency` newer submissions exist, when their fence is
//! waited on, or on `wait_idle`. Host-visible memory keeps a host copy and a
//! device copy; without coherency, writes reach the device copy only through
//! `flush_mapped`.
//!
//! While work is pending the device records hazards: host writes into memory
//! bound to a referenced buffer, destruction of referenced objects, and
//! descriptor updates of referenced sets. It also flags an acquire that
//! signals a semaphore nothing has waited on since its last signal.

use ash::vk::{self, Handle};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use super::{
    DescriptorKind, DescriptorResource, DescriptorWrite, DeviceLimits, DeviceResult, GpuDevice,
    GraphicsPipelineDesc, ImageAllocation, ImageDesc, LayoutBinding, MemoryLocation, RenderPassDesc,
    Submission,
};
use crate::command::{Command, CommandStream};

/// Kinds of tracked device objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Device memory, including dedicated image memory
    Memory,
    /// Buffer
    Buffer,
    /// Image
    Image,
    /// Image view
    ImageView,
    /// Sampler
    Sampler,
    /// Render pass
    RenderPass,
    /// Framebuffer
    Framebuffer,
    /// Descriptor set layout
    DescriptorSetLayout,
    /// Descriptor pool
    DescriptorPool,
    /// Pipeline layout
    PipelineLayout,
    /// Graphics pipeline
    Pipeline,
    /// Fence
    Fence,
    /// Semaphore
    Semaphore,
}

/// Headless device settings
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Host-visible memory needs no flush
    pub coherent_host_memory: bool,
    /// Submissions complete once this many newer ones exist
    pub completion_latency: usize,
    /// Swapchain image count
    pub swapchain_images: u32,
    /// Initial swapchain extent
    pub extent: vk::Extent2D,
    /// Reported limits
    pub limits: DeviceLimits,
    /// Device-local bytes before allocations fail
    pub device_local_budget: Option<u64>,
    /// Host-visible bytes before allocations fail
    pub host_visible_budget: Option<u64>,
    /// `memory_type_bits` reported for every buffer; device-local blocks use
    /// type 0 and host-visible blocks type 1
    pub buffer_memory_type_bits: u32,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            coherent_host_memory: false,
            completion_latency: 1,
            swapchain_images: 3,
            extent: vk::Extent2D { width: 1280, height: 720 },
            limits: DeviceLimits::default(),
            device_local_budget: None,
            host_visible_budget: None,
            buffer_memory_type_bits: u32::MAX,
        }
    }
}

/// Misuse detected while work was pending
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HazardReport {
    /// Host writes into memory bound to a buffer referenced by pending work
    pub host_writes_in_use: usize,
    /// Objects destroyed while referenced by pending work
    pub destroyed_in_use: usize,
    /// Descriptor sets updated while referenced by pending work
    pub descriptor_writes_in_use: usize,
    /// Submissions referencing destroyed objects
    pub stale_references: usize,
    /// Acquires signaling a semaphore that is still signaled
    pub semaphore_resignals: usize,
}

impl HazardReport {
    /// Sum of every hazard counter
    #[must_use]
    pub const fn total(&self) -> usize {
        self.host_writes_in_use
            + self.destroyed_in_use
            + self.descriptor_writes_in_use
            + self.stale_references
            + self.semaphore_resignals
    }
}

/// Activity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    /// Queue submissions
    pub submissions: u64,
    /// Presented images
    pub presents: u64,
    /// Flush calls
    pub flushes: u64,
    /// Fence waits
    pub fence_waits: u64,
    /// Most fenced submissions pending at once
    pub max_unsignaled_fences: usize,
    /// Destroy calls on unknown or already destroyed handles
    pub invalid_destroys: usize,
}

#[derive(Debug)]
struct MemoryRecord {
    location: MemoryLocation,
    size: u64,
    host: Vec<u8>,
    device: Vec<u8>,
    mapped: Vec<(u64, u64)>,
}

#[derive(Debug)]
struct BufferRecord {
    size: u64,
    binding: Option<(u64, u64)>,
}

#[derive(Debug)]
struct ImageRecord {
    extent: vk::Extent2D,
    view: u64,
    memory: u64,
}

#[derive(Debug)]
struct SetRecord {
    pool: u64,
    layout: Vec<LayoutBinding>,
    bindings: HashMap<u32, DescriptorResource>,
}

#[derive(Debug, Default)]
struct References {
    buffers: HashSet<u64>,
    images: HashSet<u64>,
    framebuffers: HashSet<u64>,
    sets: HashSet<u64>,
}

#[derive(Debug)]
struct PendingSubmission {
    fence: Option<u64>,
    references: References,
}

/// Simulated GPU implementing [`GpuDevice`]
#[derive(Debug)]
pub struct HeadlessDevice {
    config: HeadlessConfig,
    next_handle: u64,
    objects: HashMap<u64, ObjectKind>,
    memories: HashMap<u64, MemoryRecord>,
    buffers: HashMap<u64, BufferRecord>,
    images: HashMap<u64, ImageRecord>,
    views: HashMap<u64, u64>,
    render_passes: HashMap<u64, usize>,
    framebuffers: HashMap<u64, Vec<u64>>,
    set_layouts: HashMap<u64, Vec<LayoutBinding>>,
    pools: HashMap<u64, (u32, u32)>,
    sets: HashMap<u64, SetRecord>,
    fences: HashMap<u64, bool>,
    signaled_semaphores: HashSet<u64>,
    pending: VecDeque<PendingSubmission>,
    device_local_used: u64,
    host_visible_used: u64,
    swapchain_extent: vk::Extent2D,
    next_image: u32,
    out_of_date: bool,
    hung: bool,
    fail_next_flush: bool,
    hazards: HazardReport,
    stats: HeadlessStats,
}

impl HeadlessDevice {
    /// Create a device
    #[must_use]
    pub fn new(config: HeadlessConfig) -> Self {
        let swapchain_extent = config.extent;
        Self {
            config,
            next_handle: 0,
            objects: HashMap::new(),
            memories: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            views: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            set_layouts: HashMap::new(),
            pools: HashMap::new(),
            sets: HashMap::new(),
            fences: HashMap::new(),
            signaled_semaphores: HashSet::new(),
            pending: VecDeque::new(),
            device_local_used: 0,
            host_visible_used: 0,
            swapchain_extent,
            next_image: 0,
            out_of_date: false,
            hung: false,
            fail_next_flush: false,
            hazards: HazardReport::default(),
            stats: HeadlessStats::default(),
        }
    }

    /// Stop completing work; fence waits time out
    pub fn set_hung(&mut self, hung: bool) {
        self.hung = hung;
    }

    /// Fail the next `flush_mapped` with `ERROR_MEMORY_MAP_FAILED`
    pub fn fail_next_flush(&mut self) {
        self.fail_next_flush = true;
    }

    /// Fail the next acquire with `ERROR_OUT_OF_DATE_KHR` until the swapchain is recreated
    pub fn mark_swapchain_out_of_date(&mut self) {
        self.out_of_date = true;
    }

    /// Live objects of one kind
    #[must_use]
    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.objects.values().filter(|live| **live == kind).count()
    }

    /// Live objects of every kind
    #[must_use]
    pub fn live_total(&self) -> usize {
        self.objects.len()
    }

    /// Extents of every live image
    #[must_use]
    pub fn live_image_extents(&self) -> Vec<vk::Extent2D> {
        self.images.values().map(|image| image.extent).collect()
    }

    /// Hazards observed so far
    #[must_use]
    pub const fn hazards(&self) -> HazardReport {
        self.hazards
    }

    /// Activity counters
    #[must_use]
    pub const fn stats(&self) -> HeadlessStats {
        self.stats
    }

    /// Submissions not yet complete
    #[must_use]
    pub fn pending_submissions(&self) -> usize {
        self.pending.len()
    }

    /// Device-side contents of a host-visible memory range
    #[must_use]
    pub fn read_device(&self, memory: vk::DeviceMemory, offset: u64, len: u64) -> Option<&[u8]> {
        let record = self.memories.get(&memory.as_raw())?;
        let start = usize::try_from(offset).ok()?;
        let end = usize::try_from(offset.checked_add(len)?).ok()?;
        record.device.get(start..end)
    }

    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn create<H: Handle>(&mut self, kind: ObjectKind) -> H {
        let raw = self.next_raw();
        self.objects.insert(raw, kind);
        H::from_raw(raw)
    }

    fn is_live(&self, raw: u64, kind: ObjectKind) -> bool {
        self.objects.get(&raw) == Some(&kind)
    }

    fn release(&mut self, raw: u64, kind: ObjectKind) -> bool {
        if self.is_live(raw, kind) {
            self.objects.remove(&raw);
            true
        } else {
            self.stats.invalid_destroys += 1;
            log::warn!("Destroy of unknown {:?} handle {:#x}", kind, raw);
            false
        }
    }

    fn in_use(&self, used: impl Fn(&References) -> bool) -> bool {
        self.pending.iter().any(|submission| used(&submission.references))
    }

    fn note_destroy_in_use(&mut self, used: impl Fn(&References) -> bool, what: &str) {
        if self.in_use(used) {
            self.hazards.destroyed_in_use += 1;
            log::error!("{} destroyed while referenced by pending work", what);
        }
    }

    fn usage_mut(&mut self, location: MemoryLocation) -> (&mut u64, Option<u64>) {
        match location {
            MemoryLocation::DeviceLocal => (&mut self.device_local_used, self.config.device_local_budget),
            MemoryLocation::HostVisible => (&mut self.host_visible_used, self.config.host_visible_budget),
        }
    }

    fn reserve(&mut self, location: MemoryLocation, size: u64) -> DeviceResult<()> {
        let exhausted = match location {
            MemoryLocation::DeviceLocal => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            MemoryLocation::HostVisible => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        };
        let (used, budget) = self.usage_mut(location);
        let total = used.checked_add(size).ok_or(exhausted)?;
        if budget.is_some_and(|budget| total > budget) {
            return Err(exhausted);
        }
        *used = total;
        Ok(())
    }

    fn unreserve(&mut self, location: MemoryLocation, size: u64) {
        let (used, _) = self.usage_mut(location);
        *used = used.saturating_sub(size);
    }

    fn complete_front(&mut self) {
        if let Some(submission) = self.pending.pop_front() {
            if let Some(signaled) = submission.fence.and_then(|raw| self.fences.get_mut(&raw)) {
                *signaled = true;
            }
        }
    }

    fn collect_references(&self, commands: &CommandStream) -> References {
        let mut references = References::default();

        for command in commands {
            match command {
                Command::BeginRenderPass { framebuffer, .. } => {
                    references.framebuffers.insert(framebuffer.as_raw());
                    if let Some(views) = self.framebuffers.get(&framebuffer.as_raw()) {
                        references
                            .images
                            .extend(views.iter().filter_map(|view| self.views.get(view).copied()));
                    }
                }
                Command::BindDescriptorSet { set, .. } => {
                    references.sets.insert(set.as_raw());
                    let bound = self.sets.get(&set.as_raw()).map(|record| record.bindings.values());
                    for resource in bound.into_iter().flatten() {
                        match resource {
                            DescriptorResource::Buffer { buffer, .. } => {
                                references.buffers.insert(buffer.as_raw());
                            }
                            DescriptorResource::Image { view, .. } => {
                                if let Some(image) = self.views.get(&view.as_raw()) {
                                    references.images.insert(*image);
                                }
                            }
                        }
                    }
                }
                Command::BindVertexBuffer { buffer, .. } | Command::BindIndexBuffer { buffer, .. } => {
                    references.buffers.insert(buffer.as_raw());
                }
                Command::CopyBuffer { src, dst, .. } => {
                    references.buffers.insert(src.as_raw());
                    references.buffers.insert(dst.as_raw());
                }
                Command::BlitToSwapchain { source, .. } => {
                    references.images.insert(source.as_raw());
                }
                _ => {}
            }
        }

        references
    }

    fn stale_count(&self, references: &References) -> usize {
        references.buffers.iter().filter(|raw| !self.is_live(**raw, ObjectKind::Buffer)).count()
            + references.images.iter().filter(|raw| !self.is_live(**raw, ObjectKind::Image)).count()
            + references
                .framebuffers
                .iter()
                .filter(|raw| !self.is_live(**raw, ObjectKind::Framebuffer))
                .count()
            + references.sets.iter().filter(|raw| !self.sets.contains_key(raw)).count()
    }

    fn buffer_overlaps(&self, buffer: u64, memory: u64, offset: u64, len: u64) -> bool {
        self.buffers
            .get(&buffer)
            .and_then(|record| record.binding.map(|binding| (binding, record.size)))
            .is_some_and(|((bound_memory, start), size)| {
                bound_memory == memory && offset < start + size && start < offset + len
            })
    }
}

fn texel_size(format: vk::Format) -> u64 {
    match format {
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::D32_SFLOAT_S8_UINT => 8,
        _ => 4,
    }
}

fn zeroed(len: usize) -> Option<Vec<u8>> {
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(len).ok()?;
    bytes.resize(len, 0);
    Some(bytes)
}

impl GpuDevice for HeadlessDevice {
    fn limits(&self) -> DeviceLimits {
        self.config.limits
    }

    fn memory_type_index(&self, location: MemoryLocation) -> u32 {
        match location {
            MemoryLocation::DeviceLocal => 0,
            MemoryLocation::HostVisible => 1,
        }
    }

    fn allocate_memory(&mut self, size: u64, location: MemoryLocation) -> DeviceResult<vk::DeviceMemory> {
        let bytes = match location {
            MemoryLocation::HostVisible => {
                usize::try_from(size).map_err(|_| vk::Result::ERROR_OUT_OF_HOST_MEMORY)?
            }
            MemoryLocation::DeviceLocal => 0,
        };
        self.reserve(location, size)?;

        // Host shadows are real allocations; a refused reservation is exhaustion
        let (Some(host), Some(device)) = (zeroed(bytes), zeroed(bytes)) else {
            self.unreserve(location, size);
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        };

        let memory: vk::DeviceMemory = self.create(ObjectKind::Memory);
        self.memories.insert(
            memory.as_raw(),
            MemoryRecord {
                location,
                size,
                host,
                device,
                mapped: Vec::new(),
            },
        );
        log::trace!("Allocated {} bytes of {:?} memory", size, location);
        Ok(memory)
    }

    fn free_memory(&mut self, memory: vk::DeviceMemory) {
        let raw = memory.as_raw();
        let bound: Vec<u64> = self
            .buffers
            .iter()
            .filter(|(_, record)| record.binding.is_some_and(|(bound, _)| bound == raw))
            .map(|(buffer, _)| *buffer)
            .collect();
        self.note_destroy_in_use(|refs| bound.iter().any(|buffer| refs.buffers.contains(buffer)), "Memory");

        if self.release(raw, ObjectKind::Memory) {
            if let Some(record) = self.memories.remove(&raw) {
                self.unreserve(record.location, record.size);
            }
        }
    }

    fn is_coherent(&self, location: MemoryLocation) -> bool {
        location == MemoryLocation::HostVisible && self.config.coherent_host_memory
    }

    fn map_memory(&mut self, memory: vk::DeviceMemory, offset: u64, size: u64) -> DeviceResult<()> {
        let record = self
            .memories
            .get_mut(&memory.as_raw())
            .filter(|record| record.location == MemoryLocation::HostVisible)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;

        let overlaps = record
            .mapped
            .iter()
            .any(|&(start, len)| offset < start + len && start < offset + size);
        if overlaps || offset + size > record.size {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        record.mapped.push((offset, size));
        Ok(())
    }

    fn unmap_memory(&mut self, memory: vk::DeviceMemory, offset: u64) {
        let Some(record) = self.memories.get_mut(&memory.as_raw()) else {
            log::warn!("Unmap of unknown memory {:#x}", memory.as_raw());
            return;
        };
        let before = record.mapped.len();
        record.mapped.retain(|&(start, _)| start != offset);
        if record.mapped.len() == before {
            log::warn!("Unmap of memory {:#x} at {} which is not mapped", memory.as_raw(), offset);
        }
    }

    fn write_mapped(&mut self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let raw = memory.as_raw();
        let len = data.len() as u64;

        let referenced = self.pending.iter().any(|submission| {
            submission
                .references
                .buffers
                .iter()
                .any(|buffer| self.buffer_overlaps(*buffer, raw, offset, len))
        });
        if referenced {
            self.hazards.host_writes_in_use += 1;
            log::error!("Host write into memory {:#x} at {} while pending work reads it", raw, offset);
        }

        let coherent = self.config.coherent_host_memory;
        let record = self.memories.get_mut(&raw).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let inside_mapping = record
            .mapped
            .iter()
            .any(|&(start, size)| offset >= start && offset + len <= start + size);
        if !inside_mapping {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        let start = usize::try_from(offset).map_err(|_| vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let end = start + data.len();
        record.host[start..end].copy_from_slice(data);
        if coherent {
            record.device[start..end].copy_from_slice(data);
        }
        Ok(())
    }

    fn flush_mapped(&mut self, memory: vk::DeviceMemory, offset: u64, size: u64) -> DeviceResult<()> {
        if std::mem::take(&mut self.fail_next_flush) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        self.stats.flushes += 1;
        let record = self
            .memories
            .get_mut(&memory.as_raw())
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let inside_mapping = record
            .mapped
            .iter()
            .any(|&(start, len)| offset >= start && offset + size <= start + len);
        if !inside_mapping {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        let start = usize::try_from(offset).map_err(|_| vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let end = usize::try_from(offset + size).map_err(|_| vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let (host, device) = (&record.host, &mut record.device);
        device[start..end].copy_from_slice(&host[start..end]);
        Ok(())
    }

    fn create_buffer(&mut self, size: u64, usage: vk::BufferUsageFlags) -> DeviceResult<(vk::Buffer, vk::MemoryRequirements)> {
        if size == 0 {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let alignment = if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            self.config.limits.min_uniform_buffer_offset_alignment
        } else {
            16
        };

        let buffer: vk::Buffer = self.create(ObjectKind::Buffer);
        self.buffers.insert(buffer.as_raw(), BufferRecord { size, binding: None });
        Ok((
            buffer,
            vk::MemoryRequirements {
                size,
                alignment,
                memory_type_bits: self.config.buffer_memory_type_bits,
            },
        ))
    }

    fn bind_buffer_memory(&mut self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: u64) -> DeviceResult<()> {
        let memory_size = self
            .memories
            .get(&memory.as_raw())
            .map(|record| record.size)
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        let record = self
            .buffers
            .get_mut(&buffer.as_raw())
            .filter(|record| record.binding.is_none())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        if offset + record.size > memory_size {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        record.binding = Some((memory.as_raw(), offset));
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        let raw = buffer.as_raw();
        self.note_destroy_in_use(|refs| refs.buffers.contains(&raw), "Buffer");
        if self.release(raw, ObjectKind::Buffer) {
            self.buffers.remove(&raw);
        }
    }

    fn create_image(&mut self, desc: &ImageDesc) -> DeviceResult<ImageAllocation> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let bytes = u64::from(desc.extent.width)
            * u64::from(desc.extent.height)
            * texel_size(desc.format)
            * u64::from(desc.samples.as_raw().max(1));
        self.reserve(MemoryLocation::DeviceLocal, bytes)?;

        let image: vk::Image = self.create(ObjectKind::Image);
        let view: vk::ImageView = self.create(ObjectKind::ImageView);
        let memory: vk::DeviceMemory = self.create(ObjectKind::Memory);
        self.memories.insert(
            memory.as_raw(),
            MemoryRecord {
                location: MemoryLocation::DeviceLocal,
                size: bytes,
                host: Vec::new(),
                device: Vec::new(),
                mapped: Vec::new(),
            },
        );
        self.views.insert(view.as_raw(), image.as_raw());
        self.images.insert(
            image.as_raw(),
            ImageRecord {
                extent: desc.extent,
                view: view.as_raw(),
                memory: memory.as_raw(),
            },
        );

        Ok(ImageAllocation { image, view, memory })
    }

    fn destroy_image(&mut self, image: ImageAllocation) {
        let raw = image.image.as_raw();
        self.note_destroy_in_use(|refs| refs.images.contains(&raw), "Image");

        if !self.release(raw, ObjectKind::Image) {
            return;
        }
        if let Some(record) = self.images.remove(&raw) {
            self.views.remove(&record.view);
            self.release(record.view, ObjectKind::ImageView);
            if self.release(record.memory, ObjectKind::Memory) {
                if let Some(memory) = self.memories.remove(&record.memory) {
                    self.unreserve(memory.location, memory.size);
                }
            }
        }
    }

    fn create_sampler(&mut self, _filter: vk::Filter, _address_mode: vk::SamplerAddressMode) -> DeviceResult<vk::Sampler> {
        Ok(self.create(ObjectKind::Sampler))
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        self.release(sampler.as_raw(), ObjectKind::Sampler);
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> DeviceResult<vk::RenderPass> {
        let count = desc.attachments.len();
        let in_range = |index: &u32| (*index as usize) < count;
        let valid = desc.color.iter().all(in_range)
            && desc.resolve.iter().all(in_range)
            && desc.depth.iter().all(in_range)
            && (desc.resolve.is_empty() || desc.resolve.len() == desc.color.len());
        if !valid {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        let render_pass: vk::RenderPass = self.create(ObjectKind::RenderPass);
        self.render_passes.insert(render_pass.as_raw(), count);
        Ok(render_pass)
    }

    fn destroy_render_pass(&mut self, render_pass: vk::RenderPass) {
        if self.release(render_pass.as_raw(), ObjectKind::RenderPass) {
            self.render_passes.remove(&render_pass.as_raw());
        }
    }

    fn create_framebuffer(&mut self, render_pass: vk::RenderPass, views: &[vk::ImageView], extent: vk::Extent2D) -> DeviceResult<vk::Framebuffer> {
        let expected = self
            .render_passes
            .get(&render_pass.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        if expected != views.len() {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        let large_enough = views.iter().all(|view| {
            self.views
                .get(&view.as_raw())
                .and_then(|image| self.images.get(image))
                .is_some_and(|image| image.extent.width >= extent.width && image.extent.height >= extent.height)
        });
        if !large_enough {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        let framebuffer: vk::Framebuffer = self.create(ObjectKind::Framebuffer);
        self.framebuffers
            .insert(framebuffer.as_raw(), views.iter().map(|view| view.as_raw()).collect());
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        let raw = framebuffer.as_raw();
        self.note_destroy_in_use(|refs| refs.framebuffers.contains(&raw), "Framebuffer");
        if self.release(raw, ObjectKind::Framebuffer) {
            self.framebuffers.remove(&raw);
        }
    }

    fn create_descriptor_set_layout(&mut self, bindings: &[LayoutBinding]) -> DeviceResult<vk::DescriptorSetLayout> {
        let layout: vk::DescriptorSetLayout = self.create(ObjectKind::DescriptorSetLayout);
        self.set_layouts.insert(layout.as_raw(), bindings.to_vec());
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        if self.release(layout.as_raw(), ObjectKind::DescriptorSetLayout) {
            self.set_layouts.remove(&layout.as_raw());
        }
    }

    fn create_descriptor_pool(&mut self, max_sets: u32, _sizes: &[vk::DescriptorPoolSize]) -> DeviceResult<vk::DescriptorPool> {
        let pool: vk::DescriptorPool = self.create(ObjectKind::DescriptorPool);
        self.pools.insert(pool.as_raw(), (max_sets, 0));
        Ok(pool)
    }

    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        let raw = pool.as_raw();
        if self.release(raw, ObjectKind::DescriptorPool) {
            self.pools.remove(&raw);
            self.sets.retain(|_, set| set.pool != raw);
        }
    }

    fn allocate_descriptor_set(&mut self, pool: vk::DescriptorPool, layout: vk::DescriptorSetLayout) -> DeviceResult<vk::DescriptorSet> {
        let bindings = self
            .set_layouts
            .get(&layout.as_raw())
            .cloned()
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        let (max_sets, allocated) = self
            .pools
            .get_mut(&pool.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        if *allocated >= *max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        *allocated += 1;

        let raw = self.next_raw();
        self.sets.insert(
            raw,
            SetRecord {
                pool: pool.as_raw(),
                layout: bindings,
                bindings: HashMap::new(),
            },
        );
        Ok(vk::DescriptorSet::from_raw(raw))
    }

    fn write_descriptor_set(&mut self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let raw = set.as_raw();
        if self.in_use(|refs| refs.sets.contains(&raw)) {
            self.hazards.descriptor_writes_in_use += 1;
            log::error!("Descriptor set {:#x} updated while referenced by pending work", raw);
        }

        let Some(record) = self.sets.get_mut(&raw) else {
            log::warn!("Write to unknown descriptor set {:#x}", raw);
            return;
        };
        for write in writes {
            let declared = record.layout.iter().find(|binding| binding.binding == write.binding);
            let matches = match (declared.map(|binding| binding.kind), write.resource) {
                (Some(DescriptorKind::DynamicUniform), DescriptorResource::Buffer { .. })
                | (Some(DescriptorKind::CombinedImageSampler), DescriptorResource::Image { .. }) => true,
                _ => false,
            };
            if matches {
                record.bindings.insert(write.binding, write.resource);
            } else {
                log::warn!("Descriptor write to binding {} does not match the set layout", write.binding);
            }
        }
    }

    fn create_pipeline_layout(&mut self, set_layouts: &[vk::DescriptorSetLayout]) -> DeviceResult<vk::PipelineLayout> {
        if !set_layouts.iter().all(|layout| self.is_live(layout.as_raw(), ObjectKind::DescriptorSetLayout)) {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        Ok(self.create(ObjectKind::PipelineLayout))
    }

    fn destroy_pipeline_layout(&mut self, layout: vk::PipelineLayout) {
        self.release(layout.as_raw(), ObjectKind::PipelineLayout);
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> DeviceResult<vk::Pipeline> {
        if !desc.vertex_shader.is_spirv() || !desc.fragment_shader.is_spirv() {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        if !self.is_live(desc.render_pass.as_raw(), ObjectKind::RenderPass)
            || !self.is_live(desc.layout.as_raw(), ObjectKind::PipelineLayout)
        {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        Ok(self.create(ObjectKind::Pipeline))
    }

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.release(pipeline.as_raw(), ObjectKind::Pipeline);
    }

    fn create_fence(&mut self, signaled: bool) -> DeviceResult<vk::Fence> {
        let fence: vk::Fence = self.create(ObjectKind::Fence);
        self.fences.insert(fence.as_raw(), signaled);
        Ok(fence)
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        let raw = fence.as_raw();
        if self.pending.iter().any(|submission| submission.fence == Some(raw)) {
            self.hazards.destroyed_in_use += 1;
            log::error!("Fence {:#x} destroyed while its submission is pending", raw);
        }
        if self.release(raw, ObjectKind::Fence) {
            self.fences.remove(&raw);
        }
    }

    fn wait_for_fence(&mut self, fence: vk::Fence, _timeout: Duration) -> DeviceResult<()> {
        self.stats.fence_waits += 1;
        let raw = fence.as_raw();
        match self.fences.get(&raw).copied() {
            None => Err(vk::Result::ERROR_UNKNOWN),
            Some(true) => Ok(()),
            Some(false) if self.hung => Err(vk::Result::TIMEOUT),
            Some(false) => {
                let position = self
                    .pending
                    .iter()
                    .position(|submission| submission.fence == Some(raw))
                    .ok_or(vk::Result::TIMEOUT)?;
                for _ in 0..=position {
                    self.complete_front();
                }
                Ok(())
            }
        }
    }

    fn fence_signaled(&mut self, fence: vk::Fence) -> DeviceResult<bool> {
        self.fences.get(&fence.as_raw()).copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> DeviceResult<()> {
        let signaled = self.fences.get_mut(&fence.as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?;
        *signaled = false;
        Ok(())
    }

    fn create_semaphore(&mut self) -> DeviceResult<vk::Semaphore> {
        Ok(self.create(ObjectKind::Semaphore))
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.signaled_semaphores.remove(&semaphore.as_raw());
        self.release(semaphore.as_raw(), ObjectKind::Semaphore);
    }

    fn submit(&mut self, submission: &Submission<'_>) -> DeviceResult<()> {
        let fence = (submission.fence != vk::Fence::null()).then(|| submission.fence.as_raw());
        if let Some(raw) = fence {
            match self.fences.get(&raw) {
                None => return Err(vk::Result::ERROR_UNKNOWN),
                Some(true) => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
                Some(false) => {}
            }
        }
        let semaphores = submission.wait.map(|(semaphore, _)| semaphore).into_iter().chain(submission.signal);
        for semaphore in semaphores {
            if !self.is_live(semaphore.as_raw(), ObjectKind::Semaphore) {
                return Err(vk::Result::ERROR_UNKNOWN);
            }
        }

        let references = self.collect_references(submission.commands);
        let stale = self.stale_count(&references);
        if stale > 0 {
            self.hazards.stale_references += stale;
            log::error!("Submission references {} destroyed objects", stale);
        }

        if let Some((semaphore, _)) = submission.wait {
            self.signaled_semaphores.remove(&semaphore.as_raw());
        }
        if let Some(semaphore) = submission.signal {
            self.signaled_semaphores.insert(semaphore.as_raw());
        }
        self.pending.push_back(PendingSubmission { fence, references });
        self.stats.submissions += 1;
        let unsignaled = self.pending.iter().filter(|pending| pending.fence.is_some()).count();
        self.stats.max_unsignaled_fences = self.stats.max_unsignaled_fences.max(unsignaled);

        if !self.hung {
            while self.pending.len() > self.config.completion_latency {
                self.complete_front();
            }
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> DeviceResult<()> {
        if self.hung && !self.pending.is_empty() {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        while !self.pending.is_empty() {
            self.complete_front();
        }
        Ok(())
    }

    fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain_extent
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> DeviceResult<u32> {
        if !self.is_live(signal.as_raw(), ObjectKind::Semaphore) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        if self.out_of_date {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        if !self.signaled_semaphores.insert(signal.as_raw()) {
            self.hazards.semaphore_resignals += 1;
            log::error!("Acquire signals semaphore {:#x} which nothing waited on", signal.as_raw());
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.config.swapchain_images.max(1);
        Ok(index)
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> DeviceResult<()> {
        if image_index >= self.config.swapchain_images || !self.is_live(wait.as_raw(), ObjectKind::Semaphore) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        self.signaled_semaphores.remove(&wait.as_raw());
        self.stats.presents += 1;
        Ok(())
    }

    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> DeviceResult<()> {
        if extent.width == 0 || extent.height == 0 {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        self.swapchain_extent = extent;
        self.next_image = 0;
        self.out_of_date = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CopyRegion;

    fn host_buffer(device: &mut HeadlessDevice, size: u64) -> (vk::Buffer, vk::DeviceMemory) {
        let memory = device.allocate_memory(4096, MemoryLocation::HostVisible).unwrap();
        let (buffer, _) = device.create_buffer(size, vk::BufferUsageFlags::VERTEX_BUFFER).unwrap();
        device.bind_buffer_memory(buffer, memory, 0).unwrap();
        (buffer, memory)
    }

    /// Non-coherent writes reach the device copy only through a flush
    #[test]
    fn test_flush_publishes_host_writes() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let (_, memory) = host_buffer(&mut device, 64);

        device.map_memory(memory, 0, 64).unwrap();
        device.write_mapped(memory, 0, &[7; 16]).unwrap();
        assert_eq!(device.read_device(memory, 0, 16).unwrap(), &[0; 16]);

        device.flush_mapped(memory, 0, 16).unwrap();
        assert_eq!(device.read_device(memory, 0, 16).unwrap(), &[7; 16]);
    }

    #[test]
    fn test_write_outside_mapping_fails() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let (_, memory) = host_buffer(&mut device, 64);

        assert_eq!(device.write_mapped(memory, 0, &[1]), Err(vk::Result::ERROR_MEMORY_MAP_FAILED));
        device.map_memory(memory, 0, 64).unwrap();
        assert_eq!(device.write_mapped(memory, 60, &[1; 8]), Err(vk::Result::ERROR_MEMORY_MAP_FAILED));
        assert_eq!(device.map_memory(memory, 32, 8), Err(vk::Result::ERROR_MEMORY_MAP_FAILED));
    }

    #[test]
    fn test_device_local_memory_cannot_map() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let memory = device.allocate_memory(256, MemoryLocation::DeviceLocal).unwrap();
        assert_eq!(device.map_memory(memory, 0, 16), Err(vk::Result::ERROR_MEMORY_MAP_FAILED));
    }

    /// Work completes after the configured latency or when its fence is waited
    #[test]
    fn test_submission_latency_and_fence_wait() {
        let mut device = HeadlessDevice::new(HeadlessConfig {
            completion_latency: 2,
            ..HeadlessConfig::default()
        });
        let commands = CommandStream::new();
        let fences: Vec<_> = (0..3).map(|_| device.create_fence(false).unwrap()).collect();

        for fence in &fences {
            device
                .submit(&Submission { commands: &commands, wait: None, signal: None, fence: *fence })
                .unwrap();
        }

        assert_eq!(device.fence_signaled(fences[0]), Ok(true));
        assert_eq!(device.fence_signaled(fences[1]), Ok(false));
        assert_eq!(device.stats().max_unsignaled_fences, 3);

        device.wait_for_fence(fences[2], Duration::from_secs(1)).unwrap();
        assert_eq!(device.fence_signaled(fences[1]), Ok(true));
        assert_eq!(device.pending_submissions(), 0);
    }

    #[test]
    fn test_hung_device_times_out() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let fence = device.create_fence(false).unwrap();
        device
            .submit(&Submission { commands: &CommandStream::new(), wait: None, signal: None, fence })
            .unwrap();
        device.set_hung(true);

        let other = device.create_fence(false).unwrap();
        device
            .submit(&Submission { commands: &CommandStream::new(), wait: None, signal: None, fence: other })
            .unwrap();

        assert_eq!(device.wait_for_fence(fence, Duration::from_millis(1)), Err(vk::Result::TIMEOUT));
        assert_eq!(device.wait_idle(), Err(vk::Result::ERROR_DEVICE_LOST));
    }

    /// Writes and destruction touching pending work are recorded as hazards
    #[test]
    fn test_hazards_recorded_while_pending() {
        let mut device = HeadlessDevice::new(HeadlessConfig {
            completion_latency: usize::MAX,
            ..HeadlessConfig::default()
        });
        let (buffer, memory) = host_buffer(&mut device, 64);
        let (other, _) = host_buffer(&mut device, 64);
        device.map_memory(memory, 0, 128).unwrap();

        let mut commands = CommandStream::new();
        commands.push(Command::BindVertexBuffer { buffer, offset: 0 });
        let fence = device.create_fence(false).unwrap();
        device.submit(&Submission { commands: &commands, wait: None, signal: None, fence }).unwrap();

        device.write_mapped(memory, 64, &[1; 16]).unwrap();
        assert_eq!(device.hazards().host_writes_in_use, 0);
        device.write_mapped(memory, 8, &[1; 16]).unwrap();
        assert_eq!(device.hazards().host_writes_in_use, 1);

        device.destroy_buffer(buffer);
        assert_eq!(device.hazards().destroyed_in_use, 1);

        device.wait_for_fence(fence, Duration::from_secs(1)).unwrap();
        device.destroy_buffer(other);
        assert_eq!(device.hazards().destroyed_in_use, 1);
    }

    #[test]
    fn test_stale_reference_detected() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let (src, _) = host_buffer(&mut device, 32);
        let (dst, _) = host_buffer(&mut device, 32);
        device.destroy_buffer(dst);

        let mut commands = CommandStream::new();
        commands.push(Command::CopyBuffer {
            src,
            dst,
            region: CopyRegion { src_offset: 0, dst_offset: 0, size: 32 },
        });
        let fence = device.create_fence(false).unwrap();
        device.submit(&Submission { commands: &commands, wait: None, signal: None, fence }).unwrap();

        assert_eq!(device.hazards().stale_references, 1);
    }

    #[test]
    fn test_live_object_tracking() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let image = device
            .create_image(&ImageDesc {
                extent: vk::Extent2D { width: 64, height: 32 },
                format: vk::Format::R8G8B8A8_UNORM,
                samples: vk::SampleCountFlags::TYPE_1,
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                aspect: vk::ImageAspectFlags::COLOR,
            })
            .unwrap();

        assert_eq!(device.live_total(), 3);
        assert_eq!(device.live_image_extents(), vec![vk::Extent2D { width: 64, height: 32 }]);

        device.destroy_image(image);
        device.destroy_image(image);
        assert_eq!(device.live_total(), 0);
        assert_eq!(device.stats().invalid_destroys, 1);
    }

    #[test]
    fn test_swapchain_rotation_and_out_of_date() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let semaphore = device.create_semaphore().unwrap();

        let indices: Vec<u32> = (0..4).map(|_| device.acquire_next_image(semaphore).unwrap()).collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);
        // Nothing waited between the acquires
        assert_eq!(device.hazards().semaphore_resignals, 3);

        device.mark_swapchain_out_of_date();
        assert_eq!(device.acquire_next_image(semaphore), Err(vk::Result::ERROR_OUT_OF_DATE_KHR));

        device.recreate_swapchain(vk::Extent2D { width: 800, height: 600 }).unwrap();
        assert_eq!(device.acquire_next_image(semaphore), Ok(0));
        assert_eq!(device.swapchain_extent(), vk::Extent2D { width: 800, height: 600 });
    }

    /// A semaphore is reusable for acquire only after a submission waited on it
    #[test]
    fn test_acquire_into_signaled_semaphore_is_a_hazard() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let acquired = device.create_semaphore().unwrap();
        let rendered = device.create_semaphore().unwrap();
        let fence = device.create_fence(false).unwrap();
        let commands = CommandStream::new();

        let image = device.acquire_next_image(acquired).unwrap();
        device
            .submit(&Submission {
                commands: &commands,
                wait: Some((acquired, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)),
                signal: Some(rendered),
                fence,
            })
            .unwrap();
        device.present(image, rendered).unwrap();
        device.acquire_next_image(acquired).unwrap();
        assert_eq!(device.hazards().total(), 0);

        device.acquire_next_image(acquired).unwrap();
        assert_eq!(device.hazards().semaphore_resignals, 1);
    }
}
