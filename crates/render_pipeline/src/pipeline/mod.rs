//! # Render Pipeline
//!
//! Orchestrates the ordered subpasses of one frame and everything shared
//! between frames: the device, memory pools, the attachment registry, meshes,
//! the descriptor pool and the retire queue.
//!
//! ## Frame Loop
//!
//! ```text
//! begin_frame  wait slot fence -> collect retired -> relink -> acquire
//! draw         each subpass records a segment; segments are merged
//! end_frame    flush arena -> blit to swapchain -> submit -> present
//! ```
//!
//! `begin_frame` is the only blocking call. A fence timeout poisons the
//! pipeline: every later call fails with [`RenderError::DeviceLost`].
//! Resources released while frames are in flight go through the retire queue
//! and are destroyed once every frame that could reference them has completed.

pub mod frame;
mod pipeline_tests;

pub use frame::{FrameArena, FrameSlot};

use ash::vk;
use bytemuck::Pod;

use crate::command::{Command, CommandStream};
use crate::config::{Config, PipelineConfig};
use crate::device::{GpuDevice, MemoryLocation, Submission};
use crate::error::{RenderError, RenderResult};
use crate::memory::{AllocatorStats, MemoryPools};
use crate::resource::{
    Attachment, AttachmentRegistry, AttachmentUsage, LinkSources, Mesh, MeshKey, MeshRegistry, RetireQueue, Retired,
};
use crate::scene::SceneContext;
use crate::subpass::{
    self, BuildContext, DebugSubpass, FrameContext, GeometrySubpass, OffscreenSubpass, ShaderLibrary, Subpass,
    SubpassKind, SubpassProgram, TargetSettings, UiSubpass,
};

/// The frame started by [`RenderPipeline::begin_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frame number, counting submitted frames
    pub frame: u64,
    /// Frame slot in use
    pub slot: usize,
    /// Acquired swapchain image
    pub image_index: u32,
    /// Swapchain extent
    pub extent: vk::Extent2D,
}

#[derive(Debug, Clone, Copy)]
struct ActiveFrame {
    info: FrameInfo,
    drawn: bool,
}

/// Pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames handed to the queue
    pub frames_submitted: u64,
    /// Frames known complete
    pub frames_completed: u64,
    /// Draw calls of the last drawn frame
    pub draw_calls: usize,
    /// Render passes of the last drawn frame
    pub render_passes: usize,
    /// Live meshes
    pub meshes: usize,
    /// Resources waiting in the retire queue
    pub retired_pending: usize,
    /// Current attachment generation
    pub attachment_generation: u64,
    /// Largest transient arena use of any slot
    pub arena_high_water: u64,
    /// Device-local pool
    pub device_local: AllocatorStats,
    /// Host-visible pool
    pub host_visible: AllocatorStats,
}

/// Assembles a pipeline from subpass programs in order
pub struct RenderPipelineBuilder<D: GpuDevice> {
    device: D,
    config: PipelineConfig,
    programs: Vec<Box<dyn SubpassProgram>>,
}

impl<D: GpuDevice> RenderPipelineBuilder<D> {
    /// Start a pipeline on `device`
    pub fn new(device: D, config: PipelineConfig) -> Self {
        Self {
            device,
            config,
            programs: Vec::new(),
        }
    }

    /// Append a subpass; order is fixed once built
    #[must_use]
    pub fn with_subpass(mut self, program: impl SubpassProgram + 'static) -> Self {
        self.programs.push(Box::new(program));
        self
    }

    /// Validate the chain and create every device object
    ///
    /// On failure everything created so far is destroyed.
    pub fn build(self) -> RenderResult<RenderPipeline<D>> {
        let Self {
            device,
            config,
            programs,
        } = self;

        config.validate()?;
        if programs.is_empty() {
            return Err(RenderError::invalid_state("a render pipeline needs at least one subpass"));
        }
        if let Some(position) = programs.iter().position(|program| program.kind() == SubpassKind::Ui) {
            if position + 1 != programs.len() {
                return Err(RenderError::invalid_state("the UI subpass must be last"));
            }
        }

        let settings = TargetSettings::from_config(&config);
        if !device.limits().max_color_samples.contains(settings.samples) {
            return Err(RenderError::InvalidState(format!(
                "device does not support {} color samples",
                config.sample_count
            )));
        }

        let subpasses = programs
            .into_iter()
            .map(|program| Subpass::new(program, &settings))
            .collect();

        let mut pipeline = RenderPipeline {
            pools: MemoryPools::new(&config.memory),
            extent: config.extent.to_vk(),
            device,
            config,
            registry: AttachmentRegistry::new(),
            subpasses,
            slots: Vec::new(),
            meshes: MeshRegistry::with_key(),
            retire: RetireQueue::new(),
            descriptor_pool: vk::DescriptorPool::null(),
            sampler: vk::Sampler::null(),
            present_source: String::new(),
            stream: CommandStream::new(),
            frames_submitted: 0,
            frames_completed: 0,
            active: None,
            swapchain_stale: false,
            poisoned: None,
            destroyed: false,
            last_draw_calls: 0,
            last_render_passes: 0,
        };
        pipeline.initialize()?;
        Ok(pipeline)
    }
}

/// Ordered subpasses with frames in flight
pub struct RenderPipeline<D: GpuDevice> {
    device: D,
    config: PipelineConfig,
    pools: MemoryPools,
    registry: AttachmentRegistry,
    subpasses: Vec<Subpass>,
    slots: Vec<FrameSlot>,
    meshes: MeshRegistry,
    retire: RetireQueue,
    descriptor_pool: vk::DescriptorPool,
    sampler: vk::Sampler,
    present_source: String,
    stream: CommandStream,
    frames_submitted: u64,
    frames_completed: u64,
    active: Option<ActiveFrame>,
    extent: vk::Extent2D,
    swapchain_stale: bool,
    poisoned: Option<String>,
    destroyed: bool,
    last_draw_calls: usize,
    last_render_passes: usize,
}

impl<D: GpuDevice> RenderPipeline<D> {
    /// Offscreen, Geometry, then Debug and UI when enabled in `config`
    pub fn standard(device: D, config: PipelineConfig, shaders: ShaderLibrary) -> RenderResult<Self> {
        let debug = DebugSubpass::new(shaders.debug_wireframe, shaders.debug_lines, config.debug.overlay())
            .with_wireframe_color(config.debug.wireframe_color);
        let (enable_debug, enable_ui) = (config.enable_debug, config.enable_ui);

        let mut builder = RenderPipelineBuilder::new(device, config)
            .with_subpass(OffscreenSubpass::new(shaders.offscreen))
            .with_subpass(GeometrySubpass::new(shaders.geometry));
        if enable_debug {
            builder = builder.with_subpass(debug);
        }
        if enable_ui {
            builder = builder.with_subpass(UiSubpass::new(shaders.ui));
        }
        builder.build()
    }

    fn initialize(&mut self) -> RenderResult<()> {
        if self.device.swapchain_extent() != self.extent {
            self.device.recreate_swapchain(self.extent)?;
        }

        for subpass in &self.subpasses {
            for spec in &subpass.decl().outputs {
                self.registry.declare(spec.clone())?;
            }
        }
        self.registry.create_generation(&mut self.device, self.extent)?;
        self.present_source = present_source(&self.subpasses, &self.registry)?;

        let slots = self.config.frames_in_flight;
        let (max_sets, pool_sizes) = subpass::descriptor_demand(&self.subpasses, slots as u32);
        self.descriptor_pool = self.device.create_descriptor_pool(max_sets.max(1), &pool_sizes)?;
        if subpass::samples_attachments(&self.subpasses) {
            self.sampler = self
                .device
                .create_sampler(vk::Filter::NEAREST, vk::SamplerAddressMode::CLAMP_TO_EDGE)?;
        }

        let mut available: Vec<String> = Vec::new();
        for subpass in &mut self.subpasses {
            subpass.build(
                &mut self.device,
                BuildContext {
                    registry: &self.registry,
                    pool: self.descriptor_pool,
                    slots,
                    available: &available,
                },
            )?;
            available = subpass.decl().exports();
        }

        for _ in 0..slots {
            let slot = FrameSlot::new(&mut self.device, &mut self.pools, self.config.memory.transient_bytes_per_frame)?;
            self.slots.push(slot);
        }

        log::info!(
            "Render pipeline '{}' ready: {} subpasses, {} frames in flight, {}x{}",
            self.config.application_name,
            self.subpasses.len(),
            slots,
            self.extent.width,
            self.extent.height
        );
        Ok(())
    }

    /// Wait for the next slot, acquire an image and start recording
    pub fn begin_frame(&mut self) -> RenderResult<FrameInfo> {
        self.check_usable()?;
        if self.active.is_some() {
            return Err(RenderError::invalid_state("begin_frame called while a frame is recording"));
        }
        if self.swapchain_stale {
            return Err(RenderError::SwapchainOutOfDate);
        }

        let frame = self.frames_submitted;
        let slot = (frame % self.slots.len() as u64) as usize;
        let fence = self.slots[slot].fence;
        if let Err(e) = self.device.wait_for_fence(fence, self.config.fence_timeout()) {
            log::error!("Frame {} slot {} fence wait failed: {:?}", frame, slot, e);
            return Err(self.poison_if_fatal(e.into()));
        }

        self.collect_completed()?;

        let sources = LinkSources {
            arena: self.slots[slot].arena.buffer(),
            registry: &self.registry,
            sampler: self.sampler,
        };
        for subpass in &mut self.subpasses {
            subpass.relink(&mut self.device, slot, sources)?;
        }
        self.slots[slot].arena.reset();

        let image_index = match self.device.acquire_next_image(self.slots[slot].image_available) {
            Ok(index) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date during acquire");
                self.swapchain_stale = true;
                return Err(RenderError::SwapchainOutOfDate);
            }
            Err(e) => return Err(self.poison_if_fatal(e.into())),
        };

        for subpass in &mut self.subpasses {
            if let Err(e) = subpass.begin_recording() {
                return Err(self.abandon_frame(slot, e));
            }
        }

        let info = FrameInfo {
            frame,
            slot,
            image_index,
            extent: self.extent,
        };
        self.active = Some(ActiveFrame { info, drawn: false });
        log::trace!("Frame {} started on slot {} with image {}", frame, slot, image_index);
        Ok(info)
    }

    /// Record every subpass for `scene`
    pub fn draw(&mut self, scene: &SceneContext) -> RenderResult<()> {
        self.check_usable()?;
        let slot = match self.active {
            Some(ActiveFrame { drawn: false, info }) => info.slot,
            Some(_) => return Err(RenderError::invalid_state("frame already drawn")),
            None => return Err(RenderError::invalid_state("draw called outside begin_frame/end_frame")),
        };

        let marker = self.slots[slot].arena.marker();
        self.stream.clear();

        let mut segments = Vec::with_capacity(self.subpasses.len());
        let mut failure = None;
        for subpass in &self.subpasses {
            let mut segment = CommandStream::new();
            let mut ctx = FrameContext {
                device: &mut self.device,
                arena: &mut self.slots[slot].arena,
                stream: &mut segment,
                scene,
                meshes: &self.meshes,
                slot,
            };
            if let Err(e) = subpass.draw(&mut ctx) {
                log::error!("Subpass '{}' failed to record: {}", subpass.name(), e);
                failure = Some(e);
                break;
            }
            segments.push(segment);
        }

        if let Some(e) = failure {
            self.slots[slot].arena.reset_to(marker)?;
            return Err(e);
        }

        for mut segment in segments {
            self.stream.append(&mut segment);
        }
        self.last_draw_calls = self.stream.draw_count();
        self.last_render_passes = self.stream.render_pass_count();
        if let Some(active) = self.active.as_mut() {
            active.drawn = true;
        }
        Ok(())
    }

    /// Submit the recorded frame and present it
    pub fn end_frame(&mut self) -> RenderResult<()> {
        self.check_usable()?;
        let info = match self.active {
            Some(ActiveFrame { drawn: true, info }) => info,
            Some(_) => return Err(RenderError::invalid_state("end_frame called before draw")),
            None => return Err(RenderError::invalid_state("end_frame called without begin_frame")),
        };
        let FrameInfo {
            frame,
            slot,
            image_index,
            ..
        } = info;

        let (source, source_extent) = match self.registry.get(&self.present_source) {
            Some(attachment) => (attachment.image(), attachment.extent()),
            None => {
                let error = RenderError::InvalidState(format!("present source '{}' is not live", self.present_source));
                return Err(self.abandon_frame(slot, error));
            }
        };
        self.stream.push(Command::BlitToSwapchain {
            source,
            extent: source_extent,
            image_index,
        });

        if let Err(e) = self.slots[slot].arena.flush(&mut self.device) {
            return Err(self.abandon_frame(slot, e));
        }

        let FrameSlot {
            fence,
            image_available,
            render_finished,
            ..
        } = self.slots[slot];
        if let Err(e) = self.device.reset_fence(fence) {
            return Err(self.abandon_frame(slot, e.into()));
        }

        let submitted = self.device.submit(&Submission {
            commands: &self.stream,
            wait: Some((image_available, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)),
            signal: Some(render_finished),
            fence,
        });
        if let Err(e) = submitted {
            // The slot fence is reset and will never signal
            let error = self.abandon_frame(slot, e.into());
            self.poisoned
                .get_or_insert_with(|| format!("frame {frame} failed to submit: {error}"));
            return Err(error);
        }

        self.slots[slot].submitted_frame = Some(frame);
        self.frames_submitted += 1;
        self.active = None;
        for subpass in &mut self.subpasses {
            subpass.mark_submitted()?;
        }

        match self.device.present(image_index, render_finished) {
            Ok(()) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR) => {
                log::warn!("Swapchain out of date during present");
                self.swapchain_stale = true;
                Err(RenderError::SwapchainOutOfDate)
            }
            Err(e) => Err(self.poison_if_fatal(e.into())),
        }
    }

    /// Rebuild swapchain-sized attachments for a new window size
    ///
    /// Zero extents (minimized windows) are ignored, as is the current extent
    /// unless the swapchain was reported out of date.
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.check_usable()?;
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize to {}x{}", width, height);
            return Ok(());
        }
        if self.active.is_some() {
            return Err(RenderError::invalid_state("cannot resize while a frame is recording"));
        }

        let extent = vk::Extent2D { width, height };
        if extent == self.extent && !self.swapchain_stale {
            return Ok(());
        }

        log::info!(
            "Resizing render pipeline from {}x{} to {}x{}",
            self.extent.width,
            self.extent.height,
            width,
            height
        );
        if let Err(e) = self.device.recreate_swapchain(extent) {
            return Err(self.poison_if_fatal(e.into()));
        }
        self.swapchain_stale = false;
        self.extent = extent;

        let tag = self.retire_tag();
        match self.registry.advance_generation(&mut self.device, extent) {
            Ok(replaced) => {
                for attachment in replaced {
                    self.retire.retire(tag, Retired::Attachment(attachment));
                }
            }
            Err(e) => return Err(self.poison(e)),
        }

        for subpass in &mut self.subpasses {
            match subpass.rebuild_framebuffer(&mut self.device, &self.registry) {
                Ok(Some(old)) => self.retire.retire(tag, Retired::Framebuffer(old)),
                Ok(None) => {}
                Err(e) => {
                    let error = RenderError::InvalidState(format!(
                        "subpass '{}' lost its framebuffer during resize: {e}",
                        subpass.name()
                    ));
                    log::error!("{}", error);
                    self.poisoned = Some(error.to_string());
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Upload a mesh into device-local memory
    ///
    /// Runs out of memory at most once: retired resources are collected and
    /// the upload retried before the error surfaces.
    pub fn create_mesh<V: Pod>(&mut self, vertices: &[V], indices: &[u32]) -> RenderResult<MeshKey> {
        self.check_usable()?;
        let timeout = self.config.fence_timeout();

        let uploaded = match Mesh::upload(&mut self.device, &mut self.pools, vertices, indices, timeout) {
            Err(RenderError::OutOfMemory { requested, .. }) => {
                log::warn!("Mesh upload of {} bytes ran out of memory; collecting retired resources", requested);
                self.collect_completed()?;
                Mesh::upload(&mut self.device, &mut self.pools, vertices, indices, timeout)
            }
            other => other,
        };
        let (mesh, staging) = match uploaded {
            Ok(uploaded) => uploaded,
            Err(e) => return Err(self.poison_if_fatal(e)),
        };

        self.retire.retire(self.retire_tag(), Retired::Buffer(staging));
        let key = self.meshes.insert(mesh);
        log::debug!("Created mesh {:?}", key);
        Ok(key)
    }

    /// Release a mesh once in-flight frames stop using it
    pub fn destroy_mesh(&mut self, key: MeshKey) -> RenderResult<()> {
        let mesh = self
            .meshes
            .remove(key)
            .ok_or_else(|| RenderError::InvalidState(format!("unknown mesh {key:?}")))?;
        let tag = self.retire_tag();
        for buffer in mesh.into_buffers() {
            self.retire.retire(tag, Retired::Buffer(buffer));
        }
        Ok(())
    }

    /// Destroy completed retirements, then release empty memory blocks
    ///
    /// Returns the number of blocks freed. The first block of each pool is
    /// kept.
    pub fn trim_memory(&mut self) -> RenderResult<usize> {
        self.check_usable()?;
        self.collect_completed()?;
        let freed = self.pools.trim(&mut self.device);
        if freed > 0 {
            log::debug!("Trimmed {} empty memory blocks", freed);
        }
        Ok(freed)
    }

    /// Live attachment by name, for inspection
    #[must_use]
    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        self.registry.get(name)
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_submitted: self.frames_submitted,
            frames_completed: self.frames_completed,
            draw_calls: self.last_draw_calls,
            render_passes: self.last_render_passes,
            meshes: self.meshes.len(),
            retired_pending: self.retire.len(),
            attachment_generation: self.registry.generation(),
            arena_high_water: self
                .slots
                .iter()
                .map(|slot| slot.arena.high_water())
                .max()
                .unwrap_or(0),
            device_local: self.pools.get(MemoryLocation::DeviceLocal).stats(),
            host_visible: self.pools.get(MemoryLocation::HostVisible).stats(),
        }
    }

    /// Block until the device is idle and destroy every retired resource
    pub fn wait_idle(&mut self) -> RenderResult<()> {
        if let Err(e) = self.device.wait_idle() {
            return Err(self.poison_if_fatal(e.into()));
        }
        self.frames_completed = self.frames_submitted;
        self.retire.collect(self.frames_completed, &mut self.device, &mut self.pools);
        Ok(())
    }

    /// Destroy every device object the pipeline created
    ///
    /// Safe to call more than once; `Drop` calls it too. Teardown proceeds
    /// even when the device cannot go idle, and that error is returned.
    pub fn destroy(&mut self) -> RenderResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.active = None;

        let idle = self.device.wait_idle().map_err(RenderError::from);
        if let Err(e) = &idle {
            log::error!("Tearing down render pipeline without an idle device: {}", e);
        }

        let retired = self.retire.drain_all(&mut self.device, &mut self.pools);
        for (_, mesh) in self.meshes.drain() {
            for buffer in mesh.into_buffers() {
                buffer.destroy(&mut self.device, &mut self.pools);
            }
        }
        for subpass in &mut self.subpasses {
            subpass.destroy(&mut self.device);
        }
        if self.descriptor_pool != vk::DescriptorPool::null() {
            self.device.destroy_descriptor_pool(self.descriptor_pool);
            self.descriptor_pool = vk::DescriptorPool::null();
        }
        if self.sampler != vk::Sampler::null() {
            self.device.destroy_sampler(self.sampler);
            self.sampler = vk::Sampler::null();
        }
        self.registry.destroy(&mut self.device);
        for slot in self.slots.drain(..) {
            slot.destroy(&mut self.device, &mut self.pools);
        }
        self.pools.destroy(&mut self.device);

        log::info!("Render pipeline destroyed ({} retired resources released)", retired);
        idle
    }

    /// Subpasses in recording order
    #[must_use]
    pub fn subpasses(&self) -> &[Subpass] {
        &self.subpasses
    }

    /// Configuration the pipeline was built with
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Current swapchain extent
    #[must_use]
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Why the pipeline refuses frames, if it does
    #[must_use]
    pub fn poisoned(&self) -> Option<&str> {
        self.poisoned.as_deref()
    }

    /// Device
    #[must_use]
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// Device, mutably
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    fn check_usable(&self) -> RenderResult<()> {
        if self.destroyed {
            return Err(RenderError::invalid_state("render pipeline has been destroyed"));
        }
        match &self.poisoned {
            Some(reason) => Err(RenderError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    // A frame being recorded may still reference anything retired now
    fn retire_tag(&self) -> u64 {
        self.frames_submitted + u64::from(self.active.is_some())
    }

    fn collect_completed(&mut self) -> RenderResult<usize> {
        let mut completed = self.frames_submitted;
        for slot in &self.slots {
            if let Some(frame) = slot.submitted_frame {
                if !self.device.fence_signaled(slot.fence)? {
                    completed = completed.min(frame);
                }
            }
        }
        self.frames_completed = self.frames_completed.max(completed);
        Ok(self.retire.collect(self.frames_completed, &mut self.device, &mut self.pools))
    }

    /// Drop an acquired frame without submitting it
    ///
    /// The acquire left the slot's `image_available` signaled with no
    /// submission to wait on it, so the slot gets a fresh semaphore and the
    /// old one is retired.
    fn abandon_frame(&mut self, slot: usize, error: RenderError) -> RenderError {
        for subpass in &mut self.subpasses {
            subpass.cancel_recording();
        }
        self.active = None;
        self.stream.clear();

        match self.device.create_semaphore() {
            Ok(semaphore) => {
                let signaled = std::mem::replace(&mut self.slots[slot].image_available, semaphore);
                let tag = self.retire_tag();
                self.retire.retire(tag, Retired::Semaphore(signaled));
                log::debug!("Replaced image-available semaphore of slot {} after an abandoned frame", slot);
            }
            Err(e) => {
                log::error!("Slot {} cannot replace its signaled semaphore: {:?}", slot, e);
                self.poisoned
                    .get_or_insert_with(|| format!("slot {slot} lost its image-available semaphore: {error}"));
            }
        }
        self.poison_if_fatal(error)
    }

    fn poison_if_fatal(&mut self, error: RenderError) -> RenderError {
        if error.is_fatal() {
            self.poison(error)
        } else {
            error
        }
    }

    fn poison(&mut self, error: RenderError) -> RenderError {
        log::error!("Render pipeline stopped: {}", error);
        self.poisoned = Some(error.to_string());
        error
    }
}

impl<D: GpuDevice> Drop for RenderPipeline<D> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            log::error!("Render pipeline teardown failed: {}", e);
        }
    }
}

/// First color export of the last subpass, blitted to the swapchain
fn present_source(subpasses: &[Subpass], registry: &AttachmentRegistry) -> RenderResult<String> {
    let last = subpasses
        .last()
        .ok_or_else(|| RenderError::invalid_state("a render pipeline needs at least one subpass"))?;
    last.decl()
        .exports()
        .into_iter()
        .find(|name| {
            registry
                .get(name)
                .is_some_and(|attachment| matches!(attachment.usage(), AttachmentUsage::Color | AttachmentUsage::Resolve))
        })
        .ok_or_else(|| RenderError::InvalidState(format!("subpass '{}' exports no color attachment to present", last.name())))
}
