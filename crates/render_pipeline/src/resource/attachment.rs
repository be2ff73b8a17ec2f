//! Render targets
//!
//! Subpasses declare their outputs as [`AttachmentSpec`]s. The
//! [`AttachmentRegistry`] expands them through the [`Multisampler`] and owns
//! exactly one generation of live images. Each subpass renders through an
//! [`AttachmentSet`]: its render pass and a framebuffer over the current
//! generation.

use ash::vk;

use crate::command::ClearValue;
use crate::device::{GpuDevice, ImageAllocation, ImageDesc, RenderPassDesc};
use crate::error::{RenderError, RenderResult};

/// Role of an attachment image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentUsage {
    /// Single-sample color, sampled by later passes
    Color,
    /// Depth (and stencil)
    Depth,
    /// Single-sample target a multisampled color attachment resolves into
    Resolve,
    /// Multisampled color, only read by the resolve
    MultisampledColor,
}

impl AttachmentUsage {
    const fn image_usage(self) -> vk::ImageUsageFlags {
        match self {
            Self::Color | Self::Resolve => vk::ImageUsageFlags::from_raw(
                vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw()
                    | vk::ImageUsageFlags::SAMPLED.as_raw()
                    | vk::ImageUsageFlags::TRANSFER_SRC.as_raw(),
            ),
            Self::MultisampledColor => vk::ImageUsageFlags::from_raw(
                vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT.as_raw(),
            ),
            Self::Depth => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        }
    }

    /// Layout the attachment is left in at the end of a render pass
    #[must_use]
    pub const fn final_layout(self) -> vk::ImageLayout {
        match self {
            Self::Color | Self::Resolve => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::MultisampledColor => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::Depth => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }

    const fn store_op(self) -> vk::AttachmentStoreOp {
        match self {
            Self::Color | Self::Resolve => vk::AttachmentStoreOp::STORE,
            Self::MultisampledColor | Self::Depth => vk::AttachmentStoreOp::DONT_CARE,
        }
    }
}

/// Whether `format` has a depth component
#[must_use]
pub const fn has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Whether `format` has a stencil component
#[must_use]
pub const fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// View aspect for `format`
#[must_use]
pub const fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
    match (has_depth(format), has_stencil(format)) {
        (true, true) => vk::ImageAspectFlags::from_raw(
            vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw(),
        ),
        (true, false) => vk::ImageAspectFlags::DEPTH,
        (false, true) => vk::ImageAspectFlags::STENCIL,
        (false, false) => vk::ImageAspectFlags::COLOR,
    }
}

/// How an attachment is sized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentPolicy {
    /// Follows the swapchain through resizes
    Swapchain,
    /// Fixed size, e.g. a square offscreen G-buffer
    Fixed(vk::Extent2D),
}

impl ExtentPolicy {
    /// Concrete extent for a given swapchain extent
    #[must_use]
    pub const fn resolve(self, swapchain: vk::Extent2D) -> vk::Extent2D {
        match self {
            Self::Swapchain => swapchain,
            Self::Fixed(extent) => extent,
        }
    }
}

/// Color or depth output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// Color output
    Color,
    /// Depth output
    Depth,
}

/// Output declared by a subpass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentSpec {
    /// Name later subpasses refer to
    pub name: String,
    /// Pixel format
    pub format: vk::Format,
    /// Color or depth
    pub kind: AttachmentKind,
    /// Samples per pixel
    pub samples: vk::SampleCountFlags,
    /// Sizing policy
    pub extent: ExtentPolicy,
}

impl AttachmentSpec {
    /// Single-sample color output
    pub fn color(name: impl Into<String>, format: vk::Format, extent: ExtentPolicy) -> Self {
        Self {
            name: name.into(),
            format,
            kind: AttachmentKind::Color,
            samples: vk::SampleCountFlags::TYPE_1,
            extent,
        }
    }

    /// Single-sample depth output
    pub fn depth(name: impl Into<String>, format: vk::Format, extent: ExtentPolicy) -> Self {
        Self {
            kind: AttachmentKind::Depth,
            ..Self::color(name, format, extent)
        }
    }

    /// Same output with `samples` per pixel
    #[must_use]
    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }
}

/// Name of the multisampled image behind a resolved color attachment
#[must_use]
pub fn multisampled_name(name: &str) -> String {
    format!("{name}.msaa")
}

/// Image the registry creates for one declared output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentTarget {
    /// Registry name
    pub name: String,
    /// Role
    pub usage: AttachmentUsage,
    /// Samples per pixel
    pub samples: vk::SampleCountFlags,
}

/// Expands multisampled color outputs into a multisampled image and a
/// single-sample resolve target carrying the public name
#[derive(Debug, Clone, Copy, Default)]
pub struct Multisampler;

impl Multisampler {
    /// Images backing `spec`
    #[must_use]
    pub fn targets(spec: &AttachmentSpec) -> Vec<AttachmentTarget> {
        let multisampled = spec.samples != vk::SampleCountFlags::TYPE_1;
        match spec.kind {
            AttachmentKind::Color if multisampled => vec![
                AttachmentTarget {
                    name: multisampled_name(&spec.name),
                    usage: AttachmentUsage::MultisampledColor,
                    samples: spec.samples,
                },
                AttachmentTarget {
                    name: spec.name.clone(),
                    usage: AttachmentUsage::Resolve,
                    samples: vk::SampleCountFlags::TYPE_1,
                },
            ],
            AttachmentKind::Color => vec![AttachmentTarget {
                name: spec.name.clone(),
                usage: AttachmentUsage::Color,
                samples: spec.samples,
            }],
            AttachmentKind::Depth => vec![AttachmentTarget {
                name: spec.name.clone(),
                usage: AttachmentUsage::Depth,
                samples: spec.samples,
            }],
        }
    }
}

/// A live render target image
#[derive(Debug)]
pub struct Attachment {
    name: String,
    image: ImageAllocation,
    format: vk::Format,
    samples: vk::SampleCountFlags,
    usage: AttachmentUsage,
    extent: vk::Extent2D,
    generation: u64,
}

impl Attachment {
    /// Create the image, view and memory for one target
    pub fn new(
        device: &mut dyn GpuDevice,
        target: &AttachmentTarget,
        format: vk::Format,
        extent: vk::Extent2D,
        generation: u64,
    ) -> RenderResult<Self> {
        let image = device.create_image(&ImageDesc {
            extent,
            format,
            samples: target.samples,
            usage: target.usage.image_usage(),
            aspect: aspect_for(format),
        })?;

        log::debug!(
            "Created attachment '{}' {}x{} {:?} ({:?}, generation {})",
            target.name,
            extent.width,
            extent.height,
            format,
            target.usage,
            generation
        );

        Ok(Self {
            name: target.name.clone(),
            image,
            format,
            samples: target.samples,
            usage: target.usage,
            extent,
            generation,
        })
    }

    /// Render pass description for this attachment
    ///
    /// Loaded attachments start in their final layout from the previous
    /// pass; cleared ones start undefined.
    #[must_use]
    pub fn description(&self, load_op: vk::AttachmentLoadOp) -> vk::AttachmentDescription {
        let initial_layout = if load_op == vk::AttachmentLoadOp::LOAD {
            self.usage.final_layout()
        } else {
            vk::ImageLayout::UNDEFINED
        };

        vk::AttachmentDescription {
            format: self.format,
            samples: self.samples,
            load_op,
            store_op: self.usage.store_op(),
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout,
            final_layout: self.usage.final_layout(),
            ..Default::default()
        }
    }

    /// Destroy the image, view and memory
    pub fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_image(self.image);
        log::trace!("Destroyed attachment '{}' (generation {})", self.name, self.generation);
    }

    /// Registry name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image handle
    #[must_use]
    pub const fn image(&self) -> vk::Image {
        self.image.image
    }

    /// Full-image view
    #[must_use]
    pub const fn view(&self) -> vk::ImageView {
        self.image.view
    }

    /// Pixel format
    #[must_use]
    pub const fn format(&self) -> vk::Format {
        self.format
    }

    /// Samples per pixel
    #[must_use]
    pub const fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    /// Role
    #[must_use]
    pub const fn usage(&self) -> AttachmentUsage {
        self.usage
    }

    /// Extent in pixels
    #[must_use]
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Generation the attachment belongs to
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

/// Declared outputs and the one live generation of their images
#[derive(Debug, Default)]
pub struct AttachmentRegistry {
    specs: Vec<AttachmentSpec>,
    attachments: Vec<Attachment>,
    generation: u64,
}

impl AttachmentRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an output; names are unique
    pub fn declare(&mut self, spec: AttachmentSpec) -> RenderResult<()> {
        if self.specs.iter().any(|declared| declared.name == spec.name) {
            return Err(RenderError::InvalidState(format!(
                "attachment '{}' is declared twice",
                spec.name
            )));
        }
        self.specs.push(spec);
        Ok(())
    }

    /// Create images for every declared output at `swapchain` extent
    ///
    /// The previous generation must have been taken first.
    pub fn create_generation(&mut self, device: &mut dyn GpuDevice, swapchain: vk::Extent2D) -> RenderResult<()> {
        if !self.attachments.is_empty() {
            return Err(RenderError::invalid_state("previous attachment generation is still live"));
        }

        let generation = self.generation + 1;
        let mut created = Vec::new();
        for spec in &self.specs {
            let extent = spec.extent.resolve(swapchain);
            for target in Multisampler::targets(spec) {
                match Attachment::new(device, &target, spec.format, extent, generation) {
                    Ok(attachment) => created.push(attachment),
                    Err(e) => {
                        for attachment in created {
                            attachment.destroy(device);
                        }
                        return Err(e);
                    }
                }
            }
        }

        self.attachments = created;
        self.generation = generation;
        log::debug!(
            "Attachment generation {} created with {} images",
            generation,
            self.attachments.len()
        );
        Ok(())
    }

    /// Move to the next generation at `swapchain` extent
    ///
    /// Attachments whose resolved extent is unchanged, such as fixed-size
    /// offscreen targets, are carried into the new generation. The replaced
    /// ones are returned for retirement. On failure the current generation
    /// stays live and nothing is returned.
    pub fn advance_generation(&mut self, device: &mut dyn GpuDevice, swapchain: vk::Extent2D) -> RenderResult<Vec<Attachment>> {
        let generation = self.generation + 1;
        let mut previous = std::mem::take(&mut self.attachments);
        let mut next: Vec<(Attachment, bool)> = Vec::with_capacity(previous.len());
        let mut failure = None;

        'specs: for spec in &self.specs {
            let extent = spec.extent.resolve(swapchain);
            for target in Multisampler::targets(spec) {
                let unchanged = previous
                    .iter()
                    .position(|attachment| attachment.name == target.name && attachment.extent == extent);
                if let Some(index) = unchanged {
                    let mut attachment = previous.swap_remove(index);
                    attachment.generation = generation;
                    next.push((attachment, true));
                    continue;
                }
                match Attachment::new(device, &target, spec.format, extent, generation) {
                    Ok(attachment) => next.push((attachment, false)),
                    Err(e) => {
                        failure = Some(e);
                        break 'specs;
                    }
                }
            }
        }

        if let Some(e) = failure {
            for (mut attachment, carried) in next {
                if carried {
                    attachment.generation = self.generation;
                    previous.push(attachment);
                } else {
                    attachment.destroy(device);
                }
            }
            self.attachments = previous;
            return Err(e);
        }

        let carried = next.iter().filter(|(_, carried)| *carried).count();
        self.attachments = next.into_iter().map(|(attachment, _)| attachment).collect();
        self.generation = generation;
        log::debug!(
            "Attachment generation {}: {} images carried over, {} replaced",
            generation,
            carried,
            previous.len()
        );
        Ok(previous)
    }

    /// Remove the live generation so it can be retired
    pub fn take_generation(&mut self) -> Vec<Attachment> {
        std::mem::take(&mut self.attachments)
    }

    /// Live attachment by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|attachment| attachment.name == name)
    }

    /// Whether `name` was declared
    #[must_use]
    pub fn is_declared(&self, name: &str) -> bool {
        self.specs.iter().any(|spec| spec.name == name)
    }

    /// Current generation number; 0 before the first one
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Live attachments
    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Destroy the live generation immediately
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        for attachment in self.take_generation() {
            attachment.destroy(device);
        }
    }
}

/// One attachment of a subpass framebuffer
#[derive(Debug, Clone, PartialEq)]
pub struct PassTarget {
    /// Registry name of the public attachment
    pub name: String,
    /// Color or depth
    pub kind: AttachmentKind,
    /// `Some` clears to this value, `None` loads the previous contents
    pub clear: Option<ClearValue>,
}

impl PassTarget {
    /// Cleared color target
    pub fn clear_color(name: impl Into<String>, color: [f32; 4]) -> Self {
        Self {
            name: name.into(),
            kind: AttachmentKind::Color,
            clear: Some(ClearValue::Color(color)),
        }
    }

    /// Cleared depth target
    pub fn clear_depth(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AttachmentKind::Depth,
            clear: Some(ClearValue::DepthStencil { depth: 1.0, stencil: 0 }),
        }
    }

    /// Color target drawn over without clearing
    pub fn overlay(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AttachmentKind::Color,
            clear: None,
        }
    }
}

/// Render pass and framebuffer of one subpass
#[derive(Debug)]
pub struct AttachmentSet {
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    // Registry names in framebuffer order
    views: Vec<String>,
    clear_values: Vec<ClearValue>,
    extent: vk::Extent2D,
    samples: vk::SampleCountFlags,
    color_count: u32,
}

impl AttachmentSet {
    /// Create the render pass and framebuffer for `targets`
    ///
    /// A cleared color target with a multisampled image renders into that
    /// image and resolves into the public one. Overlays always draw into the
    /// public single-sample image.
    pub fn new(device: &mut dyn GpuDevice, registry: &AttachmentRegistry, targets: &[PassTarget]) -> RenderResult<Self> {
        let mut colors = Vec::new();
        let mut resolves = Vec::new();
        let mut depth = None;

        for target in targets {
            let load_op = if target.clear.is_some() {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            };
            let clear = target.clear.unwrap_or(ClearValue::None);
            let public = lookup(registry, &target.name)?;

            match target.kind {
                AttachmentKind::Depth => depth = Some((public, load_op, clear)),
                AttachmentKind::Color => {
                    let multisampled = target
                        .clear
                        .and_then(|_| registry.get(&multisampled_name(&target.name)));
                    match multisampled {
                        Some(image) => {
                            colors.push((image, load_op, clear));
                            resolves.push(public);
                        }
                        None => colors.push((public, load_op, clear)),
                    }
                }
            }
        }

        if !resolves.is_empty() && resolves.len() != colors.len() {
            return Err(RenderError::invalid_state(
                "a subpass cannot mix resolved and single-sample color targets",
            ));
        }

        let mut desc = RenderPassDesc::default();
        let mut views = Vec::new();
        let mut clear_values = Vec::new();
        let mut extents = Vec::new();

        for (attachment, load_op, clear) in &colors {
            desc.color.push(views.len() as u32);
            desc.attachments.push(attachment.description(*load_op));
            views.push(attachment.name().to_string());
            clear_values.push(*clear);
            extents.push(attachment.extent());
        }
        for attachment in &resolves {
            desc.resolve.push(views.len() as u32);
            desc.attachments.push(attachment.description(vk::AttachmentLoadOp::DONT_CARE));
            views.push(attachment.name().to_string());
            clear_values.push(ClearValue::None);
            extents.push(attachment.extent());
        }
        if let Some((attachment, load_op, clear)) = depth {
            desc.depth = Some(views.len() as u32);
            desc.attachments.push(attachment.description(load_op));
            views.push(attachment.name().to_string());
            clear_values.push(clear);
            extents.push(attachment.extent());
        }

        let Some(&extent) = extents.first() else {
            return Err(RenderError::invalid_state("a subpass needs at least one attachment"));
        };
        if extents.iter().any(|other| *other != extent) {
            return Err(RenderError::invalid_state("subpass attachments differ in extent"));
        }

        let samples = colors
            .first()
            .map(|(attachment, ..)| attachment.samples())
            .or_else(|| depth.map(|(attachment, ..)| attachment.samples()))
            .unwrap_or(vk::SampleCountFlags::TYPE_1);
        let color_count = colors.len() as u32;

        let render_pass = device.create_render_pass(&desc)?;
        let mut set = Self {
            render_pass,
            framebuffer: vk::Framebuffer::null(),
            views,
            clear_values,
            extent,
            samples,
            color_count,
        };
        match set.create_framebuffer(device, registry) {
            Ok(framebuffer) => set.framebuffer = framebuffer,
            Err(e) => {
                device.destroy_render_pass(render_pass);
                return Err(e);
            }
        }
        Ok(set)
    }

    /// Point the framebuffer at the registry's current generation
    ///
    /// Returns the previous framebuffer, which pending work may still use.
    pub fn rebuild_framebuffer(&mut self, device: &mut dyn GpuDevice, registry: &AttachmentRegistry) -> RenderResult<vk::Framebuffer> {
        let framebuffer = self.create_framebuffer(device, registry)?;
        Ok(std::mem::replace(&mut self.framebuffer, framebuffer))
    }

    fn create_framebuffer(&mut self, device: &mut dyn GpuDevice, registry: &AttachmentRegistry) -> RenderResult<vk::Framebuffer> {
        let attachments = self
            .views
            .iter()
            .map(|name| lookup(registry, name))
            .collect::<RenderResult<Vec<_>>>()?;
        let extent = attachments
            .first()
            .map_or(self.extent, |attachment| attachment.extent());
        let views: Vec<vk::ImageView> = attachments.iter().map(|attachment| attachment.view()).collect();

        let framebuffer = device.create_framebuffer(self.render_pass, &views, extent)?;
        self.extent = extent;
        Ok(framebuffer)
    }

    /// Destroy the framebuffer and render pass
    pub fn destroy(self, device: &mut dyn GpuDevice) {
        if self.framebuffer != vk::Framebuffer::null() {
            device.destroy_framebuffer(self.framebuffer);
        }
        device.destroy_render_pass(self.render_pass);
    }

    /// Render pass
    #[must_use]
    pub const fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Current framebuffer
    #[must_use]
    pub const fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    /// One clear value per framebuffer attachment
    #[must_use]
    pub fn clear_values(&self) -> &[ClearValue] {
        &self.clear_values
    }

    /// Render area
    #[must_use]
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Rasterization samples
    #[must_use]
    pub const fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    /// Number of color attachments written by shaders
    #[must_use]
    pub const fn color_count(&self) -> u32 {
        self.color_count
    }
}

fn lookup<'a>(registry: &'a AttachmentRegistry, name: &str) -> RenderResult<&'a Attachment> {
    registry
        .get(name)
        .ok_or_else(|| RenderError::InvalidState(format!("attachment '{name}' has no live image")))
}
