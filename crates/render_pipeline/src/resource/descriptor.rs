//! Descriptor binding tables
//!
//! A [`DescriptorTable`] holds one descriptor set per frame slot. Each set
//! records the attachment generation it was last written against; a set
//! whose generation is behind the registry is stale and gets rewritten the
//! next time its slot starts a frame, after the slot's fence has signaled.

use ash::vk;

use super::attachment::AttachmentRegistry;
use crate::device::{DescriptorKind, DescriptorResource, DescriptorWrite, GpuDevice, LayoutBinding};
use crate::error::{RenderError, RenderResult};

/// Resource a binding resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingTarget {
    /// Window of the frame slot's transient arena, offset per draw
    FrameArena {
        /// Bytes visible per draw
        range: u64,
    },
    /// Named attachment sampled with the pipeline sampler
    Attachment(String),
}

/// Logical slot of a subpass descriptor layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorBinding {
    /// Binding slot
    pub binding: u32,
    /// Descriptor type
    pub kind: DescriptorKind,
    /// Stages reading it
    pub stages: vk::ShaderStageFlags,
    /// What it points at
    pub target: BindingTarget,
}

impl DescriptorBinding {
    /// Dynamic uniform of `range` bytes in the frame arena
    #[must_use]
    pub const fn uniform(binding: u32, stages: vk::ShaderStageFlags, range: u64) -> Self {
        Self {
            binding,
            kind: DescriptorKind::DynamicUniform,
            stages,
            target: BindingTarget::FrameArena { range },
        }
    }

    /// Sampled attachment
    pub fn sampled(binding: u32, stages: vk::ShaderStageFlags, attachment: impl Into<String>) -> Self {
        Self {
            binding,
            kind: DescriptorKind::CombinedImageSampler,
            stages,
            target: BindingTarget::Attachment(attachment.into()),
        }
    }

    /// Layout entry
    #[must_use]
    pub const fn layout(&self) -> LayoutBinding {
        LayoutBinding {
            binding: self.binding,
            kind: self.kind,
            stages: self.stages,
        }
    }
}

/// Pool sizes needed for `bindings` replicated over `slots` sets
#[must_use]
pub fn pool_sizes(bindings: &[DescriptorBinding], slots: u32) -> Vec<vk::DescriptorPoolSize> {
    [DescriptorKind::DynamicUniform, DescriptorKind::CombinedImageSampler]
        .into_iter()
        .filter_map(|kind| {
            let count = bindings.iter().filter(|binding| binding.kind == kind).count() as u32;
            (count > 0).then(|| vk::DescriptorPoolSize {
                ty: kind.to_vk(),
                descriptor_count: count * slots,
            })
        })
        .collect()
}

/// What a table writes into its sets
#[derive(Debug, Clone, Copy)]
pub struct LinkSources<'a> {
    /// Transient arena buffer of the slot being linked
    pub arena: vk::Buffer,
    /// Live attachments
    pub registry: &'a AttachmentRegistry,
    /// Sampler for attachment bindings
    pub sampler: vk::Sampler,
}

/// Descriptor layout plus one set per frame slot
#[derive(Debug)]
pub struct DescriptorTable {
    layout: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBinding>,
    sets: Vec<vk::DescriptorSet>,
    linked: Vec<Option<u64>>,
}

impl DescriptorTable {
    /// Create the layout and allocate `slots` sets from `pool`
    pub fn new(
        device: &mut dyn GpuDevice,
        pool: vk::DescriptorPool,
        bindings: Vec<DescriptorBinding>,
        slots: usize,
    ) -> RenderResult<Self> {
        let layout_bindings: Vec<LayoutBinding> = bindings.iter().map(DescriptorBinding::layout).collect();
        let layout = device.create_descriptor_set_layout(&layout_bindings)?;

        let mut sets = Vec::with_capacity(slots);
        for _ in 0..slots {
            match device.allocate_descriptor_set(pool, layout) {
                Ok(set) => sets.push(set),
                Err(e) => {
                    // Sets go back with the pool
                    device.destroy_descriptor_set_layout(layout);
                    return Err(e.into());
                }
            }
        }

        Ok(Self {
            layout,
            bindings,
            sets,
            linked: vec![None; slots],
        })
    }

    /// Whether `slot` was written against an older generation
    #[must_use]
    pub fn is_stale(&self, slot: usize, generation: u64) -> bool {
        self.linked.get(slot).map_or(false, |linked| *linked != Some(generation))
    }

    /// Rewrite the set of `slot` if it is stale
    ///
    /// Only call once the slot's previous submission has completed.
    /// Returns whether a write happened.
    pub fn relink(&mut self, device: &mut dyn GpuDevice, slot: usize, sources: LinkSources<'_>) -> RenderResult<bool> {
        let generation = sources.registry.generation();
        if !self.is_stale(slot, generation) {
            return Ok(false);
        }

        let writes = self
            .bindings
            .iter()
            .map(|binding| {
                let resource = match &binding.target {
                    BindingTarget::FrameArena { range } => DescriptorResource::Buffer {
                        buffer: sources.arena,
                        range: *range,
                    },
                    BindingTarget::Attachment(name) => {
                        let attachment = sources.registry.get(name).ok_or_else(|| {
                            RenderError::InvalidState(format!("binding {} samples unknown attachment '{name}'", binding.binding))
                        })?;
                        DescriptorResource::Image {
                            view: attachment.view(),
                            sampler: sources.sampler,
                        }
                    }
                };
                Ok(DescriptorWrite {
                    binding: binding.binding,
                    resource,
                })
            })
            .collect::<RenderResult<Vec<_>>>()?;

        device.write_descriptor_set(self.sets[slot], &writes);
        self.linked[slot] = Some(generation);
        log::trace!("Linked descriptor set for slot {} to generation {}", slot, generation);
        Ok(true)
    }

    /// Set of `slot`
    #[must_use]
    pub fn set(&self, slot: usize) -> vk::DescriptorSet {
        self.sets[slot]
    }

    /// Set layout
    #[must_use]
    pub const fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Declared bindings
    #[must_use]
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    /// Number of dynamic offsets a bind needs
    #[must_use]
    pub fn dynamic_count(&self) -> usize {
        self.bindings
            .iter()
            .filter(|binding| binding.kind == DescriptorKind::DynamicUniform)
            .count()
    }

    /// Destroy the layout; the sets are released with their pool
    pub fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_descriptor_set_layout(self.layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HeadlessConfig, HeadlessDevice};
    use crate::resource::attachment::{AttachmentSpec, ExtentPolicy};

    fn fixture(device: &mut HeadlessDevice) -> (AttachmentRegistry, vk::DescriptorPool, DescriptorTable) {
        let mut registry = AttachmentRegistry::new();
        registry
            .declare(AttachmentSpec::color("albedo", vk::Format::R8G8B8A8_UNORM, ExtentPolicy::Swapchain))
            .unwrap();
        registry.create_generation(device, vk::Extent2D { width: 64, height: 64 }).unwrap();

        let bindings = vec![
            DescriptorBinding::uniform(0, vk::ShaderStageFlags::VERTEX, 128),
            DescriptorBinding::sampled(1, vk::ShaderStageFlags::FRAGMENT, "albedo"),
        ];
        let pool = device.create_descriptor_pool(2, &pool_sizes(&bindings, 2)).unwrap();
        let table = DescriptorTable::new(device, pool, bindings, 2).unwrap();
        (registry, pool, table)
    }

    #[test]
    fn test_pool_sizes_scale_with_slots() {
        let bindings = vec![
            DescriptorBinding::uniform(0, vk::ShaderStageFlags::VERTEX, 64),
            DescriptorBinding::uniform(1, vk::ShaderStageFlags::FRAGMENT, 64),
        ];
        let sizes = pool_sizes(&bindings, 3);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC);
        assert_eq!(sizes[0].descriptor_count, 6);
    }

    /// Each slot is linked once per generation
    #[test]
    fn test_relink_is_lazy_per_slot() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let (mut registry, pool, mut table) = fixture(&mut device);
        let sampler = device.create_sampler(vk::Filter::NEAREST, vk::SamplerAddressMode::CLAMP_TO_EDGE).unwrap();
        let (arena, _) = device.create_buffer(256, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();

        assert_eq!(table.dynamic_count(), 1);
        assert!(table.is_stale(0, registry.generation()));

        let sources = LinkSources { arena, registry: &registry, sampler };
        assert!(table.relink(&mut device, 0, sources).unwrap());
        assert!(!table.relink(&mut device, 0, sources).unwrap());
        assert!(table.is_stale(1, registry.generation()));

        for attachment in registry.take_generation() {
            attachment.destroy(&mut device);
        }
        registry.create_generation(&mut device, vk::Extent2D { width: 32, height: 32 }).unwrap();
        assert!(table.is_stale(0, registry.generation()));

        let sources = LinkSources { arena, registry: &registry, sampler };
        assert!(table.relink(&mut device, 0, sources).unwrap());
        assert_eq!(device.hazards().total(), 0);

        table.destroy(&mut device);
        device.destroy_descriptor_pool(pool);
    }

    #[test]
    fn test_relink_unknown_attachment_fails() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let (mut registry, _pool, mut table) = fixture(&mut device);
        registry.destroy(&mut device);

        let sources = LinkSources {
            arena: vk::Buffer::null(),
            registry: &registry,
            sampler: vk::Sampler::null(),
        };
        assert!(matches!(table.relink(&mut device, 1, sources), Err(RenderError::InvalidState(_))));
    }
}
