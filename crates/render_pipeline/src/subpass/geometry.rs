//! Lighting composition
//!
//! Samples the G-buffer and writes the lit scene color with a single
//! full-screen triangle generated in the vertex shader. With multisampling
//! enabled the color renders into `scene.color.msaa` and resolves into
//! `scene.color`.

use ash::vk;

use super::offscreen::{ALBEDO, NORMAL, POSITION};
use super::{PipelineState, RecordContext, ShaderPair, SubpassDecl, SubpassKind, SubpassProgram, TargetSettings};
use crate::error::RenderResult;
use crate::resource::{AttachmentSpec, DescriptorBinding, ExtentPolicy};
use crate::scene::LightingUniforms;

/// Composed scene color
pub const SCENE_COLOR: &str = "scene.color";
/// Scene depth
pub const SCENE_DEPTH: &str = "scene.depth";

/// Full-screen lighting pass
#[derive(Debug, Clone)]
pub struct GeometrySubpass {
    shaders: ShaderPair,
}

impl GeometrySubpass {
    /// Create the pass
    #[must_use]
    pub const fn new(shaders: ShaderPair) -> Self {
        Self { shaders }
    }
}

impl SubpassProgram for GeometrySubpass {
    fn kind(&self) -> SubpassKind {
        SubpassKind::Geometry
    }

    fn declare(&self, settings: &TargetSettings) -> SubpassDecl {
        let mut decl = SubpassDecl::new("geometry");
        decl.inputs = vec![POSITION.to_string(), NORMAL.to_string(), ALBEDO.to_string()];
        decl.outputs = vec![
            AttachmentSpec::color(SCENE_COLOR, settings.color_format, ExtentPolicy::Swapchain)
                .with_samples(settings.samples),
            AttachmentSpec::depth(SCENE_DEPTH, settings.depth_format, ExtentPolicy::Swapchain)
                .with_samples(settings.samples),
        ];

        let fragment = vk::ShaderStageFlags::FRAGMENT;
        decl.bindings = vec![
            DescriptorBinding::uniform(0, fragment, std::mem::size_of::<LightingUniforms>() as u64),
            DescriptorBinding::sampled(1, fragment, POSITION),
            DescriptorBinding::sampled(2, fragment, NORMAL),
            DescriptorBinding::sampled(3, fragment, ALBEDO),
        ];
        decl.pipelines = vec![PipelineState::new(self.shaders.clone()).with_depth(true)];
        decl
    }

    fn record(&self, ctx: &mut RecordContext<'_>) -> RenderResult<()> {
        let scene = ctx.scene();
        let lighting = ctx.push_uniform(&LightingUniforms::new(&scene.lights, &scene.camera)?)?;

        ctx.bind_pipeline(0)?;
        ctx.bind_descriptors(vec![lighting])?;
        ctx.draw(3, 0);
        Ok(())
    }
}
