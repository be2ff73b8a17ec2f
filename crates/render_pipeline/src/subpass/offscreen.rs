//! G-buffer pass

use ash::vk;

use super::{PipelineState, RecordContext, ShaderPair, SubpassDecl, SubpassKind, SubpassProgram, TargetSettings};
use crate::error::RenderResult;
use crate::resource::{AttachmentSpec, DescriptorBinding};
use crate::scene::{MaterialUniforms, MeshVertex, ObjectUniforms};

/// World-space position target
pub const POSITION: &str = "gbuffer.position";
/// World-space normal target
pub const NORMAL: &str = "gbuffer.normal";
/// Albedo target
pub const ALBEDO: &str = "gbuffer.albedo";
/// Depth target
pub const DEPTH: &str = "gbuffer.depth";

const GBUFFER_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
const ALBEDO_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Renders every drawable into position, normal and albedo targets
#[derive(Debug, Clone)]
pub struct OffscreenSubpass {
    shaders: ShaderPair,
}

impl OffscreenSubpass {
    /// Create the pass
    #[must_use]
    pub const fn new(shaders: ShaderPair) -> Self {
        Self { shaders }
    }
}

impl SubpassProgram for OffscreenSubpass {
    fn kind(&self) -> SubpassKind {
        SubpassKind::Offscreen
    }

    fn declare(&self, settings: &TargetSettings) -> SubpassDecl {
        let extent = settings.offscreen_extent;
        let mut decl = SubpassDecl::new("offscreen");
        decl.clear_color = [0.0, 0.0, 0.0, 0.0];
        decl.outputs = vec![
            AttachmentSpec::color(POSITION, GBUFFER_FORMAT, extent),
            AttachmentSpec::color(NORMAL, GBUFFER_FORMAT, extent),
            AttachmentSpec::color(ALBEDO, ALBEDO_FORMAT, extent),
            AttachmentSpec::depth(DEPTH, settings.depth_format, extent),
        ];
        decl.bindings = vec![
            DescriptorBinding::uniform(0, vk::ShaderStageFlags::VERTEX, std::mem::size_of::<ObjectUniforms>() as u64),
            DescriptorBinding::uniform(1, vk::ShaderStageFlags::FRAGMENT, std::mem::size_of::<MaterialUniforms>() as u64),
        ];
        decl.pipelines = vec![PipelineState::new(self.shaders.clone())
            .with_vertex_input(MeshVertex::layout())
            .with_cull_mode(vk::CullModeFlags::BACK)
            .with_depth(true)];
        decl
    }

    fn record(&self, ctx: &mut RecordContext<'_>) -> RenderResult<()> {
        let scene = ctx.scene();
        if scene.drawables.is_empty() {
            return Ok(());
        }

        ctx.bind_pipeline(0)?;
        for drawable in &scene.drawables {
            let Some(mesh) = ctx.mesh(drawable.mesh) else {
                log::warn!("Skipping drawable with unknown mesh {:?}", drawable.mesh);
                continue;
            };

            let object = ctx.push_uniform(&ObjectUniforms::new(&scene.camera, drawable))?;
            let material = ctx.push_uniform(&MaterialUniforms::from(&drawable.material))?;
            ctx.bind_descriptors(vec![object, material])?;
            ctx.bind_mesh(mesh);
            ctx.draw_indexed(mesh.index_count(), 0, 0);
        }
        Ok(())
    }
}
