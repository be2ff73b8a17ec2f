//! Debug overlays drawn over the composed scene

use ash::vk;
use nalgebra::Matrix4;

use super::geometry::SCENE_COLOR;
use super::{PipelineState, RecordContext, ShaderPair, SubpassDecl, SubpassKind, SubpassProgram, TargetSettings};
use crate::error::RenderResult;
use crate::resource::DescriptorBinding;
use crate::scene::{DebugUniforms, LineVertex, MeshVertex};

bitflags::bitflags! {
    /// Which overlays the debug subpass draws
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DebugOverlay: u32 {
        /// Scene meshes as wireframe
        const WIREFRAME = 1 << 0;
        /// The scene's debug lines
        const LINES = 1 << 1;
    }
}

const WIREFRAME_PIPELINE: usize = 0;
const LINE_PIPELINE: usize = 1;

/// Wireframe and line overlay; loads `scene.color`, never clears it
#[derive(Debug, Clone)]
pub struct DebugSubpass {
    wireframe_shaders: ShaderPair,
    line_shaders: ShaderPair,
    overlay: DebugOverlay,
    wireframe_color: [f32; 4],
}

impl DebugSubpass {
    /// Create the pass with the given overlays enabled
    #[must_use]
    pub const fn new(wireframe_shaders: ShaderPair, line_shaders: ShaderPair, overlay: DebugOverlay) -> Self {
        Self {
            wireframe_shaders,
            line_shaders,
            overlay,
            wireframe_color: [0.0, 1.0, 0.0, 1.0],
        }
    }

    /// Set the wireframe color
    #[must_use]
    pub const fn with_wireframe_color(mut self, color: [f32; 4]) -> Self {
        self.wireframe_color = color;
        self
    }

    /// Enabled overlays
    #[must_use]
    pub const fn overlay(&self) -> DebugOverlay {
        self.overlay
    }
}

impl SubpassProgram for DebugSubpass {
    fn kind(&self) -> SubpassKind {
        SubpassKind::Debug
    }

    fn declare(&self, _settings: &TargetSettings) -> SubpassDecl {
        let mut decl = SubpassDecl::new("debug");
        decl.overlay = Some(SCENE_COLOR.to_string());
        decl.bindings = vec![DescriptorBinding::uniform(
            0,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            std::mem::size_of::<DebugUniforms>() as u64,
        )];
        decl.pipelines = vec![
            PipelineState::new(self.wireframe_shaders.clone())
                .with_vertex_input(MeshVertex::layout())
                .with_polygon_mode(vk::PolygonMode::LINE),
            PipelineState::new(self.line_shaders.clone())
                .with_vertex_input(LineVertex::layout())
                .with_topology(vk::PrimitiveTopology::LINE_LIST),
        ];
        decl
    }

    fn record(&self, ctx: &mut RecordContext<'_>) -> RenderResult<()> {
        let scene = ctx.scene();
        let view_projection = scene.camera.view_projection();

        if self.overlay.contains(DebugOverlay::WIREFRAME) && !scene.drawables.is_empty() {
            ctx.bind_pipeline(WIREFRAME_PIPELINE)?;
            for drawable in &scene.drawables {
                let Some(mesh) = ctx.mesh(drawable.mesh) else {
                    continue;
                };
                let offset = ctx.push_uniform(&DebugUniforms {
                    view_projection: view_projection.into(),
                    model: drawable.model.into(),
                    color: self.wireframe_color,
                })?;
                ctx.bind_descriptors(vec![offset])?;
                ctx.bind_mesh(mesh);
                ctx.draw_indexed(mesh.index_count(), 0, 0);
            }
        }

        if self.overlay.contains(DebugOverlay::LINES) && !scene.debug_lines.is_empty() {
            let vertices = LineVertex::from_lines(&scene.debug_lines);
            let vertex_offset = ctx.push_vertices(&vertices)?;
            let uniforms = ctx.push_uniform(&DebugUniforms {
                view_projection: view_projection.into(),
                model: Matrix4::identity().into(),
                color: [0.0; 4],
            })?;

            ctx.bind_pipeline(LINE_PIPELINE)?;
            ctx.bind_descriptors(vec![uniforms])?;
            let buffer = ctx.arena_buffer();
            ctx.bind_vertex_buffer(buffer, vertex_offset);
            ctx.draw(vertices.len() as u32, 0);
        }
        Ok(())
    }
}
