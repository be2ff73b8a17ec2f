//! UI overlay

use ash::vk;

use super::geometry::SCENE_COLOR;
use super::{PipelineState, RecordContext, ShaderPair, SubpassDecl, SubpassKind, SubpassProgram, TargetSettings};
use crate::error::RenderResult;
use crate::resource::DescriptorBinding;
use crate::scene::{UiUniforms, UiVertex};

/// Draws the scene's UI list over the final image; must be the last subpass
#[derive(Debug, Clone)]
pub struct UiSubpass {
    shaders: ShaderPair,
}

impl UiSubpass {
    /// Create the pass
    #[must_use]
    pub const fn new(shaders: ShaderPair) -> Self {
        Self { shaders }
    }
}

impl SubpassProgram for UiSubpass {
    fn kind(&self) -> SubpassKind {
        SubpassKind::Ui
    }

    fn declare(&self, _settings: &TargetSettings) -> SubpassDecl {
        let mut decl = SubpassDecl::new("ui");
        decl.overlay = Some(SCENE_COLOR.to_string());
        decl.bindings = vec![DescriptorBinding::uniform(
            0,
            vk::ShaderStageFlags::VERTEX,
            std::mem::size_of::<UiUniforms>() as u64,
        )];
        decl.pipelines = vec![PipelineState::new(self.shaders.clone())
            .with_vertex_input(UiVertex::layout())
            .with_blend()];
        decl
    }

    fn record(&self, ctx: &mut RecordContext<'_>) -> RenderResult<()> {
        let list = &ctx.scene().ui;
        if list.is_empty() {
            return Ok(());
        }

        let vertex_offset = ctx.push_vertices(&list.vertices)?;
        let index_offset = ctx.push_indices(&list.indices)?;
        let uniforms = ctx.push_uniform(&UiUniforms::for_extent(ctx.extent()))?;

        ctx.bind_pipeline(0)?;
        ctx.bind_descriptors(vec![uniforms])?;
        let buffer = ctx.arena_buffer();
        ctx.bind_vertex_buffer(buffer, vertex_offset);
        ctx.bind_index_buffer(buffer, index_offset);
        for command in &list.commands {
            ctx.draw_indexed(command.index_count, command.first_index, command.vertex_offset);
        }
        Ok(())
    }
}
