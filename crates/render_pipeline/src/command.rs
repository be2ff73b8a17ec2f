//! Recorded command streams
//!
//! Subpasses never touch a real command buffer. They append [`Command`]s to a
//! [`CommandStream`]; the device translates the merged frame stream at submit
//! time. Keeping the stream as plain data lets the headless device inspect
//! exactly which resources a submission references.

use ash::vk;

/// Clear value for one attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// RGBA color
    Color([f32; 4]),
    /// Depth and stencil
    DepthStencil {
        /// Depth clear value
        depth: f32,
        /// Stencil clear value
        stencil: u32,
    },
    /// Attachment is loaded, not cleared
    None,
}

impl ClearValue {
    /// Convert to the Vulkan union
    #[must_use]
    pub const fn to_vk(self) -> vk::ClearValue {
        match self {
            Self::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            Self::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
            Self::None => vk::ClearValue {
                color: vk::ClearColorValue { float32: [0.0; 4] },
            },
        }
    }
}

/// Buffer-to-buffer copy region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    /// Source offset
    pub src_offset: u64,
    /// Destination offset
    pub dst_offset: u64,
    /// Bytes to copy
    pub size: u64,
}

/// One recorded GPU command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Begin a render pass over the whole framebuffer
    BeginRenderPass {
        /// Render pass
        render_pass: vk::RenderPass,
        /// Target framebuffer
        framebuffer: vk::Framebuffer,
        /// Render area
        extent: vk::Extent2D,
        /// One clear value per attachment
        clear_values: Vec<ClearValue>,
    },
    /// End the current render pass
    EndRenderPass,
    /// Bind a graphics pipeline
    BindPipeline(vk::Pipeline),
    /// Bind a descriptor set at set index 0
    BindDescriptorSet {
        /// Layout the set was created for
        layout: vk::PipelineLayout,
        /// Descriptor set
        set: vk::DescriptorSet,
        /// One offset per dynamic uniform binding
        dynamic_offsets: Vec<u32>,
    },
    /// Bind a vertex buffer at binding 0
    BindVertexBuffer {
        /// Buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: u64,
    },
    /// Bind a `u32` index buffer
    BindIndexBuffer {
        /// Buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: u64,
    },
    /// Full-extent viewport
    SetViewport(vk::Extent2D),
    /// Full-extent scissor
    SetScissor(vk::Extent2D),
    /// Non-indexed draw
    Draw {
        /// Vertices to draw
        vertex_count: u32,
        /// First vertex
        first_vertex: u32,
    },
    /// Indexed draw
    DrawIndexed {
        /// Indices to draw
        index_count: u32,
        /// First index
        first_index: u32,
        /// Added to each index
        vertex_offset: i32,
    },
    /// Copy between buffers
    CopyBuffer {
        /// Source buffer
        src: vk::Buffer,
        /// Destination buffer
        dst: vk::Buffer,
        /// Region
        region: CopyRegion,
    },
    /// Blit a shader-readable color image into a swapchain image and prepare it for present
    BlitToSwapchain {
        /// Source image, in `SHADER_READ_ONLY_OPTIMAL`
        source: vk::Image,
        /// Source extent
        extent: vk::Extent2D,
        /// Acquired swapchain image index
        image_index: u32,
    },
}

/// Ordered list of commands
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandStream {
    commands: Vec<Command>,
}

impl CommandStream {
    /// Create an empty stream
    #[must_use]
    pub const fn new() -> Self {
        Self { commands: Vec::new() }
    }

    /// Append one command
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Move every command of `segment` onto the end of this stream
    pub fn append(&mut self, segment: &mut Self) {
        self.commands.append(&mut segment.commands);
    }

    /// Remove all commands
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Recorded commands in order
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Iterate recorded commands
    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }

    /// Number of commands
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether no command was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Number of draw commands, indexed or not
    #[must_use]
    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, Command::Draw { .. } | Command::DrawIndexed { .. }))
            .count()
    }

    /// Number of render passes begun
    #[must_use]
    pub fn render_pass_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, Command::BeginRenderPass { .. }))
            .count()
    }
}

impl<'a> IntoIterator for &'a CommandStream {
    type Item = &'a Command;
    type IntoIter = std::slice::Iter<'a, Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order() {
        let mut frame = CommandStream::new();
        let mut first = CommandStream::new();
        let mut second = CommandStream::new();

        first.push(Command::Draw { vertex_count: 3, first_vertex: 0 });
        second.push(Command::EndRenderPass);
        second.push(Command::DrawIndexed { index_count: 6, first_index: 0, vertex_offset: 0 });

        frame.append(&mut first);
        frame.append(&mut second);

        assert!(first.is_empty());
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.draw_count(), 2);
        assert_eq!(frame.commands()[1], Command::EndRenderPass);
    }
}
