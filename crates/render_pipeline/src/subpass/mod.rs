//! # Subpasses
//!
//! Each rendering stage is a [`SubpassProgram`] wrapped in a [`Subpass`],
//! which owns the shared state machine:
//!
//! ```text
//! Uninitialized --build--> Built --begin--> Recording --submit--> Submitted
//!                                              ^                      |
//!                                              +-------begin----------+
//! ```
//!
//! `build` checks the declared inputs and overlay target against what the
//! previous subpass exports, then creates the render pass, framebuffer,
//! descriptor table and graphics pipelines. `draw` is only legal while
//! recording and appends to the frame's command stream; per-draw data goes
//! into the frame slot's transient arena.

pub mod debug;
pub mod geometry;
pub mod offscreen;
pub mod ui;

pub use debug::{DebugOverlay, DebugSubpass};
pub use geometry::GeometrySubpass;
pub use offscreen::OffscreenSubpass;
pub use ui::UiSubpass;

use ash::vk;
use bytemuck::Pod;

use crate::command::{Command, CommandStream};
use crate::config::PipelineConfig;
use crate::device::{DescriptorKind, GpuDevice, GraphicsPipelineDesc, VertexInput};
use crate::error::{RenderError, RenderResult};
use crate::pipeline::frame::FrameArena;
use crate::resource::{
    AttachmentKind, AttachmentRegistry, AttachmentSet, AttachmentSpec, DescriptorBinding, DescriptorTable, ExtentPolicy, LinkSources,
    Mesh, MeshKey, MeshRegistry, PassTarget, ShaderCode,
};
use crate::scene::SceneContext;

/// Subpass variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubpassKind {
    /// G-buffer pass
    Offscreen,
    /// Lighting composition
    Geometry,
    /// Wireframe and line overlays
    Debug,
    /// UI overlay, always last
    Ui,
}

/// Lifecycle of a subpass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpassState {
    /// Declared, nothing created
    Uninitialized,
    /// Device objects created
    Built,
    /// Accepting draws for the current frame
    Recording,
    /// Frame handed to the queue
    Submitted,
}

/// Vertex and fragment SPIR-V
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderPair {
    /// Vertex stage
    pub vertex: ShaderCode,
    /// Fragment stage
    pub fragment: ShaderCode,
}

impl ShaderPair {
    /// Pair two modules
    #[must_use]
    pub const fn new(vertex: ShaderCode, fragment: ShaderCode) -> Self {
        Self { vertex, fragment }
    }

    /// Header-only modules for headless runs
    #[must_use]
    pub fn placeholder() -> Self {
        Self::new(ShaderCode::placeholder(), ShaderCode::placeholder())
    }
}

/// Shaders for the standard subpasses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderLibrary {
    /// G-buffer
    pub offscreen: ShaderPair,
    /// Full-screen lighting composition
    pub geometry: ShaderPair,
    /// Mesh wireframe
    pub debug_wireframe: ShaderPair,
    /// Debug lines
    pub debug_lines: ShaderPair,
    /// UI
    pub ui: ShaderPair,
}

impl ShaderLibrary {
    /// Placeholder modules everywhere
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            offscreen: ShaderPair::placeholder(),
            geometry: ShaderPair::placeholder(),
            debug_wireframe: ShaderPair::placeholder(),
            debug_lines: ShaderPair::placeholder(),
            ui: ShaderPair::placeholder(),
        }
    }
}

/// Fixed-function and shader state of one graphics pipeline
#[derive(Debug, Clone)]
pub struct PipelineState {
    /// Shaders
    pub shaders: ShaderPair,
    /// Vertex layout; `None` for generated vertices
    pub vertex_input: Option<VertexInput>,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Fill or wireframe
    pub polygon_mode: vk::PolygonMode,
    /// Face culling
    pub cull_mode: vk::CullModeFlags,
    /// Depth test
    pub depth_test: bool,
    /// Depth writes
    pub depth_write: bool,
    /// Alpha blending
    pub blend: bool,
}

impl PipelineState {
    /// Filled triangle lists without depth, culling or blending
    #[must_use]
    pub fn new(shaders: ShaderPair) -> Self {
        Self {
            shaders,
            vertex_input: None,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: false,
            depth_write: false,
            blend: false,
        }
    }

    /// Set the vertex layout
    #[must_use]
    pub fn with_vertex_input(mut self, input: VertexInput) -> Self {
        self.vertex_input = Some(input);
        self
    }

    /// Set the topology
    #[must_use]
    pub fn with_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Set the polygon mode
    #[must_use]
    pub fn with_polygon_mode(mut self, mode: vk::PolygonMode) -> Self {
        self.polygon_mode = mode;
        self
    }

    /// Set face culling
    #[must_use]
    pub fn with_cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    /// Enable depth testing and optionally writes
    #[must_use]
    pub fn with_depth(mut self, write: bool) -> Self {
        self.depth_test = true;
        self.depth_write = write;
        self
    }

    /// Enable alpha blending
    #[must_use]
    pub fn with_blend(mut self) -> Self {
        self.blend = true;
        self
    }
}

/// Formats and sample count subpasses declare their outputs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSettings {
    /// Final color format
    pub color_format: vk::Format,
    /// Depth format
    pub depth_format: vk::Format,
    /// Samples for the composed scene
    pub samples: vk::SampleCountFlags,
    /// Size of the G-buffer
    pub offscreen_extent: ExtentPolicy,
}

impl TargetSettings {
    /// Settings from pipeline configuration
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            color_format: config.color_format.to_vk(),
            depth_format: config.depth_format.to_vk(),
            samples: vk::SampleCountFlags::from_raw(config.sample_count),
            offscreen_extent: config
                .offscreen_extent
                .map_or(ExtentPolicy::Swapchain, |extent| ExtentPolicy::Fixed(extent.to_vk())),
        }
    }
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// What a subpass reads, writes and draws with
#[derive(Debug, Clone)]
pub struct SubpassDecl {
    /// Name used in logs and errors
    pub name: String,
    /// Attachments sampled from the previous subpass
    pub inputs: Vec<String>,
    /// Attachment drawn over without clearing
    pub overlay: Option<String>,
    /// Attachments this subpass creates and clears
    pub outputs: Vec<AttachmentSpec>,
    /// Clear color for color outputs
    pub clear_color: [f32; 4],
    /// Descriptor layout
    pub bindings: Vec<DescriptorBinding>,
    /// Graphics pipelines, bound by index while recording
    pub pipelines: Vec<PipelineState>,
}

impl SubpassDecl {
    /// Empty declaration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            overlay: None,
            outputs: Vec::new(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            bindings: Vec::new(),
            pipelines: Vec::new(),
        }
    }

    /// Names the next subpass may consume: outputs plus the overlay target
    #[must_use]
    pub fn exports(&self) -> Vec<String> {
        self.outputs
            .iter()
            .map(|spec| spec.name.clone())
            .chain(self.overlay.clone())
            .collect()
    }

    fn targets(&self) -> Vec<PassTarget> {
        let outputs = self.outputs.iter().map(|spec| match spec.kind {
            AttachmentKind::Color => PassTarget::clear_color(spec.name.clone(), self.clear_color),
            AttachmentKind::Depth => PassTarget::clear_depth(spec.name.clone()),
        });
        self.overlay
            .iter()
            .map(|name| PassTarget::overlay(name.clone()))
            .chain(outputs)
            .collect()
    }
}

/// One rendering stage
pub trait SubpassProgram: std::fmt::Debug {
    /// Variant
    fn kind(&self) -> SubpassKind;

    /// Inputs, outputs, bindings and pipelines
    fn declare(&self, settings: &TargetSettings) -> SubpassDecl;

    /// Append this frame's draws; the render pass is already begun
    fn record(&self, ctx: &mut RecordContext<'_>) -> RenderResult<()>;
}

/// Per-frame state shared by every subpass of a frame
pub struct FrameContext<'a> {
    /// Device
    pub device: &'a mut dyn GpuDevice,
    /// Transient arena of the frame slot
    pub arena: &'a mut FrameArena,
    /// Segment the subpass records into
    pub stream: &'a mut CommandStream,
    /// Scene
    pub scene: &'a SceneContext,
    /// Meshes
    pub meshes: &'a MeshRegistry,
    /// Frame slot index
    pub slot: usize,
}

/// Device objects of a built subpass
#[derive(Debug)]
pub struct BuiltPass {
    attachments: AttachmentSet,
    table: DescriptorTable,
    layout: vk::PipelineLayout,
    pipelines: Vec<vk::Pipeline>,
}

impl BuiltPass {
    /// Render targets
    #[must_use]
    pub const fn attachments(&self) -> &AttachmentSet {
        &self.attachments
    }

    /// Descriptor table
    #[must_use]
    pub const fn table(&self) -> &DescriptorTable {
        &self.table
    }

    fn destroy(self, device: &mut dyn GpuDevice) {
        for pipeline in self.pipelines {
            device.destroy_pipeline(pipeline);
        }
        if self.layout != vk::PipelineLayout::null() {
            device.destroy_pipeline_layout(self.layout);
        }
        self.table.destroy(device);
        self.attachments.destroy(device);
    }
}

/// Recording interface handed to [`SubpassProgram::record`]
pub struct RecordContext<'a> {
    device: &'a mut dyn GpuDevice,
    arena: &'a mut FrameArena,
    stream: &'a mut CommandStream,
    scene: &'a SceneContext,
    meshes: &'a MeshRegistry,
    pass: &'a BuiltPass,
    slot: usize,
}

impl<'a> RecordContext<'a> {
    /// Scene of this frame
    #[must_use]
    pub const fn scene(&self) -> &'a SceneContext {
        self.scene
    }

    /// Mesh by key
    #[must_use]
    pub fn mesh(&self, key: MeshKey) -> Option<&'a Mesh> {
        self.meshes.get(key)
    }

    /// Render area
    #[must_use]
    pub const fn extent(&self) -> vk::Extent2D {
        self.pass.attachments.extent()
    }

    /// Copy a uniform into the arena and return its dynamic offset
    pub fn push_uniform<T: Pod>(&mut self, value: &T) -> RenderResult<u32> {
        let alignment = self.device.limits().min_uniform_buffer_offset_alignment;
        let offset = self.arena.push(self.device, bytemuck::bytes_of(value), alignment)?;
        u32::try_from(offset).map_err(|_| RenderError::invalid_state("uniform offset exceeds u32"))
    }

    /// Copy vertices into the arena and return their byte offset
    pub fn push_vertices<T: Pod>(&mut self, vertices: &[T]) -> RenderResult<u64> {
        self.arena.push(self.device, bytemuck::cast_slice(vertices), 16)
    }

    /// Copy `u32` indices into the arena and return their byte offset
    pub fn push_indices(&mut self, indices: &[u32]) -> RenderResult<u64> {
        self.arena.push(self.device, bytemuck::cast_slice(indices), 4)
    }

    /// Arena buffer, for binding pushed vertices and indices
    #[must_use]
    pub const fn arena_buffer(&self) -> vk::Buffer {
        self.arena.buffer()
    }

    /// Bind the pipeline declared at `index`
    pub fn bind_pipeline(&mut self, index: usize) -> RenderResult<()> {
        let pipeline = self
            .pass
            .pipelines
            .get(index)
            .copied()
            .ok_or_else(|| RenderError::InvalidState(format!("no pipeline at index {index}")))?;
        self.stream.push(Command::BindPipeline(pipeline));
        Ok(())
    }

    /// Bind this slot's descriptor set with one offset per dynamic uniform
    pub fn bind_descriptors(&mut self, dynamic_offsets: Vec<u32>) -> RenderResult<()> {
        let expected = self.pass.table.dynamic_count();
        if dynamic_offsets.len() != expected {
            return Err(RenderError::InvalidState(format!(
                "expected {expected} dynamic offsets, got {}",
                dynamic_offsets.len()
            )));
        }
        self.stream.push(Command::BindDescriptorSet {
            layout: self.pass.layout,
            set: self.pass.table.set(self.slot),
            dynamic_offsets,
        });
        Ok(())
    }

    /// Bind a mesh's vertex and index buffers
    pub fn bind_mesh(&mut self, mesh: &Mesh) {
        self.bind_vertex_buffer(mesh.vertex_buffer(), 0);
        self.bind_index_buffer(mesh.index_buffer(), 0);
    }

    /// Bind a vertex buffer
    pub fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: u64) {
        self.stream.push(Command::BindVertexBuffer { buffer, offset });
    }

    /// Bind a `u32` index buffer
    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64) {
        self.stream.push(Command::BindIndexBuffer { buffer, offset });
    }

    /// Non-indexed draw
    pub fn draw(&mut self, vertex_count: u32, first_vertex: u32) {
        self.stream.push(Command::Draw { vertex_count, first_vertex });
    }

    /// Indexed draw
    pub fn draw_indexed(&mut self, index_count: u32, first_index: u32, vertex_offset: i32) {
        self.stream.push(Command::DrawIndexed {
            index_count,
            first_index,
            vertex_offset,
        });
    }
}

/// Everything `build` needs besides the device
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    /// Live attachments
    pub registry: &'a AttachmentRegistry,
    /// Pool for the descriptor sets
    pub pool: vk::DescriptorPool,
    /// Frame slots, one descriptor set each
    pub slots: usize,
    /// Exports of the previous subpass; empty for the first
    pub available: &'a [String],
}

/// A subpass program with its state machine and device objects
#[derive(Debug)]
pub struct Subpass {
    program: Box<dyn SubpassProgram>,
    decl: SubpassDecl,
    state: SubpassState,
    built: Option<BuiltPass>,
}

impl Subpass {
    /// Declare `program` with the given target settings
    #[must_use]
    pub fn new(program: Box<dyn SubpassProgram>, settings: &TargetSettings) -> Self {
        let decl = program.declare(settings);
        Self {
            program,
            decl,
            state: SubpassState::Uninitialized,
            built: None,
        }
    }

    /// Name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    /// Variant
    #[must_use]
    pub fn kind(&self) -> SubpassKind {
        self.program.kind()
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SubpassState {
        self.state
    }

    /// Declaration
    #[must_use]
    pub const fn decl(&self) -> &SubpassDecl {
        &self.decl
    }

    /// Device objects, once built
    #[must_use]
    pub const fn built(&self) -> Option<&BuiltPass> {
        self.built.as_ref()
    }

    /// Fail with the first input or overlay target missing from `available`
    pub fn check_dependencies(&self, available: &[String]) -> RenderResult<()> {
        let required = self.decl.inputs.iter().chain(self.decl.overlay.iter());
        for attachment in required {
            if !available.contains(attachment) {
                log::error!("Subpass '{}' depends on missing attachment '{}'", self.decl.name, attachment);
                return Err(RenderError::Dependency {
                    subpass: self.decl.name.clone(),
                    attachment: attachment.clone(),
                });
            }
        }
        Ok(())
    }

    /// Validate dependencies and create the device objects
    pub fn build(&mut self, device: &mut dyn GpuDevice, ctx: BuildContext<'_>) -> RenderResult<()> {
        if self.state != SubpassState::Uninitialized {
            return Err(RenderError::InvalidState(format!(
                "subpass '{}' is already built",
                self.decl.name
            )));
        }
        self.check_dependencies(ctx.available)?;

        let attachments = AttachmentSet::new(device, ctx.registry, &self.decl.targets())?;
        let table = match DescriptorTable::new(device, ctx.pool, self.decl.bindings.clone(), ctx.slots) {
            Ok(table) => table,
            Err(e) => {
                attachments.destroy(device);
                return Err(e);
            }
        };
        let mut built = BuiltPass {
            attachments,
            table,
            layout: vk::PipelineLayout::null(),
            pipelines: Vec::new(),
        };

        if let Err(e) = self.create_pipelines(device, &mut built) {
            built.destroy(device);
            return Err(e);
        }

        log::debug!(
            "Built subpass '{}' with {} pipelines at {}x{}",
            self.decl.name,
            built.pipelines.len(),
            built.attachments.extent().width,
            built.attachments.extent().height
        );
        self.built = Some(built);
        self.state = SubpassState::Built;
        Ok(())
    }

    fn create_pipelines(&self, device: &mut dyn GpuDevice, built: &mut BuiltPass) -> RenderResult<()> {
        built.layout = device.create_pipeline_layout(&[built.table.layout()])?;

        for state in &self.decl.pipelines {
            let pipeline = device.create_graphics_pipeline(&GraphicsPipelineDesc {
                render_pass: built.attachments.render_pass(),
                layout: built.layout,
                vertex_shader: &state.shaders.vertex,
                fragment_shader: &state.shaders.fragment,
                vertex_input: state.vertex_input.as_ref(),
                topology: state.topology,
                polygon_mode: state.polygon_mode,
                cull_mode: state.cull_mode,
                depth_test: state.depth_test,
                depth_write: state.depth_write,
                blend: state.blend,
                samples: built.attachments.samples(),
                color_attachments: built.attachments.color_count(),
            })?;
            built.pipelines.push(pipeline);
        }
        Ok(())
    }

    /// Enter `Recording` for a new frame
    pub fn begin_recording(&mut self) -> RenderResult<()> {
        match self.state {
            SubpassState::Built | SubpassState::Submitted => {
                self.state = SubpassState::Recording;
                Ok(())
            }
            state => Err(RenderError::InvalidState(format!(
                "subpass '{}' cannot start recording from {:?}",
                self.decl.name, state
            ))),
        }
    }

    /// Record this subpass's render pass into `frame.stream`
    pub fn draw(&self, frame: &mut FrameContext<'_>) -> RenderResult<()> {
        let built = match (self.state, &self.built) {
            (SubpassState::Recording, Some(built)) => built,
            (state, _) => {
                return Err(RenderError::InvalidState(format!(
                    "subpass '{}' cannot draw while {:?}",
                    self.decl.name, state
                )))
            }
        };

        let extent = built.attachments.extent();
        frame.stream.push(Command::BeginRenderPass {
            render_pass: built.attachments.render_pass(),
            framebuffer: built.attachments.framebuffer(),
            extent,
            clear_values: built.attachments.clear_values().to_vec(),
        });
        frame.stream.push(Command::SetViewport(extent));
        frame.stream.push(Command::SetScissor(extent));

        let mut ctx = RecordContext {
            device: &mut *frame.device,
            arena: &mut *frame.arena,
            stream: &mut *frame.stream,
            scene: frame.scene,
            meshes: frame.meshes,
            pass: built,
            slot: frame.slot,
        };
        self.program.record(&mut ctx)?;

        frame.stream.push(Command::EndRenderPass);
        Ok(())
    }

    /// Leave `Recording` once the frame is submitted
    pub fn mark_submitted(&mut self) -> RenderResult<()> {
        if self.state != SubpassState::Recording {
            return Err(RenderError::InvalidState(format!(
                "subpass '{}' was not recording",
                self.decl.name
            )));
        }
        self.state = SubpassState::Submitted;
        Ok(())
    }

    /// Drop back from `Recording` when a frame is abandoned
    pub(crate) fn cancel_recording(&mut self) {
        if self.state == SubpassState::Recording {
            self.state = SubpassState::Built;
        }
    }

    /// Rewrite this slot's descriptor set if it predates the live generation
    pub fn relink(&mut self, device: &mut dyn GpuDevice, slot: usize, sources: LinkSources<'_>) -> RenderResult<bool> {
        match self.built.as_mut() {
            Some(built) => built.table.relink(device, slot, sources),
            None => Ok(false),
        }
    }

    /// Point the framebuffer at the live generation, returning the old one
    pub fn rebuild_framebuffer(&mut self, device: &mut dyn GpuDevice, registry: &AttachmentRegistry) -> RenderResult<Option<vk::Framebuffer>> {
        match self.built.as_mut() {
            Some(built) => built.attachments.rebuild_framebuffer(device, registry).map(Some),
            None => Ok(None),
        }
    }

    /// Destroy the device objects; the device must be idle
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        if let Some(built) = self.built.take() {
            built.destroy(device);
        }
        self.state = SubpassState::Uninitialized;
    }
}

/// Descriptor counts of `subpasses` for sizing a shared pool
#[must_use]
pub fn descriptor_demand(subpasses: &[Subpass], slots: u32) -> (u32, Vec<vk::DescriptorPoolSize>) {
    let bindings: Vec<DescriptorBinding> = subpasses
        .iter()
        .flat_map(|subpass| subpass.decl.bindings.iter().cloned())
        .collect();
    let max_sets = subpasses.len() as u32 * slots;
    (max_sets, crate::resource::descriptor::pool_sizes(&bindings, slots))
}

/// Whether any binding samples an attachment
#[must_use]
pub fn samples_attachments(subpasses: &[Subpass]) -> bool {
    subpasses
        .iter()
        .flat_map(|subpass| &subpass.decl.bindings)
        .any(|binding| binding.kind == DescriptorKind::CombinedImageSampler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::device::{HeadlessConfig, HeadlessDevice};
    use crate::memory::MemoryPools;

    struct Fixture {
        device: HeadlessDevice,
        registry: AttachmentRegistry,
        pool: vk::DescriptorPool,
    }

    fn fixture(subpasses: &[&Subpass]) -> Fixture {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut registry = AttachmentRegistry::new();
        for subpass in subpasses {
            for spec in &subpass.decl().outputs {
                registry.declare(spec.clone()).unwrap();
            }
        }
        let extent = device.swapchain_extent();
        registry.create_generation(&mut device, extent).unwrap();
        let pool = device.create_descriptor_pool(16, &[]).unwrap();
        Fixture { device, registry, pool }
    }

    #[test]
    fn test_build_with_satisfied_dependencies() {
        let settings = TargetSettings::default();
        let mut offscreen = Subpass::new(Box::new(OffscreenSubpass::new(ShaderPair::placeholder())), &settings);
        let mut geometry = Subpass::new(Box::new(GeometrySubpass::new(ShaderPair::placeholder())), &settings);
        let mut f = fixture(&[&offscreen, &geometry]);

        assert_eq!(offscreen.state(), SubpassState::Uninitialized);
        offscreen
            .build(&mut f.device, BuildContext { registry: &f.registry, pool: f.pool, slots: 2, available: &[] })
            .unwrap();
        let exports = offscreen.decl().exports();
        geometry
            .build(&mut f.device, BuildContext { registry: &f.registry, pool: f.pool, slots: 2, available: &exports })
            .unwrap();

        assert_eq!(offscreen.state(), SubpassState::Built);
        assert_eq!(geometry.state(), SubpassState::Built);
    }

    /// An input the predecessor does not export fails before anything is created
    #[test]
    fn test_missing_input_is_dependency_error() {
        let settings = TargetSettings::default();
        let offscreen = Subpass::new(Box::new(OffscreenSubpass::new(ShaderPair::placeholder())), &settings);
        let mut geometry = Subpass::new(Box::new(GeometrySubpass::new(ShaderPair::placeholder())), &settings);
        let mut f = fixture(&[&offscreen, &geometry]);
        let live_before = f.device.live_total();

        let available = vec!["gbuffer.position".to_string()];
        let result = geometry.build(&mut f.device, BuildContext { registry: &f.registry, pool: f.pool, slots: 2, available: &available });

        match result {
            Err(RenderError::Dependency { subpass, attachment }) => {
                assert_eq!(subpass, "geometry");
                assert_eq!(attachment, "gbuffer.normal");
            }
            other => panic!("expected dependency error, got {other:?}"),
        }
        assert_eq!(geometry.state(), SubpassState::Uninitialized);
        assert_eq!(f.device.live_total(), live_before);
    }

    #[test]
    fn test_overlay_requires_predecessor_export() {
        let settings = TargetSettings::default();
        let ui = Subpass::new(Box::new(UiSubpass::new(ShaderPair::placeholder())), &settings);

        let offscreen_exports = vec!["gbuffer.albedo".to_string()];
        assert!(matches!(ui.check_dependencies(&offscreen_exports), Err(RenderError::Dependency { .. })));
        assert!(ui.check_dependencies(&["scene.color".to_string()]).is_ok());
    }

    /// draw is rejected outside Recording and emits one render pass inside it
    #[test]
    fn test_state_machine_and_draw() {
        let settings = TargetSettings::default();
        let mut offscreen = Subpass::new(Box::new(OffscreenSubpass::new(ShaderPair::placeholder())), &settings);
        let mut f = fixture(&[&offscreen]);
        offscreen
            .build(&mut f.device, BuildContext { registry: &f.registry, pool: f.pool, slots: 1, available: &[] })
            .unwrap();

        let mut pools = MemoryPools::new(&MemoryConfig::default());
        let mut arena = FrameArena::new(&mut f.device, &mut pools, 64 * 1024).unwrap();
        let mut stream = CommandStream::new();
        let scene = SceneContext::default();
        let meshes = MeshRegistry::with_key();

        let mut frame = FrameContext {
            device: &mut f.device,
            arena: &mut arena,
            stream: &mut stream,
            scene: &scene,
            meshes: &meshes,
            slot: 0,
        };
        assert!(matches!(offscreen.draw(&mut frame), Err(RenderError::InvalidState(_))));

        offscreen.begin_recording().unwrap();
        assert!(offscreen.begin_recording().is_err());
        offscreen.draw(&mut frame).unwrap();
        offscreen.mark_submitted().unwrap();
        assert_eq!(offscreen.state(), SubpassState::Submitted);

        assert_eq!(stream.render_pass_count(), 1);
        assert_eq!(stream.commands().last(), Some(&Command::EndRenderPass));
        assert!(matches!(stream.commands()[1], Command::SetViewport(_)));
    }
}
