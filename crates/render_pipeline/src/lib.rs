//! # Render Pipeline
//!
//! Subpass-based rendering core for Vulkan with explicit memory and
//! frame-in-flight management.
//!
//! ## Features
//!
//! - **Ordered subpasses**: Offscreen G-buffer, lighting composition, debug
//!   overlays and UI, chained through named attachments
//! - **Explicit memory**: free-list block allocator, per-frame stack arenas,
//!   deferred destruction keyed by frame number
//! - **Frames in flight**: fence-guarded slots with their own transient data
//! - **Device seam**: every graphics API call goes through [`GpuDevice`], with a
//!   simulated [`HeadlessDevice`] for tests and an `ash` backend behind the
//!   `vulkan` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_pipeline::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     render_pipeline::logging::init();
//!
//!     let config = PipelineConfig::default();
//!     let device = HeadlessDevice::new(HeadlessConfig::default());
//!     let mut pipeline = RenderPipeline::standard(device, config, ShaderLibrary::placeholder())?;
//!
//!     let scene = SceneContext::default();
//!     pipeline.begin_frame()?;
//!     pipeline.draw(&scene)?;
//!     pipeline.end_frame()?;
//!
//!     pipeline.destroy()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod resource;
pub mod scene;
pub mod subpass;

pub use device::{GpuDevice, HeadlessConfig, HeadlessDevice};
pub use error::{MappingError, RenderError, RenderResult};
pub use pipeline::{RenderPipeline, RenderPipelineBuilder};

/// Common imports for pipeline users
pub mod prelude {
    pub use crate::{
        config::{Config, PipelineConfig},
        device::{GpuDevice, HeadlessConfig, HeadlessDevice, MemoryLocation},
        error::{MappingError, RenderError, RenderResult},
        pipeline::{FrameInfo, PipelineStats, RenderPipeline, RenderPipelineBuilder},
        resource::{MeshKey, ShaderCode},
        scene::{
            CameraMatrices, DebugLine, DirectionalLight, Drawable, MaterialParams, MeshVertex, PointLight,
            SceneContext, SceneLights, UiDrawCommand, UiDrawList, UiVertex,
        },
        subpass::{DebugOverlay, ShaderLibrary, ShaderPair},
    };
}
