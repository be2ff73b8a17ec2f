//! Frame runner
//!
//! Builds the standard subpass chain on a headless device, renders a small
//! spinning scene for a configured number of frames and logs pipeline
//! statistics. Usage: `frame_runner [config.toml|config.ron]`.

use nalgebra::{Matrix4, Point3, Vector3};
use render_pipeline::config::{ConfigError, Extent};
use render_pipeline::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// Runner settings around the pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RunnerConfig {
    /// Frames to render
    frames: u64,
    /// Frame after which the swapchain is resized
    resize_at: Option<u64>,
    /// Extent used for the resize
    resize_to: Extent,
    /// Headless queue latency in submissions
    completion_latency: usize,
    /// Pipeline settings
    pipeline: PipelineConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            frames: 120,
            resize_at: None,
            resize_to: Extent::new(1600, 900),
            completion_latency: 1,
            pipeline: PipelineConfig::new("Frame Runner"),
        }
    }
}

impl Config for RunnerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.resize_to.is_zero() {
            return Err(ConfigError::Invalid("resize extent must be non-zero".to_string()));
        }
        self.pipeline.validate()
    }
}

#[derive(Error, Debug)]
enum RunnerError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Hazards detected by the headless device: {0:?}")]
    Hazards(render_pipeline::device::HazardReport),

    #[error("{0} device objects still alive after teardown")]
    Leaked(usize),
}

fn cube() -> (Vec<MeshVertex>, Vec<u32>) {
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in faces {
        let base = vertices.len() as u32;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let position = [
                0.5 * (normal[0] + su * u[0] + sv * v[0]),
                0.5 * (normal[1] + su * u[1] + sv * v[1]),
                0.5 * (normal[2] + su * u[2] + sv * v[2]),
            ];
            vertices.push(MeshVertex::new(position, normal, [(su + 1.0) * 0.5, (sv + 1.0) * 0.5]));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }
    (vertices, indices)
}

fn build_scene(mesh: MeshKey, angle: f32, extent: (u32, u32)) -> SceneContext {
    let aspect = extent.0 as f32 / extent.1.max(1) as f32;
    let mut scene = SceneContext {
        camera: CameraMatrices::look_at(
            Point3::new(0.0, 3.0, 8.0),
            Point3::origin(),
            45.0_f32.to_radians(),
            aspect,
            0.1,
            100.0,
        ),
        ..SceneContext::default()
    };

    for (i, x) in [-2.5_f32, 0.0, 2.5].into_iter().enumerate() {
        let model = Matrix4::new_translation(&Vector3::new(x, 0.0, 0.0))
            * Matrix4::from_axis_angle(&Vector3::y_axis(), angle * (i as f32 + 1.0));
        scene.drawables.push(Drawable::new(mesh).with_model(model));
    }

    for (axis, color) in [
        (Point3::new(1.0, 0.0, 0.0), [1.0, 0.0, 0.0, 1.0]),
        (Point3::new(0.0, 1.0, 0.0), [0.0, 1.0, 0.0, 1.0]),
        (Point3::new(0.0, 0.0, 1.0), [0.0, 0.0, 1.0, 1.0]),
    ] {
        scene.debug_lines.push(DebugLine { start: Point3::origin(), end: axis, color });
    }

    scene.ui.push_rect([16.0, 16.0], [256.0, 48.0], 0xc020_2020);
    scene
}

fn run(config: RunnerConfig) -> Result<(), RunnerError> {
    let device = HeadlessDevice::new(HeadlessConfig {
        completion_latency: config.completion_latency,
        extent: config.pipeline.extent.to_vk(),
        ..HeadlessConfig::default()
    });
    let mut pipeline = RenderPipeline::standard(device, config.pipeline.clone(), ShaderLibrary::placeholder())?;

    let (vertices, indices) = cube();
    let mesh = pipeline.create_mesh(&vertices, &indices)?;

    let started = Instant::now();
    for frame in 0..config.frames {
        if config.resize_at == Some(frame) {
            log::info!("Resizing to {}x{}", config.resize_to.width, config.resize_to.height);
            pipeline.resize(config.resize_to.width, config.resize_to.height)?;
        }

        let extent = pipeline.extent();
        let scene = build_scene(mesh, frame as f32 * 0.02, (extent.width, extent.height));

        match pipeline.begin_frame() {
            Ok(_) => {}
            Err(RenderError::SwapchainOutOfDate) => {
                pipeline.resize(extent.width, extent.height)?;
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        pipeline.draw(&scene)?;
        match pipeline.end_frame() {
            Ok(()) | Err(RenderError::SwapchainOutOfDate) => {}
            Err(e) => return Err(e.into()),
        }

        if frame % 60 == 0 {
            let stats = pipeline.stats();
            log::debug!(
                "Frame {}: {} completed, {} draws, {} passes, arena high water {} bytes",
                frame,
                stats.frames_completed,
                stats.draw_calls,
                stats.render_passes,
                stats.arena_high_water
            );
        }
    }
    let elapsed = started.elapsed();

    pipeline.destroy_mesh(mesh)?;
    pipeline.wait_idle()?;
    let trimmed = pipeline.trim_memory()?;
    log::info!("Released {} empty memory blocks", trimmed);

    let stats = pipeline.stats();
    log::info!(
        "Rendered {} frames in {:.2?} ({} completed, generation {})",
        stats.frames_submitted,
        elapsed,
        stats.frames_completed,
        stats.attachment_generation
    );
    log::info!(
        "Last frame: {} draw calls over {} render passes",
        stats.draw_calls,
        stats.render_passes
    );
    log::info!(
        "Device-local pool: {} blocks, {} / {} bytes used; host-visible pool: {} blocks, {} / {} bytes used",
        stats.device_local.blocks,
        stats.device_local.used,
        stats.device_local.capacity,
        stats.host_visible.blocks,
        stats.host_visible.used,
        stats.host_visible.capacity
    );

    let hazards = pipeline.device().hazards();
    pipeline.destroy()?;
    let leaked = pipeline.device().live_total();

    if hazards != render_pipeline::device::HazardReport::default() {
        return Err(RunnerError::Hazards(hazards));
    }
    if leaked != 0 {
        return Err(RunnerError::Leaked(leaked));
    }
    log::info!("Teardown complete, no live device objects");
    Ok(())
}

fn main() {
    render_pipeline::logging::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match RunnerConfig::load_from_file(&path) {
            Ok(config) => {
                log::info!("Loaded configuration from {}", path);
                config
            }
            Err(e) => {
                log::error!("Failed to load configuration: {}", e);
                std::process::exit(2);
            }
        },
        None => {
            log::info!("No configuration given, using defaults");
            RunnerConfig::default()
        }
    };

    log::info!(
        "Running '{}' for {} frames, {} in flight, {}x MSAA",
        config.pipeline.application_name,
        config.frames,
        config.pipeline.frames_in_flight,
        config.pipeline.sample_count
    );

    if let Err(e) = run(config) {
        log::error!("Frame runner failed: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shipped_config_loads() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/runner.toml");
        let config = RunnerConfig::load_from_file(&path).unwrap();

        assert_eq!(config.frames, 240);
        assert_eq!(config.resize_at, Some(120));
        assert_eq!(config.pipeline.sample_count, 4);
    }

    #[test]
    fn test_zero_resize_extent_rejected() {
        let config = RunnerConfig { resize_to: Extent::new(0, 900), ..RunnerConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = RunnerConfig {
            pipeline: PipelineConfig::default().with_frames_in_flight(0),
            ..RunnerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
