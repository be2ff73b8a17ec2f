//! End-to-end frame loop tests against the headless device

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::config::MemoryConfig;
    use crate::device::{DeviceLimits, HazardReport, HeadlessConfig, HeadlessDevice, ObjectKind};
    use crate::error::MappingError;
    use crate::scene::{
        CameraMatrices, DebugLine, DirectionalLight, Drawable, MeshVertex, PointLight, SceneContext, MAX_POINT_LIGHTS,
    };
    use crate::subpass::{ShaderPair, SubpassState};
    use nalgebra::{Matrix4, Point3, Vector3};

    fn quad() -> (Vec<MeshVertex>, Vec<u32>) {
        let normal = [0.0, 0.0, 1.0];
        let vertices = vec![
            MeshVertex::new([-0.5, -0.5, 0.0], normal, [0.0, 0.0]),
            MeshVertex::new([0.5, -0.5, 0.0], normal, [1.0, 0.0]),
            MeshVertex::new([0.5, 0.5, 0.0], normal, [1.0, 1.0]),
            MeshVertex::new([-0.5, 0.5, 0.0], normal, [0.0, 1.0]),
        ];
        (vertices, vec![0, 1, 2, 2, 3, 0])
    }

    fn scene(mesh: MeshKey) -> SceneContext {
        let mut scene = SceneContext {
            camera: CameraMatrices::look_at(
                Point3::new(0.0, 2.0, 5.0),
                Point3::origin(),
                45.0_f32.to_radians(),
                16.0 / 9.0,
                0.1,
                100.0,
            ),
            ..SceneContext::default()
        };
        scene.drawables.push(Drawable::new(mesh));
        scene
            .drawables
            .push(Drawable::new(mesh).with_model(Matrix4::new_translation(&Vector3::new(2.0, 0.0, 0.0))));
        scene.debug_lines.push(DebugLine {
            start: Point3::origin(),
            end: Point3::new(1.0, 1.0, 1.0),
            color: [1.0, 0.0, 0.0, 1.0],
        });
        scene.ui.push_rect([10.0, 10.0], [200.0, 40.0], 0xffff_ffff);
        scene
    }

    fn pipeline(device: HeadlessConfig, config: PipelineConfig) -> RenderPipeline<HeadlessDevice> {
        RenderPipeline::standard(HeadlessDevice::new(device), config, ShaderLibrary::placeholder()).unwrap()
    }

    fn with_mesh(pipeline: &mut RenderPipeline<HeadlessDevice>) -> SceneContext {
        let (vertices, indices) = quad();
        let mesh = pipeline.create_mesh(&vertices, &indices).unwrap();
        scene(mesh)
    }

    fn run_frame(pipeline: &mut RenderPipeline<HeadlessDevice>, scene: &SceneContext) -> RenderResult<FrameInfo> {
        let info = pipeline.begin_frame()?;
        pipeline.draw(scene)?;
        pipeline.end_frame()?;
        Ok(info)
    }

    /// Three slots over a queue that only completes on fence waits
    #[test]
    fn test_frames_in_flight_bounded_without_hazards() {
        let device = HeadlessConfig {
            completion_latency: usize::MAX,
            ..HeadlessConfig::default()
        };
        let mut pipeline = pipeline(device, PipelineConfig::default().with_frames_in_flight(3));
        let scene = with_mesh(&mut pipeline);

        for n in 0..100 {
            let info = run_frame(&mut pipeline, &scene).unwrap();
            assert_eq!(info.frame, n as u64);
            assert_eq!(info.slot, n % 3);
        }

        let device_stats = pipeline.device().stats();
        assert!(device_stats.max_unsignaled_fences <= 3, "{device_stats:?}");
        assert_eq!(device_stats.presents, 100);
        assert_eq!(pipeline.device().hazards().total(), 0, "{:?}", pipeline.device().hazards());

        let stats = pipeline.stats();
        assert_eq!(stats.frames_submitted, 100);
        assert!(stats.frames_completed >= 97);
        assert_eq!(stats.render_passes, 4);
        // two meshes, one lighting triangle, one line batch, one UI rect
        assert_eq!(stats.draw_calls, 5);
        assert!(stats.arena_high_water > 0);
    }

    #[test]
    fn test_resize_leaves_one_generation() {
        let mut pipeline = pipeline(HeadlessConfig::default(), PipelineConfig::default());
        let scene = with_mesh(&mut pipeline);
        let generation = pipeline.stats().attachment_generation;

        for _ in 0..3 {
            run_frame(&mut pipeline, &scene).unwrap();
        }
        pipeline.resize(800, 600).unwrap();
        run_frame(&mut pipeline, &scene).unwrap();
        pipeline.resize(1024, 768).unwrap();
        for _ in 0..2 {
            run_frame(&mut pipeline, &scene).unwrap();
        }
        pipeline.wait_idle().unwrap();

        let latest = vk::Extent2D { width: 1024, height: 768 };
        let extents = pipeline.device().live_image_extents();
        assert!(!extents.is_empty());
        assert!(extents.iter().all(|extent| *extent == latest), "{extents:?}");
        assert_eq!(pipeline.stats().attachment_generation, generation + 2);
        assert_eq!(pipeline.stats().retired_pending, 0);
        assert_eq!(pipeline.device().hazards().total(), 0);
        assert_eq!(pipeline.extent(), latest);
    }

    /// A fixed-size G-buffer keeps its images across swapchain resizes
    #[test]
    fn test_resize_keeps_fixed_offscreen_targets() {
        let mut pipeline = pipeline(HeadlessConfig::default(), PipelineConfig::default().with_offscreen_extent(512, 512));
        let scene = with_mesh(&mut pipeline);
        let position = pipeline.attachment("gbuffer.position").unwrap().image();
        let color = pipeline.attachment("scene.color").unwrap().image();
        run_frame(&mut pipeline, &scene).unwrap();

        pipeline.resize(800, 600).unwrap();
        run_frame(&mut pipeline, &scene).unwrap();
        pipeline.resize(1024, 768).unwrap();
        run_frame(&mut pipeline, &scene).unwrap();
        pipeline.wait_idle().unwrap();

        assert_eq!(pipeline.attachment("gbuffer.position").unwrap().image(), position);
        assert_ne!(pipeline.attachment("scene.color").unwrap().image(), color);

        let fixed = vk::Extent2D { width: 512, height: 512 };
        let latest = vk::Extent2D { width: 1024, height: 768 };
        let extents = pipeline.device().live_image_extents();
        assert!(extents.iter().all(|extent| *extent == fixed || *extent == latest), "{extents:?}");
        assert_eq!(extents.iter().filter(|extent| **extent == fixed).count(), 4);
        assert_eq!(pipeline.device().hazards().total(), 0);
    }

    /// Scenes carry many lights; too many fail the draw without ending the frame
    #[test]
    fn test_lighting_with_many_lights() {
        let mut pipeline = pipeline(HeadlessConfig::default(), PipelineConfig::default());
        let mut scene = with_mesh(&mut pipeline);
        scene.lights.directional.push(DirectionalLight {
            direction: Vector3::new(1.0, -1.0, 0.0),
            ..DirectionalLight::default()
        });
        scene.lights.point = (0..MAX_POINT_LIGHTS)
            .map(|i| PointLight {
                position: Point3::new(i as f32, 1.0, 0.0),
                ..PointLight::default()
            })
            .collect();
        run_frame(&mut pipeline, &scene).unwrap();

        let mut crowded = scene.clone();
        crowded.lights.point.push(PointLight::default());
        pipeline.begin_frame().unwrap();
        assert!(matches!(
            pipeline.draw(&crowded),
            Err(RenderError::TooManyLights { kind: "point", count: 33, max: 32 })
        ));
        assert!(pipeline.poisoned().is_none());

        pipeline.draw(&scene).unwrap();
        pipeline.end_frame().unwrap();
        assert_eq!(pipeline.stats().frames_submitted, 2);
        assert_eq!(pipeline.device().hazards().total(), 0);
    }

    /// Zero extents and repeated sizes leave the attachments alone
    #[test]
    fn test_resize_ignores_zero_and_unchanged_extents() {
        let mut pipeline = pipeline(HeadlessConfig::default(), PipelineConfig::default());
        let generation = pipeline.stats().attachment_generation;

        pipeline.resize(0, 600).unwrap();
        pipeline.resize(1280, 720).unwrap();
        assert_eq!(pipeline.stats().attachment_generation, generation);

        pipeline.resize(640, 480).unwrap();
        pipeline.resize(640, 480).unwrap();
        assert_eq!(pipeline.stats().attachment_generation, generation + 1);
        assert_eq!(pipeline.attachment("scene.color").unwrap().extent().width, 640);
    }

    #[test]
    fn test_teardown_releases_everything() {
        let mut pipeline = pipeline(HeadlessConfig::default(), PipelineConfig::default().with_sample_count(4));
        let scene = with_mesh(&mut pipeline);
        let (vertices, indices) = quad();
        let extra = pipeline.create_mesh(&vertices, &indices).unwrap();

        run_frame(&mut pipeline, &scene).unwrap();
        pipeline.destroy_mesh(extra).unwrap();
        pipeline.resize(640, 360).unwrap();
        run_frame(&mut pipeline, &scene).unwrap();

        pipeline.destroy().unwrap();
        assert_eq!(pipeline.device().live_total(), 0);
        assert_eq!(pipeline.device().stats().invalid_destroys, 0);
        assert_eq!(pipeline.device().hazards().total(), 0);

        pipeline.destroy().unwrap();
        assert!(matches!(pipeline.begin_frame(), Err(RenderError::InvalidState(_))));
    }

    #[test]
    fn test_multisampled_scene_color_resolves() {
        let mut pipeline = pipeline(HeadlessConfig::default(), PipelineConfig::default().with_sample_count(4));
        let scene = with_mesh(&mut pipeline);

        let msaa = pipeline.attachment("scene.color.msaa").unwrap();
        assert_eq!(msaa.samples(), vk::SampleCountFlags::TYPE_4);
        let resolved = pipeline.attachment("scene.color").unwrap();
        assert_eq!(resolved.samples(), vk::SampleCountFlags::TYPE_1);
        assert_eq!(resolved.usage(), AttachmentUsage::Resolve);

        for _ in 0..4 {
            run_frame(&mut pipeline, &scene).unwrap();
        }
        assert_eq!(pipeline.device().hazards().total(), 0);
    }

    /// A fence that never signals loses the device for good
    #[test]
    fn test_fence_timeout_poisons_pipeline() {
        let mut pipeline = pipeline(HeadlessConfig::default(), PipelineConfig::default().with_fence_timeout_ms(10));
        let scene = with_mesh(&mut pipeline);
        run_frame(&mut pipeline, &scene).unwrap();
        run_frame(&mut pipeline, &scene).unwrap();

        pipeline.device_mut().set_hung(true);
        let lost = (0..4).find_map(|_| run_frame(&mut pipeline, &scene).err());
        assert!(matches!(lost, Some(RenderError::DeviceLost(_))), "{lost:?}");
        assert!(pipeline.poisoned().is_some());

        assert!(matches!(pipeline.begin_frame(), Err(RenderError::DeviceLost(_))));
        let (vertices, indices) = quad();
        assert!(matches!(pipeline.create_mesh(&vertices, &indices), Err(RenderError::DeviceLost(_))));

        pipeline.device_mut().set_hung(false);
        pipeline.destroy().unwrap();
        assert_eq!(pipeline.device().live_total(), 0);
    }

    #[test]
    fn test_wrong_order_is_dependency_error() {
        let result = RenderPipelineBuilder::new(HeadlessDevice::new(HeadlessConfig::default()), PipelineConfig::default())
            .with_subpass(GeometrySubpass::new(ShaderPair::placeholder()))
            .with_subpass(OffscreenSubpass::new(ShaderPair::placeholder()))
            .build();

        match result {
            Err(RenderError::Dependency { subpass, attachment }) => {
                assert_eq!(subpass, "geometry");
                assert_eq!(attachment, "gbuffer.position");
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("out-of-order subpasses built"),
        }
    }

    #[test]
    fn test_builder_rejects_invalid_chains() {
        let ui_first = RenderPipelineBuilder::new(HeadlessDevice::new(HeadlessConfig::default()), PipelineConfig::default())
            .with_subpass(UiSubpass::new(ShaderPair::placeholder()))
            .with_subpass(OffscreenSubpass::new(ShaderPair::placeholder()))
            .build();
        assert!(matches!(ui_first, Err(RenderError::InvalidState(_))));

        let empty = RenderPipelineBuilder::new(HeadlessDevice::new(HeadlessConfig::default()), PipelineConfig::default()).build();
        assert!(matches!(empty, Err(RenderError::InvalidState(_))));

        let single_sample = HeadlessConfig {
            limits: DeviceLimits {
                max_color_samples: vk::SampleCountFlags::TYPE_1,
                ..DeviceLimits::default()
            },
            ..HeadlessConfig::default()
        };
        let msaa = RenderPipeline::standard(
            HeadlessDevice::new(single_sample),
            PipelineConfig::default().with_sample_count(4),
            ShaderLibrary::placeholder(),
        );
        assert!(matches!(msaa, Err(RenderError::InvalidState(_))));

        let invalid = RenderPipeline::standard(
            HeadlessDevice::new(HeadlessConfig::default()),
            PipelineConfig::default().with_frames_in_flight(0),
            ShaderLibrary::placeholder(),
        );
        assert!(matches!(invalid, Err(RenderError::Config(_))));
    }

    #[test]
    fn test_optional_subpasses_follow_config() {
        let config = PipelineConfig::default().with_debug(false).with_ui(false);
        let mut pipeline = pipeline(HeadlessConfig::default(), config);
        let names: Vec<&str> = pipeline.subpasses().iter().map(Subpass::name).collect();
        assert_eq!(names, ["offscreen", "geometry"]);

        let scene = with_mesh(&mut pipeline);
        run_frame(&mut pipeline, &scene).unwrap();
        assert_eq!(pipeline.stats().render_passes, 2);
        assert!(pipeline
            .subpasses()
            .iter()
            .all(|subpass| subpass.state() == SubpassState::Submitted));
    }

    #[test]
    fn test_frame_call_order_enforced() {
        let mut pipeline = pipeline(HeadlessConfig::default(), PipelineConfig::default());
        let scene = with_mesh(&mut pipeline);

        assert!(matches!(pipeline.draw(&scene), Err(RenderError::InvalidState(_))));
        assert!(matches!(pipeline.end_frame(), Err(RenderError::InvalidState(_))));

        pipeline.begin_frame().unwrap();
        assert!(matches!(pipeline.begin_frame(), Err(RenderError::InvalidState(_))));
        assert!(matches!(pipeline.end_frame(), Err(RenderError::InvalidState(_))));
        assert!(matches!(pipeline.resize(640, 480), Err(RenderError::InvalidState(_))));

        pipeline.draw(&scene).unwrap();
        assert!(matches!(pipeline.draw(&scene), Err(RenderError::InvalidState(_))));
        pipeline.end_frame().unwrap();
        assert_eq!(pipeline.stats().frames_submitted, 1);
    }

    #[test]
    fn test_out_of_date_swapchain_recovers_through_resize() {
        let mut pipeline = pipeline(HeadlessConfig::default(), PipelineConfig::default());
        let scene = with_mesh(&mut pipeline);
        run_frame(&mut pipeline, &scene).unwrap();
        let generation = pipeline.stats().attachment_generation;

        pipeline.device_mut().mark_swapchain_out_of_date();
        assert!(matches!(pipeline.begin_frame(), Err(RenderError::SwapchainOutOfDate)));
        assert!(matches!(pipeline.begin_frame(), Err(RenderError::SwapchainOutOfDate)));

        pipeline.resize(1280, 720).unwrap();
        assert_eq!(pipeline.stats().attachment_generation, generation + 1);
        run_frame(&mut pipeline, &scene).unwrap();
        assert_eq!(pipeline.device().hazards().total(), 0);
    }

    /// A frame dropped after acquire leaves no signaled semaphore behind
    #[test]
    fn test_abandoned_frame_replaces_acquire_semaphore() {
        let mut pipeline = pipeline(HeadlessConfig::default(), PipelineConfig::default());
        let scene = with_mesh(&mut pipeline);
        run_frame(&mut pipeline, &scene).unwrap();
        let semaphores = pipeline.device().live_count(ObjectKind::Semaphore);

        let abandoned = pipeline.begin_frame().unwrap();
        pipeline.draw(&scene).unwrap();
        pipeline.device_mut().fail_next_flush();
        assert!(matches!(pipeline.end_frame(), Err(RenderError::Mapping(MappingError::MapFailed))));
        assert!(pipeline.poisoned().is_none());

        // The retry reuses the slot, acquiring into its new semaphore
        let retried = run_frame(&mut pipeline, &scene).unwrap();
        assert_eq!(retried.slot, abandoned.slot);
        for _ in 0..3 {
            run_frame(&mut pipeline, &scene).unwrap();
        }
        pipeline.wait_idle().unwrap();

        assert_eq!(pipeline.device().hazards(), HazardReport::default());
        assert_eq!(pipeline.device().live_count(ObjectKind::Semaphore), semaphores);
        assert_eq!(pipeline.stats().frames_submitted, 5);
    }

    /// Destroyed meshes outlive the frames that drew them
    #[test]
    fn test_destroyed_mesh_is_retired() {
        let device = HeadlessConfig {
            completion_latency: usize::MAX,
            ..HeadlessConfig::default()
        };
        let mut pipeline = pipeline(device, PipelineConfig::default());
        let (vertices, indices) = quad();
        let mesh = pipeline.create_mesh(&vertices, &indices).unwrap();
        let scene = scene(mesh);

        run_frame(&mut pipeline, &scene).unwrap();
        let buffers = pipeline.device().live_count(ObjectKind::Buffer);
        pipeline.destroy_mesh(mesh).unwrap();
        assert_eq!(pipeline.device().live_count(ObjectKind::Buffer), buffers);
        assert!(matches!(pipeline.destroy_mesh(mesh), Err(RenderError::InvalidState(_))));

        // Drawables pointing at the destroyed mesh are skipped
        run_frame(&mut pipeline, &scene).unwrap();
        pipeline.wait_idle().unwrap();
        assert_eq!(pipeline.stats().retired_pending, 0);
        assert_eq!(pipeline.device().live_count(ObjectKind::Buffer), buffers - 2);
        assert_eq!(pipeline.device().hazards().total(), 0);
    }

    /// Blocks grown for a large mesh are released once it is gone
    #[test]
    fn test_trim_releases_empty_blocks() {
        let memory = MemoryConfig {
            block_size: 64 * 1024,
            ..MemoryConfig::default()
        };
        let mut pipeline = pipeline(HeadlessConfig::default(), PipelineConfig::default().with_memory(memory));

        let normal = [0.0, 0.0, 1.0];
        let large: Vec<MeshVertex> = (0..3000)
            .map(|i| MeshVertex::new([i as f32, 0.0, 0.0], normal, [0.0, 0.0]))
            .collect();
        let large = pipeline.create_mesh(&large, &[0, 1, 2]).unwrap();
        let (vertices, indices) = quad();
        let small = pipeline.create_mesh(&vertices, &indices).unwrap();
        assert!(pipeline.stats().device_local.blocks >= 2);

        pipeline.destroy_mesh(large).unwrap();
        pipeline.destroy_mesh(small).unwrap();
        pipeline.wait_idle().unwrap();

        let before = pipeline.device().live_count(ObjectKind::Memory);
        let freed = pipeline.trim_memory().unwrap();
        assert!(freed >= 1);
        assert_eq!(pipeline.device().live_count(ObjectKind::Memory), before - freed);
        assert_eq!(pipeline.stats().device_local.used, 0);

        pipeline.destroy().unwrap();
        assert_eq!(pipeline.device().live_total(), 0);
    }
}
