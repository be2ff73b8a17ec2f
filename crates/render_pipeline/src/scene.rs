//! Per-frame scene data and its GPU layouts
//!
//! [`SceneContext`] is what the scene layer hands to `draw` each frame. The
//! `*Uniforms` and vertex structs are the exact bytes written into the
//! transient arena; matrices are stored column-major as GLSL expects.

// bytemuck derives expand to unsafe impls
#![allow(unsafe_code)]

use ash::vk;
use bytemuck::{Pod, Zeroable};
use nalgebra::{Matrix4, Point3, Vector3};

use crate::device::VertexInput;
use crate::error::{RenderError, RenderResult};
use crate::resource::MeshKey;

/// Camera transforms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraMatrices {
    /// World to view
    pub view: Matrix4<f32>,
    /// View to clip, OpenGL convention (Y up)
    pub projection: Matrix4<f32>,
    /// Eye position in world space
    pub position: Point3<f32>,
}

impl Default for CameraMatrices {
    fn default() -> Self {
        Self {
            view: Matrix4::identity(),
            projection: Matrix4::identity(),
            position: Point3::origin(),
        }
    }
}

impl CameraMatrices {
    /// Right-handed perspective camera looking from `eye` at `target`
    #[must_use]
    pub fn look_at(eye: Point3<f32>, target: Point3<f32>, fovy: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            view: Matrix4::look_at_rh(&eye, &target, &Vector3::y()),
            projection: Matrix4::new_perspective(aspect, fovy, near, far),
            position: eye,
        }
    }

    /// Projection with Y flipped for Vulkan clip space
    #[must_use]
    pub fn vulkan_projection(&self) -> Matrix4<f32> {
        let mut projection = self.projection;
        projection[(1, 1)] *= -1.0;
        projection
    }

    /// Vulkan projection times view
    #[must_use]
    pub fn view_projection(&self) -> Matrix4<f32> {
        self.vulkan_projection() * self.view
    }
}

/// Surface parameters of one drawable
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialParams {
    /// Base color (RGBA)
    pub base_color: [f32; 4],
    /// Roughness in `0..=1`
    pub roughness: f32,
    /// Metallic in `0..=1`
    pub metallic: f32,
}

impl Default for MaterialParams {
    fn default() -> Self {
        Self {
            base_color: [1.0, 1.0, 1.0, 1.0],
            roughness: 0.5,
            metallic: 0.0,
        }
    }
}

/// A mesh instance to draw this frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drawable {
    /// Mesh created through the pipeline
    pub mesh: MeshKey,
    /// Object to world
    pub model: Matrix4<f32>,
    /// Material
    pub material: MaterialParams,
}

impl Drawable {
    /// Draw `mesh` at the origin with the default material
    #[must_use]
    pub fn new(mesh: MeshKey) -> Self {
        Self {
            mesh,
            model: Matrix4::identity(),
            material: MaterialParams::default(),
        }
    }

    /// Set the model matrix
    #[must_use]
    pub const fn with_model(mut self, model: Matrix4<f32>) -> Self {
        self.model = model;
        self
    }

    /// Set the material
    #[must_use]
    pub const fn with_material(mut self, material: MaterialParams) -> Self {
        self.material = material;
        self
    }

    /// Translation part of the model matrix
    #[must_use]
    pub fn position(&self) -> Vector3<f32> {
        self.model.fixed_view::<3, 1>(0, 3).into_owned()
    }
}

/// Most directional lights one frame can carry
pub const MAX_DIRECTIONAL_LIGHTS: usize = 32;
/// Most point lights one frame can carry
pub const MAX_POINT_LIGHTS: usize = 32;

/// Light that reaches every surface from one direction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    /// Direction the light travels
    pub direction: Vector3<f32>,
    /// Light color
    pub color: [f32; 3],
    /// Intensity multiplier
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vector3::new(-0.3, -1.0, -0.2),
            color: [1.0, 1.0, 1.0],
            intensity: 1.0,
        }
    }
}

/// Light radiating from a point, fading out at `range`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    /// World-space position
    pub position: Point3<f32>,
    /// Light color
    pub color: [f32; 3],
    /// Intensity multiplier
    pub intensity: f32,
    /// Distance at which the contribution reaches zero
    pub range: f32,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            position: Point3::origin(),
            color: [1.0, 1.0, 1.0],
            intensity: 10.0,
            range: 5.0,
        }
    }
}

/// Lights of one frame
#[derive(Debug, Clone, PartialEq)]
pub struct SceneLights {
    /// Directional lights, at most [`MAX_DIRECTIONAL_LIGHTS`]
    pub directional: Vec<DirectionalLight>,
    /// Point lights, at most [`MAX_POINT_LIGHTS`]
    pub point: Vec<PointLight>,
    /// Ambient term
    pub ambient: [f32; 3],
}

impl Default for SceneLights {
    fn default() -> Self {
        Self {
            directional: vec![DirectionalLight::default()],
            point: Vec::new(),
            ambient: [0.05, 0.05, 0.05],
        }
    }
}

impl SceneLights {
    /// No lights and no ambient term
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            directional: Vec::new(),
            point: Vec::new(),
            ambient: [0.0, 0.0, 0.0],
        }
    }

    /// Error when either list exceeds what the lighting uniform holds
    pub fn check_capacity(&self) -> RenderResult<()> {
        if self.directional.len() > MAX_DIRECTIONAL_LIGHTS {
            return Err(RenderError::TooManyLights {
                kind: "directional",
                count: self.directional.len(),
                max: MAX_DIRECTIONAL_LIGHTS,
            });
        }
        if self.point.len() > MAX_POINT_LIGHTS {
            return Err(RenderError::TooManyLights {
                kind: "point",
                count: self.point.len(),
                max: MAX_POINT_LIGHTS,
            });
        }
        Ok(())
    }
}

/// World-space line for the debug overlay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebugLine {
    /// Start point
    pub start: Point3<f32>,
    /// End point
    pub end: Point3<f32>,
    /// Color (RGBA)
    pub color: [f32; 4],
}

/// UI vertex in pixel coordinates
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UiVertex {
    /// Position in pixels from the top-left corner
    pub position: [f32; 2],
    /// Texture coordinates
    pub uv: [f32; 2],
    /// Packed RGBA8 color
    pub color: u32,
}

impl UiVertex {
    /// Vertex layout
    #[must_use]
    pub fn layout() -> VertexInput {
        VertexInput {
            stride: std::mem::size_of::<Self>() as u32,
            attributes: vec![
                attribute(0, vk::Format::R32G32_SFLOAT, 0),
                attribute(1, vk::Format::R32G32_SFLOAT, 8),
                attribute(2, vk::Format::R8G8B8A8_UNORM, 16),
            ],
        }
    }
}

/// One indexed draw of the UI list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UiDrawCommand {
    /// Indices to draw
    pub index_count: u32,
    /// First index in the list
    pub first_index: u32,
    /// Added to each index
    pub vertex_offset: i32,
}

/// UI geometry for one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiDrawList {
    /// Vertices
    pub vertices: Vec<UiVertex>,
    /// Indices into `vertices`
    pub indices: Vec<u32>,
    /// Draws over `indices`
    pub commands: Vec<UiDrawCommand>,
}

impl UiDrawList {
    /// Whether there is nothing to draw
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Append a solid rectangle as its own draw
    pub fn push_rect(&mut self, min: [f32; 2], max: [f32; 2], color: u32) {
        let base = self.vertices.len() as i32;
        let first_index = self.indices.len() as u32;

        for (x, y, u, v) in [
            (min[0], min[1], 0.0, 0.0),
            (max[0], min[1], 1.0, 0.0),
            (max[0], max[1], 1.0, 1.0),
            (min[0], max[1], 0.0, 1.0),
        ] {
            self.vertices.push(UiVertex { position: [x, y], uv: [u, v], color });
        }
        self.indices.extend_from_slice(&[0, 1, 2, 2, 3, 0]);
        self.commands.push(UiDrawCommand {
            index_count: 6,
            first_index,
            vertex_offset: base,
        });
    }
}

/// Everything the subpasses read for one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneContext {
    /// Camera
    pub camera: CameraMatrices,
    /// Meshes to draw
    pub drawables: Vec<Drawable>,
    /// Lights
    pub lights: SceneLights,
    /// Debug lines
    pub debug_lines: Vec<DebugLine>,
    /// UI geometry
    pub ui: UiDrawList,
}

/// Mesh vertex consumed by the G-buffer and wireframe pipelines
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Object-space normal
    pub normal: [f32; 3],
    /// Texture coordinates
    pub uv: [f32; 2],
}

impl MeshVertex {
    /// Create a vertex
    #[must_use]
    pub const fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self { position, normal, uv }
    }

    /// Vertex layout
    #[must_use]
    pub fn layout() -> VertexInput {
        VertexInput {
            stride: std::mem::size_of::<Self>() as u32,
            attributes: vec![
                attribute(0, vk::Format::R32G32B32_SFLOAT, 0),
                attribute(1, vk::Format::R32G32B32_SFLOAT, 12),
                attribute(2, vk::Format::R32G32_SFLOAT, 24),
            ],
        }
    }
}

/// Debug line vertex
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LineVertex {
    /// World-space position
    pub position: [f32; 3],
    /// Color (RGBA)
    pub color: [f32; 4],
}

impl LineVertex {
    /// Vertex layout
    #[must_use]
    pub fn layout() -> VertexInput {
        VertexInput {
            stride: std::mem::size_of::<Self>() as u32,
            attributes: vec![
                attribute(0, vk::Format::R32G32B32_SFLOAT, 0),
                attribute(1, vk::Format::R32G32B32A32_SFLOAT, 12),
            ],
        }
    }

    /// Two vertices per line
    #[must_use]
    pub fn from_lines(lines: &[DebugLine]) -> Vec<Self> {
        lines
            .iter()
            .flat_map(|line| {
                [
                    Self { position: line.start.coords.into(), color: line.color },
                    Self { position: line.end.coords.into(), color: line.color },
                ]
            })
            .collect()
    }
}

const fn attribute(location: u32, format: vk::Format, offset: u32) -> vk::VertexInputAttributeDescription {
    vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset,
    }
}

/// Per-object data of the G-buffer pass
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ObjectUniforms {
    /// Projection, Y flipped
    pub projection: [[f32; 4]; 4],
    /// View
    pub view: [[f32; 4]; 4],
    /// Model
    pub model: [[f32; 4]; 4],
    /// Object position (w = 1)
    pub object_position: [f32; 4],
}

impl ObjectUniforms {
    /// Uniforms for `drawable` seen through `camera`
    #[must_use]
    pub fn new(camera: &CameraMatrices, drawable: &Drawable) -> Self {
        let position = drawable.position();
        Self {
            projection: camera.vulkan_projection().into(),
            view: camera.view.into(),
            model: drawable.model.into(),
            object_position: [position.x, position.y, position.z, 1.0],
        }
    }
}

/// Per-object material of the G-buffer pass
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialUniforms {
    /// Base color
    pub base_color: [f32; 4],
    /// Roughness, metallic, unused, unused
    pub params: [f32; 4],
}

impl From<&MaterialParams> for MaterialUniforms {
    fn from(material: &MaterialParams) -> Self {
        Self {
            base_color: material.base_color,
            params: [material.roughness, material.metallic, 0.0, 0.0],
        }
    }
}

/// GPU layout of a [`DirectionalLight`]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DirectionalLightData {
    /// Color (w unused)
    pub color: [f32; 4],
    /// Normalized direction (xyz) and intensity (w)
    pub direction: [f32; 4],
}

impl From<&DirectionalLight> for DirectionalLightData {
    fn from(light: &DirectionalLight) -> Self {
        let direction = light.direction.try_normalize(f32::EPSILON).unwrap_or_else(|| -Vector3::y());
        let [r, g, b] = light.color;
        Self {
            color: [r, g, b, 0.0],
            direction: [direction.x, direction.y, direction.z, light.intensity],
        }
    }
}

/// GPU layout of a [`PointLight`]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PointLightData {
    /// Color (w unused)
    pub color: [f32; 4],
    /// Position (w = 1)
    pub position: [f32; 4],
    /// Intensity, range, unused, unused
    pub params: [f32; 4],
}

impl From<&PointLight> for PointLightData {
    fn from(light: &PointLight) -> Self {
        let [r, g, b] = light.color;
        Self {
            color: [r, g, b, 0.0],
            position: [light.position.x, light.position.y, light.position.z, 1.0],
            params: [light.intensity, light.range.max(0.0), 0.0, 0.0],
        }
    }
}

/// Lighting composition inputs
///
/// Both light arrays are fixed-size; the counts say how many leading
/// entries the shader reads.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightingUniforms {
    /// Directional count, point count, unused, unused
    pub counts: [u32; 4],
    /// Ambient color (w unused)
    pub ambient: [f32; 4],
    /// Camera position (w = 1)
    pub camera_position: [f32; 4],
    /// Directional lights
    pub directional: [DirectionalLightData; MAX_DIRECTIONAL_LIGHTS],
    /// Point lights
    pub point: [PointLightData; MAX_POINT_LIGHTS],
}

impl LightingUniforms {
    /// Pack the lights and camera
    pub fn new(lights: &SceneLights, camera: &CameraMatrices) -> RenderResult<Self> {
        lights.check_capacity()?;

        let mut uniforms = Self::zeroed();
        for (slot, light) in uniforms.directional.iter_mut().zip(&lights.directional) {
            *slot = light.into();
        }
        for (slot, light) in uniforms.point.iter_mut().zip(&lights.point) {
            *slot = light.into();
        }

        let [ar, ag, ab] = lights.ambient;
        uniforms.counts = [lights.directional.len() as u32, lights.point.len() as u32, 0, 0];
        uniforms.ambient = [ar, ag, ab, 0.0];
        uniforms.camera_position = [camera.position.x, camera.position.y, camera.position.z, 1.0];
        Ok(uniforms)
    }
}

/// Debug overlay transform and color
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DebugUniforms {
    /// Projection times view
    pub view_projection: [[f32; 4]; 4],
    /// Model
    pub model: [[f32; 4]; 4],
    /// Color override; lines use their vertex color when alpha is 0
    pub color: [f32; 4],
}

/// Maps pixel coordinates to clip space
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UiUniforms {
    /// Scale
    pub scale: [f32; 2],
    /// Translation
    pub translate: [f32; 2],
}

impl UiUniforms {
    /// Transform for a target of `extent` pixels
    #[must_use]
    pub fn for_extent(extent: vk::Extent2D) -> Self {
        Self {
            scale: [2.0 / extent.width.max(1) as f32, 2.0 / extent.height.max(1) as f32],
            translate: [-1.0, -1.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use slotmap::SlotMap;

    #[test]
    fn test_gpu_struct_sizes() {
        assert_eq!(std::mem::size_of::<MeshVertex>(), 32);
        assert_eq!(std::mem::size_of::<UiVertex>(), 20);
        assert_eq!(std::mem::size_of::<LineVertex>(), 28);
        assert_eq!(std::mem::size_of::<ObjectUniforms>(), 208);
        assert_eq!(std::mem::size_of::<DirectionalLightData>(), 32);
        assert_eq!(std::mem::size_of::<PointLightData>(), 48);
        assert_eq!(std::mem::size_of::<LightingUniforms>(), 48 + 32 * 32 + 48 * 32);
        assert_eq!(std::mem::size_of::<DebugUniforms>(), 144);
    }

    #[test]
    fn test_object_uniforms_flip_projection() {
        let camera = CameraMatrices::look_at(
            Point3::new(0.0, 2.0, 5.0),
            Point3::origin(),
            std::f32::consts::FRAC_PI_4,
            16.0 / 9.0,
            0.1,
            100.0,
        );
        let mut keys: SlotMap<MeshKey, ()> = SlotMap::with_key();
        let drawable = Drawable::new(keys.insert(()))
            .with_model(Matrix4::new_translation(&Vector3::new(1.0, 2.0, 3.0)));

        let uniforms = ObjectUniforms::new(&camera, &drawable);

        assert_relative_eq!(uniforms.projection[1][1], -camera.projection[(1, 1)]);
        assert_relative_eq!(uniforms.projection[0][0], camera.projection[(0, 0)]);
        assert_eq!(uniforms.object_position, [1.0, 2.0, 3.0, 1.0]);
        // Column-major: translation lives in the last column
        assert_relative_eq!(uniforms.model[3][0], 1.0);
    }

    #[test]
    fn test_lighting_direction_normalized() {
        let lights = SceneLights {
            directional: vec![DirectionalLight {
                direction: Vector3::new(0.0, -4.0, 0.0),
                ..DirectionalLight::default()
            }],
            ..SceneLights::default()
        };
        let uniforms = LightingUniforms::new(&lights, &CameraMatrices::default()).unwrap();
        assert_relative_eq!(uniforms.directional[0].direction[1], -1.0);
        assert_relative_eq!(uniforms.directional[0].direction[3], 1.0);
    }

    #[test]
    fn test_lighting_packs_every_light() {
        let lights = SceneLights {
            directional: (0..3)
                .map(|i| DirectionalLight { intensity: i as f32, ..DirectionalLight::default() })
                .collect(),
            point: (0..5)
                .map(|i| PointLight {
                    position: Point3::new(i as f32, 1.0, 0.0),
                    range: 2.0,
                    ..PointLight::default()
                })
                .collect(),
            ambient: [0.1, 0.2, 0.3],
        };
        let uniforms = LightingUniforms::new(&lights, &CameraMatrices::default()).unwrap();

        assert_eq!(uniforms.counts, [3, 5, 0, 0]);
        assert_relative_eq!(uniforms.directional[2].direction[3], 2.0);
        assert_eq!(uniforms.point[4].position, [4.0, 1.0, 0.0, 1.0]);
        assert_eq!(uniforms.point[4].params, [10.0, 2.0, 0.0, 0.0]);
        // Entries past the counts stay zeroed
        assert_eq!(uniforms.directional[3], DirectionalLightData::zeroed());
        assert_eq!(uniforms.point[5], PointLightData::zeroed());
        assert_relative_eq!(uniforms.ambient[2], 0.3);
    }

    #[test]
    fn test_lighting_rejects_over_capacity() {
        let mut lights = SceneLights::empty();
        lights.point = vec![PointLight::default(); MAX_POINT_LIGHTS];
        assert!(LightingUniforms::new(&lights, &CameraMatrices::default()).is_ok());

        lights.point.push(PointLight::default());
        let err = LightingUniforms::new(&lights, &CameraMatrices::default()).unwrap_err();
        assert!(matches!(err, RenderError::TooManyLights { kind: "point", count: 33, max: 32 }));

        lights.point.clear();
        lights.directional = vec![DirectionalLight::default(); MAX_DIRECTIONAL_LIGHTS + 1];
        assert!(matches!(lights.check_capacity(), Err(RenderError::TooManyLights { kind: "directional", .. })));
    }

    #[test]
    fn test_ui_rects_offset_vertices() {
        let mut list = UiDrawList::default();
        assert!(list.is_empty());

        list.push_rect([0.0, 0.0], [10.0, 10.0], 0xFFFF_FFFF);
        list.push_rect([20.0, 20.0], [30.0, 40.0], 0xFF00_00FF);

        assert_eq!(list.vertices.len(), 8);
        assert_eq!(list.commands[1].first_index, 6);
        assert_eq!(list.commands[1].vertex_offset, 4);
    }

    #[test]
    fn test_line_vertices() {
        let lines = [DebugLine {
            start: Point3::origin(),
            end: Point3::new(1.0, 0.0, 0.0),
            color: [1.0, 0.0, 0.0, 1.0],
        }];
        let vertices = LineVertex::from_lines(&lines);
        assert_eq!(vertices.len(), 2);
        assert_eq!(vertices[1].position, [1.0, 0.0, 0.0]);
    }
}
