// Scene data: cube geometry and the per-frame uniform block
//
// Everything here is plain data shared with the shaders. The layouts must
// match shaders/cube.vert exactly.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::mem::{offset_of, size_of};

/// Interleaved vertex: position, tint colour, texture coordinate
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    const fn new(position: [f32; 3], color: [f32; 3], uv: [f32; 2]) -> Self {
        Self { position, color, uv }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(VERTEX_BINDING)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, position)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, color)),
            attribute(2, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, uv)),
        ]
    }
}

pub const VERTEX_BINDING: u32 = 0;

fn attribute(location: u32, format: vk::Format, offset: usize) -> vk::VertexInputAttributeDescription {
    vk::VertexInputAttributeDescription::builder()
        .binding(VERTEX_BINDING)
        .location(location)
        .format(format)
        .offset(offset as u32)
        .build()
}

const H: f32 = 0.5;

const RED: [f32; 3] = [1.0, 0.85, 0.85];
const GREEN: [f32; 3] = [0.85, 1.0, 0.85];
const BLUE: [f32; 3] = [0.85, 0.85, 1.0];
const YELLOW: [f32; 3] = [1.0, 1.0, 0.8];
const CYAN: [f32; 3] = [0.8, 1.0, 1.0];
const WHITE: [f32; 3] = [1.0, 1.0, 1.0];

// Four vertices per face so every face gets the full texture. Each face is
// listed counter-clockwise as seen from outside the cube, starting bottom-left.
#[rustfmt::skip]
pub const CUBE_VERTICES: [Vertex; 24] = [
    // +Z
    Vertex::new([-H, -H,  H], WHITE, [0.0, 1.0]),
    Vertex::new([ H, -H,  H], WHITE, [1.0, 1.0]),
    Vertex::new([ H,  H,  H], WHITE, [1.0, 0.0]),
    Vertex::new([-H,  H,  H], WHITE, [0.0, 0.0]),
    // -Z
    Vertex::new([ H, -H, -H], RED, [0.0, 1.0]),
    Vertex::new([-H, -H, -H], RED, [1.0, 1.0]),
    Vertex::new([-H,  H, -H], RED, [1.0, 0.0]),
    Vertex::new([ H,  H, -H], RED, [0.0, 0.0]),
    // +X
    Vertex::new([ H, -H,  H], GREEN, [0.0, 1.0]),
    Vertex::new([ H, -H, -H], GREEN, [1.0, 1.0]),
    Vertex::new([ H,  H, -H], GREEN, [1.0, 0.0]),
    Vertex::new([ H,  H,  H], GREEN, [0.0, 0.0]),
    // -X
    Vertex::new([-H, -H, -H], BLUE, [0.0, 1.0]),
    Vertex::new([-H, -H,  H], BLUE, [1.0, 1.0]),
    Vertex::new([-H,  H,  H], BLUE, [1.0, 0.0]),
    Vertex::new([-H,  H, -H], BLUE, [0.0, 0.0]),
    // +Y
    Vertex::new([-H,  H,  H], YELLOW, [0.0, 1.0]),
    Vertex::new([ H,  H,  H], YELLOW, [1.0, 1.0]),
    Vertex::new([ H,  H, -H], YELLOW, [1.0, 0.0]),
    Vertex::new([-H,  H, -H], YELLOW, [0.0, 0.0]),
    // -Y
    Vertex::new([-H, -H, -H], CYAN, [0.0, 1.0]),
    Vertex::new([ H, -H, -H], CYAN, [1.0, 1.0]),
    Vertex::new([ H, -H,  H], CYAN, [1.0, 0.0]),
    Vertex::new([-H, -H,  H], CYAN, [0.0, 0.0]),
];

pub const CUBE_INDICES: [u16; 36] = face_indices();

const fn face_indices() -> [u16; 36] {
    let mut indices = [0u16; 36];
    let mut face = 0;
    while face < 6 {
        let base = (face * 4) as u16;
        let i = face * 6;
        indices[i] = base;
        indices[i + 1] = base + 1;
        indices[i + 2] = base + 2;
        indices[i + 3] = base + 2;
        indices[i + 4] = base + 3;
        indices[i + 5] = base;
        face += 1;
    }
    indices
}

/// Uniform block at descriptor binding 0. Field order is the shader's.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Uniforms {
    pub projection: Mat4,
    pub model: Mat4,
    pub view: Mat4,
}

pub const CAMERA_POSITION: Vec3 = Vec3::new(1.6, 1.4, 1.6);
const NEAR_PLANE: f32 = 0.1;
const FAR_PLANE: f32 = 10.0;

impl Uniforms {
    /// Camera fixed at `CAMERA_POSITION` looking at the origin, cube rotated
    /// `angle` radians about Y.
    pub fn new(aspect: f32, fov_degrees: f32, angle: f32) -> Self {
        let mut projection =
            Mat4::perspective_rh(fov_degrees.to_radians(), aspect, NEAR_PLANE, FAR_PLANE);
        // Vulkan clip space has Y pointing down
        projection.y_axis.y *= -1.0;

        Self {
            projection,
            model: Mat4::from_rotation_y(angle),
            view: Mat4::look_at_rh(CAMERA_POSITION, Vec3::ZERO, Vec3::Y),
        }
    }

    #[cfg(test)]
    pub fn model_view_projection(&self) -> Mat4 {
        self.projection * self.view * self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4;

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(size_of::<Vertex>(), 32);
        let binding = Vertex::binding_description();
        assert_eq!(binding.stride, 32);

        let attributes = Vertex::attribute_descriptions();
        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
        let locations: Vec<u32> = attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1, 2]);
        assert_eq!(attributes[2].format, vk::Format::R32G32_SFLOAT);
    }

    #[test]
    fn indices_stay_in_bounds() {
        assert!(CUBE_INDICES
            .iter()
            .all(|&i| (i as usize) < CUBE_VERTICES.len()));
        // every vertex is referenced
        for v in 0..CUBE_VERTICES.len() as u16 {
            assert!(CUBE_INDICES.contains(&v), "vertex {v} unused");
        }
    }

    #[test]
    fn triangles_face_outwards() {
        for tri in CUBE_INDICES.chunks(3) {
            let p = |i: u16| Vec3::from(CUBE_VERTICES[i as usize].position);
            let (a, b, c) = (p(tri[0]), p(tri[1]), p(tri[2]));
            let normal = (b - a).cross(c - a);
            let centroid = (a + b + c) / 3.0;
            assert!(
                normal.dot(centroid) > 0.0,
                "triangle {:?} is wound clockwise from outside",
                tri
            );
        }
    }

    #[test]
    fn uniform_block_is_three_matrices() {
        assert_eq!(size_of::<Uniforms>(), 3 * 64);
        let u = Uniforms::new(16.0 / 9.0, 45.0, 0.0);
        let bytes: &[u8] = bytemuck::bytes_of(&u);
        let first: &[f32] = bytemuck::cast_slice(&bytes[..64]);
        assert_eq!(first, u.projection.to_cols_array().as_slice());
    }

    #[test]
    fn origin_lands_in_view_volume() {
        let u = Uniforms::new(4.0 / 3.0, 60.0, 1.0);
        let clip = u.model_view_projection() * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!(clip.w > 0.0);
        let ndc = clip / clip.w;
        assert_relative_eq!(ndc.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(ndc.y, 0.0, epsilon = 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn up_is_negative_clip_y() {
        let u = Uniforms::new(1.0, 45.0, 0.0);
        let clip = u.model_view_projection() * Vec4::new(0.0, 0.4, 0.0, 1.0);
        assert!(clip.y / clip.w < 0.0);
    }

    #[test]
    fn rotation_only_touches_model() {
        let a = Uniforms::new(1.0, 45.0, 0.0);
        let b = Uniforms::new(1.0, 45.0, std::f32::consts::FRAC_PI_2);
        assert_eq!(a.projection, b.projection);
        assert_eq!(a.view, b.view);
        let x = b.model.transform_point3(Vec3::X);
        assert_relative_eq!(x.z, -1.0, epsilon = 1e-6);
    }
}
