//! Mesh data
//!
//! The whole scene shares one interleaved vertex buffer and one index
//! buffer; a mesh is a model matrix plus an ordered list of surfaces, each a
//! window into those shared buffers with a material index.

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::Mat4;

/// Interleaved scene vertex. Layout must match the vertex shader's reflected
/// input signature; `verify_host_layout` checks it at pipeline creation.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    /// Position in object space
    pub position: [f32; 3],
    /// Normal in object space
    pub normal: [f32; 3],
    /// Tangent with handedness in w
    pub tangent: [f32; 4],
    /// First UV channel
    pub tex_coord: [f32; 2],
}

impl Vertex {
    /// Stride of the interleaved vertex
    pub const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;

    /// Attribute byte offsets in location order
    pub const OFFSETS: [u32; 4] = [0, 12, 24, 40];
}

/// One drawable range of the shared buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    /// First vertex in the scene vertex buffer
    pub vertex_start: u32,
    /// Number of vertices
    pub vertex_count: u32,
    /// First index in the scene index buffer
    pub index_start: u32,
    /// Number of indices
    pub index_count: u32,
    /// Index into the scene material table
    pub material_index: u32,
}

/// CPU-side mesh description produced by the importer
#[derive(Debug, Clone)]
pub struct MeshData {
    /// Node name from the source asset
    pub name: String,
    /// World transform composed during import
    pub model_matrix: Mat4,
    /// Ordered surfaces referencing the shared buffers
    pub surfaces: Vec<Surface>,
}

/// Per-mesh GPU uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ModelUniform {
    /// Model matrix, column-major
    pub model: [[f32; 4]; 4],
}

impl From<&Mat4> for ModelUniform {
    fn from(matrix: &Mat4) -> Self {
        Self {
            model: (*matrix).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn vertex_layout_matches_declared_offsets() {
        assert_eq!(Vertex::STRIDE, 48);
        assert_eq!(offset_of!(Vertex, position) as u32, Vertex::OFFSETS[0]);
        assert_eq!(offset_of!(Vertex, normal) as u32, Vertex::OFFSETS[1]);
        assert_eq!(offset_of!(Vertex, tangent) as u32, Vertex::OFFSETS[2]);
        assert_eq!(offset_of!(Vertex, tex_coord) as u32, Vertex::OFFSETS[3]);
        assert_eq!(size_of::<Vertex>() as u32, Vertex::STRIDE);
    }

    #[test]
    fn model_uniform_is_a_bare_matrix() {
        assert_eq!(size_of::<ModelUniform>(), 64);
    }
}
