//! Math utilities and types
//!
//! Provides fundamental math types for 3D graphics plus the axis-convention
//! conversion applied to everything imported from glTF containers.

pub use nalgebra::{Matrix3, Matrix4, Quaternion, Unit, Vector2, Vector3, Vector4};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Quaternion type for rotations
pub type Quat = Unit<Quaternion<f32>>;

/// Transform representing position, rotation, and scale
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    /// Position in 3D space
    pub position: Vec3,

    /// Rotation quaternion
    pub rotation: Quat,

    /// Scale factors
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Quat::identity(),
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    /// Create a new identity transform
    pub fn identity() -> Self {
        Self::default()
    }

    /// Compose into a T * R * S matrix
    pub fn to_matrix(&self) -> Mat4 {
        let translation = Mat4::new_translation(&self.position);
        let rotation = self.rotation.to_homogeneous();
        let scale = Mat4::new_nonuniform_scaling(&self.scale);
        translation * rotation * scale
    }
}

/// Common math utility functions
pub mod utils {
    /// Convert degrees to radians
    pub fn deg_to_rad(degrees: f32) -> f32 {
        degrees * std::f32::consts::PI / 180.0
    }

    /// Convert radians to degrees
    pub fn rad_to_deg(radians: f32) -> f32 {
        radians * 180.0 / std::f32::consts::PI
    }
}

/// Map a vector from the glTF axis convention into world space.
///
/// Source axes (X, Y, Z) become (-Z, X, Y): glTF is Y-up with the camera
/// looking down -Z, while the engine world is Z-up.
pub fn gltf_to_world(v: Vec3) -> Vec3 {
    Vec3::new(-v.z, v.x, v.y)
}

/// Inverse of [`gltf_to_world`]
pub fn world_to_gltf(v: Vec3) -> Vec3 {
    Vec3::new(v.y, v.z, -v.x)
}

/// Apply the axis conversion to a rotation quaternion.
///
/// The vector part permutes exactly like a position; the scalar part is
/// unchanged.
pub fn gltf_quat_to_world(q: Quat) -> Quat {
    let v = Vec3::new(q.i, q.j, q.k);
    let v = gltf_to_world(v);
    Unit::new_normalize(Quaternion::new(q.w, v.x, v.y, v.z))
}

/// Build a right-handed perspective projection matrix for a Vulkan depth
/// range of [0, 1], with the Y flip Vulkan clip space expects.
pub fn perspective_vk(fov_y_rad: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let f = 1.0 / (fov_y_rad / 2.0).tan();
    let mut m = Mat4::zeros();
    m[(0, 0)] = f / aspect;
    m[(1, 1)] = -f;
    m[(2, 2)] = far / (near - far);
    m[(2, 3)] = (near * far) / (near - far);
    m[(3, 2)] = -1.0;
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn axis_conversion_permutes_axes() {
        // glTF +X (right) stays lateral, +Y (up) becomes world +Z
        assert_eq!(gltf_to_world(Vec3::new(1.0, 0.0, 0.0)), Vec3::new(0.0, 1.0, 0.0));
        assert_eq!(gltf_to_world(Vec3::new(0.0, 1.0, 0.0)), Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(gltf_to_world(Vec3::new(0.0, 0.0, 1.0)), Vec3::new(-1.0, 0.0, 0.0));
    }

    #[test]
    fn axis_conversion_round_trips() {
        let v = Vec3::new(0.3, -1.7, 4.2);
        assert_relative_eq!(world_to_gltf(gltf_to_world(v)), v, epsilon = EPSILON);
        assert_relative_eq!(gltf_to_world(world_to_gltf(v)), v, epsilon = EPSILON);
    }

    #[test]
    fn quat_conversion_shuffles_vector_part_only() {
        let q = Unit::new_normalize(Quaternion::new(0.9, 0.1, -0.3, 0.2));
        let converted = gltf_quat_to_world(q);

        assert_relative_eq!(converted.w, q.w, epsilon = EPSILON);
        assert_relative_eq!(converted.i, -q.k, epsilon = EPSILON);
        assert_relative_eq!(converted.j, q.i, epsilon = EPSILON);
        assert_relative_eq!(converted.k, q.j, epsilon = EPSILON);
        assert_relative_eq!(converted.norm(), 1.0, epsilon = EPSILON);
    }

    #[test]
    fn quat_conversion_keeps_identity() {
        let converted = gltf_quat_to_world(Quat::identity());
        assert_relative_eq!(converted.angle(), 0.0, epsilon = EPSILON);
    }

    #[test]
    fn transform_composes_trs_in_order() {
        let t = Transform {
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Quat::identity(),
            scale: Vec3::new(2.0, 2.0, 2.0),
        };
        // Scale applies before translation
        let p = t.to_matrix().transform_point(&nalgebra::Point3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(p.coords, Vec3::new(3.0, 2.0, 3.0), epsilon = EPSILON);
    }

    #[test]
    fn perspective_maps_near_and_far_to_unit_depth() {
        let m = perspective_vk(utils::deg_to_rad(60.0), 16.0 / 9.0, 0.1, 100.0);

        let project = |z: f32| {
            let clip = m * Vec4::new(0.0, 0.0, z, 1.0);
            clip.z / clip.w
        };

        assert_relative_eq!(project(-0.1), 0.0, epsilon = 1e-5);
        assert_relative_eq!(project(-100.0), 1.0, epsilon = 1e-5);
    }
}
