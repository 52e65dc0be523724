//! 3D camera
//!
//! Position/forward/up camera with an orthonormalized basis. The view matrix
//! is the inverse of the camera's world transform; the projection is a
//! Vulkan-clip-space perspective (Y flipped, depth 0..1).

use crate::foundation::math::{perspective_vk, utils, Mat4, Vec3, Vec4};

/// Perspective camera
#[derive(Debug, Clone)]
pub struct Camera {
    /// Camera position in world space
    pub position: Vec3,
    /// Direction the camera looks along (not necessarily normalized)
    pub forward: Vec3,
    /// Up reference used to orthonormalize the basis
    pub up: Vec3,
    /// When set, `forward` tracks this point every frame
    pub follow_target: Option<Vec3>,
    /// Vertical field of view in degrees
    pub fov_degrees: f32,
    /// Viewport aspect ratio (width / height)
    pub aspect: f32,
    /// Near clipping plane
    pub near: f32,
    /// Far clipping plane
    pub far: f32,
}

impl Camera {
    /// Create a camera at `position` looking along `forward`
    pub fn new(position: Vec3, forward: Vec3, fov_degrees: f32, aspect: f32) -> Self {
        Self {
            position,
            forward,
            up: Vec3::new(0.0, 0.0, 1.0),
            follow_target: None,
            fov_degrees,
            aspect,
            near: 0.1,
            far: 100.0,
        }
    }

    /// Point the camera at a world-space target
    pub fn look_at(&mut self, target: Vec3) {
        self.forward = target - self.position;
    }

    /// Refresh `forward` from the follow target, if one is set
    pub fn update_follow(&mut self) {
        if let Some(target) = self.follow_target {
            self.forward = target - self.position;
        }
    }

    /// Orthonormal camera basis: forward, right, corrected up
    fn basis(&self) -> (Vec3, Vec3, Vec3) {
        let forward = self.forward.normalize();
        let right = forward.cross(&self.up).normalize();
        let up = right.cross(&forward);
        (forward, right, up)
    }

    /// World transform of the camera (camera space -> world space).
    /// Camera space is right-handed with the view direction along -Z.
    pub fn world_matrix(&self) -> Mat4 {
        let (forward, right, up) = self.basis();
        Mat4::from_columns(&[
            Vec4::new(right.x, right.y, right.z, 0.0),
            Vec4::new(up.x, up.y, up.z, 0.0),
            Vec4::new(-forward.x, -forward.y, -forward.z, 0.0),
            Vec4::new(self.position.x, self.position.y, self.position.z, 1.0),
        ])
    }

    /// View matrix: the inverse of the world transform, built directly from
    /// the transposed basis to avoid a general inversion.
    pub fn view_matrix(&self) -> Mat4 {
        let (forward, right, up) = self.basis();
        let p = self.position;
        Mat4::from_columns(&[
            Vec4::new(right.x, up.x, -forward.x, 0.0),
            Vec4::new(right.y, up.y, -forward.y, 0.0),
            Vec4::new(right.z, up.z, -forward.z, 0.0),
            Vec4::new(-right.dot(&p), -up.dot(&p), forward.dot(&p), 1.0),
        ])
    }

    /// Projection matrix for the current lens parameters
    pub fn projection_matrix(&self) -> Mat4 {
        perspective_vk(
            utils::deg_to_rad(self.fov_degrees),
            self.aspect,
            self.near,
            self.far,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn basis_is_orthonormal_even_for_skewed_up() {
        let mut camera = Camera::new(
            Vec3::new(-3.0, 0.0, 1.0),
            Vec3::new(1.0, 0.2, -0.1),
            60.0,
            16.0 / 9.0,
        );
        camera.up = Vec3::new(0.1, 0.0, 1.0);

        let world = camera.world_matrix();
        let axis = |c: usize| Vec3::new(world[(0, c)], world[(1, c)], world[(2, c)]);
        let x = axis(0);
        let y = axis(1);
        let z = axis(2);

        assert_relative_eq!(x.norm(), 1.0, epsilon = EPSILON);
        assert_relative_eq!(y.norm(), 1.0, epsilon = EPSILON);
        assert_relative_eq!(z.norm(), 1.0, epsilon = EPSILON);
        assert_relative_eq!(x.dot(&y), 0.0, epsilon = EPSILON);
        assert_relative_eq!(x.dot(&z), 0.0, epsilon = EPSILON);
        assert_relative_eq!(y.dot(&z), 0.0, epsilon = EPSILON);
    }

    #[test]
    fn view_is_the_inverse_of_world() {
        let camera = Camera::new(
            Vec3::new(-3.0, 0.0, 1.0),
            Vec3::new(3.0, 0.0, -1.0),
            60.0,
            1.5,
        );
        let product = camera.view_matrix() * camera.world_matrix();
        assert_relative_eq!(product, Mat4::identity(), epsilon = EPSILON);
    }

    #[test]
    fn camera_looks_down_negative_z_in_view_space() {
        let mut camera = Camera::new(Vec3::new(-3.0, 0.0, 1.0), Vec3::zeros(), 60.0, 1.0);
        camera.look_at(Vec3::zeros());

        // A point in front of the camera lands on the -Z axis in view space.
        let view = camera.view_matrix();
        let target = view * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(target.x, 0.0, epsilon = EPSILON);
        assert_relative_eq!(target.y, 0.0, epsilon = EPSILON);
        assert!(target.z < 0.0);
    }

    #[test]
    fn follow_target_updates_forward() {
        let mut camera = Camera::new(Vec3::zeros(), Vec3::new(1.0, 0.0, 0.0), 60.0, 1.0);
        camera.follow_target = Some(Vec3::new(0.0, 5.0, 0.0));
        camera.update_follow();
        assert_relative_eq!(
            camera.forward.normalize(),
            Vec3::new(0.0, 1.0, 0.0),
            epsilon = EPSILON
        );
    }
}
