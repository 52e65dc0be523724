//! Scene lighting state
//!
//! One point light plus an ambient term; refreshed into the scene uniform
//! every frame.

use crate::foundation::math::Vec3;

/// Light parameters for the scene uniform
#[derive(Debug, Clone)]
pub struct Light {
    /// Light position in world space
    pub position: Vec3,
    /// Scalar intensity of the point light
    pub intensity: f32,
    /// Scalar ambient intensity applied to every fragment
    pub ambient_intensity: f32,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 10.0),
            intensity: 40.0,
            ambient_intensity: 0.1,
        }
    }
}
