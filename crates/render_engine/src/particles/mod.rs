//! GPU-driven particle system
//!
//! Particles live in a device-local storage buffer and are simulated by a
//! compute pass that integrates velocity, probes the scene depth image for
//! collisions, and recycles dead particles from a respawn buffer. Four
//! interchangeable drawing strategies consume the same particle storage:
//! geometry-shader quads, a primitive-restart strip, instanced quads, and
//! mesh-shader quads. The strategy set is closed, so dispatch is an enum.

pub mod emitter;
pub mod geometry_quads;
pub mod instanced_quads;
pub mod mesh_quads;
pub mod restart_strip;

pub use emitter::{EmitterCameraUniform, EmitterCore, RainPush, WORKGROUP_SIZE};
pub use geometry_quads::GeometryQuadEmitter;
pub use instanced_quads::InstancedQuadEmitter;
pub use mesh_quads::MeshQuadEmitter;
pub use restart_strip::RestartStripEmitter;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use rand::Rng;

use crate::foundation::math::{Mat4, Vec3};
use crate::render::vulkan::backend::RenderBackend;
use crate::render::vulkan::image::Image;
use crate::render::vulkan::render_pass::RenderPass;
use crate::render::vulkan::VulkanResult;
use crate::scene::camera::Camera;

/// One particle: 32 bytes, never touched by the host after init.
/// `position.w` is the collision flag; `velocity.w` the remaining lifetime
/// after a collision.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Particle {
    /// xyz position, w = collision flag (0 or 1)
    pub position: [f32; 4],
    /// xyz velocity, w = lifetime after collision in seconds
    pub velocity: [f32; 4],
}

/// Emitter configuration
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Debug name
    pub name: String,
    /// Transform applied to the spawn box
    pub starting_transform: Mat4,
    /// Minimum corner of the spawn box
    pub min_box_extent: Vec3,
    /// Maximum corner of the spawn box
    pub max_box_extent: Vec3,
    /// Minimum starting velocity per axis
    pub min_starting_velocity: Vec3,
    /// Maximum starting velocity per axis
    pub max_starting_velocity: Vec3,
    /// Seconds a particle survives after its collision
    pub lifetime_after_collision: f32,
    /// Path to the billboard texture atlas
    pub texture_atlas_path: String,
    /// Subpass of the main render pass the emitter draws in
    pub subpass_number: u32,
    /// Log per-frame compute timings
    pub profile: bool,
}

/// The four drawing strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawStrategy {
    /// Geometry shader expands each point into a camera-facing quad
    GeometryShader,
    /// Compute writes quad vertices; draw uses a restart-separated strip
    PrimitiveRestart,
    /// A fixed quad instanced per particle
    Instanced,
    /// A mesh shader emits one quad per workgroup
    MeshShader,
}

impl DrawStrategy {
    /// Strategies in UI cycling order
    pub const ALL: [DrawStrategy; 4] = [
        DrawStrategy::GeometryShader,
        DrawStrategy::PrimitiveRestart,
        DrawStrategy::Instanced,
        DrawStrategy::MeshShader,
    ];

    /// The next strategy in the cycle, skipping mesh shading when the device
    /// lacks the extension
    pub fn next(self, mesh_shader_support: bool) -> DrawStrategy {
        let all = Self::ALL;
        let index = all.iter().position(|&s| s == self).unwrap_or(0);
        let next = all[(index + 1) % all.len()];
        if next == DrawStrategy::MeshShader && !mesh_shader_support {
            all[(index + 2) % all.len()]
        } else {
            next
        }
    }
}

/// Seed `count` particles uniformly inside the transformed spawn box with
/// uniformly-distributed velocities.
pub fn seed_particles<R: Rng>(config: &EmitterConfig, count: u32, rng: &mut R) -> Vec<Particle> {
    let mut particles = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let local = Vec3::new(
            sample_range(rng, config.min_box_extent.x, config.max_box_extent.x),
            sample_range(rng, config.min_box_extent.y, config.max_box_extent.y),
            sample_range(rng, config.min_box_extent.z, config.max_box_extent.z),
        );
        let world = config
            .starting_transform
            .transform_point(&nalgebra::Point3::from(local));
        let velocity = Vec3::new(
            sample_range(rng, config.min_starting_velocity.x, config.max_starting_velocity.x),
            sample_range(rng, config.min_starting_velocity.y, config.max_starting_velocity.y),
            sample_range(rng, config.min_starting_velocity.z, config.max_starting_velocity.z),
        );

        particles.push(Particle {
            position: [world.x, world.y, world.z, 0.0],
            velocity: [velocity.x, velocity.y, velocity.z, config.lifetime_after_collision],
        });
    }
    particles
}

fn sample_range<R: Rng>(rng: &mut R, min: f32, max: f32) -> f32 {
    if max > min {
        rng.gen_range(min..max)
    } else {
        min
    }
}

/// Workgroups needed to cover `count` particles; the shader bounds-checks
/// the overhang lanes.
pub fn dispatch_group_count(count: u32) -> u32 {
    count.div_ceil(WORKGROUP_SIZE)
}

/// A particle emitter using one of the four strategies.
///
/// Every variant shares the same compute update and particle storage; only
/// geometry construction differs. Switching strategy rebuilds the swapchain.
pub enum ParticleEmitter {
    /// Geometry-shader quads (with the indirect splash pass)
    GeometryShader(GeometryQuadEmitter),
    /// Primitive-restart strip
    PrimitiveRestart(RestartStripEmitter),
    /// Instanced quads
    Instanced(InstancedQuadEmitter),
    /// Mesh-shader quads
    MeshShader(MeshQuadEmitter),
}

impl ParticleEmitter {
    /// Create an emitter with the given strategy and seed its particles
    pub fn new(
        strategy: DrawStrategy,
        backend: &RenderBackend,
        config: EmitterConfig,
        particle_count: u32,
    ) -> VulkanResult<Self> {
        Ok(match strategy {
            DrawStrategy::GeometryShader => {
                ParticleEmitter::GeometryShader(GeometryQuadEmitter::new(
                    backend,
                    config,
                    particle_count,
                )?)
            }
            DrawStrategy::PrimitiveRestart => {
                ParticleEmitter::PrimitiveRestart(RestartStripEmitter::new(
                    backend,
                    config,
                    particle_count,
                )?)
            }
            DrawStrategy::Instanced => ParticleEmitter::Instanced(InstancedQuadEmitter::new(
                backend,
                config,
                particle_count,
            )?),
            DrawStrategy::MeshShader => ParticleEmitter::MeshShader(MeshQuadEmitter::new(
                backend,
                config,
                particle_count,
            )?),
        })
    }

    /// The strategy this emitter uses
    pub fn strategy(&self) -> DrawStrategy {
        match self {
            ParticleEmitter::GeometryShader(_) => DrawStrategy::GeometryShader,
            ParticleEmitter::PrimitiveRestart(_) => DrawStrategy::PrimitiveRestart,
            ParticleEmitter::Instanced(_) => DrawStrategy::Instanced,
            ParticleEmitter::MeshShader(_) => DrawStrategy::MeshShader,
        }
    }

    /// Build swapchain-dependent state (pipelines, descriptor sets)
    pub fn setup(
        &mut self,
        backend: &mut RenderBackend,
        render_pass: &RenderPass,
        depth_probe: &Image,
        shader_dir: &std::path::Path,
    ) -> VulkanResult<()> {
        match self {
            ParticleEmitter::GeometryShader(e) => e.setup(backend, render_pass, depth_probe, shader_dir),
            ParticleEmitter::PrimitiveRestart(e) => e.setup(backend, render_pass, depth_probe, shader_dir),
            ParticleEmitter::Instanced(e) => e.setup(backend, render_pass, depth_probe, shader_dir),
            ParticleEmitter::MeshShader(e) => e.setup(backend, render_pass, depth_probe, shader_dir),
        }
    }

    /// Refresh the emitter camera uniform for the active image
    pub fn update(&mut self, image_index: usize, camera: &Camera, extent: vk::Extent2D) -> VulkanResult<()> {
        self.core_mut().update_camera(image_index, camera, extent)
    }

    /// Record the frame's compute commands into `cmd`
    pub fn record_compute(
        &mut self,
        cmd: vk::CommandBuffer,
        image_index: usize,
        delta_time: f32,
    ) -> VulkanResult<()> {
        match self {
            ParticleEmitter::GeometryShader(e) => e.record_compute(cmd, image_index, delta_time),
            ParticleEmitter::PrimitiveRestart(e) => e.record_compute(cmd, image_index, delta_time),
            ParticleEmitter::Instanced(e) => e.record_compute(cmd, image_index, delta_time),
            ParticleEmitter::MeshShader(e) => e.record_compute(cmd, image_index, delta_time),
        }
    }

    /// Record the draw secondary for the active image
    pub fn render_frame(
        &mut self,
        image_index: u32,
        pass: &RenderPass,
    ) -> VulkanResult<vk::CommandBuffer> {
        let subpass = self.core().config().subpass_number;
        match self {
            ParticleEmitter::GeometryShader(e) => e.record(image_index, pass, subpass),
            ParticleEmitter::PrimitiveRestart(e) => e.record(image_index, pass, subpass),
            ParticleEmitter::Instanced(e) => e.record(image_index, pass, subpass),
            ParticleEmitter::MeshShader(e) => e.record(image_index, pass, subpass),
        }
    }

    /// Drop swapchain-dependent state before a rebuild
    pub fn cleanup_swapchain_assets(&mut self) {
        match self {
            ParticleEmitter::GeometryShader(e) => e.cleanup_swapchain_assets(),
            ParticleEmitter::PrimitiveRestart(e) => e.cleanup_swapchain_assets(),
            ParticleEmitter::Instanced(e) => e.cleanup_swapchain_assets(),
            ParticleEmitter::MeshShader(e) => e.cleanup_swapchain_assets(),
        }
    }

    fn core(&self) -> &EmitterCore {
        match self {
            ParticleEmitter::GeometryShader(e) => e.core(),
            ParticleEmitter::PrimitiveRestart(e) => e.core(),
            ParticleEmitter::Instanced(e) => e.core(),
            ParticleEmitter::MeshShader(e) => e.core(),
        }
    }

    fn core_mut(&mut self) -> &mut EmitterCore {
        match self {
            ParticleEmitter::GeometryShader(e) => e.core_mut(),
            ParticleEmitter::PrimitiveRestart(e) => e.core_mut(),
            ParticleEmitter::Instanced(e) => e.core_mut(),
            ParticleEmitter::MeshShader(e) => e.core_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_config() -> EmitterConfig {
        EmitterConfig {
            name: "rain".to_string(),
            starting_transform: Mat4::new_translation(&Vec3::new(0.0, 0.0, 10.0)),
            min_box_extent: Vec3::new(-5.0, -5.0, 0.0),
            max_box_extent: Vec3::new(5.0, 5.0, 2.0),
            min_starting_velocity: Vec3::new(-0.1, -0.1, -9.0),
            max_starting_velocity: Vec3::new(0.1, 0.1, -7.0),
            lifetime_after_collision: 0.6,
            texture_atlas_path: String::new(),
            subpass_number: 0,
            profile: false,
        }
    }

    #[test]
    fn particle_is_exactly_32_bytes() {
        assert_eq!(std::mem::size_of::<Particle>(), 32);
    }

    #[test]
    fn seeded_particles_stay_inside_the_transformed_box() {
        let config = test_config();
        let mut rng = StdRng::seed_from_u64(7);
        let particles = seed_particles(&config, 1000, &mut rng);
        assert_eq!(particles.len(), 1000);

        for particle in &particles {
            let [x, y, z, flag] = particle.position;
            assert!((-5.0..=5.0).contains(&x));
            assert!((-5.0..=5.0).contains(&y));
            // Spawn box is translated 10 up by the starting transform.
            assert!((10.0..=12.0).contains(&z));
            assert_eq!(flag, 0.0);

            let [vx, vy, vz, lifetime] = particle.velocity;
            assert!((-0.1..=0.1).contains(&vx));
            assert!((-0.1..=0.1).contains(&vy));
            assert!((-9.0..=-7.0).contains(&vz));
            assert_eq!(lifetime, 0.6);
        }
    }

    #[test]
    fn seeding_is_deterministic_for_a_fixed_seed() {
        let config = test_config();
        let a = seed_particles(&config, 64, &mut StdRng::seed_from_u64(42));
        let b = seed_particles(&config, 64, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn degenerate_box_axes_collapse_to_the_minimum() {
        let mut config = test_config();
        config.min_box_extent = Vec3::new(1.0, 1.0, 1.0);
        config.max_box_extent = Vec3::new(1.0, 1.0, 1.0);
        config.starting_transform = Mat4::identity();
        let particles = seed_particles(&config, 4, &mut StdRng::seed_from_u64(1));
        for particle in &particles {
            assert_eq!(&particle.position[..3], &[1.0, 1.0, 1.0]);
        }
    }

    #[test]
    fn dispatch_covers_every_particle() {
        assert_eq!(dispatch_group_count(0), 0);
        assert_eq!(dispatch_group_count(1), 1);
        assert_eq!(dispatch_group_count(32), 1);
        assert_eq!(dispatch_group_count(33), 2);
        assert_eq!(dispatch_group_count(1024), 32);
        assert_eq!(dispatch_group_count(1000), 32);
    }

    #[test]
    fn strategy_cycle_skips_mesh_without_support() {
        use DrawStrategy::*;
        assert_eq!(GeometryShader.next(true), PrimitiveRestart);
        assert_eq!(Instanced.next(true), MeshShader);
        assert_eq!(Instanced.next(false), GeometryShader);
        assert_eq!(MeshShader.next(true), GeometryShader);
    }
}
