//! Mesh-shader strategy
//!
//! One workgroup per particle: the mesh shader fetches the pose via
//! `gl_WorkGroupID` from the particle texel buffer and emits a four-vertex
//! quad. Unavailable when the device lacks VK_EXT_mesh_shader; the UI skips
//! this strategy in that case.

use ash::extensions::ext::MeshShader;
use ash::vk;
use std::path::Path;

use crate::particles::emitter::EmitterCore;
use crate::particles::EmitterConfig;
use crate::render::vulkan::backend::RenderBackend;
use crate::render::vulkan::image::Image;
use crate::render::vulkan::pipeline::FixedFunctionConfig;
use crate::render::vulkan::render_pass::RenderPass;
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Emitter drawing quads from a mesh shader
pub struct MeshQuadEmitter {
    core: EmitterCore,
    mesh_loader: MeshShader,
}

impl MeshQuadEmitter {
    /// Seed particles; fails when the extension is unavailable
    pub fn new(
        backend: &RenderBackend,
        config: EmitterConfig,
        particle_count: u32,
    ) -> VulkanResult<Self> {
        let mesh_loader = backend
            .context()
            .device
            .mesh_shader_loader
            .clone()
            .ok_or_else(|| {
                VulkanError::InitializationFailed(
                    "mesh-shader strategy requires VK_EXT_mesh_shader".to_string(),
                )
            })?;

        Ok(Self {
            core: EmitterCore::new(backend, config, particle_count)?,
            mesh_loader,
        })
    }

    /// Build pipelines and descriptor sets
    pub fn setup(
        &mut self,
        backend: &mut RenderBackend,
        render_pass: &RenderPass,
        depth_probe: &Image,
        shader_dir: &Path,
    ) -> VulkanResult<()> {
        self.core
            .setup_compute(backend, depth_probe, shader_dir, "rain_update_cp", &[])?;
        self.core.setup_graphics(
            backend,
            render_pass,
            shader_dir,
            &["rain_mesh_ms", "rain_mesh_fs"],
            &FixedFunctionConfig {
                cull_back_face: false,
                enable_transparency: true,
                ..Default::default()
            },
            None,
            true,
        )
    }

    /// Record the frame's compute update
    pub fn record_compute(
        &mut self,
        cmd: vk::CommandBuffer,
        image_index: usize,
        delta_time: f32,
    ) -> VulkanResult<()> {
        self.core.record_dispatch(cmd, image_index, delta_time, &[])
    }

    /// Record the mesh-task draw: one workgroup per particle
    pub fn record(
        &mut self,
        image_index: u32,
        pass: &RenderPass,
        subpass: u32,
    ) -> VulkanResult<vk::CommandBuffer> {
        let cmd = self.core.begin_draw(image_index, pass, subpass)?;
        unsafe {
            self.mesh_loader
                .cmd_draw_mesh_tasks(cmd, self.core.particle_count(), 1, 1);
        }
        self.core.end_draw(cmd)?;
        Ok(cmd)
    }

    /// Drop swapchain-dependent state
    pub fn cleanup_swapchain_assets(&mut self) {
        self.core.cleanup_swapchain_assets();
    }

    /// Shared emitter state
    pub fn core(&self) -> &EmitterCore {
        &self.core
    }

    /// Shared emitter state, mutable
    pub fn core_mut(&mut self) -> &mut EmitterCore {
        &mut self.core
    }
}
