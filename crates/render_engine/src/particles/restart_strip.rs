//! Primitive-restart strategy
//!
//! The compute update writes four billboard vertices per particle into a
//! dedicated vertex buffer; drawing consumes them as one TRIANGLE_STRIP
//! with a prebuilt index stream where every particle's four indices are
//! followed by the 0xFFFFFFFF restart sentinel.

use ash::vk;
use std::path::Path;

use crate::particles::emitter::EmitterCore;
use crate::particles::EmitterConfig;
use crate::render::vulkan::backend::RenderBackend;
use crate::render::vulkan::buffer::Buffer;
use crate::render::vulkan::image::Image;
use crate::render::vulkan::pipeline::FixedFunctionConfig;
use crate::render::vulkan::render_pass::RenderPass;
use crate::render::vulkan::VulkanResult;

/// Restart sentinel for 32-bit index streams
pub const RESTART_INDEX: u32 = 0xFFFF_FFFF;

/// Bytes per compute-written billboard vertex (vec4 position + vec4 uv)
const QUAD_VERTEX_SIZE: u64 = 32;

/// Host-struct layout of the compute-written vertex
const QUAD_VERTEX_STRIDE: u32 = 32;
const QUAD_VERTEX_OFFSETS: [u32; 2] = [0, 16];

/// Build the restart-separated index stream: `[4i, 4i+1, 4i+2, 4i+3, RESTART]`
/// per particle, five indices each.
pub fn build_restart_indices(particle_count: u32) -> Vec<u32> {
    let mut indices = Vec::with_capacity(particle_count as usize * 5);
    for i in 0..particle_count {
        let base = i * 4;
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 3, RESTART_INDEX]);
    }
    indices
}

/// Emitter drawing compute-generated quads through one restart-separated strip
pub struct RestartStripEmitter {
    core: EmitterCore,
    quad_vertices: Buffer,
    strip_indices: Buffer,
}

impl RestartStripEmitter {
    /// Seed particles and build the vertex/index buffers
    pub fn new(
        backend: &RenderBackend,
        config: EmitterConfig,
        particle_count: u32,
    ) -> VulkanResult<Self> {
        let core = EmitterCore::new(backend, config, particle_count)?;
        let device = backend.context().raw_device();
        let memory_properties = *backend.memory_properties();
        let transfer = backend.one_shot();

        // Written by compute each frame, consumed as vertex input.
        let mut quad_vertices = Buffer::new(
            device.clone(),
            &memory_properties,
            "rain_quad_vertices",
            particle_count as u64 * 4 * QUAD_VERTEX_SIZE,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
            false,
        )?;
        quad_vertices.create_texel_view(vk::Format::R32G32B32A32_SFLOAT)?;

        let indices = build_restart_indices(particle_count);
        let index_bytes: &[u8] = bytemuck::cast_slice(&indices);
        let staging = Buffer::new(
            device.clone(),
            &memory_properties,
            "rain_strip_staging",
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
        )?;
        staging.write_data(index_bytes)?;
        let strip_indices = Buffer::new(
            device,
            &memory_properties,
            "rain_strip_indices",
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::INDEX_BUFFER,
            false,
        )?;
        transfer.copy_buffer(&staging, &strip_indices)?;

        Ok(Self {
            core,
            quad_vertices,
            strip_indices,
        })
    }

    /// Build pipelines and descriptor sets. The compute variant gets the
    /// quad vertex buffer bound into set 0 as `vertex_buffer`.
    pub fn setup(
        &mut self,
        backend: &mut RenderBackend,
        render_pass: &RenderPass,
        depth_probe: &Image,
        shader_dir: &Path,
    ) -> VulkanResult<()> {
        let vertex_view = self
            .quad_vertices
            .texel_view()
            .expect("texel view created at construction");
        self.core.setup_compute(
            backend,
            depth_probe,
            shader_dir,
            "rain_update_pr_cp",
            &[("vertex_buffer", vertex_view)],
        )?;
        self.core.setup_graphics(
            backend,
            render_pass,
            shader_dir,
            &["rain_pr_vs", "rain_pr_fs"],
            &FixedFunctionConfig {
                topology: vk::PrimitiveTopology::TRIANGLE_STRIP,
                cull_back_face: false,
                enable_transparency: true,
                enable_primitive_restart: true,
                ..Default::default()
            },
            Some((QUAD_VERTEX_STRIDE, &QUAD_VERTEX_OFFSETS)),
            false,
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

    /// Record the strip draw: five indices per particle
    pub fn record(
        &mut self,
        image_index: u32,
        pass: &RenderPass,
        subpass: u32,
    ) -> VulkanResult<vk::CommandBuffer> {
        let cmd = self.core.begin_draw(image_index, pass, subpass)?;
        let device = self.core.device().clone();
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.quad_vertices.handle()], &[0]);
            device.cmd_bind_index_buffer(cmd, self.strip_indices.handle(), 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cmd, self.core.particle_count() * 5, 1, 0, 0, 0);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_indices_per_particle_with_restart_separators() {
        let indices = build_restart_indices(3);
        assert_eq!(indices.len(), 15);
        assert_eq!(&indices[0..5], &[0, 1, 2, 3, RESTART_INDEX]);
        assert_eq!(&indices[5..10], &[4, 5, 6, 7, RESTART_INDEX]);
        assert_eq!(&indices[10..15], &[8, 9, 10, 11, RESTART_INDEX]);
    }

    #[test]
    fn empty_emitter_builds_an_empty_stream() {
        assert!(build_restart_indices(0).is_empty());
    }
}
