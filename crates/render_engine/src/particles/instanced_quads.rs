//! Instanced-quad strategy
//!
//! A fixed four-vertex quad is drawn once per particle with
//! `draw_indexed(4, N)`. The vertex shader reads the particle pose from the
//! storage texel buffer indexed by `gl_InstanceIndex`, so the per-vertex
//! data never changes.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::path::Path;

use crate::particles::emitter::EmitterCore;
use crate::particles::EmitterConfig;
use crate::render::vulkan::backend::RenderBackend;
use crate::render::vulkan::buffer::Buffer;
use crate::render::vulkan::image::Image;
use crate::render::vulkan::pipeline::FixedFunctionConfig;
use crate::render::vulkan::render_pass::RenderPass;
use crate::render::vulkan::VulkanResult;

/// One corner of the fixed quad
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QuadVertex {
    /// Corner offset in quad space
    pub corner: [f32; 2],
    /// Atlas UV
    pub uv: [f32; 2],
}

impl QuadVertex {
    /// Stride of the quad vertex
    pub const STRIDE: u32 = std::mem::size_of::<QuadVertex>() as u32;
    /// Attribute offsets in location order
    pub const OFFSETS: [u32; 2] = [0, 8];
}

/// The four corners of a unit quad, strip order
pub const QUAD_CORNERS: [QuadVertex; 4] = [
    QuadVertex { corner: [-0.5, -0.5], uv: [0.0, 1.0] },
    QuadVertex { corner: [0.5, -0.5], uv: [1.0, 1.0] },
    QuadVertex { corner: [-0.5, 0.5], uv: [0.0, 0.0] },
    QuadVertex { corner: [0.5, 0.5], uv: [1.0, 0.0] },
];

/// Emitter drawing a fixed quad N times
pub struct InstancedQuadEmitter {
    core: EmitterCore,
    quad_vertices: Buffer,
    quad_indices: Buffer,
}

impl InstancedQuadEmitter {
    /// Seed particles and build the fixed quad geometry
    pub fn new(
        backend: &RenderBackend,
        config: EmitterConfig,
        particle_count: u32,
    ) -> VulkanResult<Self> {
        let core = EmitterCore::new(backend, config, particle_count)?;
        let device = backend.context().raw_device();
        let memory_properties = *backend.memory_properties();
        let transfer = backend.one_shot();

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&QUAD_CORNERS);
        let staging = Buffer::new(
            device.clone(),
            &memory_properties,
            "quad_staging",
            vertex_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
        )?;
        staging.write_data(vertex_bytes)?;
        let quad_vertices = Buffer::new(
            device.clone(),
            &memory_properties,
            "quad_vertices",
            vertex_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER,
            false,
        )?;
        transfer.copy_buffer(&staging, &quad_vertices)?;

        let indices: [u32; 4] = [0, 1, 2, 3];
        let index_bytes: &[u8] = bytemuck::cast_slice(&indices);
        let staging = Buffer::new(
            device.clone(),
            &memory_properties,
            "quad_index_staging",
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
        )?;
        staging.write_data(index_bytes)?;
        let quad_indices = Buffer::new(
            device,
            &memory_properties,
            "quad_indices",
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::INDEX_BUFFER,
            false,
        )?;
        transfer.copy_buffer(&staging, &quad_indices)?;

        Ok(Self {
            core,
            quad_vertices,
            quad_indices,
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
            &["rain_inst_vs", "rain_inst_fs"],
            &FixedFunctionConfig {
                topology: vk::PrimitiveTopology::TRIANGLE_STRIP,
                cull_back_face: false,
                enable_transparency: true,
                ..Default::default()
            },
            Some((QuadVertex::STRIDE, &QuadVertex::OFFSETS)),
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

    /// Record the instanced draw
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
            device.cmd_bind_index_buffer(cmd, self.quad_indices.handle(), 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cmd, 4, self.core.particle_count(), 0, 0, 0);
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
