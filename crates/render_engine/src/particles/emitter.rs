//! Shared emitter machinery
//!
//! Every drawing strategy owns an [`EmitterCore`]: the particle and respawn
//! storage buffers (device-local, texel-addressable), the texture atlas, the
//! per-frame camera uniform, and the compute pipeline that integrates and
//! collides particles against the scene depth image. Strategies differ only
//! in how they turn the particle storage into triangles.

use ash::{vk, Device};
use bytemuck::{Pod, Zeroable};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;

use crate::particles::{dispatch_group_count, seed_particles, EmitterConfig};
use crate::render::vulkan::backend::RenderBackend;
use crate::render::vulkan::buffer::{Buffer, UniformBuffer};
use crate::render::vulkan::commands;
use crate::render::vulkan::descriptors::PoolUsage;
use crate::render::vulkan::image::Image;
use crate::render::vulkan::pipeline::{FixedFunctionConfig, Pipeline};
use crate::render::vulkan::render_pass::RenderPass;
use crate::render::vulkan::shader::ShaderModule;
use crate::render::vulkan::{VulkanError, VulkanResult};
use crate::scene::camera::Camera;

/// Compute workgroup width; dispatches are ceil(count / 32)
pub const WORKGROUP_SIZE: u32 = 32;

/// Fixed seed so every strategy starts from the same particle distribution
const SEED: u64 = 0x7a11_5eed;

/// Camera block consumed by the rain update shader
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EmitterCameraUniform {
    /// Scene view matrix
    pub view: [[f32; 4]; 4],
    /// Scene projection matrix
    pub proj: [[f32; 4]; 4],
    /// Framebuffer extent in xy, zw unused
    pub extent: [f32; 4],
}

/// Push constants of the rain update shader
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RainPush {
    /// Number of live particles; lanes beyond it exit early
    pub particles_count: u32,
    /// Frame delta time in seconds
    pub delta_time_s: f32,
}

/// State shared by all four strategies
pub struct EmitterCore {
    device: Device,
    command_pool: vk::CommandPool,
    config: EmitterConfig,
    particle_count: u32,

    particle_buffer: Buffer,
    respawn_buffer: Buffer,
    atlas: Image,

    camera_uniform: Option<UniformBuffer<EmitterCameraUniform>>,
    compute_pipeline: Option<Pipeline>,
    compute_static_set: Option<vk::DescriptorSet>,
    compute_frame_sets: Vec<vk::DescriptorSet>,

    graphics_pipeline: Option<Pipeline>,
    graphics_frame_sets: Vec<vk::DescriptorSet>,
    atlas_set: Option<vk::DescriptorSet>,
    secondary_buffers: Vec<vk::CommandBuffer>,
}

impl EmitterCore {
    /// Seed the particle storage and load the atlas. Swapchain-independent.
    pub fn new(
        backend: &RenderBackend,
        config: EmitterConfig,
        particle_count: u32,
    ) -> VulkanResult<Self> {
        let device = backend.context().raw_device();
        let memory_properties = *backend.memory_properties();
        let transfer = backend.one_shot();

        let mut rng = StdRng::seed_from_u64(SEED);
        let particles = seed_particles(&config, particle_count, &mut rng);
        let bytes: &[u8] = bytemuck::cast_slice(&particles);

        let staging = Buffer::new(
            device.clone(),
            &memory_properties,
            &format!("{}_staging", config.name),
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
        )?;
        staging.write_data(bytes)?;

        let usage = vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST;

        let mut particle_buffer = Buffer::new(
            device.clone(),
            &memory_properties,
            &format!("{}_particles", config.name),
            bytes.len() as vk::DeviceSize,
            usage,
            false,
        )?;
        particle_buffer.create_texel_view(vk::Format::R32G32B32A32_SFLOAT)?;
        transfer.copy_buffer(&staging, &particle_buffer)?;

        // The respawn buffer holds the pristine initial state so the shader
        // can recycle expired particles without host involvement.
        let mut respawn_buffer = Buffer::new(
            device.clone(),
            &memory_properties,
            &format!("{}_respawn", config.name),
            bytes.len() as vk::DeviceSize,
            usage,
            false,
        )?;
        respawn_buffer.create_texel_view(vk::Format::R32G32B32A32_SFLOAT)?;
        transfer.copy_buffer(&staging, &respawn_buffer)?;

        let atlas = if config.texture_atlas_path.is_empty() {
            Image::solid_color(
                device.clone(),
                &memory_properties,
                &transfer,
                "atlas_fallback",
                [255, 255, 255, 255],
            )?
        } else {
            let decoded = image::open(&config.texture_atlas_path)
                .map_err(|e| {
                    VulkanError::InitializationFailed(format!(
                        "failed to decode atlas '{}': {}",
                        config.texture_atlas_path, e
                    ))
                })?
                .to_rgba8();
            Image::sampled_from_pixels(
                device.clone(),
                &memory_properties,
                &transfer,
                "texture_atlas",
                decoded.as_raw(),
                decoded.width(),
                decoded.height(),
                true,
                1.0,
            )?
        };

        log::info!(
            "Emitter '{}': {} particles seeded",
            config.name,
            particle_count
        );

        Ok(Self {
            device,
            command_pool: backend.command_pool(),
            config,
            particle_count,
            particle_buffer,
            respawn_buffer,
            atlas,
            camera_uniform: None,
            compute_pipeline: None,
            compute_static_set: None,
            compute_frame_sets: Vec::new(),
            graphics_pipeline: None,
            graphics_frame_sets: Vec::new(),
            atlas_set: None,
            secondary_buffers: Vec::new(),
        })
    }

    /// Build the compute pipeline for `program` and its descriptor sets.
    /// `extra_texel_views` lets the restart-strip variant bind its quad
    /// vertex buffer into set 0 under its reflected name.
    pub fn setup_compute(
        &mut self,
        backend: &mut RenderBackend,
        depth_probe: &Image,
        shader_dir: &Path,
        program: &str,
        extra_texel_views: &[(&str, vk::BufferView)],
    ) -> VulkanResult<()> {
        let device = self.device.clone();
        let memory_properties = *backend.memory_properties();
        let image_count = backend.swapchain().image_count() as usize;

        self.camera_uniform = Some(UniformBuffer::new(
            device.clone(),
            &memory_properties,
            &format!("{}_camera", self.config.name),
            image_count,
        )?);

        let shader = ShaderModule::load(device.clone(), shader_dir, program)?;
        let pipeline = Pipeline::compute(device, &shader)?;

        let usage = pipeline.pool_usage(image_count as u32);
        let static_set = backend
            .descriptors()
            .allocate(&[pipeline.set_layout(0)?], &usage)?[0];
        let frame_layouts = vec![pipeline.set_layout(1)?; image_count];
        let frame_sets = backend
            .descriptors()
            .allocate(&frame_layouts, &PoolUsage::default())?;

        let particle_view = self
            .particle_buffer
            .texel_view()
            .ok_or_else(|| VulkanError::ResourceCreation("particle buffer has no view".into()))?;
        let respawn_view = self
            .respawn_buffer
            .texel_view()
            .ok_or_else(|| VulkanError::ResourceCreation("respawn buffer has no view".into()))?;
        pipeline.write_texel_buffer(static_set, 0, "particle_buffer", particle_view)?;
        pipeline.write_texel_buffer(static_set, 0, "respawn_buffer", respawn_view)?;
        for (name, view) in extra_texel_views {
            pipeline.write_texel_buffer(static_set, 0, name, *view)?;
        }

        let camera_uniform = self.camera_uniform.as_ref().expect("created above");
        for (image, &set) in frame_sets.iter().enumerate() {
            pipeline.write_uniform_buffer(
                set,
                1,
                "camera",
                camera_uniform.handle(image),
                camera_uniform.block_size(),
            )?;
            pipeline.write_storage_image(set, 1, "scene_depth_buffer", depth_probe.sampler_view())?;
        }

        self.compute_pipeline = Some(pipeline);
        self.compute_static_set = Some(static_set);
        self.compute_frame_sets = frame_sets;
        Ok(())
    }

    /// Build the strategy's graphics pipeline and descriptor sets. When
    /// `bind_particle_texel` is set, the particle texel view is written into
    /// the per-frame set under `particle_buffer` (instancing and mesh paths
    /// fetch poses in the shader instead of reading vertex attributes).
    #[allow(clippy::too_many_arguments)]
    pub fn setup_graphics(
        &mut self,
        backend: &mut RenderBackend,
        render_pass: &RenderPass,
        shader_dir: &Path,
        shader_names: &[&str],
        config: &FixedFunctionConfig,
        host_vertex_layout: Option<(u32, &[u32])>,
        bind_particle_texel: bool,
    ) -> VulkanResult<()> {
        let device = self.device.clone();
        let image_count = backend.swapchain().image_count() as usize;

        let mut shaders = Vec::with_capacity(shader_names.len());
        for name in shader_names {
            shaders.push(ShaderModule::load(device.clone(), shader_dir, name)?);
        }
        let shader_refs: Vec<&ShaderModule> = shaders.iter().collect();

        let is_mesh = shader_refs
            .iter()
            .any(|s| s.stage() == vk::ShaderStageFlags::MESH_EXT);
        let pipeline = if is_mesh {
            Pipeline::mesh(
                device,
                &shader_refs,
                render_pass,
                self.config.subpass_number,
                config,
            )?
        } else {
            Pipeline::graphics(
                device,
                &shader_refs,
                render_pass,
                self.config.subpass_number,
                config,
                host_vertex_layout,
            )?
        };

        let usage = pipeline.pool_usage(image_count as u32 + 1);
        let frame_layouts = vec![pipeline.set_layout(0)?; image_count];
        let frame_sets = backend.descriptors().allocate(&frame_layouts, &usage)?;
        let atlas_set = backend
            .descriptors()
            .allocate(&[pipeline.set_layout(1)?], &PoolUsage::default())?[0];

        let camera_uniform = self.camera_uniform.as_ref().ok_or_else(|| {
            VulkanError::ResourceCreation("setup_compute must run before setup_graphics".into())
        })?;
        for (image, &set) in frame_sets.iter().enumerate() {
            pipeline.write_uniform_buffer(
                set,
                0,
                "view_proj",
                camera_uniform.handle(image),
                camera_uniform.block_size(),
            )?;
            if bind_particle_texel {
                let view = self.particle_buffer.texel_view().ok_or_else(|| {
                    VulkanError::ResourceCreation("particle buffer has no view".into())
                })?;
                pipeline.write_texel_buffer(set, 0, "particle_buffer", view)?;
            }
        }

        let sampler = self.atlas.sampler().ok_or_else(|| {
            VulkanError::ResourceCreation("atlas image has no sampler".into())
        })?;
        pipeline.write_combined_image(
            atlas_set,
            1,
            "texture_atlas",
            self.atlas.sampler_view(),
            sampler,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        self.secondary_buffers = commands::allocate_secondary_buffers(
            &self.device,
            self.command_pool,
            image_count as u32,
        )?;
        self.graphics_pipeline = Some(pipeline);
        self.graphics_frame_sets = frame_sets;
        self.atlas_set = Some(atlas_set);
        Ok(())
    }

    /// Refresh the camera uniform for the image about to be simulated
    pub fn update_camera(
        &mut self,
        image_index: usize,
        camera: &Camera,
        extent: vk::Extent2D,
    ) -> VulkanResult<()> {
        if let Some(uniform) = &self.camera_uniform {
            uniform.update(
                image_index,
                &EmitterCameraUniform {
                    view: camera.view_matrix().into(),
                    proj: camera.projection_matrix().into(),
                    extent: [extent.width as f32, extent.height as f32, 0.0, 0.0],
                },
            )?;
        }
        Ok(())
    }

    /// Bind the compute pipeline and dispatch the rain update. Strategies
    /// with extra descriptor sets (the geometry-shader splash set) append
    /// them after sets 0 and 1.
    pub fn record_dispatch(
        &self,
        cmd: vk::CommandBuffer,
        image_index: usize,
        delta_time: f32,
        extra_sets: &[vk::DescriptorSet],
    ) -> VulkanResult<()> {
        let pipeline = self
            .compute_pipeline
            .as_ref()
            .ok_or_else(|| VulkanError::ResourceCreation("compute pipeline not built".into()))?;
        let static_set = self
            .compute_static_set
            .ok_or_else(|| VulkanError::ResourceCreation("compute sets not allocated".into()))?;

        let mut sets = vec![static_set, self.compute_frame_sets[image_index]];
        sets.extend_from_slice(extra_sets);
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.handle());
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout(),
                0,
                &sets,
                &[],
            );
        }
        pipeline.push(
            cmd,
            "rain",
            &RainPush {
                particles_count: self.particle_count,
                delta_time_s: delta_time,
            },
        )?;
        let groups = dispatch_group_count(self.particle_count);
        if self.config.profile {
            log::trace!(
                "emitter '{}': dispatching {} groups for {} particles (dt {:.4}s)",
                self.config.name,
                groups,
                self.particle_count,
                delta_time
            );
        }
        unsafe {
            self.device.cmd_dispatch(cmd, groups, 1, 1);
        }
        Ok(())
    }

    /// Begin the strategy's secondary draw buffer: pipeline and shared sets
    /// bound, atlas at set 1.
    pub fn begin_draw(
        &self,
        image_index: u32,
        pass: &RenderPass,
        subpass: u32,
    ) -> VulkanResult<vk::CommandBuffer> {
        let image = image_index as usize;
        let cmd = self.secondary_buffers[image];
        let pipeline = self
            .graphics_pipeline
            .as_ref()
            .ok_or_else(|| VulkanError::ResourceCreation("graphics pipeline not built".into()))?;
        let atlas_set = self
            .atlas_set
            .ok_or_else(|| VulkanError::ResourceCreation("atlas set not allocated".into()))?;

        commands::begin_secondary(&self.device, cmd, pass.handle(), subpass, pass.framebuffer(image))?;
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.handle());
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout(),
                0,
                &[self.graphics_frame_sets[image], atlas_set],
                &[],
            );
        }
        Ok(cmd)
    }

    /// Finish a secondary draw buffer
    pub fn end_draw(&self, cmd: vk::CommandBuffer) -> VulkanResult<()> {
        unsafe {
            self.device
                .end_command_buffer(cmd)
                .map_err(VulkanError::Api)
        }
    }

    /// Drop swapchain-dependent state. Particle storage, the respawn buffer
    /// and the atlas survive.
    pub fn cleanup_swapchain_assets(&mut self) {
        if !self.secondary_buffers.is_empty() {
            unsafe {
                self.device
                    .free_command_buffers(self.command_pool, &self.secondary_buffers);
            }
            self.secondary_buffers.clear();
        }
        self.graphics_pipeline = None;
        self.compute_pipeline = None;
        self.camera_uniform = None;
        self.compute_static_set = None;
        self.compute_frame_sets.clear();
        self.graphics_frame_sets.clear();
        self.atlas_set = None;
    }

    /// Emitter configuration
    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    /// Number of particles
    pub fn particle_count(&self) -> u32 {
        self.particle_count
    }

    /// The particle storage buffer
    pub fn particle_buffer(&self) -> &Buffer {
        &self.particle_buffer
    }

    /// The texture atlas image
    pub fn atlas(&self) -> &Image {
        &self.atlas
    }

    /// The per-frame camera uniform, once setup_compute has run
    pub fn camera_uniform(&self) -> Option<&UniformBuffer<EmitterCameraUniform>> {
        self.camera_uniform.as_ref()
    }

    /// The device handle
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The compute pipeline, once built
    pub fn compute_pipeline(&self) -> Option<&Pipeline> {
        self.compute_pipeline.as_ref()
    }

    /// The graphics pipeline, once built
    pub fn graphics_pipeline(&self) -> Option<&Pipeline> {
        self.graphics_pipeline.as_ref()
    }
}
