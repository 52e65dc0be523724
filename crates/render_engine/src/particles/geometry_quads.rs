//! Geometry-shader strategy
//!
//! Rain is drawn as a point list; the geometry shader expands each point
//! into a camera-facing quad. This is also the strategy that spawns
//! secondary splash particles: the rain update writes a hint record per
//! collision and atomically bumps an indirect-dispatch count, then a second
//! compute pass sized by that count ages the splashes and fills an indirect
//! draw command consumed during rendering.

use ash::vk;
use std::path::Path;

use crate::particles::emitter::EmitterCore;
use crate::particles::EmitterConfig;
use crate::render::vulkan::backend::RenderBackend;
use crate::render::vulkan::buffer::Buffer;
use crate::render::vulkan::descriptors::PoolUsage;
use crate::render::vulkan::image::Image;
use crate::render::vulkan::pipeline::{FixedFunctionConfig, Pipeline};
use crate::render::vulkan::render_pass::RenderPass;
use crate::render::vulkan::shader::ShaderModule;
use crate::render::vulkan::{VulkanError, VulkanResult};

/// One splash hint: collision point and surface fade state, same texel
/// layout as a particle (2x RGBA32F)
const SPLASH_HINT_SIZE: u64 = 32;

/// Emitter drawing rain through the geometry shader, with splashes
pub struct GeometryQuadEmitter {
    core: EmitterCore,

    // Swapchain-independent splash storage.
    splash_hints: Buffer,
    splash_dispatch: Buffer,
    splash_draw: Buffer,
    dispatch_reset: Buffer,
    draw_reset: Buffer,

    // Swapchain-dependent splash pipelines and sets.
    rain_splash_set: Option<vk::DescriptorSet>,
    splash_compute: Option<Pipeline>,
    splash_compute_set: Option<vk::DescriptorSet>,
    splash_graphics: Option<Pipeline>,
    splash_frame_sets: Vec<vk::DescriptorSet>,
    splash_atlas_set: Option<vk::DescriptorSet>,
}

impl GeometryQuadEmitter {
    /// Seed particles and allocate the splash buffers
    pub fn new(
        backend: &RenderBackend,
        config: EmitterConfig,
        particle_count: u32,
    ) -> VulkanResult<Self> {
        let core = EmitterCore::new(backend, config, particle_count)?;
        let device = backend.context().raw_device();
        let memory_properties = *backend.memory_properties();

        // At most one splash per rain particle per frame.
        let mut splash_hints = Buffer::new(
            device.clone(),
            &memory_properties,
            "splash_hints",
            particle_count as u64 * SPLASH_HINT_SIZE,
            vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
            false,
        )?;
        splash_hints.create_texel_view(vk::Format::R32G32B32A32_SFLOAT)?;

        let splash_dispatch = Buffer::new(
            device.clone(),
            &memory_properties,
            "splash_dispatch",
            std::mem::size_of::<vk::DispatchIndirectCommand>() as u64,
            vk::BufferUsageFlags::INDIRECT_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            false,
        )?;
        let splash_draw = Buffer::new(
            device.clone(),
            &memory_properties,
            "splash_draw",
            std::mem::size_of::<vk::DrawIndirectCommand>() as u64,
            vk::BufferUsageFlags::INDIRECT_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            false,
        )?;

        // Prefilled reset payloads copied over the indirect buffers at the
        // top of every compute submission.
        let dispatch_reset = Buffer::new(
            device.clone(),
            &memory_properties,
            "splash_dispatch_reset",
            std::mem::size_of::<vk::DispatchIndirectCommand>() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
        )?;
        dispatch_reset.write_data(&[0u32, 1, 1])?;

        let draw_reset = Buffer::new(
            device,
            &memory_properties,
            "splash_draw_reset",
            std::mem::size_of::<vk::DrawIndirectCommand>() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
        )?;
        draw_reset.write_data(&[0u32, 1, 0, 0])?;

        Ok(Self {
            core,
            splash_hints,
            splash_dispatch,
            splash_draw,
            dispatch_reset,
            draw_reset,
            rain_splash_set: None,
            splash_compute: None,
            splash_compute_set: None,
            splash_graphics: None,
            splash_frame_sets: Vec::new(),
            splash_atlas_set: None,
        })
    }

    /// Build the rain and splash pipelines and their descriptor sets
    pub fn setup(
        &mut self,
        backend: &mut RenderBackend,
        render_pass: &RenderPass,
        depth_probe: &Image,
        shader_dir: &Path,
    ) -> VulkanResult<()> {
        let device = backend.context().raw_device();

        self.core
            .setup_compute(backend, depth_probe, shader_dir, "rain_update_gs_cp", &[])?;

        // Set 2 of the rain update: the splash plumbing.
        let rain_pipeline = self
            .core
            .compute_pipeline()
            .ok_or_else(|| VulkanError::ResourceCreation("rain pipeline missing".into()))?;
        let usage = rain_pipeline.pool_usage(1);
        let rain_splash_set = backend
            .descriptors()
            .allocate(&[rain_pipeline.set_layout(2)?], &usage)?[0];
        rain_pipeline.write_storage_buffer(
            rain_splash_set,
            2,
            "splashes_dispatch",
            self.splash_dispatch.handle(),
            self.splash_dispatch.size(),
        )?;
        rain_pipeline.write_storage_buffer(
            rain_splash_set,
            2,
            "splashes_draw",
            self.splash_draw.handle(),
            self.splash_draw.size(),
        )?;
        rain_pipeline.write_storage_buffer(
            rain_splash_set,
            2,
            "splashes",
            self.splash_hints.handle(),
            self.splash_hints.size(),
        )?;
        self.rain_splash_set = Some(rain_splash_set);

        // The splash update pass, dispatched indirectly.
        let splash_shader = ShaderModule::load(device.clone(), shader_dir, "splash_update_cp")?;
        let splash_compute = Pipeline::compute(device, &splash_shader)?;
        let usage = splash_compute.pool_usage(1);
        let splash_compute_set = backend
            .descriptors()
            .allocate(&[splash_compute.set_layout(0)?], &usage)?[0];
        splash_compute.write_storage_buffer(
            splash_compute_set,
            0,
            "splashes_dispatch",
            self.splash_dispatch.handle(),
            self.splash_dispatch.size(),
        )?;
        splash_compute.write_storage_buffer(
            splash_compute_set,
            0,
            "splashes_draw",
            self.splash_draw.handle(),
            self.splash_draw.size(),
        )?;
        splash_compute.write_storage_buffer(
            splash_compute_set,
            0,
            "splashes",
            self.splash_hints.handle(),
            self.splash_hints.size(),
        )?;
        self.splash_compute = Some(splash_compute);
        self.splash_compute_set = Some(splash_compute_set);

        // Rain graphics: points expanded by the geometry shader, pose read
        // from the particle texel buffer.
        self.core.setup_graphics(
            backend,
            render_pass,
            shader_dir,
            &["rain_gs_vs", "rain_gs_gs", "rain_gs_fs"],
            &FixedFunctionConfig {
                topology: vk::PrimitiveTopology::POINT_LIST,
                cull_back_face: false,
                enable_transparency: true,
                ..Default::default()
            },
            None,
            true,
        )?;

        self.setup_splash_graphics(backend, render_pass, shader_dir)
    }

    fn setup_splash_graphics(
        &mut self,
        backend: &mut RenderBackend,
        render_pass: &RenderPass,
        shader_dir: &Path,
    ) -> VulkanResult<()> {
        let device = backend.context().raw_device();
        let image_count = backend.swapchain().image_count() as usize;

        let mut shaders = Vec::new();
        for name in ["splash_vs", "splash_gs", "splash_fs"] {
            shaders.push(ShaderModule::load(device.clone(), shader_dir, name)?);
        }
        let shader_refs: Vec<&ShaderModule> = shaders.iter().collect();
        let pipeline = Pipeline::graphics(
            device,
            &shader_refs,
            render_pass,
            self.core.config().subpass_number,
            &FixedFunctionConfig {
                topology: vk::PrimitiveTopology::POINT_LIST,
                cull_back_face: false,
                enable_transparency: true,
                ..Default::default()
            },
            None,
        )?;

        let usage = pipeline.pool_usage(image_count as u32 + 1);
        let frame_layouts = vec![pipeline.set_layout(0)?; image_count];
        let frame_sets = backend.descriptors().allocate(&frame_layouts, &usage)?;
        let atlas_set = backend
            .descriptors()
            .allocate(&[pipeline.set_layout(1)?], &PoolUsage::default())?[0];

        let hints_view = self
            .splash_hints
            .texel_view()
            .ok_or_else(|| VulkanError::ResourceCreation("splash hints have no view".into()))?;
        let camera = self.core.camera_uniform().ok_or_else(|| {
            VulkanError::ResourceCreation("setup_compute must run before splash graphics".into())
        })?;
        for (image, &set) in frame_sets.iter().enumerate() {
            pipeline.write_uniform_buffer(set, 0, "view_proj", camera.handle(image), camera.block_size())?;
            pipeline.write_texel_buffer(set, 0, "splashes", hints_view)?;
        }

        let atlas = self.core.atlas();
        let sampler = atlas.sampler().ok_or_else(|| {
            VulkanError::ResourceCreation("atlas image has no sampler".into())
        })?;
        pipeline.write_combined_image(
            atlas_set,
            1,
            "texture_atlas",
            atlas.sampler_view(),
            sampler,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        self.splash_graphics = Some(pipeline);
        self.splash_frame_sets = frame_sets;
        self.splash_atlas_set = Some(atlas_set);
        Ok(())
    }

    /// Record the frame's compute commands: reset the indirect buffers, run
    /// the rain update, then the indirectly-sized splash update.
    pub fn record_compute(
        &mut self,
        cmd: vk::CommandBuffer,
        image_index: usize,
        delta_time: f32,
    ) -> VulkanResult<()> {
        let device = self.core.device().clone();
        let rain_splash_set = self
            .rain_splash_set
            .ok_or_else(|| VulkanError::ResourceCreation("splash sets not allocated".into()))?;
        let splash_compute = self
            .splash_compute
            .as_ref()
            .ok_or_else(|| VulkanError::ResourceCreation("splash pipeline not built".into()))?;
        let splash_compute_set = self
            .splash_compute_set
            .ok_or_else(|| VulkanError::ResourceCreation("splash sets not allocated".into()))?;

        unsafe {
            // Reset the indirect counts from the prefilled buffers, and make
            // the writes visible to the compute stage before the rain update
            // starts bumping them.
            let copy = vk::BufferCopy::builder()
                .size(self.splash_dispatch.size())
                .build();
            device.cmd_copy_buffer(
                cmd,
                self.dispatch_reset.handle(),
                self.splash_dispatch.handle(),
                &[copy],
            );
            let copy = vk::BufferCopy::builder().size(self.splash_draw.size()).build();
            device.cmd_copy_buffer(cmd, self.draw_reset.handle(), self.splash_draw.handle(), &[copy]);

            let reset_barriers = [
                buffer_barrier(
                    &self.splash_dispatch,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                ),
                buffer_barrier(
                    &self.splash_draw,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                ),
            ];
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &reset_barriers,
                &[],
            );
        }

        self.core
            .record_dispatch(cmd, image_index, delta_time, &[rain_splash_set])?;

        unsafe {
            // The splash dispatch consumes the count the rain update wrote;
            // the hints the rain wrote become the splash pass's input.
            let barriers = [
                buffer_barrier(
                    &self.splash_dispatch,
                    vk::AccessFlags::SHADER_WRITE,
                    // Read both as the indirect parameter and as an SSBO
                    // bounds check inside the splash shader.
                    vk::AccessFlags::INDIRECT_COMMAND_READ | vk::AccessFlags::SHADER_READ,
                ),
                buffer_barrier(
                    &self.splash_hints,
                    vk::AccessFlags::SHADER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                ),
            ];
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &barriers,
                &[],
            );

            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                splash_compute.handle(),
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                splash_compute.layout(),
                0,
                &[splash_compute_set],
                &[],
            );
            device.cmd_dispatch_indirect(cmd, self.splash_dispatch.handle(), 0);
        }
        Ok(())
    }

    /// Record the rain draw followed by the indirect splash draw
    pub fn record(
        &mut self,
        image_index: u32,
        pass: &RenderPass,
        subpass: u32,
    ) -> VulkanResult<vk::CommandBuffer> {
        let cmd = self.core.begin_draw(image_index, pass, subpass)?;
        let device = self.core.device().clone();
        unsafe {
            device.cmd_draw(cmd, self.core.particle_count(), 1, 0, 0);
        }

        if let (Some(pipeline), Some(atlas_set)) = (&self.splash_graphics, self.splash_atlas_set) {
            let image = image_index as usize;
            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.handle());
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout(),
                    0,
                    &[self.splash_frame_sets[image], atlas_set],
                    &[],
                );
                device.cmd_draw_indirect(cmd, self.splash_draw.handle(), 0, 1, 0);
            }
        }

        self.core.end_draw(cmd)?;
        Ok(cmd)
    }

    /// Drop swapchain-dependent state
    pub fn cleanup_swapchain_assets(&mut self) {
        self.core.cleanup_swapchain_assets();
        self.rain_splash_set = None;
        self.splash_compute = None;
        self.splash_compute_set = None;
        self.splash_graphics = None;
        self.splash_frame_sets.clear();
        self.splash_atlas_set = None;
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

fn buffer_barrier(
    buffer: &Buffer,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::BufferMemoryBarrier {
    vk::BufferMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer.handle())
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .build()
}
