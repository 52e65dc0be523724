//! Render backend: frame scheduling and swapchain-scoped resources
//!
//! Owns the swapchain, command pool, descriptor pool, sync objects and the
//! optional timestamp query pool, and runs the per-frame protocol:
//!
//! wait slot fence -> acquire -> (caller records) -> submit compute ->
//! submit graphics -> present -> advance.
//!
//! Compute waits on the previous frame's graphics (`drawing_finished`) so the
//! depth image it probes is stable; graphics waits on `compute_finished` only
//! for frames that actually submitted compute work.

use ash::vk;

use crate::config::EngineConfig;
use crate::render::vulkan::commands::OneShotCommands;
use crate::render::vulkan::context::{VulkanContext, VulkanError, VulkanResult};
use crate::render::vulkan::descriptors::{DescriptorAllocator, PoolBudget};
use crate::render::vulkan::queries::TimestampQueryPool;
use crate::render::vulkan::swapchain::Swapchain;
use crate::render::vulkan::sync::{ComputeSync, FrameSchedule, FrameSync, FRAMES_IN_FLIGHT};

/// Outcome of starting a frame
pub enum FrameStatus {
    /// The frame can be recorded against this context
    Ready(FrameContext),
    /// Acquire reported the swapchain unusable; rebuild and retry
    SwapchainStale,
}

/// Identifies where the current frame renders to
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Acquired swapchain image index
    pub image_index: u32,
    /// Active in-flight slot
    pub slot: usize,
}

/// The backend: process-wide context plus swapchain-scoped state.
///
/// Field order matters: everything swapchain- or device-scoped is declared
/// before `context` so it drops before the device is destroyed.
pub struct RenderBackend {
    swapchain: Swapchain,
    command_pool: vk::CommandPool,
    primary_buffers: Vec<vk::CommandBuffer>,
    compute_buffers: Vec<vk::CommandBuffer>,
    descriptor_allocator: DescriptorAllocator,
    frame_syncs: Vec<FrameSync>,
    compute_sync: ComputeSync,
    schedule: FrameSchedule,
    images_in_flight: Vec<vk::Fence>,
    timestamp_pool: Option<TimestampQueryPool>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    vsync_only: bool,
    context: VulkanContext,
}

impl RenderBackend {
    /// Build the backend over an initialized context
    pub fn new(
        context: VulkanContext,
        window_extent: vk::Extent2D,
        config: &EngineConfig,
    ) -> VulkanResult<Self> {
        let device = context.raw_device();
        let memory_properties = context.memory_properties();

        let swapchain = Swapchain::new(
            context.instance(),
            device.clone(),
            context.surface,
            &context.surface_loader,
            &context.physical_device,
            window_extent,
            config.vsync_only,
        )?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(context.device.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(VulkanError::Api)?
        };

        let image_count = swapchain.image_count();
        let primary_buffers = Self::allocate_primaries(&device, command_pool, image_count)?;
        let compute_buffers = Self::allocate_primaries(&device, command_pool, image_count)?;

        let descriptor_allocator =
            DescriptorAllocator::new(device.clone(), PoolBudget::default_budget(image_count))?;

        let mut frame_syncs = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            frame_syncs.push(FrameSync::new(device.clone())?);
        }
        let compute_sync = ComputeSync::new(device.clone())?;

        let timestamp_pool = if config.timestamp_query_count > 0 {
            Some(TimestampQueryPool::new(
                device,
                config.timestamp_query_count,
                context.physical_device.timestamp_period,
            )?)
        } else {
            None
        };

        let images_in_flight = vec![vk::Fence::null(); image_count as usize];

        Ok(Self {
            context,
            swapchain,
            command_pool,
            primary_buffers,
            compute_buffers,
            descriptor_allocator,
            frame_syncs,
            compute_sync,
            schedule: FrameSchedule::new(FRAMES_IN_FLIGHT),
            images_in_flight,
            timestamp_pool,
            memory_properties,
            vsync_only: config.vsync_only,
        })
    }

    fn allocate_primaries(
        device: &ash::Device,
        pool: vk::CommandPool,
        count: u32,
    ) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe {
            device
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)
        }
    }

    /// Start a frame: bound queue depth, acquire an image, drain any previous
    /// user of that image.
    pub fn begin_frame(&mut self) -> VulkanResult<FrameStatus> {
        let slot = self.schedule.active_slot();
        self.frame_syncs[slot].in_flight.wait()?;

        let acquire = unsafe {
            self.swapchain.loader().acquire_next_image(
                self.swapchain.handle(),
                u64::MAX,
                self.frame_syncs[slot].image_available.handle(),
                vk::Fence::null(),
            )
        };

        let image_index = match acquire {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    return Ok(FrameStatus::SwapchainStale);
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(FrameStatus::SwapchainStale),
            Err(e) => return Err(VulkanError::from_vk(e)),
        };

        // If an earlier slot still owns this image, drain it before reuse.
        let image_fence = self.images_in_flight[image_index as usize];
        if image_fence != vk::Fence::null() {
            unsafe {
                self.context
                    .raw_device()
                    .wait_for_fences(&[image_fence], true, u64::MAX)
                    .map_err(VulkanError::from_vk)?;
            }
        }
        self.images_in_flight[image_index as usize] = self.frame_syncs[slot].in_flight.handle();

        Ok(FrameStatus::Ready(FrameContext {
            image_index,
            slot,
        }))
    }

    /// Submit the frame's compute work. Waits on the previous graphics submit
    /// except on the very first frame, and obliges the next graphics submit
    /// to wait for it.
    pub fn submit_compute(&mut self, cmd: vk::CommandBuffer) -> VulkanResult<()> {
        let wait_semaphores;
        let wait_stages;
        if self.schedule.compute_waits_on_drawing() {
            wait_semaphores = vec![self.compute_sync.drawing_finished.handle()];
            wait_stages = vec![vk::PipelineStageFlags::COMPUTE_SHADER];
        } else {
            wait_semaphores = Vec::new();
            wait_stages = Vec::new();
        }

        let signal_semaphores = [self.compute_sync.compute_finished.handle()];
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.context
                .raw_device()
                .queue_submit(
                    self.context.device.compute_queue,
                    &[submit_info],
                    vk::Fence::null(),
                )
                .map_err(VulkanError::from_vk)?;
        }

        self.schedule.note_compute_submitted();
        Ok(())
    }

    /// Submit the frame's graphics work and fence the in-flight slot
    pub fn submit_graphics(&mut self, cmd: vk::CommandBuffer, frame: FrameContext) -> VulkanResult<()> {
        let slot = frame.slot;
        let waits_for_compute = self.schedule.take_compute_wait();

        let mut wait_semaphores = vec![self.frame_syncs[slot].image_available.handle()];
        let mut wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        if waits_for_compute {
            wait_semaphores.push(self.compute_sync.compute_finished.handle());
            wait_stages.push(vk::PipelineStageFlags::TOP_OF_PIPE);
        }

        let mut signal_semaphores = vec![self.frame_syncs[slot].render_finished.handle()];
        if waits_for_compute {
            // Only signal drawing_finished when a compute pass will consume
            // it next frame; otherwise the signal would pile up unconsumed.
            signal_semaphores.push(self.compute_sync.drawing_finished.handle());
        }

        self.frame_syncs[slot].in_flight.reset()?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.context
                .raw_device()
                .queue_submit(
                    self.context.device.graphics_queue,
                    &[submit_info],
                    self.frame_syncs[slot].in_flight.handle(),
                )
                .map_err(VulkanError::from_vk)?;
        }

        Ok(())
    }

    /// Present the frame and advance the schedule. Returns `true` when the
    /// swapchain must be rebuilt.
    pub fn present(&mut self, frame: FrameContext) -> VulkanResult<bool> {
        let slot = frame.slot;
        let wait_semaphores = [self.frame_syncs[slot].render_finished.handle()];
        let swapchains = [self.swapchain.handle()];
        let image_indices = [frame.image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let stale = unsafe {
            match self
                .swapchain
                .loader()
                .queue_present(self.context.device.graphics_queue, &present_info)
            {
                Ok(suboptimal) => suboptimal,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
                Err(e) => return Err(VulkanError::from_vk(e)),
            }
        };

        self.schedule.advance();
        Ok(stale)
    }

    /// Rebuild the swapchain and everything scoped to it. The caller must
    /// rebuild its own passes and pipelines afterwards (the `setup_scene`
    /// callback of the application contract).
    pub fn recreate_swapchain(&mut self, window_extent: vk::Extent2D) -> VulkanResult<()> {
        self.context.wait_idle()?;

        let device = self.context.raw_device();
        let old_handle = self.swapchain.handle();

        let new_swapchain = Swapchain::recreate(
            self.context.instance(),
            device.clone(),
            self.context.surface,
            &self.context.surface_loader,
            &self.context.physical_device,
            window_extent,
            self.vsync_only,
            old_handle,
        )?;
        // The old swapchain object drops after the new one exists, matching
        // the old_swapchain handle the driver saw.
        self.swapchain = new_swapchain;

        unsafe {
            device.free_command_buffers(self.command_pool, &self.primary_buffers);
            device.free_command_buffers(self.command_pool, &self.compute_buffers);
        }
        let image_count = self.swapchain.image_count();
        self.primary_buffers = Self::allocate_primaries(&device, self.command_pool, image_count)?;
        self.compute_buffers = Self::allocate_primaries(&device, self.command_pool, image_count)?;

        self.descriptor_allocator.reset()?;

        // Fresh sync objects: the old semaphores may hold stale signals from
        // submissions that never presented.
        self.frame_syncs.clear();
        for _ in 0..FRAMES_IN_FLIGHT {
            self.frame_syncs.push(FrameSync::new(device.clone())?);
        }
        self.compute_sync = ComputeSync::new(device)?;
        self.schedule = FrameSchedule::new(FRAMES_IN_FLIGHT);
        self.images_in_flight = vec![vk::Fence::null(); image_count as usize];

        log::info!(
            "Swapchain recreated at {}x{}",
            window_extent.width,
            window_extent.height
        );
        Ok(())
    }

    /// One-shot transfer commands on the graphics queue (init-time only)
    pub fn one_shot(&self) -> OneShotCommands {
        OneShotCommands::new(
            self.context.raw_device(),
            self.command_pool,
            self.context.device.graphics_queue,
        )
    }

    /// The primary graphics command buffer for a swapchain image
    pub fn primary_buffer(&self, image_index: usize) -> vk::CommandBuffer {
        self.primary_buffers[image_index]
    }

    /// The primary compute command buffer for a swapchain image
    pub fn compute_buffer(&self, image_index: usize) -> vk::CommandBuffer {
        self.compute_buffers[image_index]
    }

    /// The underlying context
    pub fn context(&self) -> &VulkanContext {
        &self.context
    }

    /// The current swapchain
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// The shared command pool
    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// The shared descriptor allocator
    pub fn descriptors(&mut self) -> &mut DescriptorAllocator {
        &mut self.descriptor_allocator
    }

    /// Cached device memory properties
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// The timestamp query pool, when configured
    pub fn timestamps(&self) -> Option<&TimestampQueryPool> {
        self.timestamp_pool.as_ref()
    }

    /// Frames presented so far
    pub fn frame_counter(&self) -> u64 {
        self.schedule.frame_counter()
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        self.context.wait_idle()
    }
}

impl Drop for RenderBackend {
    fn drop(&mut self) {
        let _ = self.context.wait_idle();
        unsafe {
            self.context
                .raw_device()
                .destroy_command_pool(self.command_pool, None);
        }
        // Swapchain, sync objects, descriptor pool and query pool drop via
        // their own RAII wrappers before the context tears down the device.
    }
}
