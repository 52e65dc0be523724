//! Command buffer helpers
//!
//! One-shot transfer commands for initialization-time uploads and allocation
//! of the secondary command buffers each subsystem records into.

use ash::{vk, Device};

use crate::render::vulkan::buffer::Buffer;
use crate::render::vulkan::context::{VulkanError, VulkanResult};

/// Records and submits a single-use command buffer, then waits for the queue.
///
/// The trailing `queue_wait_idle` makes this unsuitable for per-frame work;
/// it is only used during initialization and asset upload.
pub struct OneShotCommands {
    device: Device,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
}

impl OneShotCommands {
    /// Create a one-shot recorder against an existing pool and queue
    pub fn new(device: Device, command_pool: vk::CommandPool, queue: vk::Queue) -> Self {
        Self {
            device,
            command_pool,
            queue,
        }
    }

    /// Record commands via the closure, submit them, and block until done
    pub fn run<F>(&self, record: F) -> VulkanResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?[0]
        };

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        let result = unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::Api)
                .and_then(|_| {
                    record(command_buffer);
                    self.device
                        .end_command_buffer(command_buffer)
                        .map_err(VulkanError::Api)
                })
                .and_then(|_| {
                    let buffers = [command_buffer];
                    let submit_info = vk::SubmitInfo::builder().command_buffers(&buffers).build();
                    self.device
                        .queue_submit(self.queue, &[submit_info], vk::Fence::null())
                        .map_err(VulkanError::from_vk)
                })
                .and_then(|_| {
                    self.device
                        .queue_wait_idle(self.queue)
                        .map_err(VulkanError::from_vk)
                })
        };

        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[command_buffer]);
        }

        result
    }

    /// Copy the full contents of one buffer into another
    pub fn copy_buffer(&self, src: &Buffer, dst: &Buffer) -> VulkanResult<()> {
        let size = src.size().min(dst.size());
        self.run(|cmd| {
            let region = vk::BufferCopy::builder().size(size).build();
            unsafe {
                self.device
                    .cmd_copy_buffer(cmd, src.handle(), dst.handle(), &[region]);
            }
        })
    }
}

/// Allocate secondary command buffers, one per swapchain image
pub fn allocate_secondary_buffers(
    device: &Device,
    command_pool: vk::CommandPool,
    count: u32,
) -> VulkanResult<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::SECONDARY)
        .command_buffer_count(count);

    unsafe {
        device
            .allocate_command_buffers(&alloc_info)
            .map_err(VulkanError::Api)
    }
}

/// Begin a secondary command buffer scoped to a render-pass subpass
pub fn begin_secondary(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    subpass: u32,
    framebuffer: vk::Framebuffer,
) -> VulkanResult<()> {
    let inheritance = vk::CommandBufferInheritanceInfo::builder()
        .render_pass(render_pass)
        .subpass(subpass)
        .framebuffer(framebuffer)
        .build();

    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE)
        .inheritance_info(&inheritance);

    unsafe {
        device
            .begin_command_buffer(command_buffer, &begin_info)
            .map_err(VulkanError::Api)
    }
}
