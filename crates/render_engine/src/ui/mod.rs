//! UI overlay plumbing
//!
//! The immediate-mode GUI library itself is an external collaborator; this
//! module owns what the engine must provide it: growable vertex/index
//! buffers in the shared buffer abstraction, one descriptor set for the font
//! atlas, the `{scale, translate}` push constant derived from the display
//! size, and a record-secondary call that runs inside the last subpass of
//! the main render pass. Windowing events reach the GUI through an explicit
//! [`UiInputContext`] instead of process-wide globals.

use ash::{vk, Device};
use bytemuck::{Pod, Zeroable};
use std::path::Path;

use crate::render::vulkan::backend::RenderBackend;
use crate::render::vulkan::buffer::Buffer;
use crate::render::vulkan::commands;
use crate::render::vulkan::descriptors::PoolUsage;
use crate::render::vulkan::image::Image;
use crate::render::vulkan::pipeline::{FixedFunctionConfig, Pipeline};
use crate::render::vulkan::render_pass::RenderPass;
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Vertex layout the GUI library emits
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct UiVertex {
    /// Position in framebuffer pixels
    pub position: [f32; 2],
    /// Font-atlas UV
    pub uv: [f32; 2],
    /// Packed RGBA color
    pub color: [f32; 4],
}

impl UiVertex {
    /// Stride of the UI vertex
    pub const STRIDE: u32 = std::mem::size_of::<UiVertex>() as u32;
    /// Attribute offsets in location order
    pub const OFFSETS: [u32; 3] = [0, 8, 16];
}

/// Push-constant block mapping pixel coordinates to clip space
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UiTransform {
    /// 2 / display size
    pub scale: [f32; 2],
    /// Origin shift into clip space
    pub translate: [f32; 2],
}

impl UiTransform {
    /// Derive the transform for a display size in pixels
    pub fn for_display(width: f32, height: f32) -> Self {
        Self {
            scale: [2.0 / width, 2.0 / height],
            translate: [-1.0, -1.0],
        }
    }
}

/// One GUI draw command: an index range over the shared buffers
#[derive(Debug, Clone, Copy)]
pub struct UiDrawCommand {
    /// Number of indices
    pub index_count: u32,
    /// First index
    pub first_index: u32,
    /// Added to every index
    pub vertex_offset: i32,
}

/// Frame of GUI geometry produced by the external library
#[derive(Debug, Default)]
pub struct UiDrawData {
    /// Vertex stream
    pub vertices: Vec<UiVertex>,
    /// Index stream
    pub indices: Vec<u32>,
    /// Draw ranges, issued in order
    pub commands: Vec<UiDrawCommand>,
}

/// Mouse and keyboard state the windowing layer feeds into the GUI.
/// Owned by the overlay; no global callback registry.
#[derive(Debug, Default)]
pub struct UiInputContext {
    /// Cursor position in framebuffer pixels
    pub mouse_position: [f32; 2],
    /// Left/right/middle button state
    pub mouse_down: [bool; 3],
    /// Scroll wheel delta accumulated this frame
    pub wheel_delta: f32,
    /// Characters typed this frame
    pub typed: Vec<char>,
}

impl UiInputContext {
    /// Record cursor movement
    pub fn on_mouse_move(&mut self, x: f32, y: f32) {
        self.mouse_position = [x, y];
    }

    /// Record a button press or release
    pub fn on_mouse_button(&mut self, button: usize, down: bool) {
        if let Some(state) = self.mouse_down.get_mut(button) {
            *state = down;
        }
    }

    /// Record scroll input
    pub fn on_scroll(&mut self, delta: f32) {
        self.wheel_delta += delta;
    }

    /// Record a typed character
    pub fn on_char(&mut self, c: char) {
        self.typed.push(c);
    }

    /// Clear the per-frame accumulators after the GUI consumed them
    pub fn end_frame(&mut self) {
        self.wheel_delta = 0.0;
        self.typed.clear();
    }
}

/// The engine-side half of the GUI integration
pub struct UiOverlay {
    device: Device,
    command_pool: vk::CommandPool,

    /// Input state the windowing layer writes into
    pub input: UiInputContext,

    font_atlas: Option<Image>,
    // One geometry buffer pair per swapchain image: the GUI rewrites its
    // geometry every frame while the previous frame may still be in flight.
    vertex_buffers: Vec<Option<Buffer>>,
    index_buffers: Vec<Option<Buffer>>,

    pipeline: Option<Pipeline>,
    font_set: Option<vk::DescriptorSet>,
    secondary_buffers: Vec<vk::CommandBuffer>,
    display_size: [f32; 2],
}

impl UiOverlay {
    /// Create an empty overlay
    pub fn new(backend: &RenderBackend) -> Self {
        Self {
            device: backend.context().raw_device(),
            command_pool: backend.command_pool(),
            input: UiInputContext::default(),
            font_atlas: None,
            vertex_buffers: Vec::new(),
            index_buffers: Vec::new(),
            pipeline: None,
            font_set: None,
            secondary_buffers: Vec::new(),
            display_size: [1.0, 1.0],
        }
    }

    /// Upload the font atlas the GUI library baked
    pub fn set_font_atlas(
        &mut self,
        backend: &RenderBackend,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> VulkanResult<()> {
        self.font_atlas = Some(Image::sampled_from_pixels(
            self.device.clone(),
            backend.memory_properties(),
            &backend.one_shot(),
            "fonts",
            pixels,
            width,
            height,
            false,
            1.0,
        )?);
        Ok(())
    }

    /// Build the overlay pipeline against the main pass's last subpass
    pub fn setup(
        &mut self,
        backend: &mut RenderBackend,
        render_pass: &RenderPass,
        subpass: u32,
        shader_dir: &Path,
    ) -> VulkanResult<()> {
        let device = self.device.clone();
        let image_count = backend.swapchain().image_count();
        let extent = backend.swapchain().extent();
        self.display_size = [extent.width as f32, extent.height as f32];

        let vs = crate::render::vulkan::ShaderModule::load(device.clone(), shader_dir, "ui_vs")?;
        let fs = crate::render::vulkan::ShaderModule::load(device.clone(), shader_dir, "ui_fs")?;
        let pipeline = Pipeline::graphics(
            device.clone(),
            &[&vs, &fs],
            render_pass,
            subpass,
            &FixedFunctionConfig {
                cull_back_face: false,
                enable_depth_testing: false,
                enable_transparency: true,
                ..Default::default()
            },
            Some((UiVertex::STRIDE, &UiVertex::OFFSETS)),
        )?;

        let font_atlas = self.font_atlas.as_ref().ok_or_else(|| {
            VulkanError::ResourceCreation("font atlas not uploaded".into())
        })?;
        let sampler = font_atlas.sampler().ok_or_else(|| {
            VulkanError::ResourceCreation("font atlas has no sampler".into())
        })?;

        let usage = pipeline.pool_usage(1);
        let font_set = backend
            .descriptors()
            .allocate(&[pipeline.set_layout(0)?], &usage)?[0];
        pipeline.write_combined_image(
            font_set,
            0,
            "fonts_sampler",
            font_atlas.sampler_view(),
            sampler,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        self.secondary_buffers =
            commands::allocate_secondary_buffers(&self.device, self.command_pool, image_count)?;
        self.vertex_buffers = (0..image_count).map(|_| None).collect();
        self.index_buffers = (0..image_count).map(|_| None).collect();
        self.pipeline = Some(pipeline);
        self.font_set = Some(font_set);
        Ok(())
    }

    /// Grow (or create) this image's geometry buffers to fit a frame of GUI
    /// data. Replacing is safe: the image's previous submission has drained
    /// by the time it is acquired again.
    fn ensure_capacity(
        &mut self,
        backend: &RenderBackend,
        image: usize,
        vertex_bytes: u64,
        index_bytes: u64,
    ) -> VulkanResult<()> {
        let needs_vertex = self.vertex_buffers[image]
            .as_ref()
            .map(|b| b.size() < vertex_bytes)
            .unwrap_or(true);
        if needs_vertex && vertex_bytes > 0 {
            self.vertex_buffers[image] = Some(Buffer::new(
                self.device.clone(),
                backend.memory_properties(),
                &format!("ui_vertices[{}]", image),
                vertex_bytes.next_power_of_two(),
                vk::BufferUsageFlags::VERTEX_BUFFER,
                true,
            )?);
        }

        let needs_index = self.index_buffers[image]
            .as_ref()
            .map(|b| b.size() < index_bytes)
            .unwrap_or(true);
        if needs_index && index_bytes > 0 {
            self.index_buffers[image] = Some(Buffer::new(
                self.device.clone(),
                backend.memory_properties(),
                &format!("ui_indices[{}]", image),
                index_bytes.next_power_of_two(),
                vk::BufferUsageFlags::INDEX_BUFFER,
                true,
            )?);
        }
        Ok(())
    }

    /// Record the overlay's secondary command buffer for this frame
    pub fn record(
        &mut self,
        backend: &RenderBackend,
        image_index: u32,
        pass: &RenderPass,
        subpass: u32,
        draw_data: &UiDrawData,
    ) -> VulkanResult<vk::CommandBuffer> {
        let image = image_index as usize;
        let cmd = self.secondary_buffers[image];

        commands::begin_secondary(&self.device, cmd, pass.handle(), subpass, pass.framebuffer(image))?;

        if !draw_data.commands.is_empty() {
            let vertex_bytes = (draw_data.vertices.len() * std::mem::size_of::<UiVertex>()) as u64;
            let index_bytes = (draw_data.indices.len() * std::mem::size_of::<u32>()) as u64;
            self.ensure_capacity(backend, image, vertex_bytes, index_bytes)?;

            let pipeline = self
                .pipeline
                .as_ref()
                .ok_or_else(|| VulkanError::ResourceCreation("ui pipeline not built".into()))?;
            let font_set = self
                .font_set
                .ok_or_else(|| VulkanError::ResourceCreation("font set not allocated".into()))?;
            let vertex_buffer = self.vertex_buffers[image].as_ref().expect("ensured above");
            let index_buffer = self.index_buffers[image].as_ref().expect("ensured above");

            vertex_buffer.write_data(&draw_data.vertices)?;
            index_buffer.write_data(&draw_data.indices)?;

            unsafe {
                self.device
                    .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.handle());
                self.device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout(),
                    0,
                    &[font_set],
                    &[],
                );
                self.device
                    .cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer.handle()], &[0]);
                self.device.cmd_bind_index_buffer(
                    cmd,
                    index_buffer.handle(),
                    0,
                    vk::IndexType::UINT32,
                );
            }

            pipeline.push(
                cmd,
                "ui_transform",
                &UiTransform::for_display(self.display_size[0], self.display_size[1]),
            )?;

            for command in &draw_data.commands {
                unsafe {
                    self.device.cmd_draw_indexed(
                        cmd,
                        command.index_count,
                        1,
                        command.first_index,
                        command.vertex_offset,
                        0,
                    );
                }
            }
        }

        unsafe {
            self.device
                .end_command_buffer(cmd)
                .map_err(VulkanError::Api)?;
        }
        Ok(cmd)
    }

    /// Drop swapchain-dependent state before a rebuild
    pub fn cleanup_swapchain_assets(&mut self) {
        if !self.secondary_buffers.is_empty() {
            unsafe {
                self.device
                    .free_command_buffers(self.command_pool, &self.secondary_buffers);
            }
            self.secondary_buffers.clear();
        }
        // The image count can change across rebuilds; drop the per-image
        // geometry with the rest.
        self.vertex_buffers.clear();
        self.index_buffers.clear();
        self.pipeline = None;
        self.font_set = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_maps_pixels_to_clip_space() {
        let transform = UiTransform::for_display(800.0, 600.0);
        assert_eq!(transform.scale, [2.0 / 800.0, 2.0 / 600.0]);
        assert_eq!(transform.translate, [-1.0, -1.0]);

        // Pixel (0,0) lands at clip (-1,-1); the far corner at (1,1).
        let map = |p: [f32; 2]| {
            [
                p[0] * transform.scale[0] + transform.translate[0],
                p[1] * transform.scale[1] + transform.translate[1],
            ]
        };
        assert_eq!(map([0.0, 0.0]), [-1.0, -1.0]);
        assert_eq!(map([800.0, 600.0]), [1.0, 1.0]);
    }

    #[test]
    fn input_context_accumulates_and_clears() {
        let mut input = UiInputContext::default();
        input.on_mouse_move(10.0, 20.0);
        input.on_mouse_button(0, true);
        input.on_scroll(1.5);
        input.on_char('x');

        assert_eq!(input.mouse_position, [10.0, 20.0]);
        assert!(input.mouse_down[0]);
        assert_eq!(input.wheel_delta, 1.5);
        assert_eq!(input.typed, vec!['x']);

        input.end_frame();
        assert_eq!(input.wheel_delta, 0.0);
        assert!(input.typed.is_empty());
        // Held buttons persist across frames.
        assert!(input.mouse_down[0]);
    }

    #[test]
    fn ui_vertex_layout_is_tightly_packed() {
        assert_eq!(UiVertex::STRIDE, 32);
        assert_eq!(UiVertex::OFFSETS, [0, 8, 16]);
    }
}
