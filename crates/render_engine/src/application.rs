//! Application contract
//!
//! The host application owns the window and the frame loop; the engine calls
//! back into it at the points the backend cannot decide for itself: asset
//! loading, (re)building swapchain-dependent state, per-frame updates and
//! command recording.

use ash::vk;
use thiserror::Error;

use crate::render::vulkan::{RenderPass, VulkanError, VulkanResult};

/// Application-level errors
#[derive(Error, Debug)]
pub enum AppError {
    /// A rendering-layer failure
    #[error("render error: {0}")]
    Render(#[from] VulkanError),

    /// An asset could not be loaded
    #[error("asset error: {0}")]
    Asset(String),
}

/// Callbacks every demo implements.
///
/// `setup_scene` and `create_graphics_pipeline` run both at startup and after
/// every swapchain rebuild; `cleanup_swapchain_assets` runs before each
/// rebuild so swapchain-dependent resources are gone while the device idles.
pub trait Application {
    /// Load device-independent assets (models, textures, shader blobs)
    fn load_assets(&mut self) -> Result<(), AppError>;

    /// Build swapchain-dependent state: render passes, framebuffers, sets
    fn setup_scene(&mut self) -> Result<(), AppError>;

    /// Rebuild pipelines against the current swapchain
    fn create_graphics_pipeline(&mut self) -> Result<(), AppError>;

    /// Advance simulation/animation state by `delta_time` seconds
    fn update_scene(&mut self, delta_time: f32) -> Result<(), AppError>;

    /// Record the frame's secondary command buffers for a swapchain image
    fn render_frame(&mut self, image_index: u32) -> Result<Vec<vk::CommandBuffer>, AppError>;

    /// Destroy swapchain-dependent state ahead of a rebuild
    fn cleanup_swapchain_assets(&mut self);

    /// Final teardown
    fn cleanup(&mut self);
}

/// Anything that records a secondary command buffer for one subpass of a
/// render pass: the scene manager, each particle emitter, the UI overlay.
pub trait SubpassRecorder {
    /// Record and return the secondary command buffer for this swapchain
    /// image, valid inside `pass` at `subpass`.
    fn record(
        &mut self,
        image_index: u32,
        pass: &RenderPass,
        subpass: u32,
    ) -> VulkanResult<vk::CommandBuffer>;
}
