//! Vulkan backend
//!
//! Layered bottom-up: `context` owns the instance/device/queues, `swapchain`
//! the presentable images, `backend` the frame loop and resource helpers.
//! Above those sit the image, shader-reflection, render-pass and pipeline
//! abstractions used by the scene and particle layers.

pub mod backend;
pub mod buffer;
pub mod commands;
pub mod context;
pub mod descriptors;
pub mod image;
pub mod pipeline;
pub mod queries;
pub mod render_pass;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use backend::{FrameContext, FrameStatus, RenderBackend};
pub use buffer::{Buffer, UniformBuffer};
pub use commands::OneShotCommands;
pub use context::{VulkanContext, VulkanError, VulkanResult};
pub use descriptors::DescriptorAllocator;
pub use image::Image;
pub use pipeline::{FixedFunctionConfig, Pipeline, PipelineKind};
pub use queries::TimestampQueryPool;
pub use render_pass::{DependencyKind, RenderPass, RenderPassConfig, SubpassConfig};
pub use shader::ShaderModule;
pub use swapchain::Swapchain;
