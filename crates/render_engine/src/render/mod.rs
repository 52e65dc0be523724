//! Rendering layer
//!
//! `vulkan` holds the backend proper (device, swapchain, pipelines, passes);
//! `window` is the thin GLFW layer that produces the surface the backend
//! renders to.

pub mod vulkan;
pub mod window;

pub use vulkan::{VulkanError, VulkanResult};
pub use window::Window;
