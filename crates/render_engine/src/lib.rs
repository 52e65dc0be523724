//! # Render Engine
//!
//! A Vulkan rendering framework with reflected pipeline assembly and a
//! GPU-driven particle system.
//!
//! ## Layers
//!
//! - **Backend** (`render::vulkan`): device and queue lifecycle, swapchain
//!   recreation, the compute/graphics frame schedule, resource helpers.
//! - **Images and shaders**: 2D image roles with tracked layout transitions;
//!   SPIR-V reflection driving descriptor layouts, push constants and vertex
//!   input automatically.
//! - **Passes and pipelines**: declarative multi-subpass render passes with
//!   MSAA resolves; graphics/compute/mesh pipelines sharing one strict
//!   layout-merge path.
//! - **Scene** (`scene`): glTF import into one shared vertex/index buffer
//!   pair, texture and material tables, camera, optional static shadow map.
//! - **Particles** (`particles`): compute-simulated rain with depth-probe
//!   collisions and four interchangeable drawing strategies.
//! - **UI** (`ui`): the engine-side half of the immediate-mode GUI overlay.

#![warn(missing_docs)]

pub mod application;
pub mod config;
pub mod foundation;
pub mod particles;
pub mod render;
pub mod scene;
pub mod ui;

pub use application::{AppError, Application, SubpassRecorder};
pub use config::EngineConfig;
pub use render::vulkan::{RenderBackend, VulkanError, VulkanResult};
pub use render::window::Window;

/// Common imports for framework users
pub mod prelude {
    pub use crate::application::{AppError, Application, SubpassRecorder};
    pub use crate::config::EngineConfig;
    pub use crate::foundation::logging;
    pub use crate::foundation::math::{Mat4, Quat, Vec2, Vec3, Vec4};
    pub use crate::foundation::time::Timer;
    pub use crate::particles::{DrawStrategy, EmitterConfig, ParticleEmitter};
    pub use crate::render::vulkan::{
        FrameContext, FrameStatus, RenderBackend, RenderPass, RenderPassConfig, VulkanError,
        VulkanResult,
    };
    pub use crate::render::window::Window;
    pub use crate::scene::{Camera, SceneManager};
    pub use crate::ui::UiOverlay;
}
