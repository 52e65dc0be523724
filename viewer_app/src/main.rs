//! glTF model viewer
//!
//! Loads a .glb scene, orbits it with a slow Z rotation, and renders it
//! through the engine's multisampled forward pass. Timestamp queries wrap
//! the render pass and are logged periodically.

use ash::vk;
use glfw::{Action, Key, WindowEvent};

use render_engine::prelude::*;
use render_engine::render::vulkan::context::VulkanContext;
use render_engine::render::vulkan::render_pass::{
    DependencyKind, SubpassConfig, SubpassDependencyConfig,
};
use render_engine::scene::{load_glb, LoadedScene, SceneManager};
use std::path::PathBuf;

const MODEL_PATH: &str = "resources/models/viking_room.glb";
const ROTATION_DEGREES_PER_SECOND: f32 = 90.0;
const TIMING_LOG_INTERVAL: u64 = 240;

struct ViewerApp {
    backend: RenderBackend,
    scene: SceneManager,
    main_pass: Option<RenderPass>,
    loaded: Option<LoadedScene>,
    initial_transforms: Vec<Mat4>,
    elapsed: f32,
    msaa_samples: vk::SampleCountFlags,
    shader_dir: PathBuf,
}

impl ViewerApp {
    fn new(backend: RenderBackend, config: &EngineConfig) -> Self {
        let camera = Camera::new(
            Vec3::new(-3.0, 0.0, 1.0),
            Vec3::new(3.0, 0.0, -1.0),
            60.0,
            config.window_width as f32 / config.window_height as f32,
        );
        let msaa_samples = clamp_samples(
            config.msaa_samples,
            backend.context().physical_device.max_msaa_samples,
        );
        let scene = SceneManager::new(&backend, camera, true);
        Self {
            backend,
            scene,
            main_pass: None,
            loaded: None,
            initial_transforms: Vec::new(),
            elapsed: 0.0,
            msaa_samples,
            shader_dir: PathBuf::from(&config.shader_dir),
        }
    }

    fn build_main_pass(&mut self) -> Result<RenderPass, AppError> {
        let config = RenderPassConfig {
            extent: None,
            msaa_samples: self.msaa_samples,
            has_color: true,
            has_depth: true,
            store_depth: false,
            offscreen: false,
            subpasses: vec![SubpassConfig {
                uses_color: true,
                uses_depth: true,
                dependencies: vec![SubpassDependencyConfig {
                    src_subpass: -1,
                    dst_subpass: 0,
                    src_kind: DependencyKind::ColorAttachment,
                    dst_kind: DependencyKind::ColorAttachment,
                }],
            }],
        };
        Ok(RenderPass::new(
            self.backend.context().raw_device(),
            self.backend.memory_properties(),
            &self.backend.one_shot(),
            &config,
            Some(self.backend.swapchain()),
        )?)
    }

    fn rebuild_swapchain(&mut self, extent: vk::Extent2D) -> Result<(), AppError> {
        self.backend.wait_idle()?;
        self.cleanup_swapchain_assets();
        self.backend.recreate_swapchain(extent)?;
        self.setup_scene()?;
        Ok(())
    }
}

impl Application for ViewerApp {
    fn load_assets(&mut self) -> Result<(), AppError> {
        let loaded = load_glb(MODEL_PATH).map_err(|e| AppError::Asset(e.to_string()))?;
        self.loaded = Some(loaded);
        Ok(())
    }

    fn setup_scene(&mut self) -> Result<(), AppError> {
        if let Some(loaded) = self.loaded.take() {
            self.scene.upload(&self.backend, loaded)?;
        }
        let pass = self.build_main_pass()?;
        self.scene
            .setup(&mut self.backend, &pass, 0, self.shader_dir.as_path())?;
        if self.initial_transforms.is_empty() {
            // First setup: remember the imported transforms for animation.
            self.initial_transforms = (0..self.scene.mesh_count())
                .map(|i| self.scene.model_matrix(i).unwrap_or_else(Mat4::identity))
                .collect();
        }
        self.main_pass = Some(pass);
        Ok(())
    }

    fn create_graphics_pipeline(&mut self) -> Result<(), AppError> {
        // Pipelines are rebuilt inside setup_scene for this demo.
        Ok(())
    }

    fn update_scene(&mut self, delta_time: f32) -> Result<(), AppError> {
        self.elapsed += delta_time;
        let angle = (self.elapsed * ROTATION_DEGREES_PER_SECOND).to_radians();
        let rotation = Mat4::from_axis_angle(&nalgebra::Vector3::z_axis(), angle);
        for mesh_index in 0..self.scene.mesh_count() {
            let initial = self.initial_transforms[mesh_index];
            self.scene.set_model_matrix(mesh_index, rotation * initial);
        }
        Ok(())
    }

    fn render_frame(&mut self, image_index: u32) -> Result<Vec<vk::CommandBuffer>, AppError> {
        let pass = self
            .main_pass
            .as_ref()
            .ok_or_else(|| AppError::Asset("main pass not built".to_string()))?;
        let cmd = self.scene.record(image_index, pass, 0)?;
        Ok(vec![cmd])
    }

    fn cleanup_swapchain_assets(&mut self) {
        self.scene.cleanup_swapchain_assets();
        self.main_pass = None;
    }

    fn cleanup(&mut self) {
        let _ = self.backend.wait_idle();
    }
}

fn clamp_samples(requested: u32, max: vk::SampleCountFlags) -> vk::SampleCountFlags {
    let wanted = match requested {
        n if n >= 8 => vk::SampleCountFlags::TYPE_8,
        n if n >= 4 => vk::SampleCountFlags::TYPE_4,
        n if n >= 2 => vk::SampleCountFlags::TYPE_2,
        _ => vk::SampleCountFlags::TYPE_1,
    };
    let ladder = [
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
        vk::SampleCountFlags::TYPE_1,
    ];
    let mut best = vk::SampleCountFlags::TYPE_1;
    for &candidate in &ladder {
        if candidate.as_raw() <= wanted.as_raw() && max.as_raw() >= candidate.as_raw() {
            best = candidate;
            break;
        }
    }
    best
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = EngineConfig::load_or_default("viewer.toml");
    config.app_name = "model_viewer".to_string();
    if config.timestamp_query_count == 0 {
        config.timestamp_query_count = 4;
    }

    let mut window = Window::new(&config.app_name, config.window_width, config.window_height)?;
    let context = VulkanContext::new(&mut window, &config.app_name, config.validation)?;
    let (width, height) = window.framebuffer_size();
    let backend = RenderBackend::new(context, vk::Extent2D { width, height }, &config)?;

    let mut app = ViewerApp::new(backend, &config);
    app.load_assets()?;
    app.setup_scene()?;

    let mut timer = Timer::new();
    let mut pending_rebuild = false;

    while !window.should_close() {
        for event in window.poll_events() {
            if let WindowEvent::Key(Key::Escape, _, Action::Press, _) = event {
                window.set_should_close(true);
            }
        }
        timer.update();

        let (width, height) = window.framebuffer_size();
        if width == 0 || height == 0 {
            // Minimized: park until the extent is positive again.
            window.wait_events();
            continue;
        }
        if window.take_resized() || pending_rebuild {
            app.rebuild_swapchain(vk::Extent2D { width, height })?;
            pending_rebuild = false;
        }

        let frame = match app.backend.begin_frame()? {
            FrameStatus::Ready(frame) => frame,
            FrameStatus::SwapchainStale => {
                pending_rebuild = true;
                continue;
            }
        };

        app.update_scene(timer.delta_time())?;
        app.scene.update(frame.image_index as usize)?;

        let secondaries = app.render_frame(frame.image_index)?;
        let pass = app.main_pass.as_ref().expect("pass built");
        let cmd = app.backend.primary_buffer(frame.image_index as usize);
        let device = app.backend.context().raw_device();
        unsafe {
            device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::builder())?;
        }
        if let Some(timestamps) = app.backend.timestamps() {
            timestamps.reset(cmd);
            timestamps.write(cmd, vk::PipelineStageFlags::TOP_OF_PIPE, 0);
        }
        pass.begin(cmd, frame.image_index as usize);
        unsafe {
            device.cmd_execute_commands(cmd, &secondaries);
        }
        pass.end(cmd);
        if let Some(timestamps) = app.backend.timestamps() {
            timestamps.write(cmd, vk::PipelineStageFlags::BOTTOM_OF_PIPE, 1);
        }
        unsafe {
            device.end_command_buffer(cmd)?;
        }

        app.backend.submit_graphics(cmd, frame)?;
        if app.backend.present(frame)? {
            pending_rebuild = true;
        }

        if app.backend.frame_counter() % TIMING_LOG_INTERVAL == 0 {
            if let Some(timestamps) = app.backend.timestamps() {
                if let Ok(ticks) = timestamps.fetch_ticks(2) {
                    let ns = timestamps.elapsed_ns(&ticks, 0, 1);
                    log::info!("render pass: {:.3} ms", ns / 1.0e6);
                }
            }
        }
    }

    app.cleanup();
    Ok(())
}

fn main() {
    render_engine::foundation::logging::init();
    if let Err(e) = run() {
        log::error!("fatal: {}", e);
        eprintln!("model_viewer: {}", e);
        std::process::exit(1);
    }
}
