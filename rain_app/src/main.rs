//! Rainy alley demo
//!
//! Loads an alley scene, rains a thousand compute-simulated particles on
//! it, and draws them through one of four interchangeable strategies (Tab
//! cycles; mesh shading is skipped on devices without the extension). A
//! small overlay quad indicates the active strategy.

use ash::vk;
use glfw::{Action, Key, WindowEvent};

use render_engine::prelude::*;
use render_engine::render::vulkan::context::VulkanContext;
use render_engine::render::vulkan::render_pass::{
    DependencyKind, SubpassConfig, SubpassDependencyConfig,
};
use render_engine::scene::{load_glb, LoadedScene, SceneManager};
use render_engine::ui::{UiDrawCommand, UiDrawData, UiVertex};
use std::path::PathBuf;

const MODEL_PATH: &str = "resources/models/alley.glb";
const ATLAS_PATH: &str = "resources/textures/rain_atlas.png";
const PARTICLE_COUNT: u32 = 1000;
const TIMING_LOG_INTERVAL: u64 = 240;

/// Compute in slots 0-1, graphics in slots 2-3; the rest stay free for
/// ad-hoc probes.
const TS_COMPUTE_START: u32 = 0;
const TS_COMPUTE_STOP: u32 = 1;
const TS_GRAPHICS_START: u32 = 2;
const TS_GRAPHICS_STOP: u32 = 3;

struct RainApp {
    backend: RenderBackend,
    scene: SceneManager,
    emitter: Option<ParticleEmitter>,
    overlay: UiOverlay,
    main_pass: Option<RenderPass>,
    loaded: Option<LoadedScene>,
    strategy: DrawStrategy,
    msaa_samples: vk::SampleCountFlags,
    shader_dir: PathBuf,
}

fn emitter_config() -> EmitterConfig {
    EmitterConfig {
        name: "rain".to_string(),
        starting_transform: Mat4::identity(),
        min_box_extent: Vec3::new(-8.0, -8.0, 8.0),
        max_box_extent: Vec3::new(8.0, 8.0, 12.0),
        min_starting_velocity: Vec3::new(-0.4, -0.4, -12.0),
        max_starting_velocity: Vec3::new(0.4, 0.4, -8.0),
        lifetime_after_collision: 0.5,
        texture_atlas_path: ATLAS_PATH.to_string(),
        subpass_number: 1,
        profile: false,
    }
}

impl RainApp {
    fn new(backend: RenderBackend, config: &EngineConfig) -> Self {
        let mut camera = Camera::new(
            Vec3::new(-10.0, 0.0, 3.0),
            Vec3::new(10.0, 0.0, -2.0),
            60.0,
            config.window_width as f32 / config.window_height as f32,
        );
        camera.far = 200.0;
        let msaa_samples = clamp_samples(
            config.msaa_samples,
            backend.context().physical_device.max_msaa_samples,
        );
        let scene = SceneManager::new(&backend, camera, true);
        let overlay = UiOverlay::new(&backend);
        Self {
            backend,
            scene,
            emitter: None,
            overlay,
            main_pass: None,
            loaded: None,
            strategy: DrawStrategy::GeometryShader,
            msaa_samples,
            shader_dir: PathBuf::from(&config.shader_dir),
        }
    }

    fn build_main_pass(&mut self) -> Result<RenderPass, AppError> {
        // Subpass 0 draws the opaque scene; subpass 1 blends particles and
        // the overlay on top, reading the depth the scene wrote.
        let config = RenderPassConfig {
            extent: None,
            msaa_samples: self.msaa_samples,
            has_color: true,
            has_depth: true,
            store_depth: false,
            offscreen: false,
            subpasses: vec![
                SubpassConfig {
                    uses_color: true,
                    uses_depth: true,
                    dependencies: vec![SubpassDependencyConfig {
                        src_subpass: -1,
                        dst_subpass: 0,
                        src_kind: DependencyKind::ColorAttachment,
                        dst_kind: DependencyKind::ColorAttachment,
                    }],
                },
                SubpassConfig {
                    uses_color: true,
                    uses_depth: true,
                    dependencies: vec![
                        SubpassDependencyConfig {
                            src_subpass: 0,
                            dst_subpass: 1,
                            src_kind: DependencyKind::ColorAttachment,
                            dst_kind: DependencyKind::ColorAttachment,
                        },
                        SubpassDependencyConfig {
                            src_subpass: 0,
                            dst_subpass: 1,
                            src_kind: DependencyKind::LateFragmentTests,
                            dst_kind: DependencyKind::EarlyFragmentTests,
                        },
                    ],
                },
            ],
        };
        Ok(RenderPass::new(
            self.backend.context().raw_device(),
            self.backend.memory_properties(),
            &self.backend.one_shot(),
            &config,
            Some(self.backend.swapchain()),
        )?)
    }

    fn switch_strategy(&mut self) -> Result<(), AppError> {
        let mesh_support = self
            .backend
            .context()
            .physical_device
            .mesh_shader_support;
        self.strategy = self.strategy.next(mesh_support);
        log::info!("Switching emitter strategy to {:?}", self.strategy);
        // Drain the GPU, then replace the emitter; the caller triggers the
        // swapchain rebuild that builds its pipelines.
        self.backend.wait_idle()?;
        self.emitter = Some(ParticleEmitter::new(
            self.strategy,
            &self.backend,
            emitter_config(),
            PARTICLE_COUNT,
        )?);
        Ok(())
    }

    fn rebuild_swapchain(&mut self, extent: vk::Extent2D) -> Result<(), AppError> {
        self.backend.wait_idle()?;
        self.cleanup_swapchain_assets();
        self.backend.recreate_swapchain(extent)?;
        self.setup_scene()?;
        Ok(())
    }

    fn overlay_draw_data(&self) -> UiDrawData {
        // A small quad whose horizontal slot marks the active strategy.
        let slot = DrawStrategy::ALL
            .iter()
            .position(|&s| s == self.strategy)
            .unwrap_or(0) as f32;
        let (x0, y0) = (16.0 + slot * 28.0, 16.0);
        let (x1, y1) = (x0 + 24.0, y0 + 24.0);
        let color = [0.2, 0.6, 1.0, 0.9];
        let corner = |x: f32, y: f32| UiVertex {
            position: [x, y],
            uv: [0.5, 0.5],
            color,
        };

        UiDrawData {
            vertices: vec![
                corner(x0, y0),
                corner(x1, y0),
                corner(x1, y1),
                corner(x0, y1),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
            commands: vec![UiDrawCommand {
                index_count: 6,
                first_index: 0,
                vertex_offset: 0,
            }],
        }
    }
}

impl Application for RainApp {
    fn load_assets(&mut self) -> Result<(), AppError> {
        let loaded = load_glb(MODEL_PATH).map_err(|e| AppError::Asset(e.to_string()))?;
        self.loaded = Some(loaded);

        self.emitter = Some(ParticleEmitter::new(
            self.strategy,
            &self.backend,
            emitter_config(),
            PARTICLE_COUNT,
        )?);

        // The overlay renders untextured quads; a tiny white atlas is all
        // the indicator needs.
        self.overlay
            .set_font_atlas(&self.backend, &[255u8; 4 * 4], 2, 2)?;
        Ok(())
    }

    fn setup_scene(&mut self) -> Result<(), AppError> {
        if let Some(loaded) = self.loaded.take() {
            self.scene.upload(&self.backend, loaded)?;
        }
        let pass = self.build_main_pass()?;
        self.scene
            .setup(&mut self.backend, &pass, 0, self.shader_dir.as_path())?;

        let depth_probe = self
            .scene
            .depth_probe()
            .ok_or_else(|| AppError::Asset("scene depth probe missing".to_string()))?;
        let emitter = self
            .emitter
            .as_mut()
            .ok_or_else(|| AppError::Asset("emitter not created".to_string()))?;
        emitter.setup(&mut self.backend, &pass, depth_probe, self.shader_dir.as_path())?;

        self.overlay
            .setup(&mut self.backend, &pass, 1, self.shader_dir.as_path())?;
        self.main_pass = Some(pass);
        Ok(())
    }

    fn create_graphics_pipeline(&mut self) -> Result<(), AppError> {
        Ok(())
    }

    fn update_scene(&mut self, _delta_time: f32) -> Result<(), AppError> {
        Ok(())
    }

    fn render_frame(&mut self, image_index: u32) -> Result<Vec<vk::CommandBuffer>, AppError> {
        let pass = self
            .main_pass
            .as_ref()
            .ok_or_else(|| AppError::Asset("main pass not built".to_string()))?;
        let scene_cmd = self.scene.record(image_index, pass, 0)?;
        let emitter_cmd = self
            .emitter
            .as_mut()
            .ok_or_else(|| AppError::Asset("emitter not created".to_string()))?
            .render_frame(image_index, pass)?;
        let draw_data = self.overlay_draw_data();
        let ui_cmd = self
            .overlay
            .record(&self.backend, image_index, pass, 1, &draw_data)?;
        Ok(vec![scene_cmd, emitter_cmd, ui_cmd])
    }

    fn cleanup_swapchain_assets(&mut self) {
        self.scene.cleanup_swapchain_assets();
        if let Some(emitter) = &mut self.emitter {
            emitter.cleanup_swapchain_assets();
        }
        self.overlay.cleanup_swapchain_assets();
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
    let mut config = EngineConfig::load_or_default("rain.toml");
    config.app_name = "rainy_alley".to_string();
    if config.timestamp_query_count == 0 {
        config.timestamp_query_count = 8;
    }

    let mut window = Window::new(&config.app_name, config.window_width, config.window_height)?;
    let context = VulkanContext::new(&mut window, &config.app_name, config.validation)?;
    let (width, height) = window.framebuffer_size();
    let backend = RenderBackend::new(context, vk::Extent2D { width, height }, &config)?;

    let mut app = RainApp::new(backend, &config);
    app.load_assets()?;
    app.setup_scene()?;

    let mut timer = Timer::new();
    let mut pending_rebuild = false;

    while !window.should_close() {
        for event in window.poll_events() {
            match event {
                WindowEvent::Key(Key::Escape, _, Action::Press, _) => {
                    window.set_should_close(true);
                }
                WindowEvent::Key(Key::Tab, _, Action::Press, _) => {
                    app.switch_strategy()?;
                    pending_rebuild = true;
                }
                _ => {}
            }
        }
        timer.update();

        let (width, height) = window.framebuffer_size();
        if width == 0 || height == 0 {
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
        let image = frame.image_index as usize;
        let extent = app.backend.swapchain().extent();

        app.scene.update(image)?;
        let camera = app.scene.camera.clone();
        if let Some(emitter) = &mut app.emitter {
            emitter.update(image, &camera, extent)?;
        }

        let device = app.backend.context().raw_device();

        // Compute first: the rain update must finish before the draw reads
        // particle state (backend semaphores enforce it across queues).
        let compute_cmd = app.backend.compute_buffer(image);
        unsafe {
            device.begin_command_buffer(compute_cmd, &vk::CommandBufferBeginInfo::builder())?;
        }
        if let Some(timestamps) = app.backend.timestamps() {
            timestamps.reset(compute_cmd);
            timestamps.write(compute_cmd, vk::PipelineStageFlags::TOP_OF_PIPE, TS_COMPUTE_START);
        }
        if let Some(emitter) = &mut app.emitter {
            emitter.record_compute(compute_cmd, image, timer.delta_time())?;
        }
        if let Some(timestamps) = app.backend.timestamps() {
            timestamps.write(
                compute_cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                TS_COMPUTE_STOP,
            );
        }
        unsafe {
            device.end_command_buffer(compute_cmd)?;
        }
        app.backend.submit_compute(compute_cmd)?;

        // [scene, emitter, ui]: the first runs in subpass 0, the rest in 1.
        let secondaries = app.render_frame(frame.image_index)?;

        let cmd = app.backend.primary_buffer(image);
        unsafe {
            device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::builder())?;
        }
        if let Some(timestamps) = app.backend.timestamps() {
            timestamps.write(cmd, vk::PipelineStageFlags::TOP_OF_PIPE, TS_GRAPHICS_START);
        }
        {
            let pass = app.main_pass.as_ref().expect("pass built");
            pass.begin(cmd, image);
            unsafe {
                device.cmd_execute_commands(cmd, &secondaries[..1]);
            }
            pass.next_subpass(cmd);
            unsafe {
                device.cmd_execute_commands(cmd, &secondaries[1..]);
            }
            pass.end(cmd);
        }
        if let Some(timestamps) = app.backend.timestamps() {
            timestamps.write(cmd, vk::PipelineStageFlags::BOTTOM_OF_PIPE, TS_GRAPHICS_STOP);
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
                if let Ok(ticks) = timestamps.fetch_ticks(4) {
                    let compute_ms = timestamps
                        .elapsed_ns(&ticks, TS_COMPUTE_START as usize, TS_COMPUTE_STOP as usize)
                        / 1.0e6;
                    let graphics_ms = timestamps
                        .elapsed_ns(&ticks, TS_GRAPHICS_START as usize, TS_GRAPHICS_STOP as usize)
                        / 1.0e6;
                    log::info!(
                        "{:?}: compute {:.3} ms, graphics {:.3} ms",
                        app.strategy,
                        compute_ms,
                        graphics_ms
                    );
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
        eprintln!("rainy_alley: {}", e);
        std::process::exit(1);
    }
}
