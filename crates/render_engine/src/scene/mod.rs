//! Scene management
//!
//! The scene manager owns everything imported from a glTF container: one big
//! vertex/index buffer pair, the texture and material tables, the mesh list,
//! camera and light state, and (optionally) a shadow map rendered once at
//! load. Per frame it refreshes the uniforms for the active swapchain image
//! and records the scene-draw secondary command buffer.
//!
//! Descriptor sets follow the framework convention: 0 = scene-wide, 1 = per
//! mesh, 2 = per material, 3 = shadow map.

pub mod camera;
pub mod gltf_loader;
pub mod lighting;
pub mod material;
pub mod mesh;

pub use camera::Camera;
pub use gltf_loader::{load_glb, LoadedScene, SceneError};
pub use lighting::Light;
pub use material::{Material, MaterialParams};
pub use mesh::{MeshData, ModelUniform, Surface, Vertex};

use ash::{vk, Device};
use bytemuck::{Pod, Zeroable};
use std::path::Path;

use crate::application::SubpassRecorder;
use crate::foundation::math::Mat4;
use crate::render::vulkan::backend::RenderBackend;
use crate::render::vulkan::buffer::{Buffer, UniformBuffer};
use crate::render::vulkan::commands;
use crate::render::vulkan::image::Image;
use crate::render::vulkan::pipeline::{FixedFunctionConfig, Pipeline};
use crate::render::vulkan::render_pass::{RenderPass, RenderPassConfig, SubpassConfig};
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Shadow map resolution (fixed; the offscreen pass is built once at load)
const SHADOW_MAP_SIZE: u32 = 2048;

/// Scene-wide uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SceneUniform {
    /// View matrix
    pub view: [[f32; 4]; 4],
    /// Projection matrix
    pub proj: [[f32; 4]; 4],
    /// Light position, w unused
    pub light_position: [f32; 4],
    /// x = light intensity, y = ambient intensity
    pub light_params: [f32; 4],
}

/// Shadow-pass uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ShadowUniform {
    /// Light-space view-projection matrix
    pub light_view_proj: [[f32; 4]; 4],
}

struct SceneMesh {
    data: MeshData,
    uniform: UniformBuffer<ModelUniform>,
    /// Set 1, one per swapchain image
    sets: Vec<vk::DescriptorSet>,
}

struct ShadowMap {
    pass: RenderPass,
    /// Kept alive for the lifetime of the shadow map; only used at build time
    #[allow(dead_code)]
    pipeline: Pipeline,
    uniform: UniformBuffer<ShadowUniform>,
}

/// Owner of the imported scene and its draw path
pub struct SceneManager {
    device: Device,
    command_pool: vk::CommandPool,

    // Swapchain-independent: survives rebuilds.
    vertex_buffer: Option<Buffer>,
    index_buffer: Option<Buffer>,
    textures: Vec<Image>,
    fallback_white: u32,
    fallback_normal: u32,
    fallback_metal_rough: u32,
    materials: Vec<Material>,
    material_uniforms: Vec<UniformBuffer<MaterialParams>>,
    meshes: Vec<SceneMesh>,
    shadow: Option<ShadowMap>,
    shadow_enabled: bool,
    neutral_shadow_uniform: Option<UniformBuffer<ShadowUniform>>,

    /// Camera pose and lens
    pub camera: Camera,
    /// Light state fed into the scene uniform
    pub light: Light,

    // Swapchain-dependent: torn down in cleanup_swapchain_assets.
    scene_uniform: Option<UniformBuffer<SceneUniform>>,
    depth_probe: Option<Image>,
    pipeline: Option<Pipeline>,
    scene_sets: Vec<vk::DescriptorSet>,
    material_sets: Vec<vk::DescriptorSet>,
    shadow_set: Option<vk::DescriptorSet>,
    secondary_buffers: Vec<vk::CommandBuffer>,
}

impl SceneManager {
    /// Create an empty scene manager
    pub fn new(backend: &RenderBackend, camera: Camera, shadow_enabled: bool) -> Self {
        Self {
            device: backend.context().raw_device(),
            command_pool: backend.command_pool(),
            vertex_buffer: None,
            index_buffer: None,
            textures: Vec::new(),
            fallback_white: 0,
            fallback_normal: 0,
            fallback_metal_rough: 0,
            materials: Vec::new(),
            material_uniforms: Vec::new(),
            meshes: Vec::new(),
            shadow: None,
            shadow_enabled,
            neutral_shadow_uniform: None,
            camera,
            light: Light::default(),
            scene_uniform: None,
            depth_probe: None,
            pipeline: None,
            scene_sets: Vec::new(),
            material_sets: Vec::new(),
            shadow_set: None,
            secondary_buffers: Vec::new(),
        }
    }

    /// Upload an imported scene to the GPU. Geometry, textures and material
    /// tables are swapchain-independent and survive rebuilds.
    pub fn upload(
        &mut self,
        backend: &RenderBackend,
        loaded: LoadedScene,
    ) -> VulkanResult<()> {
        let device = self.device.clone();
        let memory_properties = *backend.memory_properties();
        let transfer = backend.one_shot();
        let image_count = backend.swapchain().image_count() as usize;
        let max_anisotropy = backend
            .context()
            .physical_device
            .properties
            .limits
            .max_sampler_anisotropy;

        // Geometry goes into one big device-local buffer pair via staging.
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&loaded.vertices);
        let staging = Buffer::new(
            device.clone(),
            &memory_properties,
            "scene_vertices_staging",
            vertex_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
        )?;
        staging.write_data(vertex_bytes)?;
        let vertex_buffer = Buffer::new(
            device.clone(),
            &memory_properties,
            "scene_vertices",
            vertex_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER,
            false,
        )?;
        transfer.copy_buffer(&staging, &vertex_buffer)?;

        let index_bytes: &[u8] = bytemuck::cast_slice(&loaded.indices);
        let staging = Buffer::new(
            device.clone(),
            &memory_properties,
            "scene_indices_staging",
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
        )?;
        staging.write_data(index_bytes)?;
        let index_buffer = Buffer::new(
            device.clone(),
            &memory_properties,
            "scene_indices",
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::INDEX_BUFFER,
            false,
        )?;
        transfer.copy_buffer(&staging, &index_buffer)?;

        self.vertex_buffer = Some(vertex_buffer);
        self.index_buffer = Some(index_buffer);

        // Texture table, then the three fallbacks appended at stable indices.
        self.textures.clear();
        for (i, texture) in loaded.textures.iter().enumerate() {
            self.textures.push(Image::sampled_from_pixels(
                device.clone(),
                &memory_properties,
                &transfer,
                &format!("scene_texture_{}", i),
                &texture.pixels,
                texture.width,
                texture.height,
                true,
                max_anisotropy,
            )?);
        }
        self.fallback_white = self.textures.len() as u32;
        self.textures.push(Image::solid_color(
            device.clone(),
            &memory_properties,
            &transfer,
            "fallback_white",
            [255, 255, 255, 255],
        )?);
        self.fallback_normal = self.textures.len() as u32;
        self.textures.push(Image::solid_color(
            device.clone(),
            &memory_properties,
            &transfer,
            "fallback_normal",
            [128, 128, 255, 255],
        )?);
        self.fallback_metal_rough = self.textures.len() as u32;
        self.textures.push(Image::solid_color(
            device.clone(),
            &memory_properties,
            &transfer,
            "fallback_metal_rough",
            [0, 255, 0, 255],
        )?);

        // Material factors are static after load: a single-copy uniform each.
        self.materials = loaded.materials;
        self.material_uniforms.clear();
        for (i, material) in self.materials.iter().enumerate() {
            let uniform = UniformBuffer::<MaterialParams>::new(
                device.clone(),
                &memory_properties,
                &format!("material_{}", i),
                1,
            )?;
            uniform.update(0, &MaterialParams::from(material))?;
            self.material_uniforms.push(uniform);
        }

        self.meshes.clear();
        for (i, data) in loaded.meshes.into_iter().enumerate() {
            let uniform = UniformBuffer::<ModelUniform>::new(
                device.clone(),
                &memory_properties,
                &format!("model_{}", i),
                image_count,
            )?;
            for image in 0..image_count {
                uniform.update(image, &ModelUniform::from(&data.model_matrix))?;
            }
            self.meshes.push(SceneMesh {
                data,
                uniform,
                sets: Vec::new(),
            });
        }

        Ok(())
    }

    /// Build swapchain-dependent state: the scene pipeline, descriptor sets,
    /// the cross-pipeline depth storage image, and (first time only) the
    /// shadow map.
    pub fn setup(
        &mut self,
        backend: &mut RenderBackend,
        render_pass: &RenderPass,
        subpass: u32,
        shader_dir: &Path,
    ) -> VulkanResult<()> {
        let device = self.device.clone();
        let memory_properties = *backend.memory_properties();
        let image_count = backend.swapchain().image_count() as usize;
        let extent = backend.swapchain().extent();

        self.camera.aspect = extent.width as f32 / extent.height.max(1) as f32;

        self.scene_uniform = Some(UniformBuffer::new(
            device.clone(),
            &memory_properties,
            "scene",
            image_count,
        )?);

        // The storage image compute probes for particle collisions; written
        // by the scene fragment shader, read by the rain update.
        self.depth_probe = Some(Image::storage(
            device.clone(),
            &memory_properties,
            &backend.one_shot(),
            extent,
            vk::Format::R32_SFLOAT,
        )?);

        let vs = crate::render::vulkan::ShaderModule::load(device.clone(), shader_dir, "scene_vs")?;
        let fs = crate::render::vulkan::ShaderModule::load(device.clone(), shader_dir, "scene_fs")?;
        let pipeline = Pipeline::graphics(
            device.clone(),
            &[&vs, &fs],
            render_pass,
            subpass,
            &FixedFunctionConfig::default(),
            Some((Vertex::STRIDE, &Vertex::OFFSETS)),
        )?;

        // Set 0 per image; set 1 per mesh per image; set 2 per material.
        let usage = pipeline.pool_usage(image_count as u32 + self.meshes.len() as u32);
        let set0_layouts = vec![pipeline.set_layout(0)?; image_count];
        self.scene_sets = backend.descriptors().allocate(&set0_layouts, &usage)?;

        let empty_usage = crate::render::vulkan::descriptors::PoolUsage::default();
        for mesh_index in 0..self.meshes.len() {
            let layouts = vec![pipeline.set_layout(1)?; image_count];
            let sets = backend.descriptors().allocate(&layouts, &empty_usage)?;
            self.meshes[mesh_index].sets = sets;
        }

        let material_layouts = vec![pipeline.set_layout(2)?; self.materials.len()];
        self.material_sets = backend.descriptors().allocate(&material_layouts, &empty_usage)?;

        let scene_uniform = self.scene_uniform.as_ref().expect("created above");
        let depth_probe = self.depth_probe.as_ref().expect("created above");
        for (image, &set) in self.scene_sets.iter().enumerate() {
            pipeline.write_uniform_buffer(
                set,
                0,
                "scene",
                scene_uniform.handle(image),
                scene_uniform.block_size(),
            )?;
            pipeline.write_storage_image(set, 0, "scene_depth_buffer", depth_probe.sampler_view())?;
        }

        for mesh in &self.meshes {
            for (image, &set) in mesh.sets.iter().enumerate() {
                pipeline.write_uniform_buffer(
                    set,
                    1,
                    "model",
                    mesh.uniform.handle(image),
                    mesh.uniform.block_size(),
                )?;
            }
        }

        for (material_index, &set) in self.material_sets.iter().enumerate() {
            let material = &self.materials[material_index];
            let uniform = &self.material_uniforms[material_index];
            pipeline.write_uniform_buffer(set, 2, "material", uniform.handle(0), uniform.block_size())?;

            let write_sampler = |name: &str, index: Option<u32>, fallback: u32| -> VulkanResult<()> {
                let texture = &self.textures[index.unwrap_or(fallback) as usize];
                let sampler = texture.sampler().ok_or_else(|| {
                    VulkanError::ResourceCreation(format!(
                        "texture for '{}' has no sampler",
                        name
                    ))
                })?;
                pipeline.write_combined_image(
                    set,
                    2,
                    name,
                    texture.sampler_view(),
                    sampler,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            };
            write_sampler("diffuse_sampler", material.base_color_texture, self.fallback_white)?;
            write_sampler(
                "metal_rough_sampler",
                material.metal_rough_texture,
                self.fallback_metal_rough,
            )?;
            write_sampler("normal_sampler", material.normal_texture, self.fallback_normal)?;
        }

        // Shadow map: built and rendered exactly once, at first setup. The
        // scene shader always declares set 3, so a disabled shadow still
        // gets a neutral binding (identity projection, white map).
        if self.shadow_enabled && self.shadow.is_none() {
            self.build_shadow_map(backend, shader_dir)?;
        }
        if self.shadow.is_none() {
            if self.neutral_shadow_uniform.is_none() {
                let uniform = UniformBuffer::<ShadowUniform>::new(
                    device.clone(),
                    &memory_properties,
                    "shadow_proj_neutral",
                    1,
                )?;
                uniform.update(
                    0,
                    &ShadowUniform {
                        light_view_proj: Mat4::identity().into(),
                    },
                )?;
                self.neutral_shadow_uniform = Some(uniform);
            }
            let uniform = self.neutral_shadow_uniform.as_ref().expect("created above");
            let layouts = [pipeline.set_layout(3)?];
            let set = backend.descriptors().allocate(&layouts, &empty_usage)?[0];
            let white = &self.textures[self.fallback_white as usize];
            let sampler = white.sampler().ok_or_else(|| {
                VulkanError::ResourceCreation("fallback texture has no sampler".into())
            })?;
            pipeline.write_combined_image(
                set,
                3,
                "shadow_map",
                white.sampler_view(),
                sampler,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?;
            pipeline.write_uniform_buffer(set, 3, "shadow_proj", uniform.handle(0), uniform.block_size())?;
            self.shadow_set = Some(set);
        }
        if let Some(shadow) = &self.shadow {
            let layouts = [pipeline.set_layout(3)?];
            let set = backend.descriptors().allocate(&layouts, &empty_usage)?[0];
            let depth = shadow
                .pass
                .depth_image()
                .ok_or_else(|| VulkanError::ResourceCreation("shadow pass has no depth".into()))?;
            let sampler = depth.sampler().ok_or_else(|| {
                VulkanError::ResourceCreation("shadow depth image has no sampler".into())
            })?;
            pipeline.write_combined_image(
                set,
                3,
                "shadow_map",
                depth.sampler_view(),
                sampler,
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            )?;
            pipeline.write_uniform_buffer(
                set,
                3,
                "shadow_proj",
                shadow.uniform.handle(0),
                shadow.uniform.block_size(),
            )?;
            self.shadow_set = Some(set);
        }

        self.pipeline = Some(pipeline);
        self.secondary_buffers =
            commands::allocate_secondary_buffers(&device, self.command_pool, image_count as u32)?;

        Ok(())
    }

    fn build_shadow_map(
        &mut self,
        backend: &mut RenderBackend,
        shader_dir: &Path,
    ) -> VulkanResult<()> {
        let device = self.device.clone();
        let memory_properties = *backend.memory_properties();
        let transfer = backend.one_shot();

        let config = RenderPassConfig {
            extent: Some(vk::Extent2D {
                width: SHADOW_MAP_SIZE,
                height: SHADOW_MAP_SIZE,
            }),
            msaa_samples: vk::SampleCountFlags::TYPE_1,
            has_color: false,
            has_depth: true,
            store_depth: true,
            offscreen: true,
            subpasses: vec![SubpassConfig {
                uses_color: false,
                uses_depth: true,
                dependencies: vec![],
            }],
        };
        let pass = RenderPass::new(device.clone(), &memory_properties, &transfer, &config, None)?;

        let vs = crate::render::vulkan::ShaderModule::load(device.clone(), shader_dir, "shadow_vs")?;
        let pipeline = Pipeline::graphics(
            device.clone(),
            &[&vs],
            &pass,
            0,
            &FixedFunctionConfig {
                cull_back_face: false,
                ..Default::default()
            },
            Some((Vertex::STRIDE, &Vertex::OFFSETS)),
        )?;

        // Light-space view-projection, looking from the light at the origin.
        let uniform =
            UniformBuffer::<ShadowUniform>::new(device.clone(), &memory_properties, "shadow_proj", 1)?;
        let mut light_camera = Camera::new(
            self.light.position,
            -self.light.position,
            90.0,
            1.0,
        );
        // A world-up reference degenerates for a straight-down light.
        light_camera.up = crate::foundation::math::Vec3::new(0.0, 1.0, 0.0);
        light_camera.near = 0.5;
        light_camera.far = 200.0;
        let light_view_proj = light_camera.projection_matrix() * light_camera.view_matrix();
        uniform.update(0, &ShadowUniform {
            light_view_proj: light_view_proj.into(),
        })?;

        // Allocate the shadow pipeline's own sets: set 0 (shadow_proj) and
        // set 1 per mesh (model).
        let empty_usage = crate::render::vulkan::descriptors::PoolUsage::default();
        let usage = pipeline.pool_usage(1 + self.meshes.len() as u32);
        let set0 = backend
            .descriptors()
            .allocate(&[pipeline.set_layout(0)?], &usage)?[0];
        pipeline.write_uniform_buffer(set0, 0, "shadow_proj", uniform.handle(0), uniform.block_size())?;

        let mut mesh_sets = Vec::with_capacity(self.meshes.len());
        for mesh in &self.meshes {
            let set = backend
                .descriptors()
                .allocate(&[pipeline.set_layout(1)?], &empty_usage)?[0];
            pipeline.write_uniform_buffer(
                set,
                1,
                "model",
                mesh.uniform.handle(0),
                mesh.uniform.block_size(),
            )?;
            mesh_sets.push(set);
        }

        // Render the static shadow map once, inline on a one-shot buffer.
        let vertex_buffer = self
            .vertex_buffer
            .as_ref()
            .ok_or_else(|| VulkanError::ResourceCreation("scene not uploaded".into()))?
            .handle();
        let index_buffer = self
            .index_buffer
            .as_ref()
            .ok_or_else(|| VulkanError::ResourceCreation("scene not uploaded".into()))?
            .handle();

        transfer.run(|cmd| {
            pass.begin_inline(cmd, 0);
            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.handle());
                device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer], &[0]);
                device.cmd_bind_index_buffer(cmd, index_buffer, 0, vk::IndexType::UINT32);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout(),
                    0,
                    &[set0],
                    &[],
                );
                for (mesh, &set) in self.meshes.iter().zip(&mesh_sets) {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        pipeline.layout(),
                        1,
                        &[set],
                        &[],
                    );
                    for surface in &mesh.data.surfaces {
                        device.cmd_draw_indexed(
                            cmd,
                            surface.index_count,
                            1,
                            surface.index_start,
                            surface.vertex_start as i32,
                            0,
                        );
                    }
                }
            }
            pass.end(cmd);
        })?;

        log::info!("Shadow map rendered at {0}x{0}", SHADOW_MAP_SIZE);
        self.shadow = Some(ShadowMap {
            pass,
            pipeline,
            uniform,
        });
        Ok(())
    }

    /// Refresh the scene and model uniforms for the image about to be drawn
    pub fn update(&mut self, image_index: usize) -> VulkanResult<()> {
        self.camera.update_follow();

        if let Some(uniform) = &self.scene_uniform {
            uniform.update(
                image_index,
                &SceneUniform {
                    view: self.camera.view_matrix().into(),
                    proj: self.camera.projection_matrix().into(),
                    light_position: [
                        self.light.position.x,
                        self.light.position.y,
                        self.light.position.z,
                        1.0,
                    ],
                    light_params: [self.light.intensity, self.light.ambient_intensity, 0.0, 0.0],
                },
            )?;
        }

        for mesh in &self.meshes {
            mesh.uniform
                .update(image_index, &ModelUniform::from(&mesh.data.model_matrix))?;
        }
        Ok(())
    }

    /// Set a mesh's model matrix (demo animation hook)
    pub fn set_model_matrix(&mut self, mesh_index: usize, matrix: Mat4) {
        if let Some(mesh) = self.meshes.get_mut(mesh_index) {
            mesh.data.model_matrix = matrix;
        }
    }

    /// A mesh's current model matrix
    pub fn model_matrix(&self, mesh_index: usize) -> Option<Mat4> {
        self.meshes.get(mesh_index).map(|m| m.data.model_matrix)
    }

    /// Number of imported meshes
    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    /// The storage image holding scene depth for the compute pipeline
    pub fn depth_probe(&self) -> Option<&Image> {
        self.depth_probe.as_ref()
    }

    /// Drop swapchain-dependent state ahead of a rebuild. Geometry, textures,
    /// materials and the shadow map survive.
    pub fn cleanup_swapchain_assets(&mut self) {
        if !self.secondary_buffers.is_empty() {
            unsafe {
                self.device
                    .free_command_buffers(self.command_pool, &self.secondary_buffers);
            }
            self.secondary_buffers.clear();
        }
        self.pipeline = None;
        self.depth_probe = None;
        self.scene_uniform = None;
        // Sets come back with the pool reset in the backend.
        self.scene_sets.clear();
        self.material_sets.clear();
        self.shadow_set = None;
        for mesh in &mut self.meshes {
            mesh.sets.clear();
        }
    }
}

impl SubpassRecorder for SceneManager {
    fn record(
        &mut self,
        image_index: u32,
        pass: &RenderPass,
        subpass: u32,
    ) -> VulkanResult<vk::CommandBuffer> {
        let image = image_index as usize;
        let cmd = self.secondary_buffers[image];
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| VulkanError::ResourceCreation("scene pipeline not built".into()))?;
        let vertex_buffer = self
            .vertex_buffer
            .as_ref()
            .ok_or_else(|| VulkanError::ResourceCreation("scene not uploaded".into()))?;
        let index_buffer = self
            .index_buffer
            .as_ref()
            .ok_or_else(|| VulkanError::ResourceCreation("scene not uploaded".into()))?;

        commands::begin_secondary(
            &self.device,
            cmd,
            pass.handle(),
            subpass,
            pass.framebuffer(image),
        )?;

        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.handle());

            // Set 0 (scene) and, when present, set 3 (shadow map) are bound
            // once for the whole scene.
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout(),
                0,
                &[self.scene_sets[image]],
                &[],
            );
            if let Some(shadow_set) = self.shadow_set {
                self.device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout(),
                    3,
                    &[shadow_set],
                    &[],
                );
            }

            self.device
                .cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer.handle()], &[0]);
            self.device
                .cmd_bind_index_buffer(cmd, index_buffer.handle(), 0, vk::IndexType::UINT32);

            for mesh in &self.meshes {
                self.device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout(),
                    1,
                    &[mesh.sets[image]],
                    &[],
                );
                for surface in &mesh.data.surfaces {
                    self.device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        pipeline.layout(),
                        2,
                        &[self.material_sets[surface.material_index as usize]],
                        &[],
                    );
                    self.device.cmd_draw_indexed(
                        cmd,
                        surface.index_count,
                        1,
                        surface.index_start,
                        surface.vertex_start as i32,
                        0,
                    );
                }
            }

            self.device
                .end_command_buffer(cmd)
                .map_err(VulkanError::Api)?;
        }

        Ok(cmd)
    }
}
