//! Pipeline assembly
//!
//! Graphics, mesh and compute pipelines share one layout-assembly path: the
//! reflection tables of every stage are merged into descriptor-set layouts,
//! a binding-name map and push-constant ranges. Merging is strict: two
//! stages disagreeing about a slot is an error at creation time, not a
//! validation message at draw time.

use ash::{vk, Device};
use std::collections::{BTreeMap, HashMap};

use crate::render::vulkan::context::{VulkanError, VulkanResult};
use crate::render::vulkan::descriptors::PoolUsage;
use crate::render::vulkan::render_pass::RenderPass;
use crate::render::vulkan::shader::{ReflectedBinding, ReflectedPushConstant, ShaderModule};

/// Which pipeline variant a [`Pipeline`] is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    /// Vertex (+ optional geometry) + fragment
    Graphics,
    /// Mesh + fragment
    Mesh,
    /// Single compute stage
    Compute,
}

/// Fixed-function state switches for graphics pipelines
#[derive(Debug, Clone)]
pub struct FixedFunctionConfig {
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Cull back faces (front = counter-clockwise)
    pub cull_back_face: bool,
    /// Enable depth test and write
    pub enable_depth_testing: bool,
    /// Enable stencil test
    pub enable_stencil_test: bool,
    /// Enable SRC_ALPHA / ONE_MINUS_SRC_ALPHA blending
    pub enable_transparency: bool,
    /// Rasterize as wireframe
    pub show_wireframe: bool,
    /// Make viewport and scissor dynamic instead of baked
    pub dynamic_states: bool,
    /// Enable the 0xFFFFFFFF primitive-restart index
    pub enable_primitive_restart: bool,
}

impl Default for FixedFunctionConfig {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_back_face: true,
            enable_depth_testing: true,
            enable_stencil_test: false,
            enable_transparency: false,
            show_wireframe: false,
            dynamic_states: false,
            enable_primitive_restart: false,
        }
    }
}

/// One binding after merging across stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedBinding {
    /// Binding slot
    pub binding: u32,
    /// Descriptor type (identical across stages by construction)
    pub descriptor_type: vk::DescriptorType,
    /// Descriptor count
    pub count: u32,
    /// OR of every stage that references the slot
    pub stages: vk::ShaderStageFlags,
    /// Variable name
    pub name: String,
}

/// Merged descriptor layout: set id -> ordered bindings
pub type MergedSets = BTreeMap<u32, Vec<MergedBinding>>;

/// Binding-name metadata: set id -> (name -> slot)
pub type BindingNames = BTreeMap<u32, HashMap<String, u32>>;

/// Union the reflected bindings of all stages.
///
/// The same slot in several stages must agree on type and count; its stage
/// flags are OR-ed. Different types at one slot is a hard error.
pub fn merge_bindings(stages: &[&[ReflectedBinding]]) -> VulkanResult<MergedSets> {
    let mut sets: MergedSets = BTreeMap::new();

    for bindings in stages {
        for reflected in *bindings {
            let entries = sets.entry(reflected.set).or_default();
            if let Some(existing) = entries.iter_mut().find(|b| b.binding == reflected.binding) {
                if existing.descriptor_type != reflected.descriptor_type
                    || existing.count != reflected.count
                {
                    return Err(VulkanError::LayoutMerge(format!(
                        "set {} binding {}: '{}' is {:?} x{} in one stage but '{}' is {:?} x{} in another",
                        reflected.set,
                        reflected.binding,
                        existing.name,
                        existing.descriptor_type,
                        existing.count,
                        reflected.name,
                        reflected.descriptor_type,
                        reflected.count,
                    )));
                }
                existing.stages |= reflected.stages;
            } else {
                entries.push(MergedBinding {
                    binding: reflected.binding,
                    descriptor_type: reflected.descriptor_type,
                    count: reflected.count,
                    stages: reflected.stages,
                    name: reflected.name.clone(),
                });
            }
        }
    }

    for entries in sets.values_mut() {
        entries.sort_by_key(|b| b.binding);
    }
    Ok(sets)
}

/// Build the (set, name) -> slot map, rejecting a name that points at two
/// different slots within one set.
pub fn merge_binding_names(sets: &MergedSets) -> VulkanResult<BindingNames> {
    let mut names: BindingNames = BTreeMap::new();
    for (&set, entries) in sets {
        let map = names.entry(set).or_default();
        for binding in entries {
            if binding.name.is_empty() {
                continue;
            }
            match map.get(&binding.name) {
                Some(&slot) if slot != binding.binding => {
                    return Err(VulkanError::LayoutMerge(format!(
                        "set {}: name '{}' maps to both slot {} and slot {}",
                        set, binding.name, slot, binding.binding
                    )));
                }
                _ => {
                    map.insert(binding.name.clone(), binding.binding);
                }
            }
        }
    }
    Ok(names)
}

/// Merge push-constant blocks by name: the same block in several stages gets
/// OR-ed stage flags; same name with different extent is an error.
pub fn merge_push_constants(
    stages: &[&[ReflectedPushConstant]],
) -> VulkanResult<Vec<ReflectedPushConstant>> {
    let mut merged: Vec<ReflectedPushConstant> = Vec::new();

    for blocks in stages {
        for block in *blocks {
            if let Some(existing) = merged.iter_mut().find(|b| b.name == block.name) {
                if existing.offset != block.offset || existing.size != block.size {
                    return Err(VulkanError::LayoutMerge(format!(
                        "push-constant block '{}': ({}, {}) in one stage vs ({}, {}) in another",
                        block.name, existing.offset, existing.size, block.offset, block.size
                    )));
                }
                existing.stages |= block.stages;
            } else {
                merged.push(block.clone());
            }
        }
    }

    Ok(merged)
}

/// Descriptor demand of a merged layout, for pool accounting
pub fn pool_usage_of(sets: &MergedSets, copies: u32) -> PoolUsage {
    let mut usage = PoolUsage::default();
    usage.sets = sets.len() as u32 * copies;
    for entries in sets.values() {
        for binding in entries {
            *usage.counts.entry(binding.descriptor_type).or_insert(0) += binding.count * copies;
        }
    }
    usage
}

/// A pipeline with its layout, per-set layout handles and name metadata
pub struct Pipeline {
    device: Device,
    kind: PipelineKind,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    /// Contiguous set layouts by ascending set id; ids absent from the
    /// shaders get an empty layout so the list has no holes
    set_layouts: Vec<vk::DescriptorSetLayout>,
    merged_sets: MergedSets,
    binding_names: BindingNames,
    push_constants: HashMap<String, ReflectedPushConstant>,
}

impl Pipeline {
    /// Assemble a graphics pipeline from its shader stages.
    ///
    /// When `host_vertex_layout` is given as `(stride, offsets)`, the vertex
    /// shader's reflected input signature is checked against it first.
    pub fn graphics(
        device: Device,
        shaders: &[&ShaderModule],
        render_pass: &RenderPass,
        subpass: u32,
        config: &FixedFunctionConfig,
        host_vertex_layout: Option<(u32, &[u32])>,
    ) -> VulkanResult<Self> {
        Self::raster(
            device,
            PipelineKind::Graphics,
            shaders,
            render_pass,
            subpass,
            config,
            host_vertex_layout,
        )
    }

    /// Assemble a mesh-shading pipeline: identical to graphics, minus the
    /// vertex-input and input-assembly stages.
    pub fn mesh(
        device: Device,
        shaders: &[&ShaderModule],
        render_pass: &RenderPass,
        subpass: u32,
        config: &FixedFunctionConfig,
    ) -> VulkanResult<Self> {
        Self::raster(
            device,
            PipelineKind::Mesh,
            shaders,
            render_pass,
            subpass,
            config,
            None,
        )
    }

    /// Assemble a compute pipeline from a single stage
    pub fn compute(device: Device, shader: &ShaderModule) -> VulkanResult<Self> {
        let (set_layouts, layout, merged_sets, binding_names, push_constants) =
            Self::build_layout(&device, &[shader])?;

        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(shader.stage_info())
            .layout(layout)
            .build();

        let pipeline = match unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                Self::destroy_layout(&device, layout, &set_layouts);
                return Err(VulkanError::Api(e));
            }
        };

        Ok(Self {
            device,
            kind: PipelineKind::Compute,
            pipeline,
            layout,
            set_layouts,
            merged_sets,
            binding_names,
            push_constants,
        })
    }

    fn raster(
        device: Device,
        kind: PipelineKind,
        shaders: &[&ShaderModule],
        render_pass: &RenderPass,
        subpass: u32,
        config: &FixedFunctionConfig,
        host_vertex_layout: Option<(u32, &[u32])>,
    ) -> VulkanResult<Self> {
        let vertex_reflection = shaders
            .iter()
            .find(|s| s.stage() == vk::ShaderStageFlags::VERTEX)
            .and_then(|s| s.vertex_input());

        if let (Some((stride, offsets)), Some(reflection)) = (host_vertex_layout, vertex_reflection)
        {
            reflection.verify_host_layout(stride, offsets)?;
        }

        let (set_layouts, layout, merged_sets, binding_names, push_constants) =
            Self::build_layout(&device, shaders)?;

        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo> =
            shaders.iter().map(|s| s.stage_info()).collect();

        // Vertex input only exists on the variant with a vertex-assembly
        // stage; mesh pipelines start at the mesh stage.
        let binding_descriptions: Vec<vk::VertexInputBindingDescription>;
        let attribute_descriptions: Vec<vk::VertexInputAttributeDescription>;
        let vertex_input_state = if kind == PipelineKind::Graphics {
            match vertex_reflection {
                Some(reflection) => {
                    binding_descriptions = vec![reflection.binding_description()];
                    attribute_descriptions = reflection.attribute_descriptions();
                }
                None => {
                    binding_descriptions = Vec::new();
                    attribute_descriptions = Vec::new();
                }
            }
            vk::PipelineVertexInputStateCreateInfo::builder()
                .vertex_binding_descriptions(&binding_descriptions)
                .vertex_attribute_descriptions(&attribute_descriptions)
                .build()
        } else {
            vk::PipelineVertexInputStateCreateInfo::default()
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(config.topology)
            .primitive_restart_enable(config.enable_primitive_restart);

        let viewports = [render_pass.viewport()];
        let scissors = [render_pass.scissor()];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(if config.show_wireframe {
                vk::PolygonMode::LINE
            } else {
                vk::PolygonMode::FILL
            })
            .line_width(1.0)
            .cull_mode(if config.cull_back_face {
                vk::CullModeFlags::BACK
            } else {
                vk::CullModeFlags::NONE
            })
            // Imported geometry is mirrored by the axis conversion, which
            // flips glTF's counter-clockwise winding.
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let samples = render_pass.msaa_samples();
        let multisampled = samples != vk::SampleCountFlags::TYPE_1;
        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(multisampled)
            .min_sample_shading(if multisampled { 0.2 } else { 0.0 })
            .rasterization_samples(samples);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(config.enable_depth_testing)
            .depth_write_enable(config.enable_depth_testing && !config.enable_transparency)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(config.enable_stencil_test);

        let color_blend_attachment = if config.enable_transparency {
            vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build()
        } else {
            vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(false)
                .build()
        };

        // Depth-only passes (the shadow map) have zero color attachments;
        // the blend state must agree.
        let color_blend_attachments = if render_pass.has_color() {
            vec![color_blend_attachment]
        } else {
            Vec::new()
        };
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state_info =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stage_infos)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .layout(layout)
            .render_pass(render_pass.handle())
            .subpass(subpass);

        if kind == PipelineKind::Graphics {
            pipeline_info = pipeline_info.vertex_input_state(&vertex_input_state);
        }
        if config.dynamic_states {
            pipeline_info = pipeline_info.dynamic_state(&dynamic_state_info);
        }

        let pipeline = match unsafe {
            device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[pipeline_info.build()],
                None,
            )
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                Self::destroy_layout(&device, layout, &set_layouts);
                return Err(VulkanError::Api(e));
            }
        };

        Ok(Self {
            device,
            kind,
            pipeline,
            layout,
            set_layouts,
            merged_sets,
            binding_names,
            push_constants,
        })
    }

    #[allow(clippy::type_complexity)]
    fn build_layout(
        device: &Device,
        shaders: &[&ShaderModule],
    ) -> VulkanResult<(
        Vec<vk::DescriptorSetLayout>,
        vk::PipelineLayout,
        MergedSets,
        BindingNames,
        HashMap<String, ReflectedPushConstant>,
    )> {
        let binding_tables: Vec<&[ReflectedBinding]> =
            shaders.iter().map(|s| s.bindings()).collect();
        let merged_sets = merge_bindings(&binding_tables)?;
        let binding_names = merge_binding_names(&merged_sets)?;

        let push_tables: Vec<&[ReflectedPushConstant]> =
            shaders.iter().map(|s| s.push_constants()).collect();
        let merged_push = merge_push_constants(&push_tables)?;

        // Contiguous layouts from set 0 up to the highest used id. A shader
        // that only declares set 2 still gets layouts for 0 and 1, empty.
        let max_set = merged_sets.keys().max().copied();
        let mut set_layouts = Vec::new();
        if let Some(max_set) = max_set {
            for set in 0..=max_set {
                let bindings: Vec<vk::DescriptorSetLayoutBinding> = merged_sets
                    .get(&set)
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|b| {
                                vk::DescriptorSetLayoutBinding::builder()
                                    .binding(b.binding)
                                    .descriptor_type(b.descriptor_type)
                                    .descriptor_count(b.count)
                                    .stage_flags(b.stages)
                                    .build()
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                let create_info =
                    vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
                let set_layout = match unsafe {
                    device.create_descriptor_set_layout(&create_info, None)
                } {
                    Ok(layout) => layout,
                    Err(e) => {
                        for &created in &set_layouts {
                            unsafe { device.destroy_descriptor_set_layout(created, None) };
                        }
                        return Err(VulkanError::Api(e));
                    }
                };
                set_layouts.push(set_layout);
            }
        }

        let push_ranges: Vec<vk::PushConstantRange> = merged_push
            .iter()
            .map(|block| vk::PushConstantRange {
                stage_flags: block.stages,
                offset: block.offset,
                size: block.size,
            })
            .collect();

        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);

        let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                for &created in &set_layouts {
                    unsafe { device.destroy_descriptor_set_layout(created, None) };
                }
                return Err(VulkanError::Api(e));
            }
        };

        let push_constants = merged_push
            .into_iter()
            .map(|block| (block.name.clone(), block))
            .collect();

        Ok((set_layouts, layout, merged_sets, binding_names, push_constants))
    }

    fn destroy_layout(
        device: &Device,
        layout: vk::PipelineLayout,
        set_layouts: &[vk::DescriptorSetLayout],
    ) {
        unsafe {
            device.destroy_pipeline_layout(layout, None);
            for &set_layout in set_layouts {
                device.destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }

    /// Pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Pipeline layout handle
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Which variant this pipeline is
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    /// Bind point matching the pipeline kind
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.kind {
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
            _ => vk::PipelineBindPoint::GRAPHICS,
        }
    }

    /// Descriptor-set layout for one set id
    pub fn set_layout(&self, set: u32) -> VulkanResult<vk::DescriptorSetLayout> {
        self.set_layouts.get(set as usize).copied().ok_or_else(|| {
            VulkanError::LayoutMerge(format!("pipeline has no descriptor set {}", set))
        })
    }

    /// Slot for a semantic binding name within a set
    pub fn binding_slot(&self, set: u32, name: &str) -> VulkanResult<u32> {
        self.binding_names
            .get(&set)
            .and_then(|names| names.get(name))
            .copied()
            .ok_or_else(|| {
                VulkanError::LayoutMerge(format!("no binding named '{}' in set {}", name, set))
            })
    }

    /// Merged binding tables (set id -> bindings)
    pub fn merged_sets(&self) -> &MergedSets {
        &self.merged_sets
    }

    /// Push-constant block by name
    pub fn push_constant(&self, name: &str) -> VulkanResult<&ReflectedPushConstant> {
        self.push_constants.get(name).ok_or_else(|| {
            VulkanError::LayoutMerge(format!("no push-constant block named '{}'", name))
        })
    }

    /// Descriptor demand of this pipeline for `copies` replicas of each set
    pub fn pool_usage(&self, copies: u32) -> PoolUsage {
        pool_usage_of(&self.merged_sets, copies)
    }

    /// Push a constant block by name
    pub fn push<T: bytemuck::Pod>(
        &self,
        cmd: vk::CommandBuffer,
        name: &str,
        value: &T,
    ) -> VulkanResult<()> {
        let block = self.push_constant(name)?;
        unsafe {
            self.device.cmd_push_constants(
                cmd,
                self.layout,
                block.stages,
                block.offset,
                bytemuck::bytes_of(value),
            );
        }
        Ok(())
    }

    /// Write a uniform-buffer descriptor by name
    pub fn write_uniform_buffer(
        &self,
        set: vk::DescriptorSet,
        set_id: u32,
        name: &str,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) -> VulkanResult<()> {
        let slot = self.binding_slot(set_id, name)?;
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(slot)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    /// Write a storage-buffer descriptor by name
    pub fn write_storage_buffer(
        &self,
        set: vk::DescriptorSet,
        set_id: u32,
        name: &str,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) -> VulkanResult<()> {
        let slot = self.binding_slot(set_id, name)?;
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(slot)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    /// Write a storage-texel-buffer descriptor by name
    pub fn write_texel_buffer(
        &self,
        set: vk::DescriptorSet,
        set_id: u32,
        name: &str,
        view: vk::BufferView,
    ) -> VulkanResult<()> {
        let slot = self.binding_slot(set_id, name)?;
        let views = [view];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(slot)
            .descriptor_type(vk::DescriptorType::STORAGE_TEXEL_BUFFER)
            .texel_buffer_view(&views)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    /// Write a combined-image-sampler descriptor by name
    pub fn write_combined_image(
        &self,
        set: vk::DescriptorSet,
        set_id: u32,
        name: &str,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> VulkanResult<()> {
        let slot = self.binding_slot(set_id, name)?;
        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: layout,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(slot)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    /// Write a whole combined-image-sampler array by name
    pub fn write_combined_image_array(
        &self,
        set: vk::DescriptorSet,
        set_id: u32,
        name: &str,
        infos: &[vk::DescriptorImageInfo],
    ) -> VulkanResult<()> {
        let slot = self.binding_slot(set_id, name)?;
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(slot)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(infos)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    /// Write a storage-image descriptor by name
    pub fn write_storage_image(
        &self,
        set: vk::DescriptorSet,
        set_id: u32,
        name: &str,
        view: vk::ImageView,
    ) -> VulkanResult<()> {
        let slot = self.binding_slot(set_id, name)?;
        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: vk::ImageLayout::GENERAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(slot)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&image_info)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Reverse order of creation: pipeline, layout, then set layouts.
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            for &set_layout in &self.set_layouts {
                self.device.destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(
        set: u32,
        slot: u32,
        ty: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
        name: &str,
    ) -> ReflectedBinding {
        ReflectedBinding {
            set,
            binding: slot,
            descriptor_type: ty,
            count,
            stages,
            name: name.to_string(),
        }
    }

    #[test]
    fn shared_slots_or_their_stage_flags() {
        let vs = [binding(
            0,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::VERTEX,
            "scene",
        )];
        let fs = [binding(
            0,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::FRAGMENT,
            "scene",
        )];

        let merged = merge_bindings(&[&vs, &fs]).unwrap();
        let entries = &merged[&0];
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn type_conflicts_at_a_slot_are_hard_errors() {
        let vs = [binding(
            0,
            1,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::VERTEX,
            "model",
        )];
        let fs = [binding(
            0,
            1,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            vk::ShaderStageFlags::FRAGMENT,
            "diffuse_sampler",
        )];

        assert!(matches!(
            merge_bindings(&[&vs, &fs]),
            Err(VulkanError::LayoutMerge(_))
        ));
    }

    #[test]
    fn disjoint_sets_union_and_sort() {
        let vs = [
            binding(1, 0, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::VERTEX, "model"),
            binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::VERTEX, "scene"),
        ];
        let fs = [
            binding(2, 1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4, vk::ShaderStageFlags::FRAGMENT, "textures"),
            binding(2, 0, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::FRAGMENT, "material"),
        ];

        let merged = merge_bindings(&[&vs, &fs]).unwrap();
        assert_eq!(merged.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        // Bindings within a set come out slot-ordered.
        assert_eq!(merged[&2][0].binding, 0);
        assert_eq!(merged[&2][1].binding, 1);
        assert_eq!(merged[&2][1].count, 4);
    }

    #[test]
    fn binding_names_map_to_slots() {
        let vs = [
            binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::VERTEX, "scene"),
            binding(0, 1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1, vk::ShaderStageFlags::FRAGMENT, "shadow_map"),
        ];
        let merged = merge_bindings(&[&vs]).unwrap();
        let names = merge_binding_names(&merged).unwrap();
        assert_eq!(names[&0]["scene"], 0);
        assert_eq!(names[&0]["shadow_map"], 1);
    }

    #[test]
    fn push_constant_blocks_merge_by_name() {
        let vs = [ReflectedPushConstant {
            name: "transform".to_string(),
            offset: 0,
            size: 64,
            stages: vk::ShaderStageFlags::VERTEX,
        }];
        let fs = [ReflectedPushConstant {
            name: "transform".to_string(),
            offset: 0,
            size: 64,
            stages: vk::ShaderStageFlags::FRAGMENT,
        }];

        let merged = merge_push_constants(&[&vs, &fs]).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn push_constant_extent_conflicts_are_errors() {
        let vs = [ReflectedPushConstant {
            name: "transform".to_string(),
            offset: 0,
            size: 64,
            stages: vk::ShaderStageFlags::VERTEX,
        }];
        let fs = [ReflectedPushConstant {
            name: "transform".to_string(),
            offset: 0,
            size: 80,
            stages: vk::ShaderStageFlags::FRAGMENT,
        }];

        assert!(matches!(
            merge_push_constants(&[&vs, &fs]),
            Err(VulkanError::LayoutMerge(_))
        ));
    }

    #[test]
    fn pool_usage_counts_descriptors_per_copy() {
        let vs = [
            binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::VERTEX, "scene"),
            binding(2, 0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 8, vk::ShaderStageFlags::FRAGMENT, "textures"),
        ];
        let merged = merge_bindings(&[&vs]).unwrap();
        let usage = pool_usage_of(&merged, 2);

        assert_eq!(usage.sets, 4);
        assert_eq!(usage.counts[&vk::DescriptorType::UNIFORM_BUFFER], 2);
        assert_eq!(usage.counts[&vk::DescriptorType::COMBINED_IMAGE_SAMPLER], 16);
    }
}
