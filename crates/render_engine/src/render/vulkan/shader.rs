//! Shader module loading and SPIR-V reflection
//!
//! A shader blob is loaded by logical name (`<program>_vs.spv` and friends)
//! and reflected with spirq into three tables: descriptor bindings, push
//! constants, and (vertex stage only) the vertex-input signature. Higher
//! layers bind resources by the names extracted here instead of numeric
//! slots.

use ash::{vk, Device};
use std::path::{Path, PathBuf};

use crate::render::vulkan::context::{VulkanError, VulkanResult};

/// One reflected descriptor binding
#[derive(Debug, Clone)]
pub struct ReflectedBinding {
    /// Descriptor set id
    pub set: u32,
    /// Binding slot within the set
    pub binding: u32,
    /// Vulkan descriptor type
    pub descriptor_type: vk::DescriptorType,
    /// Descriptor count; array dimensions are multiplied in
    pub count: u32,
    /// Stages that reference the binding
    pub stages: vk::ShaderStageFlags,
    /// Variable name as declared in the shader
    pub name: String,
}

/// One reflected push-constant block
#[derive(Debug, Clone)]
pub struct ReflectedPushConstant {
    /// Block name as declared in the shader
    pub name: String,
    /// Byte offset of the block
    pub offset: u32,
    /// Byte size of the block
    pub size: u32,
    /// Owning stage flags
    pub stages: vk::ShaderStageFlags,
}

/// One reflected vertex-input attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectedAttribute {
    /// Input location
    pub location: u32,
    /// Attribute format
    pub format: vk::Format,
    /// Byte offset within the interleaved vertex
    pub offset: u32,
}

/// Vertex-input signature reflected from a vertex shader: one interleaved
/// binding with location-sorted attributes.
#[derive(Debug, Clone, Default)]
pub struct VertexInputReflection {
    /// Attributes sorted by location
    pub attributes: Vec<ReflectedAttribute>,
    /// Total stride of the interleaved vertex
    pub stride: u32,
}

impl VertexInputReflection {
    /// Binding description for the single interleaved vertex buffer
    pub fn binding_description(&self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Attribute descriptions in location order
    pub fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|attr| vk::VertexInputAttributeDescription {
                location: attr.location,
                binding: 0,
                format: attr.format,
                offset: attr.offset,
            })
            .collect()
    }

    /// Check a host-side struct layout against the reflected signature.
    /// Catches struct/shader mismatches at pipeline creation instead of as
    /// garbage geometry.
    pub fn verify_host_layout(&self, stride: u32, offsets: &[u32]) -> VulkanResult<()> {
        if stride != self.stride {
            return Err(VulkanError::VertexLayoutMismatch(format!(
                "host stride {} != reflected stride {}",
                stride, self.stride
            )));
        }
        if offsets.len() != self.attributes.len() {
            return Err(VulkanError::VertexLayoutMismatch(format!(
                "host declares {} attributes, shader expects {}",
                offsets.len(),
                self.attributes.len()
            )));
        }
        for (host_offset, attr) in offsets.iter().zip(&self.attributes) {
            if *host_offset != attr.offset {
                return Err(VulkanError::VertexLayoutMismatch(format!(
                    "attribute at location {}: host offset {} != reflected offset {}",
                    attr.location, host_offset, attr.offset
                )));
            }
        }
        Ok(())
    }
}

/// Byte size of a vertex attribute format
pub fn format_size(format: vk::Format) -> u32 {
    match format {
        vk::Format::R32_SFLOAT | vk::Format::R32_SINT | vk::Format::R32_UINT => 4,
        vk::Format::R32G32_SFLOAT | vk::Format::R32G32_SINT | vk::Format::R32G32_UINT => 8,
        vk::Format::R32G32B32_SFLOAT | vk::Format::R32G32B32_SINT | vk::Format::R32G32B32_UINT => {
            12
        }
        vk::Format::R32G32B32A32_SFLOAT
        | vk::Format::R32G32B32A32_SINT
        | vk::Format::R32G32B32A32_UINT => 16,
        vk::Format::R16G16B16A16_SFLOAT => 8,
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_UINT => 4,
        _ => 0,
    }
}

/// Compute attribute offsets and total stride for location-sorted formats
pub fn accumulate_offsets(formats: &[(u32, vk::Format)]) -> VertexInputReflection {
    let mut sorted: Vec<(u32, vk::Format)> = formats.to_vec();
    sorted.sort_by_key(|(location, _)| *location);

    let mut attributes = Vec::with_capacity(sorted.len());
    let mut offset = 0;
    for (location, format) in sorted {
        attributes.push(ReflectedAttribute {
            location,
            format,
            offset,
        });
        offset += format_size(format);
    }

    VertexInputReflection {
        attributes,
        stride: offset,
    }
}

/// Shader module with its reflection tables
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
    name: String,
    stage: vk::ShaderStageFlags,
    bindings: Vec<ReflectedBinding>,
    push_constants: Vec<ReflectedPushConstant>,
    vertex_input: Option<VertexInputReflection>,
}

impl ShaderModule {
    /// Load `<shader_dir>/<name>.spv` and reflect it. The stage is inferred
    /// from the conventional name suffix (`_vs`, `_fs`, `_gs`, `_ms`, `_cp`).
    pub fn load(device: Device, shader_dir: &Path, name: &str) -> VulkanResult<Self> {
        let stage = stage_from_name(name).ok_or_else(|| {
            VulkanError::Reflection(format!(
                "shader name '{}' has no recognized stage suffix",
                name
            ))
        })?;

        let path: PathBuf = shader_dir.join(format!("{}.spv", name));
        let bytes = std::fs::read(&path).map_err(|e| {
            VulkanError::InitializationFailed(format!(
                "failed to read shader {:?}: {}",
                path, e
            ))
        })?;

        Self::from_bytes(device, &bytes, stage, name)
    }

    /// Create a module from raw SPIR-V bytes with an explicit stage
    pub fn from_bytes(
        device: Device,
        bytes: &[u8],
        stage: vk::ShaderStageFlags,
        name: &str,
    ) -> VulkanResult<Self> {
        // SPIR-V words are u32-aligned; a misaligned blob is corrupt.
        let (prefix, words, suffix) = unsafe { bytes.align_to::<u32>() };
        if !prefix.is_empty() || !suffix.is_empty() {
            return Err(VulkanError::InitializationFailed(format!(
                "SPIR-V blob '{}' is not 4-byte aligned",
                name
            )));
        }

        let (bindings, push_constants, vertex_input) = reflect_spirv(words, stage, name)?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(words);
        let module = unsafe {
            device
                .create_shader_module(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        log::debug!(
            "Loaded shader '{}': {} bindings, {} push-constant blocks",
            name,
            bindings.len(),
            push_constants.len()
        );

        Ok(Self {
            device,
            module,
            name: name.to_string(),
            stage,
            bindings,
            push_constants,
            vertex_input,
        })
    }

    /// Shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Logical shader name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage this module was built for
    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    /// Reflected descriptor bindings
    pub fn bindings(&self) -> &[ReflectedBinding] {
        &self.bindings
    }

    /// Reflected push-constant blocks
    pub fn push_constants(&self) -> &[ReflectedPushConstant] {
        &self.push_constants
    }

    /// Reflected vertex-input signature (vertex stage only)
    pub fn vertex_input(&self) -> Option<&VertexInputReflection> {
        self.vertex_input.as_ref()
    }

    /// Stage create-info for pipeline assembly
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        const ENTRY: &std::ffi::CStr =
            unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"main\0") };
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.stage)
            .module(self.module)
            .name(ENTRY)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Map the conventional shader-name suffix to a stage
pub fn stage_from_name(name: &str) -> Option<vk::ShaderStageFlags> {
    let suffix = name.rsplit('_').next()?;
    match suffix {
        "vs" => Some(vk::ShaderStageFlags::VERTEX),
        "fs" => Some(vk::ShaderStageFlags::FRAGMENT),
        "gs" => Some(vk::ShaderStageFlags::GEOMETRY),
        "ms" => Some(vk::ShaderStageFlags::MESH_EXT),
        "cp" => Some(vk::ShaderStageFlags::COMPUTE),
        _ => None,
    }
}

type ReflectionTables = (
    Vec<ReflectedBinding>,
    Vec<ReflectedPushConstant>,
    Option<VertexInputReflection>,
);

/// Reflect a SPIR-V blob into the framework's tables
fn reflect_spirv(
    words: &[u32],
    stage: vk::ShaderStageFlags,
    name: &str,
) -> VulkanResult<ReflectionTables> {
    let entry_points = spirq::ReflectConfig::new()
        .spv(words)
        .ref_all_rscs(true)
        .reflect()
        .map_err(|e| {
            VulkanError::Reflection(format!("SPIR-V reflection failed for '{}': {:?}", name, e))
        })?;

    let mut bindings = Vec::new();
    let mut push_constants = Vec::new();
    let mut input_formats: Vec<(u32, vk::Format)> = Vec::new();

    for entry_point in &entry_points {
        for var in entry_point.vars.iter() {
            match var {
                spirq::var::Variable::Descriptor {
                    name: var_name,
                    desc_bind,
                    desc_ty,
                    nbind,
                    ..
                } => {
                    bindings.push(ReflectedBinding {
                        set: desc_bind.set(),
                        binding: desc_bind.bind(),
                        descriptor_type: descriptor_type_to_vk(desc_ty, name)?,
                        count: (*nbind).max(1),
                        stages: stage,
                        name: var_name.clone().unwrap_or_default(),
                    });
                }
                spirq::var::Variable::PushConstant { name: var_name, ty } => {
                    let size = ty.nbyte().unwrap_or(0) as u32;
                    push_constants.push(ReflectedPushConstant {
                        name: var_name.clone().unwrap_or_default(),
                        offset: push_constant_offset(ty),
                        size,
                        stages: stage,
                    });
                }
                spirq::var::Variable::Input { location, ty, .. } => {
                    if stage == vk::ShaderStageFlags::VERTEX {
                        if let Some(format) = input_format_to_vk(ty) {
                            input_formats.push((location.loc(), format));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    bindings.sort_by_key(|b| (b.set, b.binding));

    let vertex_input = (stage == vk::ShaderStageFlags::VERTEX && !input_formats.is_empty())
        .then(|| accumulate_offsets(&input_formats));

    Ok((bindings, push_constants, vertex_input))
}

fn descriptor_type_to_vk(
    desc_ty: &spirq::ty::DescriptorType,
    shader: &str,
) -> VulkanResult<vk::DescriptorType> {
    use spirq::ty::DescriptorType as D;
    match desc_ty {
        D::UniformBuffer() => Ok(vk::DescriptorType::UNIFORM_BUFFER),
        D::StorageBuffer(..) => Ok(vk::DescriptorType::STORAGE_BUFFER),
        D::CombinedImageSampler() => Ok(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
        D::SampledImage() => Ok(vk::DescriptorType::SAMPLED_IMAGE),
        D::Sampler() => Ok(vk::DescriptorType::SAMPLER),
        D::StorageImage(..) => Ok(vk::DescriptorType::STORAGE_IMAGE),
        D::UniformTexelBuffer() => Ok(vk::DescriptorType::UNIFORM_TEXEL_BUFFER),
        D::StorageTexelBuffer(..) => Ok(vk::DescriptorType::STORAGE_TEXEL_BUFFER),
        D::InputAttachment(..) => Ok(vk::DescriptorType::INPUT_ATTACHMENT),
        other => Err(VulkanError::Reflection(format!(
            "unsupported descriptor type {:?} in shader '{}'",
            other, shader
        ))),
    }
}

fn push_constant_offset(ty: &spirq::ty::Type) -> u32 {
    if let spirq::ty::Type::Struct(st) = ty {
        st.members
            .iter()
            .filter_map(|m| m.offset)
            .min()
            .unwrap_or(0) as u32
    } else {
        0
    }
}

fn input_format_to_vk(ty: &spirq::ty::Type) -> Option<vk::Format> {
    use spirq::ty::{ScalarType, Type};
    match ty {
        Type::Scalar(ScalarType::Float { .. }) => Some(vk::Format::R32_SFLOAT),
        Type::Scalar(ScalarType::Integer {
            is_signed: true, ..
        }) => Some(vk::Format::R32_SINT),
        Type::Scalar(ScalarType::Integer {
            is_signed: false, ..
        }) => Some(vk::Format::R32_UINT),
        Type::Vector(v) => {
            let signed = match &v.scalar_ty {
                ScalarType::Float { .. } => 0,
                ScalarType::Integer { is_signed: true, .. } => 1,
                ScalarType::Integer {
                    is_signed: false, ..
                } => 2,
                _ => return None,
            };
            match (v.nscalar, signed) {
                (2, 0) => Some(vk::Format::R32G32_SFLOAT),
                (3, 0) => Some(vk::Format::R32G32B32_SFLOAT),
                (4, 0) => Some(vk::Format::R32G32B32A32_SFLOAT),
                (2, 1) => Some(vk::Format::R32G32_SINT),
                (3, 1) => Some(vk::Format::R32G32B32_SINT),
                (4, 1) => Some(vk::Format::R32G32B32A32_SINT),
                (2, 2) => Some(vk::Format::R32G32_UINT),
                (3, 2) => Some(vk::Format::R32G32B32_UINT),
                (4, 2) => Some(vk::Format::R32G32B32A32_UINT),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_suffixes_follow_the_blob_naming_convention() {
        assert_eq!(stage_from_name("scene_vs"), Some(vk::ShaderStageFlags::VERTEX));
        assert_eq!(stage_from_name("scene_fs"), Some(vk::ShaderStageFlags::FRAGMENT));
        assert_eq!(stage_from_name("rain_gs"), Some(vk::ShaderStageFlags::GEOMETRY));
        assert_eq!(stage_from_name("rain_ms"), Some(vk::ShaderStageFlags::MESH_EXT));
        assert_eq!(stage_from_name("rain_update_cp"), Some(vk::ShaderStageFlags::COMPUTE));
        assert_eq!(stage_from_name("scene"), None);
    }

    #[test]
    fn offsets_accumulate_in_location_order() {
        // Declared out of order; reflection sorts by location.
        let reflection = accumulate_offsets(&[
            (2, vk::Format::R32G32_SFLOAT),
            (0, vk::Format::R32G32B32_SFLOAT),
            (1, vk::Format::R32G32B32_SFLOAT),
        ]);

        assert_eq!(reflection.stride, 32);
        assert_eq!(
            reflection.attributes,
            vec![
                ReflectedAttribute { location: 0, format: vk::Format::R32G32B32_SFLOAT, offset: 0 },
                ReflectedAttribute { location: 1, format: vk::Format::R32G32B32_SFLOAT, offset: 12 },
                ReflectedAttribute { location: 2, format: vk::Format::R32G32_SFLOAT, offset: 24 },
            ]
        );
    }

    #[test]
    fn host_layout_check_accepts_matching_struct() {
        let reflection = accumulate_offsets(&[
            (0, vk::Format::R32G32B32_SFLOAT),
            (1, vk::Format::R32G32B32_SFLOAT),
            (2, vk::Format::R32G32B32A32_SFLOAT),
            (3, vk::Format::R32G32_SFLOAT),
        ]);
        assert!(reflection.verify_host_layout(48, &[0, 12, 24, 40]).is_ok());
    }

    #[test]
    fn host_layout_check_rejects_stride_mismatch() {
        let reflection = accumulate_offsets(&[(0, vk::Format::R32G32B32_SFLOAT)]);
        let result = reflection.verify_host_layout(16, &[0]);
        assert!(matches!(result, Err(VulkanError::VertexLayoutMismatch(_))));
    }

    #[test]
    fn host_layout_check_rejects_offset_mismatch() {
        let reflection = accumulate_offsets(&[
            (0, vk::Format::R32G32B32_SFLOAT),
            (1, vk::Format::R32G32_SFLOAT),
        ]);
        let result = reflection.verify_host_layout(20, &[0, 16]);
        assert!(matches!(result, Err(VulkanError::VertexLayoutMismatch(_))));
    }

    #[test]
    fn format_sizes_match_component_counts() {
        assert_eq!(format_size(vk::Format::R32_SFLOAT), 4);
        assert_eq!(format_size(vk::Format::R32G32B32_SFLOAT), 12);
        assert_eq!(format_size(vk::Format::R32G32B32A32_SFLOAT), 16);
    }
}
