//! 2D image abstraction
//!
//! Covers the five image roles the framework needs: sampled textures (with
//! generated mip chains), solid-color fallbacks, transient MSAA color
//! attachments, depth-stencil attachments (optionally sampleable) and storage
//! images. Layout transitions are table-driven and must go through the image
//! object so the tracked layout stays truthful.

use ash::{vk, Device};

use crate::render::vulkan::buffer::{find_memory_type, Buffer};
use crate::render::vulkan::commands::OneShotCommands;
use crate::render::vulkan::context::{VulkanError, VulkanResult};

/// Depth format used by every depth attachment in the framework
pub const DEPTH_FORMAT: vk::Format = vk::Format::D24_UNORM_S8_UINT;

/// Source/destination masks for one supported layout transition
type BarrierMasks = (
    vk::AccessFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
);

/// Look up the barrier masks for an (old, new) layout pair.
///
/// Unlisted pairs are an error: every transition the framework performs is
/// in this table, so an unknown pair means a sequencing bug upstream.
pub fn barrier_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> VulkanResult<BarrierMasks> {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    let masks = match (old_layout, new_layout) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::TRANSFER_READ, S::TRANSFER, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            A::TRANSFER_WRITE,
            A::SHADER_READ,
            S::TRANSFER,
            S::FRAGMENT_SHADER,
        ),
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            A::TRANSFER_READ,
            A::SHADER_READ,
            S::TRANSFER,
            S::FRAGMENT_SHADER,
        ),
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::COLOR_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::EARLY_FRAGMENT_TESTS,
        ),
        (L::UNDEFINED, L::GENERAL) => (
            A::empty(),
            A::SHADER_READ | A::SHADER_WRITE,
            S::TOP_OF_PIPE,
            S::COMPUTE_SHADER,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::GENERAL) => (
            A::TRANSFER_WRITE,
            A::SHADER_READ | A::SHADER_WRITE,
            S::TRANSFER,
            S::COMPUTE_SHADER,
        ),
        _ => {
            return Err(VulkanError::UnsupportedLayoutTransition {
                from: old_layout,
                to: new_layout,
            })
        }
    };

    Ok(masks)
}

/// Number of mip levels for a full chain over the given extent
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// 2D image with tracked layout, views and optional sampler
pub struct Image {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    width: u32,
    height: u32,
    mip_levels: u32,
    format: vk::Format,
    layout: vk::ImageLayout,
    usage: vk::ImageUsageFlags,
    samples: vk::SampleCountFlags,
    aspect: vk::ImageAspectFlags,
    /// View used when the image is bound as an attachment
    attachment_view: vk::ImageView,
    /// Depth-only (or full-color) view used when the image is sampled;
    /// distinct from the attachment view for depth-stencil images
    sampler_view: Option<vk::ImageView>,
    sampler: Option<vk::Sampler>,
}

struct ImageParams {
    width: u32,
    height: u32,
    mip_levels: u32,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    samples: vk::SampleCountFlags,
    aspect: vk::ImageAspectFlags,
}

impl Image {
    fn allocate(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        params: ImageParams,
    ) -> VulkanResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: params.width,
                height: params.height,
                depth: 1,
            })
            .mip_levels(params.mip_levels)
            .array_layers(1)
            .format(params.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(params.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(params.samples);

        let image = unsafe {
            device
                .create_image(&image_info, None)
                .map_err(VulkanError::Api)?
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = match find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok(index) => index,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(VulkanError::Api(e));
            }
        };

        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            return Err(VulkanError::Api(e));
        }

        let attachment_view = match create_view(
            &device,
            image,
            params.format,
            params.aspect,
            params.mip_levels,
        ) {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            device,
            image,
            memory,
            width: params.width,
            height: params.height,
            mip_levels: params.mip_levels,
            format: params.format,
            layout: vk::ImageLayout::UNDEFINED,
            usage: params.usage,
            samples: params.samples,
            aspect: params.aspect,
            attachment_view,
            sampler_view: None,
            sampler: None,
        })
    }

    /// Create a sampled texture from decoded RGBA pixels, optionally with a
    /// full mip chain generated by successive half-size blits.
    pub fn sampled_from_pixels(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        transfer: &OneShotCommands,
        name: &str,
        pixels: &[u8],
        width: u32,
        height: u32,
        mipmapped: bool,
        max_anisotropy: f32,
    ) -> VulkanResult<Self> {
        let mip_levels = if mipmapped {
            mip_level_count(width, height)
        } else {
            1
        };

        let mut usage = vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
        if mip_levels > 1 {
            // Each level is blitted from the previous one.
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }

        let mut image = Self::allocate(
            device.clone(),
            memory_properties,
            ImageParams {
                width,
                height,
                mip_levels,
                format: vk::Format::R8G8B8A8_SRGB,
                usage,
                samples: vk::SampleCountFlags::TYPE_1,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )?;

        let staging = Buffer::new(
            device,
            memory_properties,
            &format!("{}_staging", name),
            pixels.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
        )?;
        staging.write_data(pixels)?;

        transfer.run(|cmd| {
            image
                .transition_layout(cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .expect("transition from UNDEFINED is always in the table");

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .build();
            unsafe {
                image.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle(),
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            if mip_levels > 1 {
                image.generate_mipmaps(cmd);
            } else {
                image
                    .transition_layout(cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .expect("transfer-dst to shader-read is in the table");
            }
        })?;

        image.create_sampler(max_anisotropy)?;
        Ok(image)
    }

    /// Create a 1x1 sampled texture of a solid color, used as a fallback for
    /// materials without a texture so descriptor arrays stay fully populated.
    pub fn solid_color(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        transfer: &OneShotCommands,
        name: &str,
        color: [u8; 4],
    ) -> VulkanResult<Self> {
        Self::sampled_from_pixels(
            device,
            memory_properties,
            transfer,
            name,
            &color,
            1,
            1,
            false,
            1.0,
        )
    }

    /// Create a transient multisampled color attachment. Never host-visible
    /// and never sampled; it only exists to be resolved.
    pub fn msaa_color_attachment(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> VulkanResult<Self> {
        Self::allocate(
            device,
            memory_properties,
            ImageParams {
                width: extent.width,
                height: extent.height,
                mip_levels: 1,
                format,
                usage: vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                samples,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )
    }

    /// Create a depth-stencil attachment. When `sampleable`, a depth-only
    /// view and comparison-less sampler are added so a later pass can read it
    /// (the shadow map path).
    pub fn depth_attachment(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
        sampleable: bool,
    ) -> VulkanResult<Self> {
        let mut usage = vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        if sampleable {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }

        let mut image = Self::allocate(
            device.clone(),
            memory_properties,
            ImageParams {
                width: extent.width,
                height: extent.height,
                mip_levels: 1,
                format: DEPTH_FORMAT,
                usage,
                samples,
                aspect: vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            },
        )?;

        if sampleable {
            // Sampling is only legal on the depth aspect.
            let view = create_view(&device, image.image, DEPTH_FORMAT, vk::ImageAspectFlags::DEPTH, 1)?;
            image.sampler_view = Some(view);
            image.create_sampler(1.0)?;
        }

        Ok(image)
    }

    /// Create a storage image cleared to 1.0 and left in GENERAL layout.
    /// Used for the depth buffer shared between the graphics and compute
    /// pipelines.
    pub fn storage(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        transfer: &OneShotCommands,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> VulkanResult<Self> {
        let mut image = Self::allocate(
            device,
            memory_properties,
            ImageParams {
                width: extent.width,
                height: extent.height,
                mip_levels: 1,
                format,
                usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
                samples: vk::SampleCountFlags::TYPE_1,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )?;

        transfer.run(|cmd| {
            image
                .transition_layout(cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .expect("transition from UNDEFINED is always in the table");

            let clear = vk::ClearColorValue {
                float32: [1.0, 1.0, 1.0, 1.0],
            };
            let range = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            };
            unsafe {
                image.device.cmd_clear_color_image(
                    cmd,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &clear,
                    &[range],
                );
            }

            image
                .transition_layout(cmd, vk::ImageLayout::GENERAL)
                .expect("transfer-dst to general is in the table");
        })?;

        Ok(image)
    }

    /// Issue a layout transition for all mip levels and update the tracked
    /// layout. The (old, new) pair must be in the supported table.
    pub fn transition_layout(
        &mut self,
        cmd: vk::CommandBuffer,
        new_layout: vk::ImageLayout,
    ) -> VulkanResult<()> {
        let (src_access, dst_access, src_stage, dst_stage) =
            barrier_masks(self.layout, new_layout)?;

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(self.layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: self.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        self.layout = new_layout;
        Ok(())
    }

    /// Blit each mip level from the previous one, leaving every level in
    /// SHADER_READ_ONLY. The image must currently be TRANSFER_DST with level
    /// 0 populated.
    fn generate_mipmaps(&mut self, cmd: vk::CommandBuffer) {
        let mut mip_width = self.width as i32;
        let mut mip_height = self.height as i32;

        for level in 1..self.mip_levels {
            // Source level becomes a blit source...
            self.mip_barrier(
                cmd,
                level - 1,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            );

            let next_width = (mip_width / 2).max(1);
            let next_height = (mip_height / 2).max(1);

            let blit = vk::ImageBlit::builder()
                .src_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: mip_width,
                        y: mip_height,
                        z: 1,
                    },
                ])
                .src_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .dst_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: next_width,
                        y: next_height,
                        z: 1,
                    },
                ])
                .dst_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .build();

            unsafe {
                self.device.cmd_blit_image(
                    cmd,
                    self.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }

            // ...and is done with: hand it to the fragment shader.
            self.mip_barrier(
                cmd,
                level - 1,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );

            mip_width = next_width;
            mip_height = next_height;
        }

        // The last level was only ever a blit destination.
        self.mip_barrier(
            cmd,
            self.mip_levels - 1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        self.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    }

    fn mip_barrier(
        &self,
        cmd: vk::CommandBuffer,
        level: u32,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let (src_access, dst_access, src_stage, dst_stage) = barrier_masks(old_layout, new_layout)
            .expect("mip chain transitions are always in the table");

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: level,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn create_sampler(&mut self, max_anisotropy: f32) -> VulkanResult<()> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(max_anisotropy > 1.0)
            .max_anisotropy(max_anisotropy.max(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .min_lod(0.0)
            .max_lod(self.mip_levels as f32);

        let sampler = unsafe {
            self.device
                .create_sampler(&sampler_info, None)
                .map_err(VulkanError::Api)?
        };

        if let Some(old) = self.sampler.replace(sampler) {
            unsafe { self.device.destroy_sampler(old, None) };
        }
        Ok(())
    }

    /// Raw image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// View for attachment binding
    pub fn attachment_view(&self) -> vk::ImageView {
        self.attachment_view
    }

    /// View for sampling; falls back to the attachment view for color images
    pub fn sampler_view(&self) -> vk::ImageView {
        self.sampler_view.unwrap_or(self.attachment_view)
    }

    /// Sampler handle, if the image is sampleable
    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    /// Layout the image was last transitioned to
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Image format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Image width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Image height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Mip level count
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Sample count
    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    /// Usage flags the image was created with
    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if let Some(sampler) = self.sampler.take() {
                self.device.destroy_sampler(sampler, None);
            }
            if let Some(view) = self.sampler_view.take() {
                self.device.destroy_image_view(view, None);
            }
            self.device.destroy_image_view(self.attachment_view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

fn create_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> VulkanResult<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe {
        device
            .create_image_view(&view_info, None)
            .map_err(VulkanError::Api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_transition_is_supported() {
        let (src_access, dst_access, src_stage, dst_stage) = barrier_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(src_access, vk::AccessFlags::empty());
        assert_eq!(dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(dst_stage, vk::PipelineStageFlags::TRANSFER);
    }

    #[test]
    fn unknown_transition_pairs_are_rejected() {
        let result = barrier_masks(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        assert!(matches!(
            result,
            Err(VulkanError::UnsupportedLayoutTransition { .. })
        ));
    }

    #[test]
    fn mip_count_covers_the_longest_axis() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 1), 2);
        assert_eq!(mip_level_count(1024, 512), 11);
        assert_eq!(mip_level_count(1000, 600), 10);
    }
}
