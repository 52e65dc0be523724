//! Declarative render-pass composition
//!
//! A pass is described by a [`RenderPassConfig`]: which attachments exist,
//! the MSAA sample count, whether depth survives the pass for later sampling,
//! and an ordered list of subpasses with their dependencies. The builder owns
//! the attachment images and one framebuffer per swapchain image (or a single
//! one for offscreen passes).

use ash::{vk, Device};

use crate::render::vulkan::commands::OneShotCommands;
use crate::render::vulkan::context::{VulkanError, VulkanResult};
use crate::render::vulkan::image::{Image, DEPTH_FORMAT};
use crate::render::vulkan::swapchain::Swapchain;

/// Stage/access pairing for one end of a subpass dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// No prior access to wait on
    None,
    /// Color-output stage, color-write access
    ColorAttachment,
    /// Fragment stage, shader-read access
    FragmentShader,
    /// Early fragment tests, depth-write access
    EarlyFragmentTests,
    /// Late fragment tests, depth-write access
    LateFragmentTests,
}

impl DependencyKind {
    /// The stage and access masks this kind encodes
    pub fn stage_access(self) -> (vk::PipelineStageFlags, vk::AccessFlags) {
        match self {
            DependencyKind::None => (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
            DependencyKind::ColorAttachment => (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
            DependencyKind::FragmentShader => (
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
            DependencyKind::EarlyFragmentTests => (
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            DependencyKind::LateFragmentTests => (
                vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
        }
    }

    /// Whether this kind, used as a destination, allows a by-region
    /// dependency (tiler-friendly)
    pub fn by_region_as_dst(self) -> bool {
        matches!(
            self,
            DependencyKind::FragmentShader | DependencyKind::EarlyFragmentTests
        )
    }
}

/// One dependency edge between subpasses. Negative indices mean "external".
#[derive(Debug, Clone, Copy)]
pub struct SubpassDependencyConfig {
    /// Source subpass index, negative for external
    pub src_subpass: i32,
    /// Destination subpass index, negative for external
    pub dst_subpass: i32,
    /// What the source end produced
    pub src_kind: DependencyKind,
    /// What the destination end consumes
    pub dst_kind: DependencyKind,
}

/// Resolve a possibly-negative subpass index to the Vulkan convention
pub fn resolve_subpass_index(index: i32) -> u32 {
    if index < 0 {
        vk::SUBPASS_EXTERNAL
    } else {
        index as u32
    }
}

impl SubpassDependencyConfig {
    fn to_vk(self) -> vk::SubpassDependency {
        let (src_stage, src_access) = self.src_kind.stage_access();
        let (dst_stage, dst_access) = self.dst_kind.stage_access();
        let flags = if self.dst_kind.by_region_as_dst() {
            vk::DependencyFlags::BY_REGION
        } else {
            vk::DependencyFlags::empty()
        };

        vk::SubpassDependency::builder()
            .src_subpass(resolve_subpass_index(self.src_subpass))
            .dst_subpass(resolve_subpass_index(self.dst_subpass))
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .dependency_flags(flags)
            .build()
    }
}

/// One subpass in the pass
#[derive(Debug, Clone, Default)]
pub struct SubpassConfig {
    /// Whether the subpass writes the color attachment
    pub uses_color: bool,
    /// Whether the subpass tests/writes the depth attachment
    pub uses_depth: bool,
    /// Dependency edges terminating at (or leaving) this subpass
    pub dependencies: Vec<SubpassDependencyConfig>,
}

/// Declarative description of a render pass
#[derive(Debug, Clone)]
pub struct RenderPassConfig {
    /// Framebuffer extent; `None` means the swapchain extent
    pub extent: Option<vk::Extent2D>,
    /// MSAA sample count for the color/depth attachments
    pub msaa_samples: vk::SampleCountFlags,
    /// Whether the pass has a color attachment
    pub has_color: bool,
    /// Whether the pass has a depth attachment
    pub has_depth: bool,
    /// Keep depth after the pass and make it sampleable
    pub store_depth: bool,
    /// Offscreen passes render to their own attachments, not the swapchain
    pub offscreen: bool,
    /// Ordered subpasses
    pub subpasses: Vec<SubpassConfig>,
}

impl Default for RenderPassConfig {
    fn default() -> Self {
        Self {
            extent: None,
            msaa_samples: vk::SampleCountFlags::TYPE_1,
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
        }
    }
}

/// A built render pass with its attachments and framebuffers
pub struct RenderPass {
    device: Device,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    color_image: Option<Image>,
    depth_image: Option<Image>,
    msaa_samples: vk::SampleCountFlags,
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
    subpass_count: u32,
    has_color: bool,
    has_resolve: bool,
}

impl RenderPass {
    /// Build a pass from its config. Onscreen passes need the swapchain for
    /// the color format and per-image framebuffers.
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        transfer: &OneShotCommands,
        config: &RenderPassConfig,
        swapchain: Option<&Swapchain>,
    ) -> VulkanResult<Self> {
        if config.subpasses.is_empty() {
            return Err(VulkanError::ResourceCreation(
                "render pass needs at least one subpass".to_string(),
            ));
        }
        if !config.offscreen && swapchain.is_none() {
            return Err(VulkanError::ResourceCreation(
                "onscreen render pass needs a swapchain".to_string(),
            ));
        }

        let extent = config
            .extent
            .or_else(|| swapchain.map(|sc| sc.extent()))
            .ok_or_else(|| {
                VulkanError::ResourceCreation("offscreen pass needs an explicit extent".to_string())
            })?;

        let multisampled = config.msaa_samples != vk::SampleCountFlags::TYPE_1;
        let color_format = swapchain
            .map(|sc| sc.format().format)
            .unwrap_or(vk::Format::B8G8R8A8_SRGB);

        // Attachment order: color (0), depth, resolve. Indices are assigned
        // as descriptions are pushed.
        let mut attachments = Vec::new();
        let mut color_ref = None;
        let mut depth_ref = None;
        let mut resolve_ref = None;

        let mut color_image = None;
        if config.has_color {
            let (initial_layout, final_layout) = if multisampled {
                // The transient image starts and ends in attachment layout;
                // only the resolve target is ever presented.
                (
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                )
            } else {
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR)
            };

            color_ref = Some(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(color_format)
                    .samples(config.msaa_samples)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(initial_layout)
                    .final_layout(final_layout)
                    .build(),
            );

            if multisampled {
                let mut image = Image::msaa_color_attachment(
                    device.clone(),
                    memory_properties,
                    extent,
                    color_format,
                    config.msaa_samples,
                )?;
                transfer.run(|cmd| {
                    image
                        .transition_layout(cmd, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                        .expect("transition from UNDEFINED is always in the table");
                })?;
                color_image = Some(image);
            }
        }

        let mut depth_image = None;
        if config.has_depth {
            let final_layout = if config.store_depth {
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            } else {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            };
            let store_op = if config.store_depth {
                vk::AttachmentStoreOp::STORE
            } else {
                vk::AttachmentStoreOp::DONT_CARE
            };

            depth_ref = Some(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            });
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(DEPTH_FORMAT)
                    .samples(config.msaa_samples)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(store_op)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(final_layout)
                    .build(),
            );

            depth_image = Some(Image::depth_attachment(
                device.clone(),
                memory_properties,
                extent,
                config.msaa_samples,
                config.store_depth,
            )?);
        }

        if config.has_color && multisampled {
            resolve_ref = Some(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(color_format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .build(),
            );
        }

        // Subpass descriptions. References live outside the loop so the
        // pointers in the builders stay valid until pass creation.
        let color_refs: Vec<[vk::AttachmentReference; 1]> =
            color_ref.map(|r| vec![[r]]).unwrap_or_default();
        let resolve_refs: Vec<[vk::AttachmentReference; 1]> =
            resolve_ref.map(|r| vec![[r]]).unwrap_or_default();

        let last_subpass = config.subpasses.len() - 1;
        let mut subpass_descriptions = Vec::with_capacity(config.subpasses.len());
        for (index, subpass) in config.subpasses.iter().enumerate() {
            let mut builder =
                vk::SubpassDescription::builder().pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS);

            if subpass.uses_color {
                if let Some(refs) = color_refs.first() {
                    builder = builder.color_attachments(refs);
                }
                // The resolve happens once, out of the last subpass.
                if index == last_subpass {
                    if let Some(refs) = resolve_refs.first() {
                        builder = builder.resolve_attachments(refs);
                    }
                }
            }
            if subpass.uses_depth {
                if let Some(ref depth) = depth_ref {
                    builder = builder.depth_stencil_attachment(depth);
                }
            }

            subpass_descriptions.push(builder.build());
        }

        let dependencies: Vec<vk::SubpassDependency> = config
            .subpasses
            .iter()
            .flat_map(|s| s.dependencies.iter().map(|d| d.to_vk()))
            .collect();

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpass_descriptions)
            .dependencies(&dependencies);

        let render_pass = unsafe {
            device
                .create_render_pass(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        // Framebuffers: per swapchain image onscreen, a single one offscreen.
        let mut framebuffers = Vec::new();
        let build_framebuffer = |views: &[vk::ImageView]| -> VulkanResult<vk::Framebuffer> {
            let info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(views)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            unsafe { device.create_framebuffer(&info, None).map_err(VulkanError::Api) }
        };

        let framebuffer_result: VulkanResult<()> = (|| {
            if config.offscreen {
                let mut views = Vec::new();
                if let Some(ref image) = color_image {
                    views.push(image.attachment_view());
                }
                if let Some(ref image) = depth_image {
                    views.push(image.attachment_view());
                }
                framebuffers.push(build_framebuffer(&views)?);
            } else {
                let swapchain = swapchain.expect("checked above");
                for &swapchain_view in swapchain.image_views() {
                    let mut views = Vec::new();
                    if config.has_color {
                        if multisampled {
                            views.push(color_image.as_ref().expect("allocated above").attachment_view());
                        } else {
                            views.push(swapchain_view);
                        }
                    }
                    if let Some(ref image) = depth_image {
                        views.push(image.attachment_view());
                    }
                    if multisampled && config.has_color {
                        views.push(swapchain_view);
                    }
                    framebuffers.push(build_framebuffer(&views)?);
                }
            }
            Ok(())
        })();

        if let Err(e) = framebuffer_result {
            unsafe {
                for fb in &framebuffers {
                    device.destroy_framebuffer(*fb, None);
                }
                device.destroy_render_pass(render_pass, None);
            }
            return Err(e);
        }

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        Ok(Self {
            device,
            render_pass,
            framebuffers,
            color_image,
            depth_image,
            msaa_samples: config.msaa_samples,
            viewport,
            scissor,
            subpass_count: config.subpasses.len() as u32,
            has_color: config.has_color,
            has_resolve: resolve_ref.is_some(),
        })
    }

    /// Begin the pass on a primary command buffer; subpass contents are
    /// recorded through secondary command buffers.
    pub fn begin(&self, cmd: vk::CommandBuffer, image_index: usize) {
        self.begin_with_contents(cmd, image_index, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS);
    }

    fn begin_with_contents(
        &self,
        cmd: vk::CommandBuffer,
        image_index: usize,
        contents: vk::SubpassContents,
    ) {
        // Clear values follow attachment order: color, depth, resolve.
        let mut clear_values = Vec::new();
        if self.has_color {
            clear_values.push(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            });
        }
        if self.depth_image.is_some() {
            clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        }
        if self.has_resolve {
            clear_values.push(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            });
        }

        let framebuffer = self.framebuffer(image_index);
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(self.scissor)
            .clear_values(&clear_values);

        unsafe {
            self.device.cmd_begin_render_pass(cmd, &begin_info, contents);
        }
    }

    /// Begin the pass with inline contents (used by the one-shot shadow
    /// render, which records directly instead of executing secondaries)
    pub fn begin_inline(&self, cmd: vk::CommandBuffer, image_index: usize) {
        self.begin_with_contents(cmd, image_index, vk::SubpassContents::INLINE);
    }

    /// Advance to the next subpass
    pub fn next_subpass(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device
                .cmd_next_subpass(cmd, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS);
        }
    }

    /// End the pass
    pub fn end(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device.cmd_end_render_pass(cmd);
        }
    }

    /// Pass handle
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Framebuffer for a swapchain image (offscreen passes have exactly one)
    pub fn framebuffer(&self, image_index: usize) -> vk::Framebuffer {
        if self.framebuffers.len() == 1 {
            self.framebuffers[0]
        } else {
            self.framebuffers[image_index]
        }
    }

    /// Sample count of the color/depth attachments
    pub fn msaa_samples(&self) -> vk::SampleCountFlags {
        self.msaa_samples
    }

    /// Whether the pass has a color attachment
    pub fn has_color(&self) -> bool {
        self.has_color
    }

    /// Full-extent viewport (baked into pipelines)
    pub fn viewport(&self) -> vk::Viewport {
        self.viewport
    }

    /// Full-extent scissor
    pub fn scissor(&self) -> vk::Rect2D {
        self.scissor
    }

    /// Number of subpasses
    pub fn subpass_count(&self) -> u32 {
        self.subpass_count
    }

    /// The depth attachment image, when the pass has one
    pub fn depth_image(&self) -> Option<&Image> {
        self.depth_image.as_ref()
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            self.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_subpass_indices_mean_external() {
        assert_eq!(resolve_subpass_index(-1), vk::SUBPASS_EXTERNAL);
        assert_eq!(resolve_subpass_index(-7), vk::SUBPASS_EXTERNAL);
        assert_eq!(resolve_subpass_index(0), 0);
        assert_eq!(resolve_subpass_index(2), 2);
    }

    #[test]
    fn dependency_kinds_encode_stage_and_access() {
        let (stage, access) = DependencyKind::ColorAttachment.stage_access();
        assert_eq!(stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

        let (stage, access) = DependencyKind::FragmentShader.stage_access();
        assert_eq!(stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(access, vk::AccessFlags::SHADER_READ);

        let (stage, access) = DependencyKind::EarlyFragmentTests.stage_access();
        assert_eq!(stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
        assert_eq!(access, vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE);

        let (_, access) = DependencyKind::None.stage_access();
        assert_eq!(access, vk::AccessFlags::empty());
    }

    #[test]
    fn shader_read_destinations_are_by_region() {
        assert!(DependencyKind::FragmentShader.by_region_as_dst());
        assert!(DependencyKind::EarlyFragmentTests.by_region_as_dst());
        assert!(!DependencyKind::ColorAttachment.by_region_as_dst());
        assert!(!DependencyKind::LateFragmentTests.by_region_as_dst());
        assert!(!DependencyKind::None.by_region_as_dst());
    }

    #[test]
    fn dependency_config_builds_the_expected_vk_struct() {
        let dep = SubpassDependencyConfig {
            src_subpass: -1,
            dst_subpass: 0,
            src_kind: DependencyKind::ColorAttachment,
            dst_kind: DependencyKind::FragmentShader,
        }
        .to_vk();

        assert_eq!(dep.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dep.dst_subpass, 0);
        assert_eq!(dep.src_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dep.dst_access_mask, vk::AccessFlags::SHADER_READ);
        assert_eq!(dep.dependency_flags, vk::DependencyFlags::BY_REGION);
    }
}
