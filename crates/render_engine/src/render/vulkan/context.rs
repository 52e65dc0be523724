//! Vulkan context management
//!
//! Instance creation, physical-device selection and logical-device setup.
//! The context owns the process-wide GPU handles; everything swapchain- or
//! frame-scoped lives in [`crate::render::vulkan::backend`].

#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::extensions::ext::MeshShader;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk;
use ash::{Device, Entry, Instance};
use std::ffi::{CStr, CString};
use thiserror::Error;

use crate::render::window::Window;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Context or device initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// A resource could not be created; partial state has been freed
    #[error("Resource creation failed: {0}")]
    ResourceCreation(String),

    /// No memory type satisfies the requested properties
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// An image layout transition pair outside the supported table
    #[error("Unsupported image layout transition: {from:?} -> {to:?}")]
    UnsupportedLayoutTransition {
        /// Layout the image is currently in
        from: vk::ImageLayout,
        /// Layout that was requested
        to: vk::ImageLayout,
    },

    /// SPIR-V reflection failed or produced unusable data
    #[error("Shader reflection error: {0}")]
    Reflection(String),

    /// Shader stages disagree about a descriptor slot or push-constant block
    #[error("Pipeline layout merge error: {0}")]
    LayoutMerge(String),

    /// A host vertex struct does not match the reflected shader signature
    #[error("Vertex layout mismatch: {0}")]
    VertexLayoutMismatch(String),

    /// The device was lost; unrecoverable
    #[error("Device lost")]
    DeviceLost,
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

impl VulkanError {
    /// Classify an API error, mapping DEVICE_LOST to its own variant
    pub fn from_vk(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => VulkanError::DeviceLost,
            other => VulkanError::Api(other),
        }
    }
}

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Debug utilities extension (debug builds)
    #[cfg(debug_assertions)]
    pub debug_utils: Option<DebugUtils>,
    /// Debug messenger handle (debug builds)
    #[cfg(debug_assertions)]
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create a new Vulkan instance with the window's surface extensions
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            VulkanError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e))
        })?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|_| VulkanError::InitializationFailed("invalid app name".to_string()))?;
        let engine_name_cstr = CString::new("render_engine").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let required_extensions = window.required_instance_extensions().map_err(|e| {
            VulkanError::InitializationFailed(format!("Failed to get required extensions: {}", e))
        })?;

        let cstr_extensions: Vec<CString> = required_extensions
            .iter()
            .map(|ext| CString::new(ext.as_str()).unwrap())
            .collect();

        #[allow(unused_mut)]
        let mut extensions: Vec<*const i8> =
            cstr_extensions.iter().map(|ext| ext.as_ptr()).collect();

        #[cfg(debug_assertions)]
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if cfg!(debug_assertions) && enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            vec![]
        };
        let layer_names_ptrs: Vec<*const i8> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        #[cfg(debug_assertions)]
        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let debug_messenger = Self::setup_debug_messenger(&debug_utils)?;
            (Some(debug_utils), Some(debug_messenger))
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            instance,
            #[cfg(debug_assertions)]
            debug_utils,
            #[cfg(debug_assertions)]
            debug_messenger,
        })
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            #[cfg(debug_assertions)]
            if let (Some(debug_utils), Some(debug_messenger)) =
                (&self.debug_utils, &self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(*debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Family serving graphics, compute and present together
    pub queue_family: u32,
    /// Number of queues that family exposes
    pub queue_count: u32,
    /// Highest sample count usable for both color and depth attachments
    pub max_msaa_samples: vk::SampleCountFlags,
    /// Whether VK_EXT_mesh_shader is available
    pub mesh_shader_support: bool,
    /// Nanoseconds per timestamp tick
    pub timestamp_period: f32,
}

impl PhysicalDeviceInfo {
    /// Select the first discrete GPU that satisfies the framework's
    /// requirements, falling back to any suitable device.
    pub fn select_suitable_device(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        let mut fallback = None;
        for device in devices {
            if let Ok(info) = Self::evaluate_device(instance, device, surface, surface_loader) {
                let name = unsafe {
                    CStr::from_ptr(info.properties.device_name.as_ptr()).to_string_lossy()
                };
                if info.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                    log::info!("Selected GPU: {}", name);
                    return Ok(info);
                }
                if fallback.is_none() {
                    fallback = Some(info);
                }
            }
        }

        match fallback {
            Some(info) => {
                let name = unsafe {
                    CStr::from_ptr(info.properties.device_name.as_ptr()).to_string_lossy()
                };
                log::warn!("No discrete GPU found, using: {}", name);
                Ok(info)
            }
            None => Err(VulkanError::InitializationFailed(
                "No suitable GPU found".to_string(),
            )),
        }
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        if features.geometry_shader != vk::TRUE || features.sampler_anisotropy != vk::TRUE {
            return Err(VulkanError::InitializationFailed(
                "Device lacks geometry shaders or anisotropic sampling".to_string(),
            ));
        }

        // One family must serve graphics, compute and present; the two engine
        // queues both come from it.
        let mut selected = None;
        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;
            let flags = family.queue_flags;
            if !flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE) {
                continue;
            }
            let present_support = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .map_err(VulkanError::Api)?
            };
            if present_support {
                selected = Some((index, family.queue_count));
                break;
            }
        }

        let (queue_family, queue_count) = selected.ok_or_else(|| {
            VulkanError::InitializationFailed(
                "No graphics+compute+present queue family found".to_string(),
            )
        })?;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        let has_extension = |wanted: &CStr| {
            extensions.iter().any(|available| {
                let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
                name == wanted
            })
        };

        if !has_extension(SwapchainLoader::name()) {
            return Err(VulkanError::InitializationFailed(
                "Swapchain extension not supported".to_string(),
            ));
        }
        let mesh_shader_support = has_extension(MeshShader::name());

        let counts = properties.limits.framebuffer_color_sample_counts
            & properties.limits.framebuffer_depth_sample_counts;
        let max_msaa_samples = [
            vk::SampleCountFlags::TYPE_64,
            vk::SampleCountFlags::TYPE_32,
            vk::SampleCountFlags::TYPE_16,
            vk::SampleCountFlags::TYPE_8,
            vk::SampleCountFlags::TYPE_4,
            vk::SampleCountFlags::TYPE_2,
        ]
        .into_iter()
        .find(|&flag| counts.contains(flag))
        .unwrap_or(vk::SampleCountFlags::TYPE_1);

        Ok(Self {
            device,
            properties,
            features,
            queue_family,
            queue_count,
            max_msaa_samples,
            mesh_shader_support,
            timestamp_period: properties.limits.timestamp_period,
        })
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Queue used for graphics, transfers and present
    pub graphics_queue: vk::Queue,
    /// Queue used for particle compute work
    pub compute_queue: vk::Queue,
    /// Family index both queues come from
    pub queue_family: u32,
    /// Swapchain extension loader
    pub swapchain_loader: SwapchainLoader,
    /// Mesh-shader extension loader, when the device supports it
    pub mesh_shader_loader: Option<MeshShader>,
}

impl LogicalDevice {
    /// Create a logical device with the graphics and compute queues
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        // Two queues when the family has them; otherwise both handles alias
        // queue 0 and the semaphore graph still serializes correctly.
        let queue_count = physical.queue_count.min(2);
        let priorities = [1.0f32; 2];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(physical.queue_family)
            .queue_priorities(&priorities[..queue_count as usize])
            .build();
        let queue_infos = [queue_info];

        let mut extensions = vec![SwapchainLoader::name().as_ptr()];
        if physical.mesh_shader_support {
            extensions.push(MeshShader::name().as_ptr());
        }

        let device_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(true)
            .sample_rate_shading(true)
            .geometry_shader(true)
            .fill_mode_non_solid(true)
            // The scene fragment shader mirrors depth into a storage image
            // for the particle collision probe.
            .fragment_stores_and_atomics(true)
            .build();

        let mut mesh_features =
            vk::PhysicalDeviceMeshShaderFeaturesEXT::builder().mesh_shader(true);

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&device_features);
        if physical.mesh_shader_support {
            create_info = create_info.push_next(&mut mesh_features);
        }

        let device = unsafe {
            instance
                .create_device(physical.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue = unsafe { device.get_device_queue(physical.queue_family, 0) };
        let compute_queue =
            unsafe { device.get_device_queue(physical.queue_family, queue_count - 1) };

        let swapchain_loader = SwapchainLoader::new(instance, &device);
        let mesh_shader_loader = physical
            .mesh_shader_support
            .then(|| MeshShader::new(instance, &device));

        Ok(Self {
            device,
            graphics_queue,
            compute_queue,
            queue_family: physical.queue_family,
            swapchain_loader,
            mesh_shader_loader,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Main Vulkan context that owns the process-wide GPU handles
pub struct VulkanContext {
    /// Vulkan surface for rendering
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader
    pub surface_loader: Surface,
    /// Selected physical device information
    pub physical_device: PhysicalDeviceInfo,
    /// Logical device for operations
    pub device: LogicalDevice,
    /// Vulkan instance and debug utilities
    pub instance: VulkanInstance,
}

impl VulkanContext {
    /// Create a context for the given window
    pub fn new(window: &mut Window, app_name: &str, validation: bool) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(window, app_name, validation)?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = window
            .create_vulkan_surface(instance.instance.handle())
            .map_err(|e| {
                VulkanError::InitializationFailed(format!("Surface creation: {}", e))
            })?;

        let physical_device =
            PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface, &surface_loader)?;
        log::info!(
            "Max MSAA samples: {:?}, mesh shaders: {}",
            physical_device.max_msaa_samples,
            physical_device.mesh_shader_support
        );

        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        Ok(Self {
            surface,
            surface_loader,
            physical_device,
            device,
            instance,
        })
    }

    /// Get the raw ash device handle
    pub fn raw_device(&self) -> Device {
        self.device.device.clone()
    }

    /// Get the ash instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Device memory properties for allocation decisions
    pub fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        unsafe {
            self.instance
                .instance
                .get_physical_device_memory_properties(self.physical_device.device)
        }
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe {
            self.device
                .device
                .device_wait_idle()
                .map_err(VulkanError::from_vk)
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.surface_loader.destroy_surface(self.surface, None);
        }
        // Remaining fields drop in reverse declaration order, so the device
        // goes before the instance.
    }
}
