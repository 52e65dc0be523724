//! Buffer management for vertex data, uniforms and particle storage
//!
//! Memory management following RAII patterns with proper allocation and
//! cleanup. Buffers carry a debug name, their usage flags and, for storage
//! texel buffers, a typed buffer view.

use ash::{vk, Device};
use std::mem;

use crate::render::vulkan::context::{VulkanError, VulkanResult};

/// Buffer wrapper with memory management
pub struct Buffer {
    device: Device,
    name: String,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    host_visible: bool,
    texel_view: Option<vk::BufferView>,
}

impl Buffer {
    /// Create a new buffer with bound memory.
    ///
    /// `host_visible` buffers are HOST_VISIBLE|HOST_COHERENT and mappable;
    /// everything else is DEVICE_LOCAL and filled through a staging copy.
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> VulkanResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?
        };

        let mem_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let properties = if host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };

        let memory_type_index = match find_memory_type(
            memory_properties,
            mem_requirements.memory_type_bits,
            properties,
        ) {
            Ok(index) => index,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(VulkanError::Api(e));
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(VulkanError::Api(e));
        }

        Ok(Self {
            device,
            name: name.to_string(),
            buffer,
            memory,
            size,
            usage,
            host_visible,
            texel_view: None,
        })
    }

    /// Attach a typed texel view so shaders can address the buffer as an
    /// element array. Requires a texel-buffer usage flag.
    pub fn create_texel_view(&mut self, format: vk::Format) -> VulkanResult<()> {
        debug_assert!(self
            .usage
            .intersects(vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER
                | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER));

        let view_info = vk::BufferViewCreateInfo::builder()
            .buffer(self.buffer)
            .format(format)
            .offset(0)
            .range(vk::WHOLE_SIZE);

        let view = unsafe {
            self.device
                .create_buffer_view(&view_info, None)
                .map_err(|e| {
                    VulkanError::ResourceCreation(format!(
                        "texel view for buffer '{}': {:?}",
                        self.name, e
                    ))
                })?
        };

        if let Some(old) = self.texel_view.replace(view) {
            unsafe { self.device.destroy_buffer_view(old, None) };
        }
        Ok(())
    }

    /// Write data into a host-visible buffer
    pub fn write_data<T: bytemuck::Pod>(&self, data: &[T]) -> VulkanResult<()> {
        debug_assert!(self.host_visible, "write_data on device-local buffer '{}'", self.name);

        let bytes: &[u8] = bytemuck::cast_slice(data);
        unsafe {
            let ptr = self
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)? as *mut u8;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len().min(self.size as usize));
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get the texel view handle, if one was created
    pub fn texel_view(&self) -> Option<vk::BufferView> {
        self.texel_view
    }

    /// Get size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Get the debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the buffer is mappable from the host
    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            if let Some(view) = self.texel_view.take() {
                self.device.destroy_buffer_view(view, None);
            }
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// A group of identically-sized host-visible buffers, one per in-flight
/// swapchain image, holding a single uniform block updated each frame.
pub struct UniformBuffer<T: bytemuck::Pod> {
    buffers: Vec<Buffer>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: bytemuck::Pod> UniformBuffer<T> {
    /// Create one uniform buffer per swapchain image
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        name: &str,
        image_count: usize,
    ) -> VulkanResult<Self> {
        let size = mem::size_of::<T>() as vk::DeviceSize;
        let mut buffers = Vec::with_capacity(image_count);
        for i in 0..image_count {
            buffers.push(Buffer::new(
                device.clone(),
                memory_properties,
                &format!("{}[{}]", name, i),
                size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                true,
            )?);
        }

        Ok(Self {
            buffers,
            _phantom: std::marker::PhantomData,
        })
    }

    /// Update the block for the image about to be drawn
    pub fn update(&self, image_index: usize, data: &T) -> VulkanResult<()> {
        self.buffers[image_index].write_data(std::slice::from_ref(data))
    }

    /// Buffer handle for a given swapchain image
    pub fn handle(&self, image_index: usize) -> vk::Buffer {
        self.buffers[image_index].handle()
    }

    /// Size of the uniform block in bytes
    pub fn block_size(&self) -> vk::DeviceSize {
        mem::size_of::<T>() as vk::DeviceSize
    }

    /// Number of per-image buffers in the group
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the group is empty
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Find a memory type matching the requirement bits and property mask
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    for i in 0..memory_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && (memory_properties.memory_types[i as usize].property_flags & properties)
                == properties
        {
            return Ok(i);
        }
    }

    Err(VulkanError::NoSuitableMemoryType)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_memory_properties() -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;
        props
    }

    #[test]
    fn picks_first_matching_memory_type() {
        let props = fake_memory_properties();
        let index = find_memory_type(
            &props,
            0b111,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn honors_the_type_filter_mask() {
        let props = fake_memory_properties();
        // Type 1 satisfies the properties but is excluded by the filter.
        let index = find_memory_type(
            &props,
            0b100,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )
        .unwrap();
        assert_eq!(index, 2);
    }

    #[test]
    fn fails_when_nothing_matches() {
        let props = fake_memory_properties();
        let result = find_memory_type(&props, 0b001, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert!(matches!(result, Err(VulkanError::NoSuitableMemoryType)));
    }
}
