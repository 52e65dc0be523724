//! Descriptor pool management
//!
//! One pool serves every pipeline; sets are allocated once per pipeline
//! rebuild and never updated mid-frame. The allocator keeps host-side
//! accounting so an overrun is reported as a resource error before the
//! driver ever sees it; the caller frees the pool and retries larger.

use ash::{vk, Device};
use std::collections::HashMap;

use crate::render::vulkan::context::{VulkanError, VulkanResult};

/// Host-side capacity accounting for a descriptor pool
#[derive(Debug, Clone, Default)]
pub struct PoolBudget {
    /// Maximum number of descriptor sets
    pub max_sets: u32,
    /// Capacity per descriptor type
    pub sizes: HashMap<vk::DescriptorType, u32>,
}

impl PoolBudget {
    /// Default budget sized for the framework's pipelines across two frames
    /// in flight
    pub fn default_budget(image_count: u32) -> Self {
        let mut sizes = HashMap::new();
        sizes.insert(vk::DescriptorType::UNIFORM_BUFFER, 64 * image_count);
        sizes.insert(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 128 * image_count);
        sizes.insert(vk::DescriptorType::STORAGE_BUFFER, 32 * image_count);
        sizes.insert(vk::DescriptorType::STORAGE_IMAGE, 16 * image_count);
        sizes.insert(vk::DescriptorType::STORAGE_TEXEL_BUFFER, 16 * image_count);
        Self {
            max_sets: 64 * image_count,
            sizes,
        }
    }

    /// Check whether a request fits in what remains of the budget
    pub fn fits(&self, used: &PoolUsage, request: &PoolUsage) -> bool {
        if used.sets + request.sets > self.max_sets {
            return false;
        }
        for (ty, count) in &request.counts {
            let capacity = self.sizes.get(ty).copied().unwrap_or(0);
            let already = used.counts.get(ty).copied().unwrap_or(0);
            if already + count > capacity {
                return false;
            }
        }
        true
    }
}

/// Running usage of a descriptor pool
#[derive(Debug, Clone, Default)]
pub struct PoolUsage {
    /// Number of sets allocated
    pub sets: u32,
    /// Descriptors allocated per type
    pub counts: HashMap<vk::DescriptorType, u32>,
}

impl PoolUsage {
    /// Accumulate another request into this usage
    pub fn add(&mut self, other: &PoolUsage) {
        self.sets += other.sets;
        for (ty, count) in &other.counts {
            *self.counts.entry(*ty).or_insert(0) += count;
        }
    }
}

/// Descriptor pool wrapper with host-side accounting
pub struct DescriptorAllocator {
    device: Device,
    pool: vk::DescriptorPool,
    budget: PoolBudget,
    used: PoolUsage,
}

impl DescriptorAllocator {
    /// Create a pool matching the budget
    pub fn new(device: Device, budget: PoolBudget) -> VulkanResult<Self> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = budget
            .sizes
            .iter()
            .map(|(&ty, &count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count: count,
            })
            .collect();

        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(budget.max_sets)
            .pool_sizes(&pool_sizes);

        let pool = unsafe {
            device
                .create_descriptor_pool(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device,
            pool,
            budget,
            used: PoolUsage::default(),
        })
    }

    /// Allocate one set per layout, charging `request` against the budget
    pub fn allocate(
        &mut self,
        layouts: &[vk::DescriptorSetLayout],
        request: &PoolUsage,
    ) -> VulkanResult<Vec<vk::DescriptorSet>> {
        if !self.budget.fits(&self.used, request) {
            return Err(VulkanError::ResourceCreation(
                "descriptor pool budget exceeded; rebuild with a larger pool".to_string(),
            ));
        }

        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(VulkanError::Api)?
        };

        self.used.add(request);
        Ok(sets)
    }

    /// Return every set to the pool (used on swapchain rebuild)
    pub fn reset(&mut self) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(VulkanError::Api)?;
        }
        self.used = PoolUsage::default();
        Ok(())
    }

    /// Pool handle
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(sets: u32, ubos: u32, samplers: u32) -> PoolUsage {
        let mut counts = HashMap::new();
        if ubos > 0 {
            counts.insert(vk::DescriptorType::UNIFORM_BUFFER, ubos);
        }
        if samplers > 0 {
            counts.insert(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, samplers);
        }
        PoolUsage { sets, counts }
    }

    #[test]
    fn requests_within_budget_fit() {
        let budget = PoolBudget::default_budget(2);
        let used = PoolUsage::default();
        assert!(budget.fits(&used, &usage(4, 8, 4)));
    }

    #[test]
    fn per_type_capacity_is_enforced() {
        let mut sizes = HashMap::new();
        sizes.insert(vk::DescriptorType::UNIFORM_BUFFER, 4);
        let budget = PoolBudget { max_sets: 100, sizes };

        let mut used = PoolUsage::default();
        used.add(&usage(1, 3, 0));

        assert!(budget.fits(&used, &usage(1, 1, 0)));
        assert!(!budget.fits(&used, &usage(1, 2, 0)));
        // A type with zero capacity never fits.
        assert!(!budget.fits(&used, &usage(1, 0, 1)));
    }

    #[test]
    fn set_count_is_enforced() {
        let budget = PoolBudget {
            max_sets: 2,
            sizes: HashMap::new(),
        };
        let mut used = PoolUsage::default();
        used.add(&usage(2, 0, 0));
        assert!(!budget.fits(&used, &usage(1, 0, 0)));
    }
}
