//! Timestamp query pool
//!
//! A small, configurably-sized pool of timestamp slots for GPU profiling.
//! Slot count comes from the engine config (the demos use 4 and 8); results
//! are converted to nanoseconds using the device's timestamp period.

use ash::{vk, Device};

use crate::render::vulkan::context::{VulkanError, VulkanResult};

/// Convert raw timestamp ticks to nanoseconds
pub fn ticks_to_ns(ticks: u64, timestamp_period: f32) -> f64 {
    ticks as f64 * timestamp_period as f64
}

/// Timestamp query pool wrapper
pub struct TimestampQueryPool {
    device: Device,
    pool: vk::QueryPool,
    slot_count: u32,
    timestamp_period: f32,
}

impl TimestampQueryPool {
    /// Create a pool with `slot_count` timestamp slots
    pub fn new(device: Device, slot_count: u32, timestamp_period: f32) -> VulkanResult<Self> {
        let create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(slot_count);

        let pool = unsafe {
            device
                .create_query_pool(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device,
            pool,
            slot_count,
            timestamp_period,
        })
    }

    /// Reset all slots; must be recorded before the first write each frame
    pub fn reset(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device
                .cmd_reset_query_pool(cmd, self.pool, 0, self.slot_count);
        }
    }

    /// Write a timestamp into a slot at the given pipeline stage
    pub fn write(&self, cmd: vk::CommandBuffer, stage: vk::PipelineStageFlags, slot: u32) {
        debug_assert!(slot < self.slot_count);
        unsafe {
            self.device.cmd_write_timestamp(cmd, stage, self.pool, slot);
        }
    }

    /// Fetch all written slots, in ticks. Waits for availability.
    pub fn fetch_ticks(&self, count: u32) -> VulkanResult<Vec<u64>> {
        let count = count.min(self.slot_count);
        let mut results = vec![0u64; count as usize];
        unsafe {
            self.device
                .get_query_pool_results(
                    self.pool,
                    0,
                    count,
                    &mut results,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
                .map_err(VulkanError::Api)?;
        }
        Ok(results)
    }

    /// Elapsed nanoseconds between two slots fetched this frame
    pub fn elapsed_ns(&self, ticks: &[u64], start_slot: usize, stop_slot: usize) -> f64 {
        let start = ticks.get(start_slot).copied().unwrap_or(0);
        let stop = ticks.get(stop_slot).copied().unwrap_or(start);
        ticks_to_ns(stop.saturating_sub(start), self.timestamp_period)
    }

    /// Number of slots in the pool
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Nanoseconds per tick on this device
    pub fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }
}

impl Drop for TimestampQueryPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_query_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversion_scales_by_period() {
        assert_eq!(ticks_to_ns(0, 1.0), 0.0);
        assert_eq!(ticks_to_ns(1000, 1.0), 1000.0);
        // A period of 52.08 ns/tick is typical for a 19.2 MHz clock domain.
        let ns = ticks_to_ns(2, 52.08);
        assert!((ns - 104.16).abs() < 1e-9);
    }
}
