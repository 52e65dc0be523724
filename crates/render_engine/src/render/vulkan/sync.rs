//! Vulkan synchronization primitives for GPU/CPU coordination
//!
//! RAII wrappers for semaphores and fences, the per-frame bundles used by the
//! frame loop, and the host-side scheduling state that decides which
//! semaphores each submit waits on.

use ash::{vk, Device};

use crate::render::vulkan::context::{VulkanError, VulkanResult};

/// Number of frames the CPU may record ahead of the GPU
pub const FRAMES_IN_FLIGHT: usize = 2;

/// GPU-GPU synchronization primitive with automatic resource management
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new semaphore
    pub fn new(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let semaphore = unsafe {
            device
                .create_semaphore(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence
    pub fn new(device: Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = unsafe {
            device
                .create_fence(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, fence })
    }

    /// Wait for the fence. Waits are unbounded by design; the only recovery
    /// from a stuck GPU is device loss.
    pub fn wait(&self) -> VulkanResult<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(VulkanError::from_vk)
        }
    }

    /// Reset the fence to unsignaled
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_fences(&[self.fence])
                .map_err(VulkanError::Api)
        }
    }

    /// Get the fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Per-slot synchronization objects for in-flight frame management
pub struct FrameSync {
    /// Signaled when the acquired swapchain image is ready to be written
    pub image_available: Semaphore,
    /// Signaled when the graphics submit finishes; present waits on it
    pub render_finished: Semaphore,
    /// CPU-side gate bounding queue depth to the in-flight count
    pub in_flight: Fence,
}

impl FrameSync {
    /// Create frame synchronization objects
    pub fn new(device: Device) -> VulkanResult<Self> {
        let image_available = Semaphore::new(device.clone())?;
        let render_finished = Semaphore::new(device.clone())?;
        let in_flight = Fence::new(device, true)?;

        Ok(Self {
            image_available,
            render_finished,
            in_flight,
        })
    }
}

/// Semaphore pair coordinating the compute and graphics queues.
///
/// Compute waits on `drawing_finished` (signaled by the previous graphics
/// submit) so the depth buffer it probes is stable; graphics waits on
/// `compute_finished` so particle state is fully written before drawing.
pub struct ComputeSync {
    /// Signaled by the compute submit, waited on by graphics at top-of-pipe
    pub compute_finished: Semaphore,
    /// Signaled by graphics when compute was part of the frame
    pub drawing_finished: Semaphore,
}

impl ComputeSync {
    /// Create the compute/graphics semaphore pair
    pub fn new(device: Device) -> VulkanResult<Self> {
        Ok(Self {
            compute_finished: Semaphore::new(device.clone())?,
            drawing_finished: Semaphore::new(device)?,
        })
    }
}

/// Host-side scheduling state for the frame loop.
///
/// Pure bookkeeping, no device handles: which in-flight slot is active, how
/// many frames have been presented, and whether a compute submit since the
/// last graphics submit obliges the next graphics submit to wait.
#[derive(Debug, Clone)]
pub struct FrameSchedule {
    in_flight_count: usize,
    active_slot: usize,
    frame_counter: u64,
    graphics_should_wait_for_compute: bool,
}

impl FrameSchedule {
    /// Create a schedule cycling through `in_flight_count` slots
    pub fn new(in_flight_count: usize) -> Self {
        Self {
            in_flight_count,
            active_slot: 0,
            frame_counter: 0,
            graphics_should_wait_for_compute: false,
        }
    }

    /// Slot whose sync objects the current frame uses
    pub fn active_slot(&self) -> usize {
        self.active_slot
    }

    /// Number of frames presented so far
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Whether the compute submit may wait on `drawing_finished`. On the very
    /// first frame that semaphore has never been signaled, so waiting on it
    /// would deadlock the queue.
    pub fn compute_waits_on_drawing(&self) -> bool {
        self.frame_counter > 0
    }

    /// Record that a compute submission happened this frame
    pub fn note_compute_submitted(&mut self) {
        self.graphics_should_wait_for_compute = true;
    }

    /// Consume the compute-wait obligation for the next graphics submit
    pub fn take_compute_wait(&mut self) -> bool {
        std::mem::replace(&mut self.graphics_should_wait_for_compute, false)
    }

    /// Advance to the next frame after present
    pub fn advance(&mut self) {
        self.active_slot = (self.active_slot + 1) % self.in_flight_count;
        self.frame_counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_cycle_modulo_in_flight_count() {
        let mut schedule = FrameSchedule::new(2);
        assert_eq!(schedule.active_slot(), 0);
        schedule.advance();
        assert_eq!(schedule.active_slot(), 1);
        schedule.advance();
        assert_eq!(schedule.active_slot(), 0);
        assert_eq!(schedule.frame_counter(), 2);
    }

    #[test]
    fn compute_never_waits_on_first_frame() {
        let mut schedule = FrameSchedule::new(2);
        assert!(!schedule.compute_waits_on_drawing());
        schedule.advance();
        assert!(schedule.compute_waits_on_drawing());
    }

    #[test]
    fn compute_wait_flag_is_consumed_by_graphics() {
        let mut schedule = FrameSchedule::new(2);

        // No compute submitted: graphics does not wait.
        assert!(!schedule.take_compute_wait());

        // Compute submitted: exactly the next graphics submit waits.
        schedule.note_compute_submitted();
        assert!(schedule.take_compute_wait());
        assert!(!schedule.take_compute_wait());
    }

    #[test]
    fn compute_wait_flag_survives_frame_advance() {
        // The flag is tied to submit ordering, not to frame boundaries.
        let mut schedule = FrameSchedule::new(2);
        schedule.note_compute_submitted();
        schedule.advance();
        assert!(schedule.take_compute_wait());
    }
}
