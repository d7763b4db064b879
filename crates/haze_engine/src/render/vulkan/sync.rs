//! Synchronization primitives
//!
//! Semaphores order GPU work against other GPU work and are never waited
//! on from the CPU; fences are how the CPU blocks until submitted work
//! has retired. Fence waits use the maximum timeout — a stuck GPU is a
//! fatal condition, not one this layer recovers from.

use ash::{vk, Device};
use crate::render::vulkan::{VulkanError, VulkanResult};

/// GPU-GPU ordering signal with automatic cleanup
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new binary semaphore
    pub fn new(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let semaphore = unsafe {
            device.create_semaphore(&create_info, None)
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

/// CPU-observable completion signal with automatic cleanup
pub struct Fence {
    device: Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence, optionally already signaled
    pub fn new(device: Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = unsafe {
            device.create_fence(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, fence })
    }

    /// Block until the fence signals
    pub fn wait(&self) -> VulkanResult<()> {
        unsafe {
            self.device.wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(VulkanError::Api)
        }
    }

    /// Reset the fence to unsignaled
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe {
            self.device.reset_fences(&[self.fence])
                .map_err(VulkanError::Api)
        }
    }

    /// Whether the fence is currently signaled
    pub fn is_signaled(&self) -> VulkanResult<bool> {
        unsafe {
            self.device.get_fence_status(self.fence)
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

/// Synchronization objects for one in-flight frame slot
pub struct FrameSync {
    /// Signaled by acquisition, waited on by the compute submission
    pub image_available: Semaphore,
    /// Signaled by the graphics submission, waited on by present
    pub render_finished: Semaphore,
    /// Re-armed by the graphics submission; the CPU waits here before
    /// reusing this slot
    pub in_flight: Fence,
}

impl FrameSync {
    /// Create the synchronization objects for one frame slot
    ///
    /// The fence starts signaled so the first frame does not deadlock.
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
