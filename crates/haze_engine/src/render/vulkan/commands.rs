//! Command buffer management
//!
//! One long-lived pool per queue family, plus the synchronous one-shot
//! command pattern used for setup work (uploads, initial layout
//! transitions). One-shot submission blocks the calling thread until the
//! work retires; it is never used on the per-frame path.

use ash::{vk, Device};
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool for a queue family
    pub fn new(device: Device, queue_family_index: u32) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe {
            device.create_command_pool(&pool_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device,
            command_pool,
            queue_family: queue_family_index,
        })
    }

    /// Allocate primary command buffers
    pub fn allocate_command_buffers(&self, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let command_buffers = unsafe {
            self.device.allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?
        };

        Ok(command_buffers)
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Queue family this pool allocates for
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Begin a one-shot command buffer
    pub fn begin_single_time(&self) -> VulkanResult<vk::CommandBuffer> {
        let command_buffer = self.allocate_command_buffers(1)?[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device.begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }

        Ok(command_buffer)
    }

    /// End, submit and wait for a one-shot command buffer
    pub fn end_single_time(&self, command_buffer: vk::CommandBuffer, queue: vk::Queue) -> VulkanResult<()> {
        unsafe {
            self.device.end_command_buffer(command_buffer)
                .map_err(VulkanError::Api)?;

            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::builder()
                .command_buffers(&command_buffers);

            self.device.queue_submit(queue, &[submit_info.build()], vk::Fence::null())
                .map_err(VulkanError::Api)?;
            self.device.queue_wait_idle(queue)
                .map_err(VulkanError::Api)?;

            self.device.free_command_buffers(self.command_pool, &command_buffers);
        }

        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            // All command buffers must have retired before the pool goes
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
