//! Buffer management
//!
//! Explicit allocation: create the buffer, query its memory requirements,
//! pick a memory type, allocate and bind. RAII cleanup in reverse.

use ash::{vk, Device};
use std::mem;

use crate::render::vulkan::context::DeviceContext;
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Buffer with bound host-visible memory
pub struct Buffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl Buffer {
    /// Create a buffer backed by host-visible, host-coherent memory
    pub fn new(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<Self> {
        let device = ctx.raw_device();

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device.create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?
        };

        let mem_requirements = unsafe {
            device.get_buffer_memory_requirements(buffer)
        };

        let memory_type_index = ctx.find_memory_type(
            mem_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device.allocate_memory(&alloc_info, None)
                .map_err(VulkanError::Api)?
        };

        unsafe {
            device.bind_buffer_memory(buffer, memory, 0)
                .map_err(VulkanError::Api)?;
        }

        Ok(Self {
            device,
            buffer,
            memory,
            size,
        })
    }

    /// Map memory for writing
    pub fn map_memory(&self) -> VulkanResult<*mut std::ffi::c_void> {
        unsafe {
            self.device.map_memory(
                self.memory,
                0,
                self.size,
                vk::MemoryMapFlags::empty(),
            ).map_err(VulkanError::Api)
        }
    }

    /// Unmap memory
    pub fn unmap_memory(&self) {
        unsafe {
            self.device.unmap_memory(self.memory);
        }
    }

    /// Copy host data into the buffer
    ///
    /// The byte length of `data` must fit inside the allocated size; an
    /// oversized slice is rejected before anything is mapped.
    pub fn write_data<T>(&self, data: &[T]) -> VulkanResult<()> {
        let byte_len = mem::size_of_val(data);
        checked_write_size(byte_len, self.size)?;

        let data_ptr = self.map_memory()?;

        unsafe {
            let src_ptr = data.as_ptr() as *const std::ffi::c_void;
            std::ptr::copy_nonoverlapping(src_ptr, data_ptr, byte_len);
        }

        self.unmap_memory();
        Ok(())
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get allocated size
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// A host write must fit inside the buffer's allocated size
fn checked_write_size(byte_len: usize, capacity: vk::DeviceSize) -> VulkanResult<()> {
    if byte_len as vk::DeviceSize > capacity {
        return Err(VulkanError::InvalidOperation {
            reason: format!("write of {} bytes exceeds buffer capacity {}", byte_len, capacity),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_up_to_capacity_are_accepted() {
        assert!(checked_write_size(0, 64).is_ok());
        assert!(checked_write_size(64, 64).is_ok());
    }

    #[test]
    fn oversized_write_is_rejected() {
        let result = checked_write_size(65, 64);
        assert!(matches!(result, Err(VulkanError::InvalidOperation { .. })));
    }
}
