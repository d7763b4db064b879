//! Image allocation and the layout state machine
//!
//! Every [`AllocatedImage`] carries an [`ImageLayoutState`]. Layout
//! changes go through the single [`AllocatedImage::transition`] entry
//! point, which records the barrier and updates the tracked state in the
//! same call, so the tracked state and the device-side layout cannot
//! diverge. Descriptor info is derived from the current state at call
//! time rather than cached.

use ash::{vk, Device};

use crate::render::vulkan::buffer::Buffer;
use crate::render::vulkan::context::DeviceContext;
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Tracked layout of an allocated image
///
/// Mirrors the Vulkan layouts this engine actually uses. `General` is the
/// steady state: both compute writes and sampled reads are legal there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayoutState {
    /// Freshly created, contents undefined
    Undefined,
    /// Transfer destination during staging upload
    TransferDst,
    /// Read-only sampled access
    ShaderRead,
    /// Storage writes and sampled reads both legal
    General,
}

impl ImageLayoutState {
    /// The Vulkan layout corresponding to this state
    pub fn vk_layout(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::General => vk::ImageLayout::GENERAL,
        }
    }
}

/// Access and stage masks for one legal layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierMasks {
    /// Accesses that must complete before the transition
    pub src_access: vk::AccessFlags,
    /// Accesses that wait on the transition
    pub dst_access: vk::AccessFlags,
    /// Pipeline stage producing the source accesses
    pub src_stage: vk::PipelineStageFlags,
    /// Pipeline stage consuming the destination accesses
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier masks for a layout transition, or `None` if the transition is
/// not part of the engine's protocol
pub fn barrier_masks(from: ImageLayoutState, to: ImageLayoutState) -> Option<BarrierMasks> {
    use ImageLayoutState::*;
    let masks = match (from, to) {
        (Undefined, TransferDst) => BarrierMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (Undefined, General) => BarrierMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        },
        (TransferDst, General) => BarrierMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        (TransferDst, ShaderRead) => BarrierMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        (General, ShaderRead) => BarrierMasks {
            src_access: vk::AccessFlags::SHADER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        (ShaderRead, General) => BarrierMasks {
            src_access: vk::AccessFlags::SHADER_READ,
            dst_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            src_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        },
        _ => return None,
    };
    Some(masks)
}

/// Families an image must be shared across, or `None` when graphics and
/// compute alias the same family and exclusive ownership suffices
fn concurrent_families(graphics_family: u32, compute_family: u32) -> Option<[u32; 2]> {
    if graphics_family == compute_family {
        None
    } else {
        Some([graphics_family, compute_family])
    }
}

/// 2-D RGBA8 image with bound device-local memory, view and sampler
pub struct AllocatedImage {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    sampler: vk::Sampler,
    width: u32,
    height: u32,
    layout: ImageLayoutState,
}

impl AllocatedImage {
    const FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
    const CHANNELS: u32 = 4;

    /// Create an image usable as storage target and sampled texture
    ///
    /// `transfer_dst` additionally allows staging uploads into it.
    pub fn new(
        ctx: &DeviceContext,
        width: u32,
        height: u32,
        transfer_dst: bool,
    ) -> VulkanResult<Self> {
        let device = ctx.raw_device();

        let mut usage = vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED;
        if transfer_dst {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }

        // With split graphics/compute families the image is accessed from
        // both without a queue ownership transfer, so it must be shared
        let shared_families = concurrent_families(
            ctx.physical_device.graphics_family,
            ctx.physical_device.compute_family,
        );

        let mut image_create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(Self::FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        if let Some(queue_families) = &shared_families {
            image_create_info = image_create_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(queue_families);
        }

        let image = unsafe {
            device.create_image(&image_create_info, None)
                .map_err(VulkanError::Api)?
        };

        let memory_requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = ctx.find_memory_type(
            memory_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let memory_allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(memory_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device.allocate_memory(&memory_allocate_info, None)
                .map_err(VulkanError::Api)?
        };

        unsafe {
            device.bind_image_memory(image, memory, 0)
                .map_err(VulkanError::Api)?;
        }

        let view_create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(Self::FORMAT)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe {
            device.create_image_view(&view_create_info, None)
                .map_err(VulkanError::Api)?
        };

        let sampler_create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .min_lod(0.0)
            .max_lod(0.0);

        let sampler = unsafe {
            device.create_sampler(&sampler_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device,
            image,
            memory,
            view,
            sampler,
            width,
            height,
            layout: ImageLayoutState::Undefined,
        })
    }

    /// Record a layout transition and update the tracked state
    ///
    /// The only way the tracked layout changes. Panics on a transition
    /// outside the engine's protocol; that is a caller bug, not a
    /// recoverable runtime fault.
    pub fn transition(&mut self, command_buffer: vk::CommandBuffer, to: ImageLayoutState) {
        let masks = barrier_masks(self.layout, to).unwrap_or_else(|| {
            panic!("illegal image layout transition {:?} -> {:?}", self.layout, to)
        });

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(self.layout.vk_layout())
            .new_layout(to.vk_layout())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access);

        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier.build()],
            );
        }

        self.layout = to;
    }

    /// Make compute writes visible to sampled reads without leaving GENERAL
    ///
    /// Access-mask-only barrier between the compute-shader and
    /// fragment-shader stages; the layout stays GENERAL throughout. Both
    /// stages must be supported by the recording queue, so this belongs on
    /// the graphics command buffer of a compute-capable graphics family,
    /// ahead of the draws that sample the image.
    pub fn compute_write_to_sample_barrier(&self, command_buffer: vk::CommandBuffer) {
        assert_eq!(
            self.layout,
            ImageLayoutState::General,
            "sample barrier requires the image in GENERAL"
        );

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ);

        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier.build()],
            );
        }
    }

    /// Upload host pixels through a transient staging buffer
    ///
    /// Synchronous one-shot submission: undefined → transfer-dst, copy,
    /// transfer-dst → general. The staging buffer is freed on return.
    pub fn upload_pixels(&mut self, ctx: &DeviceContext, pixels: &[u8]) -> VulkanResult<()> {
        // The transition table has no path back into transfer-dst; a new
        // upload needs a new image
        if self.layout != ImageLayoutState::Undefined {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "upload requires a freshly created image, layout is {:?}",
                    self.layout
                ),
            });
        }

        let expected = (self.width * self.height * Self::CHANNELS) as usize;
        if pixels.len() != expected {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "pixel buffer is {} bytes, {}x{} RGBA needs {}",
                    pixels.len(), self.width, self.height, expected
                ),
            });
        }

        let staging = Buffer::new(
            ctx,
            expected as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        staging.write_data(pixels)?;

        let command_buffer = ctx.graphics_pool.begin_single_time()?;

        self.transition(command_buffer, ImageLayoutState::TransferDst);

        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            });

        unsafe {
            self.device.cmd_copy_buffer_to_image(
                command_buffer,
                staging.handle(),
                self.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region.build()],
            );
        }

        self.transition(command_buffer, ImageLayoutState::General);

        ctx.graphics_pool.end_single_time(command_buffer, ctx.device.graphics_queue)?;

        log::debug!("Uploaded {}x{} image ({} bytes)", self.width, self.height, expected);
        Ok(())
    }

    /// Descriptor info for sampled access, derived from the current state
    pub fn sampled_descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.view,
            image_layout: self.layout.vk_layout(),
        }
    }

    /// Descriptor info for storage access; the image must be in GENERAL
    pub fn storage_descriptor_info(&self) -> vk::DescriptorImageInfo {
        assert_eq!(
            self.layout,
            ImageLayoutState::General,
            "storage access requires the image in GENERAL"
        );
        vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: self.view,
            image_layout: vk::ImageLayout::GENERAL,
        }
    }

    /// Current tracked layout
    pub fn layout(&self) -> ImageLayoutState {
        self.layout
    }

    /// Image width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Image height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }
}

impl Drop for AllocatedImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ImageLayoutState::*;

    #[test]
    fn upload_path_is_legal() {
        // undefined -> transfer-dst -> general, the staging protocol
        assert!(barrier_masks(Undefined, TransferDst).is_some());
        assert!(barrier_masks(TransferDst, General).is_some());
    }

    #[test]
    fn no_shortcut_out_of_transfer_dst() {
        // transfer-dst may not be left for undefined, and general may not
        // be re-entered from itself
        assert!(barrier_masks(TransferDst, Undefined).is_none());
        assert!(barrier_masks(General, General).is_none());
    }

    #[test]
    fn no_path_back_into_transfer_dst() {
        // an uploaded image can never be re-staged; upload_pixels guards
        // on this before touching the table
        assert!(barrier_masks(General, TransferDst).is_none());
        assert!(barrier_masks(ShaderRead, TransferDst).is_none());
    }

    #[test]
    fn single_family_images_stay_exclusive() {
        assert_eq!(concurrent_families(0, 0), None);
        assert_eq!(concurrent_families(3, 3), None);
    }

    #[test]
    fn split_families_share_the_image() {
        assert_eq!(concurrent_families(0, 2), Some([0, 2]));
    }

    #[test]
    fn undefined_to_transfer_dst_masks() {
        let masks = barrier_masks(Undefined, TransferDst).unwrap();
        assert_eq!(masks.src_access, vk::AccessFlags::empty());
        assert_eq!(masks.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::TRANSFER);
    }

    #[test]
    fn transfer_dst_to_general_flushes_transfer_writes() {
        let masks = barrier_masks(TransferDst, General).unwrap();
        assert_eq!(masks.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert!(masks.dst_access.contains(vk::AccessFlags::SHADER_READ));
        assert!(masks.dst_stage.contains(vk::PipelineStageFlags::COMPUTE_SHADER));
    }

    #[test]
    fn vk_layout_mapping() {
        assert_eq!(Undefined.vk_layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(TransferDst.vk_layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(ShaderRead.vk_layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(General.vk_layout(), vk::ImageLayout::GENERAL);
    }
}
