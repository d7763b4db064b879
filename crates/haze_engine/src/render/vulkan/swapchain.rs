//! Swapchain ownership, acquisition, submission and presentation
//!
//! The swapchain owns the presentable image chain and everything whose
//! lifetime is coupled to it: image views, per-image depth buffers and
//! framebuffers, the render pass, and the per-frame synchronization
//! primitives. On resize the whole bundle is destroyed and rebuilt
//! atomically; the old instance stays alive just long enough to hand its
//! handle to the new create-info.
//!
//! Teardown order is a design invariant, not a runtime check: the manual
//! `Drop` head destroys image views then the swapchain handle, and the
//! field declaration order takes care of the rest (depth buffers,
//! framebuffers, render pass, per-frame sync, compute-finished
//! semaphore).

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device};

use crate::render::vulkan::context::DeviceContext;
use crate::render::vulkan::framebuffer::{DepthBuffer, Framebuffer};
use crate::render::vulkan::render_pass::RenderPass;
use crate::render::vulkan::sync::{FrameSync, Semaphore};
use crate::render::vulkan::{VulkanError, VulkanResult};

/// CPU-side frames in flight
///
/// Deliberately 1: the CPU blocks at the start of each frame until the
/// previous frame's graphics work has retired, trading pipelining for
/// determinism. The ring arithmetic is the only thing that depends on it.
pub const MAX_FRAMES_IN_FLIGHT: usize = 1;

/// Outcome of acquiring a presentable image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// An image is ready for recording; the index is valid until present
    Ready {
        /// Index into the swapchain image array
        image_index: u32,
    },
    /// The swapchain is out of date; recreate and skip this frame
    NeedsRecreation,
}

/// Outcome of presenting a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Present {
    /// The frame was handed to the presentation engine
    Presented,
    /// The swapchain is out of date or suboptimal; recreate before the
    /// next frame
    NeedsRecreation,
}

/// Prefer 8-bit BGRA sRGB; otherwise take the first advertised format
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .find(|sf| {
            sf.format == vk::Format::B8G8R8A8_SRGB
                && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .cloned()
        .unwrap_or(formats[0])
}

/// Prefer mailbox, then immediate, then the always-available FIFO
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else if modes.contains(&vk::PresentModeKHR::IMMEDIATE) {
        vk::PresentModeKHR::IMMEDIATE
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Device-reported current extent if defined, else the requested extent
/// clamped to the surface limits
pub fn choose_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: requested.width.clamp(
                caps.min_image_extent.width,
                caps.max_image_extent.width,
            ),
            height: requested.height.clamp(
                caps.min_image_extent.height,
                caps.max_image_extent.height,
            ),
        }
    }
}

/// Driver minimum plus one, clamped to the maximum when one is reported
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

/// Swapchain and the resources whose lifetime is coupled to it
pub struct Swapchain {
    device: Device,
    swapchain_loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    // Fields below drop in declaration order after the manual Drop head
    // has destroyed image views and the swapchain handle.
    depth_buffers: Vec<DepthBuffer>,
    framebuffers: Vec<Framebuffer>,
    render_pass: RenderPass,
    frame_sync: Vec<FrameSync>,
    compute_finished: Semaphore,
}

impl Swapchain {
    /// Create the swapchain bundle
    ///
    /// `old` is the previous instance during recreation; its handle is
    /// passed to the driver for possible resource reuse.
    pub fn new(
        ctx: &DeviceContext,
        window_extent: vk::Extent2D,
        old: Option<&Swapchain>,
    ) -> VulkanResult<Self> {
        let device = ctx.raw_device();
        let swapchain_loader = ctx.device.swapchain_loader.clone();
        let physical = ctx.physical_device.device;

        let surface_caps = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_capabilities(physical, ctx.surface)
                .map_err(VulkanError::Api)?
        };

        let surface_formats = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_formats(physical, ctx.surface)
                .map_err(VulkanError::Api)?
        };

        let present_modes = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_present_modes(physical, ctx.surface)
                .map_err(VulkanError::Api)?
        };

        let format = choose_surface_format(&surface_formats);
        let present_mode = choose_present_mode(&present_modes);
        let extent = choose_extent(&surface_caps, window_extent);
        let image_count = choose_image_count(&surface_caps);

        let old_swapchain = old.map(|s| s.swapchain).unwrap_or(vk::SwapchainKHR::null());

        let swapchain_create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(ctx.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe {
            swapchain_loader
                .create_swapchain(&swapchain_create_info, None)
                .map_err(VulkanError::Api)?
        };

        let images = unsafe {
            swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(VulkanError::Api)?
        };

        let image_views: Result<Vec<_>, _> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe { device.create_image_view(&create_info, None) }
            })
            .collect();

        let image_views = image_views.map_err(VulkanError::Api)?;

        let render_pass = RenderPass::new(device.clone(), format.format)?;

        let depth_buffers: VulkanResult<Vec<_>> = images
            .iter()
            .map(|_| DepthBuffer::new(ctx, extent))
            .collect();
        let depth_buffers = depth_buffers?;

        let framebuffers: VulkanResult<Vec<_>> = image_views
            .iter()
            .zip(&depth_buffers)
            .map(|(&view, depth)| {
                Framebuffer::new(
                    device.clone(),
                    render_pass.handle(),
                    &[view, depth.image_view()],
                    extent,
                )
            })
            .collect();
        let framebuffers = framebuffers?;

        // The presentation layer's image count must equal the count of
        // depth buffers and framebuffers at all times
        assert_eq!(images.len(), depth_buffers.len());
        assert_eq!(images.len(), framebuffers.len());

        let frame_sync: VulkanResult<Vec<_>> = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameSync::new(device.clone()))
            .collect();
        let frame_sync = frame_sync?;

        let compute_finished = Semaphore::new(device.clone())?;

        log::info!(
            "Swapchain created: {}x{}, {} images, {:?}/{:?}",
            extent.width, extent.height, images.len(), format.format, present_mode
        );

        Ok(Self {
            device,
            swapchain_loader,
            swapchain,
            images,
            image_views,
            format,
            extent,
            depth_buffers,
            framebuffers,
            render_pass,
            frame_sync,
            compute_finished,
        })
    }

    /// Wait for the frame slot's fence, then acquire the next image
    ///
    /// An out-of-date result is an expected, recoverable condition during
    /// resize and is reported as `NeedsRecreation`, not an error.
    pub fn acquire_next_image(&self, current_frame: usize) -> VulkanResult<Acquire> {
        let sync = &self.frame_sync[current_frame];
        sync.in_flight.wait()?;

        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                sync.image_available.handle(),
                vk::Fence::null(),
            )
        };

        match result {
            Ok((image_index, _suboptimal)) => Ok(Acquire::Ready { image_index }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::NeedsRecreation),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    /// Submit one frame's compute and graphics work, then present
    ///
    /// Compute is gated on image availability and signals the
    /// compute-finished semaphore; graphics waits on that semaphore at the
    /// vertex-input and color-output stages, signals render-finished and
    /// re-arms the in-flight fence; present waits on render-finished.
    pub fn submit(
        &self,
        ctx: &DeviceContext,
        current_frame: usize,
        compute_cmd: vk::CommandBuffer,
        graphics_cmd: vk::CommandBuffer,
        image_index: u32,
    ) -> VulkanResult<Present> {
        let sync = &self.frame_sync[current_frame];

        // Compute first, ordered after acquisition
        let compute_wait = [sync.image_available.handle()];
        let compute_wait_stages = [vk::PipelineStageFlags::COMPUTE_SHADER];
        let compute_cmds = [compute_cmd];
        let compute_signal = [self.compute_finished.handle()];
        let compute_submit = vk::SubmitInfo::builder()
            .wait_semaphores(&compute_wait)
            .wait_dst_stage_mask(&compute_wait_stages)
            .command_buffers(&compute_cmds)
            .signal_semaphores(&compute_signal);

        unsafe {
            self.device
                .queue_submit(
                    ctx.device.compute_queue,
                    &[compute_submit.build()],
                    vk::Fence::null(),
                )
                .map_err(VulkanError::Api)?;
        }

        // Graphics, ordered after compute
        let graphics_wait = [self.compute_finished.handle()];
        let graphics_wait_stages = [
            vk::PipelineStageFlags::VERTEX_INPUT | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ];
        let graphics_cmds = [graphics_cmd];
        let graphics_signal = [sync.render_finished.handle()];
        let graphics_submit = vk::SubmitInfo::builder()
            .wait_semaphores(&graphics_wait)
            .wait_dst_stage_mask(&graphics_wait_stages)
            .command_buffers(&graphics_cmds)
            .signal_semaphores(&graphics_signal);

        sync.in_flight.reset()?;
        unsafe {
            self.device
                .queue_submit(
                    ctx.device.graphics_queue,
                    &[graphics_submit.build()],
                    sync.in_flight.handle(),
                )
                .map_err(VulkanError::Api)?;
        }

        // Present, ordered after graphics
        let present_wait = [sync.render_finished.handle()];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&present_wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain_loader
                .queue_present(ctx.device.present_queue, &present_info)
        };

        match result {
            Ok(false) => Ok(Present::Presented),
            Ok(true) => Ok(Present::NeedsRecreation),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Present::NeedsRecreation),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    /// Get swapchain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Get surface format
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Number of presentable images
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Get the render pass owned by this swapchain
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.handle()
    }

    /// Framebuffer for a swapchain image index
    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize].handle()
    }

    /// Synchronization objects for a frame slot
    pub fn frame_sync(&self, current_frame: usize) -> &FrameSync {
        &self.frame_sync[current_frame]
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &image_view in &self.image_views {
                self.device.destroy_image_view(image_view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
        // depth_buffers, framebuffers, render_pass, frame_sync and the
        // compute_finished semaphore drop in declaration order.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(
        current: (u32, u32),
        min: (u32, u32),
        max: (u32, u32),
        min_images: u32,
        max_images: u32,
    ) -> vk::SurfaceCapabilitiesKHR {
        let mut c = vk::SurfaceCapabilitiesKHR::default();
        c.current_extent = vk::Extent2D { width: current.0, height: current.1 };
        c.min_image_extent = vk::Extent2D { width: min.0, height: min.1 };
        c.max_image_extent = vk::Extent2D { width: max.0, height: max.1 };
        c.min_image_count = min_images;
        c.max_image_count = max_images;
        c
    }

    #[test]
    fn prefers_bgra_srgb() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn present_mode_preference_order() {
        assert_eq!(
            choose_present_mode(&[
                vk::PresentModeKHR::FIFO,
                vk::PresentModeKHR::MAILBOX,
                vk::PresentModeKHR::IMMEDIATE,
            ]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_uses_driver_value_when_defined() {
        let c = caps((1024, 768), (1, 1), (4096, 4096), 2, 0);
        let extent = choose_extent(&c, vk::Extent2D { width: 640, height: 480 });
        assert_eq!((extent.width, extent.height), (1024, 768));
    }

    #[test]
    fn extent_clamps_when_driver_leaves_it_open() {
        let mut c = caps((0, 0), (200, 200), (1000, 1000), 2, 0);
        c.current_extent = vk::Extent2D { width: u32::MAX, height: u32::MAX };

        let small = choose_extent(&c, vk::Extent2D { width: 100, height: 100 });
        assert_eq!((small.width, small.height), (200, 200));

        let big = choose_extent(&c, vk::Extent2D { width: 5000, height: 5000 });
        assert_eq!((big.width, big.height), (1000, 1000));
    }

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        let unbounded = caps((800, 600), (1, 1), (4096, 4096), 2, 0);
        assert_eq!(choose_image_count(&unbounded), 3);

        let tight = caps((800, 600), (1, 1), (4096, 4096), 2, 2);
        assert_eq!(choose_image_count(&tight), 2);
    }

    #[test]
    fn single_frame_in_flight() {
        // The ring arithmetic in the orchestrator depends on this
        assert_eq!(MAX_FRAMES_IN_FLIGHT, 1);
    }
}
