//! Frame orchestration
//!
//! The [`Renderer`] is the engine root: it owns the window, the device
//! context, the swapchain bundle, both pipelines and the fixed resource
//! set for one compute-then-present cycle. Each frame alternates a compute
//! pass writing the transformed image with a graphics pass presenting the
//! original and transformed images side by side.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::config::EngineConfig;
use crate::render::vulkan::image::ImageLayoutState;
use crate::render::vulkan::swapchain::MAX_FRAMES_IN_FLIGHT;
use crate::render::vulkan::{
    Acquire, AllocatedImage, Buffer, ComputePipeline, DescriptorPool, DescriptorPoolBuilder,
    DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter, DeviceContext,
    GraphicsPipeline, Present, ShaderModule, Swapchain, VulkanError, VulkanResult, Window,
};

/// Compute kernel workgroup edge; dispatch counts round up to cover the
/// whole image
const WORKGROUP_SIZE: u32 = 16;

/// Loop lifecycle
///
/// The state only moves forward: `Running` until a close is requested,
/// `ShuttingDown` until teardown has run, then `Stopped`. Teardown runs
/// exactly once no matter how many times shutdown is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Frames are being produced
    Running,
    /// Close requested; no further frames, teardown pending
    ShuttingDown,
    /// Teardown complete
    Stopped,
}

/// Events that drive the loop-state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEvent {
    CloseRequested,
    TeardownComplete,
}

impl LoopState {
    /// The single transition function; every state change goes through here
    fn transition(self, event: LoopEvent) -> LoopState {
        match (self, event) {
            (LoopState::Running, LoopEvent::CloseRequested) => LoopState::ShuttingDown,
            (LoopState::ShuttingDown, LoopEvent::TeardownComplete) => LoopState::Stopped,
            (state, _) => state,
        }
    }
}

/// Handle to one in-progress frame
///
/// Produced by [`Renderer::begin_frame`] and consumed by
/// [`Renderer::end_frame`]; the recording methods assert the command
/// buffers belong to the frame the renderer has open.
pub struct FrameContext {
    /// Swapchain image index acquired for this frame
    pub image_index: u32,
    /// Ring slot whose synchronization objects gate this frame
    pub frame_slot: usize,
    /// Compute-queue command buffer, recording
    pub compute_cmd: vk::CommandBuffer,
    /// Graphics-queue command buffer, recording
    pub graphics_cmd: vk::CommandBuffer,
}

/// Fullscreen-quad vertex: clip-space position and texture coordinate
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct QuadVertex {
    position: [f32; 2],
    uv: [f32; 2],
}

impl QuadVertex {
    fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<QuadVertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::size_of::<[f32; 2]>() as u32,
            },
        ]
    }
}

const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex { position: [-1.0, -1.0], uv: [0.0, 0.0] },
    QuadVertex { position: [1.0, -1.0], uv: [1.0, 0.0] },
    QuadVertex { position: [1.0, 1.0], uv: [1.0, 1.0] },
    QuadVertex { position: [-1.0, 1.0], uv: [0.0, 1.0] },
];

const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Ring arithmetic for the in-flight frame slot
fn next_frame_slot(slot: usize) -> usize {
    (slot + 1) % MAX_FRAMES_IN_FLIGHT
}

/// Engine root: device, swapchain, pipelines, resources and the frame loop
pub struct Renderer {
    current_frame: usize,
    frame_open: bool,
    loop_state: LoopState,
    graphics_cmds: Vec<vk::CommandBuffer>,
    compute_cmds: Vec<vk::CommandBuffer>,
    compute_set: Option<vk::DescriptorSet>,
    input_sampler_set: Option<vk::DescriptorSet>,
    output_sampler_set: Option<vk::DescriptorSet>,
    // Device resources drop before the swapchain, the swapchain before the
    // context, the context before the window.
    input_image: Option<AllocatedImage>,
    output_image: Option<AllocatedImage>,
    quad_vertices: Buffer,
    quad_indices: Buffer,
    descriptor_pool: DescriptorPool,
    compute_layout: DescriptorSetLayout,
    sampler_layout: DescriptorSetLayout,
    compute_pipeline: ComputePipeline,
    graphics_pipeline: GraphicsPipeline,
    swapchain: Swapchain,
    ctx: DeviceContext,
    window: Window,
}

impl Renderer {
    /// Create the renderer from a configuration
    ///
    /// Builds the window, device context, swapchain, both pipelines (from
    /// the configured SPIR-V binaries), the descriptor layouts and pool,
    /// the quad geometry and the per-frame command buffers. The input
    /// image is supplied later via [`Renderer::create_input_image`].
    pub fn new(config: &EngineConfig) -> VulkanResult<Self> {
        let mut window = Window::new(
            &config.window.title,
            config.window.width,
            config.window.height,
        )
        .map_err(|e| VulkanError::InitializationFailed(format!("Window creation: {}", e)))?;

        let ctx = DeviceContext::new(&mut window, &config.window.title, &config.device)?;
        let device = ctx.raw_device();

        let (fb_width, fb_height) = window.get_framebuffer_size();
        let swapchain = Swapchain::new(
            &ctx,
            vk::Extent2D { width: fb_width, height: fb_height },
            None,
        )?;

        let compute_layout = DescriptorSetLayoutBuilder::new()
            .add_storage_image(0, vk::ShaderStageFlags::COMPUTE)
            .add_storage_image(1, vk::ShaderStageFlags::COMPUTE)
            .build(&device)?;

        let sampler_layout = DescriptorSetLayoutBuilder::new()
            .add_combined_image_sampler(0, vk::ShaderStageFlags::FRAGMENT)
            .build(&device)?;

        let compute_shader = ShaderModule::from_file(device.clone(), &config.shaders.compute)?;
        let vertex_shader = ShaderModule::from_file(device.clone(), &config.shaders.vertex)?;
        let fragment_shader = ShaderModule::from_file(device.clone(), &config.shaders.fragment)?;

        let compute_pipeline = ComputePipeline::new(
            device.clone(),
            &[compute_layout.handle()],
            &compute_shader,
        )?;

        let binding_descriptions = [QuadVertex::binding_description()];
        let attribute_descriptions = QuadVertex::attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions)
            .build();

        let graphics_pipeline = GraphicsPipeline::new(
            device,
            &[sampler_layout.handle()],
            swapchain.render_pass(),
            &vertex_shader,
            &fragment_shader,
            vertex_input,
        )?;

        // One compute set plus one sampler set per displayed image
        let descriptor_pool = DescriptorPoolBuilder::new()
            .add_pool_size(vk::DescriptorType::STORAGE_IMAGE, 2)
            .add_pool_size(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2)
            .set_max_sets(3)
            .build(&ctx.raw_device())?;

        let quad_vertices = Buffer::new(
            &ctx,
            std::mem::size_of_val(&QUAD_VERTICES) as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        quad_vertices.write_data(&QUAD_VERTICES)?;

        let quad_indices = Buffer::new(
            &ctx,
            std::mem::size_of_val(&QUAD_INDICES) as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        quad_indices.write_data(&QUAD_INDICES)?;

        let graphics_cmds = ctx
            .graphics_pool
            .allocate_command_buffers(MAX_FRAMES_IN_FLIGHT as u32)?;
        let compute_cmds = ctx
            .compute_pool
            .allocate_command_buffers(MAX_FRAMES_IN_FLIGHT as u32)?;

        Ok(Self {
            current_frame: 0,
            frame_open: false,
            loop_state: LoopState::Running,
            graphics_cmds,
            compute_cmds,
            compute_set: None,
            input_sampler_set: None,
            output_sampler_set: None,
            input_image: None,
            output_image: None,
            quad_vertices,
            quad_indices,
            descriptor_pool,
            compute_layout,
            sampler_layout,
            compute_pipeline,
            graphics_pipeline,
            swapchain,
            ctx,
            window,
        })
    }

    /// Upload the input image and build the matching output image and
    /// descriptor sets
    ///
    /// `pixels` is tightly packed RGBA8, so its length must be exactly
    /// `width * height * 4`. Calling this again replaces the previous
    /// images after draining the GPU.
    pub fn create_input_image(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> VulkanResult<()> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "pixel buffer length {} does not match {}x{} RGBA ({} bytes)",
                    pixels.len(), width, height, expected
                ),
            });
        }

        // Replacing live images: drain the GPU, then release the previous
        // sets back to the pool
        unsafe {
            self.ctx
                .device
                .device
                .device_wait_idle()
                .map_err(VulkanError::Api)?;
        }
        if self.compute_set.is_some() {
            self.descriptor_pool.reset()?;
        }

        let mut input_image = AllocatedImage::new(&self.ctx, width, height, true)?;
        input_image.upload_pixels(&self.ctx, pixels)?;

        let mut output_image = AllocatedImage::new(&self.ctx, width, height, false)?;
        let cmd = self.ctx.graphics_pool.begin_single_time()?;
        output_image.transition(cmd, ImageLayoutState::General);
        self.ctx
            .graphics_pool
            .end_single_time(cmd, self.ctx.device.graphics_queue)?;

        let compute_set = DescriptorWriter::new(&self.compute_layout)
            .write_image(0, input_image.storage_descriptor_info())
            .write_image(1, output_image.storage_descriptor_info())
            .build(&mut self.descriptor_pool)?;

        let input_sampler_set = DescriptorWriter::new(&self.sampler_layout)
            .write_image(0, input_image.sampled_descriptor_info())
            .build(&mut self.descriptor_pool)?;

        let output_sampler_set = DescriptorWriter::new(&self.sampler_layout)
            .write_image(0, output_image.sampled_descriptor_info())
            .build(&mut self.descriptor_pool)?;

        log::debug!("Input image uploaded: {}x{}", width, height);

        self.compute_set = Some(compute_set);
        self.input_sampler_set = Some(input_sampler_set);
        self.output_sampler_set = Some(output_sampler_set);
        self.input_image = Some(input_image);
        self.output_image = Some(output_image);
        Ok(())
    }

    /// Poll window events and feed close requests into the loop state
    pub fn handle_events(&mut self) {
        self.window.poll_events();
        if self.window.should_close() {
            self.loop_state = self.loop_state.transition(LoopEvent::CloseRequested);
        }
    }

    /// Current loop state
    pub fn loop_state(&self) -> LoopState {
        self.loop_state
    }

    /// Start a frame
    ///
    /// Returns `None` when no frame can be produced this iteration: the
    /// loop is shutting down, a resize is pending, or acquisition found
    /// the swapchain out of date. Recreation happens here; the caller
    /// simply tries again next iteration.
    pub fn begin_frame(&mut self) -> VulkanResult<Option<FrameContext>> {
        assert!(!self.frame_open, "begin_frame called with a frame already open");

        if self.loop_state != LoopState::Running {
            return Ok(None);
        }

        if self.window.resize_requested() {
            self.recreate_swapchain()?;
            return Ok(None);
        }

        let image_index = match self.swapchain.acquire_next_image(self.current_frame)? {
            Acquire::Ready { image_index } => image_index,
            Acquire::NeedsRecreation => {
                self.recreate_swapchain()?;
                return Ok(None);
            }
        };

        let graphics_cmd = self.graphics_cmds[self.current_frame];
        let compute_cmd = self.compute_cmds[self.current_frame];
        let device = &self.ctx.device.device;
        let begin_info = vk::CommandBufferBeginInfo::builder();

        unsafe {
            device
                .reset_command_buffer(compute_cmd, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
            device
                .reset_command_buffer(graphics_cmd, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
            device
                .begin_command_buffer(compute_cmd, &begin_info)
                .map_err(VulkanError::Api)?;
            device
                .begin_command_buffer(graphics_cmd, &begin_info)
                .map_err(VulkanError::Api)?;
        }

        // Compute writes become visible to this frame's sampled reads
        // ahead of the draws. The barrier's stages need a family with both
        // compute and fragment support; with split families the
        // compute-finished semaphore wait provides the memory dependency
        // and the image is concurrent-shared.
        if let Some(output_image) = &self.output_image {
            if self.ctx.physical_device.graphics_family == self.ctx.physical_device.compute_family
            {
                output_image.compute_write_to_sample_barrier(graphics_cmd);
            }
        }

        self.frame_open = true;
        Ok(Some(FrameContext {
            image_index,
            frame_slot: self.current_frame,
            compute_cmd,
            graphics_cmd,
        }))
    }

    /// Record the compute pass transforming the input image into the
    /// output image
    ///
    /// # Panics
    ///
    /// Panics if no frame is open, the frame does not belong to this
    /// renderer, or no input image has been created.
    pub fn dispatch_transform(&self, frame: &FrameContext) {
        self.assert_current_frame(frame);
        let compute_set = self
            .compute_set
            .unwrap_or_else(|| panic!("dispatch_transform called before create_input_image"));
        let input = self
            .input_image
            .as_ref()
            .unwrap_or_else(|| panic!("dispatch_transform called before create_input_image"));

        let groups_x = (input.width() + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE;
        let groups_y = (input.height() + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE;

        let device = &self.ctx.device.device;
        unsafe {
            device.cmd_bind_pipeline(
                frame.compute_cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.compute_pipeline.handle(),
            );
            device.cmd_bind_descriptor_sets(
                frame.compute_cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.compute_pipeline.layout(),
                0,
                &[compute_set],
                &[],
            );
            device.cmd_dispatch(frame.compute_cmd, groups_x, groups_y, 1);
        }
    }

    /// Record the graphics pass drawing both images into left/right
    /// viewports
    pub fn draw_side_by_side(&self, frame: &FrameContext) -> VulkanResult<()> {
        let input_set = self.input_sampler_set.ok_or_else(|| VulkanError::InvalidOperation {
            reason: "draw requested before create_input_image".to_string(),
        })?;
        let output_set = self.output_sampler_set.ok_or_else(|| VulkanError::InvalidOperation {
            reason: "draw requested before create_input_image".to_string(),
        })?;

        self.begin_render_pass(frame);

        let extent = self.swapchain.extent();
        let half_width = extent.width / 2;
        let device = &self.ctx.device.device;

        unsafe {
            device.cmd_bind_pipeline(
                frame.graphics_cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.graphics_pipeline.handle(),
            );
            device.cmd_bind_vertex_buffers(
                frame.graphics_cmd,
                0,
                &[self.quad_vertices.handle()],
                &[0],
            );
            device.cmd_bind_index_buffer(
                frame.graphics_cmd,
                self.quad_indices.handle(),
                0,
                vk::IndexType::UINT16,
            );

            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            device.cmd_set_scissor(frame.graphics_cmd, 0, &[scissor]);

            // Original left, transformed right
            let halves = [(0i32, input_set), (half_width as i32, output_set)];
            for (x_offset, set) in halves {
                let viewport = vk::Viewport {
                    x: x_offset as f32,
                    y: 0.0,
                    width: half_width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                device.cmd_set_viewport(frame.graphics_cmd, 0, &[viewport]);
                device.cmd_bind_descriptor_sets(
                    frame.graphics_cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.graphics_pipeline.layout(),
                    0,
                    &[set],
                    &[],
                );
                device.cmd_draw_indexed(
                    frame.graphics_cmd,
                    QUAD_INDICES.len() as u32,
                    1,
                    0,
                    0,
                    0,
                );
            }
        }

        self.end_render_pass(frame);
        Ok(())
    }

    /// Begin the presentation render pass on the frame's graphics command
    /// buffer
    ///
    /// # Panics
    ///
    /// Panics if no frame is open or the frame does not belong to this
    /// renderer.
    pub fn begin_render_pass(&self, frame: &FrameContext) {
        self.assert_current_frame(frame);

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(self.swapchain.render_pass())
            .framebuffer(self.swapchain.framebuffer(frame.image_index))
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.swapchain.extent(),
            })
            .clear_values(&clear_values);

        unsafe {
            self.ctx.device.device.cmd_begin_render_pass(
                frame.graphics_cmd,
                &render_pass_begin,
                vk::SubpassContents::INLINE,
            );
        }
    }

    /// End the presentation render pass
    pub fn end_render_pass(&self, frame: &FrameContext) {
        self.assert_current_frame(frame);
        unsafe {
            self.ctx.device.device.cmd_end_render_pass(frame.graphics_cmd);
        }
    }

    /// Finish and submit the frame
    ///
    /// Ends both command buffers, submits and presents, then advances the
    /// frame ring. Recreates the swapchain when present reports it stale
    /// or a resize is pending.
    pub fn end_frame(&mut self, frame: FrameContext) -> VulkanResult<()> {
        self.assert_current_frame(&frame);

        let device = &self.ctx.device.device;
        unsafe {
            device
                .end_command_buffer(frame.compute_cmd)
                .map_err(VulkanError::Api)?;
            device
                .end_command_buffer(frame.graphics_cmd)
                .map_err(VulkanError::Api)?;
        }

        let result = self.swapchain.submit(
            &self.ctx,
            self.current_frame,
            frame.compute_cmd,
            frame.graphics_cmd,
            frame.image_index,
        )?;

        self.frame_open = false;
        self.current_frame = next_frame_slot(self.current_frame);

        if result == Present::NeedsRecreation || self.window.resize_requested() {
            self.recreate_swapchain()?;
        }

        Ok(())
    }

    /// Drain the GPU and rebuild the swapchain at the current framebuffer
    /// size, blocking while the window is zero-area (minimized)
    fn recreate_swapchain(&mut self) -> VulkanResult<()> {
        let (mut width, mut height) = self.window.get_framebuffer_size();
        while (width == 0 || height == 0) && !self.window.should_close() {
            self.window.wait_events();
            let (w, h) = self.window.get_framebuffer_size();
            width = w;
            height = h;
        }
        if width == 0 || height == 0 {
            return Ok(());
        }

        unsafe {
            self.ctx
                .device
                .device
                .device_wait_idle()
                .map_err(VulkanError::Api)?;
        }

        let new_swapchain = Swapchain::new(
            &self.ctx,
            vk::Extent2D { width, height },
            Some(&self.swapchain),
        )?;
        self.swapchain = new_swapchain;
        self.window.clear_resize_request();

        log::debug!("Swapchain recreated at {}x{}", width, height);
        Ok(())
    }

    /// Run teardown once: drain the GPU and mark the loop stopped
    pub fn shutdown(&mut self) {
        if self.loop_state == LoopState::Stopped {
            return;
        }
        self.loop_state = self.loop_state.transition(LoopEvent::CloseRequested);
        unsafe {
            let _ = self.ctx.device.device.device_wait_idle();
        }
        self.loop_state = self.loop_state.transition(LoopEvent::TeardownComplete);
    }

    fn assert_current_frame(&self, frame: &FrameContext) {
        assert!(self.frame_open, "no frame is open");
        assert_eq!(
            frame.frame_slot, self.current_frame,
            "frame context does not belong to the open frame"
        );
        assert_eq!(
            frame.graphics_cmd, self.graphics_cmds[frame.frame_slot],
            "graphics command buffer does not belong to this renderer"
        );
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_slot_wraps_at_ring_size() {
        let mut slot = 0;
        for _ in 0..MAX_FRAMES_IN_FLIGHT * 3 {
            slot = next_frame_slot(slot);
            assert!(slot < MAX_FRAMES_IN_FLIGHT);
        }
    }

    #[test]
    fn loop_state_advances_forward_only() {
        let s = LoopState::Running;
        let s = s.transition(LoopEvent::CloseRequested);
        assert_eq!(s, LoopState::ShuttingDown);

        // A second close request changes nothing
        let s = s.transition(LoopEvent::CloseRequested);
        assert_eq!(s, LoopState::ShuttingDown);

        let s = s.transition(LoopEvent::TeardownComplete);
        assert_eq!(s, LoopState::Stopped);

        // Terminal state absorbs everything
        assert_eq!(s.transition(LoopEvent::CloseRequested), LoopState::Stopped);
        assert_eq!(s.transition(LoopEvent::TeardownComplete), LoopState::Stopped);
    }

    #[test]
    fn teardown_must_follow_a_close_request() {
        let s = LoopState::Running.transition(LoopEvent::TeardownComplete);
        assert_eq!(s, LoopState::Running);
    }

    #[test]
    fn quad_covers_clip_space() {
        for vertex in &QUAD_VERTICES {
            assert!(vertex.position.iter().all(|c| c.abs() == 1.0));
            assert!(vertex.uv.iter().all(|&c| c == 0.0 || c == 1.0));
        }
    }

    #[test]
    fn quad_indices_form_two_triangles() {
        assert_eq!(QUAD_INDICES.len(), 6);
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < QUAD_VERTICES.len()));
    }

    #[test]
    fn quad_vertex_layout_matches_attributes() {
        let attrs = QuadVertex::attribute_descriptions();
        assert_eq!(attrs[0].offset, 0);
        assert_eq!(attrs[1].offset, 8);
        assert_eq!(QuadVertex::binding_description().stride, 16);
    }
}
