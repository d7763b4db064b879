//! Vulkan backend
//!
//! RAII wrappers over the raw API. Every native handle is owned by exactly
//! one wrapper whose `Drop` releases it; structs that own several handles
//! declare their fields in the order destruction must happen.

/// Device, instance and queue management
pub mod context;
/// GLFW window and surface creation
pub mod window;
/// Command pools and one-shot command recording
pub mod commands;
/// Buffer allocation and host uploads
pub mod buffer;
/// Image allocation, pixel upload and the layout state machine
pub mod image;
/// Descriptor set layouts, pools and batched writes
pub mod descriptor;
/// Semaphores, fences and per-frame synchronization sets
pub mod sync;
/// Render pass construction
pub mod render_pass;
/// Framebuffers and depth buffers
pub mod framebuffer;
/// Swapchain ownership, acquisition, submission and presentation
pub mod swapchain;
/// Shader modules and pipeline construction
pub mod pipeline;

pub use buffer::Buffer;
pub use commands::CommandPool;
pub use context::{DeviceContext, LogicalDevice, PhysicalDeviceInfo, VulkanError, VulkanInstance, VulkanResult};
pub use descriptor::{DescriptorPool, DescriptorPoolBuilder, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter};
pub use framebuffer::{DepthBuffer, Framebuffer};
pub use image::{AllocatedImage, ImageLayoutState};
pub use pipeline::{ComputePipeline, GraphicsPipeline, ShaderModule};
pub use render_pass::RenderPass;
pub use swapchain::{Acquire, Present, Swapchain, MAX_FRAMES_IN_FLIGHT};
pub use sync::{Fence, FrameSync, Semaphore};
pub use window::{Window, WindowError};
