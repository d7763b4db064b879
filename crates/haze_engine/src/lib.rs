//! # Haze Engine
//!
//! A Vulkan engine that alternates a compute pass (image transform) with a
//! graphics pass presenting the original and transformed images side by side
//! in a resizable window.
//!
//! The engine owns device/queue selection, swapchain management, per-frame
//! synchronization between the compute and graphics queues, descriptor and
//! resource allocation, and the image-layout state machine that makes
//! GPU-written images safely readable from another pipeline stage. The
//! content of the compute kernel itself is external: the caller supplies a
//! precompiled SPIR-V binary and a raw RGBA pixel buffer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use haze_engine::{config::EngineConfig, render::Renderer, render::LoopState};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::default();
//!     let mut renderer = Renderer::new(&config)?;
//!     renderer.create_input_image(&[128u8; 64 * 64 * 4], 64, 64)?;
//!
//!     while renderer.loop_state() == LoopState::Running {
//!         renderer.handle_events();
//!         if let Some(frame) = renderer.begin_frame()? {
//!             renderer.dispatch_transform(&frame);
//!             renderer.draw_side_by_side(&frame)?;
//!             renderer.end_frame(frame)?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod render;

pub use config::{ConfigError, EngineConfig};
pub use render::{LoopState, Renderer};
pub use render::vulkan::{VulkanError, VulkanResult};
