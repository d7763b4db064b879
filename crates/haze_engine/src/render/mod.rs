//! Rendering system
//!
//! Low-level Vulkan wrappers live in [`vulkan`]; [`renderer`] sequences
//! them into the per-frame compute-then-present cycle.

/// Core Vulkan wrappers and primitives
pub mod vulkan;

/// Frame orchestration and engine root
pub mod renderer;

pub use renderer::{FrameContext, LoopState, Renderer};
