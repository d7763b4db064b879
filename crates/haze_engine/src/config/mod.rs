//! Engine configuration
//!
//! All tunables (window size, device selection, shader paths) live in one
//! struct constructed at startup and passed by reference into the device
//! and swapchain constructors. There is no process-wide mutable state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Window section of the engine configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WindowConfig {
    /// Initial window width in pixels
    pub width: u32,
    /// Initial window height in pixels
    pub height: u32,
    /// Window title
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            title: "Haze Viewer".to_string(),
        }
    }
}

/// Device selection section
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DeviceConfig {
    /// Keep scanning past integrated adapters for a discrete GPU instead
    /// of stopping at the first suitable match
    pub prefer_discrete_gpu: bool,
}

/// Shader binary paths (precompiled SPIR-V)
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ShaderConfig {
    /// Compute kernel transforming the input image into the output image
    pub compute: PathBuf,
    /// Fullscreen-quad vertex shader
    pub vertex: PathBuf,
    /// Sampling fragment shader
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            compute: PathBuf::from("shaders/transform.comp.spv"),
            vertex: PathBuf::from("shaders/quad.vert.spv"),
            fragment: PathBuf::from("shaders/quad.frag.spv"),
        }
    }
}

/// Top-level engine configuration
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Window settings
    pub window: WindowConfig,
    /// Device selection settings
    pub device: DeviceConfig,
    /// Shader binary paths
    pub shaders: ShaderConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = EngineConfig::default();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert!(!config.device.prefer_discrete_gpu);
    }

    #[test]
    fn toml_round_trip() {
        let mut config = EngineConfig::default();
        config.window.width = 1280;
        config.device.prefer_discrete_gpu = true;

        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.window.width, 1280);
        assert!(parsed.device.prefer_discrete_gpu);
        assert_eq!(parsed.shaders.compute, config.shaders.compute);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: EngineConfig = toml::from_str("[window]\nwidth = 1024\n").unwrap();
        assert_eq!(parsed.window.width, 1024);
        assert_eq!(parsed.window.height, 600);
    }
}
