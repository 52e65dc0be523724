//! Engine and demo configuration
//!
//! TOML-backed settings with sensible defaults. Apps load a config file when
//! present and fall back to the defaults otherwise, so the demos run with no
//! arguments.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Core engine settings shared by every application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Application name passed to the Vulkan instance
    pub app_name: String,
    /// Initial window width in pixels
    pub window_width: u32,
    /// Initial window height in pixels
    pub window_height: u32,
    /// Prefer mailbox presentation when false, FIFO when true
    pub vsync_only: bool,
    /// Requested MSAA sample count; clamped to the device maximum
    pub msaa_samples: u32,
    /// Number of timestamp query slots; 0 disables the query pool
    pub timestamp_query_count: u32,
    /// Enable validation layers (debug builds only honor this)
    pub validation: bool,
    /// Directory holding compiled SPIR-V shader blobs
    pub shader_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "render_engine".to_string(),
            window_width: 800,
            window_height: 600,
            vsync_only: false,
            msaa_samples: 4,
            timestamp_query_count: 0,
            validation: cfg!(debug_assertions),
            shader_dir: "target/shaders".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load a config from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Load from a file if it exists, otherwise return defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(ConfigError::Io(_)) => Self::default(),
            Err(e) => {
                log::warn!("ignoring malformed config: {}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.window_width, 800);
        assert_eq!(config.window_height, 600);
        assert_eq!(config.timestamp_query_count, 0);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_fields() {
        let config: EngineConfig =
            toml::from_str("app_name = \"viewer\"\ntimestamp_query_count = 4\n").unwrap();
        assert_eq!(config.app_name, "viewer");
        assert_eq!(config.timestamp_query_count, 4);
        assert_eq!(config.window_width, 800);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(EngineConfig::from_file("/nonexistent/engine.toml").is_err());
        assert!(toml::from_str::<EngineConfig>("window_width = \"wide\"").is_err());
    }
}
