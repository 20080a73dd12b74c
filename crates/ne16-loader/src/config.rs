//! Loader configuration (ne16.toml)
//!
//! Every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::arena::{MAX_CAPACITY, MIN_CAPACITY, PARAGRAPH};

/// Errors that can occur while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Settings for one address space
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoaderConfig {
    /// Arena size in bytes
    pub arena_capacity: usize,

    /// Leftover paragraphs that must be exceeded before a free block is split
    pub split_threshold: u32,

    /// Directories searched for module files, in order
    pub search_paths: Vec<PathBuf>,

    /// Extension appended to reference names that have none
    pub default_extension: String,

    /// Use the fast-load area when an image declares one
    pub fast_load: bool,

    /// Minimum stack size given to task (non-library) modules
    pub min_task_stack: u16,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            arena_capacity: 1 << 20,
            split_threshold: crate::arena::DEFAULT_SPLIT_THRESHOLD,
            search_paths: Vec::new(),
            default_extension: ".DLL".to_string(),
            fast_load: true,
            min_task_stack: 0x1400,
        }
    }
}

impl LoaderConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LoaderConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Check the configuration for values the loader cannot use
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena_capacity % PARAGRAPH != 0 {
            return Err(ConfigError::ValidationError(format!(
                "arena_capacity {} is not a multiple of {}",
                self.arena_capacity, PARAGRAPH
            )));
        }
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&self.arena_capacity) {
            return Err(ConfigError::ValidationError(format!(
                "arena_capacity must be between {} and {} bytes",
                MIN_CAPACITY, MAX_CAPACITY
            )));
        }
        if !self.default_extension.is_empty() && !self.default_extension.starts_with('.') {
            return Err(ConfigError::ValidationError(format!(
                "default_extension '{}' must start with '.'",
                self.default_extension
            )));
        }
        Ok(())
    }
}
