//! Subcommand implementations.

use std::path::Path;

use anyhow::Context;
use ne16_loader::LoaderConfig;

pub mod arena;
pub mod dump;
pub mod info;
pub mod load;

/// Read the configuration file if one was given, else use defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<LoaderConfig> {
    match path {
        Some(path) => LoaderConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(LoaderConfig::default()),
    }
}
