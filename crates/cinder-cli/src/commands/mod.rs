//! CLI command implementations

pub mod cache;
pub mod fetch;
pub mod parse;
pub mod resolve;
pub mod storage;

use anyhow::{Context, Result};
use cinder_asset::RegistryConfig;
use std::path::Path;

/// The `--config` file if given, otherwise the layered config
pub fn load_config(path: Option<&str>) -> Result<RegistryConfig> {
    match path {
        Some(path) => RegistryConfig::load_from_file(Path::new(path))
            .with_context(|| format!("Failed to load config {}", path)),
        None => RegistryConfig::load().context("Failed to load config"),
    }
}
