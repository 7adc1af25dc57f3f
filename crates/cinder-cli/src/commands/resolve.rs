//! Resolve a ref against the configured storages

use super::load_config;
use anyhow::{bail, Result};
use cinder_asset::AssetRegistry;

pub fn run(config_path: Option<&str>, asset_ref: &str, context: Option<&str>, storages: &[String]) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.watch.enabled = false;
    config.cache.enabled = false;

    let mut registry = AssetRegistry::from_config(&config)?;
    for descriptor in storages {
        if registry.add_storage_from_descriptor(descriptor)?.is_none() {
            bail!("No provider accepted storage \"{}\"", descriptor);
        }
    }

    let resolved = registry.resolve_asset_ref(context.unwrap_or(""), asset_ref);
    if resolved.is_empty() {
        bail!("Empty asset ref");
    }
    println!("{}", resolved);

    if let Some(provider) = registry
        .provider_for_ref(&resolved, "")
        .and_then(|id| registry.provider(id))
    {
        log::info!("Served by provider \"{}\"", provider.name());
    }
    Ok(())
}
