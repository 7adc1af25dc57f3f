//! Disk cache commands

use super::load_config;
use anyhow::{Context, Result};
use cinder_asset::{normalize_ref, DiskCache};
use cinder_core::ContentHash;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show the cache directory and its entries
    Info,

    /// Remove every cached asset
    Clear,

    /// Show the cached entry for a ref
    Get {
        /// Asset ref
        asset_ref: String,
    },
}

pub fn run(config_path: Option<&str>, cmd: CacheCommands) -> Result<()> {
    let config = load_config(config_path)?;
    let mut cache = DiskCache::new(config.cache_dir());
    if !config.cache.enabled {
        log::warn!("Asset cache is disabled in config");
    }

    match cmd {
        CacheCommands::Info => {
            let entries = cache.entries().context("Failed to list cache entries")?;
            println!("Cache: {}", cache.cache_directory().display());
            println!("  Entries: {}", entries.len());
            for entry in entries {
                println!("  {}", entry);
            }
        }
        CacheCommands::Clear => {
            cache.clear().context("Failed to clear cache")?;
            println!("Cleared {}", cache.cache_directory().display());
        }
        CacheCommands::Get { asset_ref } => {
            let asset_ref = normalize_ref(&asset_ref);
            let path = cache.disk_source_by_ref(&asset_ref);
            if !path.is_file() {
                println!("{}: not cached", asset_ref);
                return Ok(());
            }

            println!("{}", asset_ref);
            println!("  Path: {}", path.display());
            let hash = ContentHash::from_file(&path)?;
            println!("  Content: {}", hash.to_prefixed_hex());
            match cache.metadata(&asset_ref) {
                Some(metadata) => {
                    println!("  Valid: {}", metadata.valid);
                    if let Some(last_modified) = metadata.last_modified {
                        println!("  Last-Modified: {}", last_modified);
                    }
                    if let Some(digest) = metadata.digest {
                        println!("  Digest: {}", digest);
                    }
                }
                None => println!("  No valid metadata"),
            }
        }
    }
    Ok(())
}
