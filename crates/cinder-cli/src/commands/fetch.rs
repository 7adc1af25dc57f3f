//! Fetch assets through the registry

use super::load_config;
use anyhow::{bail, Result};
use cinder_asset::providers::mock::MockAssetProvider;
use cinder_asset::{AssetEvent, AssetRegistry, TransferId};
use std::collections::HashSet;
use std::time::{Duration, Instant};

const TICK_INTERVAL: Duration = Duration::from_millis(16);

pub struct FetchArgs {
    pub config: Option<String>,
    pub refs: Vec<String>,
    pub storages: Vec<String>,
    pub ticks: u32,
    pub watch: bool,
    pub mock: bool,
    pub force: bool,
}

pub fn run(args: FetchArgs) -> Result<()> {
    let mut registry = if args.mock {
        mock_registry(&args.refs)
    } else {
        let mut config = load_config(args.config.as_deref())?;
        if !args.watch {
            config.watch.enabled = false;
        }
        AssetRegistry::from_config(&config)?
    };

    for descriptor in &args.storages {
        if registry.add_storage_from_descriptor(descriptor)?.is_none() {
            bail!("No provider accepted storage \"{}\"", descriptor);
        }
    }

    let mut waiting: HashSet<TransferId> = HashSet::new();
    let mut requested = Vec::new();
    for asset_ref in &args.refs {
        match registry.request_asset(asset_ref, "", args.force) {
            Some(id) => {
                waiting.insert(id);
                requested.push(registry.resolve_asset_ref("", asset_ref));
            }
            None => log::error!("Could not request \"{}\"", asset_ref),
        }
    }

    let start = Instant::now();
    let mut failed = args.refs.len() - requested.len();
    let mut last_time = Instant::now();
    let mut tick = 0;
    while registry.is_busy() && tick < args.ticks {
        let now = Instant::now();
        registry.tick(now.duration_since(last_time).as_secs_f64());
        last_time = now;
        tick += 1;

        for event in registry.drain_events() {
            println!("{}", event);
            match event {
                AssetEvent::TransferSucceeded { transfer, .. } => {
                    waiting.remove(&transfer);
                }
                AssetEvent::TransferFailed { transfer, .. } => {
                    if waiting.remove(&transfer) {
                        failed += 1;
                    }
                }
                _ => {}
            }
        }
        if registry.is_busy() {
            std::thread::sleep(TICK_INTERVAL);
        }
    }

    if !waiting.is_empty() {
        log::warn!("{} transfer(s) still pending after {} ticks", waiting.len(), tick);
    }

    println!();
    for asset_ref in &requested {
        match registry.get_asset(asset_ref) {
            Some(asset) => {
                println!("{}", asset);
                if let Some(path) = asset.disk_source() {
                    println!("  Disk source: {}", path.display());
                }
                if let Some(hash) = asset.content_hash() {
                    println!("  Content: {}", hash.to_prefixed_hex());
                }
                let pending = registry.num_pending_dependencies(asset.name());
                if pending > 0 {
                    println!("  Pending dependencies: {}", pending);
                }
            }
            None => println!("{}: not loaded", asset_ref),
        }
    }
    println!("  Done in {:.1}s", start.elapsed().as_secs_f64());

    if failed > 0 && !args.watch {
        bail!("{} of {} asset(s) failed", failed, args.refs.len());
    }

    if args.watch {
        println!("Watching for changes (Ctrl+C to stop)...");
        loop {
            registry.tick(TICK_INTERVAL.as_secs_f64());
            for event in registry.drain_events() {
                println!("{}", event);
            }
            std::thread::sleep(TICK_INTERVAL);
        }
    }
    Ok(())
}

/// A registry whose only provider serves each ref's own name as its bytes
fn mock_registry(refs: &[String]) -> AssetRegistry {
    let mut registry = AssetRegistry::new();
    let mut provider = MockAssetProvider::new();
    provider.add_storage("Mock", true);
    provider.set_caching_allowed(false);
    let id = registry.register_provider(Box::new(provider));

    let resolved: Vec<String> = refs
        .iter()
        .map(|r| registry.resolve_asset_ref("", r))
        .collect();
    if let Some(provider) = id.and_then(|id| registry.provider_mut::<MockAssetProvider>(id)) {
        for asset_ref in resolved {
            provider.insert(&asset_ref, asset_ref.as_bytes().to_vec());
        }
    }
    registry
}
