//! The asset registry
//!
//! Owns every loaded asset, every in-flight transfer and upload, and the
//! dependency edges between assets. Providers, factories and the disk cache
//! are plugged in; all state changes happen on the thread that calls
//! [`AssetRegistry::tick`].
//!
//! A request never completes synchronously. Either a provider reports the
//! bytes from its `update()`, or the transfer sits on the ready-queue and is
//! completed by the next tick.

use crate::asset::{Asset, DiskSourceKind};
use crate::bundle::{AssetBundle, AssetBundleTypeFactory, BundleFactoryRegistry};
use crate::cache::DiskCache;
use crate::config::RegistryConfig;
use crate::dependency::DependencyGraph;
use crate::factory::{AssetTypeFactory, FactoryRegistry};
use crate::provider::{
    AssetProvider, CachedEntry, ProviderEvent, ProviderId, TransferRequest, UploadRequest,
};
use crate::providers;
use crate::refs::{clean_path, normalize_ref, parse_ref, AssetReference, RefKind};
use crate::storage::{AssetChange, AssetStorage, StorageDescriptor};
use crate::transfer::{
    AssetEvent, AssetTransfer, EventQueue, TransferId, TransferKind, UploadId, UploadTransfer,
};
use crate::watcher::DiskSourceWatcher;
use cinder_core::{CinderError, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Bundle whose entries are served as sub-assets
struct LoadedBundle {
    bundle: Box<dyn AssetBundle>,
    provider: Option<ProviderId>,
    storage: Option<String>,
}

/// Download queued while an upload to the same ref is running
#[derive(Debug, Clone)]
pub struct PendingDownloadRequest {
    pub asset_ref: String,
    pub asset_type: String,
    /// Transfer handed to the caller; it receives the real transfer's events
    pub placeholder: TransferId,
}

pub struct AssetRegistry {
    providers: Vec<Box<dyn AssetProvider>>,
    factories: FactoryRegistry,
    assets: HashMap<String, Asset>,
    /// Resolved references of each loaded asset, as of its last load
    asset_references: HashMap<String, Vec<AssetReference>>,
    transfers: HashMap<TransferId, AssetTransfer>,
    current_transfers: HashMap<String, TransferId>,
    /// Transfers whose asset loaded and that now wait for dependencies
    awaiting_dependencies: HashSet<TransferId>,
    ready_transfers: Vec<TransferId>,
    uploads: HashMap<UploadId, UploadTransfer>,
    current_uploads: HashMap<String, UploadId>,
    pending_downloads: HashMap<String, PendingDownloadRequest>,
    bundle_factories: BundleFactoryRegistry,
    bundles: HashMap<String, LoadedBundle>,
    /// Sub-asset transfers waiting for a bundle transfer, by bundle ref
    bundle_monitors: HashMap<String, Vec<TransferId>>,
    /// Sub-asset transfers whose bundle is loaded, served by the next tick
    ready_sub_transfers: Vec<(TransferId, String)>,
    dependencies: DependencyGraph,
    cache: Option<DiskCache>,
    watcher: Option<DiskSourceWatcher>,
    default_storage: Option<String>,
    events: EventQueue,
    next_transfer_id: u64,
    next_upload_id: u64,
    unique_name_counter: u64,
}

impl Default for AssetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetRegistry {
    /// An empty registry with the built-in factories, no providers, no cache
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            factories: FactoryRegistry::with_builtins(),
            assets: HashMap::new(),
            asset_references: HashMap::new(),
            transfers: HashMap::new(),
            current_transfers: HashMap::new(),
            awaiting_dependencies: HashSet::new(),
            ready_transfers: Vec::new(),
            uploads: HashMap::new(),
            current_uploads: HashMap::new(),
            pending_downloads: HashMap::new(),
            bundle_factories: BundleFactoryRegistry::with_builtins(),
            bundles: HashMap::new(),
            bundle_monitors: HashMap::new(),
            ready_sub_transfers: Vec::new(),
            dependencies: DependencyGraph::new(),
            cache: None,
            watcher: None,
            default_storage: None,
            events: EventQueue::new(),
            next_transfer_id: 1,
            next_upload_id: 1,
            unique_name_counter: 1,
        }
    }

    /// Build a registry with the local and HTTP providers, the disk cache,
    /// the file watcher and the configured storages
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        let mut registry = Self::new();

        if config.cache.enabled {
            let dir = config.cache_dir();
            log::debug!("Asset cache at {}", dir.display());
            registry.set_cache(Some(DiskCache::new(dir)));
        }

        if config.watch.enabled {
            match DiskSourceWatcher::new(config.debounce()) {
                Ok(watcher) => registry.watcher = Some(watcher),
                Err(e) => log::warn!("File watching disabled: {}", e),
            }
        }

        for name in providers::default_providers() {
            registry.register_provider(providers::create_provider(name, config)?);
        }

        for descriptor in &config.storages {
            if registry.add_storage_from_descriptor(descriptor)?.is_none() {
                log::warn!("No provider accepted storage \"{}\"", descriptor);
            }
        }

        Ok(registry)
    }

    // ---- Collaborators ----

    pub fn set_cache(&mut self, cache: Option<DiskCache>) {
        self.cache = cache;
    }

    pub fn cache(&self) -> Option<&DiskCache> {
        self.cache.as_ref()
    }

    pub fn cache_mut(&mut self) -> Option<&mut DiskCache> {
        self.cache.as_mut()
    }

    pub fn set_watcher(&mut self, watcher: Option<DiskSourceWatcher>) {
        self.watcher = watcher;
    }

    pub fn watcher(&self) -> Option<&DiskSourceWatcher> {
        self.watcher.as_ref()
    }

    /// Register a provider. A provider whose name is already taken is
    /// rejected with a warning.
    pub fn register_provider(&mut self, provider: Box<dyn AssetProvider>) -> Option<ProviderId> {
        if self
            .providers
            .iter()
            .any(|p| p.name().eq_ignore_ascii_case(provider.name()))
        {
            log::warn!(
                "Asset provider \"{}\" is already registered",
                provider.name()
            );
            return None;
        }
        log::debug!("Registered asset provider \"{}\"", provider.name());
        self.providers.push(provider);
        Some(ProviderId(self.providers.len() - 1))
    }

    pub fn provider(&self, id: ProviderId) -> Option<&dyn AssetProvider> {
        self.providers.get(id.0).map(|p| p.as_ref())
    }

    /// Typed mutable access to a registered provider
    pub fn provider_mut<T: AssetProvider + 'static>(&mut self, id: ProviderId) -> Option<&mut T> {
        self.providers
            .get_mut(id.0)
            .and_then(|p| p.as_any_mut().downcast_mut::<T>())
    }

    pub fn provider_by_name(&self, name: &str) -> Option<ProviderId> {
        self.providers
            .iter()
            .position(|p| p.name().eq_ignore_ascii_case(name))
            .map(ProviderId)
    }

    pub fn providers(&self) -> impl Iterator<Item = (ProviderId, &dyn AssetProvider)> {
        self.providers
            .iter()
            .enumerate()
            .map(|(i, p)| (ProviderId(i), p.as_ref()))
    }

    pub fn register_factory(&mut self, factory: Box<dyn AssetTypeFactory>) -> bool {
        self.factories.register(factory)
    }

    /// Blacklist a type: requests for it yield no transfer and no error
    pub fn register_disabled_type(&mut self, asset_type: &str, extensions: &[&str]) -> bool {
        self.factories.register_disabled(asset_type, extensions)
    }

    pub fn factories(&self) -> &FactoryRegistry {
        &self.factories
    }

    pub fn resource_type_from_ref(&self, asset_ref: &str) -> String {
        self.factories.type_for_ref(asset_ref)
    }

    pub fn register_bundle_factory(&mut self, factory: Box<dyn AssetBundleTypeFactory>) -> bool {
        self.bundle_factories.register(factory)
    }

    pub fn bundle_factories(&self) -> &BundleFactoryRegistry {
        &self.bundle_factories
    }

    // ---- Bundles ----

    /// Loaded bundle for `bundle_ref`
    pub fn bundle(&self, bundle_ref: &str) -> Option<&dyn AssetBundle> {
        let resolved = self.resolve_asset_ref("", bundle_ref);
        self.bundles.get(&resolved).map(|b| b.bundle.as_ref())
    }

    /// Refs of every loaded bundle, sorted
    pub fn bundle_refs(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self.bundles.keys().map(String::as_str).collect();
        refs.sort();
        refs
    }

    /// Unload a bundle. Sub-assets already loaded from it stay loaded.
    pub fn forget_bundle(&mut self, bundle_ref: &str) -> bool {
        let resolved = self.resolve_asset_ref("", bundle_ref);
        match self.bundles.remove(&resolved) {
            Some(mut loaded) => {
                loaded.bundle.unload();
                true
            }
            None => false,
        }
    }

    // ---- Storages ----

    /// Offer a descriptor to each provider in registration order. Returns
    /// the name of the created storage, or `None` if no provider took it.
    pub fn add_storage_from_descriptor(&mut self, descriptor: &str) -> Result<Option<String>> {
        let parsed = StorageDescriptor::parse(descriptor)?;
        let created = self.providers.iter_mut().find_map(|provider| {
            provider.try_create_storage(&parsed).inspect(|name| {
                log::info!("Added asset storage \"{}\" ({})", name, provider.name());
            })
        });
        let Some(name) = created else {
            return Ok(None);
        };
        self.events.push(AssetEvent::StorageAdded { name: name.clone() });
        if parsed.is_default() {
            self.set_default_storage(&name);
        }
        Ok(Some(name))
    }

    pub fn storages(&self) -> Vec<&dyn AssetStorage> {
        self.providers.iter().flat_map(|p| p.storages()).collect()
    }

    /// Storage by name, case-insensitively
    pub fn storage(&self, name: &str) -> Option<&dyn AssetStorage> {
        self.find_storage(name).map(|(_, s)| s)
    }

    fn find_storage(&self, name: &str) -> Option<(ProviderId, &dyn AssetStorage)> {
        let name = name.trim();
        self.providers.iter().enumerate().find_map(|(i, p)| {
            p.storages()
                .into_iter()
                .find(|s| s.name().eq_ignore_ascii_case(name))
                .map(|s| (ProviderId(i), s))
        })
    }

    /// Provider that serves the named storage
    pub fn storage_provider(&self, name: &str) -> Option<ProviderId> {
        self.find_storage(name).map(|(id, _)| id)
    }

    pub fn storage_for_ref(&self, asset_ref: &str) -> Option<&dyn AssetStorage> {
        self.providers
            .iter()
            .find_map(|p| p.storage_for_ref(asset_ref))
    }

    /// The default storage, or the first storage of the first provider
    pub fn default_storage(&self) -> Option<&dyn AssetStorage> {
        if let Some(name) = &self.default_storage {
            if let Some(storage) = self.storage(name) {
                return Some(storage);
            }
        }
        self.providers.iter().flat_map(|p| p.storages()).next()
    }

    pub fn set_default_storage(&mut self, name: &str) -> bool {
        match self.storage(name).map(|s| s.name().to_string()) {
            Some(actual) => {
                log::info!("Default asset storage set to \"{}\"", actual);
                self.default_storage = Some(actual);
                true
            }
            None => {
                log::warn!("Cannot set default storage: \"{}\" not found", name);
                false
            }
        }
    }

    pub fn remove_storage(&mut self, name: &str) -> bool {
        let Some((provider, storage)) = self.find_storage(name) else {
            return false;
        };
        let actual = storage.name().to_string();
        let removed = self
            .providers
            .get_mut(provider.0)
            .map(|p| p.remove_storage(&actual))
            .unwrap_or(false);
        if removed
            && self
                .default_storage
                .as_deref()
                .is_some_and(|d| d.eq_ignore_ascii_case(&actual))
        {
            self.default_storage = None;
        }
        removed
    }

    // ---- Resolution ----

    /// Turn `asset_ref` into the canonical name it is known by.
    ///
    /// Relative refs are joined against `context` when given, otherwise
    /// against the default storage.
    pub fn resolve_asset_ref(&self, context: &str, asset_ref: &str) -> String {
        let asset_ref = asset_ref.trim();
        if asset_ref.is_empty() {
            return String::new();
        }
        if self.assets.contains_key(asset_ref) {
            return asset_ref.to_string();
        }

        let parsed = parse_ref(asset_ref);
        match parsed.kind {
            RefKind::LocalPath | RefKind::LocalUrl | RefKind::ExternalUrl => parsed.full_ref,
            RefKind::NamedStorage => match self.storage(&parsed.storage) {
                Some(storage) => normalize_ref(&storage.full_asset_url(&parsed.path_filename_sub_asset)),
                None => parsed.full_ref,
            },
            RefKind::RelativePath => {
                let context = context.trim();
                if context.is_empty() {
                    return match self.default_storage() {
                        Some(storage) => normalize_ref(&storage.full_asset_url(&parsed.full_ref)),
                        None => parsed.full_ref,
                    };
                }

                let ctx = parse_ref(context);
                if ctx.kind == RefKind::RelativePath {
                    log::error!(
                        "Asset ref context \"{}\" is a relative path and cannot be used as a context for lookup for ref \"{}\"",
                        context,
                        parsed.full_ref
                    );
                    return parsed.full_ref;
                }

                if !ctx.sub_asset.is_empty() {
                    return match ctx.sub_asset.rfind('/') {
                        Some(idx) => format!(
                            "{}#{}{}",
                            ctx.full_ref_no_sub_asset,
                            &ctx.sub_asset[..=idx],
                            parsed.path_filename_sub_asset
                        ),
                        None => format!(
                            "{}#{}",
                            ctx.full_ref_no_sub_asset, parsed.path_filename_sub_asset
                        ),
                    };
                }

                let prefix = if !ctx.storage.is_empty() {
                    format!("{}:", ctx.storage)
                } else if !ctx.protocol.is_empty() {
                    format!("{}://", ctx.protocol.to_lowercase())
                } else {
                    String::new()
                };
                format!(
                    "{}{}",
                    prefix,
                    clean_path(&format!("{}{}", ctx.path, parsed.path_filename_sub_asset))
                )
            }
        }
    }

    /// Resolve a reference found inside `context`, then expand any named
    /// storage it lands on
    fn resolve_dependency_ref(&self, context: &str, asset_ref: &str) -> String {
        let joined = self.resolve_asset_ref(context, asset_ref);
        self.resolve_asset_ref("", &joined)
    }

    /// Pick the provider for a ref: the named storage's provider, the
    /// default storage's provider for relative refs, else the first
    /// provider that accepts the ref
    pub fn provider_for_ref(&self, asset_ref: &str, asset_type: &str) -> Option<ProviderId> {
        let asset_type = if asset_type.trim().is_empty() {
            self.factories.type_for_ref(asset_ref)
        } else {
            asset_type.trim().to_string()
        };

        let parsed = parse_ref(asset_ref);
        match parsed.kind {
            RefKind::NamedStorage => return self.storage_provider(&parsed.storage),
            RefKind::RelativePath => {
                if let Some(storage) = self.default_storage() {
                    let name = storage.name().to_string();
                    return self.storage_provider(&name);
                }
            }
            _ => {}
        }

        self.providers
            .iter()
            .position(|p| p.is_valid_ref(asset_ref, &asset_type))
            .map(ProviderId)
    }

    // ---- Assets ----

    /// Asset by exact name, falling back to the resolved form of `asset_ref`
    pub fn get_asset(&self, asset_ref: &str) -> Option<&Asset> {
        self.asset_name(asset_ref)
            .and_then(|name| self.assets.get(&name))
    }

    pub fn get_asset_mut(&mut self, asset_ref: &str) -> Option<&mut Asset> {
        let name = self.asset_name(asset_ref)?;
        self.assets.get_mut(&name)
    }

    fn asset_name(&self, asset_ref: &str) -> Option<String> {
        if self.assets.contains_key(asset_ref) {
            return Some(asset_ref.to_string());
        }
        let resolved = self.resolve_asset_ref("", asset_ref);
        self.assets.contains_key(&resolved).then_some(resolved)
    }

    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.assets.values()
    }

    pub fn assets_of_type(&self, asset_type: &str) -> Vec<&Asset> {
        let asset_type = asset_type.trim();
        self.assets
            .values()
            .filter(|a| a.asset_type().eq_ignore_ascii_case(asset_type))
            .collect()
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    /// Create an Empty asset of `asset_type` named `name`. Returns the
    /// name, or `None` if the type is disabled or has no factory.
    pub fn create_new_asset(&mut self, asset_type: &str, name: &str) -> Option<String> {
        self.create_asset_in(asset_type, name, None)
    }

    fn create_asset_in(&mut self, asset_type: &str, name: &str, storage: Option<&str>) -> Option<String> {
        let name = name.trim();
        if name.is_empty() {
            log::error!("Cannot create an asset of type \"{}\" with an empty name", asset_type);
            return None;
        }

        let content = match self.factories.create_content(asset_type, name) {
            Ok(Some(content)) => content,
            Ok(None) => return None,
            Err(e) => {
                log::error!("Cannot create asset \"{}\": {}", name, e);
                return None;
            }
        };
        let canonical_type = self
            .factories
            .get(asset_type)
            .map(|e| e.asset_type().to_string())
            .unwrap_or_else(|| asset_type.trim().to_string());

        let mut asset = Asset::new(name, canonical_type, content);
        let (provider, storage_name) = match storage.and_then(|s| self.find_storage(s)) {
            Some((id, s)) => (Some(id), Some(s.name().to_string())),
            None => (
                self.provider_for_ref(name, asset_type),
                self.storage_for_ref(name).map(|s| s.name().to_string()),
            ),
        };
        asset.set_provider(provider);
        asset.set_storage(storage_name);

        self.assets.insert(name.to_string(), asset);
        self.events.push(AssetEvent::AssetCreated {
            name: name.to_string(),
        });
        Some(name.to_string())
    }

    /// A fresh name no asset uses: `<type>_<prefix>_<n>` or `<type>_<n>`
    pub fn generate_unique_asset_name(&mut self, type_prefix: &str, name_prefix: &str) -> String {
        let type_prefix = match type_prefix.trim() {
            "" => "Asset",
            t => t,
        };
        let name_prefix = name_prefix.trim();
        loop {
            let n = self.unique_name_counter;
            self.unique_name_counter += 1;
            let candidate = if name_prefix.is_empty() {
                format!("{}_{}", type_prefix, n)
            } else {
                format!("{}_{}_{}", type_prefix, name_prefix, n)
            };
            if self.get_asset(&candidate).is_none() {
                return candidate;
            }
        }
    }

    // ---- Requests ----

    /// Request `asset_ref`, returning the transfer that will report its
    /// completion, or `None` if the request cannot be served.
    pub fn request_asset(&mut self, asset_ref: &str, asset_type: &str, force_transfer: bool) -> Option<TransferId> {
        let asset_ref = self.resolve_asset_ref("", asset_ref);
        if asset_ref.is_empty() {
            log::warn!("request_asset called with an empty asset ref");
            return None;
        }
        let requested_type = asset_type.trim().to_string();

        // One live transfer per ref
        if let Some(&id) = self.current_transfers.get(&asset_ref) {
            if let Some(transfer) = self.transfers.get(&id) {
                if force_transfer && transfer.is_virtual() {
                    log::error!(
                        "Cannot force transfer of \"{}\": a virtual transfer is already in progress",
                        asset_ref
                    );
                    return Some(id);
                }
                if !requested_type.is_empty()
                    && !transfer.asset_type().is_empty()
                    && !transfer.asset_type().eq_ignore_ascii_case(&requested_type)
                {
                    log::warn!(
                        "Asset \"{}\" requested as type \"{}\" but a transfer of type \"{}\" is in progress",
                        asset_ref,
                        requested_type,
                        transfer.asset_type()
                    );
                }
            }
            return Some(id);
        }

        let existing = self.assets.get(&asset_ref);
        let existing_name = existing.map(|a| a.name().to_string());
        let asset_type = match existing {
            Some(asset) => {
                if !requested_type.is_empty() && !asset.asset_type().eq_ignore_ascii_case(&requested_type) {
                    log::warn!(
                        "Asset \"{}\" requested as type \"{}\" but exists as \"{}\"",
                        asset_ref,
                        requested_type,
                        asset.asset_type()
                    );
                }
                asset.asset_type().to_string()
            }
            None => {
                let inferred = if requested_type.is_empty() {
                    self.factories.type_for_ref(&asset_ref)
                } else {
                    requested_type
                };
                if self.factories.is_disabled(&inferred) {
                    return None;
                }
                inferred
            }
        };

        // Already loaded: complete on the next tick without touching the bytes
        let resident = existing
            .filter(|a| a.is_loaded() && !force_transfer)
            .map(|asset| {
                let mut transfer = AssetTransfer::new(
                    TransferId(0),
                    AssetReference::with_type(asset_ref.clone(), asset_type.clone()),
                    TransferKind::Virtual,
                );
                transfer.asset = Some(asset.name().to_string());
                transfer.provider = asset.provider();
                transfer.storage = asset.storage().map(String::from);
                transfer.disk_source = asset.disk_source().map(Path::to_path_buf);
                transfer.disk_source_kind = asset.disk_source_kind();
                transfer.caching_allowed = false;
                transfer
            });
        if let Some(mut transfer) = resident {
            let id = self.next_transfer_id();
            transfer.id = id;
            self.transfers.insert(id, transfer);
            self.ready_transfers.push(id);
            return Some(id);
        }

        let parsed = parse_ref(&asset_ref);
        if !parsed.sub_asset.is_empty() {
            return self.request_sub_asset(asset_ref, parsed.full_ref_no_sub_asset, asset_type, existing_name);
        }

        // Downloads wait for an upload to the same ref
        if self.current_uploads.contains_key(&asset_ref) {
            if let Some(pending) = self.pending_downloads.get(&asset_ref) {
                return Some(pending.placeholder);
            }
            log::debug!("Delaying download of \"{}\" until its upload completes", asset_ref);
            let id = self.next_transfer_id();
            let mut placeholder = AssetTransfer::new(
                id,
                AssetReference::with_type(asset_ref.clone(), asset_type.clone()),
                TransferKind::Placeholder,
            );
            placeholder.asset = existing_name;
            self.transfers.insert(id, placeholder);
            self.pending_downloads.insert(
                asset_ref.clone(),
                PendingDownloadRequest {
                    asset_ref,
                    asset_type,
                    placeholder: id,
                },
            );
            return Some(id);
        }

        // Disk cache hit: providerless, no I/O beyond the cache read
        if !force_transfer {
            if let Some(path) = self.cache.as_ref().and_then(|c| c.get(&asset_ref)) {
                match std::fs::read(&path) {
                    Ok(data) => {
                        log::debug!("Serving \"{}\" from cache", asset_ref);
                        let id = self.next_transfer_id();
                        let mut transfer = AssetTransfer::new(
                            id,
                            AssetReference::with_type(asset_ref.clone(), asset_type),
                            TransferKind::Virtual,
                        );
                        transfer.raw_data = data;
                        transfer.asset = existing_name;
                        transfer.set_caching_behavior(false, Some(path));
                        transfer.disk_source_kind = DiskSourceKind::Cached;
                        transfer.storage = self.storage_for_ref(&asset_ref).map(|s| s.name().to_string());
                        self.transfers.insert(id, transfer);
                        self.current_transfers.insert(asset_ref, id);
                        self.ready_transfers.push(id);
                        return Some(id);
                    }
                    Err(e) => log::warn!("Failed to read cached \"{}\": {}", asset_ref, e),
                }
            }
        }

        let Some(provider) = self.provider_for_ref(&asset_ref, &asset_type) else {
            log::error!(
                "No provider found for asset \"{}\" of type \"{}\"",
                asset_ref,
                asset_type
            );
            return None;
        };

        let id = self.next_transfer_id();
        let cached = self.cache.as_ref().and_then(|cache| {
            let path = cache.disk_source_by_ref(&asset_ref);
            if !path.is_file() {
                return None;
            }
            cache
                .metadata(&asset_ref)
                .map(|metadata| CachedEntry { path, metadata })
        });
        let request = TransferRequest {
            transfer: id,
            asset_ref: asset_ref.clone(),
            asset_type: asset_type.clone(),
            cached,
        };
        let accepted = match self.providers.get_mut(provider.0) {
            Some(p) => p.request_asset(request),
            None => Err(CinderError::ProviderNotFound(asset_ref.clone())),
        };
        if let Err(e) = accepted {
            log::error!("Failed to request asset \"{}\": {}", asset_ref, e);
            return None;
        }

        let mut transfer = AssetTransfer::new(
            id,
            AssetReference::with_type(asset_ref.clone(), asset_type),
            TransferKind::Provider,
        );
        transfer.provider = Some(provider);
        transfer.asset = existing_name;
        self.transfers.insert(id, transfer);
        self.current_transfers.insert(asset_ref, id);
        Some(id)
    }

    /// Serve `asset_ref` from an entry of `bundle_ref`. Only the bundle
    /// itself is fetched from a provider.
    fn request_sub_asset(
        &mut self,
        asset_ref: String,
        bundle_ref: String,
        asset_type: String,
        existing_name: Option<String>,
    ) -> Option<TransferId> {
        let bundle_loaded = self.bundles.contains_key(&bundle_ref);
        if !bundle_loaded {
            let Some(bundle_type) = self
                .bundle_factories
                .for_ref(&bundle_ref)
                .map(|f| f.bundle_type().to_string())
            else {
                log::error!(
                    "No bundle type for \"{}\", cannot load sub asset \"{}\"",
                    bundle_ref,
                    asset_ref
                );
                return None;
            };
            let in_flight = self.current_transfers.contains_key(&bundle_ref)
                || self.bundle_monitors.contains_key(&bundle_ref);
            if !in_flight {
                log::debug!("Requesting bundle \"{}\" for \"{}\"", bundle_ref, asset_ref);
                self.request_asset(&bundle_ref, &bundle_type, false)?;
            }
        }

        let id = self.next_transfer_id();
        let mut transfer = AssetTransfer::new(
            id,
            AssetReference::with_type(asset_ref.clone(), asset_type),
            TransferKind::SubAsset,
        );
        transfer.asset = existing_name;
        self.transfers.insert(id, transfer);
        self.current_transfers.insert(asset_ref, id);
        if bundle_loaded {
            self.ready_sub_transfers.push((id, bundle_ref));
        } else {
            self.bundle_monitors.entry(bundle_ref).or_default().push(id);
        }
        Some(id)
    }

    pub fn request_reference(&mut self, reference: &AssetReference, force_transfer: bool) -> Option<TransferId> {
        self.request_asset(&reference.asset_ref, &reference.asset_type, force_transfer)
    }

    fn next_transfer_id(&mut self) -> TransferId {
        let id = TransferId(self.next_transfer_id);
        self.next_transfer_id += 1;
        id
    }

    pub fn transfer(&self, id: TransferId) -> Option<&AssetTransfer> {
        self.transfers.get(&id)
    }

    /// In-flight downloads, one per ref
    pub fn pending_transfers(&self) -> Vec<&AssetTransfer> {
        let mut transfers: Vec<&AssetTransfer> = self
            .current_transfers
            .values()
            .filter_map(|id| self.transfers.get(id))
            .collect();
        transfers.sort_by_key(|t| t.id);
        transfers
    }

    pub fn pending_transfer(&self, asset_ref: &str) -> Option<&AssetTransfer> {
        let resolved = self.resolve_asset_ref("", asset_ref);
        self.current_transfers
            .get(&resolved)
            .and_then(|id| self.transfers.get(id))
    }

    /// True while anything is queued, in flight, or uploading
    pub fn is_busy(&self) -> bool {
        !self.transfers.is_empty()
            || !self.uploads.is_empty()
            || !self.ready_transfers.is_empty()
            || !self.ready_sub_transfers.is_empty()
    }

    /// Abort the in-flight transfer for `asset_ref`
    pub fn abort_transfer(&mut self, asset_ref: &str) -> bool {
        let resolved = self.resolve_asset_ref("", asset_ref);
        let Some(&id) = self.current_transfers.get(&resolved) else {
            return false;
        };
        self.ready_transfers.retain(|t| *t != id);
        self.ready_sub_transfers.retain(|(t, _)| *t != id);
        if let Some(transfer) = self.transfers.get(&id) {
            if let (TransferKind::Provider, Some(provider)) = (transfer.kind, transfer.provider) {
                if let Some(p) = self.providers.get_mut(provider.0) {
                    p.abort_transfer(id);
                }
            }
        }
        self.asset_transfer_aborted(id);
        true
    }

    // ---- Events ----

    /// Take every event queued since the last drain
    pub fn drain_events(&mut self) -> Vec<AssetEvent> {
        self.events.drain()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Push `make(id)` for the transfer and for every placeholder it stands in for
    fn emit_for_transfer(&mut self, id: TransferId, make: impl Fn(TransferId) -> AssetEvent) {
        let forwarded = self
            .transfers
            .get(&id)
            .map(|t| t.forwarded_to.clone())
            .unwrap_or_default();
        self.events.push(make(id));
        for placeholder in forwarded {
            self.events.push(make(placeholder));
        }
    }

    /// Drop a finished transfer from every map that may hold it
    fn finish_transfer(&mut self, id: TransferId) {
        self.awaiting_dependencies.remove(&id);
        if let Some(transfer) = self.transfers.remove(&id) {
            if self.current_transfers.get(transfer.asset_ref()) == Some(&id) {
                self.current_transfers.remove(transfer.asset_ref());
            }
        }
    }

    // ---- Tick ----

    /// Let providers progress, complete ready transfers and sub-assets of
    /// loaded bundles, then poll the file watcher
    pub fn tick(&mut self, dt: f64) {
        for index in 0..self.providers.len() {
            let events = match self.providers.get_mut(index) {
                Some(provider) => provider.update(dt),
                None => break,
            };
            for event in events {
                self.handle_provider_event(ProviderId(index), event);
            }
        }

        let ready = std::mem::take(&mut self.ready_transfers);
        for id in ready {
            self.asset_transfer_completed(id);
        }

        let ready_subs = std::mem::take(&mut self.ready_sub_transfers);
        for (id, bundle_ref) in ready_subs {
            self.load_sub_asset(id, &bundle_ref);
        }

        let changed = self
            .watcher
            .as_mut()
            .map(|w| w.poll())
            .unwrap_or_default();
        for path in changed {
            self.on_disk_source_changed(&path);
        }
    }

    fn handle_provider_event(&mut self, provider: ProviderId, event: ProviderEvent) {
        match event {
            ProviderEvent::TransferCompleted(done) => {
                let Some(transfer) = self.transfers.get_mut(&done.transfer) else {
                    log::warn!(
                        "Provider {} completed unknown transfer {}",
                        provider,
                        done.transfer
                    );
                    return;
                };
                transfer.raw_data = done.data;
                transfer.caching_allowed = done.caching_allowed;
                transfer.disk_source = done.disk_source;
                transfer.disk_source_kind = done.disk_source_kind;
                if done.storage.is_some() {
                    transfer.storage = done.storage;
                }
                transfer.cache_metadata = done.cache_metadata;
                self.asset_transfer_completed(done.transfer);
            }
            ProviderEvent::TransferFailed { transfer, reason } => {
                self.asset_transfer_failed(transfer, &reason);
            }
            ProviderEvent::TransferAborted { transfer } => self.asset_transfer_aborted(transfer),
            ProviderEvent::UploadCompleted { upload } => self.asset_upload_completed(upload),
            ProviderEvent::UploadFailed { upload, reason } => self.asset_upload_failed(upload, &reason),
            ProviderEvent::StorageChanged {
                storage,
                local_name,
                disk_source,
                change,
            } => self.on_asset_changed(&storage, &local_name, disk_source, change),
            ProviderEvent::DeletedFromStorage { asset_ref } => {
                self.handle_asset_deleted(&asset_ref);
                self.events
                    .push(AssetEvent::AssetDeletedFromStorage { asset_ref });
            }
        }
    }

    // ---- Completion ----

    fn asset_transfer_completed(&mut self, id: TransferId) {
        let Some(transfer) = self.transfers.get(&id) else {
            log::warn!("Completion for unknown transfer {}", id);
            return;
        };
        let asset_ref = transfer.asset_ref().to_string();
        let asset_type = transfer.asset_type().to_string();

        if self.bundle_monitors.contains_key(&asset_ref) {
            self.bundle_transfer_completed(id, asset_ref);
            return;
        }

        if transfer.kind == TransferKind::Virtual {
            let loaded = transfer
                .asset
                .as_ref()
                .and_then(|name| self.assets.get(name))
                .is_some_and(|a| a.is_loaded());
            if loaded {
                self.emit_for_transfer(id, |t| AssetEvent::Downloaded {
                    transfer: t,
                    asset_ref: asset_ref.clone(),
                });
                self.emit_for_transfer(id, |t| AssetEvent::TransferSucceeded {
                    transfer: t,
                    asset_ref: asset_ref.clone(),
                });
                self.finish_transfer(id);
                return;
            }
        }

        if self.current_transfers.get(&asset_ref) != Some(&id) {
            log::warn!(
                "Transfer {} of \"{}\" completed but is not the current transfer for that ref",
                id,
                asset_ref
            );
        }

        let existing = transfer
            .asset
            .clone()
            .filter(|name| self.assets.contains_key(name))
            .or_else(|| self.assets.contains_key(&asset_ref).then(|| asset_ref.clone()));
        let name = match existing {
            Some(name) => name,
            None => match self.create_new_asset(&asset_type, &asset_ref) {
                Some(name) => name,
                None => {
                    let reason = format!(
                        "Failed to create new asset of type \"{}\" and name \"{}\"",
                        asset_type, asset_ref
                    );
                    self.asset_transfer_failed(id, &reason);
                    return;
                }
            },
        };

        let Some(transfer) = self.transfers.get_mut(&id) else {
            return;
        };
        transfer.asset = Some(name.clone());
        let data = std::mem::take(&mut transfer.raw_data);
        let caching_allowed = transfer.caching_allowed;
        let mut disk_source = transfer.disk_source.clone();
        let mut disk_source_kind = transfer.disk_source_kind;
        let storage = transfer.storage.clone();
        let provider = transfer.provider;
        let metadata = transfer.cache_metadata.clone();

        if caching_allowed && !data.is_empty() {
            if let Some(cache) = self.cache.as_mut() {
                let stored = match &metadata {
                    Some(metadata) => cache.store(&asset_ref, &data, metadata),
                    None => cache.put(&asset_ref, &data),
                };
                match stored {
                    Ok(path) => {
                        disk_source = Some(path);
                        disk_source_kind = DiskSourceKind::Cached;
                    }
                    Err(e) => log::warn!("Failed to cache \"{}\": {}", asset_ref, e),
                }
            }
        }
        if disk_source.is_none() && disk_source_kind != DiskSourceKind::Bundle {
            disk_source = self
                .cache
                .as_ref()
                .map(|c| c.disk_source_by_ref(&asset_ref))
                .filter(|p| p.is_file());
            disk_source_kind = DiskSourceKind::Cached;
        }

        if let Some(asset) = self.assets.get_mut(&name) {
            asset.set_disk_source(disk_source.clone());
            asset.set_disk_source_kind(disk_source_kind);
            if storage.is_some() {
                asset.set_storage(storage);
            }
            if provider.is_some() {
                asset.set_provider(provider);
            }
        }

        self.emit_for_transfer(id, |t| AssetEvent::Downloaded {
            transfer: t,
            asset_ref: asset_ref.clone(),
        });

        let Some(asset) = self.assets.get_mut(&name) else {
            return;
        };
        let loaded = if !data.is_empty() {
            asset.load_from_memory(&data)
        } else if let Some(path) = &disk_source {
            asset.load_from_file(path)
        } else {
            Err(CinderError::Deserialize(format!("No data for \"{}\"", name)))
        };

        match loaded {
            Ok(()) => {
                self.awaiting_dependencies.insert(id);
                self.asset_load_completed(&name);
            }
            Err(e) => self.asset_load_failed(&name, Some(id), &e),
        }
    }

    /// The bundle's bytes arrived: parse it, then serve every sub-asset
    /// transfer waiting on it
    fn bundle_transfer_completed(&mut self, id: TransferId, bundle_ref: String) {
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return;
        };
        let mut data = std::mem::take(&mut transfer.raw_data);
        let caching_allowed = transfer.caching_allowed;
        let mut disk_source = transfer.disk_source.clone();
        let bundle_type = transfer.asset_type().to_string();
        let provider = transfer.provider;
        let storage = transfer.storage.clone();
        let metadata = transfer.cache_metadata.clone();

        if caching_allowed && !data.is_empty() {
            if let Some(cache) = self.cache.as_mut() {
                let stored = match &metadata {
                    Some(metadata) => cache.store(&bundle_ref, &data, metadata),
                    None => cache.put(&bundle_ref, &data),
                };
                if let Err(e) = stored {
                    log::warn!("Failed to cache bundle \"{}\": {}", bundle_ref, e);
                }
            }
        }
        if data.is_empty() {
            if disk_source.is_none() {
                disk_source = self
                    .cache
                    .as_ref()
                    .map(|c| c.disk_source_by_ref(&bundle_ref))
                    .filter(|p| p.is_file());
            }
            if let Some(path) = &disk_source {
                match std::fs::read(path) {
                    Ok(bytes) => data = bytes,
                    Err(e) => log::warn!("Failed to read bundle \"{}\": {}", path.display(), e),
                }
            }
        }

        self.emit_for_transfer(id, |t| AssetEvent::Downloaded {
            transfer: t,
            asset_ref: bundle_ref.clone(),
        });

        let factory = self
            .bundle_factories
            .get(&bundle_type)
            .or_else(|| self.bundle_factories.for_ref(&bundle_ref));
        let Some(mut bundle) = factory.map(|f| f.create_bundle()) else {
            let reason = format!("No bundle type for \"{}\"", bundle_ref);
            self.asset_transfer_failed(id, &reason);
            return;
        };
        if let Err(e) = bundle.deserialize(&data) {
            let reason = format!("Failed to load bundle '{}': {}", bundle_ref, e);
            self.events.push(AssetEvent::AssetLoadFailed {
                name: bundle_ref.clone(),
                reason: reason.clone(),
            });
            self.asset_transfer_failed(id, &reason);
            return;
        }

        log::debug!(
            "Loaded bundle \"{}\" with {} entries",
            bundle_ref,
            bundle.sub_asset_names().len()
        );
        self.bundles.insert(
            bundle_ref.clone(),
            LoadedBundle {
                bundle,
                provider,
                storage,
            },
        );
        self.emit_for_transfer(id, |t| AssetEvent::TransferSucceeded {
            transfer: t,
            asset_ref: bundle_ref.clone(),
        });
        self.finish_transfer(id);

        let waiting = self.bundle_monitors.remove(&bundle_ref).unwrap_or_default();
        for sub in waiting {
            self.load_sub_asset(sub, &bundle_ref);
        }
    }

    /// Complete a sub-asset transfer from the entry of a loaded bundle
    fn load_sub_asset(&mut self, id: TransferId, bundle_ref: &str) {
        let Some(transfer) = self.transfers.get(&id) else {
            return;
        };
        let asset_ref = transfer.asset_ref().to_string();
        let entry = parse_ref(&asset_ref).sub_asset;

        let Some(loaded) = self.bundles.get(bundle_ref) else {
            let reason = format!(
                "Failed to load sub asset '{}': bundle '{}' is not loaded.",
                asset_ref, bundle_ref
            );
            self.asset_transfer_failed(id, &reason);
            return;
        };
        let data = loaded
            .bundle
            .sub_asset_data(&entry)
            .filter(|d| !d.is_empty())
            .map(<[u8]>::to_vec);
        let provider = loaded.provider;
        let storage = loaded.storage.clone();

        let Some(data) = data else {
            let reason = format!(
                "Failed to load sub asset '{}' from bundle '{}': Sub asset does not exist.",
                asset_ref, bundle_ref
            );
            self.asset_transfer_failed(id, &reason);
            return;
        };

        if let Some(transfer) = self.transfers.get_mut(&id) {
            transfer.raw_data = data;
            transfer.caching_allowed = false;
            transfer.disk_source = None;
            transfer.disk_source_kind = DiskSourceKind::Bundle;
            transfer.provider = provider;
            transfer.storage = storage;
        }
        self.asset_transfer_completed(id);
    }

    fn asset_load_failed(&mut self, name: &str, transfer: Option<TransferId>, error: &CinderError) {
        let asset_type = self
            .assets
            .get(name)
            .map(|a| a.asset_type().to_string())
            .unwrap_or_default();
        let reason = format!("Failed to load {} '{}' from asset data: {}", asset_type, name, error);
        log::error!("{}", reason);
        self.events.push(AssetEvent::AssetLoadFailed {
            name: name.to_string(),
            reason: reason.clone(),
        });
        if let Some(id) = transfer {
            self.asset_transfer_failed(id, &reason);
        }
    }

    fn asset_load_completed(&mut self, name: &str) {
        log::debug!("Loaded asset \"{}\"", name);
        self.watch_disk_source(name);
        self.request_asset_dependencies(name);
        self.try_finalize(name);
        self.notify_dependents(name);
    }

    /// Watch cached disk sources of live-update storages. Original files
    /// are watched by their own storage.
    fn watch_disk_source(&mut self, name: &str) {
        let Some(asset) = self.assets.get(name) else {
            return;
        };
        if asset.disk_source_kind() != DiskSourceKind::Cached {
            return;
        }
        let Some(path) = asset.disk_source().map(Path::to_path_buf) else {
            return;
        };
        let live = asset
            .storage()
            .and_then(|s| self.storage(s))
            .is_some_and(|s| s.live_update());
        if !live {
            return;
        }
        if let Some(watcher) = self.watcher.as_mut() {
            if let Err(e) = watcher.watch(&path) {
                log::warn!("{}", e);
            }
        }
    }

    fn request_asset_dependencies(&mut self, name: &str) {
        let Some(asset) = self.assets.get(name) else {
            return;
        };
        let references: Vec<AssetReference> = asset
            .references()
            .into_iter()
            .filter_map(|r| {
                let resolved = self.resolve_dependency_ref(name, &r.asset_ref);
                (!resolved.is_empty()).then(|| AssetReference::with_type(resolved, r.asset_type))
            })
            .collect();

        self.dependencies
            .set_dependencies(name, references.iter().map(|r| r.asset_ref.clone()));
        self.asset_references
            .insert(name.to_string(), references.clone());

        for reference in references {
            let asset_type = self.factories.type_for_reference(&reference);
            if self.factories.is_disabled(&asset_type) {
                continue;
            }
            let loaded = self
                .get_asset(&reference.asset_ref)
                .is_some_and(|a| a.is_loaded());
            if loaded {
                continue;
            }
            if self
                .request_asset(&reference.asset_ref, &reference.asset_type, false)
                .is_none()
            {
                let reason = format!("Failed to request dependency {}", reference.asset_ref);
                log::warn!("{} of \"{}\"", reason, name);
                if let Some(&id) = self.current_transfers.get(name) {
                    self.asset_transfer_failed(id, &reason);
                    return;
                }
            }
        }
    }

    /// Succeed the asset's transfer if it loaded and nothing below it is pending
    fn try_finalize(&mut self, name: &str) {
        let Some(&id) = self.current_transfers.get(name) else {
            return;
        };
        if !self.awaiting_dependencies.contains(&id) || self.has_pending_dependencies(name) {
            return;
        }
        self.asset_dependencies_completed(id);
    }

    fn notify_dependents(&mut self, name: &str) {
        let dependents: Vec<String> = self
            .dependencies
            .dependents_of(name)
            .into_iter()
            .map(String::from)
            .collect();
        for dependent in dependents {
            if self.assets.contains_key(&dependent) {
                self.try_finalize(&dependent);
            }
        }
    }

    fn asset_dependencies_completed(&mut self, id: TransferId) {
        let Some(transfer) = self.transfers.get(&id) else {
            return;
        };
        let asset_ref = transfer.asset_ref().to_string();
        let name = transfer.asset.clone().unwrap_or_else(|| asset_ref.clone());

        self.emit_for_transfer(id, |t| AssetEvent::TransferSucceeded {
            transfer: t,
            asset_ref: asset_ref.clone(),
        });
        self.finish_transfer(id);
        log::debug!("Transfer of \"{}\" succeeded", asset_ref);

        self.notify_dependents(&name);
    }

    /// Outstanding dependencies of `name`, counted through the whole
    /// dependency tree. Disabled types are skipped; missing, empty and
    /// unloaded dependencies count.
    pub fn num_pending_dependencies(&self, name: &str) -> usize {
        let mut visited = HashSet::new();
        visited.insert(name.to_string());
        self.count_pending_dependencies(name, &mut visited, false)
    }

    pub fn has_pending_dependencies(&self, name: &str) -> bool {
        let mut visited = HashSet::new();
        visited.insert(name.to_string());
        self.count_pending_dependencies(name, &mut visited, true) > 0
    }

    fn count_pending_dependencies(&self, name: &str, visited: &mut HashSet<String>, stop_at_first: bool) -> usize {
        let Some(references) = self.asset_references.get(name) else {
            return 0;
        };
        let mut count = 0;
        for reference in references {
            if stop_at_first && count > 0 {
                break;
            }
            let asset_type = self.factories.type_for_reference(reference);
            if self.factories.is_disabled(&asset_type) {
                continue;
            }
            match self.get_asset(&reference.asset_ref) {
                None => count += 1,
                Some(dependency) if dependency.is_empty() => count += 1,
                Some(dependency) => {
                    if !dependency.is_loaded() {
                        count += 1;
                    }
                    if visited.insert(dependency.name().to_string()) {
                        count += self.count_pending_dependencies(dependency.name(), visited, stop_at_first);
                    }
                }
            }
        }
        count
    }

    // ---- Failure ----

    fn asset_transfer_failed(&mut self, id: TransferId, reason: &str) {
        let mut visited = HashSet::new();
        self.fail_transfer(id, reason.to_string(), &mut visited, false);
    }

    fn asset_transfer_aborted(&mut self, id: TransferId) {
        let mut visited = HashSet::new();
        self.fail_transfer(id, "Transfer aborted.".to_string(), &mut visited, true);
    }

    /// Fail `id` and every in-flight transfer that depends on it.
    /// `visited` holds refs already failed in this walk.
    fn fail_transfer(&mut self, id: TransferId, reason: String, visited: &mut HashSet<String>, aborted: bool) {
        let Some(transfer) = self.transfers.get(&id) else {
            return;
        };
        let asset_ref = transfer.asset_ref().to_string();
        if !visited.insert(asset_ref.clone()) {
            return;
        }

        if !aborted {
            log::error!(
                "Transfer of asset \"{}\", type \"{}\" failed! Reason: \"{}\"",
                asset_ref,
                transfer.asset_type(),
                reason
            );
        }

        self.emit_for_transfer(id, |t| AssetEvent::TransferFailed {
            transfer: t,
            asset_ref: asset_ref.clone(),
            reason: reason.clone(),
        });
        self.finish_transfer(id);

        // A download queued behind an upload to this ref fails along with it
        if let Some(pending) = self.pending_downloads.remove(&asset_ref) {
            if pending.placeholder != id {
                self.events.push(AssetEvent::TransferFailed {
                    transfer: pending.placeholder,
                    asset_ref: asset_ref.clone(),
                    reason: reason.clone(),
                });
                self.transfers.remove(&pending.placeholder);
            }
        }

        // Sub-assets waiting on this bundle fail with it
        if let Some(waiting) = self.bundle_monitors.remove(&asset_ref) {
            for sub in waiting {
                let wrapped = if aborted {
                    reason.clone()
                } else {
                    format!(
                        "Transfer of bundle {} failed due to reason: \"{}\"",
                        asset_ref, reason
                    )
                };
                self.fail_transfer(sub, wrapped, visited, aborted);
            }
        }

        let dependents: Vec<String> = self
            .dependencies
            .dependents_of(&asset_ref)
            .into_iter()
            .filter(|d| self.assets.contains_key(*d))
            .map(String::from)
            .collect();
        for dependent in dependents {
            let Some(&dependent_id) = self.current_transfers.get(&dependent) else {
                continue;
            };
            let wrapped = if aborted {
                reason.clone()
            } else {
                format!(
                    "Transfer of dependency {} failed due to reason: \"{}\"",
                    asset_ref, reason
                )
            };
            self.fail_transfer(dependent_id, wrapped, visited, aborted);
        }
    }

    // ---- Uploads ----

    /// Upload `data` into `storage` as `asset_name`. Arguments are checked
    /// before anything is queued.
    pub fn upload_asset_from_memory(&mut self, data: &[u8], storage: &str, asset_name: &str) -> Result<UploadId> {
        if data.is_empty() {
            return Err(CinderError::Upload("No data to upload".to_string()));
        }
        let asset_name = asset_name.trim();
        if asset_name.is_empty() {
            return Err(CinderError::Upload("Destination name is empty".to_string()));
        }
        let (provider, storage) = self
            .find_storage(storage)
            .ok_or_else(|| CinderError::Storage(format!("Asset storage \"{}\" not found", storage)))?;
        if !storage.writable() {
            return Err(CinderError::Upload(format!(
                "Asset storage \"{}\" is read-only",
                storage.name()
            )));
        }
        let storage_name = storage.name().to_string();
        let asset_ref = normalize_ref(&storage.full_asset_url(asset_name));

        let id = UploadId(self.next_upload_id);
        let request = UploadRequest {
            upload: id,
            storage: storage_name.clone(),
            asset_name: asset_name.to_string(),
            data: data.to_vec(),
        };
        self.providers
            .get_mut(provider.0)
            .ok_or_else(|| CinderError::ProviderNotFound(asset_ref.clone()))?
            .upload_asset(request)?;
        self.next_upload_id += 1;

        log::info!("Uploading {} bytes to \"{}\"", data.len(), asset_ref);
        self.uploads.insert(
            id,
            UploadTransfer {
                id,
                provider,
                destination_storage: storage_name,
                destination_name: asset_name.to_string(),
                asset_ref: asset_ref.clone(),
            },
        );
        self.current_uploads.insert(asset_ref, id);
        Ok(id)
    }

    /// Upload a file. The destination name defaults to the file name.
    pub fn upload_asset_from_file(&mut self, path: &Path, storage: &str, asset_name: Option<&str>) -> Result<UploadId> {
        if !path.is_file() {
            return Err(CinderError::Upload(format!(
                "File location not valid for upload: {}",
                path.display()
            )));
        }
        let name = match asset_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| CinderError::Upload(format!("No file name in {}", path.display())))?,
        };
        let data = std::fs::read(path)?;
        self.upload_asset_from_memory(&data, storage, &name)
    }

    pub fn upload(&self, id: UploadId) -> Option<&UploadTransfer> {
        self.uploads.get(&id)
    }

    pub fn pending_download_request(&self, asset_ref: &str) -> Option<&PendingDownloadRequest> {
        self.pending_downloads.get(&self.resolve_asset_ref("", asset_ref))
    }

    fn asset_upload_completed(&mut self, id: UploadId) {
        let Some(upload) = self.uploads.remove(&id) else {
            log::warn!("Completion for unknown upload {}", id);
            return;
        };
        let asset_ref = upload.asset_ref;

        // The cached copy predates the upload
        if let Some(cache) = self.cache.as_mut() {
            cache.delete(&asset_ref);
        }
        if let Some(asset) = self.assets.get_mut(&asset_ref) {
            asset.unload();
        }

        log::info!("Upload of \"{}\" completed", asset_ref);
        self.events.push(AssetEvent::AssetUploaded {
            upload: id,
            asset_ref: asset_ref.clone(),
        });
        if self.current_uploads.get(&asset_ref) == Some(&id) {
            self.current_uploads.remove(&asset_ref);
        }

        self.dispatch_pending_download(&asset_ref);
    }

    fn asset_upload_failed(&mut self, id: UploadId, reason: &str) {
        let Some(upload) = self.uploads.remove(&id) else {
            log::warn!("Failure for unknown upload {}", id);
            return;
        };
        log::error!("Upload of \"{}\" failed: {}", upload.asset_ref, reason);
        self.events.push(AssetEvent::UploadFailed {
            upload: id,
            asset_ref: upload.asset_ref.clone(),
            reason: reason.to_string(),
        });
        if self.current_uploads.get(&upload.asset_ref) == Some(&id) {
            self.current_uploads.remove(&upload.asset_ref);
        }
        self.dispatch_pending_download(&upload.asset_ref);
    }

    /// Send a download that waited on an upload, rewiring its events onto
    /// the placeholder the caller holds
    fn dispatch_pending_download(&mut self, asset_ref: &str) {
        let Some(pending) = self.pending_downloads.remove(asset_ref) else {
            return;
        };
        self.transfers.remove(&pending.placeholder);

        match self.request_asset(&pending.asset_ref, &pending.asset_type, false) {
            Some(id) => {
                if let Some(transfer) = self.transfers.get_mut(&id) {
                    transfer.forwarded_to.push(pending.placeholder);
                }
            }
            None => self.events.push(AssetEvent::TransferFailed {
                transfer: pending.placeholder,
                asset_ref: pending.asset_ref.clone(),
                reason: format!("Failed to request \"{}\" after upload", pending.asset_ref),
            }),
        }
    }

    // ---- Forget / delete ----

    /// Remove an asset from the registry. With `remove_disk_source` its
    /// cache entry is deleted too. In-flight transfers are left alone.
    pub fn forget_asset(&mut self, asset_ref: &str, remove_disk_source: bool) -> bool {
        let Some(name) = self.asset_name(asset_ref) else {
            return false;
        };
        self.events.push(AssetEvent::AssetAboutToBeRemoved { name: name.clone() });

        let disk_source = self
            .assets
            .get(&name)
            .and_then(|a| a.disk_source().map(Path::to_path_buf));
        if let Some(path) = &disk_source {
            if let Some(watcher) = self.watcher.as_mut() {
                watcher.unwatch(path);
            }
        }
        if remove_disk_source {
            if let Some(cache) = self.cache.as_mut() {
                cache.delete(&name);
            }
        }

        if let Some(mut asset) = self.assets.remove(&name) {
            if remove_disk_source {
                asset.set_disk_source(None);
            }
            asset.unload();
        }
        self.asset_references.remove(&name);
        self.dependencies.remove_dependent(&name);
        true
    }

    /// Forget the asset and ask its provider to delete the stored copy
    pub fn delete_asset_from_storage(&mut self, asset_ref: &str) -> bool {
        let resolved = self
            .asset_name(asset_ref)
            .unwrap_or_else(|| self.resolve_asset_ref("", asset_ref));
        let provider = self
            .assets
            .get(&resolved)
            .and_then(|a| a.provider())
            .or_else(|| self.provider_for_ref(&resolved, ""));

        self.forget_asset(&resolved, true);

        let Some(provider) = provider else {
            log::error!(
                "Could not determine the provider of \"{}\"; it was only removed locally",
                resolved
            );
            return false;
        };
        let result = match self.providers.get_mut(provider.0) {
            Some(p) => p.delete_asset_from_storage(&resolved),
            None => Err(CinderError::ProviderNotFound(resolved.clone())),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to delete \"{}\" from storage: {}", resolved, e);
                false
            }
        }
    }

    /// Forget every asset and abort every transfer
    pub fn forget_all_assets(&mut self) {
        self.ready_transfers.clear();
        self.ready_sub_transfers.clear();

        let names: Vec<String> = self.assets.keys().cloned().collect();
        for name in names {
            self.forget_asset(&name, false);
        }

        let mut in_flight: Vec<TransferId> = self.current_transfers.values().copied().collect();
        in_flight.sort();
        for id in in_flight {
            if let Some((TransferKind::Provider, Some(provider))) =
                self.transfers.get(&id).map(|t| (t.kind, t.provider))
            {
                if let Some(p) = self.providers.get_mut(provider.0) {
                    p.abort_transfer(id);
                }
            }
            self.asset_transfer_aborted(id);
        }

        self.transfers.clear();
        self.current_transfers.clear();
        self.awaiting_dependencies.clear();
        self.bundle_monitors.clear();
        for (_, mut loaded) in self.bundles.drain() {
            loaded.bundle.unload();
        }
    }

    /// Drop everything, including providers and factories. Only the
    /// `Binary` factory remains registered; no bundle type does.
    pub fn reset(&mut self) {
        self.forget_all_assets();
        self.providers.clear();
        self.factories = FactoryRegistry::new();
        self.bundle_factories = BundleFactoryRegistry::new();
        self.default_storage = None;
        self.dependencies.clear();
        self.asset_references.clear();
        self.uploads.clear();
        self.current_uploads.clear();
        self.pending_downloads.clear();
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.clear();
        }
        self.watcher = None;
    }

    pub fn dependencies(&self) -> &DependencyGraph {
        &self.dependencies
    }

    // ---- Discovery and change notifications ----

    /// A storage reports `asset_ref` exists. Unknown refs get an Empty
    /// asset; loaded ones are refetched.
    pub fn handle_asset_discovery(&mut self, asset_ref: &str, asset_type: &str) {
        let resolved = self.resolve_asset_ref("", asset_ref);
        if resolved.is_empty() {
            return;
        }
        let asset_type = if asset_type.trim().is_empty() {
            self.factories.type_for_ref(&resolved)
        } else {
            asset_type.trim().to_string()
        };
        if self.factories.is_disabled(&asset_type) {
            return;
        }

        match self.get_asset(&resolved).map(|a| a.is_loaded()) {
            None => {
                self.create_new_asset(&asset_type, &resolved);
            }
            Some(true) => {
                self.request_asset(&resolved, &asset_type, true);
            }
            Some(false) => {}
        }
    }

    /// A storage reports `asset_ref` is gone. Unloaded assets are forgotten.
    pub fn handle_asset_deleted(&mut self, asset_ref: &str) {
        let Some(name) = self.asset_name(asset_ref) else {
            return;
        };
        let loaded = self.assets.get(&name).is_some_and(|a| a.is_loaded());
        if !loaded {
            self.forget_asset(&name, false);
        }
    }

    /// A file inside a watched storage was created, modified or deleted
    pub fn on_asset_changed(
        &mut self,
        storage: &str,
        local_name: &str,
        disk_source: Option<PathBuf>,
        change: AssetChange,
    ) {
        let Some(storage_ref) = self.storage(storage) else {
            log::warn!("Change notification from unknown storage \"{}\"", storage);
            return;
        };
        let storage_name = storage_ref.name().to_string();
        let asset_ref = normalize_ref(&storage_ref.full_asset_url(local_name));
        let asset_type = self.factories.type_for_ref(&asset_ref);
        let exists = self.assets.contains_key(&asset_ref);

        let change = match change {
            AssetChange::Create if exists => {
                log::debug!("\"{}\" created but already known, treating as modified", asset_ref);
                AssetChange::Modify
            }
            other => other,
        };

        match change {
            AssetChange::Create => {
                if self.factories.is_disabled(&asset_type) {
                    return;
                }
                if let Some(name) = self.create_asset_in(&asset_type, &asset_ref, Some(&storage_name)) {
                    if let Some(asset) = self.assets.get_mut(&name) {
                        asset.set_disk_source(disk_source);
                        asset.set_disk_source_kind(DiskSourceKind::Original);
                    }
                }
            }
            AssetChange::Modify => {
                let loaded = self.assets.get(&asset_ref).map(|a| a.is_loaded());
                match loaded {
                    Some(true) => {
                        log::info!("\"{}\" changed in storage, reloading", asset_ref);
                        self.request_asset(&asset_ref, &asset_type, true);
                    }
                    Some(false) => log::debug!("\"{}\" changed but is not loaded", asset_ref),
                    None => log::warn!("Modify notification for unknown asset \"{}\"", asset_ref),
                }
            }
            AssetChange::Delete => {
                let loaded = self.assets.get(&asset_ref).map(|a| a.is_loaded());
                match loaded {
                    Some(true) => {
                        if let Some(asset) = self.assets.get_mut(&asset_ref) {
                            asset.set_disk_source(None);
                        }
                    }
                    Some(false) => {
                        self.forget_asset(&asset_ref, false);
                    }
                    None => log::warn!("Delete notification for unknown asset \"{}\"", asset_ref),
                }
            }
        }
    }

    /// A watched disk source changed: reload loaded assets backed by it
    /// whose storage has live update
    pub fn on_disk_source_changed(&mut self, path: &Path) {
        let names: Vec<String> = self
            .assets
            .values()
            .filter(|a| a.is_loaded() && a.disk_source() == Some(path))
            .filter(|a| {
                a.storage()
                    .and_then(|s| self.storage(s))
                    .is_some_and(|s| s.live_update())
            })
            .map(|a| a.name().to_string())
            .collect();

        for name in names {
            self.events
                .push(AssetEvent::AssetDiskSourceChanged { name: name.clone() });
            let reloaded = match self.assets.get_mut(&name) {
                Some(asset) => asset.reload_from_disk_source(),
                None => continue,
            };
            match reloaded {
                Ok(()) => {
                    log::info!("Reloaded \"{}\" from {}", name, path.display());
                    self.asset_load_completed(&name);
                }
                Err(e) => self.asset_load_failed(&name, None, &e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::zip_bytes;
    use crate::factory::BinaryAsset;
    use crate::providers::local::LocalAssetProvider;
    use crate::providers::mock::MockAssetProvider;
    use std::fs;

    fn mock_registry() -> (AssetRegistry, ProviderId) {
        let mut registry = AssetRegistry::new();
        let mut provider = MockAssetProvider::new();
        provider.add_storage("Store", true);
        let id = registry.register_provider(Box::new(provider)).unwrap();
        (registry, id)
    }

    fn mock(registry: &mut AssetRegistry, id: ProviderId) -> &mut MockAssetProvider {
        registry.provider_mut::<MockAssetProvider>(id).unwrap()
    }

    fn temp_cache() -> (DiskCache, PathBuf) {
        let dir = std::env::temp_dir().join(format!("cinder_registry_test_{}", uuid::Uuid::new_v4()));
        (DiskCache::new(&dir), dir)
    }

    fn succeeded(events: &[AssetEvent], transfer: TransferId) -> bool {
        events
            .iter()
            .any(|e| matches!(e, AssetEvent::TransferSucceeded { transfer: t, .. } if *t == transfer))
    }

    fn failure_reason(events: &[AssetEvent], transfer: TransferId) -> Option<String> {
        events.iter().find_map(|e| match e {
            AssetEvent::TransferFailed { transfer: t, reason, .. } if *t == transfer => Some(reason.clone()),
            _ => None,
        })
    }

    fn binary_data(registry: &AssetRegistry, asset_ref: &str) -> Vec<u8> {
        registry
            .get_asset(asset_ref)
            .and_then(|a| a.content_as::<BinaryAsset>())
            .map(|b| b.data.clone())
            .unwrap_or_default()
    }

    #[test]
    fn test_request_is_deduplicated() {
        let (mut registry, id) = mock_registry();
        mock(&mut registry, id).insert("mock://store/a.bin", b"hello".to_vec());

        let first = registry.request_asset("mock://store/a.bin", "", false).unwrap();
        let second = registry.request_asset("MOCK://store/a.bin", "", false).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.pending_transfers().len(), 1);
        assert_eq!(mock(&mut registry, id).request_count("mock://store/a.bin"), 1);

        registry.tick(0.0);
        let events = registry.drain_events();
        assert!(succeeded(&events, first));
        assert!(registry.get_asset("mock://store/a.bin").unwrap().is_loaded());
        assert_eq!(binary_data(&registry, "mock://store/a.bin"), b"hello");
        assert!(registry.pending_transfers().is_empty());
    }

    #[test]
    fn test_loaded_asset_completes_next_tick_without_io() {
        let (mut registry, id) = mock_registry();
        mock(&mut registry, id).insert("mock://store/a.bin", b"hello".to_vec());
        registry.request_asset("mock://store/a.bin", "", false).unwrap();
        registry.tick(0.0);
        registry.drain_events();

        let again = registry.request_asset("mock://store/a.bin", "", false).unwrap();
        assert!(registry.transfer(again).unwrap().is_virtual());
        assert!(!registry.has_events());

        registry.tick(0.0);
        let events = registry.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, AssetEvent::Downloaded { transfer, .. } if *transfer == again)));
        assert!(succeeded(&events, again));
        assert_eq!(mock(&mut registry, id).request_count("mock://store/a.bin"), 1);
    }

    #[test]
    fn test_dependency_chain_succeeds_bottom_up() {
        let (mut registry, id) = mock_registry();
        {
            let provider = mock(&mut registry, id);
            provider.insert("mock://store/a.manifest", b"b.manifest\n".to_vec());
            provider.insert("mock://store/b.manifest", b"c.bin\n".to_vec());
            provider.insert("mock://store/c.bin", b"leaf".to_vec());
        }

        let a = registry.request_asset("mock://store/a.manifest", "", false).unwrap();
        registry.tick(0.0);
        assert!(!succeeded(&registry.drain_events(), a));
        assert_eq!(registry.num_pending_dependencies("mock://store/a.manifest"), 1);
        assert_eq!(
            registry.dependencies().dependencies_of("mock://store/a.manifest"),
            vec!["mock://store/b.manifest"]
        );

        registry.tick(0.0);
        assert!(!succeeded(&registry.drain_events(), a));
        assert!(registry.has_pending_dependencies("mock://store/a.manifest"));

        registry.tick(0.0);
        let events = registry.drain_events();
        let order: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AssetEvent::TransferSucceeded { asset_ref, .. } => Some(asset_ref.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            order,
            vec!["mock://store/c.bin", "mock://store/b.manifest", "mock://store/a.manifest"]
        );
        assert_eq!(registry.num_pending_dependencies("mock://store/a.manifest"), 0);
    }

    #[test]
    fn test_dependency_failure_propagates() {
        let (mut registry, id) = mock_registry();
        {
            let provider = mock(&mut registry, id);
            provider.insert("mock://store/a.manifest", b"b.manifest\n".to_vec());
            provider.insert("mock://store/b.manifest", b"c.bin\n".to_vec());
            provider.insert("mock://store/c.bin", b"leaf".to_vec());
            provider.fail_next("mock://store/c.bin", "disk on fire");
        }

        let a = registry.request_asset("mock://store/a.manifest", "", false).unwrap();
        for _ in 0..3 {
            registry.tick(0.0);
        }
        let events = registry.drain_events();
        let reason = failure_reason(&events, a).unwrap();
        assert!(reason.contains("Transfer of dependency mock://store/b.manifest failed"));
        assert!(!succeeded(&events, a));

        let failed: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AssetEvent::TransferFailed { asset_ref, .. } => Some(asset_ref.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            failed,
            vec![
                "mock://store/c.bin",
                "mock://store/b.manifest",
                "mock://store/a.manifest"
            ]
        );
        assert!(registry.pending_transfers().is_empty());
    }

    #[test]
    fn test_dependency_cycle_terminates() {
        let (mut registry, id) = mock_registry();
        {
            let provider = mock(&mut registry, id);
            provider.insert("mock://store/a.manifest", b"b.manifest\n".to_vec());
            provider.insert("mock://store/b.manifest", b"a.manifest\n".to_vec());
        }

        let a = registry.request_asset("mock://store/a.manifest", "", false).unwrap();
        registry.tick(0.0);
        registry.tick(0.0);
        let events = registry.drain_events();
        assert!(succeeded(&events, a));
        assert_eq!(registry.num_pending_dependencies("mock://store/a.manifest"), 0);
        assert_eq!(registry.num_pending_dependencies("mock://store/b.manifest"), 0);
    }

    #[test]
    fn test_unresolvable_dependency_fails_dependent() {
        let (mut registry, id) = mock_registry();
        mock(&mut registry, id).insert("mock://store/a.manifest", b"nowhere://x.bin\n".to_vec());

        let a = registry.request_asset("mock://store/a.manifest", "", false).unwrap();
        registry.tick(0.0);
        let events = registry.drain_events();
        assert!(failure_reason(&events, a).unwrap().contains("nowhere://x.bin"));
    }

    #[test]
    fn test_load_failure_fails_transfer() {
        let (mut registry, id) = mock_registry();
        mock(&mut registry, id).insert("mock://store/bad.manifest", vec![0xff, 0xfe, 0x00]);

        let t = registry.request_asset("mock://store/bad.manifest", "", false).unwrap();
        registry.tick(0.0);
        let events = registry.drain_events();
        let reason = failure_reason(&events, t).unwrap();
        assert!(reason.starts_with("Failed to load Manifest 'mock://store/bad.manifest' from asset data: "));
        assert!(reason.contains("UTF-8"));
        assert!(events.contains(&AssetEvent::AssetLoadFailed {
            name: "mock://store/bad.manifest".to_string(),
            reason,
        }));
        let asset = registry.get_asset("mock://store/bad.manifest").unwrap();
        assert!(!asset.is_loaded());
        assert!(asset.last_error().unwrap().contains("UTF-8"));
    }

    #[test]
    fn test_disabled_type_is_skipped() {
        let (mut registry, id) = mock_registry();
        registry.register_disabled_type("Audio", &[".ogg"]);
        {
            let provider = mock(&mut registry, id);
            provider.insert("mock://store/a.manifest", b"music.ogg\n".to_vec());
            provider.insert("mock://store/music.ogg", b"ogg".to_vec());
        }

        assert!(registry.request_asset("mock://store/music.ogg", "", false).is_none());

        let a = registry.request_asset("mock://store/a.manifest", "", false).unwrap();
        registry.tick(0.0);
        assert!(succeeded(&registry.drain_events(), a));
        assert_eq!(mock(&mut registry, id).request_count("mock://store/music.ogg"), 0);
        assert!(registry.get_asset("mock://store/music.ogg").is_none());
    }

    #[test]
    fn test_cache_hit_skips_provider() {
        let (mut registry, id) = mock_registry();
        let (cache, dir) = temp_cache();
        registry.set_cache(Some(cache));
        mock(&mut registry, id).insert("mock://store/a.bin", b"hello".to_vec());

        registry.request_asset("mock://store/a.bin", "", false).unwrap();
        registry.tick(0.0);
        let cached = registry.cache().unwrap().get("mock://store/a.bin").unwrap();
        assert_eq!(
            registry.get_asset("mock://store/a.bin").unwrap().disk_source(),
            Some(cached.as_path())
        );

        assert!(registry.forget_asset("mock://store/a.bin", false));
        let t = registry.request_asset("mock://store/a.bin", "", false).unwrap();
        assert!(registry.transfer(t).unwrap().is_virtual());
        assert!(registry.transfer(t).unwrap().provider.is_none());

        // A forced request cannot replace a virtual transfer
        assert_eq!(registry.request_asset("mock://store/a.bin", "", true), Some(t));

        registry.tick(0.0);
        assert!(succeeded(&registry.drain_events(), t));
        assert_eq!(binary_data(&registry, "mock://store/a.bin"), b"hello");
        assert_eq!(mock(&mut registry, id).request_count("mock://store/a.bin"), 1);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_cache_hit_without_provider() {
        let mut registry = AssetRegistry::new();
        let (mut cache, dir) = temp_cache();
        cache.put("mock://store/a.bin", b"offline").unwrap();
        registry.set_cache(Some(cache));

        let t = registry.request_asset("mock://store/a.bin", "", false).unwrap();
        assert!(registry.transfer(t).unwrap().provider.is_none());
        registry.tick(0.0);
        assert!(succeeded(&registry.drain_events(), t));
        let asset = registry.get_asset("mock://store/a.bin").unwrap();
        assert_eq!(asset.provider(), None);
        assert_eq!(binary_data(&registry, "mock://store/a.bin"), b"offline");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupted_http_cache_entry_is_refetched() {
        let (mut registry, id) = mock_registry();
        let (mut cache, dir) = temp_cache();
        cache.put("http://host/good.bin", b"good").unwrap();
        cache.put("http://host/bad.bin", b"bad").unwrap();
        fs::write(cache.disk_source_by_ref("http://host/bad.bin"), b"tampered").unwrap();
        registry.set_cache(Some(cache));
        {
            let provider = mock(&mut registry, id);
            provider.insert("http://host/good.bin", b"good".to_vec());
            provider.insert("http://host/bad.bin", b"fresh".to_vec());
        }

        let good = registry.request_asset("http://host/good.bin", "", false).unwrap();
        let bad = registry.request_asset("http://host/bad.bin", "", false).unwrap();
        assert!(!registry.transfer(bad).unwrap().is_virtual());
        {
            let provider = mock(&mut registry, id);
            assert_eq!(provider.revalidation_count("http://host/good.bin"), 1);
            assert_eq!(provider.revalidation_count("http://host/bad.bin"), 0);
            assert_eq!(provider.request_count("http://host/bad.bin"), 1);
        }

        registry.tick(0.0);
        let events = registry.drain_events();
        assert!(succeeded(&events, good));
        assert!(succeeded(&events, bad));
        assert_eq!(binary_data(&registry, "http://host/bad.bin"), b"fresh");

        let cache = registry.cache().unwrap();
        assert!(cache.metadata("http://host/bad.bin").is_some());
        assert_eq!(fs::read(cache.disk_source_by_ref("http://host/bad.bin")).unwrap(), b"fresh");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_download_waits_for_upload() {
        let (mut registry, id) = mock_registry();
        let (mut cache, dir) = temp_cache();
        cache.put("mock://store/a.bin", b"stale").unwrap();
        registry.set_cache(Some(cache));

        registry
            .upload_asset_from_memory(b"fresh", "Store", "a.bin")
            .unwrap();
        let placeholder = registry.request_asset("mock://store/a.bin", "", false).unwrap();
        assert_eq!(registry.request_asset("mock://store/a.bin", "", false), Some(placeholder));
        assert!(registry.pending_download_request("mock://store/a.bin").is_some());
        assert_eq!(mock(&mut registry, id).request_count("mock://store/a.bin"), 0);

        registry.tick(0.0);
        let events = registry.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, AssetEvent::AssetUploaded { asset_ref, .. } if asset_ref == "mock://store/a.bin")));
        assert!(registry.pending_download_request("mock://store/a.bin").is_none());
        assert_eq!(mock(&mut registry, id).request_count("mock://store/a.bin"), 1);

        registry.tick(0.0);
        let events = registry.drain_events();
        assert!(succeeded(&events, placeholder));
        assert_eq!(binary_data(&registry, "mock://store/a.bin"), b"fresh");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_upload_validation() {
        let (mut registry, id) = mock_registry();
        mock(&mut registry, id).add_storage("ReadOnly", false);

        assert!(registry.upload_asset_from_memory(b"", "Store", "a.bin").is_err());
        assert!(registry.upload_asset_from_memory(b"x", "Store", "  ").is_err());
        assert!(registry.upload_asset_from_memory(b"x", "Nope", "a.bin").is_err());
        assert!(registry.upload_asset_from_memory(b"x", "ReadOnly", "a.bin").is_err());
        let missing = std::env::temp_dir().join(format!("cinder_missing_{}", uuid::Uuid::new_v4()));
        assert!(registry.upload_asset_from_file(&missing, "Store", None).is_err());
        assert!(!registry.is_busy());
    }

    #[test]
    fn test_forget_and_delete() {
        let (mut registry, id) = mock_registry();
        let (cache, dir) = temp_cache();
        registry.set_cache(Some(cache));
        mock(&mut registry, id).insert("mock://store/a.bin", b"hello".to_vec());
        registry.request_asset("mock://store/a.bin", "", false).unwrap();
        registry.tick(0.0);
        registry.drain_events();

        assert!(registry.delete_asset_from_storage("mock://store/a.bin"));
        assert!(registry.get_asset("mock://store/a.bin").is_none());
        assert!(registry.cache().unwrap().get("mock://store/a.bin").is_none());
        assert!(mock(&mut registry, id).contents("mock://store/a.bin").is_none());

        registry.tick(0.0);
        let events = registry.drain_events();
        assert!(events.contains(&AssetEvent::AssetAboutToBeRemoved {
            name: "mock://store/a.bin".to_string()
        }));
        assert!(events.contains(&AssetEvent::AssetDeletedFromStorage {
            asset_ref: "mock://store/a.bin".to_string()
        }));
        assert!(!registry.forget_asset("mock://store/a.bin", false));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_abort_transfer() {
        let (mut registry, id) = mock_registry();
        {
            let provider = mock(&mut registry, id);
            provider.insert("mock://store/a.bin", b"hello".to_vec());
            provider.hold("mock://store/a.bin");
        }
        let t = registry.request_asset("mock://store/a.bin", "", false).unwrap();
        registry.tick(0.0);
        assert!(registry.abort_transfer("mock://store/a.bin"));
        assert_eq!(mock(&mut registry, id).pending_count(), 0);

        let events = registry.drain_events();
        assert_eq!(failure_reason(&events, t).unwrap(), "Transfer aborted.");
        assert!(!registry.abort_transfer("mock://store/a.bin"));
    }

    #[test]
    fn test_resolve_asset_ref() {
        let (registry, _) = mock_registry();

        assert_eq!(
            registry.resolve_asset_ref("", "Store:textures/a.png"),
            "mock://store/textures/a.png"
        );
        assert_eq!(registry.resolve_asset_ref("", "a.png"), "mock://store/a.png");
        assert_eq!(
            registry.resolve_asset_ref("mock://store/dir/a.manifest", "../b.bin"),
            "mock://store/b.bin"
        );
        assert_eq!(
            registry.resolve_asset_ref("mock://store/pack.zip#dir/x.bin", "y.bin"),
            "mock://store/pack.zip#dir/y.bin"
        );
        assert_eq!(registry.resolve_asset_ref("dir/a.txt", "b.txt"), "b.txt");
        assert_eq!(registry.resolve_asset_ref("", "Unknown:a.png"), "Unknown:a.png");
        assert_eq!(registry.resolve_asset_ref("", ""), "");

        for input in ["Store:a.png", "HTTP://host/x.png", "www.host.com/y.png", "a.png"] {
            let once = registry.resolve_asset_ref("", input);
            assert_eq!(registry.resolve_asset_ref("", &once), once);
        }
    }

    #[test]
    fn test_storages_and_default() {
        let (mut registry, _) = mock_registry();
        let name = registry
            .add_storage_from_descriptor("type=MockAssetStorage;name=Pack;default=true")
            .unwrap();
        assert_eq!(name.as_deref(), Some("Pack"));
        assert_eq!(registry.default_storage().unwrap().name(), "Pack");
        assert_eq!(registry.resolve_asset_ref("", "a.bin"), "mock://pack/a.bin");
        assert!(registry
            .drain_events()
            .contains(&AssetEvent::StorageAdded { name: "Pack".to_string() }));

        assert_eq!(
            registry.add_storage_from_descriptor("type=Nope;name=X").unwrap(),
            None
        );
        assert!(registry.add_storage_from_descriptor("name=a=b").is_err());

        assert!(registry.remove_storage("pack"));
        assert_eq!(registry.default_storage().unwrap().name(), "Store");
        assert!(!registry.set_default_storage("Pack"));
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let (mut registry, _) = mock_registry();
        assert!(registry
            .register_provider(Box::new(MockAssetProvider::new()))
            .is_none());
        assert_eq!(registry.providers().count(), 1);
        assert!(registry.provider_by_name("mock").is_some());
    }

    #[test]
    fn test_create_and_unique_names() {
        let (mut registry, _) = mock_registry();
        assert_eq!(registry.generate_unique_asset_name("Binary", "tmp"), "Binary_tmp_1");
        assert_eq!(
            registry.create_new_asset("binary", "Binary_tmp_2").as_deref(),
            Some("Binary_tmp_2")
        );
        assert_eq!(registry.generate_unique_asset_name("Binary", "tmp"), "Binary_tmp_3");
        assert_eq!(registry.get_asset("Binary_tmp_2").unwrap().asset_type(), "Binary");
        assert!(registry.get_asset("Binary_tmp_2").unwrap().is_empty());

        assert!(registry.create_new_asset("Binary", "").is_none());
        assert!(registry.create_new_asset("NoSuchType", "x").is_none());
        assert_eq!(registry.assets_of_type("BINARY").len(), 1);
    }

    #[test]
    fn test_discovery_and_storage_changes() {
        let (mut registry, id) = mock_registry();
        registry.handle_asset_discovery("mock://store/found.bin", "");
        assert!(registry.get_asset("mock://store/found.bin").unwrap().is_empty());

        registry.on_asset_changed("Store", "x.bin", None, AssetChange::Create);
        assert!(registry.get_asset("mock://store/x.bin").is_some());
        assert_eq!(
            registry.get_asset("mock://store/x.bin").unwrap().storage(),
            Some("Store")
        );

        // Second create for a known asset is a modify of an unloaded asset
        registry.on_asset_changed("Store", "x.bin", None, AssetChange::Create);
        assert_eq!(mock(&mut registry, id).request_count("mock://store/x.bin"), 0);

        registry.on_asset_changed("Store", "x.bin", None, AssetChange::Delete);
        assert!(registry.get_asset("mock://store/x.bin").is_none());

        mock(&mut registry, id).insert("mock://store/found.bin", b"v1".to_vec());
        registry.request_asset("mock://store/found.bin", "", false).unwrap();
        registry.tick(0.0);
        mock(&mut registry, id).insert("mock://store/found.bin", b"v2".to_vec());
        registry.on_asset_changed("Store", "found.bin", None, AssetChange::Modify);
        registry.tick(0.0);
        assert_eq!(binary_data(&registry, "mock://store/found.bin"), b"v2");
    }

    #[test]
    fn test_storage_change_on_loaded_asset() {
        let (mut registry, id) = mock_registry();
        let (cache, dir) = temp_cache();
        registry.set_cache(Some(cache));
        mock(&mut registry, id).insert("mock://store/a.bin", b"v1".to_vec());
        registry.request_asset("mock://store/a.bin", "", false).unwrap();
        registry.tick(0.0);
        registry.drain_events();
        assert!(registry.get_asset("mock://store/a.bin").unwrap().disk_source().is_some());

        // A modify of an unknown asset is ignored
        registry.on_asset_changed("Store", "ghost.bin", None, AssetChange::Modify);
        assert!(registry.get_asset("mock://store/ghost.bin").is_none());
        assert_eq!(mock(&mut registry, id).request_count("mock://store/ghost.bin"), 0);

        // A delete keeps the loaded asset but drops its disk source
        registry.on_asset_changed("Store", "a.bin", None, AssetChange::Delete);
        let asset = registry.get_asset("mock://store/a.bin").unwrap();
        assert!(asset.is_loaded());
        assert_eq!(asset.disk_source(), None);
        assert_eq!(binary_data(&registry, "mock://store/a.bin"), b"v1");

        // Unknown storages are ignored
        registry.on_asset_changed("Elsewhere", "a.bin", None, AssetChange::Delete);
        assert!(registry.get_asset("mock://store/a.bin").is_some());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_reload_failure_reported_on_asset() {
        let dir = std::env::temp_dir().join(format!("cinder_registry_reload_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("level.manifest"), "# empty\n").unwrap();

        let mut provider = LocalAssetProvider::new();
        provider.set_watch(false, std::time::Duration::from_millis(50));
        provider.add_storage_directory(&dir, "Live", false, true, true, false);
        let mut registry = AssetRegistry::new();
        registry.register_provider(Box::new(provider)).unwrap();

        let t = registry.request_asset("level.manifest", "", false).unwrap();
        registry.tick(0.0);
        assert!(succeeded(&registry.drain_events(), t));
        let name = "local://level.manifest";
        let source = registry
            .get_asset(name)
            .and_then(|a| a.disk_source())
            .map(Path::to_path_buf)
            .unwrap();

        fs::write(&source, [0xff, 0xfe]).unwrap();
        registry.on_disk_source_changed(&source);
        let events = registry.drain_events();
        assert!(events.contains(&AssetEvent::AssetDiskSourceChanged { name: name.to_string() }));
        let reason = events
            .iter()
            .find_map(|e| match e {
                AssetEvent::AssetLoadFailed { name: n, reason } if n == name => Some(reason.clone()),
                _ => None,
            })
            .unwrap();
        assert!(reason.contains("UTF-8"));
        let asset = registry.get_asset(name).unwrap();
        assert!(asset.is_loaded());
        assert!(asset.last_error().is_some());

        fs::write(&source, "# fixed\n").unwrap();
        registry.on_disk_source_changed(&source);
        assert!(registry.get_asset(name).unwrap().last_error().is_none());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_local_storage_manifest() {
        let dir = std::env::temp_dir().join(format!("cinder_registry_local_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(dir.join("tex")).unwrap();
        fs::write(dir.join("scene.manifest"), "# walls\ntex/wall.bin\n").unwrap();
        fs::write(dir.join("tex").join("wall.bin"), b"bricks").unwrap();

        let mut provider = LocalAssetProvider::new();
        provider.set_watch(false, std::time::Duration::from_millis(50));
        let storage = provider.add_storage_directory(&dir, "", true, true, false, false);
        let mut registry = AssetRegistry::new();
        registry.register_provider(Box::new(provider)).unwrap();
        assert_eq!(storage, "Scene");

        let t = registry.request_asset("scene.manifest", "", false).unwrap();
        assert_eq!(registry.transfer(t).unwrap().asset_ref(), "local://scene.manifest");
        registry.tick(0.0);
        registry.tick(0.0);
        assert!(succeeded(&registry.drain_events(), t));

        let wall = registry.get_asset("local://tex/wall.bin").unwrap();
        assert_eq!(wall.disk_source_kind(), DiskSourceKind::Original);
        assert!(wall.disk_source().unwrap().ends_with("wall.bin"));
        assert_eq!(binary_data(&registry, "local://tex/wall.bin"), b"bricks");

        registry
            .upload_asset_from_memory(b"fresh", "Scene", "new.bin")
            .unwrap();
        registry.tick(0.0);
        assert!(registry.drain_events().contains(&AssetEvent::AssetUploaded {
            upload: UploadId(1),
            asset_ref: "local://new.bin".to_string()
        }));
        assert_eq!(fs::read(dir.join("new.bin")).unwrap(), b"fresh");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_reset_keeps_only_binary() {
        let (mut registry, id) = mock_registry();
        mock(&mut registry, id).insert("mock://store/a.bin", b"hello".to_vec());
        registry.request_asset("mock://store/a.bin", "", false).unwrap();
        registry.tick(0.0);

        registry.reset();
        assert_eq!(registry.asset_count(), 0);
        assert_eq!(registry.providers().count(), 0);
        assert_eq!(registry.factories().types(), vec!["Binary"]);
        assert!(registry.bundle_factories().types().is_empty());
        assert!(!registry.is_busy());
    }

    fn bundle_registry() -> (AssetRegistry, ProviderId) {
        let (mut registry, id) = mock_registry();
        let pack = zip_bytes(&[
            ("scene.manifest", &b"inner.bin\n"[..]),
            ("inner.bin", &b"hello"[..]),
            ("empty.bin", &b""[..]),
        ]);
        mock(&mut registry, id).insert("mock://store/pack.zip", pack);
        (registry, id)
    }

    #[test]
    fn test_sub_assets_loaded_from_bundle() {
        let (mut registry, id) = bundle_registry();

        let scene = registry
            .request_asset("mock://store/pack.zip#scene.manifest", "", false)
            .unwrap();
        assert_eq!(
            registry.request_asset("MOCK://store/pack.zip#scene.manifest", "", false),
            Some(scene)
        );
        let inner = registry
            .request_asset("mock://store/pack.zip#inner.bin", "", false)
            .unwrap();
        assert_eq!(registry.transfer(inner).unwrap().kind, TransferKind::SubAsset);

        registry.tick(0.0);
        let events = registry.drain_events();
        assert!(succeeded(&events, scene));
        assert!(succeeded(&events, inner));
        assert_eq!(binary_data(&registry, "mock://store/pack.zip#inner.bin"), b"hello");
        assert_eq!(
            registry
                .dependencies()
                .dependencies_of("mock://store/pack.zip#scene.manifest"),
            vec!["mock://store/pack.zip#inner.bin"]
        );

        // Only the bundle went through the provider
        let provider = mock(&mut registry, id);
        assert_eq!(provider.request_count("mock://store/pack.zip"), 1);
        assert_eq!(provider.request_count("mock://store/pack.zip#inner.bin"), 0);
        assert_eq!(provider.request_count("mock://store/pack.zip#scene.manifest"), 0);

        let asset = registry.get_asset("mock://store/pack.zip#inner.bin").unwrap();
        assert_eq!(asset.disk_source_kind(), DiskSourceKind::Bundle);
        assert!(asset.disk_source().is_none());
        assert_eq!(registry.bundle_refs(), vec!["mock://store/pack.zip"]);
        assert!(registry.bundle("mock://store/pack.zip").is_some());
        assert!(registry.get_asset("mock://store/pack.zip").is_none());
    }

    #[test]
    fn test_sub_asset_of_loaded_bundle() {
        let (mut registry, id) = bundle_registry();
        let inner = registry
            .request_asset("mock://store/pack.zip#inner.bin", "", false)
            .unwrap();
        registry.tick(0.0);
        assert!(succeeded(&registry.drain_events(), inner));

        let missing = registry
            .request_asset("mock://store/pack.zip#missing.bin", "", false)
            .unwrap();
        let empty = registry
            .request_asset("mock://store/pack.zip#empty.bin", "", false)
            .unwrap();
        let scene = registry
            .request_asset("mock://store/pack.zip#scene.manifest", "", false)
            .unwrap();
        assert!(registry.is_busy());
        assert!(registry.drain_events().is_empty());

        registry.tick(0.0);
        let mut events = registry.drain_events();
        registry.tick(0.0);
        events.extend(registry.drain_events());

        assert!(succeeded(&events, scene));
        assert_eq!(
            failure_reason(&events, missing).unwrap(),
            "Failed to load sub asset 'mock://store/pack.zip#missing.bin' from bundle 'mock://store/pack.zip': Sub asset does not exist."
        );
        assert!(failure_reason(&events, empty)
            .unwrap()
            .contains("Sub asset does not exist"));
        assert_eq!(mock(&mut registry, id).request_count("mock://store/pack.zip"), 1);
        assert!(!registry.is_busy());

        // Forced reload reads the entry again without refetching the bundle
        let again = registry
            .request_asset("mock://store/pack.zip#inner.bin", "", true)
            .unwrap();
        registry.tick(0.0);
        assert!(succeeded(&registry.drain_events(), again));
        assert_eq!(mock(&mut registry, id).request_count("mock://store/pack.zip"), 1);

        assert!(registry.forget_bundle("mock://store/pack.zip"));
        assert!(!registry.forget_bundle("mock://store/pack.zip"));
        assert!(registry.get_asset("mock://store/pack.zip#inner.bin").is_some());
    }

    #[test]
    fn test_bundle_failure_fails_sub_assets() {
        let (mut registry, id) = bundle_registry();
        mock(&mut registry, id).fail_next("mock://store/pack.zip", "connection reset");

        let inner = registry
            .request_asset("mock://store/pack.zip#inner.bin", "", false)
            .unwrap();
        let scene = registry
            .request_asset("mock://store/pack.zip#scene.manifest", "", false)
            .unwrap();
        registry.tick(0.0);
        let events = registry.drain_events();
        for transfer in [inner, scene] {
            assert_eq!(
                failure_reason(&events, transfer).unwrap(),
                "Transfer of bundle mock://store/pack.zip failed due to reason: \"connection reset\""
            );
        }
        assert!(registry.bundle_refs().is_empty());
        assert!(!registry.is_busy());

        mock(&mut registry, id).insert("mock://store/pack.zip", b"not a zip".to_vec());
        let inner = registry
            .request_asset("mock://store/pack.zip#inner.bin", "", false)
            .unwrap();
        registry.tick(0.0);
        let events = registry.drain_events();
        assert!(failure_reason(&events, inner)
            .unwrap()
            .contains("Failed to load bundle 'mock://store/pack.zip'"));
        assert!(events.iter().any(|e| matches!(
            e,
            AssetEvent::AssetLoadFailed { name, .. } if name == "mock://store/pack.zip"
        )));
    }

    #[test]
    fn test_sub_asset_without_bundle_type() {
        let (mut registry, id) = bundle_registry();
        mock(&mut registry, id).insert("mock://store/a.bin", b"data".to_vec());
        assert!(registry.request_asset("mock://store/a.bin#part", "", false).is_none());
        assert_eq!(mock(&mut registry, id).request_count("mock://store/a.bin"), 0);

        // An aborted sub-asset transfer is skipped when its bundle arrives
        registry
            .request_asset("mock://store/pack.zip#inner.bin", "", false)
            .unwrap();
        assert!(registry.abort_transfer("mock://store/pack.zip#inner.bin"));
        registry.tick(0.0);
        assert_eq!(registry.bundle_refs(), vec!["mock://store/pack.zip"]);
        assert!(!registry
            .get_asset("mock://store/pack.zip#inner.bin")
            .is_some_and(|a| a.is_loaded()));
    }
}
