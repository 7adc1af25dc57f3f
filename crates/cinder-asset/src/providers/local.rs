//! Local filesystem provider
//!
//! Serves `local://`, `file://`, absolute paths and relative refs found in
//! one of its directory storages. Downloads are read straight from disk and
//! never go through the cache; the file itself becomes the disk source.

use crate::asset::DiskSourceKind;
use crate::provider::*;
use crate::refs::{parse_ref, RefKind};
use crate::storage::{AssetChange, AssetStorage, StorageDescriptor};
use crate::transfer::TransferId;
use cinder_core::{CinderError, Result};
use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::any::Any;
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

pub const LOCAL_STORAGE_TYPE: &str = "LocalAssetStorage";

/// A directory on disk
pub struct LocalAssetStorage {
    name: String,
    directory: PathBuf,
    recursive: bool,
    writable: bool,
    live_update: bool,
    auto_discoverable: bool,
    watcher: Option<StorageWatcher>,
}

struct StorageWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    rx: Receiver<DebounceEventResult>,
    known: HashSet<PathBuf>,
}

impl LocalAssetStorage {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            recursive: true,
            writable: true,
            live_update: true,
            auto_discoverable: false,
            watcher: None,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn recursive(&self) -> bool {
        self.recursive
    }

    pub fn auto_discoverable(&self) -> bool {
        self.auto_discoverable
    }

    /// Locate `local_name` in this storage. With `recursive`, subdirectories
    /// are searched for the file name as well.
    pub fn find_file(&self, local_name: &str, recursive: bool) -> Option<PathBuf> {
        let direct = self.directory.join(local_name);
        if direct.is_file() {
            return Some(direct);
        }
        if !recursive {
            return None;
        }
        let file_name = Path::new(local_name).file_name()?;
        find_recursive(&self.directory, file_name)
    }

    /// Storage-relative name of an absolute path under this storage
    pub fn local_name_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.directory).ok()?;
        Some(relative.to_string_lossy().replace('\\', "/"))
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        path.starts_with(&self.directory)
    }

    fn start_watching(&mut self, debounce: Duration) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut debouncer = new_debouncer(debounce, tx)
            .map_err(|e| CinderError::Storage(format!("Failed to create file watcher: {}", e)))?;
        let mode = if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        debouncer
            .watcher()
            .watch(&self.directory, mode)
            .map_err(|e| {
                CinderError::Storage(format!(
                    "Failed to watch {}: {}",
                    self.directory.display(),
                    e
                ))
            })?;
        let known = list_files(&self.directory, self.recursive).into_iter().collect();
        self.watcher = Some(StorageWatcher {
            _debouncer: debouncer,
            rx,
            known,
        });
        Ok(())
    }

    /// Drain watcher notifications into storage change events
    fn poll_changes(&mut self) -> Vec<ProviderEvent> {
        let mut changed = Vec::new();
        if let Some(watcher) = self.watcher.as_mut() {
            while let Ok(result) = watcher.rx.try_recv() {
                match result {
                    Ok(events) => {
                        for event in events {
                            if !changed.contains(&event.path) {
                                changed.push(event.path);
                            }
                        }
                    }
                    Err(e) => log::warn!("Watch error in storage '{}': {:?}", self.name, e),
                }
            }
        }

        let mut events = Vec::new();
        for path in changed {
            let Some(local_name) = self.local_name_of(&path) else {
                continue;
            };
            let Some(watcher) = self.watcher.as_mut() else {
                break;
            };
            let change = if path.is_file() {
                if watcher.known.insert(path.clone()) {
                    AssetChange::Create
                } else {
                    AssetChange::Modify
                }
            } else if watcher.known.remove(&path) {
                AssetChange::Delete
            } else {
                // directories and files that came and went between polls
                continue;
            };
            log::debug!("Storage '{}': {:?} {}", self.name, change, local_name);
            events.push(ProviderEvent::StorageChanged {
                storage: self.name.clone(),
                local_name,
                disk_source: Some(path),
                change,
            });
        }
        events
    }
}

impl AssetStorage for LocalAssetStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_type(&self) -> &str {
        LOCAL_STORAGE_TYPE
    }

    fn base_url(&self) -> String {
        "local://".to_string()
    }

    fn full_asset_url(&self, local_name: &str) -> String {
        format!("local://{}", local_name.trim_start_matches('/'))
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn live_update(&self) -> bool {
        self.live_update
    }

    fn serialize(&self) -> String {
        format!(
            "type={};name={};src={};recursive={};readonly={};liveupdate={};autodiscoverable={}",
            LOCAL_STORAGE_TYPE,
            self.name,
            self.directory.display(),
            self.recursive,
            !self.writable,
            self.live_update,
            self.auto_discoverable
        )
    }
}

/// `asset_name` as a path inside a storage directory. Names that climb out
/// with `..` or carry a root or drive prefix are refused.
fn contained_path(asset_name: &str) -> Result<PathBuf> {
    let path = Path::new(asset_name);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes || asset_name.trim().is_empty() {
        return Err(CinderError::Upload(format!(
            "Invalid destination name '{}'",
            asset_name
        )));
    }
    Ok(path.to_path_buf())
}

fn find_recursive(dir: &Path, file_name: &std::ffi::OsStr) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if path.file_name() == Some(file_name) {
            return Some(path);
        }
    }
    subdirs.sort();
    subdirs
        .iter()
        .find_map(|sub| find_recursive(sub, file_name))
}

fn list_files(dir: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                files.extend(list_files(&path, true));
            }
        } else {
            files.push(path);
        }
    }
    files.sort();
    files
}

/// Provider for files on the local filesystem
pub struct LocalAssetProvider {
    storages: Vec<LocalAssetStorage>,
    pending_downloads: Vec<TransferRequest>,
    pending_uploads: Vec<UploadRequest>,
    queued_events: Vec<ProviderEvent>,
    accept_unknown_sources: bool,
    watch_debounce: Duration,
    watch_enabled: bool,
}

impl Default for LocalAssetProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAssetProvider {
    pub fn new() -> Self {
        Self {
            storages: Vec::new(),
            pending_downloads: Vec::new(),
            pending_uploads: Vec::new(),
            queued_events: Vec::new(),
            accept_unknown_sources: true,
            watch_debounce: Duration::from_millis(500),
            watch_enabled: true,
        }
    }

    /// Whether refs outside every storage may still be read from disk
    pub fn set_accept_unknown_sources(&mut self, accept: bool) {
        self.accept_unknown_sources = accept;
    }

    pub fn set_watch(&mut self, enabled: bool, debounce: Duration) {
        self.watch_enabled = enabled;
        self.watch_debounce = debounce;
    }

    /// Add a directory storage. A taken name gets a numeric suffix.
    pub fn add_storage_directory(
        &mut self,
        directory: &Path,
        name: &str,
        recursive: bool,
        writable: bool,
        live_update: bool,
        auto_discoverable: bool,
    ) -> String {
        let taken: Vec<&str> = self.storages.iter().map(|s| s.name.as_str()).collect();
        let base = if name.trim().is_empty() { "Scene" } else { name.trim() };
        let name = unique_storage_name(base, &taken);

        let mut storage = LocalAssetStorage::new(name.clone(), directory);
        storage.recursive = recursive;
        storage.writable = writable;
        storage.live_update = live_update;
        storage.auto_discoverable = auto_discoverable;

        if live_update && self.watch_enabled {
            if let Err(e) = storage.start_watching(self.watch_debounce) {
                log::warn!("{}", e);
            }
        }

        if auto_discoverable {
            for path in list_files(directory, recursive) {
                if let Some(local_name) = storage.local_name_of(&path) {
                    self.queued_events.push(ProviderEvent::StorageChanged {
                        storage: name.clone(),
                        local_name,
                        disk_source: Some(path),
                        change: AssetChange::Create,
                    });
                }
            }
        }

        log::info!(
            "Added local storage '{}' at {}",
            name,
            storage.directory.display()
        );
        self.storages.push(storage);
        name
    }

    /// Resolve a ref to the file that backs it and the storage holding it.
    ///
    /// Every storage is searched non-recursively first, then recursively.
    pub fn path_for_asset(&self, asset_ref: &str) -> Option<(PathBuf, Option<&LocalAssetStorage>)> {
        let parsed = parse_ref(asset_ref);
        let local_name = match parsed.kind {
            RefKind::LocalUrl => {
                let inner = parse_ref(&parsed.path_filename);
                if inner.kind == RefKind::LocalPath {
                    return self.absolute_file(&inner.path_filename);
                }
                inner.path_filename
            }
            RefKind::LocalPath => return self.absolute_file(&parsed.path_filename),
            RefKind::RelativePath => parsed.path_filename,
            _ => return None,
        };

        for recursive in [false, true] {
            for storage in &self.storages {
                if recursive && !storage.recursive {
                    continue;
                }
                if let Some(path) = storage.find_file(&local_name, recursive) {
                    return Some((path, Some(storage)));
                }
            }
        }
        None
    }

    fn absolute_file(&self, path: &str) -> Option<(PathBuf, Option<&LocalAssetStorage>)> {
        let path = PathBuf::from(path);
        if !path.is_file() {
            return None;
        }
        let storage = self.storages.iter().find(|s| s.contains_path(&path));
        Some((path, storage))
    }

    fn storage_index(&self, name: &str) -> Option<usize> {
        self.storages
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn complete_upload(&self, upload: &UploadRequest) -> ProviderEvent {
        let Some(storage) = self.storage_index(&upload.storage).map(|i| &self.storages[i]) else {
            return ProviderEvent::UploadFailed {
                upload: upload.upload,
                reason: format!("Storage '{}' not found", upload.storage),
            };
        };
        let relative = match contained_path(&upload.asset_name) {
            Ok(relative) => relative,
            Err(e) => {
                return ProviderEvent::UploadFailed {
                    upload: upload.upload,
                    reason: e.to_string(),
                }
            }
        };
        let target = storage.directory.join(relative);
        let written = target
            .parent()
            .map(fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| fs::write(&target, &upload.data));
        match written {
            Ok(()) => {
                log::debug!("Uploaded {} bytes to {}", upload.data.len(), target.display());
                ProviderEvent::UploadCompleted {
                    upload: upload.upload,
                }
            }
            Err(e) => ProviderEvent::UploadFailed {
                upload: upload.upload,
                reason: format!("Failed to write {}: {}", target.display(), e),
            },
        }
    }

    fn complete_download(&self, request: &TransferRequest) -> ProviderEvent {
        let Some((path, storage)) = self.path_for_asset(&request.asset_ref) else {
            return ProviderEvent::TransferFailed {
                transfer: request.transfer,
                reason: format!("Failed to find local asset with name \"{}\"", request.asset_ref),
            };
        };
        match fs::read(&path) {
            Ok(data) => {
                let absolute = fs::canonicalize(&path).unwrap_or(path);
                let mut done = CompletedTransfer::with_data(request.transfer, data);
                done.caching_allowed = false;
                done.disk_source = Some(absolute);
                done.disk_source_kind = DiskSourceKind::Original;
                done.storage = storage.map(|s| s.name.clone());
                ProviderEvent::TransferCompleted(done)
            }
            Err(e) => ProviderEvent::TransferFailed {
                transfer: request.transfer,
                reason: format!("Failed to read {}: {}", path.display(), e),
            },
        }
    }
}

impl AssetProvider for LocalAssetProvider {
    fn name(&self) -> &str {
        "Local"
    }

    fn is_valid_ref(&self, asset_ref: &str, _asset_type: &str) -> bool {
        match parse_ref(asset_ref).kind {
            RefKind::LocalPath | RefKind::LocalUrl => true,
            RefKind::RelativePath => self.path_for_asset(asset_ref).is_some(),
            _ => false,
        }
    }

    fn request_asset(&mut self, request: TransferRequest) -> Result<()> {
        if !self.accept_unknown_sources {
            let in_storage = self
                .path_for_asset(&request.asset_ref)
                .map(|(_, storage)| storage.is_some())
                .unwrap_or(false);
            if !in_storage {
                return Err(CinderError::Transfer(format!(
                    "Asset '{}' is outside all local storages",
                    request.asset_ref
                )));
            }
        }
        self.pending_downloads.push(request);
        Ok(())
    }

    fn abort_transfer(&mut self, transfer: TransferId) -> bool {
        let before = self.pending_downloads.len();
        self.pending_downloads.retain(|r| r.transfer != transfer);
        self.pending_downloads.len() != before
    }

    fn storages(&self) -> Vec<&dyn AssetStorage> {
        self.storages
            .iter()
            .map(|s| s as &dyn AssetStorage)
            .collect()
    }

    fn storage_for_ref(&self, asset_ref: &str) -> Option<&dyn AssetStorage> {
        self.path_for_asset(asset_ref)
            .and_then(|(_, storage)| storage)
            .map(|s| s as &dyn AssetStorage)
    }

    fn try_create_storage(&mut self, descriptor: &StorageDescriptor) -> Option<String> {
        if !descriptor.accepts_type(LOCAL_STORAGE_TYPE) {
            return None;
        }
        let src = descriptor.get("src")?;
        let parsed = parse_ref(src);
        let directory = match parsed.kind {
            RefKind::LocalPath => PathBuf::from(&parsed.path_filename),
            RefKind::RelativePath => std::env::current_dir().ok()?.join(&parsed.path_filename),
            _ => return None,
        };

        Some(self.add_storage_directory(
            &directory,
            descriptor.get("name").unwrap_or(""),
            descriptor.flag("recursive").unwrap_or(true),
            !descriptor.flag("readonly").unwrap_or(false),
            descriptor.flag("liveupdate").unwrap_or(true),
            descriptor.flag("autodiscoverable").unwrap_or(false),
        ))
    }

    fn remove_storage(&mut self, name: &str) -> bool {
        match self.storage_index(name) {
            Some(idx) => {
                self.storages.remove(idx);
                true
            }
            None => false,
        }
    }

    fn delete_asset_from_storage(&mut self, asset_ref: &str) -> Result<()> {
        let (path, _) = self.path_for_asset(asset_ref).ok_or_else(|| {
            CinderError::Storage(format!("Failed to find local asset '{}'", asset_ref))
        })?;
        fs::remove_file(&path)?;
        log::info!("Deleted {}", path.display());
        self.queued_events.push(ProviderEvent::DeletedFromStorage {
            asset_ref: asset_ref.to_string(),
        });
        Ok(())
    }

    fn upload_asset(&mut self, request: UploadRequest) -> Result<()> {
        let idx = self.storage_index(&request.storage).ok_or_else(|| {
            CinderError::Storage(format!("Unknown storage '{}'", request.storage))
        })?;
        if !self.storages[idx].writable {
            return Err(CinderError::Upload(format!(
                "Storage '{}' is read-only",
                self.storages[idx].name
            )));
        }
        contained_path(&request.asset_name)?;
        self.pending_uploads.push(request);
        Ok(())
    }

    fn update(&mut self, _dt: f64) -> Vec<ProviderEvent> {
        let mut events = std::mem::take(&mut self.queued_events);

        // Uploads are written before any download is served
        for upload in std::mem::take(&mut self.pending_uploads) {
            events.push(self.complete_upload(&upload));
        }
        for request in std::mem::take(&mut self.pending_downloads) {
            events.push(self.complete_download(&request));
        }
        for storage in &mut self.storages {
            events.extend(storage.poll_changes());
        }
        events
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
