//! Loaded asset instances

use crate::provider::ProviderId;
use crate::refs::AssetReference;
use cinder_core::{CinderError, ContentHash, Result};
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};

/// Type-specific payload of an asset.
///
/// Created empty by an [`crate::AssetTypeFactory`], then filled by
/// `deserialize` each time the asset's bytes arrive.
pub trait AssetContent: Send {
    /// Parse raw bytes into the in-memory representation
    fn deserialize(&mut self, data: &[u8]) -> Result<()>;

    /// Refs this asset depends on, as written in its data. Relative refs
    /// are resolved against the asset's own name by the registry.
    fn references(&self) -> Vec<AssetReference> {
        Vec::new()
    }

    /// Release the in-memory representation
    fn unload(&mut self);

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetState {
    /// Created, never loaded
    Empty,
    Loaded,
    Unloaded,
}

/// What an asset's disk source represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskSourceKind {
    /// The authoritative file, e.g. inside a local storage
    Original,
    /// A copy in the disk cache
    #[default]
    Cached,
    /// Produced in memory, no backing file
    Programmatic,
    /// An entry of a bundle; the disk source, if any, is the bundle's
    Bundle,
}

/// A named, typed asset owned by the registry
pub struct Asset {
    name: String,
    asset_type: String,
    state: AssetState,
    content_hash: Option<ContentHash>,
    disk_source: Option<PathBuf>,
    disk_source_kind: DiskSourceKind,
    provider: Option<ProviderId>,
    storage: Option<String>,
    last_error: Option<String>,
    content: Box<dyn AssetContent>,
}

impl Asset {
    pub fn new(name: impl Into<String>, asset_type: impl Into<String>, content: Box<dyn AssetContent>) -> Self {
        Self {
            name: name.into(),
            asset_type: asset_type.into(),
            state: AssetState::Empty,
            content_hash: None,
            disk_source: None,
            disk_source_kind: DiskSourceKind::default(),
            provider: None,
            storage: None,
            last_error: None,
            content,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn asset_type(&self) -> &str {
        &self.asset_type
    }

    pub fn state(&self) -> AssetState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == AssetState::Loaded
    }

    pub fn is_empty(&self) -> bool {
        self.state == AssetState::Empty
    }

    /// Digest of the bytes of the most recent successful load
    pub fn content_hash(&self) -> Option<ContentHash> {
        self.content_hash
    }

    pub fn disk_source(&self) -> Option<&Path> {
        self.disk_source.as_deref()
    }

    pub fn set_disk_source(&mut self, path: Option<PathBuf>) {
        self.disk_source = path;
    }

    pub fn disk_source_kind(&self) -> DiskSourceKind {
        self.disk_source_kind
    }

    pub fn set_disk_source_kind(&mut self, kind: DiskSourceKind) {
        self.disk_source_kind = kind;
    }

    pub fn provider(&self) -> Option<ProviderId> {
        self.provider
    }

    pub fn set_provider(&mut self, provider: Option<ProviderId>) {
        self.provider = provider;
    }

    pub fn storage(&self) -> Option<&str> {
        self.storage.as_deref()
    }

    pub fn set_storage(&mut self, storage: Option<String>) {
        self.storage = storage;
    }

    pub fn content(&self) -> &dyn AssetContent {
        self.content.as_ref()
    }

    /// Typed access to the content
    pub fn content_as<T: 'static>(&self) -> Option<&T> {
        self.content.as_any().downcast_ref::<T>()
    }

    pub fn references(&self) -> Vec<AssetReference> {
        self.content.references()
    }

    /// Error of the most recent failed load, cleared by the next success
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Deserialize `data` into this asset. On failure the asset keeps its
    /// previous state and records the error.
    pub fn load_from_memory(&mut self, data: &[u8]) -> Result<()> {
        let loaded = self.content.deserialize(data).map_err(|e| match e {
            CinderError::Deserialize(msg) => CinderError::Deserialize(msg),
            other => CinderError::Deserialize(format!("{}: {}", self.name, other)),
        });
        self.record(loaded)?;
        self.content_hash = Some(ContentHash::from_bytes(data));
        self.state = AssetState::Loaded;
        Ok(())
    }

    /// Read `path` and load it, bypassing any cache
    pub fn load_from_file(&mut self, path: &Path) -> Result<()> {
        let data = std::fs::read(path).map_err(CinderError::from);
        let data = self.record(data)?;
        self.load_from_memory(&data)
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(e) => self.last_error = Some(e.to_string()),
        }
        result
    }

    /// Reload from the current disk source
    pub fn reload_from_disk_source(&mut self) -> Result<()> {
        let path = self.disk_source.clone().ok_or_else(|| {
            CinderError::Deserialize(format!("Asset {} has no disk source", self.name))
        });
        let path = self.record(path)?;
        self.load_from_file(&path)
    }

    /// Release the content. Safe to call any number of times.
    pub fn unload(&mut self) {
        if self.state == AssetState::Loaded {
            self.content.unload();
            self.state = AssetState::Unloaded;
        }
    }
}

impl Drop for Asset {
    fn drop(&mut self) {
        self.unload();
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("name", &self.name)
            .field("type", &self.asset_type)
            .field("state", &self.state)
            .field("disk_source", &self.disk_source)
            .finish()
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.asset_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingContent {
        unloads: Arc<AtomicUsize>,
        reject: bool,
    }

    impl AssetContent for CountingContent {
        fn deserialize(&mut self, _data: &[u8]) -> Result<()> {
            if self.reject {
                return Err(CinderError::Deserialize("rejected".to_string()));
            }
            Ok(())
        }

        fn unload(&mut self) {
            self.unloads.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn counting(reject: bool) -> (Asset, Arc<AtomicUsize>) {
        let unloads = Arc::new(AtomicUsize::new(0));
        let content = CountingContent {
            unloads: unloads.clone(),
            reject,
        };
        (Asset::new("local://a.bin", "Binary", Box::new(content)), unloads)
    }

    #[test]
    fn test_lifecycle() {
        let (mut asset, unloads) = counting(false);
        assert!(asset.is_empty());

        asset.load_from_memory(b"abc").unwrap();
        assert!(asset.is_loaded());
        assert_eq!(asset.content_hash(), Some(ContentHash::from_bytes(b"abc")));

        asset.unload();
        asset.unload();
        assert_eq!(asset.state(), AssetState::Unloaded);
        assert_eq!(unloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unloads_once() {
        let (mut asset, unloads) = counting(false);
        asset.load_from_memory(b"abc").unwrap();
        asset.unload();
        drop(asset);
        assert_eq!(unloads.load(Ordering::SeqCst), 1);

        let (mut asset, unloads) = counting(false);
        asset.load_from_memory(b"abc").unwrap();
        drop(asset);
        assert_eq!(unloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_load_keeps_state() {
        let (mut asset, _) = counting(true);
        let err = asset.load_from_memory(b"abc").unwrap_err();
        assert!(matches!(err, CinderError::Deserialize(_)));
        assert!(asset.is_empty());
        assert!(asset.content_hash().is_none());
    }

    #[test]
    fn test_reload_without_disk_source_fails() {
        let (mut asset, _) = counting(false);
        assert!(asset.reload_from_disk_source().is_err());
    }
}
