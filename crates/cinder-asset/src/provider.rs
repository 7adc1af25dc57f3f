//! Asset provider trait and request/event types
//!
//! A provider owns a set of storages and moves bytes between them and the
//! registry. Providers never touch registry state: requests go in through
//! the trait methods and results come back as [`ProviderEvent`]s from
//! [`AssetProvider::update`], which the registry processes during its tick.

use crate::asset::DiskSourceKind;
use crate::cache::CacheMetadata;
use crate::storage::{AssetChange, AssetStorage, StorageDescriptor};
use crate::transfer::{TransferId, UploadId};
use cinder_core::{CinderError, Result};
use std::any::Any;
use std::fmt;
use std::path::PathBuf;

/// Index of a provider inside the registry, in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(pub usize);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider#{}", self.0)
    }
}

/// What the cache already holds for a ref, handed to providers that can
/// revalidate (e.g. with If-Modified-Since)
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub path: PathBuf,
    pub metadata: CacheMetadata,
}

/// A download the registry wants a provider to perform
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub transfer: TransferId,
    pub asset_ref: String,
    pub asset_type: String,
    pub cached: Option<CachedEntry>,
}

/// An upload into one of the provider's storages
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub upload: UploadId,
    pub storage: String,
    pub asset_name: String,
    pub data: Vec<u8>,
}

/// Payload of a finished download
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub transfer: TransferId,
    pub data: Vec<u8>,
    /// False when the data already lives on disk somewhere the registry can
    /// reload it from
    pub caching_allowed: bool,
    pub disk_source: Option<PathBuf>,
    pub disk_source_kind: DiskSourceKind,
    pub storage: Option<String>,
    pub cache_metadata: Option<CacheMetadata>,
}

impl CompletedTransfer {
    /// Bytes that should go through the disk cache
    pub fn with_data(transfer: TransferId, data: Vec<u8>) -> Self {
        Self {
            transfer,
            data,
            caching_allowed: true,
            disk_source: None,
            disk_source_kind: DiskSourceKind::Cached,
            storage: None,
            cache_metadata: None,
        }
    }
}

/// Results reported back to the registry
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    TransferCompleted(CompletedTransfer),
    TransferFailed {
        transfer: TransferId,
        reason: String,
    },
    TransferAborted {
        transfer: TransferId,
    },
    UploadCompleted {
        upload: UploadId,
    },
    UploadFailed {
        upload: UploadId,
        reason: String,
    },
    /// A file appeared, changed or vanished inside a watched storage
    StorageChanged {
        storage: String,
        local_name: String,
        disk_source: Option<PathBuf>,
        change: AssetChange,
    },
    DeletedFromStorage {
        asset_ref: String,
    },
}

/// Trait implemented by each asset source (Local, Http, Mock)
pub trait AssetProvider: Send {
    /// Provider name (e.g. "Local", "Http")
    fn name(&self) -> &str;

    /// Whether this provider can serve the given ref
    fn is_valid_ref(&self, asset_ref: &str, asset_type: &str) -> bool;

    /// Queue a download. Errors mean the request was refused outright.
    fn request_asset(&mut self, request: TransferRequest) -> Result<()>;

    /// Cancel a queued download. Returns true if it was still pending.
    fn abort_transfer(&mut self, _transfer: TransferId) -> bool {
        false
    }

    fn storages(&self) -> Vec<&dyn AssetStorage>;

    /// Storage that contains the given ref, if any
    fn storage_for_ref(&self, _asset_ref: &str) -> Option<&dyn AssetStorage> {
        None
    }

    /// Create a storage from a descriptor if this provider understands it.
    /// Returns the new storage's name.
    fn try_create_storage(&mut self, _descriptor: &StorageDescriptor) -> Option<String> {
        None
    }

    fn remove_storage(&mut self, _name: &str) -> bool {
        false
    }

    /// Delete the asset's data from its storage. Completion is reported with
    /// [`ProviderEvent::DeletedFromStorage`].
    fn delete_asset_from_storage(&mut self, asset_ref: &str) -> Result<()> {
        Err(CinderError::Storage(format!(
            "Provider '{}' does not support deleting '{}'",
            self.name(),
            asset_ref
        )))
    }

    /// Queue an upload into one of this provider's storages
    fn upload_asset(&mut self, request: UploadRequest) -> Result<()> {
        Err(CinderError::Upload(format!(
            "Provider '{}' does not support uploads to '{}'",
            self.name(),
            request.storage
        )))
    }

    /// Advance outstanding work and report what finished
    fn update(&mut self, _dt: f64) -> Vec<ProviderEvent> {
        Vec::new()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Find a storage by name, case-insensitively
pub fn find_storage<'a>(storages: &[&'a dyn AssetStorage], name: &str) -> Option<&'a dyn AssetStorage> {
    storages
        .iter()
        .copied()
        .find(|s| s.name().eq_ignore_ascii_case(name))
}

/// Pick `base`, `base2`, `base3`... whichever is not taken yet
pub fn unique_storage_name(base: &str, taken: &[&str]) -> String {
    let is_taken = |candidate: &str| taken.iter().any(|t| t.eq_ignore_ascii_case(candidate));
    if !is_taken(base) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}{}", base, n);
        if !is_taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
