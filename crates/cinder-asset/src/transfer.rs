//! In-flight transfers and the events they produce

use crate::asset::DiskSourceKind;
use crate::cache::CacheMetadata;
use crate::provider::ProviderId;
use crate::refs::AssetReference;
use std::fmt;
use std::path::PathBuf;

/// Handle to a download transfer, unique for the registry's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

/// Handle to an upload transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer#{}", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload#{}", self.0)
    }
}

/// How a transfer gets its bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// A provider is fetching the data
    Provider,
    /// No I/O: the asset is already resident (loaded or in the disk cache)
    /// and completion is delivered from the ready-queue
    Virtual,
    /// Stand-in returned while an upload to the same ref is running. The
    /// real request is dispatched when the upload completes.
    Placeholder,
    /// Entry of a bundle. Completes once the bundle is loaded.
    SubAsset,
}

/// One outstanding fetch
#[derive(Debug, Clone)]
pub struct AssetTransfer {
    pub id: TransferId,
    /// Normalized ref and resolved type
    pub source: AssetReference,
    pub kind: TransferKind,
    pub raw_data: Vec<u8>,
    pub provider: Option<ProviderId>,
    pub storage: Option<String>,
    /// Name of the asset this transfer fills, once it exists
    pub asset: Option<String>,
    pub caching_allowed: bool,
    /// Explicit disk source chosen by the provider or the cache
    pub disk_source: Option<PathBuf>,
    pub disk_source_kind: DiskSourceKind,
    /// Validation data the provider wants stored next to the cached bytes
    pub cache_metadata: Option<CacheMetadata>,
    /// Placeholders whose callers should see this transfer's events
    pub forwarded_to: Vec<TransferId>,
}

impl AssetTransfer {
    pub fn new(id: TransferId, source: AssetReference, kind: TransferKind) -> Self {
        Self {
            id,
            source,
            kind,
            raw_data: Vec::new(),
            provider: None,
            storage: None,
            asset: None,
            caching_allowed: true,
            disk_source: None,
            disk_source_kind: DiskSourceKind::Cached,
            cache_metadata: None,
            forwarded_to: Vec::new(),
        }
    }

    pub fn asset_ref(&self) -> &str {
        &self.source.asset_ref
    }

    pub fn asset_type(&self) -> &str {
        &self.source.asset_type
    }

    /// True when no provider works on this transfer
    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, TransferKind::Virtual | TransferKind::SubAsset)
    }

    /// Turn off cache writes and record where the data really lives
    pub fn set_caching_behavior(&mut self, caching_allowed: bool, disk_source: Option<PathBuf>) {
        self.caching_allowed = caching_allowed;
        self.disk_source = disk_source;
    }
}

/// One outstanding upload
#[derive(Debug, Clone)]
pub struct UploadTransfer {
    pub id: UploadId,
    pub provider: ProviderId,
    pub destination_storage: String,
    pub destination_name: String,
    /// Full ref the uploaded asset will be known by
    pub asset_ref: String,
}

/// Notifications produced by the registry, drained by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetEvent {
    /// Bytes arrived and the asset was created; dependencies may still be
    /// loading
    Downloaded {
        transfer: TransferId,
        asset_ref: String,
    },
    /// The asset and all of its dependencies are loaded
    TransferSucceeded {
        transfer: TransferId,
        asset_ref: String,
    },
    TransferFailed {
        transfer: TransferId,
        asset_ref: String,
        reason: String,
    },
    AssetCreated {
        name: String,
    },
    AssetAboutToBeRemoved {
        name: String,
    },
    AssetUploaded {
        upload: UploadId,
        asset_ref: String,
    },
    UploadFailed {
        upload: UploadId,
        asset_ref: String,
        reason: String,
    },
    AssetDiskSourceChanged {
        name: String,
    },
    /// Loading or reloading the asset's data failed, with or without a
    /// transfer
    AssetLoadFailed {
        name: String,
        reason: String,
    },
    StorageAdded {
        name: String,
    },
    AssetDeletedFromStorage {
        asset_ref: String,
    },
}

impl AssetEvent {
    /// Transfer this event belongs to, if any
    pub fn transfer(&self) -> Option<TransferId> {
        match self {
            AssetEvent::Downloaded { transfer, .. }
            | AssetEvent::TransferSucceeded { transfer, .. }
            | AssetEvent::TransferFailed { transfer, .. } => Some(*transfer),
            _ => None,
        }
    }
}

impl fmt::Display for AssetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetEvent::Downloaded { transfer, asset_ref } => {
                write!(f, "[{}] downloaded {}", transfer, asset_ref)
            }
            AssetEvent::TransferSucceeded { transfer, asset_ref } => {
                write!(f, "[{}] succeeded {}", transfer, asset_ref)
            }
            AssetEvent::TransferFailed {
                transfer,
                asset_ref,
                reason,
            } => write!(f, "[{}] failed {}: {}", transfer, asset_ref, reason),
            AssetEvent::AssetCreated { name } => write!(f, "created {}", name),
            AssetEvent::AssetAboutToBeRemoved { name } => write!(f, "removing {}", name),
            AssetEvent::AssetUploaded { upload, asset_ref } => {
                write!(f, "[{}] uploaded {}", upload, asset_ref)
            }
            AssetEvent::UploadFailed {
                upload,
                asset_ref,
                reason,
            } => write!(f, "[{}] upload of {} failed: {}", upload, asset_ref, reason),
            AssetEvent::AssetDiskSourceChanged { name } => {
                write!(f, "disk source changed for {}", name)
            }
            AssetEvent::AssetLoadFailed { name, reason } => {
                write!(f, "load of {} failed: {}", name, reason)
            }
            AssetEvent::StorageAdded { name } => write!(f, "storage added {}", name),
            AssetEvent::AssetDeletedFromStorage { asset_ref } => {
                write!(f, "deleted from storage {}", asset_ref)
            }
        }
    }
}

/// FIFO event queue
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Vec<AssetEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: AssetEvent) {
        self.events.push(event);
    }

    /// Take all queued events, leaving the queue empty
    pub fn drain(&mut self) -> Vec<AssetEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}
