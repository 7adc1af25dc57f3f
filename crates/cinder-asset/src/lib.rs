//! Cinder Asset - Asset registry with pluggable providers
//!
//! Assets are named by refs (`local://a.png`, `Data:textures/b.png`,
//! `http://host/c.png`) and fetched through providers that serve storages.
//! The registry deduplicates requests, caches downloaded bytes on disk,
//! tracks dependencies between assets and reports completion through
//! events drained after each [`AssetRegistry::tick`]. Refs with a
//! `#sub-asset` suffix are served from the entries of a bundle such as a
//! zip archive.

pub mod asset;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod dependency;
pub mod factory;
pub mod provider;
pub mod providers;
pub mod refs;
pub mod registry;
pub mod storage;
pub mod transfer;
pub mod watcher;

pub use asset::{Asset, AssetContent, AssetState, DiskSourceKind};
pub use bundle::{AssetBundle, AssetBundleTypeFactory, BundleFactoryRegistry, ZipBundle};
pub use cache::{CacheMetadata, DiskCache};
pub use config::RegistryConfig;
pub use dependency::DependencyGraph;
pub use factory::{AssetTypeFactory, BinaryAsset, FactoryRegistry, ManifestAsset};
pub use provider::{AssetProvider, ProviderEvent, ProviderId};
pub use refs::{normalize_ref, parse_ref, AssetReference, ParsedRef, RefKind};
pub use registry::AssetRegistry;
pub use storage::{AssetChange, AssetStorage, StorageDescriptor};
pub use transfer::{AssetEvent, AssetTransfer, TransferId, UploadId};
