//! Mock provider for testing
//!
//! Serves assets from an in-memory map under the `mock://` scheme. Every
//! queued request completes on the next `update()` unless it is held or
//! told to fail, which makes transfer ordering fully deterministic.

use crate::provider::*;
use crate::refs::{normalize_ref, parse_ref, RefKind};
use crate::storage::{AssetStorage, StorageDescriptor};
use crate::transfer::TransferId;
use cinder_core::{CinderError, Result};
use std::any::Any;
use std::collections::{HashMap, HashSet};

pub const MOCK_PROTOCOL: &str = "mock";
pub const MOCK_STORAGE_TYPE: &str = "MockAssetStorage";

/// In-memory storage addressed as `mock://<name>/<local name>`
#[derive(Debug, Clone)]
pub struct MockAssetStorage {
    name: String,
    writable: bool,
    live_update: bool,
}

impl AssetStorage for MockAssetStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_type(&self) -> &str {
        MOCK_STORAGE_TYPE
    }

    fn base_url(&self) -> String {
        format!("{}://{}/", MOCK_PROTOCOL, self.name.to_lowercase())
    }

    fn full_asset_url(&self, local_name: &str) -> String {
        format!("{}{}", self.base_url(), local_name.trim_start_matches('/'))
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn live_update(&self) -> bool {
        self.live_update
    }

    fn serialize(&self) -> String {
        format!(
            "type={};name={};readonly={}",
            MOCK_STORAGE_TYPE, self.name, !self.writable
        )
    }
}

/// A provider that serves in-memory assets
#[derive(Default)]
pub struct MockAssetProvider {
    assets: HashMap<String, Vec<u8>>,
    storages: Vec<MockAssetStorage>,
    pending: Vec<TransferRequest>,
    uploads: Vec<UploadRequest>,
    deleted: Vec<String>,
    held: HashSet<String>,
    failures: HashMap<String, String>,
    requests: HashMap<String, usize>,
    revalidations: HashMap<String, usize>,
    caching_allowed: bool,
}

impl MockAssetProvider {
    pub fn new() -> Self {
        Self {
            caching_allowed: true,
            ..Default::default()
        }
    }

    /// Make `asset_ref` downloadable with the given bytes
    pub fn insert(&mut self, asset_ref: &str, data: impl Into<Vec<u8>>) {
        self.assets.insert(normalize_ref(asset_ref), data.into());
    }

    pub fn remove(&mut self, asset_ref: &str) -> Option<Vec<u8>> {
        self.assets.remove(&normalize_ref(asset_ref))
    }

    pub fn contents(&self, asset_ref: &str) -> Option<&[u8]> {
        self.assets.get(&normalize_ref(asset_ref)).map(|d| d.as_slice())
    }

    /// Keep requests for `asset_ref` pending until [`release`](Self::release)
    pub fn hold(&mut self, asset_ref: &str) {
        self.held.insert(normalize_ref(asset_ref));
    }

    pub fn release(&mut self, asset_ref: &str) {
        self.held.remove(&normalize_ref(asset_ref));
    }

    /// Fail the next download of `asset_ref` with `reason`
    pub fn fail_next(&mut self, asset_ref: &str, reason: &str) {
        self.failures
            .insert(normalize_ref(asset_ref), reason.to_string());
    }

    /// Whether completed downloads may be written to the disk cache
    pub fn set_caching_allowed(&mut self, allowed: bool) {
        self.caching_allowed = allowed;
    }

    /// How many times `asset_ref` reached this provider
    pub fn request_count(&self, asset_ref: &str) -> usize {
        self.requests
            .get(&normalize_ref(asset_ref))
            .copied()
            .unwrap_or(0)
    }

    /// How many requests for `asset_ref` arrived with a usable cache entry
    pub fn revalidation_count(&self, asset_ref: &str) -> usize {
        self.revalidations
            .get(&normalize_ref(asset_ref))
            .copied()
            .unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn add_storage(&mut self, name: &str, writable: bool) -> String {
        let taken: Vec<&str> = self.storages.iter().map(|s| s.name.as_str()).collect();
        let name = unique_storage_name(name, &taken);
        self.storages.push(MockAssetStorage {
            name: name.clone(),
            writable,
            live_update: false,
        });
        name
    }

    fn storage_by_name(&self, name: &str) -> Option<&MockAssetStorage> {
        self.storages
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn complete_download(&mut self, request: &TransferRequest) -> ProviderEvent {
        if let Some(reason) = self.failures.remove(&request.asset_ref) {
            return ProviderEvent::TransferFailed {
                transfer: request.transfer,
                reason,
            };
        }
        match self.assets.get(&request.asset_ref) {
            Some(data) => {
                let mut done = CompletedTransfer::with_data(request.transfer, data.clone());
                done.caching_allowed = self.caching_allowed;
                done.storage = self
                    .storages
                    .iter()
                    .find(|s| request.asset_ref.starts_with(&s.base_url()))
                    .map(|s| s.name.clone());
                ProviderEvent::TransferCompleted(done)
            }
            None => ProviderEvent::TransferFailed {
                transfer: request.transfer,
                reason: format!("Asset '{}' not found", request.asset_ref),
            },
        }
    }
}

impl AssetProvider for MockAssetProvider {
    fn name(&self) -> &str {
        "Mock"
    }

    fn is_valid_ref(&self, asset_ref: &str, _asset_type: &str) -> bool {
        let parsed = parse_ref(asset_ref);
        (parsed.kind == RefKind::ExternalUrl && parsed.protocol.eq_ignore_ascii_case(MOCK_PROTOCOL))
            || self.assets.contains_key(&parsed.full_ref)
    }

    fn request_asset(&mut self, request: TransferRequest) -> Result<()> {
        *self.requests.entry(request.asset_ref.clone()).or_insert(0) += 1;
        if request.cached.is_some() {
            *self.revalidations.entry(request.asset_ref.clone()).or_insert(0) += 1;
        }
        self.pending.push(request);
        Ok(())
    }

    fn abort_transfer(&mut self, transfer: TransferId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|r| r.transfer != transfer);
        self.pending.len() != before
    }

    fn storages(&self) -> Vec<&dyn AssetStorage> {
        self.storages
            .iter()
            .map(|s| s as &dyn AssetStorage)
            .collect()
    }

    fn storage_for_ref(&self, asset_ref: &str) -> Option<&dyn AssetStorage> {
        let full_ref = normalize_ref(asset_ref);
        self.storages
            .iter()
            .find(|s| full_ref.starts_with(&s.base_url()))
            .map(|s| s as &dyn AssetStorage)
    }

    fn try_create_storage(&mut self, descriptor: &StorageDescriptor) -> Option<String> {
        if !descriptor.accepts_type(MOCK_STORAGE_TYPE) {
            return None;
        }
        let src_is_mock = descriptor
            .get("src")
            .map(|src| parse_ref(src).protocol.eq_ignore_ascii_case(MOCK_PROTOCOL))
            .unwrap_or(false);
        if descriptor.get("type").is_none() && !src_is_mock {
            return None;
        }
        let name = descriptor.get("name").unwrap_or("Mock");
        let writable = !descriptor.flag("readonly").unwrap_or(false);
        let name = self.add_storage(name, writable);
        if let Some(live) = descriptor.flag("liveupdate") {
            if let Some(storage) = self.storages.iter_mut().find(|s| s.name == name) {
                storage.live_update = live;
            }
        }
        Some(name)
    }

    fn remove_storage(&mut self, name: &str) -> bool {
        let before = self.storages.len();
        self.storages.retain(|s| !s.name.eq_ignore_ascii_case(name));
        self.storages.len() != before
    }

    fn delete_asset_from_storage(&mut self, asset_ref: &str) -> Result<()> {
        let full_ref = normalize_ref(asset_ref);
        if self.assets.remove(&full_ref).is_none() {
            return Err(CinderError::Storage(format!(
                "Asset '{}' not found in mock storage",
                full_ref
            )));
        }
        self.deleted.push(full_ref);
        Ok(())
    }

    fn upload_asset(&mut self, request: UploadRequest) -> Result<()> {
        let storage = self.storage_by_name(&request.storage).ok_or_else(|| {
            CinderError::Storage(format!("Unknown storage '{}'", request.storage))
        })?;
        if !storage.writable {
            return Err(CinderError::Upload(format!(
                "Storage '{}' is read-only",
                storage.name
            )));
        }
        self.uploads.push(request);
        Ok(())
    }

    fn update(&mut self, _dt: f64) -> Vec<ProviderEvent> {
        let mut events = Vec::new();

        // Uploads first, so a download queued behind an upload sees the new bytes
        for upload in std::mem::take(&mut self.uploads) {
            let Some(storage) = self.storage_by_name(&upload.storage) else {
                events.push(ProviderEvent::UploadFailed {
                    upload: upload.upload,
                    reason: format!("Storage '{}' was removed", upload.storage),
                });
                continue;
            };
            let asset_ref = normalize_ref(&storage.full_asset_url(&upload.asset_name));
            self.assets.insert(asset_ref, upload.data);
            events.push(ProviderEvent::UploadCompleted {
                upload: upload.upload,
            });
        }

        let (held, ready): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|r| self.held.contains(&r.asset_ref));
        self.pending = held;
        for request in ready {
            events.push(self.complete_download(&request));
        }

        for asset_ref in self.deleted.drain(..) {
            events.push(ProviderEvent::DeletedFromStorage { asset_ref });
        }

        events
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::UploadId;

    fn request(id: u64, asset_ref: &str) -> TransferRequest {
        TransferRequest {
            transfer: TransferId(id),
            asset_ref: normalize_ref(asset_ref),
            asset_type: String::new(),
            cached: None,
        }
    }

    #[test]
    fn test_mock_valid_refs() {
        let mut provider = MockAssetProvider::new();
        provider.insert("plain.bin", b"x".to_vec());
        assert!(provider.is_valid_ref("mock://store/a.bin", ""));
        assert!(provider.is_valid_ref("plain.bin", ""));
        assert!(!provider.is_valid_ref("http://host/a.bin", ""));
    }

    #[test]
    fn test_mock_completes_on_update() {
        let mut provider = MockAssetProvider::new();
        provider.insert("mock://store/a.bin", b"hello".to_vec());
        provider.request_asset(request(1, "mock://store/a.bin")).unwrap();
        assert_eq!(provider.request_count("mock://store/a.bin"), 1);

        let events = provider.update(0.0);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProviderEvent::TransferCompleted(done) => {
                assert_eq!(done.transfer, TransferId(1));
                assert_eq!(done.data, b"hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(provider.update(0.0).is_empty());
    }

    #[test]
    fn test_mock_hold_and_fail() {
        let mut provider = MockAssetProvider::new();
        provider.insert("mock://store/a.bin", b"a".to_vec());
        provider.hold("mock://store/a.bin");
        provider.fail_next("mock://store/missing.bin", "boom");
        provider.request_asset(request(1, "mock://store/a.bin")).unwrap();
        provider.request_asset(request(2, "mock://store/missing.bin")).unwrap();

        let events = provider.update(0.0);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ProviderEvent::TransferFailed { reason, .. } if reason == "boom"
        ));
        assert_eq!(provider.pending_count(), 1);

        provider.release("mock://store/a.bin");
        let events = provider.update(0.0);
        assert!(matches!(events[0], ProviderEvent::TransferCompleted(_)));
    }

    #[test]
    fn test_mock_upload_lands_in_storage() {
        let mut provider = MockAssetProvider::new();
        let storage = provider.add_storage("Store", true);
        provider
            .upload_asset(UploadRequest {
                upload: UploadId(1),
                storage,
                asset_name: "new.bin".into(),
                data: b"up".to_vec(),
            })
            .unwrap();
        let events = provider.update(0.0);
        assert!(matches!(events[0], ProviderEvent::UploadCompleted { .. }));
        assert_eq!(provider.contents("mock://store/new.bin"), Some(&b"up"[..]));
    }

    #[test]
    fn test_mock_readonly_storage_rejects_upload() {
        let mut provider = MockAssetProvider::new();
        let storage = provider.add_storage("Archive", false);
        let result = provider.upload_asset(UploadRequest {
            upload: UploadId(1),
            storage,
            asset_name: "x.bin".into(),
            data: b"x".to_vec(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_mock_storage_from_descriptor() {
        let mut provider = MockAssetProvider::new();
        let desc = StorageDescriptor::parse("type=MockAssetStorage;name=Remote;readonly=true").unwrap();
        let name = provider.try_create_storage(&desc).unwrap();
        assert_eq!(name, "Remote");
        let storage = provider.storage_for_ref("mock://remote/a.bin").unwrap();
        assert!(!storage.writable());

        let other = StorageDescriptor::parse("src=/tmp/assets").unwrap();
        assert!(provider.try_create_storage(&other).is_none());
    }
}
