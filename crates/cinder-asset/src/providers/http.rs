//! HTTP provider
//!
//! Downloads `http://` and `https://` refs on a background worker thread so
//! `update()` never blocks on the network. Requests are handed to the worker
//! over a channel and finished transfers are drained from a second one.
//! Cached copies are revalidated with If-Modified-Since; a 304 answer is
//! served from the cached file. Uploads use PUT and deletes use DELETE
//! against the storage's base URL.

use crate::asset::DiskSourceKind;
use crate::cache::CacheMetadata;
use crate::provider::*;
use crate::refs::{guarantee_trailing_slash, parse_ref, RefKind};
use crate::storage::{AssetStorage, StorageDescriptor};
use crate::transfer::TransferId;
use cinder_core::{CinderError, ContentHash, Result};
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

pub const HTTP_STORAGE_TYPE: &str = "HttpAssetStorage";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_MAX_REQUESTS_PER_UPDATE: usize = 8;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Remote directory reachable over HTTP
#[derive(Debug, Clone)]
pub struct HttpAssetStorage {
    name: String,
    base_url: String,
    writable: bool,
    live_update: bool,
}

impl AssetStorage for HttpAssetStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_type(&self) -> &str {
        HTTP_STORAGE_TYPE
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    fn full_asset_url(&self, local_name: &str) -> String {
        format!(
            "{}{}",
            guarantee_trailing_slash(&self.base_url),
            local_name.trim_start_matches('/')
        )
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn live_update(&self) -> bool {
        self.live_update
    }

    fn serialize(&self) -> String {
        format!(
            "type={};name={};src={};readonly={};liveupdate={}",
            HTTP_STORAGE_TYPE, self.name, self.base_url, !self.writable, self.live_update
        )
    }
}

/// Settings for [`HttpAssetProvider`]
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub max_retries: usize,
    /// Downloads handed to the worker per `update()`; the rest wait for
    /// the next tick
    pub max_requests_per_update: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            max_requests_per_update: DEFAULT_MAX_REQUESTS_PER_UPDATE,
        }
    }
}

/// Work item for the worker thread
enum HttpJob {
    Download {
        request: TransferRequest,
        storage: Option<String>,
    },
    Upload {
        request: UploadRequest,
        url: String,
    },
    Delete {
        url: String,
    },
}

impl HttpJob {
    /// Event reported when the job cannot reach the worker at all
    fn failed(self, reason: &str) -> Option<ProviderEvent> {
        match self {
            HttpJob::Download { request, .. } => Some(ProviderEvent::TransferFailed {
                transfer: request.transfer,
                reason: reason.to_string(),
            }),
            HttpJob::Upload { request, .. } => Some(ProviderEvent::UploadFailed {
                upload: request.upload,
                reason: reason.to_string(),
            }),
            HttpJob::Delete { url } => {
                log::error!("DELETE {} dropped: {}", url, reason);
                None
            }
        }
    }
}

/// Performs the blocking ureq calls. Lives on the worker thread.
struct HttpWorker {
    agent: ureq::Agent,
    max_retries: usize,
}

impl HttpWorker {
    fn new(settings: &HttpSettings) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(settings.timeout))
            .build();
        Self {
            agent: config.into(),
            max_retries: settings.max_retries.max(1),
        }
    }

    /// Serve jobs until the provider drops its end of either channel
    fn run(self, jobs: Receiver<HttpJob>, results: Sender<ProviderEvent>) {
        for job in jobs {
            let event = match job {
                HttpJob::Download { request, storage } => Some(self.download(&request, storage)),
                HttpJob::Upload { request, url } => Some(self.upload(&request, &url)),
                HttpJob::Delete { url } => self.delete(&url),
            };
            if let Some(event) = event {
                if results.send(event).is_err() {
                    break;
                }
            }
        }
        log::debug!("HTTP worker stopped");
    }

    /// Delay before retrying after `error`, or `None` when the error is
    /// final. Transport failures and overload statuses back off
    /// exponentially.
    fn retry_delay(&self, error: &ureq::Error, attempt: usize) -> Option<Duration> {
        if attempt + 1 >= self.max_retries {
            return None;
        }
        let transient = match error {
            ureq::Error::Timeout(_)
            | ureq::Error::Io(_)
            | ureq::Error::ConnectionFailed
            | ureq::Error::HostNotFound => true,
            ureq::Error::StatusCode(code) => matches!(code, 429 | 500 | 502 | 503 | 504),
            _ => false,
        };
        transient.then(|| Duration::from_millis(RETRY_BASE_DELAY_MS.saturating_mul(1u64 << attempt)))
    }

    fn download(&self, request: &TransferRequest, storage: Option<String>) -> ProviderEvent {
        log::debug!("GET {}", request.asset_ref);
        let if_modified_since = request
            .cached
            .as_ref()
            .and_then(|c| c.metadata.last_modified.clone());

        let mut attempt = 0;
        let response = loop {
            let mut builder = self.agent.get(&request.asset_ref);
            if let Some(since) = &if_modified_since {
                builder = builder.header("If-Modified-Since", since);
            }
            match builder.call() {
                Ok(response) => break response,
                Err(e) => match self.retry_delay(&e, attempt) {
                    Some(delay) => {
                        log::debug!("GET {} failed ({}), retrying in {:?}", request.asset_ref, e, delay);
                        std::thread::sleep(delay);
                        attempt += 1;
                    }
                    None => {
                        return ProviderEvent::TransferFailed {
                            transfer: request.transfer,
                            reason: format!("HTTP request failed: {}", e),
                        }
                    }
                },
            }
        };

        if response.status().as_u16() == 304 {
            return not_modified(request, storage);
        }
        let last_modified = response
            .headers()
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let mut reader = response.into_body().into_reader();
        let mut data = Vec::new();
        if let Err(e) = std::io::Read::read_to_end(&mut reader, &mut data) {
            return ProviderEvent::TransferFailed {
                transfer: request.transfer,
                reason: format!("Failed to read response body: {}", e),
            };
        }
        let digest = ContentHash::from_bytes(&data).to_prefixed_hex();
        let mut done = CompletedTransfer::with_data(request.transfer, data);
        done.storage = storage;
        done.cache_metadata = Some(CacheMetadata {
            valid: true,
            last_modified,
            digest: Some(digest),
        });
        ProviderEvent::TransferCompleted(done)
    }

    fn upload(&self, request: &UploadRequest, url: &str) -> ProviderEvent {
        match self.agent.put(url).send(&request.data[..]) {
            Ok(_) => ProviderEvent::UploadCompleted {
                upload: request.upload,
            },
            Err(e) => ProviderEvent::UploadFailed {
                upload: request.upload,
                reason: format!("PUT {} failed: {}", url, e),
            },
        }
    }

    fn delete(&self, url: &str) -> Option<ProviderEvent> {
        match self.agent.delete(url).call() {
            Ok(_) => Some(ProviderEvent::DeletedFromStorage {
                asset_ref: url.to_string(),
            }),
            Err(e) => {
                log::error!("DELETE {} failed: {}", url, e);
                None
            }
        }
    }
}

/// 304: the cached copy is still current
fn not_modified(request: &TransferRequest, storage: Option<String>) -> ProviderEvent {
    let Some(cached) = &request.cached else {
        return ProviderEvent::TransferFailed {
            transfer: request.transfer,
            reason: "Server answered 304 without a cached copy".to_string(),
        };
    };
    match std::fs::read(&cached.path) {
        Ok(data) => {
            log::debug!("{} not modified, using cached copy", request.asset_ref);
            let mut done = CompletedTransfer::with_data(request.transfer, data);
            done.caching_allowed = false;
            done.disk_source = Some(cached.path.clone());
            done.disk_source_kind = DiskSourceKind::Cached;
            done.storage = storage;
            ProviderEvent::TransferCompleted(done)
        }
        Err(e) => ProviderEvent::TransferFailed {
            transfer: request.transfer,
            reason: format!("Failed to read cached copy {}: {}", cached.path.display(), e),
        },
    }
}

/// Channel ends held by the provider once the worker is running
struct WorkerHandle {
    jobs: Sender<HttpJob>,
    results: Receiver<ProviderEvent>,
}

/// Provider for assets served over HTTP
pub struct HttpAssetProvider {
    storages: Vec<HttpAssetStorage>,
    pending_downloads: VecDeque<TransferRequest>,
    /// Downloads handed to the worker and not yet reported back
    in_flight: HashSet<TransferId>,
    /// In-flight downloads whose results are discarded on arrival
    aborted: HashSet<TransferId>,
    /// Uploads and deletes waiting for the next `update()`
    queued_jobs: Vec<HttpJob>,
    settings: HttpSettings,
    worker: Option<WorkerHandle>,
}

impl Default for HttpAssetProvider {
    fn default() -> Self {
        Self::new(HttpSettings::default())
    }
}

impl HttpAssetProvider {
    pub fn new(settings: HttpSettings) -> Self {
        Self {
            storages: Vec::new(),
            pending_downloads: VecDeque::new(),
            in_flight: HashSet::new(),
            aborted: HashSet::new(),
            queued_jobs: Vec::new(),
            settings,
            worker: None,
        }
    }

    /// Add a storage rooted at `base_url`. A taken name gets a numeric suffix.
    pub fn add_storage(&mut self, base_url: &str, name: &str, writable: bool, live_update: bool) -> String {
        let taken: Vec<&str> = self.storages.iter().map(|s| s.name.as_str()).collect();
        let base = if name.trim().is_empty() { "Web" } else { name.trim() };
        let name = unique_storage_name(base, &taken);
        log::info!("Added HTTP storage '{}' at {}", name, base_url);
        self.storages.push(HttpAssetStorage {
            name: name.clone(),
            base_url: guarantee_trailing_slash(&parse_ref(base_url).full_ref),
            writable,
            live_update,
        });
        name
    }

    /// Downloads not yet finished, queued or running on the worker
    pub fn pending_count(&self) -> usize {
        self.pending_downloads.len() + self.in_flight.len() - self.aborted.len()
    }

    fn storage_index(&self, name: &str) -> Option<usize> {
        self.storages
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn storage_name_for(&self, url: &str) -> Option<String> {
        self.storages
            .iter()
            .find(|s| url.starts_with(&s.base_url))
            .map(|s| s.name.clone())
    }

    /// Start the worker on first use
    fn ensure_worker(&mut self) -> Result<&WorkerHandle> {
        if self.worker.is_none() {
            let (job_tx, job_rx) = mpsc::channel();
            let (result_tx, result_rx) = mpsc::channel();
            let worker = HttpWorker::new(&self.settings);
            std::thread::Builder::new()
                .name("cinder-http".to_string())
                .spawn(move || worker.run(job_rx, result_tx))?;
            log::debug!("HTTP worker started");
            self.worker = Some(WorkerHandle {
                jobs: job_tx,
                results: result_rx,
            });
        }
        self.worker
            .as_ref()
            .ok_or_else(|| CinderError::Transfer("HTTP worker unavailable".to_string()))
    }

    /// Hand `job` to the worker. If the worker cannot take it, the job and
    /// every download still running on the worker fail instead.
    fn dispatch(&mut self, job: HttpJob) -> Vec<ProviderEvent> {
        let sent = match self.ensure_worker() {
            Ok(handle) => handle.jobs.send(job).map_err(|e| e.0),
            Err(e) => {
                log::error!("{}", e);
                Err(job)
            }
        };
        let Err(job) = sent else {
            return Vec::new();
        };

        const REASON: &str = "HTTP worker is not running";
        self.worker = None;
        let mut events: Vec<ProviderEvent> = self
            .in_flight
            .drain()
            .filter(|t| !self.aborted.contains(t))
            .map(|transfer| ProviderEvent::TransferFailed {
                transfer,
                reason: REASON.to_string(),
            })
            .collect();
        self.aborted.clear();
        events.extend(job.failed(REASON));
        events
    }

    /// Finished jobs reported by the worker since the last call
    fn drain_results(&mut self) -> Vec<ProviderEvent> {
        let Some(handle) = &self.worker else {
            return Vec::new();
        };
        let mut events = Vec::new();
        while let Ok(event) = handle.results.try_recv() {
            if let ProviderEvent::TransferCompleted(CompletedTransfer { transfer, .. })
            | ProviderEvent::TransferFailed { transfer, .. } = &event
            {
                self.in_flight.remove(transfer);
                if self.aborted.remove(transfer) {
                    log::debug!("Discarding result of aborted transfer {}", transfer);
                    continue;
                }
            }
            events.push(event);
        }
        events
    }
}

impl AssetProvider for HttpAssetProvider {
    fn name(&self) -> &str {
        "Http"
    }

    fn is_valid_ref(&self, asset_ref: &str, _asset_type: &str) -> bool {
        let parsed = parse_ref(asset_ref);
        parsed.kind == RefKind::ExternalUrl
            && (parsed.protocol.eq_ignore_ascii_case("http")
                || parsed.protocol.eq_ignore_ascii_case("https"))
    }

    fn request_asset(&mut self, request: TransferRequest) -> Result<()> {
        if !self.is_valid_ref(&request.asset_ref, &request.asset_type) {
            return Err(CinderError::Transfer(format!(
                "Not an HTTP ref: {}",
                request.asset_ref
            )));
        }
        self.pending_downloads.push_back(request);
        Ok(())
    }

    fn abort_transfer(&mut self, transfer: TransferId) -> bool {
        let before = self.pending_downloads.len();
        self.pending_downloads.retain(|r| r.transfer != transfer);
        if self.pending_downloads.len() != before {
            return true;
        }
        self.in_flight.contains(&transfer) && self.aborted.insert(transfer)
    }

    fn storages(&self) -> Vec<&dyn AssetStorage> {
        self.storages
            .iter()
            .map(|s| s as &dyn AssetStorage)
            .collect()
    }

    fn storage_for_ref(&self, asset_ref: &str) -> Option<&dyn AssetStorage> {
        let full_ref = parse_ref(asset_ref).full_ref;
        self.storages
            .iter()
            .find(|s| full_ref.starts_with(&s.base_url))
            .map(|s| s as &dyn AssetStorage)
    }

    fn try_create_storage(&mut self, descriptor: &StorageDescriptor) -> Option<String> {
        if !descriptor.accepts_type(HTTP_STORAGE_TYPE) {
            return None;
        }
        let src = descriptor.get("src")?;
        if !self.is_valid_ref(src, "") {
            return None;
        }
        Some(self.add_storage(
            src,
            descriptor.get("name").unwrap_or(""),
            !descriptor.flag("readonly").unwrap_or(false),
            descriptor.flag("liveupdate").unwrap_or(false),
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
        let storage = self.storage_for_ref(asset_ref).ok_or_else(|| {
            CinderError::Storage(format!("No HTTP storage contains '{}'", asset_ref))
        })?;
        if !storage.writable() {
            return Err(CinderError::Storage(format!(
                "Storage '{}' is read-only",
                storage.name()
            )));
        }
        self.queued_jobs.push(HttpJob::Delete {
            url: parse_ref(asset_ref).full_ref,
        });
        Ok(())
    }

    fn upload_asset(&mut self, request: UploadRequest) -> Result<()> {
        let idx = self.storage_index(&request.storage).ok_or_else(|| {
            CinderError::Storage(format!("Unknown storage '{}'", request.storage))
        })?;
        let storage = &self.storages[idx];
        if !storage.writable {
            return Err(CinderError::Upload(format!(
                "Storage '{}' is read-only",
                storage.name
            )));
        }
        let url = storage.full_asset_url(&request.asset_name);
        self.queued_jobs.push(HttpJob::Upload { request, url });
        Ok(())
    }

    fn update(&mut self, _dt: f64) -> Vec<ProviderEvent> {
        let mut events = self.drain_results();

        for job in std::mem::take(&mut self.queued_jobs) {
            events.extend(self.dispatch(job));
        }

        let limit = self.settings.max_requests_per_update.max(1);
        for _ in 0..limit {
            let Some(request) = self.pending_downloads.pop_front() else {
                break;
            };
            let transfer = request.transfer;
            let storage = self.storage_name_for(&request.asset_ref);
            let failed = self.dispatch(HttpJob::Download { request, storage });
            if failed.is_empty() {
                self.in_flight.insert(transfer);
            }
            events.extend(failed);
        }

        events
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
