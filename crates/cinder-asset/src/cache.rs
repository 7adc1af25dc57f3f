//! On-disk asset cache
//!
//! Layout under the cache root:
//! - `data/<sanitized ref>` holds the payload bytes
//! - `metadata/<sanitized ref>.metadata` holds a TOML [`CacheMetadata`]
//!
//! Subdirectories are created on first write.

use crate::refs::{parse_ref, sanitize_ref, RefKind};
use cinder_core::{CinderError, ContentHash, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const DATA_DIR: &str = "data";
const METADATA_DIR: &str = "metadata";
const METADATA_EXT: &str = "metadata";

/// Integrity and validity state stored beside a cached payload.
///
/// Providers decide what goes in here; the cache itself only checks
/// `valid` and, for network entries, `digest`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    #[serde(default)]
    pub valid: bool,
    /// HTTP `Last-Modified` value as received
    #[serde(default)]
    pub last_modified: Option<String>,
    /// `sha256:<hex>` of the payload
    #[serde(default)]
    pub digest: Option<String>,
}

impl CacheMetadata {
    /// Valid metadata carrying the digest of `data`
    pub fn for_data(data: &[u8]) -> Self {
        Self {
            valid: true,
            last_modified: None,
            digest: Some(ContentHash::from_bytes(data).to_prefixed_hex()),
        }
    }
}

/// A cache write that has been prepared but not committed
#[derive(Debug)]
pub struct PendingWrite {
    key: String,
    temp_path: PathBuf,
}

impl PendingWrite {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Disk cache keyed by sanitized asset ref
pub struct DiskCache {
    root: PathBuf,
    pending_writes: HashSet<String>,
}

impl DiskCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            pending_writes: HashSet::new(),
        }
    }

    pub fn cache_directory(&self) -> &Path {
        &self.root
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.data_dir())?;
        fs::create_dir_all(self.metadata_dir())?;
        Ok(())
    }

    fn metadata_path(&self, asset_ref: &str) -> PathBuf {
        self.metadata_dir()
            .join(format!("{}.{}", sanitize_ref(asset_ref), METADATA_EXT))
    }

    /// Path where the payload for `asset_ref` lives, whether or not it
    /// has been written yet.
    pub fn disk_source_by_ref(&self, asset_ref: &str) -> PathBuf {
        self.data_dir().join(sanitize_ref(asset_ref))
    }

    /// Write `data` and a digest-carrying metadata file, returning the
    /// payload path.
    pub fn put(&mut self, asset_ref: &str, data: &[u8]) -> Result<PathBuf> {
        self.store(asset_ref, data, &CacheMetadata::for_data(data))
    }

    /// Write `data` with caller-supplied metadata.
    pub fn store(&mut self, asset_ref: &str, data: &[u8], metadata: &CacheMetadata) -> Result<PathBuf> {
        let pending = self.begin_write(asset_ref)?;
        self.commit_write(pending, data, metadata)?
            .ok_or_else(|| CinderError::Cache(format!("Cache write for {} was cancelled", asset_ref)))
    }

    /// Reserve a write for `asset_ref`. A [`DiskCache::delete`] of the same
    /// ref before [`DiskCache::commit_write`] cancels it.
    pub fn begin_write(&mut self, asset_ref: &str) -> Result<PendingWrite> {
        self.ensure_dirs()?;
        let key = sanitize_ref(asset_ref);
        let temp_path = self.data_dir().join(format!("{}.part", key));
        fs::File::create(&temp_path)?;
        self.pending_writes.insert(key.clone());
        Ok(PendingWrite { key, temp_path })
    }

    /// Finish a write. Returns `Ok(None)` if the write was cancelled.
    pub fn commit_write(
        &mut self,
        pending: PendingWrite,
        data: &[u8],
        metadata: &CacheMetadata,
    ) -> Result<Option<PathBuf>> {
        if !self.pending_writes.remove(&pending.key) {
            fs::remove_file(&pending.temp_path).ok();
            return Ok(None);
        }

        fs::write(&pending.temp_path, data)?;
        let dest = self.data_dir().join(&pending.key);
        fs::rename(&pending.temp_path, &dest)?;

        let meta_path = self
            .metadata_dir()
            .join(format!("{}.{}", pending.key, METADATA_EXT));
        fs::write(meta_path, toml::to_string_pretty(metadata)?)?;

        Ok(Some(dest))
    }

    /// Payload path for `asset_ref` if it is cached.
    ///
    /// `http`/`https` refs are never returned here: their entries must be
    /// revalidated by the provider, which reaches them through
    /// [`DiskCache::disk_source_by_ref`] and [`DiskCache::metadata`].
    pub fn get(&self, asset_ref: &str) -> Option<PathBuf> {
        if is_http_ref(asset_ref) {
            return None;
        }
        let path = self.disk_source_by_ref(asset_ref);
        path.is_file().then_some(path)
    }

    /// Read the payload bytes for a cached non-http ref
    pub fn load(&self, asset_ref: &str) -> Option<Vec<u8>> {
        self.get(asset_ref).and_then(|path| fs::read(path).ok())
    }

    /// Metadata for `asset_ref`, or `None` if missing, invalid, or (for
    /// network entries) if the stored payload no longer matches its digest.
    pub fn metadata(&self, asset_ref: &str) -> Option<CacheMetadata> {
        let content = fs::read_to_string(self.metadata_path(asset_ref)).ok()?;
        let metadata: CacheMetadata = match toml::from_str(&content) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("Discarding unreadable cache metadata for {}: {}", asset_ref, e);
                return None;
            }
        };
        if !metadata.valid {
            return None;
        }

        if is_http_ref(asset_ref) {
            if let Some(digest) = &metadata.digest {
                let expected = ContentHash::from_prefixed_hex(digest)?;
                let data = fs::read(self.disk_source_by_ref(asset_ref)).ok()?;
                if !expected.matches(&data) {
                    log::debug!("Cached payload for {} failed its digest check", asset_ref);
                    return None;
                }
            }
        }

        Some(metadata)
    }

    /// Overwrite the metadata of an existing entry
    pub fn set_metadata(&self, asset_ref: &str, metadata: &CacheMetadata) -> Result<()> {
        self.ensure_dirs()?;
        fs::write(self.metadata_path(asset_ref), toml::to_string_pretty(metadata)?)?;
        Ok(())
    }

    /// `Last-Modified` of a valid entry
    pub fn last_modified(&self, asset_ref: &str) -> Option<String> {
        self.metadata(asset_ref).and_then(|m| m.last_modified)
    }

    /// Remove payload and metadata for `asset_ref` and cancel any pending
    /// write to it. Returns true if anything was removed or cancelled.
    pub fn delete(&mut self, asset_ref: &str) -> bool {
        let key = sanitize_ref(asset_ref);
        let cancelled = self.pending_writes.remove(&key);
        if cancelled {
            fs::remove_file(self.data_dir().join(format!("{}.part", key))).ok();
        }
        let data_removed = fs::remove_file(self.disk_source_by_ref(asset_ref)).is_ok();
        let meta_removed = fs::remove_file(self.metadata_path(asset_ref)).is_ok();
        cancelled || data_removed || meta_removed
    }

    /// Remove every file in `data/` and `metadata/`. Subdirectories are
    /// left alone.
    pub fn clear(&mut self) -> Result<()> {
        self.pending_writes.clear();
        for dir in [self.data_dir(), self.metadata_dir()] {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }

    /// Sanitized names of all cached payloads
    pub fn entries(&self) -> Result<Vec<String>> {
        let dir = self.data_dir();
        let mut names = Vec::new();
        if !dir.exists() {
            return Ok(names);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_file() && !name.ends_with(".part") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn is_http_ref(asset_ref: &str) -> bool {
    let parsed = parse_ref(asset_ref);
    parsed.kind == RefKind::ExternalUrl
        && (parsed.protocol.eq_ignore_ascii_case("http") || parsed.protocol.eq_ignore_ascii_case("https"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("cinder_cache_test_{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_put_and_load() {
        let dir = temp_dir();
        let mut cache = DiskCache::new(&dir);
        assert!(!dir.exists());

        let path = cache.put("local://a.mesh", b"mesh bytes").unwrap();
        assert_eq!(path, dir.join("data").join("local___a.mesh"));
        assert!(dir.join("metadata").join("local___a.mesh.metadata").exists());
        assert_eq!(cache.get("local://a.mesh"), Some(path));
        assert_eq!(cache.load("local://a.mesh").unwrap(), b"mesh bytes");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_http_refs_excluded_from_get() {
        let dir = temp_dir();
        let mut cache = DiskCache::new(&dir);

        let path = cache.put("http://server.com/a.png", b"png").unwrap();
        assert!(path.exists());
        assert!(cache.get("http://server.com/a.png").is_none());
        assert!(cache.get("HTTPS://server.com/a.png").is_none());
        assert_eq!(cache.disk_source_by_ref("http://server.com/a.png"), path);
        assert!(cache.metadata("http://server.com/a.png").is_some());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupted_http_payload_is_a_miss() {
        let dir = temp_dir();
        let mut cache = DiskCache::new(&dir);
        let asset_ref = "http://server.com/tex.png";

        let metadata = CacheMetadata {
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
            ..CacheMetadata::for_data(b"good bytes")
        };
        let path = cache.store(asset_ref, b"good bytes", &metadata).unwrap();
        assert_eq!(cache.metadata(asset_ref), Some(metadata.clone()));
        assert_eq!(
            cache.last_modified(asset_ref).as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );

        fs::write(&path, b"evil bytes").unwrap();
        assert!(cache.metadata(asset_ref).is_none());
        assert!(cache.last_modified(asset_ref).is_none());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_metadata_is_a_miss() {
        let dir = temp_dir();
        let mut cache = DiskCache::new(&dir);
        cache.put("local://a.bin", b"x").unwrap();
        cache
            .set_metadata("local://a.bin", &CacheMetadata::default())
            .unwrap();
        assert!(cache.metadata("local://a.bin").is_none());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_delete_removes_both_files() {
        let dir = temp_dir();
        let mut cache = DiskCache::new(&dir);
        cache.put("local://gone.bin", b"x").unwrap();

        assert!(cache.delete("local://gone.bin"));
        assert!(cache.get("local://gone.bin").is_none());
        assert!(cache.metadata("local://gone.bin").is_none());
        assert!(!cache.delete("local://gone.bin"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_delete_cancels_pending_write() {
        let dir = temp_dir();
        let mut cache = DiskCache::new(&dir);

        let pending = cache.begin_write("local://late.bin").unwrap();
        assert_eq!(pending.key(), "local___late.bin");
        assert!(cache.delete("local://late.bin"));

        let committed = cache
            .commit_write(pending, b"late", &CacheMetadata::for_data(b"late"))
            .unwrap();
        assert!(committed.is_none());
        assert!(cache.get("local://late.bin").is_none());
        assert!(cache.entries().unwrap().is_empty());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_clear_is_not_recursive() {
        let dir = temp_dir();
        let mut cache = DiskCache::new(&dir);
        cache.put("local://a.bin", b"a").unwrap();
        cache.put("local://b.bin", b"b").unwrap();
        fs::create_dir_all(dir.join("data").join("nested")).unwrap();
        fs::write(dir.join("data").join("nested").join("keep.bin"), b"k").unwrap();

        assert_eq!(cache.entries().unwrap().len(), 2);
        cache.clear().unwrap();
        assert!(cache.entries().unwrap().is_empty());
        assert!(dir.join("data").join("nested").join("keep.bin").exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_clear_on_missing_root() {
        let mut cache = DiskCache::new(temp_dir());
        cache.clear().unwrap();
        assert!(cache.entries().unwrap().is_empty());
    }
}
