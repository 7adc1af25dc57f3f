//! Layered configuration system
//!
//! Config is loaded with three layers of precedence (highest wins):
//! 1. Environment variables: `CINDER_CACHE_DIR`, `CINDER_NO_WATCH`,
//!    `CINDER_HTTP_TIMEOUT_SECS`
//! 2. Project-local: `.cinder/config.toml`
//! 3. Global: `~/.cinder/config.toml`

use cinder_core::{CinderError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Disk cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

/// File watching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// HTTP provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_max_requests_per_update")]
    pub max_requests_per_update: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            max_requests_per_update: default_max_requests_per_update(),
        }
    }
}

/// Local provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_true")]
    pub accept_unknown_sources: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            accept_unknown_sources: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> usize {
    3
}
fn default_max_requests_per_update() -> usize {
    8
}

/// Top-level config file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfigFile {
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub watch: Option<WatchConfig>,
    #[serde(default)]
    pub http: Option<HttpConfig>,
    #[serde(default)]
    pub local: Option<LocalConfig>,
    /// Storage descriptors registered at startup
    #[serde(default)]
    pub storages: Vec<String>,
}

/// Resolved configuration with environment variable overrides applied
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub cache: CacheConfig,
    pub watch: WatchConfig,
    pub http: HttpConfig,
    pub local: LocalConfig,
    pub storages: Vec<String>,
}

impl RegistryConfig {
    /// Load config with layered precedence: global < project < env vars
    pub fn load() -> Result<Self> {
        let mut config = RegistryConfig::default();

        // Layer 1: Global config (~/.cinder/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                let global = Self::load_file(&global_path)?;
                config.merge(global);
            }
        }

        // Layer 2: Project-local config (.cinder/config.toml)
        let local_path = PathBuf::from(".cinder/config.toml");
        if local_path.exists() {
            let local = Self::load_file(&local_path)?;
            config.merge(local);
        }

        // Layer 3: Environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Load config from a specific file path only (for testing)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let mut config = RegistryConfig::default();
        config.merge(Self::load_file(path)?);
        config.apply_env_overrides();
        Ok(config)
    }

    /// Cache root: the configured dir, else the platform cache dir
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache.dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .map(|d| d.join("cinder").join("assetcache"))
            .unwrap_or_else(|| PathBuf::from(".cinder/assetcache"))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.watch.debounce_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }

    fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".cinder").join("config.toml"))
    }

    fn load_file(path: &Path) -> Result<RegistryConfigFile> {
        let content = std::fs::read_to_string(path)?;
        let config: RegistryConfigFile = toml::from_str(&content).map_err(|e| {
            CinderError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Sections present in `overlay` replace ours; storages accumulate.
    fn merge(&mut self, overlay: RegistryConfigFile) {
        if let Some(cache) = overlay.cache {
            if cache.dir.is_none() {
                let dir = self.cache.dir.take();
                self.cache = CacheConfig { dir, ..cache };
            } else {
                self.cache = cache;
            }
        }
        if let Some(watch) = overlay.watch {
            self.watch = watch;
        }
        if let Some(http) = overlay.http {
            self.http = http;
        }
        if let Some(local) = overlay.local {
            self.local = local;
        }
        for storage in overlay.storages {
            if !self.storages.contains(&storage) {
                self.storages.push(storage);
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CINDER_CACHE_DIR") {
            if !dir.trim().is_empty() {
                self.cache.dir = Some(PathBuf::from(dir.trim()));
            }
        }
        if let Ok(value) = std::env::var("CINDER_NO_WATCH") {
            if crate::storage::parse_bool(&value) {
                self.watch.enabled = false;
            }
        }
        if let Ok(value) = std::env::var("CINDER_HTTP_TIMEOUT_SECS") {
            match value.trim().parse() {
                Ok(secs) => self.http.timeout_secs = secs,
                Err(_) => log::warn!("Ignoring invalid CINDER_HTTP_TIMEOUT_SECS '{}'", value),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_config(content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cinder_config_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_config_from_file() {
        let config_str = r#"
storages = ["type=LocalAssetStorage;name=Data;src=assets;default=true"]

[cache]
enabled = false

[watch]
debounce_ms = 250

[http]
max_requests_per_update = 2

[local]
accept_unknown_sources = false
"#;
        let path = temp_config(config_str);
        let config = RegistryConfig::load_from_file(&path).unwrap();

        assert!(!config.cache.enabled);
        assert!(config.watch.enabled);
        assert_eq!(config.debounce(), Duration::from_millis(250));
        assert_eq!(config.http.max_requests_per_update, 2);
        assert_eq!(config.http.max_retries, 3);
        assert!(!config.local.accept_unknown_sources);
        assert_eq!(config.storages.len(), 1);

        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert!(config.cache.enabled);
        assert!(config.watch.enabled);
        assert_eq!(config.watch.debounce_ms, 500);
        assert_eq!(config.http_timeout(), Duration::from_secs(30));
        assert!(config.local.accept_unknown_sources);
        assert!(config.storages.is_empty());
    }

    #[test]
    fn test_explicit_cache_dir() {
        let path = temp_config("[cache]\ndir = \"/srv/cinder-cache\"\n");
        let config = RegistryConfig::load_from_file(&path).unwrap();
        if std::env::var("CINDER_CACHE_DIR").is_err() {
            assert_eq!(config.cache_dir(), PathBuf::from("/srv/cinder-cache"));
        }
        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_merge_keeps_earlier_cache_dir() {
        let mut config = RegistryConfig::default();
        config.cache.dir = Some(PathBuf::from("/global/cache"));
        let overlay: RegistryConfigFile = toml::from_str("[cache]\nenabled = false\n").unwrap();
        config.merge(overlay);
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.dir, Some(PathBuf::from("/global/cache")));
    }

    #[test]
    fn test_invalid_config_is_error() {
        let path = temp_config("[watch]\ndebounce_ms = \"soon\"\n");
        assert!(RegistryConfig::load_from_file(&path).is_err());
        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(path.parent().unwrap()).ok();
    }
}
