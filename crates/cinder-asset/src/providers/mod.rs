//! Provider registry
//!
//! Maps provider names to concrete implementations.

pub mod http;
pub mod local;
pub mod mock;

use crate::config::RegistryConfig;
use crate::provider::AssetProvider;
use cinder_core::{CinderError, Result};

/// Create a provider by name with configuration
pub fn create_provider(name: &str, config: &RegistryConfig) -> Result<Box<dyn AssetProvider>> {
    match name.to_ascii_lowercase().as_str() {
        "mock" => Ok(Box::new(mock::MockAssetProvider::new())),
        "local" => {
            let mut provider = local::LocalAssetProvider::new();
            provider.set_accept_unknown_sources(config.local.accept_unknown_sources);
            provider.set_watch(config.watch.enabled, config.debounce());
            Ok(Box::new(provider))
        }
        "http" => Ok(Box::new(http::HttpAssetProvider::new(http::HttpSettings {
            timeout: config.http_timeout(),
            max_retries: config.http.max_retries,
            max_requests_per_update: config.http.max_requests_per_update,
        }))),
        _ => Err(CinderError::ProviderNotFound(format!(
            "Unknown provider '{}'. Available: local, http, mock",
            name
        ))),
    }
}

/// Providers a registry built from config gets, in registration order
pub fn default_providers() -> Vec<&'static str> {
    vec!["local", "http"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_providers() {
        let config = RegistryConfig::default();
        assert_eq!(create_provider("local", &config).unwrap().name(), "Local");
        assert_eq!(create_provider("HTTP", &config).unwrap().name(), "Http");
        assert_eq!(create_provider("mock", &config).unwrap().name(), "Mock");
    }

    #[test]
    fn test_unknown_provider() {
        let config = RegistryConfig::default();
        assert!(create_provider("ftp", &config).is_err());
    }
}
