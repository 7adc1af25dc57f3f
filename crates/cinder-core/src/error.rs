//! Error types for Cinder

use thiserror::Error;

/// The main error type for Cinder operations
#[derive(Debug, Error)]
pub enum CinderError {
    #[error("Invalid asset ref: {0}")]
    InvalidRef(String),

    #[error("No provider found for asset ref: {0}")]
    ProviderNotFound(String),

    #[error("No asset type factory for type: {0}")]
    FactoryMissing(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Failed to deserialize asset: {0}")]
    Deserialize(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(String),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(String),
}

/// Result type alias for Cinder operations
pub type Result<T> = std::result::Result<T, CinderError>;

impl From<toml::de::Error> for CinderError {
    fn from(err: toml::de::Error) -> Self {
        CinderError::Toml(err.to_string())
    }
}

impl From<toml::ser::Error> for CinderError {
    fn from(err: toml::ser::Error) -> Self {
        CinderError::TomlSerialize(err.to_string())
    }
}
