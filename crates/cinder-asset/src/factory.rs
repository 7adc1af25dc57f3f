//! Asset type factories
//!
//! Factories are looked up by type name, ignoring case. A type can be
//! registered as [`FactoryEntry::Disabled`] to blacklist it: requests for
//! that type quietly produce nothing.

use crate::asset::AssetContent;
use crate::refs::{parse_ref, AssetReference};
use cinder_core::{CinderError, Result};
use std::any::Any;

pub const BINARY_TYPE: &str = "Binary";
pub const MANIFEST_TYPE: &str = "Manifest";

/// Creates empty content objects for one asset type
pub trait AssetTypeFactory: Send {
    fn asset_type(&self) -> &str;

    /// Filename suffixes (with the dot) that map to this type
    fn extensions(&self) -> Vec<String> {
        Vec::new()
    }

    fn create_content(&self, name: &str) -> Option<Box<dyn AssetContent>>;
}

pub enum FactoryEntry {
    Enabled(Box<dyn AssetTypeFactory>),
    Disabled {
        asset_type: String,
        extensions: Vec<String>,
    },
}

impl FactoryEntry {
    pub fn asset_type(&self) -> &str {
        match self {
            FactoryEntry::Enabled(factory) => factory.asset_type(),
            FactoryEntry::Disabled { asset_type, .. } => asset_type,
        }
    }

    pub fn extensions(&self) -> Vec<String> {
        match self {
            FactoryEntry::Enabled(factory) => factory.extensions(),
            FactoryEntry::Disabled { extensions, .. } => extensions.clone(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, FactoryEntry::Disabled { .. })
    }
}

/// Factories in registration order
pub struct FactoryRegistry {
    entries: Vec<FactoryEntry>,
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FactoryRegistry {
    /// A registry holding only the built-in `Binary` factory
    pub fn new() -> Self {
        let mut registry = Self {
            entries: Vec::new(),
        };
        registry.register(Box::new(BinaryFactory));
        registry
    }

    /// A registry with `Binary` and `Manifest`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ManifestFactory));
        registry
    }

    /// Register a factory. Returns false (and logs) if the type is taken.
    pub fn register(&mut self, factory: Box<dyn AssetTypeFactory>) -> bool {
        self.insert(FactoryEntry::Enabled(factory))
    }

    /// Blacklist a type. Refs ending in one of `extensions` infer to it.
    pub fn register_disabled(&mut self, asset_type: &str, extensions: &[&str]) -> bool {
        self.insert(FactoryEntry::Disabled {
            asset_type: asset_type.trim().to_string(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
        })
    }

    fn insert(&mut self, entry: FactoryEntry) -> bool {
        if self.get(entry.asset_type()).is_some() {
            log::warn!(
                "Asset type factory for '{}' already registered",
                entry.asset_type()
            );
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn get(&self, asset_type: &str) -> Option<&FactoryEntry> {
        let asset_type = asset_type.trim();
        self.entries
            .iter()
            .find(|e| e.asset_type().eq_ignore_ascii_case(asset_type))
    }

    pub fn is_disabled(&self, asset_type: &str) -> bool {
        self.get(asset_type).map(|e| e.is_disabled()).unwrap_or(false)
    }

    /// Empty content for `asset_type`.
    ///
    /// `Ok(None)` for a disabled type, `Err` for an unknown type or a
    /// factory that declined.
    pub fn create_content(&self, asset_type: &str, name: &str) -> Result<Option<Box<dyn AssetContent>>> {
        match self.get(asset_type) {
            Some(FactoryEntry::Enabled(factory)) => factory
                .create_content(name)
                .map(Some)
                .ok_or_else(|| {
                    CinderError::FactoryMissing(format!(
                        "factory for '{}' failed to create '{}'",
                        asset_type, name
                    ))
                }),
            Some(FactoryEntry::Disabled { .. }) => Ok(None),
            None => Err(CinderError::FactoryMissing(asset_type.to_string())),
        }
    }

    /// Infer the asset type of `asset_ref` from its filename (or its
    /// sub-asset name when present). Falls back to `Binary`.
    pub fn type_for_ref(&self, asset_ref: &str) -> String {
        let parsed = parse_ref(asset_ref);
        let filename = if parsed.sub_asset.is_empty() {
            parsed.filename
        } else {
            parsed.sub_asset
        };
        let filename = filename.trim().to_lowercase();

        for entry in &self.entries {
            if entry.asset_type() == BINARY_TYPE {
                continue;
            }
            if entry
                .extensions()
                .iter()
                .any(|ext| filename.ends_with(&ext.to_lowercase()))
            {
                return entry.asset_type().to_string();
            }
        }
        BINARY_TYPE.to_string()
    }

    /// Explicit type if set, otherwise inferred from the ref
    pub fn type_for_reference(&self, reference: &AssetReference) -> String {
        let explicit = reference.asset_type.trim();
        if explicit.is_empty() {
            self.type_for_ref(&reference.asset_ref)
        } else {
            explicit.to_string()
        }
    }

    pub fn types(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.asset_type()).collect()
    }
}

/// Raw bytes, no references
#[derive(Debug, Default)]
pub struct BinaryAsset {
    pub data: Vec<u8>,
}

impl AssetContent for BinaryAsset {
    fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        self.data = data.to_vec();
        Ok(())
    }

    fn unload(&mut self) {
        self.data = Vec::new();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct BinaryFactory;

impl AssetTypeFactory for BinaryFactory {
    fn asset_type(&self) -> &str {
        BINARY_TYPE
    }

    fn create_content(&self, _name: &str) -> Option<Box<dyn AssetContent>> {
        Some(Box::new(BinaryAsset::default()))
    }
}

/// A UTF-8 list of asset refs, one per line.
///
/// Blank lines and lines starting with `#` are ignored. A line may pin the
/// type with a trailing `as <Type>`:
///
/// ```text
/// # textures
/// wood.png
/// http://cdn.example.com/stone.png as Binary
/// ```
#[derive(Debug, Default)]
pub struct ManifestAsset {
    pub entries: Vec<AssetReference>,
}

impl AssetContent for ManifestAsset {
    fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(data)
            .map_err(|e| CinderError::Deserialize(format!("manifest is not UTF-8: {}", e)))?;

        self.entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| match line.rsplit_once(" as ") {
                Some((asset_ref, asset_type)) => {
                    AssetReference::with_type(asset_ref.trim(), asset_type.trim())
                }
                None => AssetReference::new(line),
            })
            .collect();
        Ok(())
    }

    fn references(&self) -> Vec<AssetReference> {
        self.entries.clone()
    }

    fn unload(&mut self) {
        self.entries.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct ManifestFactory;

impl AssetTypeFactory for ManifestFactory {
    fn asset_type(&self) -> &str {
        MANIFEST_TYPE
    }

    fn extensions(&self) -> Vec<String> {
        vec![".manifest".to_string()]
    }

    fn create_content(&self, _name: &str) -> Option<Box<dyn AssetContent>> {
        Some(Box::new(ManifestAsset::default()))
    }
}
