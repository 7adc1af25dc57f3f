//! Asset bundles
//!
//! A bundle is a container fetched as a single file whose entries are
//! served as sub-assets, addressed as `<bundle ref>#<entry name>`. Bundles
//! are not assets: they have no dependencies and are not reloaded when
//! their source changes.

use cinder_core::{CinderError, Result};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

pub const ZIP_BUNDLE_TYPE: &str = "ZipBundle";

/// Parsed container contents
pub trait AssetBundle: Send {
    /// Parse the whole container from memory
    fn deserialize(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes of the entry called `name`, if present
    fn sub_asset_data(&self, name: &str) -> Option<&[u8]>;

    fn sub_asset_names(&self) -> Vec<String>;

    /// Release the parsed contents. Safe to call any number of times.
    fn unload(&mut self);
}

/// Creates empty bundles of one container type
pub trait AssetBundleTypeFactory: Send {
    fn bundle_type(&self) -> &str;

    /// Filename suffixes, including the dot, that identify this container
    fn extensions(&self) -> Vec<String>;

    fn create_bundle(&self) -> Box<dyn AssetBundle>;
}

/// Bundle type factories, looked up by type or by a ref's filename
#[derive(Default)]
pub struct BundleFactoryRegistry {
    factories: Vec<Box<dyn AssetBundleTypeFactory>>,
}

impl BundleFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the zip container registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ZipBundleFactory));
        registry
    }

    /// Add a factory. A second factory for the same type is refused.
    pub fn register(&mut self, factory: Box<dyn AssetBundleTypeFactory>) -> bool {
        if self.get(factory.bundle_type()).is_some() {
            log::warn!(
                "Bundle type factory for \"{}\" already registered",
                factory.bundle_type()
            );
            return false;
        }
        self.factories.push(factory);
        true
    }

    pub fn get(&self, bundle_type: &str) -> Option<&dyn AssetBundleTypeFactory> {
        self.factories
            .iter()
            .find(|f| f.bundle_type().eq_ignore_ascii_case(bundle_type.trim()))
            .map(|f| f.as_ref())
    }

    /// Factory whose extension matches the filename of `bundle_ref`. Any
    /// sub-asset part of the ref is ignored.
    pub fn for_ref(&self, bundle_ref: &str) -> Option<&dyn AssetBundleTypeFactory> {
        let filename = crate::refs::parse_ref(bundle_ref).filename.to_lowercase();
        if filename.is_empty() {
            return None;
        }
        self.factories
            .iter()
            .find(|f| {
                f.extensions()
                    .iter()
                    .any(|ext| filename.ends_with(&ext.to_lowercase()))
            })
            .map(|f| f.as_ref())
    }

    pub fn types(&self) -> Vec<&str> {
        self.factories.iter().map(|f| f.bundle_type()).collect()
    }
}

/// Zip archive, fully extracted into memory on load
#[derive(Debug, Default)]
pub struct ZipBundle {
    entries: BTreeMap<String, Vec<u8>>,
}

impl AssetBundle for ZipBundle {
    fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        let mut archive = zip::ZipArchive::new(Cursor::new(data))
            .map_err(|e| CinderError::Deserialize(format!("not a zip archive: {}", e)))?;

        let mut entries = BTreeMap::new();
        for index in 0..archive.len() {
            let mut file = archive
                .by_index(index)
                .map_err(|e| CinderError::Deserialize(format!("zip entry {}: {}", index, e)))?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().replace('\\', "/");
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            entries.insert(name, bytes);
        }

        log::debug!("Zip bundle holds {} entries", entries.len());
        self.entries = entries;
        Ok(())
    }

    fn sub_asset_data(&self, name: &str) -> Option<&[u8]> {
        let name = name.trim().trim_start_matches('/');
        self.entries
            .get(name)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|(entry, _)| entry.eq_ignore_ascii_case(name))
                    .map(|(_, data)| data)
            })
            .map(|data| data.as_slice())
    }

    fn sub_asset_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn unload(&mut self) {
        self.entries.clear();
    }
}

pub struct ZipBundleFactory;

impl AssetBundleTypeFactory for ZipBundleFactory {
    fn bundle_type(&self) -> &str {
        ZIP_BUNDLE_TYPE
    }

    fn extensions(&self) -> Vec<String> {
        vec![".zip".to_string()]
    }

    fn create_bundle(&self) -> Box<dyn AssetBundle> {
        Box::new(ZipBundle::default())
    }
}

/// Build a stored (uncompressed) zip archive in memory
#[cfg(test)]
pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;

    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_bundle_entries() {
        let data = zip_bytes(&[
            ("textures/", &b""[..]),
            ("textures/Wall.png", &b"png"[..]),
            ("scene.manifest", &b"textures/Wall.png\n"[..]),
        ]);
        let mut bundle = ZipBundle::default();
        bundle.deserialize(&data).unwrap();

        assert_eq!(
            bundle.sub_asset_names(),
            vec!["scene.manifest", "textures/Wall.png"]
        );
        assert_eq!(bundle.sub_asset_data("textures/Wall.png"), Some(&b"png"[..]));
        assert_eq!(bundle.sub_asset_data("TEXTURES/wall.png"), Some(&b"png"[..]));
        assert_eq!(bundle.sub_asset_data("missing.png"), None);

        bundle.unload();
        bundle.unload();
        assert!(bundle.sub_asset_names().is_empty());
    }

    #[test]
    fn test_zip_bundle_rejects_garbage() {
        let mut bundle = ZipBundle::default();
        let err = bundle.deserialize(b"definitely not a zip").unwrap_err();
        assert!(matches!(err, CinderError::Deserialize(_)));
    }

    #[test]
    fn test_factory_lookup() {
        let mut registry = BundleFactoryRegistry::with_builtins();
        assert!(registry.get("zipbundle").is_some());
        assert_eq!(
            registry.for_ref("http://host/Pack.ZIP#inner.png").map(|f| f.bundle_type()),
            Some(ZIP_BUNDLE_TYPE)
        );
        assert!(registry.for_ref("http://host/pack.tar").is_none());
        assert!(registry.for_ref("local://dir/").is_none());

        assert!(!registry.register(Box::new(ZipBundleFactory)));
        assert_eq!(registry.types(), vec![ZIP_BUNDLE_TYPE]);
    }
}
