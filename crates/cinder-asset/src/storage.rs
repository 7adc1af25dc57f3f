//! Asset storages and their `key=value;key=value` descriptors

use cinder_core::{CinderError, Result};
use std::collections::BTreeMap;
use std::fmt;

/// A named endpoint owned by a provider.
///
/// Storages turn local asset names into full refs and describe
/// themselves as a descriptor string that [`StorageDescriptor::parse`]
/// reads back.
pub trait AssetStorage: Send {
    fn name(&self) -> &str;

    /// Storage type tag, e.g. `LocalAssetStorage`
    fn storage_type(&self) -> &str;

    fn base_url(&self) -> String;

    /// Full ref of the asset `local_name` inside this storage
    fn full_asset_url(&self, local_name: &str) -> String;

    fn writable(&self) -> bool;

    /// Whether edits to assets loaded from this storage are reloaded
    fn live_update(&self) -> bool {
        false
    }

    /// Descriptor string that recreates this storage
    fn serialize(&self) -> String;
}

/// Kind of change reported for an asset inside a storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetChange {
    Create,
    Modify,
    Delete,
}

/// Parsed storage descriptor.
///
/// `type=LocalAssetStorage;name=Scene;src=/srv/assets;default=true`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageDescriptor {
    entries: BTreeMap<String, String>,
}

impl StorageDescriptor {
    /// Parse a descriptor string.
    ///
    /// A string with neither `;` nor `=` is shorthand for `src=<string>`.
    /// A key without a value is stored as `"1"`.
    pub fn parse(input: &str) -> Result<Self> {
        let mut s = input.trim();
        if let Some(stripped) = s.strip_suffix(';') {
            s = stripped;
        }

        let expanded;
        if !s.contains(';') && !s.contains('=') {
            expanded = format!("src={}", s);
            s = &expanded;
        }

        let mut entries = BTreeMap::new();
        for item in s.split(';').filter(|item| !item.is_empty()) {
            let parts: Vec<&str> = item.split('=').collect();
            let (key, value) = match parts.as_slice() {
                [key] => (*key, "1"),
                [key, value] => (*key, *value),
                _ => {
                    return Err(CinderError::Storage(format!(
                        "Failed to parse asset storage string \"{}\"",
                        item
                    )))
                }
            };
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Boolean value of `key`, if present
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).map(parse_bool)
    }

    /// True when the descriptor carries `default=true`
    pub fn is_default(&self) -> bool {
        self.flag("default").unwrap_or(false)
    }

    /// True when `type` is absent or matches `storage_type` ignoring case
    pub fn accepts_type(&self, storage_type: &str) -> bool {
        self.get("type")
            .map(|t| t.eq_ignore_ascii_case(storage_type))
            .unwrap_or(true)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for StorageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&joined.join(";"))
    }
}

/// Loose boolean parsing for descriptor values
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_descriptor() {
        let d = StorageDescriptor::parse("type=LocalAssetStorage;name=Scene;src=/srv/assets;default=true")
            .unwrap();
        assert_eq!(d.get("type"), Some("LocalAssetStorage"));
        assert_eq!(d.get("name"), Some("Scene"));
        assert_eq!(d.get("src"), Some("/srv/assets"));
        assert!(d.is_default());
        assert_eq!(d.len(), 4);
    }

    #[test]
    fn test_bare_string_is_src() {
        let d = StorageDescriptor::parse("  http://www.server.com/assets/ ").unwrap();
        assert_eq!(d.get("src"), Some("http://www.server.com/assets/"));
        assert!(!d.is_default());
    }

    #[test]
    fn test_trailing_semicolon_stripped() {
        let d = StorageDescriptor::parse("http://www.server.com/;").unwrap();
        assert_eq!(d.get("src"), Some("http://www.server.com/"));
    }

    #[test]
    fn test_key_without_value_is_one() {
        let d = StorageDescriptor::parse("src=/tmp;readonly").unwrap();
        assert_eq!(d.get("readonly"), Some("1"));
        assert_eq!(d.flag("readonly"), Some(true));
        assert_eq!(d.flag("liveupdate"), None);
    }

    #[test]
    fn test_too_many_equals_is_error() {
        let err = StorageDescriptor::parse("src=a=b;name=x").unwrap_err();
        assert!(matches!(err, CinderError::Storage(_)));
    }

    #[test]
    fn test_accepts_type() {
        let d = StorageDescriptor::parse("type=httpassetstorage;src=http://a/").unwrap();
        assert!(d.accepts_type("HttpAssetStorage"));
        assert!(!d.accepts_type("LocalAssetStorage"));
        assert!(StorageDescriptor::parse("src=/tmp").unwrap().accepts_type("LocalAssetStorage"));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("1"));
        assert!(parse_bool(" yes "));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn test_display_is_sorted_pairs() {
        let d = StorageDescriptor::parse("src=/tmp;name=A").unwrap();
        assert_eq!(d.to_string(), "name=A;src=/tmp");
    }
}
