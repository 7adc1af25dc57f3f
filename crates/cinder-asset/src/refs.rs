//! Asset reference parsing and normalization
//!
//! Every ref string is classified into one of five kinds and broken into
//! its parts. The canonical `full_ref` produced here is the key used by the
//! registry, the disk cache and the dependency graph, so two spellings of
//! the same ref always land on the same entry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Syntactic kind of an asset ref
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RefKind {
    /// `/unix/path/a.png` or `C:/windows/path/a.png`
    LocalPath,
    /// `local://a.png` or `file://...`
    LocalUrl,
    /// `http://server/a.png`, `www.server/a.png`, `proto://...`
    ExternalUrl,
    /// `storage:a.png`
    NamedStorage,
    /// `a.png`, `dir/a.png`, `../a.png`
    #[default]
    RelativePath,
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefKind::LocalPath => "LocalPath",
            RefKind::LocalUrl => "LocalUrl",
            RefKind::ExternalUrl => "ExternalUrl",
            RefKind::NamedStorage => "NamedStorage",
            RefKind::RelativePath => "RelativePath",
        };
        f.write_str(s)
    }
}

/// A ref string paired with the asset type it should be loaded as.
///
/// An empty `asset_type` means the type is inferred from the filename.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetReference {
    #[serde(rename = "ref")]
    pub asset_ref: String,
    #[serde(rename = "type", default)]
    pub asset_type: String,
}

impl AssetReference {
    pub fn new(asset_ref: impl Into<String>) -> Self {
        Self {
            asset_ref: asset_ref.into(),
            asset_type: String::new(),
        }
    }

    pub fn with_type(asset_ref: impl Into<String>, asset_type: impl Into<String>) -> Self {
        Self {
            asset_ref: asset_ref.into(),
            asset_type: asset_type.into(),
        }
    }
}

/// All the parts of a parsed ref
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedRef {
    pub kind: RefKind,
    /// Scheme as written (`http`, `LOCAL`), or `http` for bare `www.` refs
    pub protocol: String,
    /// Storage name for `NamedStorage` refs, trimmed
    pub storage: String,
    /// Scheme or storage prefix followed by `path`
    pub protocol_path: String,
    /// Everything after the prefix, sub-asset suffix included
    pub path_filename_sub_asset: String,
    /// Everything after the prefix, sub-asset suffix removed
    pub path_filename: String,
    /// Directory part, with a trailing slash unless empty
    pub path: String,
    pub filename: String,
    pub sub_asset: String,
    /// Canonical form: lowercase scheme or storage prefix + path + `#sub`
    pub full_ref: String,
    pub full_ref_no_sub_asset: String,
}

/// Classify and split an asset ref. Never fails; unrecognized input
/// degrades to [`RefKind::RelativePath`].
pub fn parse_ref(input: &str) -> ParsedRef {
    let normalized = input.trim().replace('\\', "/");
    let mut parsed = ParsedRef::default();

    let mut prefix = String::new();
    let mut full_ref_prefix = String::new();
    let full_path: &str;

    if let Some(idx) = normalized.find("://") {
        let protocol = &normalized[..idx];
        parsed.kind = if protocol.eq_ignore_ascii_case("local") || protocol.eq_ignore_ascii_case("file") {
            RefKind::LocalUrl
        } else {
            RefKind::ExternalUrl
        };
        parsed.protocol = protocol.to_string();
        prefix = format!("{}://", protocol);
        full_ref_prefix = format!("{}://", protocol.to_lowercase());
        full_path = &normalized[idx + 3..];
    } else if starts_with_ignore_case(&normalized, "www.") {
        parsed.kind = RefKind::ExternalUrl;
        parsed.protocol = "http".to_string();
        prefix = "http://".to_string();
        full_ref_prefix = prefix.clone();
        full_path = &normalized;
    } else if normalized.starts_with('/') || is_drive_path(&normalized) {
        parsed.kind = RefKind::LocalPath;
        full_path = &normalized;
    } else if let Some(idx) = normalized.find(':') {
        parsed.kind = RefKind::NamedStorage;
        parsed.storage = normalized[..idx].trim().to_string();
        prefix = format!("{}:", parsed.storage);
        full_ref_prefix = prefix.clone();
        full_path = &normalized[idx + 1..];
    } else {
        parsed.kind = RefKind::RelativePath;
        full_path = &normalized;
    }

    let full_path = full_path.trim();
    parsed.path_filename_sub_asset = full_path.to_string();

    let (main_part, sub_asset) = split_sub_asset(full_path);
    parsed.sub_asset = sub_asset;
    parsed.path_filename = main_part.to_string();

    let pf = parsed.path_filename.as_str();
    let split = match (pf.rfind('.'), pf.rfind('/')) {
        (Some(dot), Some(slash)) if dot > slash => slash + 1,
        (Some(_), None) => 0,
        _ => pf.len(),
    };
    parsed.path = guarantee_trailing_slash(&pf[..split]);
    parsed.filename = pf[split..].to_string();
    parsed.protocol_path = format!("{}{}", prefix, parsed.path);

    parsed.full_ref = format!("{}{}", full_ref_prefix, pf);
    if !parsed.sub_asset.is_empty() {
        if parsed.sub_asset.contains(' ') {
            parsed.full_ref.push_str(&format!("#\"{}\"", parsed.sub_asset));
        } else {
            parsed.full_ref.push('#');
            parsed.full_ref.push_str(&parsed.sub_asset);
        }
    }
    parsed.full_ref_no_sub_asset = format!(
        "{}{}",
        guarantee_trailing_slash(&parsed.protocol_path),
        parsed.filename
    );

    parsed
}

/// Split `asset.ext, "sub asset"` or `asset.ext#sub` at the first separator.
/// Quotes are accepted loosely and never survive into the sub-asset name,
/// so the quoted output form always parses back to the same name.
fn split_sub_asset(full_path: &str) -> (&str, String) {
    let Some(idx) = full_path.find(|c: char| c == '#' || c == ',') else {
        return (full_path, String::new());
    };
    let main = full_path[..idx].trim_end();
    let rest = full_path[idx + 1..].replace('"', "");
    (main, rest.trim().to_string())
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn is_drive_path(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

/// Canonical full ref of `input`
pub fn normalize_ref(input: &str) -> String {
    parse_ref(input).full_ref
}

/// Filename part of a ref, e.g. `tex.png` for `http://host/dir/tex.png`
pub fn extract_filename(input: &str) -> String {
    parse_ref(input).filename
}

/// Append `/` unless the string is empty or already ends in a separator.
pub fn guarantee_trailing_slash(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() || s.ends_with('/') || s.ends_with('\\') {
        s.to_string()
    } else {
        format!("{}/", s)
    }
}

/// Collapse `.`, `..` and repeated slashes in a `/`-separated path.
///
/// Leading `..` segments that cannot be resolved are kept, and a leading
/// `/` survives. A trailing slash is dropped.
pub fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ if absolute => {}
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Map a ref to a string usable as a single file name.
///
/// Each of `/ \ : * ? " ' < > |` becomes `_`.
pub fn sanitize_ref(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '\'' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}
