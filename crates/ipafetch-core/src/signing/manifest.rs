//! Manifest lookup inside an app archive
//!
//! The signature target is not a fixed path: the outermost `<Name>.app`
//! bundle carries `SC_Info/Manifest.plist`, whose `SinfPaths` array names
//! where the signature goes relative to the bundle root.

use crate::error::IpaError;
use std::io::Cursor;

/// Manifest location relative to an app bundle root
pub const MANIFEST_SUBPATH: &str = "SC_Info/Manifest.plist";

const BUNDLE_SUFFIX: &str = ".app";
const SINF_PATHS_KEY: &str = "SinfPaths";

/// Where the signature goes, as resolved from the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLocation {
    pub manifest_path: String,
    /// Bundle directory including the trailing slash, e.g. `Payload/Foo.app/`
    pub bundle_root: String,
    pub signature_path: String,
}

/// Pick the manifest entry among `names`
///
/// Nested bundles (extensions, watch apps) carry their own manifests; the
/// shortest path belongs to the outermost bundle and wins.
pub fn locate<'a, I>(names: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter(|name| bundle_root(name).is_some())
        .min_by_key(|name| name.len())
}

/// The bundle directory of a manifest path, with trailing slash
pub fn bundle_root(manifest_path: &str) -> Option<&str> {
    let root = manifest_path.strip_suffix(MANIFEST_SUBPATH)?;
    let bundle_dir = root.strip_suffix('/')?;
    let bundle_name = bundle_dir.rsplit('/').next()?;
    if bundle_name.len() > BUNDLE_SUFFIX.len() && bundle_name.ends_with(BUNDLE_SUFFIX) {
        Some(root)
    } else {
        None
    }
}

/// Read the signature target path out of a manifest's content
pub fn resolve(manifest_path: &str, manifest: &[u8]) -> Result<ManifestLocation, IpaError> {
    let root = bundle_root(manifest_path).ok_or_else(|| {
        IpaError::InvalidAppBundle(format!("{} is not inside an app bundle", manifest_path))
    })?;

    let value = plist::Value::from_reader(Cursor::new(manifest)).map_err(|e| {
        IpaError::InvalidSignature(format!("unreadable manifest {}: {}", manifest_path, e))
    })?;

    let sinf_path = value
        .as_dictionary()
        .and_then(|dict| dict.get(SINF_PATHS_KEY))
        .and_then(|paths| paths.as_array())
        .and_then(|paths| paths.first())
        .and_then(|path| path.as_string())
        .map(|path| path.trim_start_matches('/'))
        .filter(|path| !path.is_empty())
        .ok_or_else(|| {
            IpaError::InvalidSignature(format!("{} has no {} entry", manifest_path, SINF_PATHS_KEY))
        })?;

    if sinf_path.split('/').any(|segment| segment == "..") {
        return Err(IpaError::InvalidSignature(format!(
            "signature path {:?} escapes the bundle",
            sinf_path
        )));
    }

    Ok(ManifestLocation {
        manifest_path: manifest_path.to_string(),
        bundle_root: root.to_string(),
        signature_path: format!("{}{}", root, sinf_path),
    })
}
