//! Object-storage key layout and the manifest format (`spec.md` §4.6).
//!
//! Bundles live at `<cache key>/<12-digit-seconds>`; manifests (the index of
//! "which bundle is latest for which repository") live at
//! `goblet-repository-manifests/<manifest name>/<12-digit-seconds>`. Callers
//! talk to `object_store::ObjectStore` directly — there's no wrapper trait
//! here, since the crate's own `InMemory` store is already a perfectly good
//! test double.

use std::path::{Path as StdPath, PathBuf};

use object_store::path::Path as StorePath;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MANIFEST_PREFIX: &str = "goblet-repository-manifests";

/// One repository's entry in a manifest: enough to recover it without
/// consulting the registry first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub upstream_url: String,
    pub cache_key: String,
    pub bundle_seconds: u64,
}

pub type Manifest = Vec<ManifestEntry>;

fn seconds_component(seconds: u64) -> String {
    format!("{seconds:012}")
}

pub fn bundle_key(cache_key: &StdPath, seconds: u64) -> StorePath {
    StorePath::from_iter(cache_key.components().map(|c| c.as_os_str().to_string_lossy().into_owned()))
        .child(seconds_component(seconds))
}

pub fn manifest_key(manifest_name: &str, seconds: u64) -> StorePath {
    StorePath::from(MANIFEST_PREFIX)
        .child(manifest_name)
        .child(seconds_component(seconds))
}

pub fn cache_key_prefix(cache_key: &StdPath) -> StorePath {
    StorePath::from_iter(cache_key.components().map(|c| c.as_os_str().to_string_lossy().into_owned()))
}

/// The known source-repository bug this fixes: a bundle listing that picks
/// up *any* object under a repository's prefix (including partially-written
/// or non-bundle objects) as if it were a timestamped snapshot. A location
/// only counts as a bundle if its final path segment is non-empty and
/// parses as a plain `u64`.
pub fn parse_bundle_seconds(location: &StorePath) -> Option<u64> {
    let base = location.filename()?;
    if base.is_empty() {
        return None;
    }
    base.parse::<u64>().ok()
}

pub fn manifest_seconds(location: &StorePath) -> Option<u64> {
    parse_bundle_seconds(location)
}

pub fn cache_key_from_str(s: &str) -> Result<PathBuf> {
    let path = PathBuf::from(s);
    if path.components().count() == 0 {
        return Err(Error::Internal(anyhow::anyhow!("empty cache key in manifest entry")));
    }
    Ok(path)
}
