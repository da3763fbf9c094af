//! Pluggable URL canonicalization.
//!
//! Maps a client-presented URL to the canonical upstream URL, and derives
//! the local cache key (a relative path, `<host>/<path>`) from it. Per
//! `spec.md` §8, canonicalization must be idempotent: `C(C(u)) == C(u)`.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

pub trait UrlCanonicalizer: Send + Sync {
    /// Returns the canonical upstream URL for a client-presented path (the
    /// portion of the request URI before `/info/refs` or `/git-upload-pack`).
    fn canonicalize(&self, client_path: &str) -> Result<String>;

    /// Derives the local cache key (relative to the cache root) from a
    /// canonical upstream URL. Must reject path traversal and any other
    /// component that doesn't round-trip safely through `Path::join`.
    fn cache_key(&self, canonical_upstream: &str) -> Result<PathBuf> {
        let url = canonical_upstream
            .strip_prefix("https://")
            .or_else(|| canonical_upstream.strip_prefix("http://"))
            .ok_or_else(|| Error::InvalidArgument("upstream URL missing scheme".into()))?;

        let mut parts = url.splitn(2, '/');
        let host = parts.next().filter(|h| !h.is_empty());
        let path = parts.next().unwrap_or("");

        let host = host.ok_or_else(|| Error::InvalidArgument("upstream URL missing host".into()))?;

        let mut key = PathBuf::new();
        for component in [Path::new(host), Path::new(path)] {
            for comp in component.components() {
                match comp {
                    Component::Normal(c) => key.push(c),
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "disallowed path component: {other:?}"
                        )))
                    }
                }
            }
        }
        Ok(key)
    }
}

/// Treats the client-presented path as `<host>/<path>` of the upstream
/// itself, under a fixed `https://` scheme — i.e. a request for
/// `/example.com/a/b/info/refs` is proxying `https://example.com/a/b`. This
/// is the default for a single proxy fronting many distinct upstream hosts
/// (as the teacher crate's own `repo.rs` does); deployments fronting one
/// fixed upstream, or doing other host/path rewriting, supply their own.
pub struct IdentityCanonicalizer;

impl UrlCanonicalizer for IdentityCanonicalizer {
    fn canonicalize(&self, client_path: &str) -> Result<String> {
        if client_path.starts_with("https://") || client_path.starts_with("http://") {
            return Ok(client_path.to_string());
        }

        let trimmed = client_path.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(Error::InvalidArgument("empty repository path".into()));
        }
        Ok(format!("https://{trimmed}"))
    }
}
