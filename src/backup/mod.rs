//! Backup subsystem (`spec.md` §4.6): snapshots every managed mirror to
//! object storage on an interval, and recovers mirrors from the latest
//! available snapshot before the proxy starts serving requests.
//!
//! Bundle and manifest I/O goes straight through `object_store::ObjectStore`
//! — see `store` for the key layout.

pub mod store;

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::StreamExt;
use object_store::ObjectStore;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::repo::git::GitOps;
use crate::repo::registry::Registry;
use crate::telemetry::{Measurement, Telemetry};
use store::{Manifest, ManifestEntry};

pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(3600);
const MANIFEST_RETENTION: Duration = Duration::from_secs(24 * 3600);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Runs recovery once, then snapshots on `interval` until `cancel` fires.
/// Meant to be `tokio::spawn`ed once at startup alongside the HTTP server.
pub async fn run<G: GitOps>(
    object_store: Arc<dyn ObjectStore>,
    registry: Arc<Registry<G>>,
    cache_dir: PathBuf,
    manifest_name: String,
    interval: Duration,
    telemetry: Arc<Telemetry>,
    cancel: CancellationToken,
) {
    if let Err(err) = recover(&object_store, &registry, &cache_dir).await {
        telemetry.errors.report(&err);
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; the recovery pass above covers startup

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let start = std::time::Instant::now();
                if let Err(err) = snapshot(&object_store, &registry, &cache_dir, &manifest_name).await {
                    telemetry.errors.report(&err);
                }
                telemetry
                    .metrics
                    .record(Measurement::SnapshotCycleDuration(start.elapsed()));
            }
        }
    }
}

/// Lists every manifest, unions them by upstream URL keeping the most recent
/// bundle for each, and recovers each mirror from its latest bundle. A
/// mirror that fails to recover is logged and skipped, not fatal: it will
/// simply start as an empty mirror and populate itself on first fetch.
pub async fn recover<G: GitOps>(
    object_store: &Arc<dyn ObjectStore>,
    registry: &Registry<G>,
    cache_dir: &std::path::Path,
) -> Result<()> {
    let entries = union_latest_manifests(object_store).await?;

    for entry in entries {
        let cache_key = store::cache_key_from_str(&entry.cache_key)?;
        let local_path = cache_dir.join(&cache_key);

        let bundle_location = store::bundle_key(&cache_key, entry.bundle_seconds);
        let bytes = match object_store.get(&bundle_location).await {
            Ok(result) => match result.bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(upstream = %entry.upstream_url, error = %err, "skipping recovery: failed to read bundle");
                    continue;
                }
            },
            Err(err) => {
                tracing::warn!(upstream = %entry.upstream_url, error = %err, "skipping recovery: bundle missing");
                continue;
            }
        };

        let repo = match registry
            .open_or_create(local_path, entry.upstream_url.clone())
            .await
        {
            Ok(repo) => repo,
            Err(err) => {
                tracing::warn!(upstream = %entry.upstream_url, error = %err, "skipping recovery: failed to open mirror");
                continue;
            }
        };

        if let Err(err) = recover_one(&repo, bytes).await {
            tracing::warn!(upstream = %entry.upstream_url, error = %err, "skipping recovery: bundle fetch failed");
        }
    }

    Ok(())
}

async fn recover_one<G: GitOps>(
    repo: &crate::repo::ManagedRepository<G>,
    bundle: Bytes,
) -> Result<()> {
    let mut file = tempfile::NamedTempFile::new().map_err(|e| Error::Internal(e.into()))?;
    file.write_all(&bundle).map_err(|e| Error::Internal(e.into()))?;
    repo.recover_from_bundle(file.path()).await
}

async fn union_latest_manifests(object_store: &Arc<dyn ObjectStore>) -> Result<Vec<ManifestEntry>> {
    let prefix = object_store::path::Path::from(store::MANIFEST_PREFIX);
    let mut manifest_names = HashMap::new(); // manifest name -> latest (seconds, location)

    let mut listing = object_store.list(Some(&prefix));
    while let Some(meta) = listing.next().await {
        let meta = meta.map_err(|e| Error::Internal(anyhow::anyhow!("listing manifests failed: {e}")))?;
        let Some(seconds) = store::manifest_seconds(&meta.location) else {
            continue;
        };
        let Some(name) = manifest_name_of(&meta.location) else {
            continue;
        };
        manifest_names
            .entry(name)
            .and_modify(|(best_secs, best_loc): &mut (u64, object_store::path::Path)| {
                if seconds > *best_secs {
                    *best_secs = seconds;
                    *best_loc = meta.location.clone();
                }
            })
            .or_insert((seconds, meta.location.clone()));
    }

    let mut latest_by_upstream: HashMap<String, ManifestEntry> = HashMap::new();
    for (_, location) in manifest_names.into_values() {
        let manifest = read_manifest(object_store, &location).await?;
        for entry in manifest {
            latest_by_upstream
                .entry(entry.upstream_url.clone())
                .and_modify(|existing| {
                    if entry.bundle_seconds > existing.bundle_seconds {
                        *existing = entry.clone();
                    }
                })
                .or_insert(entry);
        }
    }

    Ok(latest_by_upstream.into_values().collect())
}

fn manifest_name_of(location: &object_store::path::Path) -> Option<String> {
    let parts: Vec<_> = location.parts().collect();
    // `<MANIFEST_PREFIX>/<name>/<seconds>`
    parts.get(parts.len().checked_sub(2)?).map(|p| p.as_ref().to_string())
}

async fn read_manifest(
    object_store: &Arc<dyn ObjectStore>,
    location: &object_store::path::Path,
) -> Result<Manifest> {
    let bytes = object_store
        .get(location)
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("reading manifest {location} failed: {e}")))?
        .bytes()
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("reading manifest {location} body failed: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Internal(anyhow::anyhow!("manifest {location} is not valid JSON: {e}")))
}

/// Writes a bundle for every registered mirror whose last fetch is newer
/// than its latest existing bundle, garbage-collects all but the newest
/// bundle per mirror, writes a fresh manifest listing every mirror's latest
/// bundle (written or reused), and garbage-collects manifests older than 24
/// hours.
pub async fn snapshot<G: GitOps>(
    object_store: &Arc<dyn ObjectStore>,
    registry: &Registry<G>,
    cache_dir: &std::path::Path,
    manifest_name: &str,
) -> Result<()> {
    let mut manifest = Manifest::new();

    for repo in registry.all().await {
        let cache_key = repo.local_path().strip_prefix(cache_dir).unwrap_or_else(|_| repo.local_path());
        let last_update = repo.last_update();
        let existing = latest_bundle_seconds(object_store, cache_key).await?;

        // Bundles are named by the repository's own last-update timestamp,
        // not the snapshot cycle's wall-clock time; if the newest existing
        // bundle is already at least that new, nothing has changed since it
        // was written and this cycle skips the write entirely.
        let bundle_seconds = match existing {
            Some(seconds) if seconds >= last_update => seconds,
            _ => {
                let bundle = repo.write_bundle().await?;
                let location = store::bundle_key(cache_key, last_update);
                object_store
                    .put(&location, bundle.into())
                    .await
                    .map_err(|e| Error::Internal(anyhow::anyhow!("writing bundle {location} failed: {e}")))?;
                gc_old_bundles(object_store, cache_key, last_update).await?;
                last_update
            }
        };

        manifest.push(ManifestEntry {
            upstream_url: repo.upstream_url().to_string(),
            cache_key: cache_key.to_string_lossy().into_owned(),
            bundle_seconds,
        });
    }

    let seconds = now_secs();
    let manifest_location = store::manifest_key(manifest_name, seconds);
    let body = serde_json::to_vec(&manifest)
        .map_err(|e| Error::Internal(anyhow::anyhow!("encoding manifest failed: {e}")))?;
    object_store
        .put(&manifest_location, body.into())
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("writing manifest failed: {e}")))?;

    gc_old_manifests(object_store, manifest_name, seconds).await?;

    Ok(())
}

/// The newest bundle timestamp already stored for `cache_key`, if any.
async fn latest_bundle_seconds(object_store: &Arc<dyn ObjectStore>, cache_key: &std::path::Path) -> Result<Option<u64>> {
    let prefix = store::cache_key_prefix(cache_key);
    let mut listing = object_store.list(Some(&prefix));
    let mut latest = None;
    while let Some(meta) = listing.next().await {
        let meta = meta.map_err(|e| Error::Internal(anyhow::anyhow!("listing bundles failed: {e}")))?;
        let Some(seconds) = store::parse_bundle_seconds(&meta.location) else {
            continue;
        };
        latest = Some(latest.map_or(seconds, |l: u64| l.max(seconds)));
    }
    Ok(latest)
}

async fn gc_old_bundles(
    object_store: &Arc<dyn ObjectStore>,
    cache_key: &std::path::Path,
    keep_seconds: u64,
) -> Result<()> {
    let prefix = store::cache_key_prefix(cache_key);
    let mut listing = object_store.list(Some(&prefix));
    while let Some(meta) = listing.next().await {
        let meta = meta.map_err(|e| Error::Internal(anyhow::anyhow!("listing bundles failed: {e}")))?;
        let Some(seconds) = store::parse_bundle_seconds(&meta.location) else {
            continue;
        };
        if seconds != keep_seconds {
            object_store
                .delete(&meta.location)
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!("deleting old bundle {} failed: {e}", meta.location)))?;
        }
    }
    Ok(())
}

async fn gc_old_manifests(
    object_store: &Arc<dyn ObjectStore>,
    manifest_name: &str,
    now: u64,
) -> Result<()> {
    let prefix = object_store::path::Path::from(store::MANIFEST_PREFIX).child(manifest_name);
    let mut listing = object_store.list(Some(&prefix));
    while let Some(meta) = listing.next().await {
        let meta = meta.map_err(|e| Error::Internal(anyhow::anyhow!("listing manifests failed: {e}")))?;
        let Some(seconds) = store::manifest_seconds(&meta.location) else {
            continue;
        };
        if now.saturating_sub(seconds) > MANIFEST_RETENTION.as_secs() {
            object_store.delete(&meta.location).await.map_err(|e| {
                Error::Internal(anyhow::anyhow!("deleting old manifest {} failed: {e}", meta.location))
            })?;
        }
    }
    Ok(())
}
