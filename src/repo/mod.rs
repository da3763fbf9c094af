//! The managed-repository layer (`spec.md` §4.2–§4.3): one mirror per
//! upstream, mediated by a reader/writer lock, plus the registry that hands
//! out (and lazily creates) managed-repository handles.

pub mod git;
pub mod registry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::RwLock;

use crate::auth::TokenSource;
use crate::error::{Error, Result};
use crate::protocol::parser::Command;
use crate::telemetry::{Outcome, Telemetry};

pub use git::GitOps;

/// Ref name -> commit hash, as returned by an upstream `ls-refs`.
pub type RefSnapshot = HashMap<String, String>;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One managed mirror. Readers (`has_any_update`, `has_all_wants`,
/// `serve_fetch_local`) may run concurrently with each other but never with
/// a writer (`fetch_upstream`, `recover_from_bundle`); `last_update` only
/// ever moves forward, on a successful fetch.
pub struct ManagedRepository<G: GitOps = git::GitCli> {
    local_path: PathBuf,
    upstream_url: String,
    lock: RwLock<()>,
    last_update: AtomicU64,
    git: Arc<G>,
}

impl<G: GitOps> ManagedRepository<G> {
    pub fn new(local_path: PathBuf, upstream_url: String, git: Arc<G>) -> Self {
        Self {
            local_path,
            upstream_url,
            lock: RwLock::new(()),
            last_update: AtomicU64::new(0),
            git,
        }
    }

    pub fn local_path(&self) -> &std::path::Path {
        &self.local_path
    }

    pub fn upstream_url(&self) -> &str {
        &self.upstream_url
    }

    /// Exposed `pub(crate)` only so `Registry::open_or_create` can take the
    /// write lock before publishing a freshly created handle; see there.
    pub(crate) fn rw(&self) -> &RwLock<()> {
        &self.lock
    }

    /// Seconds since epoch of the last successful `fetch_upstream`, or `0`
    /// if none has happened yet in this process (a repo recovered from a
    /// bundle but never fetched still reads as `0`: it only advances on a
    /// successful *fetch*, matching the invariant in `spec.md` §3).
    pub fn last_update(&self) -> u64 {
        self.last_update.load(Ordering::Acquire)
    }

    /// Forwards `command` (an `ls-refs` command, but this doesn't assume
    /// that) to upstream and returns the raw response body. Doesn't touch
    /// the local mirror, so it needs no lock.
    pub async fn ls_refs_upstream(
        &self,
        command: &Command,
        tokens: &dyn TokenSource,
    ) -> Result<Bytes> {
        let token = tokens.token().await?;
        self.git
            .ls_refs_upstream(&self.upstream_url, &token, command.raw.clone())
            .await
    }

    /// True if any ref in `refs` either doesn't exist locally or resolves
    /// locally to a different hash.
    pub async fn has_any_update(&self, refs: &RefSnapshot) -> Result<bool> {
        let _guard = self.lock.read().await;
        for (name, hash) in refs {
            match self.git.resolve_ref(&self.local_path, name).await? {
                Some(local_hash) if &local_hash == hash => continue,
                _ => return Ok(true),
            }
        }
        Ok(false)
    }

    /// True only if every requested object hash is present and every
    /// requested ref name resolves, locally.
    pub async fn has_all_wants(&self, hashes: &[String], refnames: &[String]) -> Result<bool> {
        let _guard = self.lock.read().await;
        for hash in hashes {
            if !self.git.object_exists(&self.local_path, hash).await? {
                return Ok(false);
            }
        }
        for refname in refnames {
            if self.git.resolve_ref(&self.local_path, refname).await?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs the local equivalent of `git upload-pack --stateless-rpc`
    /// against the mirror, with `command`'s raw bytes as its request.
    pub async fn serve_fetch_local(&self, command: &Command) -> Result<Bytes> {
        let _guard = self.lock.read().await;
        self.git
            .serve_upload_pack(&self.local_path, command.raw.clone())
            .await
    }

    /// Fetches from upstream under the writer lock. First-ever fetch (empty
    /// mirror) runs in two phases; later fetches run a single mirror fetch.
    /// A fresh token is obtained immediately before each underlying `git`
    /// invocation. `last_update` only advances on success.
    pub async fn fetch_upstream(
        &self,
        tokens: &dyn TokenSource,
        telemetry: &Telemetry,
    ) -> Result<()> {
        let _guard = self.lock.write().await;
        let start = std::time::Instant::now();
        let start_secs = now_secs();
        telemetry.long_running.started("fetchUpstream", &self.upstream_url);

        let result = self.do_fetch(tokens, telemetry).await;

        let outcome = if result.is_ok() {
            self.last_update.store(start_secs, Ordering::Release);
            Outcome::Success
        } else {
            Outcome::Failure
        };
        telemetry
            .long_running
            .finished("fetchUpstream", &self.upstream_url, outcome, start.elapsed());

        result
    }

    async fn do_fetch(&self, tokens: &dyn TokenSource, telemetry: &Telemetry) -> Result<()> {
        if !self.git.has_any_ref(&self.local_path).await? {
            let token = tokens.token().await?;
            let lines = self.git.fetch_heads_and_changes(&self.local_path, &token).await?;
            self.report_progress(telemetry, lines);
        }
        let token = tokens.token().await?;
        let lines = self.git.fetch_mirror(&self.local_path, &token).await?;
        self.report_progress(telemetry, lines);
        Ok(())
    }

    fn report_progress(&self, telemetry: &Telemetry, lines: Vec<String>) {
        for line in lines {
            telemetry.long_running.progress("fetchUpstream", &self.upstream_url, &line);
        }
    }

    pub async fn write_bundle(&self) -> Result<Bytes> {
        let _guard = self.lock.read().await;
        self.git.write_bundle(&self.local_path).await
    }

    pub async fn recover_from_bundle(&self, bundle_path: &std::path::Path) -> Result<()> {
        let _guard = self.lock.write().await;
        self.git.recover_from_bundle(&self.local_path, bundle_path).await
    }
}

/// A background-fetch timeout bound, applied to fetches spawned fire-and-
/// forget from an `ls-refs` update (`spec.md` §9 open question: such
/// fetches must not run unbounded).
pub const DEFAULT_BACKGROUND_FETCH_TIMEOUT: Duration = Duration::from_secs(600);

/// Maps `InvalidArgument`-worthy want/want-ref parsing into the shared
/// `Error` type, used by the protocol handler.
pub fn invalid_want(line: &str) -> Error {
    Error::InvalidArgument(format!("unparseable want line: {line:?}"))
}
