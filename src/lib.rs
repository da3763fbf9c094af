//! Goblet: a read-only caching proxy for the Git Smart HTTP protocol v2.
//!
//! `main.rs` is a thin CLI wrapper around [`start`]; everything else lives
//! here so it can also be driven from a test harness or an embedding binary.

pub mod auth;
pub mod backup;
pub mod error;
pub mod pktline;
pub mod protocol;
pub mod repo;
pub mod server;
pub mod telemetry;
pub mod urlmap;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authorizer, SharedSecretAuthorizer, StaticTokenSource, TokenSource};
use crate::error::{Error, Result};
use crate::repo::git::GitCli;
use crate::repo::registry::Registry;
use crate::server::AppState;
use crate::telemetry::Telemetry;
use crate::urlmap::{IdentityCanonicalizer, UrlCanonicalizer};

#[derive(Parser, Debug)]
#[command(name = "goblet", about = "A read-only caching proxy for git fetches")]
pub struct Options {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Directory holding the bare mirrors.
    #[arg(long, default_value = "./goblet-cache")]
    pub cache_dir: PathBuf,

    /// Shared secret clients must present as `Authorization: Bearer <token>`.
    /// Omit to run with authorization disabled.
    #[arg(long, env = "GOBLET_SHARED_SECRET")]
    pub shared_secret: Option<String>,

    /// Bearer token presented to upstream on every git operation.
    #[arg(long, env = "GOBLET_UPSTREAM_TOKEN", default_value = "")]
    pub upstream_token: String,

    /// S3 bucket backing the backup subsystem. Omit to disable backups.
    #[arg(long, env = "GOBLET_BACKUP_BUCKET")]
    pub backup_bucket: Option<String>,

    /// Identifies this process's own manifest stream; must be stable across
    /// restarts of the same deployment and unique across deployments sharing
    /// a bucket.
    #[arg(long, env = "GOBLET_MANIFEST_NAME", default_value = "default")]
    pub manifest_name: String,

    /// How often the backup subsystem snapshots every mirror.
    #[arg(long, value_parser = parse_seconds, default_value = "3600")]
    pub snapshot_interval: Duration,

    /// Upper bound on a fetch spawned in the background after `ls-refs`
    /// observes upstream changes.
    #[arg(long, value_parser = parse_seconds, default_value = "600")]
    pub background_fetch_timeout: Duration,
}

fn parse_seconds(s: &str) -> std::result::Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| e.to_string())
}

/// Builds the application, binds the listener, and serves until SIGINT or
/// SIGTERM, running the backup subsystem (if configured) alongside it.
pub async fn start(options: &Options) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&options.cache_dir).await?;

    let telemetry = Arc::new(Telemetry::tracing_default());
    let authorizer: Arc<dyn Authorizer> = Arc::new(SharedSecretAuthorizer::new(options.shared_secret.clone()));
    let tokens: Arc<dyn TokenSource> = Arc::new(StaticTokenSource::new(options.upstream_token.clone()));
    let canonicalizer: Arc<dyn UrlCanonicalizer> = Arc::new(IdentityCanonicalizer);

    let registry = Arc::new(Registry::new(Arc::new(GitCli)));

    let shutdown = CancellationToken::new();
    let mut background_tasks = Vec::new();

    if let Some(bucket) = &options.backup_bucket {
        let object_store = build_object_store(bucket)?;
        background_tasks.push(tokio::spawn(backup::run(
            object_store,
            registry.clone(),
            options.cache_dir.clone(),
            options.manifest_name.clone(),
            options.snapshot_interval,
            telemetry.clone(),
            shutdown.clone(),
        )));
    }

    let state = Arc::new(AppState {
        registry,
        canonicalizer,
        authorizer,
        tokens,
        telemetry,
        cache_dir: options.cache_dir.clone(),
        background_fetch_timeout: options.background_fetch_timeout,
    });

    let app = server::app(state);
    let listener = TcpListener::bind(&options.listen).await?;
    tracing::info!(addr = %options.listen, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for task in background_tasks {
        let _ = task.await;
    }

    Ok(())
}

fn build_object_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    let store = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .build()
        .map_err(|e| Error::Internal(anyhow::anyhow!("failed to configure backup object store: {e}")))?;
    Ok(Arc::new(store))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
