//! Narrow telemetry interfaces.
//!
//! The core emits events through these traits only; transport to any
//! specific metrics/error-reporting backend is external (per `spec.md` §1).
//! The `tracing`-backed defaults here are enough to run standalone and to
//! make the events visible in logs, but a production deployment is expected
//! to supply its own implementations.

use std::time::Duration;

use crate::error::Error;

/// A single measurement point. Kept as an enum (rather than free-form
/// strings) so that implementations can match exhaustively instead of
/// parsing metric names.
#[derive(Debug, Clone)]
pub enum Measurement {
    /// A command finished, tagged with its outcome.
    CommandCompleted {
        command: &'static str,
        outcome: Outcome,
    },
    /// Time a `fetch` command spent in the coalescing wait loop before it
    /// could serve locally (or failed).
    FetchWaitDuration(Duration),
    /// One snapshot cycle of the backup subsystem completed.
    SnapshotCycleDuration(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

pub trait Metrics: Send + Sync {
    fn record(&self, measurement: Measurement);
}

/// Emits every measurement as a `tracing` event at `info` level. Adequate
/// for local runs; a real deployment plugs in a sink over this trait.
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn record(&self, measurement: Measurement) {
        match measurement {
            Measurement::CommandCompleted { command, outcome } => {
                tracing::info!(command, ?outcome, "command completed");
            }
            Measurement::FetchWaitDuration(d) => {
                tracing::info!(duration_ms = d.as_millis() as u64, "fetch wait duration");
            }
            Measurement::SnapshotCycleDuration(d) => {
                tracing::info!(duration_ms = d.as_millis() as u64, "snapshot cycle duration");
            }
        }
    }
}

/// Sink for server-side error kinds (`Unavailable`, `Internal`); client-side
/// kinds are not forwarded here (see `Error::is_server_side`).
pub trait ErrorReporter: Send + Sync {
    fn report(&self, err: &Error);
}

#[derive(Debug, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, err: &Error) {
        if err.is_server_side() {
            tracing::error!(error = %err, "server-side error");
        }
    }
}

/// Progress reporting for long-running operations (currently only
/// `fetchUpstream`). `progress` lines are the underlying `git fetch`'s
/// stderr/stdout progress output, forwarded verbatim.
pub trait LongRunningOp: Send + Sync {
    fn started(&self, operation: &str, repo: &str);
    fn progress(&self, operation: &str, repo: &str, line: &str);
    fn finished(&self, operation: &str, repo: &str, outcome: Outcome, elapsed: Duration);
}

#[derive(Debug, Default)]
pub struct TracingLongRunningOp;

impl LongRunningOp for TracingLongRunningOp {
    fn started(&self, operation: &str, repo: &str) {
        tracing::info!(operation, repo, "long-running operation started");
    }

    fn progress(&self, operation: &str, repo: &str, line: &str) {
        tracing::debug!(operation, repo, "{line}");
    }

    fn finished(&self, operation: &str, repo: &str, outcome: Outcome, elapsed: Duration) {
        tracing::info!(
            operation,
            repo,
            ?outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "long-running operation finished"
        );
    }
}

/// Bundles the telemetry collaborators a managed repository and the proxy
/// need, so call sites take one `Arc<Telemetry>` instead of three params.
pub struct Telemetry {
    pub metrics: std::sync::Arc<dyn Metrics>,
    pub errors: std::sync::Arc<dyn ErrorReporter>,
    pub long_running: std::sync::Arc<dyn LongRunningOp>,
}

impl Telemetry {
    pub fn tracing_default() -> Self {
        Self {
            metrics: std::sync::Arc::new(TracingMetrics),
            errors: std::sync::Arc::new(TracingErrorReporter),
            long_running: std::sync::Arc::new(TracingLongRunningOp),
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}
