//! Per-command state machine (`spec.md` §4.4): decides cache vs. upstream
//! and produces the response bytes for one command. `ls-refs` is always a
//! cache miss against upstream; `fetch` serves locally when possible and
//! otherwise coalesces onto (at most) one upstream fetch per repository.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenSource;
use crate::error::{Error, Result};
use crate::pktline::{PktLine, PktLineParser};
use crate::protocol::parser::{Command, CommandName};
use crate::repo::{invalid_want, GitOps, ManagedRepository, RefSnapshot};
use crate::telemetry::{Measurement, Outcome, Telemetry};

const DEFAULT_FETCH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything one command's handling needs, collected so call sites take
/// one value instead of a handful of loose parameters.
pub struct HandlerContext<G: GitOps> {
    pub repo: Arc<ManagedRepository<G>>,
    pub tokens: Arc<dyn TokenSource>,
    pub telemetry: Arc<Telemetry>,
    pub cancel: CancellationToken,
    pub background_fetch_timeout: Duration,
    pub fetch_poll_interval: Duration,
}

impl<G: GitOps> HandlerContext<G> {
    pub fn new(
        repo: Arc<ManagedRepository<G>>,
        tokens: Arc<dyn TokenSource>,
        telemetry: Arc<Telemetry>,
        cancel: CancellationToken,
        background_fetch_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            tokens,
            telemetry,
            cancel,
            background_fetch_timeout,
            fetch_poll_interval: DEFAULT_FETCH_POLL_INTERVAL,
        }
    }
}

/// Handles one command, returning the bytes to append to the response.
pub async fn handle_command<G: GitOps>(ctx: &HandlerContext<G>, command: &Command) -> Result<Bytes> {
    let result = match command.name {
        CommandName::LsRefs => handle_ls_refs(ctx, command).await,
        CommandName::Fetch => handle_fetch(ctx, command).await,
    };

    ctx.telemetry.metrics.record(Measurement::CommandCompleted {
        command: command.name.as_str(),
        outcome: if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        },
    });

    result
}

async fn handle_ls_refs<G: GitOps>(ctx: &HandlerContext<G>, command: &Command) -> Result<Bytes> {
    let response = ctx.repo.ls_refs_upstream(command, ctx.tokens.as_ref()).await?;
    let refs = parse_ref_snapshot(&response)?;

    if ctx.repo.has_any_update(&refs).await? {
        spawn_background_fetch(ctx);
    }

    Ok(response)
}

fn spawn_background_fetch<G: GitOps>(ctx: &HandlerContext<G>) {
    let repo = ctx.repo.clone();
    let tokens = ctx.tokens.clone();
    let telemetry = ctx.telemetry.clone();
    let timeout = ctx.background_fetch_timeout;

    // Intentionally detached from the request's own context: other
    // concurrent waiters (or a later request) may depend on this fetch
    // completing, so it must outlive the request that triggered it. Bounded
    // by `timeout` so a hung upstream can't accumulate fetches serialized
    // forever behind the repository's writer lock (spec.md §9).
    tokio::spawn(async move {
        let fut = repo.fetch_upstream(tokens.as_ref(), telemetry.as_ref());
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => telemetry.errors.report(&err),
            Err(_) => telemetry
                .errors
                .report(&Error::Unavailable("background fetch timed out".into())),
        }
    });
}

async fn handle_fetch<G: GitOps>(ctx: &HandlerContext<G>, command: &Command) -> Result<Bytes> {
    let (hashes, refnames) = parse_wants(command)?;

    if ctx.repo.has_all_wants(&hashes, &refnames).await? {
        return ctx.repo.serve_fetch_local(command).await;
    }

    let wait_start = Instant::now();
    let outcome = wait_for_wants(ctx, &hashes, &refnames).await;
    ctx.telemetry
        .metrics
        .record(Measurement::FetchWaitDuration(wait_start.elapsed()));

    match outcome? {
        WaitOutcome::WantsSatisfied => ctx.repo.serve_fetch_local(command).await,
        WaitOutcome::FetchSucceeded => {
            if ctx.repo.has_all_wants(&hashes, &refnames).await? {
                ctx.repo.serve_fetch_local(command).await
            } else {
                Err(Error::Unavailable(
                    "fetch succeeded but wants are still missing locally".into(),
                ))
            }
        }
    }
}

enum WaitOutcome {
    /// The poll found every want satisfied before the fetch finished.
    WantsSatisfied,
    /// The fetch itself finished (successfully); caller must re-check wants.
    FetchSucceeded,
}

/// Starts (or joins, implicitly via the repository's writer lock) an
/// upstream fetch and waits for either the wants to become satisfied or the
/// fetch to finish, whichever comes first, honoring cancellation.
async fn wait_for_wants<G: GitOps>(
    ctx: &HandlerContext<G>,
    hashes: &[String],
    refnames: &[String],
) -> Result<WaitOutcome> {
    let repo = ctx.repo.clone();
    let tokens = ctx.tokens.clone();
    let telemetry = ctx.telemetry.clone();

    let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let result = repo.fetch_upstream(tokens.as_ref(), telemetry.as_ref()).await;
        let _ = done_tx.send(result);
    });

    let mut interval = tokio::time::interval(ctx.fetch_poll_interval);
    interval.tick().await; // the first tick fires immediately; consume it

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(Error::Canceled);
            }
            result = &mut done_rx => {
                let result = result.map_err(|_| {
                    Error::Internal(anyhow::anyhow!("fetch task ended without a result"))
                })?;
                result?;
                return Ok(WaitOutcome::FetchSucceeded);
            }
            _ = interval.tick() => {
                if ctx.repo.has_all_wants(hashes, refnames).await? {
                    return Ok(WaitOutcome::WantsSatisfied);
                }
            }
        }
    }
}

fn parse_wants(command: &Command) -> Result<(Vec<String>, Vec<String>)> {
    let mut hashes = Vec::new();
    let mut refnames = Vec::new();

    for (key, value) in command.arg_lines() {
        match key {
            "want" => hashes.push(value.ok_or_else(|| invalid_want(key))?.to_string()),
            "want-ref" => refnames.push(value.ok_or_else(|| invalid_want(key))?.to_string()),
            _ => {} // other fetch arguments (filter, done, etc.) are passed through untouched
        }
    }

    Ok((hashes, refnames))
}

fn parse_ref_snapshot(response: &Bytes) -> Result<RefSnapshot> {
    let mut parser = PktLineParser::new(response.clone());
    let mut refs = RefSnapshot::new();

    while let Some(line) = parser.next()? {
        let PktLine::Data(payload) = line else {
            continue;
        };
        let text = std::str::from_utf8(&payload)
            .map_err(|_| Error::Internal(anyhow::anyhow!("non-utf8 ls-refs response line")))?
            .trim_end_matches('\n');
        let Some((hash, rest)) = text.split_once(' ') else {
            continue; // capability/advertisement lines without a ref, ignored
        };
        let refname = rest.split(' ').next().unwrap_or(rest).trim();
        refs.insert(refname.to_string(), hash.to_string());
    }

    Ok(refs)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::auth::StaticTokenSource;
    use crate::pktline::{encode_data, encode_flush};
    use crate::repo::git::MockGitOps;

    fn ctx_with(git: MockGitOps) -> HandlerContext<MockGitOps> {
        let repo = Arc::new(ManagedRepository::new(
            "/tmp/goblet-test".into(),
            "https://example.com/a/b".into(),
            Arc::new(git),
        ));
        HandlerContext {
            repo,
            tokens: Arc::new(StaticTokenSource::new("tok".into())),
            telemetry: Arc::new(Telemetry::tracing_default()),
            cancel: CancellationToken::new(),
            background_fetch_timeout: Duration::from_secs(5),
            fetch_poll_interval: Duration::from_millis(10),
        }
    }

    fn fetch_command(wants: &[&str]) -> Command {
        let mut body = Vec::new();
        body.extend_from_slice(&encode_data(b"command=fetch\n"));
        for w in wants {
            body.extend_from_slice(&encode_data(format!("want {w}\n").as_bytes()));
        }
        body.extend_from_slice(&encode_flush());
        crate::protocol::parser::parse_commands(Bytes::from(body)).unwrap().remove(0)
    }

    fn ls_refs_command() -> Command {
        let mut body = Vec::new();
        body.extend_from_slice(&encode_data(b"command=ls-refs\n"));
        body.extend_from_slice(&encode_flush());
        crate::protocol::parser::parse_commands(Bytes::from(body)).unwrap().remove(0)
    }

    fn upstream_refs_response(refs: &[(&str, &str)]) -> Bytes {
        let mut body = Vec::new();
        for (hash, name) in refs {
            body.extend_from_slice(&encode_data(format!("{hash} {name}\n").as_bytes()));
        }
        body.extend_from_slice(&encode_flush());
        Bytes::from(body)
    }

    #[tokio::test]
    async fn fetch_serves_locally_without_upstream_when_wants_present() {
        let mut git = MockGitOps::new();
        git.expect_object_exists()
            .withf(|_, h| h == "aaaa")
            .returning(|_, _| Ok(true));
        git.expect_serve_upload_pack()
            .returning(|_, _| Ok(Bytes::from_static(b"packfile")));
        // fetch_mirror/fetch_heads_and_changes must never be called.

        let ctx = ctx_with(git);
        let cmd = fetch_command(&["aaaa"]);
        let response = handle_command(&ctx, &cmd).await.unwrap();
        assert_eq!(response, Bytes::from_static(b"packfile"));
    }

    #[tokio::test]
    async fn fetch_coalesces_onto_upstream_then_serves_locally() {
        let present = Arc::new(AtomicBool::new(false));
        let mut git = MockGitOps::new();

        let present_read = present.clone();
        git.expect_object_exists()
            .returning(move |_, _| Ok(present_read.load(Ordering::SeqCst)));

        git.expect_has_any_ref().returning(|_| Ok(true));

        let present_write = present.clone();
        git.expect_fetch_mirror().returning(move |_, _| {
            present_write.store(true, Ordering::SeqCst);
            Ok(Vec::new())
        });

        git.expect_serve_upload_pack()
            .returning(|_, _| Ok(Bytes::from_static(b"packfile")));

        let ctx = ctx_with(git);
        let cmd = fetch_command(&["aaaa"]);
        let response = handle_command(&ctx, &cmd).await.unwrap();
        assert_eq!(response, Bytes::from_static(b"packfile"));
    }

    #[tokio::test]
    async fn fetch_fails_when_upstream_fetch_fails_and_wants_still_missing() {
        let mut git = MockGitOps::new();
        git.expect_object_exists().returning(|_, _| Ok(false));
        git.expect_has_any_ref().returning(|_| Ok(true));
        git.expect_fetch_mirror()
            .returning(|_, _| Err(Error::Internal(anyhow::anyhow!("network blip"))));

        let ctx = ctx_with(git);
        let cmd = fetch_command(&["aaaa"]);
        assert!(handle_command(&ctx, &cmd).await.is_err());
    }

    #[tokio::test]
    async fn fetch_yields_unavailable_when_fetch_succeeds_but_wants_remain_missing() {
        let mut git = MockGitOps::new();
        git.expect_object_exists().returning(|_, _| Ok(false));
        git.expect_has_any_ref().returning(|_| Ok(true));
        git.expect_fetch_mirror().returning(|_, _| Ok(Vec::new()));

        let ctx = ctx_with(git);
        let cmd = fetch_command(&["aaaa"]);
        let err = handle_command(&ctx, &cmd).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn fetch_rejects_unparseable_want_line() {
        let git = MockGitOps::new();
        let ctx = ctx_with(git);
        // "want" with no value.
        let mut body = Vec::new();
        body.extend_from_slice(&encode_data(b"command=fetch\n"));
        body.extend_from_slice(&encode_data(b"want\n"));
        body.extend_from_slice(&encode_flush());
        let cmd = crate::protocol::parser::parse_commands(Bytes::from(body))
            .unwrap()
            .remove(0);

        assert!(handle_command(&ctx, &cmd).await.is_err());
    }

    #[tokio::test]
    async fn fetch_honors_cancellation() {
        let mut git = MockGitOps::new();
        git.expect_object_exists().returning(|_, _| Ok(false));
        git.expect_has_any_ref().returning(|_| Ok(true));
        // Never resolves within the test's lifetime.
        git.expect_fetch_mirror().returning(|_, _| {
            Err(Error::Internal(anyhow::anyhow!("unused, cancellation wins first")))
        });

        let mut ctx = ctx_with(git);
        ctx.fetch_poll_interval = Duration::from_secs(3600);
        ctx.cancel.cancel();

        let cmd = fetch_command(&["aaaa"]);
        let err = handle_command(&ctx, &cmd).await.unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }

    #[tokio::test]
    async fn ls_refs_forwards_response_verbatim_and_triggers_background_fetch_on_update() {
        let fetch_called = Arc::new(AtomicUsize::new(0));
        let mut git = MockGitOps::new();

        let response = upstream_refs_response(&[("deadbeef", "refs/heads/main")]);
        let response_for_mock = response.clone();
        git.expect_ls_refs_upstream()
            .returning(move |_, _, _| Ok(response_for_mock.clone()));

        // Local mirror has no matching ref yet => hasAnyUpdate is true.
        git.expect_resolve_ref().returning(|_, _| Ok(None));

        git.expect_has_any_ref().returning(|_| Ok(true));
        let fetch_called_write = fetch_called.clone();
        git.expect_fetch_mirror().returning(move |_, _| {
            fetch_called_write.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        });

        let ctx = ctx_with(git);
        let cmd = ls_refs_command();
        let out = handle_command(&ctx, &cmd).await.unwrap();
        assert_eq!(out, response);

        // The background fetch is fire-and-forget; give it a moment to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetch_called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ls_refs_skips_background_fetch_when_refs_unchanged() {
        let mut git = MockGitOps::new();
        let response = upstream_refs_response(&[("deadbeef", "refs/heads/main")]);
        let response_for_mock = response.clone();
        git.expect_ls_refs_upstream()
            .returning(move |_, _, _| Ok(response_for_mock.clone()));
        git.expect_resolve_ref()
            .returning(|_, _| Ok(Some("deadbeef".to_string())));
        // fetch_mirror/has_any_ref must never be called.

        let ctx = ctx_with(git);
        let cmd = ls_refs_command();
        let out = handle_command(&ctx, &cmd).await.unwrap();
        assert_eq!(out, response);
    }

    #[test]
    fn ref_snapshot_parses_hash_and_trims_refname() {
        let response = upstream_refs_response(&[("cafebabe", "refs/heads/main")]);
        let refs = parse_ref_snapshot(&response).unwrap();
        assert_eq!(refs.get("refs/heads/main"), Some(&"cafebabe".to_string()));
    }
}
