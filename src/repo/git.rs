//! The `GitOps` trait: every place this crate shells out to `git` or calls
//! upstream over HTTP goes through here, so the rest of the managed
//! repository layer can be tested against `MockGit` instead of a real
//! mirror and a real upstream (mirroring the teacher crate's `git.rs`).

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::{Error, Result};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitOps: Send + Sync + 'static {
    /// `git init --bare` plus the protocol/mirror configuration invariants
    /// from `spec.md` §4.2.
    async fn init_mirror(&self, local: &Path, upstream: &str) -> Result<()>;

    /// Whether the mirror already has at least one ref, used to decide
    /// between the two-phase and single-phase first fetch.
    async fn has_any_ref(&self, local: &Path) -> Result<bool>;

    /// Phase 1 of a first-ever fetch: cheap branch/changes refspecs, to
    /// avoid a pathological full-mirror cost on the very first fetch.
    /// Returns the underlying `git fetch`'s progress output, line by line,
    /// for the caller to forward to telemetry.
    async fn fetch_heads_and_changes(&self, local: &Path, token: &str) -> Result<Vec<String>>;

    /// A full mirror fetch; also phase 2 of a first-ever fetch. Same
    /// progress-output contract as `fetch_heads_and_changes`.
    async fn fetch_mirror(&self, local: &Path, token: &str) -> Result<Vec<String>>;

    /// `None` if the ref doesn't exist locally.
    async fn resolve_ref(&self, local: &Path, refname: &str) -> Result<Option<String>>;

    async fn object_exists(&self, local: &Path, hash: &str) -> Result<bool>;

    /// Forwards a client's `ls-refs` command (already pkt-line framed) to
    /// upstream and returns the raw response body.
    async fn ls_refs_upstream(&self, upstream: &str, token: &str, body: Bytes) -> Result<Bytes>;

    /// Runs `git upload-pack --stateless-rpc` against the mirror with
    /// `body` on stdin, returns its stdout.
    async fn serve_upload_pack(&self, local: &Path, body: Bytes) -> Result<Bytes>;

    /// `git bundle create - --all`.
    async fn write_bundle(&self, local: &Path) -> Result<Bytes>;

    async fn recover_from_bundle(&self, local: &Path, bundle_path: &Path) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GitCli;

impl GitCli {
    async fn run(&self, local: &Path, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .arg("-C")
            .arg(local)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Internal(e.into()))?;

        if !output.status.success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Like `run`, but reads stderr line-by-line as the subprocess runs
    /// (rather than buffering it whole via `.output()`) and returns every
    /// line on success, for the caller to forward as progress; used for
    /// `git fetch`, whose stderr carries its progress reporting.
    async fn run_streaming(&self, local: &Path, args: &[&str], fail_context: &str) -> Result<Vec<String>> {
        let mut child = Command::new("git")
            .arg("-C")
            .arg(local)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Internal(e.into()))?;

        let stderr = child.stderr.take().expect("stderr requested above");
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        let mut output_lines = Vec::new();
        while let Some(line) = lines.next_line().await.map_err(|e| Error::Internal(e.into()))? {
            output_lines.push(line);
        }

        let status = child.wait().await.map_err(|e| Error::Internal(e.into()))?;
        if !status.success() {
            return Err(Error::Internal(anyhow::anyhow!("{fail_context}: {}", output_lines.join("\n"))));
        }
        Ok(output_lines)
    }

    fn extra_header_arg(token: &str) -> String {
        format!("http.extraHeader=Authorization: Bearer {token}")
    }
}

#[async_trait]
impl GitOps for GitCli {
    async fn init_mirror(&self, local: &Path, upstream: &str) -> Result<()> {
        tokio::fs::create_dir_all(local)
            .await
            .map_err(|e| Error::Internal(e.into()))?;

        self.run(local, &["init", "--bare"]).await?;
        self.run(local, &["config", "protocol.version", "2"]).await?;
        self.run(local, &["config", "uploadpack.allowfilter", "1"]).await?;
        self.run(local, &["config", "uploadpack.allowrefinwant", "1"])
            .await?;
        self.run(local, &["config", "repack.writebitmaps", "1"])
            .await?;
        self.run(local, &["config", "http.version", "HTTP/1.1"])
            .await?;
        self.run(
            local,
            &["remote", "add", "--mirror=fetch", "origin", upstream],
        )
        .await
    }

    async fn has_any_ref(&self, local: &Path) -> Result<bool> {
        let output = Command::new("git")
            .arg("-C")
            .arg(local)
            .args(["show-ref", "--quiet"])
            .output()
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        // exit 0: at least one ref; exit 1: none; anything else is a real error.
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(Error::Internal(anyhow::anyhow!(
                "git show-ref failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))),
        }
    }

    async fn fetch_heads_and_changes(&self, local: &Path, token: &str) -> Result<Vec<String>> {
        let header = Self::extra_header_arg(token);
        self.run_streaming(
            local,
            &[
                "-c",
                &header,
                "fetch",
                "origin",
                "refs/heads/*:refs/heads/*",
                "refs/changes/*:refs/changes/*",
            ],
            "initial fetch phase failed",
        )
        .await
    }

    async fn fetch_mirror(&self, local: &Path, token: &str) -> Result<Vec<String>> {
        let header = Self::extra_header_arg(token);
        self.run_streaming(local, &["-c", &header, "fetch", "origin"], "mirror fetch failed").await
    }

    async fn resolve_ref(&self, local: &Path, refname: &str) -> Result<Option<String>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(local)
            .args(["rev-parse", "--verify", "--quiet", &format!("{refname}^{{commit}}")])
            .output()
            .await
            .map_err(|e| Error::Internal(e.into()))?;

        if output.status.success() {
            let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(Some(hash))
        } else {
            Ok(None)
        }
    }

    async fn object_exists(&self, local: &Path, hash: &str) -> Result<bool> {
        let output = Command::new("git")
            .arg("-C")
            .arg(local)
            .args(["cat-file", "-e", hash])
            .output()
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        Ok(output.status.success())
    }

    async fn ls_refs_upstream(&self, upstream: &str, token: &str, body: Bytes) -> Result<Bytes> {
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/git-upload-pack", upstream.trim_end_matches('/')))
            .header("Content-Type", "application/x-git-upload-pack-request")
            .header("Accept", "application/x-git-upload-pack-result")
            .header("Git-Protocol", "version=2")
            .bearer_auth(token)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("upstream ls-refs request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "upstream ls-refs returned {}",
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("reading upstream ls-refs body failed: {e}")))
    }

    async fn serve_upload_pack(&self, local: &Path, body: Bytes) -> Result<Bytes> {
        let mut child = Command::new("git-upload-pack")
            .arg("--stateless-rpc")
            .arg(local)
            .env("GIT_PROTOCOL", "version=2")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Internal(e.into()))?;

        let mut stdin = child.stdin.take().expect("stdin requested above");
        stdin
            .write_all(&body)
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Internal(e.into()))?;

        if !output.status.success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "git-upload-pack failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(Bytes::from(output.stdout))
    }

    async fn write_bundle(&self, local: &Path) -> Result<Bytes> {
        let output = Command::new("git")
            .arg("-C")
            .arg(local)
            .args(["bundle", "create", "-", "--all"])
            .output()
            .await
            .map_err(|e| Error::Internal(e.into()))?;

        if !output.status.success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "git bundle create failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(Bytes::from(output.stdout))
    }

    async fn recover_from_bundle(&self, local: &Path, bundle_path: &Path) -> Result<()> {
        self.run(
            local,
            &[
                "fetch",
                "--force",
                bundle_path.to_str().ok_or_else(|| {
                    Error::Internal(anyhow::anyhow!("bundle path is not valid UTF-8"))
                })?,
                "+refs/*:refs/*",
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn ls_refs_upstream_forwards_request_and_returns_response_body() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/git-upload-pack"))
            .and(header("Git-Protocol", "version=2"))
            .and(header("Authorization", "Bearer tok"))
            .and(body_bytes(b"command=ls-refs\n".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0013deadbeef refs/heads/main\n0000".to_vec()))
            .mount(&upstream)
            .await;

        let git = GitCli;
        let response = git
            .ls_refs_upstream(&upstream.uri(), "tok", Bytes::from_static(b"command=ls-refs\n"))
            .await
            .unwrap();

        assert_eq!(&response[..], b"0013deadbeef refs/heads/main\n0000");
    }

    #[tokio::test]
    async fn ls_refs_upstream_surfaces_non_success_status_as_an_error() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/git-upload-pack"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&upstream)
            .await;

        let git = GitCli;
        let result = git
            .ls_refs_upstream(&upstream.uri(), "tok", Bytes::from_static(b"command=ls-refs\n"))
            .await;

        assert!(result.is_err());
    }
}
