//! Pluggable authentication/authorization collaborators.
//!
//! Per `spec.md` §1, authentication of client requests and credentials for
//! upstream fetches are external collaborators: the core only consumes
//! narrow trait objects. `main.rs` wires a minimal default so the binary
//! runs standalone; a real deployment supplies its own.

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::error::{Error, Result};

/// Decides whether an inbound client request is authorized. Failure must
/// map to `Error::Unauthenticated`.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, headers: &HeaderMap) -> Result<()>;
}

/// Supplies fresh credentials for upstream calls. Tokens must be obtained
/// immediately before use (never cached by the core) so that short-lived
/// credentials work; caching, if any, is the token source's own concern.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Accepts every request whose `Authorization: Bearer <token>` header
/// matches a fixed shared secret; rejects everything else. Good enough to
/// run the proxy standalone; not intended as the final word on access
/// control for a shared deployment.
pub struct SharedSecretAuthorizer {
    expected: Option<String>,
}

impl SharedSecretAuthorizer {
    /// `None` disables authorization entirely (every request is allowed).
    pub fn new(expected: Option<String>) -> Self {
        Self { expected }
    }
}

#[async_trait]
impl Authorizer for SharedSecretAuthorizer {
    async fn authorize(&self, headers: &HeaderMap) -> Result<()> {
        let Some(expected) = &self.expected else {
            return Ok(());
        };

        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match presented {
            Some(token) if token == expected => Ok(()),
            _ => Err(Error::Unauthenticated),
        }
    }
}

/// Supplies a single static token, read once at startup from an environment
/// variable or CLI option. Adequate for a long-lived service account token;
/// anything with rotation needs its own `TokenSource`.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_secret_rejects_missing_header() {
        let auth = SharedSecretAuthorizer::new(Some("s3cr3t".into()));
        assert!(auth.authorize(&HeaderMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn shared_secret_accepts_matching_bearer() {
        let auth = SharedSecretAuthorizer::new(Some("s3cr3t".into()));
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer s3cr3t".parse().unwrap(),
        );
        assert!(auth.authorize(&headers).await.is_ok());
    }

    #[tokio::test]
    async fn disabled_authorizer_allows_everything() {
        let auth = SharedSecretAuthorizer::new(None);
        assert!(auth.authorize(&HeaderMap::new()).await.is_ok());
    }
}
