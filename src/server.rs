//! The HTTP proxy (`spec.md` §4.5): routes `/info/refs`, `/git-upload-pack`,
//! `/git-receive-pack`; applies authorization; drives the parser and the
//! protocol handler.

use std::iter::once;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::request_id::{MakeRequestUuid, RequestId};
use tower_http::sensitive_headers::SetSensitiveRequestHeadersLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tower_http::ServiceBuilderExt;
use tracing::Span;

use crate::auth::{Authorizer, TokenSource};
use crate::error::{Error, Result};
use crate::pktline::{encode_data, encode_flush};
use crate::protocol::{handle_command, parser::parse_commands, HandlerContext};
use crate::repo::git::{GitCli, GitOps};
use crate::repo::registry::Registry;
use crate::telemetry::Telemetry;
use crate::urlmap::UrlCanonicalizer;

pub const APP_NAME: &str = concat!("goblet/", env!("CARGO_PKG_VERSION"));

/// The capability advertisement this proxy offers. `ref-in-want` is
/// deliberately withheld: the coalesced-fetch model would otherwise let a
/// client observe a ref another fetch is mid-way through updating.
const CAPABILITIES: &[&str] = &["version 2", "ls-refs", "fetch=filter shallow", "server-option"];

pub struct AppState<G: GitOps = GitCli> {
    pub registry: Arc<Registry<G>>,
    pub canonicalizer: Arc<dyn UrlCanonicalizer>,
    pub authorizer: Arc<dyn Authorizer>,
    pub tokens: Arc<dyn TokenSource>,
    pub telemetry: Arc<Telemetry>,
    pub cache_dir: PathBuf,
    pub background_fetch_timeout: Duration,
}

pub fn app<G: GitOps>(state: Arc<AppState<G>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/*req", any(router::<G>))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .set_x_request_id(MakeRequestUuid)
                .layer(SetSensitiveRequestHeadersLayer::new(once(
                    header::AUTHORIZATION,
                )))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|request: &Request<_>| {
                            let request_id = request
                                .extensions()
                                .get::<RequestId>()
                                .map(|id| id.header_value().clone());
                            tracing::info_span!("request", ?request_id)
                        })
                        .on_request(|request: &Request<_>, _: &Span| {
                            tracing::info!(
                                "received {} {} {:?}",
                                request.method(),
                                request.uri(),
                                request.version(),
                            )
                        })
                        .on_response(|response: &Response<_>, latency: Duration, _: &Span| {
                            tracing::info!(
                                ?latency,
                                "done with status {}",
                                response.status(),
                            )
                        }),
                )
                .layer(RequestDecompressionLayer::new())
                .propagate_x_request_id()
                .layer(SetResponseHeaderLayer::overriding(
                    header::SERVER,
                    HeaderValue::from_static(APP_NAME),
                )),
        )
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn router<G: GitOps>(State(state): State<Arc<AppState<G>>>, request: Request<Body>) -> Response {
    match dispatch(state, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn dispatch<G: GitOps>(state: Arc<AppState<G>>, request: Request<Body>) -> Result<Response> {
    state.authorizer.authorize(request.headers()).await?;

    if request.method() == Method::GET && request.uri().path().ends_with("/info/refs") {
        if request.uri().query() != Some("service=git-upload-pack") {
            return Err(Error::InvalidArgument("unsupported service".into()));
        }
        let client_path = request
            .uri()
            .path()
            .strip_suffix("/info/refs")
            .ok_or_else(|| Error::InvalidArgument("malformed path".into()))?;
        handle_info_refs(state, client_path).await
    } else if request.method() == Method::POST && request.uri().path().ends_with("/git-upload-pack") {
        let client_path = request
            .uri()
            .path()
            .strip_suffix("/git-upload-pack")
            .ok_or_else(|| Error::InvalidArgument("malformed path".into()))?;
        handle_upload_pack(state, client_path, request).await
    } else if request.method() == Method::POST && request.uri().path().ends_with("/git-receive-pack") {
        Err(Error::Unimplemented)
    } else {
        Err(Error::InvalidArgument("unrecognized endpoint".into()))
    }
}

async fn handle_info_refs<G: GitOps>(state: Arc<AppState<G>>, client_path: &str) -> Result<Response> {
    open_repo(&state, client_path).await?; // ensures the mirror exists; doesn't fetch

    let mut body = b"001e# service=git-upload-pack\n0000".to_vec();
    for capability in CAPABILITIES {
        body.extend_from_slice(&encode_data(format!("{capability}\n").as_bytes()));
    }
    body.extend_from_slice(&encode_flush());

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/x-git-upload-pack-advertisement",
            ),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Bytes::from(body),
    )
        .into_response())
}

async fn handle_upload_pack<G: GitOps>(
    state: Arc<AppState<G>>,
    client_path: &str,
    request: Request<Body>,
) -> Result<Response> {
    if request
        .headers()
        .get("Git-Protocol")
        .and_then(|v| v.to_str().ok())
        != Some("version=2")
    {
        return Err(Error::InvalidArgument("missing Git-Protocol: version=2".into()));
    }

    let body = request
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("failed to collect request body: {e}")))?
        .to_bytes();

    let commands = match parse_commands(body) {
        Ok(commands) => commands,
        Err(err) => return Ok(upload_pack_error_response(&err)),
    };

    let repo = open_repo(&state, client_path).await?;

    let cancel = CancellationToken::new();
    let _drop_guard = cancel.clone().drop_guard();

    let mut response = Vec::new();
    for command in &commands {
        let ctx = HandlerContext::new(
            repo.clone(),
            state.tokens.clone(),
            state.telemetry.clone(),
            cancel.clone(),
            state.background_fetch_timeout,
        );
        match handle_command(&ctx, command).await {
            Ok(bytes) => response.extend_from_slice(&bytes),
            Err(err) => {
                state.telemetry.errors.report(&err);
                response.extend_from_slice(&err.to_pktline());
                return Ok(upload_pack_response(response));
            }
        }
    }

    Ok(upload_pack_response(response))
}

fn upload_pack_response(body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-git-upload-pack-result"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Bytes::from(body),
    )
        .into_response()
}

fn upload_pack_error_response(err: &Error) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-git-upload-pack-result"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        err.to_pktline(),
    )
        .into_response()
}

async fn open_repo<G: GitOps>(
    state: &Arc<AppState<G>>,
    client_path: &str,
) -> Result<Arc<crate::repo::ManagedRepository<G>>> {
    let upstream = state.canonicalizer.canonicalize(client_path)?;
    let local = state.cache_dir.join(state.canonicalizer.cache_key(&upstream)?);
    state.registry.open_or_create(local, upstream).await
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::{SharedSecretAuthorizer, StaticTokenSource};
    use crate::repo::git::MockGitOps;
    use crate::urlmap::IdentityCanonicalizer;

    fn state_with(git: MockGitOps) -> Arc<AppState<MockGitOps>> {
        Arc::new(AppState {
            registry: Arc::new(Registry::new(Arc::new(git))),
            canonicalizer: Arc::new(IdentityCanonicalizer),
            authorizer: Arc::new(SharedSecretAuthorizer::new(None)),
            tokens: Arc::new(StaticTokenSource::new("tok".into())),
            telemetry: Arc::new(Telemetry::tracing_default()),
            cache_dir: tempdir().unwrap().into_path(),
            background_fetch_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn info_refs_advertises_v2_capabilities_only() {
        let mut git = MockGitOps::new();
        git.expect_init_mirror().times(1).returning(|_, _| Ok(()));
        let state = state_with(git);

        let response = app(state)
            .oneshot(
                Request::builder()
                    .uri("/example.com/a/b/info/refs?service=git-upload-pack")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/x-git-upload-pack-advertisement"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body_str = String::from_utf8_lossy(&body);
        assert!(body_str.contains("version 2"));
        assert!(body_str.contains("ls-refs"));
        assert!(body_str.contains("fetch=filter shallow"));
        assert!(body_str.contains("server-option"));
        assert!(!body_str.contains("ref-in-want"));
    }

    #[tokio::test]
    async fn rejects_unsupported_service_query() {
        let git = MockGitOps::new();
        let state = state_with(git);

        let response = app(state)
            .oneshot(
                Request::builder()
                    .uri("/example.com/a/b/info/refs?service=git-receive-pack")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn receive_pack_is_unimplemented() {
        let git = MockGitOps::new();
        let state = state_with(git);

        let response = app(state)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/example.com/a/b/git-receive-pack")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn upload_pack_requires_git_protocol_header() {
        let mut git = MockGitOps::new();
        git.expect_init_mirror().times(1).returning(|_, _| Ok(()));
        let state = state_with(git);

        let response = app(state)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/example.com/a/b/git-upload-pack")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_pack_empty_body_is_accepted() {
        let mut git = MockGitOps::new();
        git.expect_init_mirror().times(1).returning(|_, _| Ok(()));
        let state = state_with(git);

        let response = app(state)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/example.com/a/b/git-upload-pack")
                    .header("Git-Protocol", "version=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn unauthorized_request_gets_both_www_authenticate_headers() {
        let git = MockGitOps::new();
        let mut state = state_with(git);
        Arc::get_mut(&mut state).unwrap().authorizer =
            Arc::new(SharedSecretAuthorizer::new(Some("s3cr3t".into())));

        let response = app(state)
            .oneshot(
                Request::builder()
                    .uri("/example.com/a/b/info/refs?service=git-upload-pack")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let values: Vec<_> = response
            .headers()
            .get_all(header::WWW_AUTHENTICATE)
            .into_iter()
            .collect();
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn healthz_is_exempt_from_authorization() {
        let git = MockGitOps::new();
        let mut state = state_with(git);
        Arc::get_mut(&mut state).unwrap().authorizer =
            Arc::new(SharedSecretAuthorizer::new(Some("s3cr3t".into())));

        let response = app(state)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn compressed_upload_pack_request_is_decoded_transparently() {
        use std::io::Write;

        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut git = MockGitOps::new();
        git.expect_init_mirror().times(1).returning(|_, _| Ok(()));
        let state = state_with(git);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"").unwrap();
        let compressed = encoder.finish().unwrap();

        let response = app(state)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/example.com/a/b/git-upload-pack")
                    .header("Git-Protocol", "version=2")
                    .header(header::CONTENT_ENCODING, "gzip")
                    .body(Body::from(compressed))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
