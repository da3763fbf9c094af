//! Canonical error kinds and their HTTP/pkt-line projections.
//!
//! These are for our benefit, and for the client's: each kind has a fixed
//! status-code mapping (`§7` of the design), and `/git-upload-pack` maps
//! errors onto a pkt-line `ERR` packet instead of a plain-text HTTP body,
//! since Git clients never parse the latter. Server-side kinds are also
//! forwarded to the pluggable error-reporting sink; client-side kinds
//! (bad requests, auth failures, cancellation) are not — they're the
//! client's problem, not ours.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::pktline;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not authenticated")]
    Unauthenticated,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unimplemented")]
    Unimplemented,

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("canceled")]
    Canceled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Canceled => StatusCode::from_u16(499).unwrap(), // client closed request
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Server-side kinds are forwarded to the error-reporting sink;
    /// client-side kinds (bad input, auth, cancellation) are not.
    pub fn is_server_side(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Internal(_))
    }

    /// Render as a single pkt-line `ERR` packet, for `/git-upload-pack`
    /// responses where a plain HTTP error body would go unparsed by the
    /// client.
    pub fn to_pktline(&self) -> bytes::Bytes {
        pktline::encode_error(&self.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Internal(err) => {
                tracing::error!(error = format_args!("{err:#?}"), "internal server error");
                (self.status_code(), "internal server error").into_response()
            }
            Error::Unauthenticated => (
                self.status_code(),
                [
                    (axum::http::header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer")),
                    (
                        axum::http::header::WWW_AUTHENTICATE,
                        HeaderValue::from_static("Basic realm=goblet"),
                    ),
                ],
            )
                .into_response(),
            Error::InvalidArgument(msg) => (self.status_code(), msg.clone()).into_response(),
            Error::Unimplemented => self.status_code().into_response(),
            Error::Unavailable(msg) => (self.status_code(), msg.clone()).into_response(),
            Error::Canceled => self.status_code().into_response(),
        }
    }
}
