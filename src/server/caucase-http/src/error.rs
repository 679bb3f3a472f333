//! HTTP error type and its status mapping.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use caucase_ca::{CaError, ErrorKind};

/// Errors returned by request handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Unknown route, unknown resource, or authentication failure.
    #[error("not found")]
    NotFound,

    /// Method not supported by the resource.
    #[error("method not allowed")]
    MethodNotAllowed {
        /// Value of the `Allow` header.
        allow: &'static str,
    },

    /// Malformed input, wrong content type, bad signature.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// CSR already consumed, or duplicate entry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Request body over the size cap.
    #[error("request body too large")]
    TooLarge,

    /// Pending CSR quota exhausted.
    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),

    /// Anything unexpected. Never shown to the client.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CaError> for ApiError {
    fn from(err: CaError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::Conflict => Self::Conflict(err.to_string()),
            ErrorKind::NoStorage => Self::InsufficientStorage(err.to_string()),
            ErrorKind::CertificateVerification | ErrorKind::Decode => {
                Self::BadRequest(err.to_string())
            }
            ErrorKind::Internal => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND.into_response(),
            Self::MethodNotAllowed { allow } => {
                (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, allow)]).into_response()
            }
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            Self::Conflict(reason) => (StatusCode::CONFLICT, reason).into_response(),
            Self::TooLarge => StatusCode::PAYLOAD_TOO_LARGE.into_response(),
            Self::InsufficientStorage(reason) => {
                (StatusCode::INSUFFICIENT_STORAGE, reason).into_response()
            }
            Self::Internal(detail) => {
                error!(error = %detail, "Internal error while handling request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}
