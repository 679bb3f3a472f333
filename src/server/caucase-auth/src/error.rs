//! Authentication error types.

use thiserror::Error;

/// Errors that can occur during authentication.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No client certificate was presented.
    #[error("missing client certificate")]
    MissingCertificate,

    /// Certificate not issued by the authority, expired or revoked.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The backend itself failed (storage, configuration).
    #[error("authentication backend error: {0}")]
    Backend(String),
}
