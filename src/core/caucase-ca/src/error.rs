//! CA engine error types.

use thiserror::Error;

use caucase_crypto::CryptoError;
use caucase_storage::StorageError;

/// Errors that can occur in the CA engine.
#[derive(Debug, Error)]
pub enum CaError {
    /// Unknown CSR id or certificate serial.
    #[error("not found: {0}")]
    NotFound(String),

    /// The CSR was already consumed, or the entry already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The pending CSR quota is exhausted.
    #[error("no storage left: {0}")]
    NoStorage(String),

    /// Signature, chain, validity window or revocation check failed.
    #[error("certificate verification failed: {0}")]
    CertificateVerification(String),

    /// Malformed PEM, DER or unsupported key type.
    #[error("decode error: {0}")]
    Decode(String),

    /// Restore target already holds data.
    #[error("database is not empty")]
    NotEmpty,

    /// Invalid authority configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Certificate or CRL generation failed.
    #[error("certificate generation failed: {0}")]
    Generation(String),

    /// Storage failure.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Cryptographic failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Backup stream I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of a [`CaError`], as seen by callers that map errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown resource.
    NotFound,
    /// Duplicate or already consumed resource.
    Conflict,
    /// Quota exhausted.
    NoStorage,
    /// Caller presented an invalid certificate or signature.
    CertificateVerification,
    /// Caller sent malformed input.
    Decode,
    /// Anything else: not the caller's fault.
    Internal,
}

impl CaError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) | Self::NotEmpty => ErrorKind::Conflict,
            Self::NoStorage(_) => ErrorKind::NoStorage,
            Self::CertificateVerification(_) => ErrorKind::CertificateVerification,
            Self::Decode(_) => ErrorKind::Decode,
            Self::InvalidConfig(_)
            | Self::Generation(_)
            | Self::Storage(_)
            | Self::Crypto(_)
            | Self::Io(_) => ErrorKind::Internal,
        }
    }
}

impl From<StorageError> for CaError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => Self::NotFound(what),
            StorageError::Conflict(what) => Self::Conflict(what),
            StorageError::QuotaExceeded { limit } => {
                Self::NoStorage(format!("{limit} CSRs already pending"))
            }
            other => Self::Storage(other),
        }
    }
}

impl From<rcgen::Error> for CaError {
    fn from(err: rcgen::Error) -> Self {
        Self::Generation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_keep_their_kind() {
        let quota: CaError = StorageError::QuotaExceeded { limit: 5 }.into();
        assert_eq!(quota.kind(), ErrorKind::NoStorage);

        let missing: CaError = StorageError::NotFound("csr 1".into()).into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let consumed: CaError = StorageError::Conflict("csr 1".into()).into();
        assert_eq!(consumed.kind(), ErrorKind::Conflict);

        let broken: CaError = StorageError::QueryFailed("disk full".into()).into();
        assert_eq!(broken.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_not_empty_is_a_conflict() {
        assert_eq!(CaError::NotEmpty.kind(), ErrorKind::Conflict);
    }
}
