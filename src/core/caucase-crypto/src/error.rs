//! Cryptographic error types.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed, usually because the key or associated data is wrong.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Signature creation failed.
    #[error("signature creation failed: {0}")]
    SignatureFailed(String),

    /// Signature verification failed.
    #[error("signature verification failed")]
    VerificationFailed,

    /// Invalid key format, curve or size.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Malformed input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The envelope has no recipient entry for the given key.
    #[error("no recipient entry for key {0}")]
    NotARecipient(String),
}
