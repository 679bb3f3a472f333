//! Digest-signed request bodies.
//!
//! Renewal and self-revocation prove possession of a certificate's private
//! key by signing the request payload instead of presenting the certificate
//! over TLS:
//!
//! ```json
//! {"payload": "<json text>", "digest": "sha256", "signature": "<base64 DER>"}
//! ```
//!
//! A `null` digest marks an unsigned payload, only accepted from
//! authenticated callers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use caucase_ca::x509;
use caucase_crypto::signature::{sign_payload, verify_payload};
use caucase_crypto::{CryptoError, PrivateKey};

use crate::error::ApiError;

/// Payload of `PUT /a/crt/renew`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewPayload {
    /// Certificate being renewed.
    pub crt_pem: String,
    /// CSR for the same key.
    pub renew_csr_pem: String,
}

/// Signed payload of `PUT /a/crt/revoke`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeCrtPayload {
    /// Certificate to revoke.
    pub revoke_crt_pem: String,
}

/// Unsigned payload of `PUT /a/crt/revoke`, for authenticated callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeSerialPayload {
    /// Serial to revoke.
    pub revoke_serial: u64,
}

/// Request body wrapping a JSON payload and its signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRequest {
    /// JSON text of the payload, signed as-is.
    pub payload: String,
    /// Digest algorithm, `None` for unsigned payloads.
    pub digest: Option<String>,
    /// Base64 DER ECDSA signature.
    pub signature: Option<String>,
}

impl SignedRequest {
    /// Signs `payload` with `key`.
    pub fn sign<T: Serialize>(
        key: &PrivateKey,
        payload: &T,
        digest: &str,
    ) -> Result<Self, CryptoError> {
        let payload =
            serde_json::to_string(payload).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        let signature = sign_payload(key, &payload, digest)?;
        Ok(Self {
            payload,
            digest: Some(digest.to_owned()),
            signature: Some(signature),
        })
    }

    /// Wraps `payload` without signing it.
    pub fn unsigned<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            payload: serde_json::to_string(payload)?,
            digest: None,
            signature: None,
        })
    }

    /// Parses a request body.
    pub fn from_body(body: &[u8]) -> Result<Self, ApiError> {
        serde_json::from_slice(body)
            .map_err(|e| ApiError::BadRequest(format!("malformed signed request: {e}")))
    }

    /// Whether the payload carries a signature.
    pub fn is_signed(&self) -> bool {
        self.digest.is_some()
    }

    /// Decodes the payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.payload)
            .map_err(|e| ApiError::BadRequest(format!("malformed payload: {e}")))
    }

    /// Checks the signature against the public key of `crt_pem`.
    pub fn verify(&self, crt_pem: &str) -> Result<(), ApiError> {
        let (Some(digest), Some(signature)) = (&self.digest, &self.signature) else {
            return Err(ApiError::BadRequest("payload is not signed".into()));
        };
        let public_key = x509::parse_certificate(crt_pem)?.public_key()?;
        verify_payload(&public_key, &self.payload, digest, signature)
            .map_err(|e| ApiError::BadRequest(format!("signature check failed: {e}")))
    }
}
