//! Detached signatures proving possession of a certificate's private key.
//!
//! Clients sign the exact JSON text of a request payload, followed by the
//! digest name and a single space, with ECDSA P-256. The signature travels
//! base64-encoded (ASN.1 DER) next to the payload.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};

use crate::error::CryptoError;
use crate::keys::{PrivateKey, PublicKey};

/// Digest algorithms accepted for payload signatures.
pub const SUPPORTED_DIGESTS: &[&str] = &["sha256"];

fn signed_bytes(payload: &str, digest: &str) -> Result<Vec<u8>, CryptoError> {
    if !SUPPORTED_DIGESTS.contains(&digest) {
        return Err(CryptoError::InvalidInput(format!(
            "unsupported digest {digest}"
        )));
    }
    Ok(format!("{payload}{digest} ").into_bytes())
}

/// Signs `payload`, returning the base64 DER signature.
pub fn sign_payload(key: &PrivateKey, payload: &str, digest: &str) -> Result<String, CryptoError> {
    let message = signed_bytes(payload, digest)?;
    let signing_key = SigningKey::from(key.as_p256());
    let signature: Signature = signing_key
        .try_sign(&message)
        .map_err(|e| CryptoError::SignatureFailed(e.to_string()))?;
    Ok(BASE64.encode(signature.to_der().as_bytes()))
}

/// Verifies a signature produced by [`sign_payload`].
pub fn verify_payload(
    key: &PublicKey,
    payload: &str,
    digest: &str,
    signature: &str,
) -> Result<(), CryptoError> {
    let message = signed_bytes(payload, digest)?;
    let der = BASE64
        .decode(signature)
        .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
    let signature = Signature::from_der(&der).map_err(|_| CryptoError::VerificationFailed)?;
    VerifyingKey::from(key.as_p256())
        .verify(&message, &signature)
        .map_err(|_| CryptoError::VerificationFailed)
}
