//! Key types.
//!
//! Symmetric material implements `Zeroize` and `ZeroizeOnDrop`; asymmetric
//! keys are P-256, the curve every certificate issued by caucase uses.

use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead::KEY_SIZE;
use crate::error::CryptoError;
use crate::random::generate_key;

/// Per-backup data encryption key. Never persisted unwrapped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    /// Generates a new random data key.
    pub fn generate() -> Self {
        Self {
            bytes: *generate_key(),
        }
    }

    /// Creates a data key from unwrapped bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, bytes.len()))
        })?;
        Ok(Self { bytes })
    }

    /// Returns the raw key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A certificate holder's P-256 public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    inner: p256::PublicKey,
}

impl PublicKey {
    /// Parses a DER `SubjectPublicKeyInfo`, as found in certificates and CSRs.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, CryptoError> {
        p256::PublicKey::from_public_key_der(der)
            .map(|inner| Self { inner })
            .map_err(|e| CryptoError::InvalidKey(format!("not a P-256 public key: {e}")))
    }

    /// Parses a SEC1-encoded curve point.
    pub fn from_sec1(bytes: &[u8]) -> Result<Self, CryptoError> {
        p256::PublicKey::from_sec1_bytes(bytes)
            .map(|inner| Self { inner })
            .map_err(|_| CryptoError::InvalidKey("invalid SEC1 point".to_string()))
    }

    /// SEC1 uncompressed point encoding.
    pub fn to_sec1(&self) -> Vec<u8> {
        self.inner.to_sec1_bytes().into_vec()
    }

    /// Hex SHA-256 of the `SubjectPublicKeyInfo` DER; stable across encodings.
    pub fn key_id(&self) -> Result<String, CryptoError> {
        let spki = self
            .inner
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(spki.as_bytes())))
    }

    pub(crate) fn as_p256(&self) -> &p256::PublicKey {
        &self.inner
    }
}

/// A certificate holder's P-256 private key.
#[derive(Clone)]
pub struct PrivateKey {
    inner: p256::SecretKey,
}

impl PrivateKey {
    /// Parses a PKCS#8 PEM private key.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        p256::SecretKey::from_pkcs8_pem(pem)
            .map(|inner| Self { inner })
            .map_err(|e| CryptoError::InvalidKey(format!("not a P-256 PKCS#8 key: {e}")))
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.public_key(),
        }
    }

    pub(crate) fn as_p256(&self) -> &p256::SecretKey {
        &self.inner
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
