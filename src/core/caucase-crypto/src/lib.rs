//! # Caucase Crypto
//!
//! Cryptographic building blocks shared by the certificate authorities.
//!
//! This crate provides:
//! - Symmetric encryption (AES-256-GCM)
//! - Key derivation (HKDF-SHA256)
//! - P-256 key handling for certificate holders
//! - Multi-recipient backup envelopes (ECIES key wrap + AES-256-GCM payload)
//! - Detached ECDSA signatures over request payloads
//! - Secure random generation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod random;
pub mod signature;

pub use envelope::{open_envelope, seal_envelope, Recipient};
pub use error::CryptoError;
pub use keys::{DataKey, PrivateKey, PublicKey};
